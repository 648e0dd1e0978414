//! `extract` operator
//!
//! Applies a field map (and optional key/value pair extractions) to the
//! current DOM and emits one item draft. With `selector` + `multiple`,
//! each matching element is extracted as a record and the records ride
//! in the item's `records` attribute, keeping the emitted item unique
//! per `(execution, url, schema)`.

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::{ExecutionInput, ExecutionOutput, ItemDraft, NodeError, NodeExecutor, NodeType};
use crate::selector::{
    ExtractionSpec, FieldSpec, SelectorError, extract_fields, extract_fields_scoped, extract_pairs,
};

fn default_item_type() -> String {
    "generic".to_string()
}

#[derive(Debug, Deserialize)]
struct Params {
    #[serde(default)]
    fields: BTreeMap<String, FieldSpec>,
    /// Scope for per-record extraction; with `multiple`, every match
    /// yields one record
    #[serde(default)]
    selector: Option<String>,
    #[serde(default)]
    multiple: bool,
    #[serde(default)]
    limit: Option<usize>,
    /// Key/value pair extractions merged under their output key
    #[serde(default)]
    extractions: BTreeMap<String, ExtractionSpec>,
    #[serde(default = "default_item_type")]
    item_type: String,
    #[serde(default)]
    schema_name: Option<String>,
}

pub struct ExtractExecutor;

#[async_trait]
impl NodeExecutor for ExtractExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Extract
    }

    fn validate(&self, params: &Value) -> Result<(), NodeError> {
        let params: Params = serde_json::from_value(params.clone())
            .map_err(|e| NodeError::InvalidParams(e.to_string()))?;
        if params.fields.is_empty() && params.extractions.is_empty() {
            return Err(NodeError::InvalidParams(
                "extract needs fields and/or extractions".to_string(),
            ));
        }
        if let Some(selector) = &params.selector {
            Selector::parse(selector).map_err(|_| {
                NodeError::InvalidParams(format!("invalid selector '{selector}'"))
            })?;
        }
        for spec in params.fields.values() {
            Selector::parse(&spec.selector).map_err(|_| {
                NodeError::InvalidParams(format!("invalid selector '{}'", spec.selector))
            })?;
        }
        Ok(())
    }

    async fn execute(&self, input: &mut ExecutionInput<'_>) -> Result<ExecutionOutput, NodeError> {
        let params: Params = input.parse_params()?;
        input.cancel.check()?;

        let base = input.effective_base().await;
        let html = Html::parse_document(&input.browser.html().await?);

        let mut attributes = Map::new();

        if !params.fields.is_empty() {
            match &params.selector {
                Some(scope_selector) if params.multiple => {
                    let scope = Selector::parse(scope_selector).map_err(|_| {
                        NodeError::Selector(SelectorError::InvalidSelector(scope_selector.clone()))
                    })?;
                    let limit = params.limit.unwrap_or(usize::MAX);
                    let mut records = Vec::new();
                    for element in html.select(&scope).take(limit) {
                        let record =
                            extract_fields_scoped(element, &params.fields, Some(&base))?;
                        records.push(Value::Object(record));
                    }
                    attributes.insert("records".to_string(), Value::Array(records));
                }
                _ => {
                    let fields = extract_fields(&html, &params.fields, Some(&base))?;
                    attributes.extend(fields);
                }
            }
        }

        for (key, spec) in &params.extractions {
            attributes.insert(key.clone(), extract_pairs(&html, spec)?);
        }

        let value = Value::Object(attributes.clone());
        let item = ItemDraft {
            item_type: params.item_type,
            schema_name: params.schema_name,
            attributes,
        };

        Ok(ExecutionOutput {
            items: vec![item],
            value: Some(value),
            ..Default::default()
        })
    }
}
