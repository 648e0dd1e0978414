//! `extract_json` operator: embedded JSON and JSON-LD blocks

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{ExecutionInput, ExecutionOutput, ItemDraft, NodeError, NodeExecutor, NodeType};

fn default_selector() -> String {
    r#"script[type="application/ld+json"]"#.to_string()
}

#[derive(Debug, Deserialize)]
struct Params {
    #[serde(default = "default_selector")]
    selector: String,
    /// When set, the parsed object is also emitted as an item under
    /// this schema
    #[serde(default)]
    schema_name: Option<String>,
    #[serde(default)]
    item_type: Option<String>,
}

pub struct ExtractJsonExecutor;

fn parse_blocks(html: &Html, selector: &Selector) -> Vec<Value> {
    html.select(selector)
        .filter_map(|element| {
            let raw: String = element.text().collect();
            serde_json::from_str::<Value>(raw.trim()).ok()
        })
        .collect()
}

#[async_trait]
impl NodeExecutor for ExtractJsonExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::ExtractJson
    }

    fn validate(&self, params: &Value) -> Result<(), NodeError> {
        let params: Params = serde_json::from_value(params.clone())
            .map_err(|e| NodeError::InvalidParams(e.to_string()))?;
        Selector::parse(&params.selector).map_err(|_| {
            NodeError::InvalidParams(format!("invalid selector '{}'", params.selector))
        })?;
        Ok(())
    }

    async fn execute(&self, input: &mut ExecutionInput<'_>) -> Result<ExecutionOutput, NodeError> {
        let params: Params = input.parse_params()?;
        input.cancel.check()?;

        let selector = Selector::parse(&params.selector)
            .map_err(|_| NodeError::InvalidParams(format!("invalid selector '{}'", params.selector)))?;
        let html = Html::parse_document(&input.browser.html().await?);
        let blocks = parse_blocks(&html, &selector);

        if blocks.is_empty() {
            return Err(NodeError::Extraction(format!(
                "no parseable JSON behind selector '{}'",
                params.selector
            )));
        }

        let value = if blocks.len() == 1 {
            blocks.into_iter().next().unwrap_or(Value::Null)
        } else {
            Value::Array(blocks)
        };

        let items = match params.schema_name {
            Some(schema_name) => {
                let attributes: Map<String, Value> = match &value {
                    Value::Object(map) => map.clone(),
                    other => {
                        let mut map = Map::new();
                        map.insert("data".to_string(), other.clone());
                        map
                    }
                };
                vec![ItemDraft {
                    item_type: params.item_type.unwrap_or_else(|| "json".to_string()),
                    schema_name: Some(schema_name),
                    attributes,
                }]
            }
            None => Vec::new(),
        };

        Ok(ExecutionOutput { items, value: Some(value), ..Default::default() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_blocks_skips_invalid_json() {
        let html = Html::parse_document(
            r#"
            <html><head>
                <script type="application/ld+json">{"@type": "Product", "name": "Kettle"}</script>
                <script type="application/ld+json">not json at all</script>
            </head></html>
            "#,
        );
        let selector = Selector::parse(r#"script[type="application/ld+json"]"#).unwrap();
        let blocks = parse_blocks(&html, &selector);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0]["name"], json!("Kettle"));
    }

    #[test]
    fn validate_checks_selector() {
        let executor = ExtractJsonExecutor;
        assert!(executor.validate(&json!({})).is_ok());
        assert!(executor.validate(&json!({ "selector": "script#state" })).is_ok());
        assert!(executor.validate(&json!({ "selector": ":::" })).is_err());
    }
}
