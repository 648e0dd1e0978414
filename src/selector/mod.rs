//! CSS field extraction over HTML snapshots
//!
//! This layer is deliberately browser-free: node executors hand it the
//! page HTML and it answers with structured values, which keeps every
//! extraction rule testable against fixture documents.
//!
//! A [`FieldSpec`] names a selector, a value source (text, attribute,
//! inner HTML, href, src), an optional transform pipeline and nested
//! sub-fields. [`ExtractionSpec`] pairs a key selector with a value
//! selector for table-like key/value scraping.

mod transforms;

pub use transforms::{Transform, TransformError, apply_transforms};

use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("invalid CSS selector '{0}'")]
    InvalidSelector(String),

    #[error("required selector '{0}' matched no element")]
    RequiredMissing(String),

    #[error("selector '{0}' matched {1} elements but the field is single-valued")]
    AmbiguousMatch(String, usize),

    #[error("selector '{selector}' matched an element without attribute '{attribute}'")]
    AttributeMissing {
        selector: String,
        attribute: String,
    },

    #[error(transparent)]
    Transform(#[from] TransformError),
}

/// Where a field's raw value comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSource {
    #[default]
    Text,
    Attr,
    Html,
    Href,
    Src,
}

/// One field to pull out of a document or element scope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub selector: String,
    #[serde(rename = "type", default)]
    pub source: FieldSource,
    #[serde(default)]
    pub attribute: Option<String>,
    #[serde(default)]
    pub multiple: bool,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub transform: Vec<Transform>,
    /// Nested record extraction: each matched element becomes an object
    /// built from these sub-fields, scoped to that element.
    #[serde(default)]
    pub fields: Option<BTreeMap<String, FieldSpec>>,
}

/// Output shape for key/value pair extraction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairOutputFormat {
    #[default]
    ArrayOfObjects,
    Object,
    ArrayOfArrays,
}

/// Paired key/value extraction, e.g. spec tables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionSpec {
    pub key_selector: String,
    pub value_selector: String,
    #[serde(default)]
    pub output_format: PairOutputFormat,
}

fn parse_selector(selector: &str) -> Result<Selector, SelectorError> {
    Selector::parse(selector).map_err(|_| SelectorError::InvalidSelector(selector.to_string()))
}

fn raw_value(
    element: ElementRef<'_>,
    spec: &FieldSpec,
    base_url: Option<&Url>,
) -> Result<Option<String>, SelectorError> {
    let value = match spec.source {
        FieldSource::Text => {
            let text: String = element.text().collect::<Vec<_>>().join(" ");
            let trimmed = text.split_whitespace().collect::<Vec<_>>().join(" ");
            if trimmed.is_empty() { None } else { Some(trimmed) }
        }
        FieldSource::Html => Some(element.inner_html()),
        FieldSource::Attr => {
            let attribute = spec.attribute.as_deref().unwrap_or("value");
            match element.value().attr(attribute) {
                Some(v) => Some(v.to_string()),
                None => {
                    if spec.required {
                        return Err(SelectorError::AttributeMissing {
                            selector: spec.selector.clone(),
                            attribute: attribute.to_string(),
                        });
                    }
                    None
                }
            }
        }
        FieldSource::Href => element
            .value()
            .attr("href")
            .map(|href| resolve_url(href, base_url)),
        FieldSource::Src => element
            .value()
            .attr("src")
            .map(|src| resolve_url(src, base_url)),
    };
    Ok(value)
}

fn resolve_url(candidate: &str, base_url: Option<&Url>) -> String {
    match base_url {
        Some(base) => base
            .join(candidate)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| candidate.to_string()),
        None => candidate.to_string(),
    }
}

fn extract_field_scoped(
    scope: ElementRef<'_>,
    spec: &FieldSpec,
    base_url: Option<&Url>,
) -> Result<Value, SelectorError> {
    let selector = parse_selector(&spec.selector)?;
    let matches: Vec<ElementRef<'_>> = scope.select(&selector).collect();

    extract_from_matches(&matches, spec, base_url)
}

fn extract_from_matches(
    matches: &[ElementRef<'_>],
    spec: &FieldSpec,
    base_url: Option<&Url>,
) -> Result<Value, SelectorError> {
    if matches.is_empty() {
        if spec.required {
            return Err(SelectorError::RequiredMissing(spec.selector.clone()));
        }
        return Ok(spec.default.clone().unwrap_or(Value::Null));
    }

    // Nested record mode: each match becomes an object
    if let Some(sub_fields) = &spec.fields {
        let limit = spec.limit.unwrap_or(usize::MAX);
        let mut records = Vec::new();
        for element in matches.iter().take(limit) {
            let mut record = Map::new();
            for (name, sub_spec) in sub_fields {
                record.insert(
                    name.clone(),
                    extract_field_scoped(*element, sub_spec, base_url)?,
                );
            }
            records.push(Value::Object(record));
        }
        return Ok(if spec.multiple {
            Value::Array(records)
        } else {
            records.into_iter().next().unwrap_or(Value::Null)
        });
    }

    if spec.multiple {
        let limit = spec.limit.unwrap_or(usize::MAX);
        let mut values = Vec::new();
        for element in matches.iter().take(limit) {
            if let Some(raw) = raw_value(*element, spec, base_url)? {
                values.push(apply_transforms(json!(raw), &spec.transform)?);
            }
        }
        return Ok(Value::Array(values));
    }

    if matches.len() > 1 {
        return Err(SelectorError::AmbiguousMatch(
            spec.selector.clone(),
            matches.len(),
        ));
    }

    match raw_value(matches[0], spec, base_url)? {
        Some(raw) => Ok(apply_transforms(json!(raw), &spec.transform)?),
        None if spec.required => Err(SelectorError::RequiredMissing(spec.selector.clone())),
        None => Ok(spec.default.clone().unwrap_or(Value::Null)),
    }
}

/// Extract a set of named fields from a full document
pub fn extract_fields(
    html: &Html,
    fields: &BTreeMap<String, FieldSpec>,
    base_url: Option<&Url>,
) -> Result<Map<String, Value>, SelectorError> {
    let root = html.root_element();
    let mut out = Map::new();
    for (name, spec) in fields {
        out.insert(name.clone(), extract_field_scoped(root, spec, base_url)?);
    }
    Ok(out)
}

/// Extract fields scoped to one element (used for per-record extraction)
pub fn extract_fields_scoped(
    scope: ElementRef<'_>,
    fields: &BTreeMap<String, FieldSpec>,
    base_url: Option<&Url>,
) -> Result<Map<String, Value>, SelectorError> {
    let mut out = Map::new();
    for (name, spec) in fields {
        out.insert(name.clone(), extract_field_scoped(scope, spec, base_url)?);
    }
    Ok(out)
}

/// Extract key/value pairs by walking two selectors in parallel.
///
/// Extra keys without a matching value (or vice versa) are dropped; the
/// zip length is the shorter of the two match lists.
pub fn extract_pairs(html: &Html, spec: &ExtractionSpec) -> Result<Value, SelectorError> {
    let key_selector = parse_selector(&spec.key_selector)?;
    let value_selector = parse_selector(&spec.value_selector)?;

    let keys: Vec<String> = html
        .select(&key_selector)
        .map(|e| e.text().collect::<String>().trim().to_string())
        .collect();
    let values: Vec<String> = html
        .select(&value_selector)
        .map(|e| e.text().collect::<String>().trim().to_string())
        .collect();

    let pairs: Vec<(String, String)> = keys.into_iter().zip(values).collect();

    Ok(match spec.output_format {
        PairOutputFormat::ArrayOfObjects => Value::Array(
            pairs
                .into_iter()
                .map(|(k, v)| json!({ "key": k, "value": v }))
                .collect(),
        ),
        PairOutputFormat::Object => {
            let mut map = Map::new();
            for (k, v) in pairs {
                map.insert(k, json!(v));
            }
            Value::Object(map)
        }
        PairOutputFormat::ArrayOfArrays => Value::Array(
            pairs
                .into_iter()
                .map(|(k, v)| json!([k, v]))
                .collect(),
        ),
    })
}
