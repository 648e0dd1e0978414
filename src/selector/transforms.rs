//! Value transform pipeline
//!
//! Transforms run left to right over the raw extracted value. String
//! transforms pass arrays through element-wise, so `multiple` fields can
//! share a pipeline with single values.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("cannot parse '{0}' as an integer")]
    ParseInt(String),

    #[error("cannot parse '{0}' as a float")]
    ParseFloat(String),

    #[error("invalid regex '{pattern}': {reason}")]
    InvalidRegex { pattern: String, reason: String },

    #[error("cannot parse '{value}' with date format '{format}'")]
    ParseDate { value: String, format: String },

    #[error("transform '{transform}' cannot apply to {kind} value")]
    TypeMismatch {
        transform: &'static str,
        kind: &'static str,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Transform {
    Trim,
    Lowercase,
    Uppercase,
    RegexReplace { pattern: String, replacement: String },
    Replace { from: String, to: String },
    Split { separator: String, index: Option<usize> },
    Join { separator: String },
    ParseInt,
    ParseFloat,
    Slugify,
    DecodeHtml,
    StripHtml,
    FormatDate { input_format: String, output_format: String },
}

static TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<[^>]*>").expect("static tag-stripping pattern compiles")
});

static NUMERIC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"-?\d+(?:[.,]\d+)?").expect("static numeric pattern compiles")
});

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut last_was_dash = true;
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_was_dash = false;
        } else if !last_was_dash {
            slug.push('-');
            last_was_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

fn parse_int(raw: &str) -> Result<i64, TransformError> {
    let cleaned = NUMERIC_RE
        .find(&raw.replace(',', ""))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| TransformError::ParseInt(raw.to_string()))?;
    cleaned
        .split('.')
        .next()
        .unwrap_or(&cleaned)
        .parse::<i64>()
        .map_err(|_| TransformError::ParseInt(raw.to_string()))
}

fn parse_float(raw: &str) -> Result<f64, TransformError> {
    let cleaned = NUMERIC_RE
        .find(&raw.replace(',', ""))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| TransformError::ParseFloat(raw.to_string()))?;
    cleaned
        .parse::<f64>()
        .map_err(|_| TransformError::ParseFloat(raw.to_string()))
}

fn format_date(raw: &str, input_format: &str, output_format: &str) -> Result<String, TransformError> {
    use chrono::{NaiveDate, NaiveDateTime};

    if let Ok(dt) = NaiveDateTime::parse_from_str(raw.trim(), input_format) {
        return Ok(dt.format(output_format).to_string());
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw.trim(), input_format) {
        return Ok(date.format(output_format).to_string());
    }
    Err(TransformError::ParseDate {
        value: raw.to_string(),
        format: input_format.to_string(),
    })
}

fn apply_one(value: Value, transform: &Transform) -> Result<Value, TransformError> {
    // String transforms map over arrays element-wise
    if let Value::Array(items) = value {
        if matches!(transform, Transform::Join { .. }) {
            let Transform::Join { separator } = transform else {
                unreachable!()
            };
            let joined = items
                .iter()
                .map(as_string)
                .collect::<Vec<_>>()
                .join(separator);
            return Ok(json!(joined));
        }
        let mapped: Result<Vec<Value>, TransformError> = items
            .into_iter()
            .map(|item| apply_one(item, transform))
            .collect();
        return Ok(Value::Array(mapped?));
    }

    Ok(match transform {
        Transform::Trim => json!(as_string(&value).trim()),
        Transform::Lowercase => json!(as_string(&value).to_lowercase()),
        Transform::Uppercase => json!(as_string(&value).to_uppercase()),
        Transform::RegexReplace { pattern, replacement } => {
            let re = Regex::new(pattern).map_err(|e| TransformError::InvalidRegex {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
            json!(re.replace_all(&as_string(&value), replacement.as_str()).into_owned())
        }
        Transform::Replace { from, to } => json!(as_string(&value).replace(from, to)),
        Transform::Split { separator, index } => {
            let raw = as_string(&value);
            let parts: Vec<&str> = raw.split(separator.as_str()).collect();
            match index {
                Some(i) => json!(parts.get(*i).copied().unwrap_or_default()),
                None => json!(parts),
            }
        }
        Transform::Join { separator: _ } => {
            return Err(TransformError::TypeMismatch {
                transform: "join",
                kind: value_kind(&value),
            });
        }
        Transform::ParseInt => json!(parse_int(&as_string(&value))?),
        Transform::ParseFloat => json!(parse_float(&as_string(&value))?),
        Transform::Slugify => json!(slugify(&as_string(&value))),
        Transform::DecodeHtml => json!(html_escape::decode_html_entities(&as_string(&value)).into_owned()),
        Transform::StripHtml => {
            let as_str = as_string(&value);
            let stripped = TAG_RE.replace_all(&as_str, " ");
            json!(stripped.split_whitespace().collect::<Vec<_>>().join(" "))
        }
        Transform::FormatDate { input_format, output_format } => {
            json!(format_date(&as_string(&value), input_format, output_format)?)
        }
    })
}

/// Run a transform pipeline left to right
pub fn apply_transforms(value: Value, transforms: &[Transform]) -> Result<Value, TransformError> {
    let mut current = value;
    for transform in transforms {
        current = apply_one(current, transform)?;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(json: serde_json::Value) -> Vec<Transform> {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn trim_and_case() {
        let t = pipeline(json!([{ "op": "trim" }, { "op": "uppercase" }]));
        assert_eq!(apply_transforms(json!("  kettle "), &t).unwrap(), json!("KETTLE"));
    }

    #[test]
    fn parse_float_strips_currency() {
        let t = pipeline(json!([{ "op": "parse_float" }]));
        assert_eq!(apply_transforms(json!("$1,249.99"), &t).unwrap(), json!(1249.99));
    }

    #[test]
    fn parse_int_rejects_garbage() {
        let t = pipeline(json!([{ "op": "parse_int" }]));
        assert!(apply_transforms(json!("no digits here"), &t).is_err());
    }

    #[test]
    fn regex_replace() {
        let t = pipeline(json!([
            { "op": "regex_replace", "pattern": "\\s+", "replacement": " " }
        ]));
        assert_eq!(apply_transforms(json!("a   b\t c"), &t).unwrap(), json!("a b c"));
    }

    #[test]
    fn split_with_index_and_join() {
        let split = pipeline(json!([{ "op": "split", "separator": "|", "index": 1 }]));
        assert_eq!(apply_transforms(json!("a|b|c"), &split).unwrap(), json!("b"));

        let join = pipeline(json!([
            { "op": "split", "separator": "," },
            { "op": "trim" },
            { "op": "join", "separator": "/" }
        ]));
        assert_eq!(apply_transforms(json!("x, y ,z"), &join).unwrap(), json!("x/y/z"));
    }

    #[test]
    fn slugify_collapses_punctuation() {
        let t = pipeline(json!([{ "op": "slugify" }]));
        assert_eq!(
            apply_transforms(json!("  Steel Kettle, 1.7L! "), &t).unwrap(),
            json!("steel-kettle-1-7l")
        );
    }

    #[test]
    fn strip_and_decode_html() {
        let t = pipeline(json!([{ "op": "strip_html" }, { "op": "decode_html" }]));
        assert_eq!(
            apply_transforms(json!("<b>Tom &amp; Jerry</b>"), &t).unwrap(),
            json!("Tom & Jerry")
        );
    }

    #[test]
    fn format_date_roundtrip() {
        let t = pipeline(json!([
            { "op": "format_date", "input_format": "%d/%m/%Y", "output_format": "%Y-%m-%d" }
        ]));
        assert_eq!(apply_transforms(json!("31/01/2025"), &t).unwrap(), json!("2025-01-31"));
        assert!(apply_transforms(json!("yesterday"), &t).is_err());
    }

    #[test]
    fn string_transforms_map_over_arrays() {
        let t = pipeline(json!([{ "op": "lowercase" }]));
        assert_eq!(
            apply_transforms(json!(["A", "B"]), &t).unwrap(),
            json!(["a", "b"])
        );
    }
}
