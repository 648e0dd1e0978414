//! `navigate` operator

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::{ExecutionInput, ExecutionOutput, NodeError, NodeExecutor, NodeType};

fn default_target() -> String {
    "@current".to_string()
}

#[derive(Debug, Deserialize)]
struct Params {
    /// Absolute URL, or `@current` to (re)load the queue row's URL
    #[serde(default = "default_target")]
    url: String,
}

pub struct NavigateExecutor;

#[async_trait]
impl NodeExecutor for NavigateExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Navigate
    }

    fn validate(&self, params: &Value) -> Result<(), NodeError> {
        let params: Params = serde_json::from_value(params.clone())
            .map_err(|e| NodeError::InvalidParams(e.to_string()))?;
        if params.url != "@current" {
            url::Url::parse(&params.url)
                .map_err(|e| NodeError::InvalidParams(format!("url '{}': {e}", params.url)))?;
        }
        Ok(())
    }

    async fn execute(&self, input: &mut ExecutionInput<'_>) -> Result<ExecutionOutput, NodeError> {
        let params: Params = input.parse_params()?;
        let target = if params.url == "@current" {
            input.page_url.to_string()
        } else {
            params.url
        };

        let response = input
            .browser
            .navigate(&target, input.navigation_timeout)
            .await?;

        input.vars.insert("last_status".to_string(), json!(response.status_code));
        input
            .vars
            .insert("last_final_url".to_string(), json!(response.final_url));
        input
            .vars
            .insert("last_timing_ms".to_string(), json!(response.timing_ms));

        if input.error_statuses.contains(&response.status_code) {
            return Err(NodeError::Navigation(format!(
                "{} returned HTTP {}",
                response.final_url, response.status_code
            )));
        }

        debug!(
            "navigate: {} -> {} ({})",
            target, response.final_url, response.status_code
        );
        Ok(ExecutionOutput {
            value: Some(json!({
                "status_code": response.status_code,
                "final_url": response.final_url,
                "timing_ms": response.timing_ms,
            })),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_current_and_absolute() {
        let executor = NavigateExecutor;
        assert!(executor.validate(&json!({})).is_ok());
        assert!(executor.validate(&json!({ "url": "@current" })).is_ok());
        assert!(executor.validate(&json!({ "url": "https://example.com" })).is_ok());
        assert!(executor.validate(&json!({ "url": "not a url" })).is_err());
    }
}
