//! `wait` operator: fixed delay or selector state

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use super::{ExecutionInput, ExecutionOutput, NodeError, NodeExecutor, NodeType};
use crate::browser::WaitState;

fn default_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
enum TargetState {
    #[default]
    Visible,
    Hidden,
    Attached,
}

impl From<TargetState> for WaitState {
    fn from(state: TargetState) -> Self {
        match state {
            TargetState::Visible => Self::Visible,
            TargetState::Hidden => Self::Hidden,
            TargetState::Attached => Self::Attached,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Params {
    #[serde(default)]
    duration_ms: Option<u64>,
    #[serde(default)]
    selector: Option<String>,
    #[serde(default)]
    state: TargetState,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
}

pub struct WaitExecutor;

#[async_trait]
impl NodeExecutor for WaitExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Wait
    }

    fn validate(&self, params: &Value) -> Result<(), NodeError> {
        let params: Params = serde_json::from_value(params.clone())
            .map_err(|e| NodeError::InvalidParams(e.to_string()))?;
        if params.duration_ms.is_none() && params.selector.is_none() {
            return Err(NodeError::InvalidParams(
                "wait needs either duration_ms or selector".to_string(),
            ));
        }
        Ok(())
    }

    async fn execute(&self, input: &mut ExecutionInput<'_>) -> Result<ExecutionOutput, NodeError> {
        let params: Params = input.parse_params()?;

        if let Some(selector) = &params.selector {
            let timeout = Duration::from_millis(params.timeout_ms);
            tokio::select! {
                result = input.browser.wait_for_selector(selector, params.state.into(), timeout) => {
                    result?;
                }
                () = input.cancel.canceled() => return Err(NodeError::Canceled),
            }
        } else if let Some(ms) = params.duration_ms {
            input.cancel.sleep(Duration::from_millis(ms)).await?;
        }

        Ok(ExecutionOutput::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_needs_a_target() {
        let executor = WaitExecutor;
        assert!(executor.validate(&json!({})).is_err());
        assert!(executor.validate(&json!({ "duration_ms": 500 })).is_ok());
        assert!(executor
            .validate(&json!({ "selector": ".spinner", "state": "hidden" }))
            .is_ok());
        assert!(executor.validate(&json!({ "selector": ".x", "state": "glowing" })).is_err());
    }
}
