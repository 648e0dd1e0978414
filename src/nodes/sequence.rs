//! `sequence` operator: ordered sub-steps with per-step optionality

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{ExecutionInput, ExecutionOutput, NodeError, NodeExecutor, NodeType};

/// One inline step of a `sequence` or `conditional` branch
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct StepSpec {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub optional: bool,
}

impl StepSpec {
    fn label(&self, index: usize) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("{}#{}", self.node_type.as_str(), index))
    }
}

/// Validate a list of inline steps against the registry
pub(crate) fn validate_steps(
    registry: &super::NodeRegistry,
    steps: &[StepSpec],
) -> Result<(), NodeError> {
    for (index, step) in steps.iter().enumerate() {
        registry.validate(step.node_type, &step.params).map_err(|e| {
            NodeError::InvalidParams(format!("step {}: {e}", step.label(index)))
        })?;
    }
    Ok(())
}

/// Run inline steps in order; optional step failures are logged and
/// swallowed, everything else aborts the run.
pub(crate) async fn run_steps(
    steps: &[StepSpec],
    input: &mut ExecutionInput<'_>,
) -> Result<ExecutionOutput, NodeError> {
    let mut combined = ExecutionOutput::default();
    for (index, step) in steps.iter().enumerate() {
        input.cancel.check()?;
        let label = step.label(index);
        let registry = input.registry;
        match registry
            .execute_step(step.node_type, step.params.clone(), input)
            .await
        {
            Ok(output) => {
                debug!("step {label} completed");
                combined.merge(output);
            }
            Err(NodeError::Canceled) => return Err(NodeError::Canceled),
            Err(e) if step.optional => {
                warn!("optional step {label} failed: {e}");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(combined)
}

#[derive(Debug, Deserialize)]
struct Params {
    steps: Vec<StepSpec>,
}

pub struct SequenceExecutor;

#[async_trait]
impl NodeExecutor for SequenceExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Sequence
    }

    fn validate(&self, params: &Value) -> Result<(), NodeError> {
        let params: Params = serde_json::from_value(params.clone())
            .map_err(|e| NodeError::InvalidParams(e.to_string()))?;
        if params.steps.is_empty() {
            return Err(NodeError::InvalidParams("sequence has no steps".to_string()));
        }
        // Step params are validated against the registry at accept time
        // via the standard registry; nested unknown types still fail
        // here because StepSpec's `type` is the closed enum.
        Ok(())
    }

    async fn execute(&self, input: &mut ExecutionInput<'_>) -> Result<ExecutionOutput, NodeError> {
        let params: Params = input.parse_params()?;
        validate_steps(input.registry, &params.steps)?;
        run_steps(&params.steps, input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_rejects_empty_and_unknown_steps() {
        let executor = SequenceExecutor;
        assert!(executor.validate(&json!({ "steps": [] })).is_err());
        assert!(executor
            .validate(&json!({
                "steps": [
                    { "type": "wait", "params": { "duration_ms": 100 } },
                    { "type": "click", "params": { "selector": "a.more" }, "optional": true }
                ]
            }))
            .is_ok());
        // Unknown type fails enum parsing
        assert!(executor
            .validate(&json!({ "steps": [{ "type": "teleport", "params": {} }] }))
            .is_err());
    }

    #[test]
    fn step_labels_prefer_ids() {
        let step: StepSpec = serde_json::from_value(json!({
            "id": "cookie-banner",
            "type": "click",
            "params": { "selector": "#accept" }
        }))
        .unwrap();
        assert_eq!(step.label(3), "cookie-banner");

        let anonymous: StepSpec =
            serde_json::from_value(json!({ "type": "wait", "params": { "duration_ms": 1 } }))
                .unwrap();
        assert_eq!(anonymous.label(3), "wait#3");
    }
}
