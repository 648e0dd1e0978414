//! `conditional` operator and shared condition evaluation

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use super::sequence::{StepSpec, run_steps, validate_steps};
use super::{ExecutionInput, ExecutionOutput, NodeError, NodeExecutor, NodeType};
use crate::browser::BrowserContext;
use crate::workflow::Condition;

/// Evaluate a condition against the live page and phase variables.
///
/// Also used by the executor for phase transition conditions.
pub async fn evaluate_condition(
    condition: &Condition,
    browser: &BrowserContext,
    vars: &HashMap<String, Value>,
) -> Result<bool, NodeError> {
    match condition {
        Condition::ElementExists { selector } => {
            Ok(browser.element_exists(selector).await?)
        }
        Condition::VarEquals { name, value } => {
            Ok(vars.get(name).is_some_and(|v| v == value))
        }
        Condition::ResponseStatusIn { statuses } => {
            let status = browser
                .last_http_status()
                .or_else(|| {
                    vars.get("last_status")
                        .and_then(Value::as_u64)
                        .map(|s| s as u16)
                });
            Ok(status.is_some_and(|s| statuses.contains(&s)))
        }
    }
}

#[derive(Debug, Deserialize)]
struct Params {
    condition: Condition,
    #[serde(default)]
    if_true: Vec<StepSpec>,
    #[serde(default)]
    if_false: Vec<StepSpec>,
}

pub struct ConditionalExecutor;

#[async_trait]
impl NodeExecutor for ConditionalExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Conditional
    }

    fn validate(&self, params: &Value) -> Result<(), NodeError> {
        let params: Params = serde_json::from_value(params.clone())
            .map_err(|e| NodeError::InvalidParams(e.to_string()))?;
        if params.if_true.is_empty() && params.if_false.is_empty() {
            return Err(NodeError::InvalidParams(
                "conditional has no branches".to_string(),
            ));
        }
        Ok(())
    }

    async fn execute(&self, input: &mut ExecutionInput<'_>) -> Result<ExecutionOutput, NodeError> {
        let params: Params = input.parse_params()?;

        let outcome = evaluate_condition(&params.condition, input.browser, input.vars).await?;
        debug!("conditional evaluated to {outcome}");

        let branch = if outcome { &params.if_true } else { &params.if_false };
        if branch.is_empty() {
            return Ok(ExecutionOutput::default());
        }
        validate_steps(input.registry, branch)?;
        run_steps(branch, input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_needs_a_branch() {
        let executor = ConditionalExecutor;
        assert!(executor
            .validate(&json!({
                "condition": { "kind": "element_exists", "selector": ".captcha" }
            }))
            .is_err());
        assert!(executor
            .validate(&json!({
                "condition": { "kind": "var_equals", "name": "last_status", "value": 200 },
                "if_true": [{ "type": "wait", "params": { "duration_ms": 10 } }]
            }))
            .is_ok());
        assert!(executor
            .validate(&json!({
                "condition": { "kind": "response_status_in", "statuses": [429, 503] },
                "if_false": [{ "type": "click", "params": { "selector": "a" } }]
            }))
            .is_ok());
    }

    #[test]
    fn condition_parses_all_kinds() {
        for raw in [
            json!({ "kind": "element_exists", "selector": "#x" }),
            json!({ "kind": "var_equals", "name": "n", "value": "v" }),
            json!({ "kind": "response_status_in", "statuses": [404] }),
        ] {
            assert!(serde_json::from_value::<Condition>(raw).is_ok());
        }
    }
}
