//! Page interaction operators: `click`, `hover`, `type`, `scroll`

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use super::{ExecutionInput, ExecutionOutput, NodeError, NodeExecutor, NodeType};
use crate::browser::ScrollTarget;

#[derive(Debug, Deserialize)]
struct SelectorParams {
    selector: String,
}

pub struct ClickExecutor;

#[async_trait]
impl NodeExecutor for ClickExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Click
    }

    fn validate(&self, params: &Value) -> Result<(), NodeError> {
        serde_json::from_value::<SelectorParams>(params.clone())
            .map_err(|e| NodeError::InvalidParams(e.to_string()))?;
        Ok(())
    }

    async fn execute(&self, input: &mut ExecutionInput<'_>) -> Result<ExecutionOutput, NodeError> {
        let params: SelectorParams = input.parse_params()?;
        input.browser.click(&params.selector).await?;
        Ok(ExecutionOutput::default())
    }
}

pub struct HoverExecutor;

#[async_trait]
impl NodeExecutor for HoverExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Hover
    }

    fn validate(&self, params: &Value) -> Result<(), NodeError> {
        serde_json::from_value::<SelectorParams>(params.clone())
            .map_err(|e| NodeError::InvalidParams(e.to_string()))?;
        Ok(())
    }

    async fn execute(&self, input: &mut ExecutionInput<'_>) -> Result<ExecutionOutput, NodeError> {
        let params: SelectorParams = input.parse_params()?;
        input.browser.hover(&params.selector).await?;
        Ok(ExecutionOutput::default())
    }
}

#[derive(Debug, Deserialize)]
struct TypeParams {
    selector: String,
    text: String,
    #[serde(default)]
    delay_per_char_ms: u64,
}

pub struct TypeExecutor;

#[async_trait]
impl NodeExecutor for TypeExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Type
    }

    fn validate(&self, params: &Value) -> Result<(), NodeError> {
        serde_json::from_value::<TypeParams>(params.clone())
            .map_err(|e| NodeError::InvalidParams(e.to_string()))?;
        Ok(())
    }

    async fn execute(&self, input: &mut ExecutionInput<'_>) -> Result<ExecutionOutput, NodeError> {
        let params: TypeParams = input.parse_params()?;
        input.cancel.check()?;
        input
            .browser
            .type_text(
                &params.selector,
                &params.text,
                Duration::from_millis(params.delay_per_char_ms),
            )
            .await?;
        Ok(ExecutionOutput::default())
    }
}

fn default_step_ms() -> u64 {
    250
}

/// Either a coordinate pair or the page bottom
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ScrollDestination {
    Named(String),
    Coordinates { x: i64, y: i64 },
}

#[derive(Debug, Deserialize)]
struct ScrollParams {
    to: ScrollDestination,
    #[serde(default = "default_step_ms")]
    step_ms: u64,
}

pub struct ScrollExecutor;

#[async_trait]
impl NodeExecutor for ScrollExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Scroll
    }

    fn validate(&self, params: &Value) -> Result<(), NodeError> {
        let params: ScrollParams = serde_json::from_value(params.clone())
            .map_err(|e| NodeError::InvalidParams(e.to_string()))?;
        if let ScrollDestination::Named(name) = &params.to
            && name != "bottom"
        {
            return Err(NodeError::InvalidParams(format!(
                "scroll target must be coordinates or \"bottom\", got '{name}'"
            )));
        }
        Ok(())
    }

    async fn execute(&self, input: &mut ExecutionInput<'_>) -> Result<ExecutionOutput, NodeError> {
        let params: ScrollParams = input.parse_params()?;
        let target = match params.to {
            ScrollDestination::Named(_) => ScrollTarget::Bottom,
            ScrollDestination::Coordinates { x, y } => ScrollTarget::Position { x, y },
        };
        input.cancel.check()?;
        input
            .browser
            .scroll(target, Duration::from_millis(params.step_ms))
            .await?;
        Ok(ExecutionOutput::default())
    }
}
