//! Typed node operators and their registry
//!
//! Every operator implements [`NodeExecutor`]: it names its type,
//! validates params at workflow-accept time and executes against an
//! [`ExecutionInput`]. The registry is the single dispatch point; an
//! unknown node type is rejected before an execution ever starts.
//!
//! Executors are synchronous from the workflow executor's point of view:
//! `execute` returns once the node's work (including any page awaits) is
//! complete, and every internal suspension point observes the
//! cancellation token.

mod conditional;
mod extract;
mod extract_json;
mod extract_links;
mod interact;
mod navigate;
mod paginate;
mod sequence;
mod wait;

pub use conditional::evaluate_condition;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use url::Url;

use crate::browser::{BrowserContext, BrowserError};
use crate::selector::SelectorError;

/// Closed set of operator types. Adding an operator means adding a
/// variant here and a factory entry in [`NodeRegistry::standard`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Navigate,
    Wait,
    Click,
    Hover,
    Type,
    Scroll,
    ExtractLinks,
    Paginate,
    Extract,
    ExtractJson,
    Sequence,
    Conditional,
}

impl NodeType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Navigate => "navigate",
            Self::Wait => "wait",
            Self::Click => "click",
            Self::Hover => "hover",
            Self::Type => "type",
            Self::Scroll => "scroll",
            Self::ExtractLinks => "extract_links",
            Self::Paginate => "paginate",
            Self::Extract => "extract",
            Self::ExtractJson => "extract_json",
            Self::Sequence => "sequence",
            Self::Conditional => "conditional",
        }
    }
}

/// Node failure taxonomy surfaced to retry policy and recovery
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("navigation error: {0}")]
    Navigation(String),

    #[error(transparent)]
    Selector(#[from] SelectorError),

    #[error("extraction error: {0}")]
    Extraction(String),

    #[error("node timed out after {0:?}")]
    Timeout(Duration),

    #[error("browser error: {0}")]
    Browser(String),

    #[error("canceled")]
    Canceled,

    #[error("unknown node type '{0}'")]
    UnknownType(String),
}

impl NodeError {
    /// Coarse label used by recovery rule conditions
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidParams(_) => "validation",
            Self::Navigation(_) => "navigation",
            Self::Selector(_) => "selector",
            Self::Extraction(_) => "extraction",
            Self::Timeout(_) => "timeout",
            Self::Browser(_) => "browser",
            Self::Canceled => "canceled",
            Self::UnknownType(_) => "validation",
        }
    }
}

impl From<BrowserError> for NodeError {
    fn from(e: BrowserError) -> Self {
        match e {
            BrowserError::Navigation(message) => Self::Navigation(message),
            BrowserError::Timeout { seconds, .. } => Self::Timeout(Duration::from_secs(seconds)),
            BrowserError::SelectorNotFound(selector) => {
                Self::Selector(SelectorError::RequiredMissing(selector))
            }
            BrowserError::Engine(message) => Self::Browser(message),
        }
    }
}

/// Cooperative cancellation handle propagated into every node
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token plus the sender that trips it
    #[must_use]
    pub fn pair() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation is requested
    pub async fn canceled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep observing cancellation
    pub async fn sleep(&self, duration: Duration) -> Result<(), NodeError> {
        tokio::select! {
            () = tokio::time::sleep(duration) => Ok(()),
            () = self.canceled() => Err(NodeError::Canceled),
        }
    }

    /// Bail out early if already canceled
    pub fn check(&self) -> Result<(), NodeError> {
        if self.is_canceled() {
            Err(NodeError::Canceled)
        } else {
            Ok(())
        }
    }
}

/// A URL surfaced by a discovery node; the executor enqueues it with
/// `parent_url_id` and `discovered_by_node` filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredUrl {
    pub url: String,
    pub url_type: String,
}

/// An item surfaced by an extraction node, before storage assigns ids
#[derive(Debug, Clone)]
pub struct ItemDraft {
    pub item_type: String,
    pub schema_name: Option<String>,
    pub attributes: Map<String, Value>,
}

/// Everything a node needs to run against one URL
pub struct ExecutionInput<'a> {
    pub browser: &'a BrowserContext,
    pub registry: &'a NodeRegistry,
    /// Current node's params; swapped by the registry when dispatching
    /// nested steps
    pub params: Value,
    /// Shared mutable variables for the phase
    /// (`last_status`, `last_final_url`, user `output_key`s)
    pub vars: &'a mut HashMap<String, Value>,
    pub execution_id: &'a str,
    pub url_id: &'a str,
    /// The URL this phase is processing; `@current` navigations resolve
    /// against the browser's live URL, not this
    pub page_url: Url,
    /// Effective navigation timeout (base scaled by the recovery multiplier)
    pub navigation_timeout: Duration,
    /// Final HTTP statuses treated as navigation errors
    pub error_statuses: std::ops::RangeInclusive<u16>,
    pub cancel: CancelToken,
}

impl ExecutionInput<'_> {
    pub(crate) fn parse_params<T: serde::de::DeserializeOwned>(&self) -> Result<T, NodeError> {
        serde_json::from_value(self.params.clone())
            .map_err(|e| NodeError::InvalidParams(e.to_string()))
    }

    /// Base URL links resolve against: the page the browser actually
    /// landed on, falling back to the queue row's URL.
    pub(crate) async fn effective_base(&self) -> Url {
        match self.browser.last_response() {
            Some(response) => Url::parse(&response.final_url).unwrap_or_else(|_| self.page_url.clone()),
            None => self.page_url.clone(),
        }
    }
}

/// What a node produced
#[derive(Debug, Default)]
pub struct ExecutionOutput {
    pub discovered: Vec<DiscoveredUrl>,
    pub items: Vec<ItemDraft>,
    /// Loop count for iterating nodes (`paginate`)
    pub iterations: u32,
    /// Value stored under the node's `output_key`
    pub value: Option<Value>,
}

impl ExecutionOutput {
    pub fn merge(&mut self, other: ExecutionOutput) {
        self.discovered.extend(other.discovered);
        self.items.extend(other.items);
        self.iterations += other.iterations;
        if other.value.is_some() {
            self.value = other.value;
        }
    }
}

/// The operator contract
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    fn node_type(&self) -> NodeType;

    /// Accept-time param validation; must not touch a browser
    fn validate(&self, params: &Value) -> Result<(), NodeError>;

    async fn execute(&self, input: &mut ExecutionInput<'_>) -> Result<ExecutionOutput, NodeError>;
}

/// Dispatch table mapping [`NodeType`] to its executor
pub struct NodeRegistry {
    executors: HashMap<NodeType, Arc<dyn NodeExecutor>>,
}

impl NodeRegistry {
    /// Registry with every built-in operator installed
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self { executors: HashMap::new() };
        registry.register(Arc::new(navigate::NavigateExecutor));
        registry.register(Arc::new(wait::WaitExecutor));
        registry.register(Arc::new(interact::ClickExecutor));
        registry.register(Arc::new(interact::HoverExecutor));
        registry.register(Arc::new(interact::TypeExecutor));
        registry.register(Arc::new(interact::ScrollExecutor));
        registry.register(Arc::new(extract_links::ExtractLinksExecutor));
        registry.register(Arc::new(paginate::PaginateExecutor));
        registry.register(Arc::new(extract::ExtractExecutor));
        registry.register(Arc::new(extract_json::ExtractJsonExecutor));
        registry.register(Arc::new(sequence::SequenceExecutor));
        registry.register(Arc::new(conditional::ConditionalExecutor));
        registry
    }

    pub fn register(&mut self, executor: Arc<dyn NodeExecutor>) {
        self.executors.insert(executor.node_type(), executor);
    }

    #[must_use]
    pub fn get(&self, node_type: NodeType) -> Option<&Arc<dyn NodeExecutor>> {
        self.executors.get(&node_type)
    }

    /// Accept-time validation for one node
    pub fn validate(&self, node_type: NodeType, params: &Value) -> Result<(), NodeError> {
        let executor = self
            .executors
            .get(&node_type)
            .ok_or_else(|| NodeError::UnknownType(node_type.as_str().to_string()))?;
        executor.validate(params)
    }

    /// Execute a node (or nested step) against the shared input.
    ///
    /// The input's `params` slot is swapped for the duration of the call
    /// so nested steps reuse the same vars and browser without
    /// rebuilding the input.
    pub async fn execute_step(
        &self,
        node_type: NodeType,
        params: Value,
        input: &mut ExecutionInput<'_>,
    ) -> Result<ExecutionOutput, NodeError> {
        input.cancel.check()?;
        let executor = self
            .executors
            .get(&node_type)
            .ok_or_else(|| NodeError::UnknownType(node_type.as_str().to_string()))?
            .clone();

        let saved = std::mem::replace(&mut input.params, params);
        let result = executor.execute(input).await;
        input.params = saved;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_type_serde_uses_snake_case() {
        assert_eq!(
            serde_json::to_value(NodeType::ExtractLinks).unwrap(),
            serde_json::json!("extract_links")
        );
        let parsed: NodeType = serde_json::from_value(serde_json::json!("type")).unwrap();
        assert_eq!(parsed, NodeType::Type);
    }

    #[test]
    fn standard_registry_covers_all_types() {
        let registry = NodeRegistry::standard();
        for node_type in [
            NodeType::Navigate,
            NodeType::Wait,
            NodeType::Click,
            NodeType::Hover,
            NodeType::Type,
            NodeType::Scroll,
            NodeType::ExtractLinks,
            NodeType::Paginate,
            NodeType::Extract,
            NodeType::ExtractJson,
            NodeType::Sequence,
            NodeType::Conditional,
        ] {
            assert!(registry.get(node_type).is_some(), "missing {node_type:?}");
        }
    }

    #[test]
    fn cancel_token_trips() {
        let (tx, token) = CancelToken::pair();
        assert!(!token.is_canceled());
        assert!(token.check().is_ok());
        tx.send(true).unwrap();
        assert!(token.is_canceled());
        assert!(matches!(token.check(), Err(NodeError::Canceled)));
    }

    #[tokio::test]
    async fn cancel_interrupts_sleep() {
        let (tx, token) = CancelToken::pair();
        let sleeper = tokio::spawn(async move {
            token.sleep(Duration::from_secs(60)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        let result = sleeper.await.unwrap();
        assert!(matches!(result, Err(NodeError::Canceled)));
    }
}
