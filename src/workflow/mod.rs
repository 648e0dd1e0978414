//! Workflow data model and accept-time validation
//!
//! A workflow is a declarative program: ordered phases, each with a URL
//! filter and a DAG of typed nodes. Documents arrive as JSON and are
//! validated against the node registry before an execution starts, so
//! unknown node types and malformed params never reach a worker.

mod types;
mod validate;

pub use types::{
    Backoff, Condition, MaxPagesMode, Node, Phase, PhaseKind, PhaseTransition, RetryPolicy,
    UrlFilter, Workflow,
};
pub use validate::{WorkflowError, topological_order, validate_workflow};

use async_trait::async_trait;

/// Supplies workflow documents to the engine by id.
///
/// Implementations live with the persistence layer (database, file
/// directory, remote API); the engine validates whatever they return
/// before an execution starts.
#[async_trait]
pub trait WorkflowSource: Send + Sync {
    async fn load(&self, workflow_id: &str) -> anyhow::Result<Workflow>;
}
