//! Running one phase's node DAG against one URL
//!
//! Nodes run in topological order, independent nodes serialized by
//! declaration order for determinism. Each run is recorded as a
//! `node_executions` row; discovered URLs are re-enqueued with parent
//! linkage and emitted items go to the sink. A non-optional failure
//! first consults recovery (apply actions, retry once), then the node's
//! own retry policy, and only then fails the phase for this URL.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::browser::{BrowserContext, BrowserPool};
use crate::nodes::{CancelToken, ExecutionInput, ExecutionOutput, NodeError, NodeRegistry};
use crate::queue::{EnqueuePolicy, EnqueueRequest, UrlQueue, UrlQueueItem};
use crate::recovery::{FailureContext, OutcomeSample, RecoveryManager, apply_actions};
use crate::storage::{Database, ExtractedItem, ItemSink, NodeRunOutcome, NodeRunStatus};
use crate::workflow::{MaxPagesMode, Node, Phase, Workflow, topological_order};

use super::settings::SettingsHandle;

/// A node failure with the message that should land on the URL row
/// (recovery attribution included when recovery was attempted)
#[derive(Debug)]
pub(crate) struct NodeFailure {
    pub error: NodeError,
    pub message: String,
}

impl NodeFailure {
    fn plain(error: NodeError) -> Self {
        let message = error.to_string();
        Self { error, message }
    }

    pub(crate) fn is_canceled(&self) -> bool {
        matches!(self.error, NodeError::Canceled)
    }
}

/// Everything a phase run borrows from the executor
pub(crate) struct PhaseRunCtx<'a> {
    pub workflow: &'a Workflow,
    pub queue: &'a UrlQueue,
    pub db: &'a Database,
    pub sink: &'a dyn ItemSink,
    pub registry: &'a NodeRegistry,
    pub recovery: &'a RecoveryManager,
    pub settings: &'a SettingsHandle,
    pub pool: &'a BrowserPool,
    pub cancel: &'a CancelToken,
    pub lease: Duration,
    pub base_navigation_timeout: Duration,
    pub base_node_timeout: Duration,
    pub error_statuses: std::ops::RangeInclusive<u16>,
}

/// What a finished phase reports back to the worker
pub(crate) struct PhaseRunSummary {
    pub errors: u64,
    pub duration_ms: u64,
    pub next_phase_id: Option<String>,
}

impl PhaseRunCtx<'_> {
    fn enqueue_policy(&self) -> EnqueuePolicy {
        EnqueuePolicy {
            max_depth: Some(self.workflow.max_depth),
            max_total: match self.workflow.max_pages_mode {
                MaxPagesMode::Enqueue => self.workflow.max_pages,
                MaxPagesMode::Dequeue => None,
            },
        }
    }

    /// Run all nodes of `phase` against `item` on `browser`.
    pub(crate) async fn run_phase(
        &self,
        phase: &Phase,
        item: &UrlQueueItem,
        browser: &BrowserContext,
        vars: &mut HashMap<String, serde_json::Value>,
    ) -> Result<PhaseRunSummary, NodeFailure> {
        let started = Instant::now();
        let order = topological_order(&phase.nodes).map_err(|node| {
            NodeFailure::plain(NodeError::InvalidParams(format!(
                "dependency cycle at '{node}'"
            )))
        })?;

        let page_url = Url::parse(&item.url).map_err(|e| {
            NodeFailure::plain(NodeError::InvalidParams(format!(
                "queue row URL '{}': {e}",
                item.url
            )))
        })?;

        let mut errors = 0u64;

        for index in order {
            let node = &phase.nodes[index];
            if self.cancel.is_canceled() {
                return Err(NodeFailure::plain(NodeError::Canceled));
            }

            // Keep the lease alive across long phases
            if let Err(e) = self.queue.extend_lease(&item.id, self.lease).await {
                debug!("lease extension failed for {}: {e}", item.url);
            }

            match self.run_node(node, item, browser, &page_url, vars).await {
                Ok(()) => {}
                Err(failure) if failure.is_canceled() => return Err(failure),
                Err(failure) if node.optional => {
                    warn!(
                        "optional node '{}' failed for {}: {}",
                        node.id, item.url, failure.message
                    );
                    errors += 1;
                }
                Err(failure) => return Err(failure),
            }
        }

        // Explicit transition: the target's filter is not re-checked
        let next_phase_id = match &phase.transition {
            Some(transition) => {
                let follow = match &transition.condition {
                    Some(condition) => {
                        crate::nodes::evaluate_condition(condition, browser, vars)
                            .await
                            .map_err(NodeFailure::plain)?
                    }
                    None => true,
                };
                follow.then(|| transition.next_phase_id.clone())
            }
            None => None,
        };

        Ok(PhaseRunSummary {
            errors,
            duration_ms: started.elapsed().as_millis() as u64,
            next_phase_id,
        })
    }

    /// Run one node: audit record, recovery consultation with a single
    /// retry, the node's own retry policy, output routing.
    async fn run_node(
        &self,
        node: &Node,
        item: &UrlQueueItem,
        browser: &BrowserContext,
        page_url: &Url,
        vars: &mut HashMap<String, serde_json::Value>,
    ) -> Result<(), NodeFailure> {
        let record_id = self
            .db
            .node_executions()
            .start(&item.execution_id, &item.id, &node.id, node.node_type.as_str())
            .await
            .map_err(|e| NodeFailure::plain(NodeError::Browser(format!("audit insert: {e}"))))?;

        let mut recovery_note: Option<String> = None;
        let mut result = self.attempt_node(node, item, browser, page_url, vars).await;

        // Recovery: analyze, apply actions, retry the node exactly once
        if let Err(e) = &result
            && !matches!(e, NodeError::Canceled)
        {
            let ctx = self.failure_context(e, item, browser, &node.id);
            if let Some(solution) = self.recovery.propose(&ctx).await {
                let description = solution.describe();
                info!("Applying {description} for {} node '{}'", item.url, node.id);
                match apply_actions(
                    &solution.actions,
                    self.settings,
                    browser,
                    self.pool,
                    self.cancel,
                )
                .await
                {
                    Ok(applied) => {
                        recovery_note =
                            Some(format!("{description}; applied: {}", applied.join(", ")));
                        result = self.attempt_node(node, item, browser, page_url, vars).await;
                        self.recovery
                            .report_outcome(&solution, &ctx, result.is_ok())
                            .await;
                    }
                    Err(NodeError::Canceled) => {
                        return Err(NodeFailure::plain(NodeError::Canceled));
                    }
                    Err(apply_error) => {
                        warn!("Recovery actions failed to apply: {apply_error}");
                    }
                }
            }
        }

        // The node's own retry policy
        if result.is_err()
            && let Some(retry) = &node.retry
        {
            for attempt in 1..=retry.max_retries {
                match &result {
                    Ok(_) => break,
                    Err(NodeError::Canceled) => {
                        return Err(NodeFailure::plain(NodeError::Canceled));
                    }
                    Err(e) => {
                        debug!(
                            "retrying node '{}' for {} ({attempt}/{}) after {e}",
                            node.id, item.url, retry.max_retries
                        );
                    }
                }
                if let Err(e) = self.cancel.sleep(retry.delay_for_attempt(attempt)).await {
                    return Err(NodeFailure::plain(e));
                }
                result = self.attempt_node(node, item, browser, page_url, vars).await;
            }
        }

        match result {
            Ok(output) => {
                self.route_output(node, item, &record_id, output, vars).await?;
                Ok(())
            }
            Err(error) => {
                let message = match recovery_note {
                    Some(note) => format!("{error}; after {note}"),
                    None => error.to_string(),
                };
                let _ = self
                    .db
                    .node_executions()
                    .finish(
                        &record_id,
                        NodeRunStatus::Failed,
                        NodeRunOutcome {
                            error_message: Some(message.clone()),
                            ..Default::default()
                        },
                    )
                    .await;
                Err(NodeFailure { error, message })
            }
        }
    }

    /// One execution attempt under the effective node timeout
    async fn attempt_node(
        &self,
        node: &Node,
        item: &UrlQueueItem,
        browser: &BrowserContext,
        page_url: &Url,
        vars: &mut HashMap<String, serde_json::Value>,
    ) -> Result<ExecutionOutput, NodeError> {
        let snapshot = self.settings.snapshot();
        let node_timeout = snapshot.effective_timeout(self.base_node_timeout);

        let mut input = ExecutionInput {
            browser,
            registry: self.registry,
            params: serde_json::Value::Null,
            vars,
            execution_id: &item.execution_id,
            url_id: &item.id,
            page_url: page_url.clone(),
            navigation_timeout: snapshot.effective_timeout(self.base_navigation_timeout),
            error_statuses: self.error_statuses.clone(),
            cancel: self.cancel.clone(),
        };

        let result = tokio::time::timeout(
            node_timeout,
            self.registry
                .execute_step(node.node_type, node.params.clone(), &mut input),
        )
        .await
        .unwrap_or(Err(NodeError::Timeout(node_timeout)));

        self.observe_outcome(item, browser, &result);
        result
    }

    /// Persist a successful node run's side effects
    async fn route_output(
        &self,
        node: &Node,
        item: &UrlQueueItem,
        record_id: &str,
        output: ExecutionOutput,
        vars: &mut HashMap<String, serde_json::Value>,
    ) -> Result<(), NodeFailure> {
        let urls_discovered = output.discovered.len() as u64;
        let items_extracted = output.items.len() as u64;

        if !output.discovered.is_empty() {
            let requests: Vec<EnqueueRequest> = output
                .discovered
                .into_iter()
                .map(|discovered| EnqueueRequest {
                    url: discovered.url,
                    url_type: discovered.url_type,
                    depth: item.depth + 1,
                    parent_url_id: Some(item.id.clone()),
                    discovered_by_node: Some(node.id.clone()),
                })
                .collect();
            let inserted = self
                .queue
                .enqueue_batch(&item.execution_id, requests, self.enqueue_policy())
                .await
                .map_err(|e| {
                    NodeFailure::plain(NodeError::Browser(format!("enqueue failed: {e}")))
                })?;
            debug!(
                "node '{}' discovered {urls_discovered} URLs ({inserted} new) from {}",
                node.id, item.url
            );
        }

        let _ = self
            .db
            .node_executions()
            .finish(
                record_id,
                NodeRunStatus::Completed,
                NodeRunOutcome { urls_discovered, items_extracted, error_message: None },
            )
            .await;

        for draft in output.items {
            let extracted = ExtractedItem::from_record(
                &item.execution_id,
                &item.id,
                Some(record_id),
                &draft.item_type,
                draft.schema_name.as_deref(),
                draft.attributes,
            );
            self.sink.emit(&extracted).await.map_err(|e| {
                NodeFailure::plain(NodeError::Extraction(format!("item sink: {e}")))
            })?;
        }

        if let Some(key) = &node.output_key
            && let Some(value) = output.value
        {
            vars.insert(key.clone(), value);
        }
        if output.iterations > 0 {
            vars.insert(
                "last_iterations".to_string(),
                serde_json::json!(output.iterations),
            );
        }

        Ok(())
    }

    fn observe_outcome(
        &self,
        item: &UrlQueueItem,
        browser: &BrowserContext,
        result: &Result<ExecutionOutput, NodeError>,
    ) {
        let domain = Url::parse(&item.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_lowercase))
            .unwrap_or_default();
        let sample = match result {
            Ok(_) => OutcomeSample {
                domain,
                status_code: browser.last_http_status(),
                error_type: None,
                ok: true,
            },
            Err(e) => OutcomeSample {
                domain,
                status_code: browser.last_http_status(),
                error_type: Some(e.error_type().to_string()),
                ok: false,
            },
        };
        self.recovery.observe(&item.execution_id, sample);
    }

    fn failure_context(
        &self,
        error: &NodeError,
        item: &UrlQueueItem,
        browser: &BrowserContext,
        node_id: &str,
    ) -> FailureContext {
        let response = browser.last_response();
        FailureContext {
            execution_id: item.execution_id.clone(),
            url: item.url.clone(),
            domain: Url::parse(&item.url)
                .ok()
                .and_then(|u| u.host_str().map(str::to_lowercase))
                .unwrap_or_default(),
            error_type: error.error_type().to_string(),
            error_message: error.to_string(),
            status_code: response.as_ref().map(|r| r.status_code),
            response_body: None,
            response_headers: response.map(|r| r.headers).unwrap_or_default(),
            node_id: node_id.to_string(),
            is_seed: item.url_type == "seed",
        }
    }
}
