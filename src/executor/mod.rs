//! Workflow execution engine
//!
//! [`Engine`] is the command surface: start/stop executions, read stats
//! and reports, open headed selector sessions. Each started execution
//! gets a [`WorkflowExecutor`] running N worker tasks plus a lease
//! observer tick; workers claim URLs from the queue, pick the phase
//! whose filter matches, run its node DAG against a pooled browser
//! context and ack the row. The whole run is crash-safe: a worker that
//! dies mid-URL just lets the lease lapse and another worker reclaims
//! the row.

mod phase;
mod settings;

pub use settings::{ExecutionSettings, SettingsHandle, SettingsSnapshot};

use anyhow::{Context, Result, anyhow};
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::browser::{BrowserPool, BrowserPoolConfig, PoolError};
use crate::config::EngineConfig;
use crate::nodes::{CancelToken, NodeRegistry};
use crate::queue::{
    AckOutcome, EnqueuePolicy, EnqueueRequest, QueueStats, UrlQueue, UrlQueueItem, UrlStatus,
};
use crate::recovery::{HttpSolutionProvider, RecoveryManager, SolutionProvider};
use crate::storage::{
    BottleneckEntry, Database, DatabaseItemSink, ExecutionStatus, ItemSink, NodeTypePerformance,
    PhaseStats, PhaseStatsDelta, TimelineEntry, UrlHierarchyNode,
};
use crate::workflow::{MaxPagesMode, Workflow, WorkflowSource, validate_workflow};

use phase::PhaseRunCtx;

struct ExecutionHandle {
    cancel_tx: watch::Sender<bool>,
    settings: SettingsHandle,
    join: Mutex<Option<JoinHandle<()>>>,
}

/// Command surface over the execution core
pub struct Engine {
    config: EngineConfig,
    db: Database,
    queue: UrlQueue,
    pool: Arc<BrowserPool>,
    registry: Arc<NodeRegistry>,
    recovery: Arc<RecoveryManager>,
    sink: Arc<dyn ItemSink>,
    executions: DashMap<String, Arc<ExecutionHandle>>,
}

impl Engine {
    /// Open the database, build the pool and load recovery rules.
    pub async fn new(config: EngineConfig) -> Result<Self> {
        let db = Database::open(config.database_path()).await?;
        let queue = UrlQueue::new(db.pool().clone());
        let pool = BrowserPool::new(BrowserPoolConfig::from_engine(&config));

        let provider: Option<Arc<dyn SolutionProvider>> = match config.ai_backend() {
            Some(backend) => Some(Arc::new(HttpSolutionProvider::new(backend.clone())?)),
            None => None,
        };
        let recovery =
            RecoveryManager::new(db.rules(), provider, config.recovery_enabled()).await?;

        let sink: Arc<dyn ItemSink> = Arc::new(DatabaseItemSink::new(db.pool().clone()));

        Ok(Self {
            config,
            queue,
            pool,
            registry: Arc::new(NodeRegistry::standard()),
            recovery,
            sink,
            executions: DashMap::new(),
            db,
        })
    }

    /// Swap the item sink (database by default)
    pub fn with_item_sink(mut self, sink: Arc<dyn ItemSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    #[must_use]
    pub fn queue(&self) -> &UrlQueue {
        &self.queue
    }

    #[must_use]
    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    #[must_use]
    pub fn browser_pool(&self) -> &Arc<BrowserPool> {
        &self.pool
    }

    /// Validate the workflow, seed the queue and launch workers.
    ///
    /// Returns the new execution id immediately; the run proceeds in the
    /// background.
    pub async fn start(
        &self,
        mut workflow: Workflow,
        triggered_by: Option<&str>,
    ) -> Result<String> {
        validate_workflow(&mut workflow, &self.registry)
            .map_err(|e| anyhow!("workflow rejected: {e}"))?;

        let execution_id = uuid::Uuid::new_v4().to_string();
        self.db
            .executions()
            .create(&execution_id, &workflow.id, triggered_by)
            .await?;

        let seed_policy = EnqueuePolicy {
            max_depth: Some(workflow.max_depth),
            max_total: match workflow.max_pages_mode {
                MaxPagesMode::Enqueue => workflow.max_pages,
                MaxPagesMode::Dequeue => None,
            },
        };
        let seeds: Vec<EnqueueRequest> = workflow
            .start_urls
            .iter()
            .map(|url| EnqueueRequest::seed(url.clone()))
            .collect();
        let seeded = self
            .queue
            .enqueue_batch(&execution_id, seeds, seed_policy)
            .await
            .context("Failed to seed the queue")?;
        info!(
            "Execution {execution_id} seeded with {seeded} URLs for workflow '{}'",
            workflow.id
        );

        self.db
            .executions()
            .update_status(&execution_id, ExecutionStatus::Running)
            .await?;

        let settings = SettingsHandle::new(ExecutionSettings::new(
            workflow.concurrent_workers.max(1),
            workflow.rate_limit_delay_ms,
        ));
        let (cancel_tx, cancel) = CancelToken::pair();

        let executor = WorkflowExecutor {
            execution_id: execution_id.clone(),
            workflow: Arc::new(workflow),
            db: self.db.clone(),
            queue: self.queue.clone(),
            pool: Arc::clone(&self.pool),
            registry: Arc::clone(&self.registry),
            recovery: Arc::clone(&self.recovery),
            sink: Arc::clone(&self.sink),
            settings: settings.clone(),
            cancel,
            lease: Duration::from_millis(self.config.lease_ms()),
            dequeue_backoff: Duration::from_millis(self.config.dequeue_backoff_ms()),
            acquire_timeout: self.config.acquire_timeout(),
            base_navigation_timeout: Duration::from_secs(self.config.navigation_timeout_secs()),
            base_node_timeout: Duration::from_secs(self.config.node_timeout_secs()),
            error_statuses: self.config_error_range(),
        };

        let join = tokio::spawn(async move { executor.run().await });

        self.executions.insert(
            execution_id.clone(),
            Arc::new(ExecutionHandle {
                cancel_tx,
                settings,
                join: Mutex::new(Some(join)),
            }),
        );

        Ok(execution_id)
    }

    /// Load a workflow from a source and start it
    pub async fn start_by_id(
        &self,
        source: &dyn WorkflowSource,
        workflow_id: &str,
        triggered_by: Option<&str>,
    ) -> Result<String> {
        let workflow = source
            .load(workflow_id)
            .await
            .with_context(|| format!("Failed to load workflow '{workflow_id}'"))?;
        self.start(workflow, triggered_by).await
    }

    fn config_error_range(&self) -> std::ops::RangeInclusive<u16> {
        // The config exposes containment, not the bounds; probe once
        let from = (100..=599).find(|s| self.config.is_error_status(*s)).unwrap_or(400);
        let to = (100..=599).rev().find(|s| self.config.is_error_status(*s)).unwrap_or(599);
        from..=to
    }

    /// Request cooperative cancellation of a running execution
    pub fn stop(&self, execution_id: &str) -> bool {
        match self.executions.get(execution_id) {
            Some(handle) => {
                info!("Stop requested for execution {execution_id}");
                handle.cancel_tx.send(true).is_ok()
            }
            None => false,
        }
    }

    /// Block until the execution's run task finishes
    pub async fn wait(&self, execution_id: &str) -> Result<()> {
        let handle = self
            .executions
            .get(execution_id)
            .ok_or_else(|| anyhow!("unknown execution {execution_id}"))?
            .clone();
        let join = handle.join.lock().await.take();
        if let Some(join) = join {
            join.await.context("execution task panicked")?;
        }
        Ok(())
    }

    /// Live settings handle of a running execution
    #[must_use]
    pub fn settings(&self, execution_id: &str) -> Option<SettingsHandle> {
        self.executions.get(execution_id).map(|h| h.settings.clone())
    }

    pub async fn stats(&self, execution_id: &str) -> Result<(QueueStats, Vec<PhaseStats>)> {
        let queue_stats = self.queue.stats(execution_id).await?;
        let phase_stats = self.db.executions().phase_stats(execution_id).await?;
        Ok((queue_stats, phase_stats))
    }

    pub async fn timeline(&self, execution_id: &str) -> Result<Vec<TimelineEntry>> {
        self.db.reports().timeline(execution_id).await
    }

    pub async fn hierarchy(&self, execution_id: &str) -> Result<Vec<UrlHierarchyNode>> {
        self.db.reports().hierarchy(execution_id).await
    }

    pub async fn performance(&self, execution_id: &str) -> Result<Vec<NodeTypePerformance>> {
        self.db.reports().performance(execution_id).await
    }

    pub async fn bottlenecks(
        &self,
        execution_id: &str,
        threshold_ms: u64,
    ) -> Result<Vec<BottleneckEntry>> {
        self.db.reports().bottlenecks(execution_id, threshold_ms).await
    }

    /// Stop everything and release resources
    pub async fn shutdown(&self) {
        for entry in self.executions.iter() {
            let _ = entry.value().cancel_tx.send(true);
        }
        let ids: Vec<String> = self.executions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let _ = self.wait(&id).await;
        }
        self.pool.shutdown().await;
        self.db.close().await;
    }
}

/// Per-execution run state: worker fan-out, lease observation, terminal
/// status decision.
pub struct WorkflowExecutor {
    execution_id: String,
    workflow: Arc<Workflow>,
    db: Database,
    queue: UrlQueue,
    pool: Arc<BrowserPool>,
    registry: Arc<NodeRegistry>,
    recovery: Arc<RecoveryManager>,
    sink: Arc<dyn ItemSink>,
    settings: SettingsHandle,
    cancel: CancelToken,
    lease: Duration,
    dequeue_backoff: Duration,
    acquire_timeout: Duration,
    base_navigation_timeout: Duration,
    base_node_timeout: Duration,
    error_statuses: std::ops::RangeInclusive<u16>,
}

impl WorkflowExecutor {
    /// Drive the execution to a terminal status
    pub async fn run(self) {
        let executor = Arc::new(self);

        // Reflect pause/resume in the execution record
        let status_watcher = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(1));
                let mut last_paused = false;
                loop {
                    interval.tick().await;
                    if executor.cancel.is_canceled() {
                        break;
                    }
                    let paused = executor.settings.is_paused();
                    if paused != last_paused {
                        last_paused = paused;
                        let status = if paused {
                            ExecutionStatus::Paused
                        } else {
                            ExecutionStatus::Running
                        };
                        if let Err(e) = executor
                            .db
                            .executions()
                            .update_status(&executor.execution_id, status)
                            .await
                        {
                            warn!("Failed to sync execution status: {e}");
                        }
                    }
                }
            })
        };

        // Lease observer: reclamation happens inside dequeue, this tick
        // just surfaces stuck leases
        let lease_observer = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(30));
                loop {
                    interval.tick().await;
                    if executor.cancel.is_canceled() {
                        break;
                    }
                    match executor.queue.expired_lease_count(&executor.execution_id).await {
                        Ok(0) => {}
                        Ok(count) => {
                            warn!(
                                "{count} expired leases awaiting reclamation in execution {}",
                                executor.execution_id
                            );
                        }
                        Err(e) => debug!("lease check failed: {e}"),
                    }
                }
            })
        };

        let worker_count = executor.settings.snapshot().concurrent_workers;
        info!(
            "Execution {} running with {} workers",
            executor.execution_id, worker_count
        );

        let mut workers = JoinSet::new();
        for worker_index in 0..worker_count {
            let executor = Arc::clone(&executor);
            workers.spawn(async move { executor.worker_loop(worker_index).await });
        }
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!("Worker task panicked: {e}");
            }
        }

        status_watcher.abort();
        lease_observer.abort();

        let final_status = executor.decide_final_status().await;
        if let Err(e) = executor
            .db
            .executions()
            .update_status(&executor.execution_id, final_status)
            .await
        {
            error!("Failed to record final execution status: {e}");
        }
        executor.recovery.forget_execution(&executor.execution_id);
        info!(
            "Execution {} finished with status {}",
            executor.execution_id,
            final_status.as_str()
        );
    }

    /// `failed` only when every seed failed terminally; `stopped` on
    /// cancellation; otherwise `completed`.
    async fn decide_final_status(&self) -> ExecutionStatus {
        if self.cancel.is_canceled() {
            return ExecutionStatus::Stopped;
        }
        match self.queue.list(&self.execution_id).await {
            Ok(rows) => {
                let seeds: Vec<_> = rows.iter().filter(|r| r.url_type == "seed").collect();
                if !seeds.is_empty() && seeds.iter().all(|s| s.status == UrlStatus::Failed) {
                    ExecutionStatus::Failed
                } else {
                    ExecutionStatus::Completed
                }
            }
            Err(e) => {
                error!("Failed to inspect queue for final status: {e}");
                ExecutionStatus::Failed
            }
        }
    }

    /// Reached the dequeue-mode page cap?
    async fn page_cap_reached(&self, stats: &QueueStats) -> bool {
        match (self.workflow.max_pages_mode, self.workflow.max_pages) {
            (MaxPagesMode::Dequeue, Some(cap)) => stats.terminal() >= cap,
            _ => false,
        }
    }

    async fn worker_loop(self: &Arc<Self>, worker_index: usize) {
        let worker_id = format!("w{worker_index}");
        debug!("Worker {worker_id} starting for execution {}", self.execution_id);

        loop {
            if self.cancel.is_canceled() {
                break;
            }

            let snapshot = self.settings.snapshot();
            // Surplus workers exit when recovery lowers the cap
            if worker_index >= snapshot.concurrent_workers {
                debug!("Worker {worker_id} exiting: over the worker cap");
                break;
            }
            if self.settings.wait_if_paused(&self.cancel).await.is_err() {
                break;
            }

            let stats = match self.queue.stats(&self.execution_id).await {
                Ok(stats) => stats,
                Err(e) => {
                    warn!("Queue stats failed: {e}");
                    if self.backoff_sleep().await.is_err() {
                        break;
                    }
                    continue;
                }
            };
            if self.page_cap_reached(&stats).await {
                debug!("Worker {worker_id} exiting: page cap reached");
                break;
            }

            match self
                .queue
                .dequeue(&self.execution_id, &worker_id, self.lease)
                .await
            {
                Ok(Some(item)) => {
                    // Per-request pacing
                    let delay = self.settings.snapshot().rate_limit_delay_ms;
                    if delay > 0 && self.cancel.sleep(Duration::from_millis(delay)).await.is_err()
                    {
                        let _ = self
                            .queue
                            .ack(&item.id, AckOutcome::Failed, Some("stopped"))
                            .await;
                        break;
                    }
                    self.process_item(item).await;
                }
                Ok(None) => {
                    // Exit only once the queue is stably empty AND no
                    // peer holds a row that could spawn more work
                    if stats.pending == 0 && stats.processing == 0 {
                        debug!("Worker {worker_id} exiting: queue drained");
                        break;
                    }
                    if self.backoff_sleep().await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Dequeue failed: {e}");
                    if self.backoff_sleep().await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Worker {worker_id} done");
    }

    /// Jittered sleep between polls of an empty queue
    async fn backoff_sleep(&self) -> Result<(), crate::nodes::NodeError> {
        let jitter = rand::rng().random_range(0..=self.dequeue_backoff.as_millis() as u64 / 2);
        self.cancel
            .sleep(self.dequeue_backoff + Duration::from_millis(jitter))
            .await
    }

    /// Handle one claimed URL through phase selection, phase runs and ack
    async fn process_item(self: &Arc<Self>, item: UrlQueueItem) {
        let phase = self
            .workflow
            .select_phase(&item.url, &item.url_type, item.depth);
        let Some(entry_phase) = phase else {
            debug!("No phase matched {} (type {}, depth {})", item.url, item.url_type, item.depth);
            let _ = self
                .queue
                .ack(&item.id, AckOutcome::Skipped, Some("no phase matched"))
                .await;
            return;
        };

        // A context is held for the whole URL, across transitions
        let guard = match self.acquire_browser().await {
            Ok(guard) => guard,
            Err(e) => {
                warn!("Browser unavailable for {}: {e}", item.url);
                let _ = self
                    .queue
                    .ack(
                        &item.id,
                        AckOutcome::Failed,
                        Some(&format!("browser unavailable: {e}")),
                    )
                    .await;
                return;
            }
        };
        let browser = guard.context();

        if let Err(e) = browser.set_extra_headers(&self.workflow.default_headers).await {
            warn!("Failed to install default headers: {e}");
        }
        if let Err(e) = browser.set_cookies(&item.url, &self.workflow.default_cookies).await {
            warn!("Failed to install default cookies: {e}");
        }

        let ctx = PhaseRunCtx {
            workflow: self.workflow.as_ref(),
            queue: &self.queue,
            db: &self.db,
            sink: self.sink.as_ref(),
            registry: self.registry.as_ref(),
            recovery: self.recovery.as_ref(),
            settings: &self.settings,
            pool: self.pool.as_ref(),
            cancel: &self.cancel,
            lease: self.lease,
            base_navigation_timeout: self.base_navigation_timeout,
            base_node_timeout: self.base_node_timeout,
            error_statuses: self.error_statuses.clone(),
        };

        let mut vars = std::collections::HashMap::new();
        vars.insert("url_type".to_string(), serde_json::json!(item.url_type));
        vars.insert("depth".to_string(), serde_json::json!(item.depth));

        let mut current_phase = entry_phase;
        let mut transitions_left = self.workflow.phases.len();
        let mut outcome: Result<(), String> = Ok(());

        loop {
            let is_entry = current_phase.id == entry_phase.id;
            match ctx.run_phase(current_phase, &item, browser, &mut vars).await {
                Ok(summary) => {
                    let _ = self
                        .db
                        .executions()
                        .upsert_phase_stats(
                            &self.execution_id,
                            &current_phase.id,
                            PhaseStatsDelta {
                                // Attributed once per URL, to the phase
                                // its filter selected
                                processed: u64::from(is_entry),
                                errors: summary.errors,
                                duration_ms: summary.duration_ms,
                            },
                        )
                        .await;

                    match summary.next_phase_id {
                        Some(next_id) if transitions_left > 0 => {
                            match self.workflow.phase(&next_id) {
                                Some(next) => {
                                    transitions_left -= 1;
                                    current_phase = next;
                                    continue;
                                }
                                None => {
                                    outcome =
                                        Err(format!("transition to unknown phase '{next_id}'"));
                                    break;
                                }
                            }
                        }
                        Some(next_id) => {
                            outcome = Err(format!(
                                "transition loop detected entering phase '{next_id}'"
                            ));
                            break;
                        }
                        None => break,
                    }
                }
                Err(failure) => {
                    debug!(
                        "phase '{}' failed for {} ({})",
                        current_phase.id,
                        item.url,
                        failure.error.error_type()
                    );
                    let _ = self
                        .db
                        .executions()
                        .upsert_phase_stats(
                            &self.execution_id,
                            &current_phase.id,
                            PhaseStatsDelta {
                                processed: u64::from(is_entry),
                                errors: 1,
                                duration_ms: 0,
                            },
                        )
                        .await;
                    outcome = Err(if failure.is_canceled() {
                        "stopped".to_string()
                    } else {
                        failure.message
                    });
                    break;
                }
            }
        }

        match outcome {
            Ok(()) => {
                let _ = self.queue.ack(&item.id, AckOutcome::Completed, None).await;
            }
            Err(message) => {
                let _ = self
                    .queue
                    .ack(&item.id, AckOutcome::Failed, Some(&message))
                    .await;
            }
        }
        // Guard drop releases (and resets) the context
    }

    async fn acquire_browser(
        &self,
    ) -> Result<crate::browser::PooledContextGuard, PoolError> {
        let mut last_error = PoolError::Exhausted(self.acquire_timeout);
        for _ in 0..3 {
            if self.cancel.is_canceled() {
                return Err(PoolError::Canceled);
            }
            match self.pool.acquire(Some(self.acquire_timeout)).await {
                Ok(guard) => return Ok(guard),
                Err(PoolError::Closed) => return Err(PoolError::Closed),
                Err(e) => {
                    warn!("Browser acquire failed, retrying: {e}");
                    last_error = e;
                    if self.cancel.sleep(Duration::from_millis(500)).await.is_err() {
                        return Err(PoolError::Canceled);
                    }
                }
            }
        }
        Err(last_error)
    }
}
