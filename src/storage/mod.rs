//! Persistent storage for the execution engine
//!
//! One SQLite database (WAL mode) holds the URL queue and every audit
//! table: executions, per-phase stats, node execution records, extracted
//! items and recovery rules. All mutation goes through the repositories
//! in this module or through [`crate::queue::UrlQueue`]; nothing else
//! writes rows.

mod executions;
mod items;
mod node_executions;
mod reports;
mod rules;

pub use executions::{ExecutionRecord, ExecutionStatus, ExecutionsRepo, PhaseStats, PhaseStatsDelta};
pub use items::{DatabaseItemSink, ExtractedItem, ItemSink, ItemsRepo};
pub use node_executions::{NodeExecutionRecord, NodeExecutionsRepo, NodeRunOutcome, NodeRunStatus};
pub use reports::{
    BottleneckEntry, NodeTypePerformance, ReportsRepo, TimelineEntry, UrlHierarchyNode,
};
pub use rules::RulesRepo;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;

/// SQL schema for the engine database
const SCHEMA_SQL: &str = r#"
-- One row per workflow run
CREATE TABLE IF NOT EXISTS workflow_executions (
    id TEXT PRIMARY KEY,
    workflow_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    started_at INTEGER NOT NULL,
    completed_at INTEGER,
    triggered_by TEXT
);

CREATE INDEX IF NOT EXISTS idx_executions_workflow ON workflow_executions(workflow_id);

-- Per-phase counters, upserted incrementally by workers
CREATE TABLE IF NOT EXISTS execution_phase_stats (
    execution_id TEXT NOT NULL,
    phase_id TEXT NOT NULL,
    processed INTEGER NOT NULL DEFAULT 0,
    errors INTEGER NOT NULL DEFAULT 0,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (execution_id, phase_id)
);

-- The work queue: one row per discovered URL per execution
CREATE TABLE IF NOT EXISTS url_queue (
    id TEXT PRIMARY KEY,
    execution_id TEXT NOT NULL,
    url TEXT NOT NULL,
    url_hash TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    depth INTEGER NOT NULL DEFAULT 0,
    url_type TEXT NOT NULL DEFAULT 'page',
    parent_url_id TEXT,
    discovered_by_node TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    worker_id TEXT,
    error_message TEXT,
    lease_expires_at INTEGER,
    enqueued_at INTEGER NOT NULL,
    processed_at INTEGER,
    UNIQUE (execution_id, url_hash)
);

-- Dequeue candidates: pending rows plus expired-lease processing rows
CREATE INDEX IF NOT EXISTS idx_url_queue_claimable
    ON url_queue(execution_id, depth, enqueued_at)
    WHERE status IN ('pending', 'processing');

CREATE INDEX IF NOT EXISTS idx_url_queue_lease
    ON url_queue(lease_expires_at)
    WHERE lease_expires_at IS NOT NULL;

CREATE INDEX IF NOT EXISTS idx_url_queue_status ON url_queue(execution_id, status);

-- Audit trail: one row per node run per URL
CREATE TABLE IF NOT EXISTS node_executions (
    id TEXT PRIMARY KEY,
    execution_id TEXT NOT NULL,
    url_id TEXT NOT NULL,
    node_id TEXT NOT NULL,
    node_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'running',
    started_at INTEGER NOT NULL,
    completed_at INTEGER,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    urls_discovered INTEGER NOT NULL DEFAULT 0,
    items_extracted INTEGER NOT NULL DEFAULT 0,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_node_executions_execution ON node_executions(execution_id, started_at);
CREATE INDEX IF NOT EXISTS idx_node_executions_url ON node_executions(url_id);

-- Structured output; idempotent per (execution, url, schema)
CREATE TABLE IF NOT EXISTS extracted_items (
    id TEXT PRIMARY KEY,
    execution_id TEXT NOT NULL,
    url_id TEXT NOT NULL,
    node_execution_id TEXT,
    item_type TEXT NOT NULL DEFAULT 'generic',
    schema_name TEXT NOT NULL DEFAULT '',
    title TEXT,
    price REAL,
    currency TEXT,
    availability TEXT,
    rating REAL,
    review_count INTEGER,
    attributes TEXT NOT NULL DEFAULT '{}',
    extracted_at INTEGER NOT NULL,
    UNIQUE (execution_id, url_id, schema_name)
);

CREATE INDEX IF NOT EXISTS idx_extracted_items_execution ON extracted_items(execution_id);

-- Recovery rules, both operator-defined and learned
CREATE TABLE IF NOT EXISTS error_recovery_rules (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    conditions TEXT NOT NULL DEFAULT '[]',
    context TEXT NOT NULL DEFAULT '{}',
    actions TEXT NOT NULL DEFAULT '[]',
    confidence REAL NOT NULL DEFAULT 0,
    usage_count INTEGER NOT NULL DEFAULT 0,
    success_count INTEGER NOT NULL DEFAULT 0,
    fail_count INTEGER NOT NULL DEFAULT 0,
    learned INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_recovery_rules_priority ON error_recovery_rules(priority DESC);

-- Free-form recovery tuning knobs
CREATE TABLE IF NOT EXISTS error_recovery_config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Handle to the engine database
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database and bootstrap the schema
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .context("Failed to open SQLite database")?;

        sqlx::query(SCHEMA_SQL)
            .execute(&pool)
            .await
            .context("Failed to initialize database schema")?;

        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    #[must_use]
    pub fn executions(&self) -> ExecutionsRepo {
        ExecutionsRepo::new(self.pool.clone())
    }

    #[must_use]
    pub fn node_executions(&self) -> NodeExecutionsRepo {
        NodeExecutionsRepo::new(self.pool.clone())
    }

    #[must_use]
    pub fn items(&self) -> ItemsRepo {
        ItemsRepo::new(self.pool.clone())
    }

    #[must_use]
    pub fn rules(&self) -> RulesRepo {
        RulesRepo::new(self.pool.clone())
    }

    #[must_use]
    pub fn reports(&self) -> ReportsRepo {
        ReportsRepo::new(self.pool.clone())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Current time as unix milliseconds, the timestamp unit for every table
#[must_use]
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn open_bootstraps_schema() -> Result<()> {
        let dir = TempDir::new()?;
        let db = Database::open(&dir.path().join("engine.sqlite")).await?;

        // Schema bootstrap is idempotent
        sqlx::query(SCHEMA_SQL).execute(db.pool()).await?;

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(db.pool())
        .await?;
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();

        for expected in [
            "error_recovery_config",
            "error_recovery_rules",
            "execution_phase_stats",
            "extracted_items",
            "node_executions",
            "url_queue",
            "workflow_executions",
        ] {
            assert!(names.contains(&expected), "missing table {expected}");
        }

        db.close().await;
        Ok(())
    }
}
