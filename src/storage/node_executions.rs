//! Per-node audit records
//!
//! A row is inserted in `running` state when a node starts and finished
//! with its outcome, duration and discovery counts. The timeline,
//! performance and bottleneck reports are all derived from this table.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunStatus {
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeRunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeExecutionRecord {
    pub id: String,
    pub execution_id: String,
    pub url_id: String,
    pub node_id: String,
    pub node_type: String,
    pub status: NodeRunStatus,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub duration_ms: u64,
    pub urls_discovered: u64,
    pub items_extracted: u64,
    pub error_message: Option<String>,
}

/// Outcome applied when a node run finishes
#[derive(Debug, Clone, Default)]
pub struct NodeRunOutcome {
    pub urls_discovered: u64,
    pub items_extracted: u64,
    pub error_message: Option<String>,
}

#[derive(Clone)]
pub struct NodeExecutionsRepo {
    pool: SqlitePool,
}

impl NodeExecutionsRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a node starting; returns the new row id
    pub async fn start(
        &self,
        execution_id: &str,
        url_id: &str,
        node_id: &str,
        node_type: &str,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO node_executions
                (id, execution_id, url_id, node_id, node_type, status, started_at)
            VALUES (?, ?, ?, ?, ?, 'running', ?)
            "#,
        )
        .bind(&id)
        .bind(execution_id)
        .bind(url_id)
        .bind(node_id)
        .bind(node_type)
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .context("Failed to insert node execution")?;
        Ok(id)
    }

    /// Finish a node run with its terminal status
    pub async fn finish(
        &self,
        id: &str,
        status: NodeRunStatus,
        outcome: NodeRunOutcome,
    ) -> Result<()> {
        let now = now_ms();
        sqlx::query(
            r#"
            UPDATE node_executions
            SET status = ?,
                completed_at = ?,
                duration_ms = ? - started_at,
                urls_discovered = ?,
                items_extracted = ?,
                error_message = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(now)
        .bind(now)
        .bind(outcome.urls_discovered as i64)
        .bind(outcome.items_extracted as i64)
        .bind(outcome.error_message)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to finish node execution")?;
        Ok(())
    }

    pub async fn list_for_url(&self, url_id: &str) -> Result<Vec<NodeExecutionRecord>> {
        self.list_where("url_id = ?", url_id).await
    }

    pub async fn list_for_execution(&self, execution_id: &str) -> Result<Vec<NodeExecutionRecord>> {
        self.list_where("execution_id = ?", execution_id).await
    }

    async fn list_where(&self, clause: &str, bind: &str) -> Result<Vec<NodeExecutionRecord>> {
        #[allow(clippy::type_complexity)]
        let rows: Vec<(
            String,
            String,
            String,
            String,
            String,
            String,
            i64,
            Option<i64>,
            i64,
            i64,
            i64,
            Option<String>,
        )> = sqlx::query_as(&format!(
            r#"
            SELECT id, execution_id, url_id, node_id, node_type, status,
                   started_at, completed_at, duration_ms, urls_discovered,
                   items_extracted, error_message
            FROM node_executions
            WHERE {clause}
            ORDER BY started_at ASC, id ASC
            "#
        ))
        .bind(bind)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list node executions")?;

        Ok(rows
            .into_iter()
            .map(
                |(
                    id,
                    execution_id,
                    url_id,
                    node_id,
                    node_type,
                    status,
                    started_at,
                    completed_at,
                    duration_ms,
                    urls_discovered,
                    items_extracted,
                    error_message,
                )| NodeExecutionRecord {
                    id,
                    execution_id,
                    url_id,
                    node_id,
                    node_type,
                    status: NodeRunStatus::parse(&status).unwrap_or(NodeRunStatus::Failed),
                    started_at,
                    completed_at,
                    duration_ms: duration_ms.max(0) as u64,
                    urls_discovered: urls_discovered.max(0) as u64,
                    items_extracted: items_extracted.max(0) as u64,
                    error_message,
                },
            )
            .collect())
    }
}
