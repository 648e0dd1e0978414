//! Execution records and per-phase statistics

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::SqlitePool;

use super::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Stopped,
}

impl ExecutionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub triggered_by: Option<String>,
}

/// Per-phase counters surfaced in stats
#[derive(Debug, Clone, Default, Serialize)]
pub struct PhaseStats {
    pub phase_id: String,
    pub processed: u64,
    pub errors: u64,
    pub duration_ms: u64,
}

/// Increment applied by a worker after finishing a phase for one URL
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseStatsDelta {
    pub processed: u64,
    pub errors: u64,
    pub duration_ms: u64,
}

#[derive(Clone)]
pub struct ExecutionsRepo {
    pool: SqlitePool,
}

impl ExecutionsRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        id: &str,
        workflow_id: &str,
        triggered_by: Option<&str>,
    ) -> Result<ExecutionRecord> {
        let started_at = now_ms();
        sqlx::query(
            r#"
            INSERT INTO workflow_executions (id, workflow_id, status, started_at, triggered_by)
            VALUES (?, ?, 'pending', ?, ?)
            "#,
        )
        .bind(id)
        .bind(workflow_id)
        .bind(started_at)
        .bind(triggered_by)
        .execute(&self.pool)
        .await
        .context("Failed to create execution record")?;

        Ok(ExecutionRecord {
            id: id.to_string(),
            workflow_id: workflow_id.to_string(),
            status: ExecutionStatus::Pending,
            started_at,
            completed_at: None,
            triggered_by: triggered_by.map(str::to_string),
        })
    }

    pub async fn update_status(&self, id: &str, status: ExecutionStatus) -> Result<()> {
        let completed_at = matches!(
            status,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Stopped
        )
        .then(now_ms);

        sqlx::query(
            "UPDATE workflow_executions SET status = ?, completed_at = COALESCE(?, completed_at) WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(completed_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to update execution status")?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        let row: Option<(String, String, String, i64, Option<i64>, Option<String>)> =
            sqlx::query_as(
                r#"
                SELECT id, workflow_id, status, started_at, completed_at, triggered_by
                FROM workflow_executions WHERE id = ?
                "#,
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load execution")?;

        Ok(row.map(
            |(id, workflow_id, status, started_at, completed_at, triggered_by)| ExecutionRecord {
                id,
                workflow_id,
                status: ExecutionStatus::parse(&status).unwrap_or(ExecutionStatus::Failed),
                started_at,
                completed_at,
                triggered_by,
            },
        ))
    }

    /// Accumulate phase counters; creates the row on first touch
    pub async fn upsert_phase_stats(
        &self,
        execution_id: &str,
        phase_id: &str,
        delta: PhaseStatsDelta,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_phase_stats (execution_id, phase_id, processed, errors, duration_ms)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (execution_id, phase_id) DO UPDATE SET
                processed = processed + excluded.processed,
                errors = errors + excluded.errors,
                duration_ms = duration_ms + excluded.duration_ms
            "#,
        )
        .bind(execution_id)
        .bind(phase_id)
        .bind(delta.processed as i64)
        .bind(delta.errors as i64)
        .bind(delta.duration_ms as i64)
        .execute(&self.pool)
        .await
        .context("Failed to upsert phase stats")?;
        Ok(())
    }

    pub async fn phase_stats(&self, execution_id: &str) -> Result<Vec<PhaseStats>> {
        let rows: Vec<(String, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT phase_id, processed, errors, duration_ms
            FROM execution_phase_stats WHERE execution_id = ?
            ORDER BY phase_id
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load phase stats")?;

        Ok(rows
            .into_iter()
            .map(|(phase_id, processed, errors, duration_ms)| PhaseStats {
                phase_id,
                processed: processed as u64,
                errors: errors as u64,
                duration_ms: duration_ms as u64,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use tempfile::TempDir;

    #[tokio::test]
    async fn lifecycle_and_phase_stats() -> Result<()> {
        let dir = TempDir::new()?;
        let db = Database::open(&dir.path().join("e.sqlite")).await?;
        let repo = db.executions();

        let record = repo.create("ex-1", "wf-9", Some("api")).await?;
        assert_eq!(record.status, ExecutionStatus::Pending);

        repo.update_status("ex-1", ExecutionStatus::Running).await?;
        let loaded = repo.get("ex-1").await?.unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Running);
        assert!(loaded.completed_at.is_none());

        repo.upsert_phase_stats(
            "ex-1",
            "discover",
            PhaseStatsDelta { processed: 1, errors: 0, duration_ms: 120 },
        )
        .await?;
        repo.upsert_phase_stats(
            "ex-1",
            "discover",
            PhaseStatsDelta { processed: 1, errors: 1, duration_ms: 80 },
        )
        .await?;

        let stats = repo.phase_stats("ex-1").await?;
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].processed, 2);
        assert_eq!(stats[0].errors, 1);
        assert_eq!(stats[0].duration_ms, 200);

        repo.update_status("ex-1", ExecutionStatus::Completed).await?;
        let done = repo.get("ex-1").await?.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert!(done.completed_at.is_some());

        db.close().await;
        Ok(())
    }
}
