//! Persistent, deduplicated URL work queue
//!
//! Every execution owns a set of rows in `url_queue`, keyed by the
//! canonical URL fingerprint, so re-discovering a URL is a no-op.
//! Workers claim rows atomically with a time-bounded lease; a worker
//! that dies simply lets its lease expire and the row becomes claimable
//! again (at-least-once delivery, idempotent downstream by design).
//!
//! All row mutation happens through this type. The executor never
//! touches queue rows directly.

mod canonical;

pub use canonical::{canonicalize, url_fingerprint};

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::storage::now_ms;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("queue row '{0}' not found")]
    NotFound(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Queue row lifecycle. Transitions are driven exclusively by queue
/// operations: `pending -> processing -> {completed|failed|skipped}`,
/// with `skipped` also reachable directly from `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UrlStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
}

impl UrlStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// One queue row
#[derive(Debug, Clone)]
pub struct UrlQueueItem {
    pub id: String,
    pub execution_id: String,
    pub url: String,
    pub url_hash: String,
    pub status: UrlStatus,
    pub depth: u32,
    pub url_type: String,
    pub parent_url_id: Option<String>,
    pub discovered_by_node: Option<String>,
    pub attempts: u32,
    pub worker_id: Option<String>,
    pub error_message: Option<String>,
    pub lease_expires_at: Option<i64>,
    pub enqueued_at: i64,
    pub processed_at: Option<i64>,
}

fn row_to_item(row: &SqliteRow) -> Result<UrlQueueItem, sqlx::Error> {
    let status_raw: String = row.try_get("status")?;
    Ok(UrlQueueItem {
        id: row.try_get("id")?,
        execution_id: row.try_get("execution_id")?,
        url: row.try_get("url")?,
        url_hash: row.try_get("url_hash")?,
        status: UrlStatus::parse(&status_raw).unwrap_or(UrlStatus::Failed),
        depth: row.try_get::<i64, _>("depth")? as u32,
        url_type: row.try_get("url_type")?,
        parent_url_id: row.try_get("parent_url_id")?,
        discovered_by_node: row.try_get("discovered_by_node")?,
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        worker_id: row.try_get("worker_id")?,
        error_message: row.try_get("error_message")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        enqueued_at: row.try_get("enqueued_at")?,
        processed_at: row.try_get("processed_at")?,
    })
}

/// What to enqueue
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub url: String,
    pub url_type: String,
    pub depth: u32,
    pub parent_url_id: Option<String>,
    pub discovered_by_node: Option<String>,
}

impl EnqueueRequest {
    /// A seed row: depth 0, no parent
    #[must_use]
    pub fn seed(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            url_type: "seed".to_string(),
            depth: 0,
            parent_url_id: None,
            discovered_by_node: None,
        }
    }
}

/// Bounds applied when accepting rows
#[derive(Debug, Clone, Copy, Default)]
pub struct EnqueuePolicy {
    /// Rows deeper than this are inserted as `skipped` so discovery
    /// breadth stays observable
    pub max_depth: Option<u32>,
    /// Row-count cap; rows beyond it are inserted as `skipped`
    pub max_total: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Row inserted as `pending`
    Inserted(String),
    /// Row inserted as `skipped` (depth overflow or row cap)
    InsertedSkipped(String),
    /// `(execution_id, url_hash)` already present
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Completed,
    Failed,
    Skipped,
}

impl AckOutcome {
    #[must_use]
    fn as_status(self) -> UrlStatus {
        match self {
            Self::Completed => UrlStatus::Completed,
            Self::Failed => UrlStatus::Failed,
            Self::Skipped => UrlStatus::Skipped,
        }
    }
}

/// Observable per-execution counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl QueueStats {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed + self.skipped
    }

    #[must_use]
    pub fn terminal(&self) -> u64 {
        self.completed + self.failed + self.skipped
    }
}

#[derive(Clone)]
pub struct UrlQueue {
    pool: SqlitePool,
}

impl UrlQueue {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Enqueue one URL, deduplicating on the canonical fingerprint.
    pub async fn enqueue(
        &self,
        execution_id: &str,
        request: EnqueueRequest,
        policy: EnqueuePolicy,
    ) -> Result<EnqueueOutcome, QueueError> {
        let mut tx = self.pool.begin().await?;
        let outcome = Self::enqueue_in_tx(&mut tx, execution_id, request, policy).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Enqueue a batch atomically; returns how many rows were inserted
    /// (duplicates are silently dropped, per-row).
    pub async fn enqueue_batch(
        &self,
        execution_id: &str,
        requests: Vec<EnqueueRequest>,
        policy: EnqueuePolicy,
    ) -> Result<usize, QueueError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for request in requests {
            match Self::enqueue_in_tx(&mut tx, execution_id, request, policy).await? {
                EnqueueOutcome::Inserted(_) | EnqueueOutcome::InsertedSkipped(_) => inserted += 1,
                EnqueueOutcome::Duplicate => {}
            }
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn enqueue_in_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        execution_id: &str,
        request: EnqueueRequest,
        policy: EnqueuePolicy,
    ) -> Result<EnqueueOutcome, QueueError> {
        let canonical = canonicalize(&request.url)?;
        let hash = url_fingerprint(&canonical);
        let now = now_ms();
        let id = Uuid::new_v4().to_string();

        let depth_overflow = policy.max_depth.is_some_and(|max| request.depth > max);
        let over_cap = match policy.max_total {
            Some(cap) => {
                let (count,): (i64,) =
                    sqlx::query_as("SELECT COUNT(*) FROM url_queue WHERE execution_id = ?")
                        .bind(execution_id)
                        .fetch_one(&mut **tx)
                        .await?;
                count as u64 >= cap
            }
            None => false,
        };
        let skip = depth_overflow || over_cap;

        let (status, processed_at) = if skip {
            (UrlStatus::Skipped, Some(now))
        } else {
            (UrlStatus::Pending, None)
        };

        let result = sqlx::query(
            r#"
            INSERT INTO url_queue
                (id, execution_id, url, url_hash, status, depth, url_type,
                 parent_url_id, discovered_by_node, attempts, enqueued_at, processed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            ON CONFLICT (execution_id, url_hash) DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(execution_id)
        .bind(&canonical)
        .bind(&hash)
        .bind(status.as_str())
        .bind(i64::from(request.depth))
        .bind(&request.url_type)
        .bind(&request.parent_url_id)
        .bind(&request.discovered_by_node)
        .bind(now)
        .bind(processed_at)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(EnqueueOutcome::Duplicate);
        }
        Ok(if skip {
            EnqueueOutcome::InsertedSkipped(id)
        } else {
            EnqueueOutcome::Inserted(id)
        })
    }

    /// Claim the next URL for a worker.
    ///
    /// Candidates are `pending` rows and `processing` rows whose lease
    /// expired. Ordering is `(depth ASC, enqueued_at ASC)` for a
    /// breadth-first tendency. The claim is a single test-and-set
    /// statement, so concurrent workers never claim the same row.
    pub async fn dequeue(
        &self,
        execution_id: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<UrlQueueItem>, QueueError> {
        let now = now_ms();
        let lease_expires_at = now + lease.as_millis() as i64;

        let row = sqlx::query(
            r#"
            UPDATE url_queue
            SET status = 'processing',
                attempts = attempts + 1,
                worker_id = ?,
                lease_expires_at = ?
            WHERE id = (
                SELECT id FROM url_queue
                WHERE execution_id = ?
                  AND (status = 'pending'
                       OR (status = 'processing' AND lease_expires_at < ?))
                ORDER BY depth ASC, enqueued_at ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(lease_expires_at)
        .bind(execution_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let item = row_to_item(&row)?;
                debug!(
                    "Worker {} claimed {} (depth {}, attempt {})",
                    worker_id, item.url, item.depth, item.attempts
                );
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    /// Terminally resolve a row. Idempotent: acking an already-terminal
    /// row is a no-op and returns `false`.
    pub async fn ack(
        &self,
        url_id: &str,
        outcome: AckOutcome,
        error: Option<&str>,
    ) -> Result<bool, QueueError> {
        // completed/failed only make sense from processing; skipped is
        // also reachable straight from pending (filter reject)
        let result = match outcome {
            AckOutcome::Skipped => {
                sqlx::query(
                    r#"
                    UPDATE url_queue
                    SET status = ?, processed_at = ?, error_message = ?,
                        lease_expires_at = NULL, worker_id = NULL
                    WHERE id = ? AND status IN ('pending', 'processing')
                    "#,
                )
            }
            _ => {
                sqlx::query(
                    r#"
                    UPDATE url_queue
                    SET status = ?, processed_at = ?, error_message = ?,
                        lease_expires_at = NULL, worker_id = NULL
                    WHERE id = ? AND status = 'processing'
                    "#,
                )
            }
        }
        .bind(outcome.as_status().as_str())
        .bind(now_ms())
        .bind(error)
        .bind(url_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Push the lease forward while a long node runs
    pub async fn extend_lease(&self, url_id: &str, lease: Duration) -> Result<(), QueueError> {
        let lease_expires_at = now_ms() + lease.as_millis() as i64;
        let result = sqlx::query(
            "UPDATE url_queue SET lease_expires_at = ? WHERE id = ? AND status = 'processing'",
        )
        .bind(lease_expires_at)
        .bind(url_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(url_id.to_string()));
        }
        Ok(())
    }

    pub async fn stats(&self, execution_id: &str) -> Result<QueueStats, QueueError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM url_queue WHERE execution_id = ? GROUP BY status",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let count = count as u64;
            match UrlStatus::parse(&status) {
                Some(UrlStatus::Pending) => stats.pending = count,
                Some(UrlStatus::Processing) => stats.processing = count,
                Some(UrlStatus::Completed) => stats.completed = count,
                Some(UrlStatus::Failed) => stats.failed = count,
                Some(UrlStatus::Skipped) => stats.skipped = count,
                None => {}
            }
        }
        Ok(stats)
    }

    /// How many processing rows have an expired lease right now
    pub async fn expired_lease_count(&self, execution_id: &str) -> Result<u64, QueueError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM url_queue
            WHERE execution_id = ? AND status = 'processing' AND lease_expires_at < ?
            "#,
        )
        .bind(execution_id)
        .bind(now_ms())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    pub async fn get(&self, url_id: &str) -> Result<Option<UrlQueueItem>, QueueError> {
        let row = sqlx::query("SELECT * FROM url_queue WHERE id = ?")
            .bind(url_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_item(&r)).transpose().map_err(Into::into)
    }

    /// All rows for an execution, oldest first (test and report helper)
    pub async fn list(&self, execution_id: &str) -> Result<Vec<UrlQueueItem>, QueueError> {
        let rows = sqlx::query(
            "SELECT * FROM url_queue WHERE execution_id = ? ORDER BY enqueued_at ASC, id ASC",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_item).collect::<Result<_, _>>().map_err(Into::into)
    }

    /// Remove every row of an execution
    pub async fn purge(&self, execution_id: &str) -> Result<u64, QueueError> {
        let result = sqlx::query("DELETE FROM url_queue WHERE execution_id = ?")
            .bind(execution_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use tempfile::TempDir;

    async fn queue() -> (TempDir, UrlQueue) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("q.sqlite")).await.unwrap();
        (dir, UrlQueue::new(db.pool().clone()))
    }

    fn request(url: &str, depth: u32) -> EnqueueRequest {
        EnqueueRequest {
            url: url.to_string(),
            url_type: "page".to_string(),
            depth,
            parent_url_id: None,
            discovered_by_node: None,
        }
    }

    #[tokio::test]
    async fn enqueue_dedups_on_canonical_form() {
        let (_dir, queue) = queue().await;

        let first = queue
            .enqueue("ex1", request("https://example.com/a?x=1&y=2", 0), EnqueuePolicy::default())
            .await
            .unwrap();
        assert!(matches!(first, EnqueueOutcome::Inserted(_)));

        // Same URL with reordered params and a fragment is a duplicate
        let second = queue
            .enqueue("ex1", request("https://EXAMPLE.com/a?y=2&x=1#top", 0), EnqueuePolicy::default())
            .await
            .unwrap();
        assert_eq!(second, EnqueueOutcome::Duplicate);

        // Different execution gets its own row
        let other = queue
            .enqueue("ex2", request("https://example.com/a?x=1&y=2", 0), EnqueuePolicy::default())
            .await
            .unwrap();
        assert!(matches!(other, EnqueueOutcome::Inserted(_)));

        assert_eq!(queue.stats("ex1").await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn depth_overflow_rows_are_inserted_skipped() {
        let (_dir, queue) = queue().await;
        let policy = EnqueuePolicy { max_depth: Some(1), max_total: None };

        let ok = queue.enqueue("ex", request("https://x/1", 1), policy).await.unwrap();
        assert!(matches!(ok, EnqueueOutcome::Inserted(_)));

        let deep = queue.enqueue("ex", request("https://x/2", 2), policy).await.unwrap();
        assert!(matches!(deep, EnqueueOutcome::InsertedSkipped(_)));

        let stats = queue.stats("ex").await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.skipped, 1);
    }

    #[tokio::test]
    async fn dequeue_is_breadth_first_and_leases() {
        let (_dir, queue) = queue().await;
        let policy = EnqueuePolicy::default();
        queue.enqueue("ex", request("https://x/deep", 2), policy).await.unwrap();
        queue.enqueue("ex", request("https://x/shallow", 0), policy).await.unwrap();

        let claimed = queue
            .dequeue("ex", "w1", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.url, "https://x/shallow");
        assert_eq!(claimed.status, UrlStatus::Processing);
        assert_eq!(claimed.attempts, 1);
        assert!(claimed.lease_expires_at.unwrap() > now_ms());

        let second = queue
            .dequeue("ex", "w2", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.url, "https://x/deep");

        // Nothing left
        assert!(queue.dequeue("ex", "w3", Duration::from_secs(60)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimable_exactly_once() {
        let (_dir, queue) = queue().await;
        queue
            .enqueue("ex", request("https://x/a", 0), EnqueuePolicy::default())
            .await
            .unwrap();

        // Claim with an already-expired lease
        let first = queue
            .dequeue("ex", "w1", Duration::from_millis(0))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let reclaimed = queue
            .dequeue("ex", "w2", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.id, first.id);
        assert_eq!(reclaimed.attempts, 2);
        assert_eq!(reclaimed.worker_id.as_deref(), Some("w2"));

        // The fresh lease is live, so no third claim
        assert!(queue.dequeue("ex", "w3", Duration::from_secs(60)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ack_is_terminal_and_idempotent() {
        let (_dir, queue) = queue().await;
        queue
            .enqueue("ex", request("https://x/a", 0), EnqueuePolicy::default())
            .await
            .unwrap();
        let item = queue
            .dequeue("ex", "w1", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        assert!(queue.ack(&item.id, AckOutcome::Completed, None).await.unwrap());
        // Second ack with any terminal outcome is a no-op
        assert!(!queue.ack(&item.id, AckOutcome::Completed, None).await.unwrap());
        assert!(!queue.ack(&item.id, AckOutcome::Failed, Some("late")).await.unwrap());

        let row = queue.get(&item.id).await.unwrap().unwrap();
        assert_eq!(row.status, UrlStatus::Completed);
        assert!(row.processed_at.is_some());
        assert!(row.lease_expires_at.is_none());
        assert!(row.error_message.is_none());
    }

    #[tokio::test]
    async fn skipped_is_reachable_from_pending() {
        let (_dir, queue) = queue().await;
        let outcome = queue
            .enqueue("ex", request("https://x/a", 0), EnqueuePolicy::default())
            .await
            .unwrap();
        let EnqueueOutcome::Inserted(id) = outcome else { panic!() };

        assert!(queue.ack(&id, AckOutcome::Skipped, Some("no phase matched")).await.unwrap());
        let row = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(row.status, UrlStatus::Skipped);

        // But completed is not reachable from pending
        let outcome = queue
            .enqueue("ex", request("https://x/b", 0), EnqueuePolicy::default())
            .await
            .unwrap();
        let EnqueueOutcome::Inserted(id) = outcome else { panic!() };
        assert!(!queue.ack(&id, AckOutcome::Completed, None).await.unwrap());
    }

    #[tokio::test]
    async fn batch_enqueue_matches_sequential_enqueues() {
        let (_dir, queue) = queue().await;
        let policy = EnqueuePolicy::default();

        let inserted = queue
            .enqueue_batch(
                "ex",
                vec![
                    request("https://x/1", 1),
                    request("https://x/2", 1),
                    request("https://x/1#dup", 1),
                ],
                policy,
            )
            .await
            .unwrap();
        assert_eq!(inserted, 2);

        let stats = queue.stats("ex").await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.total(), 2);
    }

    #[tokio::test]
    async fn row_cap_inserts_skipped() {
        let (_dir, queue) = queue().await;
        let policy = EnqueuePolicy { max_depth: None, max_total: Some(2) };

        queue.enqueue("ex", request("https://x/1", 0), policy).await.unwrap();
        queue.enqueue("ex", request("https://x/2", 0), policy).await.unwrap();
        let over = queue.enqueue("ex", request("https://x/3", 0), policy).await.unwrap();
        assert!(matches!(over, EnqueueOutcome::InsertedSkipped(_)));

        let stats = queue.stats("ex").await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.skipped, 1);
    }

    #[tokio::test]
    async fn extend_lease_requires_processing() {
        let (_dir, queue) = queue().await;
        queue
            .enqueue("ex", request("https://x/a", 0), EnqueuePolicy::default())
            .await
            .unwrap();
        let item = queue
            .dequeue("ex", "w1", Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();

        queue.extend_lease(&item.id, Duration::from_secs(300)).await.unwrap();
        let row = queue.get(&item.id).await.unwrap().unwrap();
        assert!(row.lease_expires_at.unwrap() > now_ms() + 200_000);

        queue.ack(&item.id, AckOutcome::Completed, None).await.unwrap();
        assert!(queue.extend_lease(&item.id, Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn purge_clears_execution_scope_only() {
        let (_dir, queue) = queue().await;
        let policy = EnqueuePolicy::default();
        queue.enqueue("a", request("https://x/1", 0), policy).await.unwrap();
        queue.enqueue("b", request("https://x/1", 0), policy).await.unwrap();

        assert_eq!(queue.purge("a").await.unwrap(), 1);
        assert_eq!(queue.stats("a").await.unwrap().total(), 0);
        assert_eq!(queue.stats("b").await.unwrap().total(), 1);
    }
}
