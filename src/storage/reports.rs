//! Aggregation queries over the audit tables
//!
//! Everything here is derived from `node_executions` and `url_queue`;
//! no report has its own state. These back the command surface's
//! timeline, hierarchy, performance and bottleneck views.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;

/// One step in the execution timeline
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub url: String,
    pub node_id: String,
    pub node_type: String,
    pub status: String,
    pub duration_ms: u64,
}

/// URL discovery tree node; children reference their parent by row id
#[derive(Debug, Clone, Serialize)]
pub struct UrlHierarchyNode {
    pub url_id: String,
    pub url: String,
    pub depth: u32,
    pub status: String,
    pub url_type: String,
    pub discovered_by_node: Option<String>,
    pub children: Vec<UrlHierarchyNode>,
}

/// Aggregate timing per node type
#[derive(Debug, Clone, Serialize)]
pub struct NodeTypePerformance {
    pub node_type: String,
    pub runs: u64,
    pub failures: u64,
    pub avg_duration_ms: f64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    pub total_urls_discovered: u64,
    pub total_items_extracted: u64,
}

/// A node run slower than the caller's threshold
#[derive(Debug, Clone, Serialize)]
pub struct BottleneckEntry {
    pub node_id: String,
    pub node_type: String,
    pub url: String,
    pub duration_ms: u64,
    pub status: String,
}

#[derive(Clone)]
pub struct ReportsRepo {
    pool: SqlitePool,
}

impl ReportsRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Node runs in start order, joined with the URL they ran against
    pub async fn timeline(&self, execution_id: &str) -> Result<Vec<TimelineEntry>> {
        let rows: Vec<(i64, Option<i64>, String, String, String, String, i64)> = sqlx::query_as(
            r#"
            SELECT n.started_at, n.completed_at, q.url, n.node_id, n.node_type,
                   n.status, n.duration_ms
            FROM node_executions n
            JOIN url_queue q ON q.id = n.url_id
            WHERE n.execution_id = ?
            ORDER BY n.started_at ASC, n.id ASC
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to build timeline")?;

        Ok(rows
            .into_iter()
            .map(
                |(started_at, completed_at, url, node_id, node_type, status, duration_ms)| {
                    TimelineEntry {
                        started_at,
                        completed_at,
                        url,
                        node_id,
                        node_type,
                        status,
                        duration_ms: duration_ms.max(0) as u64,
                    }
                },
            )
            .collect())
    }

    /// URL discovery tree, roots first (seeds have no parent)
    pub async fn hierarchy(&self, execution_id: &str) -> Result<Vec<UrlHierarchyNode>> {
        let rows: Vec<(String, String, i64, String, String, Option<String>, Option<String>)> =
            sqlx::query_as(
                r#"
                SELECT id, url, depth, status, url_type, parent_url_id, discovered_by_node
                FROM url_queue
                WHERE execution_id = ?
                ORDER BY depth ASC, enqueued_at ASC
                "#,
            )
            .bind(execution_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to load URL rows for hierarchy")?;

        // Assemble children lists keyed by parent id, then lift roots.
        // Rows are depth-ordered, so parents are always seen first.
        let mut children_of: HashMap<String, Vec<String>> = HashMap::new();
        let mut nodes: HashMap<String, UrlHierarchyNode> = HashMap::new();
        let mut root_ids = Vec::new();

        for (id, url, depth, status, url_type, parent_url_id, discovered_by_node) in rows {
            match &parent_url_id {
                Some(parent) => children_of.entry(parent.clone()).or_default().push(id.clone()),
                None => root_ids.push(id.clone()),
            }
            nodes.insert(
                id.clone(),
                UrlHierarchyNode {
                    url_id: id,
                    url,
                    depth: depth.max(0) as u32,
                    status,
                    url_type,
                    discovered_by_node,
                    children: Vec::new(),
                },
            );
        }

        fn build(
            id: &str,
            nodes: &mut HashMap<String, UrlHierarchyNode>,
            children_of: &HashMap<String, Vec<String>>,
        ) -> Option<UrlHierarchyNode> {
            let mut node = nodes.remove(id)?;
            if let Some(child_ids) = children_of.get(id) {
                for child_id in child_ids {
                    if let Some(child) = build(child_id, nodes, children_of) {
                        node.children.push(child);
                    }
                }
            }
            Some(node)
        }

        let mut roots = Vec::new();
        for id in root_ids {
            if let Some(root) = build(&id, &mut nodes, &children_of) {
                roots.push(root);
            }
        }
        Ok(roots)
    }

    /// Aggregate run counts and durations per node type
    pub async fn performance(&self, execution_id: &str) -> Result<Vec<NodeTypePerformance>> {
        let rows: Vec<(String, i64, i64, f64, i64, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT node_type,
                   COUNT(*) AS runs,
                   SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failures,
                   AVG(duration_ms) AS avg_ms,
                   MIN(duration_ms) AS min_ms,
                   MAX(duration_ms) AS max_ms,
                   SUM(urls_discovered) AS urls,
                   SUM(items_extracted) AS items
            FROM node_executions
            WHERE execution_id = ? AND status != 'running'
            GROUP BY node_type
            ORDER BY avg_ms DESC
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to aggregate node performance")?;

        Ok(rows
            .into_iter()
            .map(
                |(node_type, runs, failures, avg_ms, min_ms, max_ms, urls, items)| {
                    NodeTypePerformance {
                        node_type,
                        runs: runs.max(0) as u64,
                        failures: failures.max(0) as u64,
                        avg_duration_ms: avg_ms,
                        min_duration_ms: min_ms.max(0) as u64,
                        max_duration_ms: max_ms.max(0) as u64,
                        total_urls_discovered: urls.max(0) as u64,
                        total_items_extracted: items.max(0) as u64,
                    }
                },
            )
            .collect())
    }

    /// Node runs whose duration exceeded `threshold_ms`, slowest first
    pub async fn bottlenecks(
        &self,
        execution_id: &str,
        threshold_ms: u64,
    ) -> Result<Vec<BottleneckEntry>> {
        let rows: Vec<(String, String, String, i64, String)> = sqlx::query_as(
            r#"
            SELECT n.node_id, n.node_type, q.url, n.duration_ms, n.status
            FROM node_executions n
            JOIN url_queue q ON q.id = n.url_id
            WHERE n.execution_id = ? AND n.duration_ms > ? AND n.status != 'running'
            ORDER BY n.duration_ms DESC
            "#,
        )
        .bind(execution_id)
        .bind(threshold_ms as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to find bottlenecks")?;

        Ok(rows
            .into_iter()
            .map(|(node_id, node_type, url, duration_ms, status)| BottleneckEntry {
                node_id,
                node_type,
                url,
                duration_ms: duration_ms.max(0) as u64,
                status,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{EnqueuePolicy, EnqueueRequest, UrlQueue};
    use crate::storage::{Database, NodeRunOutcome, NodeRunStatus};
    use tempfile::TempDir;

    #[tokio::test]
    async fn hierarchy_builds_tree_from_parent_ids() -> Result<()> {
        let dir = TempDir::new()?;
        let db = Database::open(&dir.path().join("h.sqlite")).await?;
        let queue = UrlQueue::new(db.pool().clone());

        let seed = match queue
            .enqueue("ex", EnqueueRequest::seed("https://x/"), EnqueuePolicy::default())
            .await?
        {
            crate::queue::EnqueueOutcome::Inserted(id) => id,
            other => panic!("unexpected outcome {other:?}"),
        };

        queue
            .enqueue(
                "ex",
                EnqueueRequest {
                    url: "https://x/child".to_string(),
                    url_type: "category".to_string(),
                    depth: 1,
                    parent_url_id: Some(seed.clone()),
                    discovered_by_node: Some("links".to_string()),
                },
                EnqueuePolicy::default(),
            )
            .await?;

        let roots = db.reports().hierarchy("ex").await?;
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].children.len(), 1);
        assert_eq!(roots[0].children[0].url, "https://x/child");
        assert_eq!(roots[0].children[0].discovered_by_node.as_deref(), Some("links"));

        db.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn performance_and_bottlenecks_aggregate_finished_runs() -> Result<()> {
        let dir = TempDir::new()?;
        let db = Database::open(&dir.path().join("p.sqlite")).await?;
        let queue = UrlQueue::new(db.pool().clone());
        let nodes = db.node_executions();

        let url_id = match queue
            .enqueue("ex", EnqueueRequest::seed("https://x/"), EnqueuePolicy::default())
            .await?
        {
            crate::queue::EnqueueOutcome::Inserted(id) => id,
            other => panic!("unexpected outcome {other:?}"),
        };

        let a = nodes.start("ex", &url_id, "nav", "navigate").await?;
        nodes.finish(&a, NodeRunStatus::Completed, NodeRunOutcome::default()).await?;
        let b = nodes.start("ex", &url_id, "links", "extract_links").await?;
        nodes
            .finish(
                &b,
                NodeRunStatus::Failed,
                NodeRunOutcome { error_message: Some("boom".into()), ..Default::default() },
            )
            .await?;

        let perf = db.reports().performance("ex").await?;
        assert_eq!(perf.len(), 2);
        let links = perf.iter().find(|p| p.node_type == "extract_links").unwrap();
        assert_eq!(links.runs, 1);
        assert_eq!(links.failures, 1);

        // Threshold of 0 excludes nothing that took measurable time;
        // sub-millisecond runs may legitimately report 0
        let slow = db.reports().bottlenecks("ex", 3_600_000).await?;
        assert!(slow.is_empty());

        let timeline = db.reports().timeline("ex").await?;
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[0].node_id, "nav");

        db.close().await;
        Ok(())
    }
}
