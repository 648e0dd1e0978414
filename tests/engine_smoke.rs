//! Engine lifecycle without a live browser: URLs that match no phase
//! are skipped before any context is acquired, so a filter-miss
//! workflow drives the full start -> workers -> terminal-status path.

use anyhow::bail;
use async_trait::async_trait;
use crawlflow::config::EngineConfig;
use crawlflow::executor::Engine;
use crawlflow::queue::UrlStatus;
use crawlflow::storage::ExecutionStatus;
use crawlflow::workflow::{Workflow, WorkflowSource};
use serde_json::json;
use tempfile::TempDir;

fn unmatched_workflow() -> Workflow {
    serde_json::from_value(json!({
        "id": "wf-nothing-matches",
        "start_urls": ["https://a.example.com/", "https://b.example.com/"],
        "concurrent_workers": 2,
        "phases": [
            {
                "id": "products-only",
                "kind": "extraction",
                "url_filter": { "url_types": ["product"] },
                "nodes": [
                    { "id": "open", "type": "navigate", "params": {} }
                ]
            }
        ]
    }))
    .unwrap()
}

async fn engine(dir: &TempDir) -> Engine {
    let config = EngineConfig::builder()
        .database_path(dir.path().join("engine.sqlite"))
        .dequeue_backoff_ms(20)
        .build()
        .unwrap();
    Engine::new(config).await.unwrap()
}

#[tokio::test]
async fn filter_miss_execution_runs_to_completed() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir).await;

    let execution_id = engine
        .start(unmatched_workflow(), Some("test"))
        .await
        .unwrap();
    engine.wait(&execution_id).await.unwrap();

    let record = engine
        .database()
        .executions()
        .get(&execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert!(record.completed_at.is_some());

    let (stats, _phases) = engine.stats(&execution_id).await.unwrap();
    assert_eq!(stats.skipped, 2);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.processing, 0);

    for row in engine.queue().list(&execution_id).await.unwrap() {
        assert_eq!(row.status, UrlStatus::Skipped);
        assert_eq!(row.error_message.as_deref(), Some("no phase matched"));
    }

    engine.shutdown().await;
}

#[tokio::test]
async fn invalid_workflow_is_rejected_before_any_row_exists() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir).await;

    let mut workflow = unmatched_workflow();
    workflow.start_urls.clear();
    assert!(engine.start(workflow, None).await.is_err());

    engine.shutdown().await;
}

/// In-memory source holding exactly one workflow
struct SingleWorkflowSource(Workflow);

#[async_trait]
impl WorkflowSource for SingleWorkflowSource {
    async fn load(&self, workflow_id: &str) -> anyhow::Result<Workflow> {
        if workflow_id == self.0.id {
            Ok(self.0.clone())
        } else {
            bail!("no workflow '{workflow_id}'")
        }
    }
}

#[tokio::test]
async fn start_by_id_loads_through_the_source() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir).await;
    let source = SingleWorkflowSource(unmatched_workflow());

    assert!(
        engine
            .start_by_id(&source, "no-such-workflow", None)
            .await
            .is_err()
    );

    let execution_id = engine
        .start_by_id(&source, "wf-nothing-matches", Some("test"))
        .await
        .unwrap();
    engine.wait(&execution_id).await.unwrap();

    let record = engine
        .database()
        .executions()
        .get(&execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.workflow_id, "wf-nothing-matches");
    assert_eq!(record.status, ExecutionStatus::Completed);

    engine.shutdown().await;
}

#[tokio::test]
async fn stop_on_unknown_execution_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir).await;
    assert!(!engine.stop("no-such-execution"));
    engine.shutdown().await;
}

#[tokio::test]
async fn reports_are_empty_for_a_skipped_only_run() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir).await;

    let execution_id = engine.start(unmatched_workflow(), None).await.unwrap();
    engine.wait(&execution_id).await.unwrap();

    assert!(engine.timeline(&execution_id).await.unwrap().is_empty());
    assert!(engine.performance(&execution_id).await.unwrap().is_empty());
    assert!(engine.bottlenecks(&execution_id, 0).await.unwrap().is_empty());

    // Seeds still show up as hierarchy roots
    let roots = engine.hierarchy(&execution_id).await.unwrap();
    assert_eq!(roots.len(), 2);
    assert!(roots.iter().all(|r| r.children.is_empty()));

    engine.shutdown().await;
}
