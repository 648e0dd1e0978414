// Thin driver binary: load a workflow document, run it to completion,
// print the queue and phase stats. The engine itself is the library;
// HTTP surfaces live elsewhere.

use anyhow::{Context, Result, anyhow};
use crawlflow::config::EngineConfig;
use crawlflow::executor::Engine;
use crawlflow::workflow::Workflow;
use std::path::PathBuf;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let workflow_path = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow!("usage: crawlflow <workflow.json>"))?;

    let raw = tokio::fs::read_to_string(&workflow_path)
        .await
        .with_context(|| format!("Failed to read workflow file {workflow_path}"))?;
    let workflow: Workflow =
        serde_json::from_str(&raw).context("Workflow document is not valid JSON")?;

    let database_path = std::env::var("CRAWLFLOW_DB")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./crawlflow.sqlite"));
    let mut builder = EngineConfig::builder().database_path(database_path);
    if let Ok(pool_size) = std::env::var("CRAWLFLOW_POOL_SIZE")
        && let Ok(pool_size) = pool_size.parse()
    {
        builder = builder.pool_size(pool_size);
    }
    if std::env::var("CRAWLFLOW_HEADED").is_ok() {
        builder = builder.headless(false);
    }
    let config = builder.build()?;

    let engine = Engine::new(config).await?;
    let execution_id = engine.start(workflow, Some("cli")).await?;
    info!("Started execution {execution_id}");

    tokio::select! {
        result = engine.wait(&execution_id) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, stopping execution");
            engine.stop(&execution_id);
            engine.wait(&execution_id).await?;
        }
    }

    let (queue_stats, phase_stats) = engine.stats(&execution_id).await?;
    println!("{}", serde_json::to_string_pretty(&serde_json::json!({
        "execution_id": execution_id,
        "queue": queue_stats,
        "phases": phase_stats,
    }))?);

    engine.shutdown().await;
    Ok(())
}
