// src/main.rs
//! Conductor execution engine
//!
//! Runs the orchestrator with static collaborators until Ctrl-C, then
//! drains every live agent process.

use anyhow::{Context, Result};
use conductor_engine::collaborators::{
    Collaborators, ExecutionStore, MemoryBudget, MemoryStore, SqliteStore, StaticAccounts,
    StaticMonitor, StaticTeams, TracingLogSink,
};
use conductor_engine::observability::{init_metrics, init_tracing};
use conductor_engine::utils::config::{EngineConfig, StorageBackend};
use conductor_engine::Orchestrator;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = EngineConfig::load().context("failed to load configuration")?;

    init_tracing(&config.observability)?;
    init_metrics(&config.observability)?;

    info!("Starting Conductor engine v{}", conductor_engine::VERSION);
    info!("Configuration loaded: {:?}", config);

    let store: Arc<dyn ExecutionStore> = match config.storage.backend {
        StorageBackend::Sqlite => Arc::new(
            SqliteStore::open(&config.storage.db_path)
                .with_context(|| format!("failed to open {}", config.storage.db_path.display()))?,
        ),
        StorageBackend::Memory => Arc::new(MemoryStore::default()),
    };

    let teams = match &config.storage.teams_file {
        Some(path) => StaticTeams::from_file(path)?,
        None => StaticTeams::default(),
    };

    let collaborators = Collaborators {
        budget: Arc::new(MemoryBudget::allow_all()),
        monitor: Arc::new(StaticMonitor::default()),
        accounts: Arc::new(StaticAccounts::default()),
        sink: Arc::new(TracingLogSink),
        store,
        teams: Arc::new(teams),
    };

    let drain_timeout = config.runtime.drain_timeout();
    let orchestrator = Orchestrator::new(config, collaborators);
    orchestrator.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl-C handler")?;
    info!("Received shutdown signal, cleaning up...");

    let report = orchestrator.shutdown(drain_timeout).await;
    info!(
        "Engine stopped ({} processes exited, {} killed)",
        report.exited, report.killed
    );
    Ok(())
}
