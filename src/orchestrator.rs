// src/orchestrator.rs
//! Engine facade
//!
//! Builds every component once from [`EngineConfig`] and the external
//! [`Collaborators`], and exposes the operations callers use.
//!
//! # Example
//!
//! ```no_run
//! use conductor_engine::{Collaborators, EngineConfig, Orchestrator};
//! use std::time::Duration;
//!
//! # async fn run() -> conductor_engine::Result<()> {
//! let orchestrator = Orchestrator::new(EngineConfig::load()?, Collaborators::in_memory());
//! orchestrator.start();
//! let team_exec_id = orchestrator.execute_team("docs-team", "Document the API", None)?;
//! println!("started {}", team_exec_id);
//! orchestrator.shutdown(Duration::from_secs(30)).await;
//! # Ok(())
//! # }
//! ```

use crate::collaborators::Collaborators;
use crate::rotation::{EvaluatorStatus, RotationEngine, RotationEvaluator, RotationEvent};
use crate::runtime::engine::ExecutionEngine;
use crate::runtime::execution::{Execution, ExecutionOutcome, ExecutionRequest};
use crate::runtime::process_manager::{DrainReport, ProcessManager};
use crate::topology::{TeamExecution, TopologyEngine};
use crate::utils::config::EngineConfig;
use crate::utils::errors::Result;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct Orchestrator {
    config: EngineConfig,
    engine: ExecutionEngine,
    rotation: Arc<RotationEngine>,
    evaluator: Arc<RotationEvaluator>,
    topology: TopologyEngine,
}

impl Orchestrator {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            budget,
            monitor,
            accounts,
            sink,
            store,
            teams,
        } = collaborators;

        let engine = ExecutionEngine::new(
            config.runtime.clone(),
            ProcessManager::new(),
            budget,
            sink,
            Arc::clone(&store),
        );
        let rotation = Arc::new(RotationEngine::new(
            config.rotation.clone(),
            engine.clone(),
            monitor,
            accounts,
            Arc::clone(&store),
        ));
        let evaluator = Arc::new(RotationEvaluator::new(
            config.evaluator.clone(),
            engine.clone(),
            Arc::clone(&rotation),
        ));
        let topology = TopologyEngine::new(
            config.topology.clone(),
            Arc::new(engine.clone()),
            teams,
            store,
        );

        Self {
            config,
            engine,
            rotation,
            evaluator,
            topology,
        }
    }

    /// Start background jobs. Returns true if the evaluator was started.
    pub fn start(&self) -> bool {
        if !self.config.evaluator.enabled {
            info!("Rotation evaluator disabled by configuration");
            return false;
        }
        self.evaluator.start()
    }

    pub fn start_execution(&self, request: ExecutionRequest) -> Result<String> {
        self.engine
            .run(&request.agent, &request.prompt, request.overrides)
    }

    pub fn cancel_execution(&self, execution_id: &str, graceful: bool) -> bool {
        self.engine.cancel(execution_id, graceful)
    }

    pub fn execution(&self, execution_id: &str) -> Option<Execution> {
        self.engine.execution(execution_id)
    }

    pub async fn wait_for_execution(&self, execution_id: &str) -> Result<ExecutionOutcome> {
        self.engine.wait(execution_id).await
    }

    pub fn execute_team(&self, team_id: &str, message: &str, event_context: Option<Value>) -> Result<String> {
        self.topology.execute_team(team_id, message, event_context)
    }

    pub fn approve_team_execution(&self, team_exec_id: &str) -> bool {
        self.topology.approve(team_exec_id)
    }

    pub fn team_execution(&self, team_exec_id: &str) -> Option<TeamExecution> {
        self.topology.team_execution(team_exec_id)
    }

    pub fn evaluator_status(&self) -> EvaluatorStatus {
        self.evaluator.status()
    }

    /// Rotation events, optionally limited to one execution's chain
    pub fn rotation_history(&self, execution_id: Option<&str>) -> Result<Vec<RotationEvent>> {
        self.rotation.history(execution_id)
    }

    pub fn execution_engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub fn rotation_engine(&self) -> &Arc<RotationEngine> {
        &self.rotation
    }

    /// Stop the evaluator and drain live processes
    pub async fn shutdown(&self, timeout: Duration) -> DrainReport {
        self.evaluator.stop();
        let report = self.engine.processes().drain_on_shutdown(timeout).await;
        info!(
            exited = report.exited,
            killed = report.killed,
            "Orchestrator shut down"
        );
        report
    }
}
