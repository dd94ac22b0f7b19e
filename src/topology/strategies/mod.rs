// src/topology/strategies/mod.rs
//! Team execution strategies, one module per topology kind

pub mod composite;
pub mod coordinator;
pub mod generator_critic;
pub mod hierarchical;
pub mod human_in_loop;
pub mod parallel;
pub mod sequential;

use crate::runtime::execution::{AgentSpec, ExecutionStatus};
use crate::topology::runner::{AgentOutput, AgentRunner, TeamRunContext};
use crate::topology::tracker::TeamTracker;
use crate::topology::types::{EmptyOutputPolicy, TeamConfig, Topology};
use crate::utils::errors::{EngineError, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Everything a strategy needs to run members of one team execution
pub struct StrategyContext {
    pub runner: Arc<dyn AgentRunner>,
    pub team: Arc<TeamConfig>,
    pub run_ctx: TeamRunContext,
    pub tracker: Arc<TeamTracker>,
    pub policy: EmptyOutputPolicy,
    pub approval_timeout: Duration,
    pub default_max_iterations: u32,
}

impl StrategyContext {
    pub fn team_exec_id(&self) -> &str {
        &self.run_ctx.team_execution_id
    }

    fn member(&self, agent_id: &str) -> Result<&AgentSpec> {
        self.team
            .member(agent_id)
            .ok_or_else(|| EngineError::AgentNotInTeam {
                team_id: self.team.team_id.clone(),
                agent_id: agent_id.to_string(),
            })
    }

    /// Dispatch a member and record it as a child of the team execution
    pub fn start_agent(&self, agent_id: &str, message: &str) -> Result<String> {
        let spec = self.member(agent_id)?;
        let execution_id = self.runner.start(spec, message, &self.run_ctx)?;
        self.tracker.add_child(self.team_exec_id(), &execution_id);
        debug!(
            team_exec_id = %self.team_exec_id(),
            agent_id = %agent_id,
            execution_id = %execution_id,
            "Dispatched team member"
        );
        Ok(execution_id)
    }

    /// Wait for a member run; anything but success fails the team
    pub async fn finish_agent(&self, agent_id: &str, execution_id: &str) -> Result<String> {
        let AgentOutput {
            execution_id: finished_id,
            status,
            error,
            output,
            continuations,
        } = self.runner.finish(execution_id).await?;

        for continuation in &continuations {
            self.tracker.add_child(self.team_exec_id(), continuation);
        }

        if status != ExecutionStatus::Success {
            let detail = error.map(|e| format!(": {}", e)).unwrap_or_default();
            return Err(EngineError::RuntimeError(format!(
                "agent {} ({}) finished with status {}{}",
                agent_id, finished_id, status, detail
            )));
        }
        Ok(output)
    }

    pub async fn run_agent(&self, agent_id: &str, message: &str) -> Result<String> {
        let execution_id = self.start_agent(agent_id, message)?;
        self.finish_agent(agent_id, &execution_id).await
    }

    /// Input for whoever comes after `agent_id`
    pub fn hand_off(&self, agent_id: &str, output: String, previous_input: &str) -> Result<String> {
        if !output.trim().is_empty() {
            return Ok(output);
        }

        match self.policy {
            EmptyOutputPolicy::FallbackToInput => {
                info!(
                    team_exec_id = %self.team_exec_id(),
                    agent_id = %agent_id,
                    "Agent produced no output, passing its input along"
                );
                Ok(previous_input.to_string())
            }
            EmptyOutputPolicy::Fail => Err(EngineError::EmptyOutput(agent_id.to_string())),
        }
    }
}

/// Result of running one topology
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StrategyOutcome {
    /// Agent whose output is `last_output`
    pub last_agent: Option<String>,
    pub last_output: String,

    /// Stopped at an approval gate that was never approved
    pub approval_timed_out: bool,
}

impl StrategyOutcome {
    pub fn finished(last_agent: Option<&str>, last_output: String) -> Self {
        Self {
            last_agent: last_agent.map(str::to_string),
            last_output,
            approval_timed_out: false,
        }
    }

    pub fn timed_out(last_agent: Option<&str>, last_output: String) -> Self {
        Self {
            approval_timed_out: true,
            ..Self::finished(last_agent, last_output)
        }
    }
}

/// Run a topology to completion
pub async fn run(ctx: &StrategyContext, topology: &Topology, message: &str) -> Result<StrategyOutcome> {
    match topology {
        Topology::Composite { groups } => composite::run(ctx, groups, message).await,
        other => run_simple(ctx, other, message).await,
    }
}

/// Any topology that is not itself a composite
pub async fn run_simple(ctx: &StrategyContext, topology: &Topology, message: &str) -> Result<StrategyOutcome> {
    match topology {
        Topology::Sequential { agents } => sequential::run(ctx, agents, message).await,
        Topology::Parallel { agents } => parallel::run(ctx, agents, message).await,
        Topology::Coordinator {
            coordinator,
            workers,
        } => coordinator::run(ctx, coordinator, workers, message).await,
        Topology::GeneratorCritic {
            generator,
            critic,
            max_iterations,
        } => {
            let max_iterations = max_iterations.unwrap_or(ctx.default_max_iterations);
            generator_critic::run(ctx, generator, critic, max_iterations, message).await
        }
        Topology::Hierarchical { lead, edges } => hierarchical::run(ctx, lead, edges, message).await,
        Topology::HumanInLoop {
            agents,
            approval_gates,
            timeout_secs,
        } => {
            let timeout = timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(ctx.approval_timeout);
            human_in_loop::run(ctx, agents, approval_gates, timeout, message).await
        }
        Topology::Composite { .. } => Err(EngineError::InvalidTopology(
            "composite topologies cannot be nested".into(),
        )),
        Topology::Unknown => Err(EngineError::UnknownTopology),
    }
}
