// src/topology/runner.rs
//! The seam between team strategies and the execution engine

use crate::runtime::engine::ExecutionEngine;
use crate::runtime::execution::{
    AgentSpec, EntityKind, ExecutionStatus, OwnerRef, RunOverrides,
};
use crate::utils::errors::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long to wait for a rotation's continuation to appear
const CONTINUATION_WAIT: Duration = Duration::from_secs(15);
const CONTINUATION_POLL: Duration = Duration::from_millis(50);

/// Team context attached to every member run
#[derive(Debug, Clone)]
pub struct TeamRunContext {
    pub team_id: String,
    pub team_execution_id: String,
    pub event_context: Option<Value>,
}

/// Final result of one member run
#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutput {
    /// Execution that produced the output (a continuation after rotation)
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub output: String,

    /// Rotation continuations followed on the way, oldest first
    pub continuations: Vec<String>,
}

#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Start a member run; returns its execution id
    fn start(&self, agent: &AgentSpec, message: &str, ctx: &TeamRunContext) -> Result<String>;

    /// Wait for the run (and any rotation continuations) to finish
    async fn finish(&self, execution_id: &str) -> Result<AgentOutput>;
}

#[async_trait]
impl AgentRunner for ExecutionEngine {
    fn start(&self, agent: &AgentSpec, message: &str, ctx: &TeamRunContext) -> Result<String> {
        let spec = agent
            .clone()
            .with_owner(OwnerRef::new(EntityKind::Team, ctx.team_id.clone()));
        let overrides = RunOverrides {
            team_execution_id: Some(ctx.team_execution_id.clone()),
            event_context: ctx.event_context.clone(),
            ..Default::default()
        };
        self.run(&spec, message, overrides)
    }

    async fn finish(&self, execution_id: &str) -> Result<AgentOutput> {
        let mut current = execution_id.to_string();
        let mut continuations = Vec::new();
        loop {
            let outcome = self.wait(&current).await?;
            if outcome.status != ExecutionStatus::Rotated {
                let output = match self.captured_stdout(&current) {
                    Ok(output) => output,
                    Err(e) => {
                        warn!(execution_id = %current, "Captured output unavailable: {}", e);
                        String::new()
                    }
                };
                return Ok(AgentOutput {
                    execution_id: current,
                    status: outcome.status,
                    error: outcome.error,
                    output,
                    continuations,
                });
            }

            let deadline = Instant::now() + CONTINUATION_WAIT;
            let next = loop {
                if let Some(next) = self.take_successor(&current) {
                    break Some(next);
                }
                if Instant::now() >= deadline {
                    break None;
                }
                tokio::time::sleep(CONTINUATION_POLL).await;
            };

            match next {
                Some(next) => {
                    debug!(execution_id = %current, continuation_id = %next, "Following rotation");
                    continuations.push(next.clone());
                    current = next;
                }
                None => {
                    return Ok(AgentOutput {
                        execution_id: current,
                        status: ExecutionStatus::Rotated,
                        error: Some("rotated without a continuation".into()),
                        output: String::new(),
                        continuations,
                    })
                }
            }
        }
    }
}
