// src/topology/strategies/parallel.rs
//! Fan the same message out to every agent and join

use super::{StrategyContext, StrategyOutcome};
use crate::utils::errors::Result;
use futures::future::join_all;

pub async fn run(ctx: &StrategyContext, agents: &[String], message: &str) -> Result<StrategyOutcome> {
    // Start everything before waiting on anything
    let mut started = Vec::with_capacity(agents.len());
    for agent_id in agents {
        started.push((agent_id.as_str(), ctx.start_agent(agent_id, message)?));
    }

    let results = join_all(
        started
            .iter()
            .map(|(agent_id, execution_id)| ctx.finish_agent(agent_id, execution_id)),
    )
    .await;

    let mut last_output = String::new();
    for result in results {
        last_output = result?;
    }

    Ok(StrategyOutcome::finished(
        agents.last().map(String::as_str),
        last_output,
    ))
}
