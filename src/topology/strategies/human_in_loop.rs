// src/topology/strategies/human_in_loop.rs
//! Sequential, pausing for approval before each gated agent

use super::{StrategyContext, StrategyOutcome};
use crate::utils::errors::Result;
use std::time::Duration;

pub async fn run(
    ctx: &StrategyContext,
    agents: &[String],
    approval_gates: &[String],
    timeout: Duration,
    message: &str,
) -> Result<StrategyOutcome> {
    let mut input = message.to_string();
    let mut outcome = StrategyOutcome::finished(None, String::new());

    for (index, agent_id) in agents.iter().enumerate() {
        if approval_gates.contains(agent_id)
            && !ctx
                .tracker
                .await_approval(ctx.team_exec_id(), agent_id, timeout)
                .await
        {
            return Ok(StrategyOutcome::timed_out(
                outcome.last_agent.as_deref(),
                outcome.last_output,
            ));
        }

        let output = ctx.run_agent(agent_id, &input).await?;
        if index + 1 < agents.len() {
            input = ctx.hand_off(agent_id, output.clone(), &input)?;
        }
        outcome = StrategyOutcome::finished(Some(agent_id), output);
    }

    Ok(outcome)
}
