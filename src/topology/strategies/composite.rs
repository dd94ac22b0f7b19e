// src/topology/strategies/composite.rs
//! Ordered groups; each group's last output feeds the next group

use super::{run_simple, StrategyContext, StrategyOutcome};
use crate::topology::types::Topology;
use crate::utils::errors::Result;

pub async fn run(ctx: &StrategyContext, groups: &[Topology], message: &str) -> Result<StrategyOutcome> {
    let mut input = message.to_string();
    let mut outcome = StrategyOutcome::finished(None, String::new());

    for (index, group) in groups.iter().enumerate() {
        outcome = run_simple(ctx, group, &input).await?;
        if outcome.approval_timed_out {
            return Ok(outcome);
        }

        if index + 1 < groups.len() {
            let agent_id = outcome.last_agent.as_deref().unwrap_or(group.kind());
            input = ctx.hand_off(agent_id, outcome.last_output.clone(), &input)?;
        }
    }

    Ok(outcome)
}
