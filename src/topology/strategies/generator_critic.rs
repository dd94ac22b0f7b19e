// src/topology/strategies/generator_critic.rs
//! Generate, critique, revise

use super::{StrategyContext, StrategyOutcome};
use crate::utils::errors::Result;
use tracing::{debug, info};

/// Marker the critic emits to accept a draft
pub const APPROVAL_MARKER: &str = "APPROVED";

pub async fn run(
    ctx: &StrategyContext,
    generator: &str,
    critic: &str,
    max_iterations: u32,
    message: &str,
) -> Result<StrategyOutcome> {
    let mut input = message.to_string();
    let mut draft = String::new();

    for iteration in 1..=max_iterations {
        let output = ctx.run_agent(generator, &input).await?;
        if output.trim().is_empty() {
            debug!(team_exec_id = %ctx.team_exec_id(), iteration, "Generator produced nothing, stopping");
            break;
        }
        draft = output;

        let review = ctx.run_agent(critic, &draft).await?;
        if review.contains(APPROVAL_MARKER) {
            info!(team_exec_id = %ctx.team_exec_id(), iteration, "Critic approved the draft");
            break;
        }

        // An empty review is not an approval
        input = ctx.hand_off(critic, review, &input)?;
    }

    Ok(StrategyOutcome::finished(Some(generator), draft))
}
