// src/topology/strategies/sequential.rs
//! Each agent's output is the next agent's input

use super::{StrategyContext, StrategyOutcome};
use crate::utils::errors::Result;

pub async fn run(ctx: &StrategyContext, agents: &[String], message: &str) -> Result<StrategyOutcome> {
    let mut input = message.to_string();
    let mut last_output = String::new();

    for (index, agent_id) in agents.iter().enumerate() {
        let output = ctx.run_agent(agent_id, &input).await?;
        if index + 1 < agents.len() {
            input = ctx.hand_off(agent_id, output.clone(), &input)?;
        }
        last_output = output;
    }

    Ok(StrategyOutcome::finished(
        agents.last().map(String::as_str),
        last_output,
    ))
}
