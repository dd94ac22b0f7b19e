// src/topology/strategies/coordinator.rs
//! Coordinator first, then its output to all workers in parallel

use super::{parallel, StrategyContext, StrategyOutcome};
use crate::utils::errors::Result;

pub async fn run(
    ctx: &StrategyContext,
    coordinator: &str,
    workers: &[String],
    message: &str,
) -> Result<StrategyOutcome> {
    let plan = ctx.run_agent(coordinator, message).await?;
    let shared = ctx.hand_off(coordinator, plan, message)?;
    parallel::run(ctx, workers, &shared).await
}
