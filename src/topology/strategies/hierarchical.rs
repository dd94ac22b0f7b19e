// src/topology/strategies/hierarchical.rs
//! Depth-first delegation from the lead
//!
//! Nodes run in preorder; each child receives its parent's output. A node
//! reachable through several edges runs once, at its first visit.

use super::{StrategyContext, StrategyOutcome};
use crate::topology::types::DelegationEdge;
use crate::utils::errors::Result;
use std::collections::{HashMap, HashSet};

pub async fn run(
    ctx: &StrategyContext,
    lead: &str,
    edges: &[DelegationEdge],
    message: &str,
) -> Result<StrategyOutcome> {
    let mut delegates: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        delegates
            .entry(edge.from.as_str())
            .or_default()
            .push(edge.to.as_str());
    }

    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack: Vec<(&str, String)> = vec![(lead, message.to_string())];
    let mut outcome = StrategyOutcome::default();

    while let Some((agent_id, input)) = stack.pop() {
        if !visited.insert(agent_id) {
            continue;
        }

        let output = ctx.run_agent(agent_id, &input).await?;

        if let Some(children) = delegates.get(agent_id) {
            let child_input = ctx.hand_off(agent_id, output.clone(), &input)?;
            // Reverse so the first edge is visited first
            for child in children.iter().rev() {
                if !visited.contains(child) {
                    stack.push((*child, child_input.clone()));
                }
            }
        }

        outcome = StrategyOutcome::finished(Some(agent_id), output);
    }

    Ok(outcome)
}
