// src/topology/mod.rs
//! Team execution
//!
//! A team composes member runs into one of seven topologies:
//!
//! - **sequential**: each output feeds the next agent
//! - **parallel**: same message to everyone, joined
//! - **coordinator**: coordinator output fans out to workers
//! - **generator_critic**: revise until the critic says `APPROVED`
//! - **hierarchical**: depth-first delegation from a lead
//! - **human_in_loop**: sequential with approval gates
//! - **composite**: ordered groups of the above

pub mod engine;
pub mod runner;
pub mod strategies;
pub mod tracker;
pub mod types;

pub use engine::TopologyEngine;
pub use runner::{AgentOutput, AgentRunner, TeamRunContext};
pub use tracker::TeamTracker;
pub use types::{DelegationEdge, EmptyOutputPolicy, TeamConfig, TeamExecution, TeamStatus, Topology};
