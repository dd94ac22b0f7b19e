// src/lib.rs
//! Conductor execution engine
//!
//! Runs AI-CLI agents (claude, opencode, gemini, codex) as supervised
//! subprocesses and composes them into teams.
//!
//! # Architecture
//!
//! - **runtime**: process groups, agent runs and their terminal records
//! - **rotation**: credential-account rotation with hysteresis
//! - **topology**: team execution strategies and approval gates
//! - **collaborators**: traits for budget, monitoring, accounts, logs and storage
//! - **orchestrator**: the facade that wires everything together
//! - **observability**: tracing and metrics setup
//! - **utils**: configuration, errors and identifiers

pub mod collaborators;
pub mod observability;
pub mod orchestrator;
pub mod rotation;
pub mod runtime;
pub mod topology;
pub mod utils;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use collaborators::Collaborators;
pub use orchestrator::Orchestrator;
pub use runtime::execution::{AgentSpec, ExecutionRequest, ExecutionStatus, RunOverrides};
pub use runtime::BackendType;
pub use topology::{TeamConfig, TeamStatus, Topology};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
