// src/runtime/mod.rs
//! Agent process runtime
//!
//! - **Backend**: argument and output conventions of each agent CLI
//! - **Process Manager**: process-group spawning, signalling and draining
//! - **Execution Engine**: admission, supervision and the terminal record of one run

pub mod backend;
pub mod engine;
pub mod execution;
pub mod process_manager;

pub use backend::{BackendType, UsageData};
pub use engine::{ActiveExecution, ExecutionEngine};
pub use execution::{
    AgentSpec, EntityKind, Execution, ExecutionOutcome, ExecutionRequest, ExecutionStatus,
    OwnerRef, RunOverrides,
};
pub use process_manager::{DrainReport, ProcessManager, SpawnConfig};
