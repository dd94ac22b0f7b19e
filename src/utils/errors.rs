// src/utils/errors.rs
//! Engine error type
//!
//! Every fallible library operation returns [`Result`]. Expected negative
//! outcomes (no candidate accounts, no monitoring data, nothing waiting for
//! approval) are plain values and never travel through this type.

use thiserror::Error;

/// Errors produced by the orchestration engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to spawn process: {0}")]
    ProcessSpawnFailed(String),

    #[error("Failed to signal process group: {0}")]
    SignalFailed(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Execution {0} is already registered")]
    DuplicateExecution(String),

    #[error("Execution timed out")]
    ExecutionTimeout,

    #[error("Timed out writing input to execution {0}")]
    InputTimeout(String),

    #[error("Storage error: {0}")]
    StorageFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Team not found: {0}")]
    TeamNotFound(String),

    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    #[error("Unknown topology kind")]
    UnknownTopology,

    #[error("Agent {agent_id} is not a member of team {team_id}")]
    AgentNotInTeam { team_id: String, agent_id: String },

    #[error("Agent {0} produced no output")]
    EmptyOutput(String),

    #[error("Rotation failed: {0}")]
    RotationFailed(String),

    #[error("Runtime error: {0}")]
    RuntimeError(String),
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::StorageFailed(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::StorageFailed(format!("Serialization error: {}", e))
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(e: config::ConfigError) -> Self {
        EngineError::ConfigError(e.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::RuntimeError(format!("I/O error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = EngineError::AgentNotInTeam {
            team_id: "team-1".into(),
            agent_id: "writer".into(),
        };
        assert_eq!(err.to_string(), "Agent writer is not a member of team team-1");

        let err = EngineError::ProcessSpawnFailed("No such file or directory".into());
        assert!(err.to_string().contains("No such file"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: EngineError = io.into();
        assert!(matches!(err, EngineError::RuntimeError(_)));
    }
}
