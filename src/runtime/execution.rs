// src/runtime/execution.rs
//! Execution records and run requests

use crate::runtime::backend::{BackendType, UsageData};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Lifecycle status of one agent run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
    Timeout,
    Cancelled,
    Rotated,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Rotated => "rotated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(ExecutionStatus::Running),
            "success" => Some(ExecutionStatus::Success),
            "failed" => Some(ExecutionStatus::Failed),
            "timeout" => Some(ExecutionStatus::Timeout),
            "cancelled" => Some(ExecutionStatus::Cancelled),
            "rotated" => Some(ExecutionStatus::Rotated),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of entity that owns an execution (and is charged for it)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Trigger,
    #[default]
    Agent,
    Team,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Trigger => "trigger",
            EntityKind::Agent => "agent",
            EntityKind::Team => "team",
        }
    }
}

/// Reference to the trigger/agent/team an execution runs for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRef {
    pub kind: EntityKind,
    pub id: String,
}

impl OwnerRef {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self { kind, id: id.into() }
    }
}

/// Static description of an agent: which CLI, which account, which scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub agent_id: String,

    /// Team members are re-owned by their team when they run
    #[serde(default)]
    pub owner: OwnerRef,

    pub backend: BackendType,

    /// Credential account the run is charged to
    #[serde(default)]
    pub account_id: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    /// Directories the agent may read and write
    #[serde(default)]
    pub allowed_dirs: Vec<PathBuf>,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Extra environment for the CLI process
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Per-agent timeout override in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl AgentSpec {
    pub fn new(agent_id: impl Into<String>, backend: BackendType) -> Self {
        let agent_id = agent_id.into();
        Self {
            owner: OwnerRef::new(EntityKind::Agent, agent_id.clone()),
            agent_id,
            backend,
            account_id: None,
            model: None,
            allowed_dirs: vec![],
            working_dir: None,
            env: HashMap::new(),
            timeout_secs: None,
        }
    }

    pub fn with_owner(mut self, owner: OwnerRef) -> Self {
        self.owner = owner;
        self
    }

    /// The budget owner; an unset owner is the agent itself
    pub fn resolved_owner(&self) -> OwnerRef {
        if self.owner.id.is_empty() {
            OwnerRef::new(EntityKind::Agent, self.agent_id.clone())
        } else {
            self.owner.clone()
        }
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_allowed_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.allowed_dirs.push(dir.into());
        self
    }
}

/// Per-run adjustments layered over an [`AgentSpec`]
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    /// Run on this account instead of the agent's
    pub account_id: Option<String>,

    /// Environment merged over the agent's (account credentials, etc.)
    pub env: HashMap<String, String>,

    pub timeout: Option<Duration>,

    /// The task this run is working on, when it differs from the prompt
    /// (continuations carry the root task here)
    pub task: Option<String>,

    pub parent_execution_id: Option<String>,

    pub team_execution_id: Option<String>,

    /// Keep stdin open so [`send_input`] can feed the process
    ///
    /// [`send_input`]: crate::runtime::engine::ExecutionEngine::send_input
    pub interactive: bool,

    /// Opaque context of the event that caused the run
    pub event_context: Option<Value>,
}

/// Everything needed to start one execution
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub agent: AgentSpec,
    pub prompt: String,
    pub overrides: RunOverrides,
}

/// Durable record of one agent run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: String,
    pub owner: OwnerRef,
    pub agent_id: String,
    pub backend: BackendType,
    pub account_id: Option<String>,
    pub prompt: String,

    /// Root task text (equal to the prompt unless this is a continuation)
    pub task: String,

    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub parent_execution_id: Option<String>,
    pub team_execution_id: Option<String>,
    pub usage: Option<UsageData>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Execution {
    /// Create a running record
    pub fn start(execution_id: String, spec: &AgentSpec, prompt: &str, overrides: &RunOverrides) -> Self {
        Self {
            execution_id,
            owner: spec.resolved_owner(),
            agent_id: spec.agent_id.clone(),
            backend: spec.backend,
            account_id: overrides.account_id.clone().or_else(|| spec.account_id.clone()),
            prompt: prompt.to_string(),
            task: overrides.task.clone().unwrap_or_else(|| prompt.to_string()),
            status: ExecutionStatus::Running,
            exit_code: None,
            error: None,
            parent_execution_id: overrides.parent_execution_id.clone(),
            team_execution_id: overrides.team_execution_id.clone(),
            usage: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Apply a terminal status. Returns false (and changes nothing) if the
    /// record is already terminal or `status` is not terminal.
    pub fn finish(&mut self, status: ExecutionStatus, exit_code: Option<i32>, error: Option<String>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }

        self.status = status;
        self.exit_code = exit_code;
        self.error = error;
        self.finished_at = Some(Utc::now());
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Terminal summary delivered to waiters
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl From<&Execution> for ExecutionOutcome {
    fn from(execution: &Execution) -> Self {
        Self {
            execution_id: execution.execution_id.clone(),
            status: execution.status,
            exit_code: execution.exit_code,
            error: execution.error.clone(),
        }
    }
}

/// Output stream of an agent process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

/// Lines captured from an execution, per stream and in arrival order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl CapturedOutput {
    pub fn push(&mut self, stream: LogStream, line: String) {
        match stream {
            LogStream::Stdout => self.stdout.push(line),
            LogStream::Stderr => self.stderr.push(line),
        }
    }

    pub fn stdout_text(&self) -> String {
        self.stdout.join("\n")
    }
}

/// Rate-limit notice observed on an execution's stderr
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSignal {
    pub execution_id: String,
    pub account_id: Option<String>,
    pub backend: BackendType,
    pub line: String,
    pub detected_at: DateTime<Utc>,
    pub cooldown_until: DateTime<Utc>,
}

impl RateLimitSignal {
    pub fn is_cooling_down(&self, now: DateTime<Utc>) -> bool {
        now < self.cooldown_until
    }
}
