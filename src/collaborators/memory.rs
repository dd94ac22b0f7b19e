// src/collaborators/memory.rs
//! In-process collaborator implementations
//!
//! Used by the binary when no external services are wired in, and by the
//! test suites. All state lives behind `parking_lot` locks.

use super::{
    AccountDirectory, AccountInfo, Admission, BudgetGate, ExecutionStore, LogSink, TeamDirectory,
    UsageRecord, UtilizationMonitor, UtilizationWindow,
};
use crate::rotation::events::RotationEvent;
use crate::runtime::backend::BackendType;
use crate::runtime::execution::{CapturedOutput, EntityKind, Execution, LogStream};
use crate::topology::types::{TeamConfig, TeamExecution};
use crate::utils::errors::{EngineError, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Budget gate backed by an explicit deny list
#[derive(Default)]
pub struct MemoryBudget {
    denied: Mutex<HashMap<(EntityKind, String), String>>,
    usage: Mutex<Vec<UsageRecord>>,
}

impl MemoryBudget {
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Deny admission for one owner
    pub fn deny(&self, kind: EntityKind, id: impl Into<String>, reason: impl Into<String>) {
        self.denied.lock().insert((kind, id.into()), reason.into());
    }

    pub fn recorded_usage(&self) -> Vec<UsageRecord> {
        self.usage.lock().clone()
    }
}

impl BudgetGate for MemoryBudget {
    fn check_admission(&self, kind: EntityKind, id: &str) -> Admission {
        match self.denied.lock().get(&(kind, id.to_string())) {
            Some(reason) => Admission::deny(reason.clone()),
            None => Admission::allow(),
        }
    }

    fn record_usage(&self, record: UsageRecord) {
        self.usage.lock().push(record);
    }
}

/// Utilization data set by hand
#[derive(Default)]
pub struct StaticMonitor {
    windows: Mutex<HashMap<String, Vec<UtilizationWindow>>>,
}

impl StaticMonitor {
    pub fn set(&self, account_id: impl Into<String>, windows: Vec<UtilizationWindow>) {
        self.windows.lock().insert(account_id.into(), windows);
    }

    pub fn clear(&self, account_id: &str) {
        self.windows.lock().remove(account_id);
    }
}

impl UtilizationMonitor for StaticMonitor {
    fn utilization_windows(&self, account_id: &str) -> Option<Vec<UtilizationWindow>> {
        self.windows.lock().get(account_id).cloned()
    }
}

/// Fixed account list
#[derive(Default)]
pub struct StaticAccounts {
    accounts: Mutex<Vec<(BackendType, AccountInfo)>>,
    environments: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl StaticAccounts {
    pub fn add(&self, backend: BackendType, account: AccountInfo) {
        self.accounts.lock().push((backend, account));
    }

    pub fn set_environment(&self, account_id: impl Into<String>, env: HashMap<String, String>) {
        self.environments.lock().insert(account_id.into(), env);
    }

    /// Update an account in place; no-op for unknown ids
    pub fn update(&self, account_id: &str, apply: impl FnOnce(&mut AccountInfo)) {
        let mut accounts = self.accounts.lock();
        if let Some((_, account)) = accounts.iter_mut().find(|(_, a)| a.id == account_id) {
            apply(account);
        }
    }
}

impl AccountDirectory for StaticAccounts {
    fn accounts_for_backend(&self, backend: BackendType) -> Vec<AccountInfo> {
        self.accounts
            .lock()
            .iter()
            .filter(|(b, _)| *b == backend)
            .map(|(_, account)| account.clone())
            .collect()
    }

    fn account_environment(&self, account_id: &str) -> HashMap<String, String> {
        self.environments
            .lock()
            .get(account_id)
            .cloned()
            .unwrap_or_default()
    }
}

/// Log sink that keeps everything it receives
#[derive(Default)]
pub struct MemoryLogSink {
    lines: Mutex<Vec<(String, LogStream, String)>>,
    events: Mutex<Vec<(String, String, Value)>>,
}

impl MemoryLogSink {
    pub fn lines_for(&self, execution_id: &str, stream: LogStream) -> Vec<String> {
        self.lines
            .lock()
            .iter()
            .filter(|(id, s, _)| id == execution_id && *s == stream)
            .map(|(_, _, line)| line.clone())
            .collect()
    }

    pub fn events_for(&self, execution_id: &str) -> Vec<(String, Value)> {
        self.events
            .lock()
            .iter()
            .filter(|(id, _, _)| id == execution_id)
            .map(|(_, event_type, payload)| (event_type.clone(), payload.clone()))
            .collect()
    }
}

impl LogSink for MemoryLogSink {
    fn append(&self, execution_id: &str, stream: LogStream, line: &str) {
        self.lines
            .lock()
            .push((execution_id.to_string(), stream, line.to_string()));
    }

    fn broadcast(&self, execution_id: &str, event_type: &str, payload: Value) {
        self.events
            .lock()
            .push((execution_id.to_string(), event_type.to_string(), payload));
    }
}

/// Forwards agent output to `tracing` on the `agent_output` target
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn append(&self, execution_id: &str, stream: LogStream, line: &str) {
        debug!(target: "agent_output", execution_id, stream = stream.as_str(), "{}", line);
    }

    fn broadcast(&self, execution_id: &str, event_type: &str, payload: Value) {
        info!(target: "agent_output", execution_id, event_type, %payload, "execution event");
    }
}

/// Non-durable store
#[derive(Default)]
pub struct MemoryStore {
    executions: Mutex<HashMap<String, Execution>>,
    output: Mutex<HashMap<String, CapturedOutput>>,
    rotation_events: Mutex<Vec<RotationEvent>>,
    team_executions: Mutex<HashMap<String, TeamExecution>>,
}

impl MemoryStore {
    pub fn team_execution(&self, team_exec_id: &str) -> Option<TeamExecution> {
        self.team_executions.lock().get(team_exec_id).cloned()
    }
}

impl ExecutionStore for MemoryStore {
    fn create_execution(&self, execution: &Execution) -> Result<()> {
        self.executions
            .lock()
            .insert(execution.execution_id.clone(), execution.clone());
        Ok(())
    }

    fn update_execution(&self, execution: &Execution) -> Result<()> {
        let mut executions = self.executions.lock();
        match executions.get_mut(&execution.execution_id) {
            Some(existing) => {
                *existing = execution.clone();
                Ok(())
            }
            None => Err(EngineError::ExecutionNotFound(execution.execution_id.clone())),
        }
    }

    fn get_execution(&self, execution_id: &str) -> Result<Option<Execution>> {
        Ok(self.executions.lock().get(execution_id).cloned())
    }

    fn save_output(&self, execution_id: &str, output: &CapturedOutput) -> Result<()> {
        self.output
            .lock()
            .insert(execution_id.to_string(), output.clone());
        Ok(())
    }

    fn load_output(&self, execution_id: &str) -> Result<Option<CapturedOutput>> {
        Ok(self.output.lock().get(execution_id).cloned())
    }

    fn upsert_rotation_event(&self, event: &RotationEvent) -> Result<()> {
        let mut events = self.rotation_events.lock();
        match events.iter_mut().find(|e| e.event_id == event.event_id) {
            Some(existing) => *existing = event.clone(),
            None => events.push(event.clone()),
        }
        Ok(())
    }

    fn list_rotation_events(&self) -> Result<Vec<RotationEvent>> {
        Ok(self.rotation_events.lock().clone())
    }

    fn upsert_team_execution(&self, team_execution: &TeamExecution) -> Result<()> {
        self.team_executions
            .lock()
            .insert(team_execution.team_exec_id.clone(), team_execution.clone());
        Ok(())
    }
}

/// Team definitions held in memory, optionally loaded from YAML
#[derive(Default)]
pub struct StaticTeams {
    teams: Mutex<HashMap<String, TeamConfig>>,
}

impl StaticTeams {
    pub fn insert(&self, team: TeamConfig) {
        self.teams.lock().insert(team.team_id.clone(), team);
    }

    /// Parse a YAML list of team definitions
    pub fn from_yaml(source: &str) -> Result<Self> {
        let teams: Vec<TeamConfig> = serde_yaml::from_str(source)
            .map_err(|e| EngineError::ConfigError(format!("Invalid team definitions: {}", e)))?;

        let directory = Self::default();
        for team in teams {
            directory.insert(team);
        }
        Ok(directory)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            EngineError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let directory = Self::from_yaml(&source)?;
        info!("Loaded {} team definitions from {:?}", directory.len(), path);
        Ok(directory)
    }

    pub fn len(&self) -> usize {
        self.teams.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.teams.lock().is_empty()
    }
}

impl TeamDirectory for StaticTeams {
    fn team(&self, team_id: &str) -> Option<TeamConfig> {
        self.teams.lock().get(team_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::types::Topology;

    #[test]
    fn test_budget_deny_list() {
        let budget = MemoryBudget::allow_all();
        budget.deny(EntityKind::Trigger, "nightly", "monthly cap reached");

        assert!(budget.check_admission(EntityKind::Agent, "nightly").allowed);
        let denied = budget.check_admission(EntityKind::Trigger, "nightly");
        assert!(!denied.allowed);
        assert_eq!(denied.reason.as_deref(), Some("monthly cap reached"));
    }

    #[test]
    fn test_accounts_filtered_by_backend() {
        let accounts = StaticAccounts::default();
        let account = |id: &str| AccountInfo {
            id: id.into(),
            credential_fingerprint: format!("fp-{}", id),
            enabled: true,
            rate_limited: false,
            scheduler_eligible: true,
        };
        accounts.add(BackendType::Claude, account("a"));
        accounts.add(BackendType::Codex, account("b"));
        accounts.update("a", |a| a.rate_limited = true);

        let claude = accounts.accounts_for_backend(BackendType::Claude);
        assert_eq!(claude.len(), 1);
        assert!(claude[0].rate_limited);
        assert!(accounts.account_environment("a").is_empty());
    }

    #[test]
    fn test_teams_from_yaml() {
        let yaml = r#"
- team_id: docs
  members:
    - agent_id: writer
      backend: claude
    - agent_id: editor
      backend: codex
      model: gpt-5
  topology:
    kind: sequential
    agents: [writer, editor]
- team_id: odd
  members: []
  topology:
    kind: swarm
"#;
        let teams = StaticTeams::from_yaml(yaml).unwrap();
        assert_eq!(teams.len(), 2);

        let docs = teams.team("docs").unwrap();
        assert_eq!(docs.members[1].model.as_deref(), Some("gpt-5"));
        assert!(matches!(docs.topology, Topology::Sequential { .. }));
        assert!(matches!(teams.team("odd").unwrap().topology, Topology::Unknown));
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let err = StaticTeams::from_yaml("- team_id: [").err().unwrap();
        assert!(matches!(err, EngineError::ConfigError(_)));
    }
}
