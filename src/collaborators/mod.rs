// src/collaborators/mod.rs
//! Interfaces to the systems the engine consults but does not own
//!
//! - **BudgetGate**: yes/no admission before a run, usage bookkeeping after
//! - **UtilizationMonitor**: per-account rate-limit windows with ETAs
//! - **AccountDirectory**: credential accounts per backend
//! - **LogSink**: live output lines and lifecycle broadcasts
//! - **ExecutionStore**: persistence of executions, output, audit rows
//! - **TeamDirectory**: read-only team definitions
//!
//! `memory` ships in-process implementations of all of them; `sqlite`
//! provides a durable [`ExecutionStore`].

pub mod memory;
pub mod sqlite;

use crate::rotation::events::RotationEvent;
use crate::runtime::backend::{BackendType, UsageData};
use crate::runtime::execution::{CapturedOutput, EntityKind, Execution, LogStream, OwnerRef};
use crate::topology::types::{TeamConfig, TeamExecution};
use crate::utils::errors::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub use memory::{
    MemoryBudget, MemoryLogSink, MemoryStore, StaticAccounts, StaticMonitor, StaticTeams,
    TracingLogSink,
};
pub use sqlite::SqliteStore;

/// Result of a budget admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl Admission {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Usage charged to an owner after a successful run
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub execution_id: String,
    pub owner: OwnerRef,
    pub account_id: Option<String>,
    pub backend: BackendType,
    pub usage: UsageData,
}

pub trait BudgetGate: Send + Sync {
    fn check_admission(&self, kind: EntityKind, id: &str) -> Admission;

    fn record_usage(&self, record: UsageRecord);
}

/// Confidence of a utilization ETA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EtaStatus {
    /// Based on a fitted consumption rate
    Projected,
    /// Extrapolated from too few samples
    Extrapolated,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Eta {
    pub status: EtaStatus,
    pub minutes_remaining: Option<f64>,
}

/// A single rate-limit window (e.g. the 5-hour window) for an account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilizationWindow {
    pub window_type: String,
    pub percentage: f64,
    #[serde(default)]
    pub eta: Option<Eta>,
}

pub trait UtilizationMonitor: Send + Sync {
    /// `None` when the account has no monitoring data
    fn utilization_windows(&self, account_id: &str) -> Option<Vec<UtilizationWindow>>;
}

/// A credential account usable by a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub id: String,

    /// Accounts with the same fingerprint share an upstream quota
    pub credential_fingerprint: String,

    pub enabled: bool,
    pub rate_limited: bool,
    pub scheduler_eligible: bool,
}

pub trait AccountDirectory: Send + Sync {
    fn accounts_for_backend(&self, backend: BackendType) -> Vec<AccountInfo>;

    /// Environment that points a CLI at this account's credentials
    fn account_environment(&self, account_id: &str) -> HashMap<String, String>;
}

pub trait LogSink: Send + Sync {
    fn append(&self, execution_id: &str, stream: LogStream, line: &str);

    fn broadcast(&self, execution_id: &str, event_type: &str, payload: Value);
}

pub trait ExecutionStore: Send + Sync {
    fn create_execution(&self, execution: &Execution) -> Result<()>;

    fn update_execution(&self, execution: &Execution) -> Result<()>;

    fn get_execution(&self, execution_id: &str) -> Result<Option<Execution>>;

    fn save_output(&self, execution_id: &str, output: &CapturedOutput) -> Result<()>;

    fn load_output(&self, execution_id: &str) -> Result<Option<CapturedOutput>>;

    fn upsert_rotation_event(&self, event: &RotationEvent) -> Result<()>;

    /// All rotation events in creation order
    fn list_rotation_events(&self) -> Result<Vec<RotationEvent>>;

    fn upsert_team_execution(&self, team_execution: &TeamExecution) -> Result<()>;
}

pub trait TeamDirectory: Send + Sync {
    fn team(&self, team_id: &str) -> Option<TeamConfig>;
}

/// Every collaborator the engine needs, shared by `Arc`
#[derive(Clone)]
pub struct Collaborators {
    pub budget: Arc<dyn BudgetGate>,
    pub monitor: Arc<dyn UtilizationMonitor>,
    pub accounts: Arc<dyn AccountDirectory>,
    pub sink: Arc<dyn LogSink>,
    pub store: Arc<dyn ExecutionStore>,
    pub teams: Arc<dyn TeamDirectory>,
}

impl Collaborators {
    /// Allow-all budget, no monitoring data, no accounts, no teams
    pub fn in_memory() -> Self {
        Self {
            budget: Arc::new(MemoryBudget::allow_all()),
            monitor: Arc::new(StaticMonitor::default()),
            accounts: Arc::new(StaticAccounts::default()),
            sink: Arc::new(TracingLogSink),
            store: Arc::new(MemoryStore::default()),
            teams: Arc::new(StaticTeams::default()),
        }
    }
}
