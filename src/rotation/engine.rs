// src/rotation/engine.rs
//! Account rotation: decide, pick a target, hand off

use crate::collaborators::{AccountDirectory, EtaStatus, ExecutionStore, UtilizationMonitor};
use crate::observability::metrics;
use crate::rotation::events::{RotationEvent, RotationStatus, Urgency};
use crate::rotation::prompt::continuation_prompt;
use crate::rotation::scoring::{score_candidates, ScoredAccount};
use crate::runtime::backend::BackendType;
use crate::runtime::engine::ExecutionEngine;
use crate::runtime::execution::{AgentSpec, ExecutionStatus, RunOverrides};
use crate::utils::config::RotationConfig;
use crate::utils::errors::{EngineError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of a should-rotate check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RotationDecision {
    pub rotate: bool,
    pub reason: String,
    pub utilization_pct: f64,

    /// ETA of the window that triggered the decision
    pub minutes_remaining: Option<f64>,
}

impl RotationDecision {
    fn hold(reason: impl Into<String>, utilization_pct: f64) -> Self {
        Self {
            rotate: false,
            reason: reason.into(),
            utilization_pct,
            minutes_remaining: None,
        }
    }
}

/// Continuation chains: which root each execution belongs to
#[derive(Default)]
struct RotationLedger {
    root_of: HashMap<String, String>,
    completed: HashMap<String, u32>,
}

impl RotationLedger {
    fn root(&self, execution_id: &str) -> String {
        self.root_of
            .get(execution_id)
            .cloned()
            .unwrap_or_else(|| execution_id.to_string())
    }

    fn record(&mut self, root: &str, continuation_id: &str) {
        self.root_of
            .insert(continuation_id.to_string(), root.to_string());
        *self.completed.entry(root.to_string()).or_insert(0) += 1;
    }
}

pub struct RotationEngine {
    config: RotationConfig,
    engine: ExecutionEngine,
    monitor: Arc<dyn UtilizationMonitor>,
    accounts: Arc<dyn AccountDirectory>,
    store: Arc<dyn ExecutionStore>,
    ledger: Mutex<RotationLedger>,
}

impl RotationEngine {
    /// Build the engine, replaying completed rotations from the store
    pub fn new(
        config: RotationConfig,
        engine: ExecutionEngine,
        monitor: Arc<dyn UtilizationMonitor>,
        accounts: Arc<dyn AccountDirectory>,
        store: Arc<dyn ExecutionStore>,
    ) -> Self {
        let mut ledger = RotationLedger::default();
        match store.list_rotation_events() {
            Ok(events) => {
                for event in events.iter().filter(|e| e.status == RotationStatus::Completed) {
                    if let Some(continuation) = &event.continuation_execution_id {
                        ledger.record(&event.root_execution_id, continuation);
                    }
                }
            }
            Err(e) => warn!("Failed to load rotation history: {}", e),
        }

        Self {
            config,
            engine,
            monitor,
            accounts,
            store,
            ledger: Mutex::new(ledger),
        }
    }

    pub fn config(&self) -> &RotationConfig {
        &self.config
    }

    pub fn root_of(&self, execution_id: &str) -> String {
        self.ledger.lock().root(execution_id)
    }

    /// Completed rotations in the execution's chain
    pub fn rotation_count(&self, execution_id: &str) -> u32 {
        let ledger = self.ledger.lock();
        let root = ledger.root(execution_id);
        ledger.completed.get(&root).copied().unwrap_or(0)
    }

    /// Rotate when a window is hot AND projected to run out inside the margin
    pub fn should_rotate(&self, execution_id: &str, account_id: &str) -> RotationDecision {
        let count = self.rotation_count(execution_id);
        if count >= self.config.max_rotations_per_execution {
            return RotationDecision::hold(
                format!(
                    "rotation limit reached ({} of {})",
                    count, self.config.max_rotations_per_execution
                ),
                0.0,
            );
        }

        let windows = match self.monitor.utilization_windows(account_id) {
            Some(windows) if !windows.is_empty() => windows,
            _ => return RotationDecision::hold("no monitoring data for account", 0.0),
        };

        let threshold = self.config.utilization_threshold_pct;
        let margin = self.config.safety_margin_minutes;

        for window in &windows {
            if window.percentage < threshold {
                continue;
            }
            let projected = window
                .eta
                .as_ref()
                .filter(|eta| eta.status == EtaStatus::Projected)
                .and_then(|eta| eta.minutes_remaining);

            if let Some(minutes) = projected.filter(|m| *m < margin) {
                return RotationDecision {
                    rotate: true,
                    reason: format!(
                        "{} utilization {:.1}% >= {:.0}% and projected exhaustion in {:.1} min < {:.0} min",
                        window.window_type, window.percentage, threshold, minutes, margin
                    ),
                    utilization_pct: window.percentage,
                    minutes_remaining: Some(minutes),
                };
            }
        }

        let peak = windows.iter().map(|w| w.percentage).fold(0.0, f64::max);
        RotationDecision::hold(
            format!(
                "peak utilization {:.1}% without projected exhaustion inside {:.0} min",
                peak, margin
            ),
            peak,
        )
    }

    /// Rank replacement accounts for a backend, best first
    pub fn score_accounts(&self, backend: BackendType, exclude_account_id: &str) -> Vec<ScoredAccount> {
        score_candidates(
            self.accounts.accounts_for_backend(backend),
            exclude_account_id,
            |id| {
                self.monitor
                    .utilization_windows(id)
                    .and_then(|windows| windows.iter().map(|w| w.percentage).reduce(f64::max))
            },
            |id| self.engine.account_in_cooldown(id),
        )
    }

    /// Hand a running execution off to a fresh account
    ///
    /// Returns the continuation execution id. Every failure is recorded on
    /// the rotation event and yields `None`.
    pub async fn execute_rotation(
        &self,
        execution_id: &str,
        spec: &AgentSpec,
        task: &str,
        event_context: Option<Value>,
    ) -> Option<String> {
        let Some(source) = self.engine.execution(execution_id).filter(|e| !e.is_terminal()) else {
            debug!(execution_id, "Rotation skipped: execution is no longer running");
            return None;
        };
        let Some(from_account) = source.account_id.clone() else {
            debug!(execution_id, "Rotation skipped: execution has no account");
            return None;
        };

        let decision = self.should_rotate(execution_id, &from_account);
        if !decision.rotate {
            debug!(execution_id, "Rotation no longer warranted: {}", decision.reason);
            return None;
        }

        let recent = match self.engine.tail_stdout(execution_id, self.config.continuation_lines) {
            Ok(lines) => lines,
            Err(e) => {
                warn!(execution_id, "Could not read captured output: {}", e);
                vec![]
            }
        };
        let prompt = continuation_prompt(task, &recent);

        let root = self.root_of(execution_id);
        let mut event = RotationEvent::pending(
            execution_id,
            &root,
            &from_account,
            &decision.reason,
            Urgency::from_minutes_remaining(decision.minutes_remaining, self.config.safety_margin_minutes),
            decision.utilization_pct,
        );
        self.persist(&event);

        let Some(target) = self
            .score_accounts(spec.backend, &from_account)
            .into_iter()
            .next()
        else {
            warn!(execution_id, from_account = %from_account, "No eligible account to rotate to");
            event.skip("no eligible candidate accounts");
            self.persist(&event);
            metrics::rotation(event.status.as_str());
            return None;
        };

        event.to_account = Some(target.account.id.clone());
        info!(
            execution_id,
            from_account = %from_account,
            to_account = %target.account.id,
            urgency = ?event.urgency,
            "Rotating: {}",
            decision.reason
        );

        let overrides = RunOverrides {
            account_id: Some(target.account.id.clone()),
            env: self.accounts.account_environment(&target.account.id),
            task: Some(task.to_string()),
            parent_execution_id: Some(execution_id.to_string()),
            team_execution_id: source.team_execution_id.clone(),
            event_context,
            ..Default::default()
        };

        let continuation = match self.handoff(execution_id, spec, &prompt, overrides).await {
            Ok(continuation) => continuation,
            Err(e) => {
                warn!(execution_id, "Rotation failed: {}", e);
                event.fail(e.to_string());
                self.persist(&event);
                metrics::rotation(event.status.as_str());
                return None;
            }
        };

        self.ledger.lock().record(&root, &continuation);
        event.complete(&target.account.id, &continuation);
        self.persist(&event);
        metrics::rotation(event.status.as_str());

        info!(execution_id, continuation_id = %continuation, "Rotation completed");
        Some(continuation)
    }

    async fn handoff(
        &self,
        execution_id: &str,
        spec: &AgentSpec,
        prompt: &str,
        overrides: RunOverrides,
    ) -> Result<String> {
        // The continuation runs under the same owner; refuse before touching the source
        let admission = self.engine.check_admission(spec);
        if !admission.allowed {
            return Err(EngineError::RotationFailed(format!(
                "continuation not admitted: {}",
                admission.reason.as_deref().unwrap_or("budget limit exceeded")
            )));
        }

        if !self.engine.mark_for_rotation(execution_id) {
            return Err(EngineError::RotationFailed(format!(
                "execution {} finished before the handoff",
                execution_id
            )));
        }

        let sigterm_timeout = self.config.sigterm_timeout();
        if !self
            .engine
            .processes()
            .cancel_graceful(execution_id, sigterm_timeout)
        {
            self.engine.clear_rotation_intent(execution_id);
            return Err(EngineError::SignalFailed(format!(
                "could not terminate execution {}",
                execution_id
            )));
        }

        // SIGKILL lands at sigterm_timeout; allow a little for the reap
        let bound = sigterm_timeout + Duration::from_secs(5);
        match tokio::time::timeout(bound, self.engine.wait(execution_id)).await {
            Ok(Ok(outcome)) if outcome.status != ExecutionStatus::Rotated => {
                return Err(EngineError::RotationFailed(format!(
                    "execution {} finished as {} before the handoff",
                    execution_id, outcome.status
                )));
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(execution_id, "Could not confirm source termination: {}", e),
            Err(_) => warn!(execution_id, "Source execution still finalizing after {:?}", bound),
        }

        let continuation = self.engine.run(spec, prompt, overrides)?;
        match self.engine.execution(&continuation) {
            Some(record) if record.status == ExecutionStatus::Failed => {
                Err(EngineError::RotationFailed(format!(
                    "continuation {} failed to start: {}",
                    continuation,
                    record.error.as_deref().unwrap_or("unknown error")
                )))
            }
            _ => Ok(continuation),
        }
    }

    /// Events for the execution's continuation chain, or all events
    pub fn history(&self, execution_id: Option<&str>) -> Result<Vec<RotationEvent>> {
        let events = self.store.list_rotation_events()?;
        match execution_id {
            Some(id) => {
                let root = self.root_of(id);
                Ok(events
                    .into_iter()
                    .filter(|e| e.root_execution_id == root)
                    .collect())
            }
            None => Ok(events),
        }
    }

    fn persist(&self, event: &RotationEvent) {
        if let Err(e) = self.store.upsert_rotation_event(event) {
            warn!(event_id = %event.event_id, "Failed to persist rotation event: {}", e);
        }
    }
}
