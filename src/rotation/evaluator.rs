// src/rotation/evaluator.rs
//! Periodic rotation evaluator
//!
//! Polls every active execution that runs on an account and only dispatches
//! a rotation after `hysteresis_threshold` consecutive positive decisions.
//! One poll cycle runs at a time; missed ticks are skipped.

use crate::observability::metrics;
use crate::rotation::engine::RotationEngine;
use crate::runtime::engine::{ActiveExecution, ExecutionEngine};
use crate::utils::config::EvaluatorConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Per-execution hysteresis state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationState {
    pub consecutive_rotate_polls: u32,
    pub last_evaluated: DateTime<Utc>,
}

impl EvaluationState {
    pub fn new() -> Self {
        Self {
            consecutive_rotate_polls: 0,
            last_evaluated: Utc::now(),
        }
    }

    /// Feed one poll result; true when a rotation should be dispatched
    pub fn observe(&mut self, rotate: bool, threshold: u32) -> bool {
        self.last_evaluated = Utc::now();
        if !rotate {
            self.consecutive_rotate_polls = 0;
            return false;
        }

        self.consecutive_rotate_polls += 1;
        if self.consecutive_rotate_polls >= threshold.max(1) {
            self.consecutive_rotate_polls = 0;
            return true;
        }
        false
    }
}

impl Default for EvaluationState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct EvaluatorStats {
    polls_completed: u64,
    last_poll_at: Option<DateTime<Utc>>,
    rotations_dispatched: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackedExecution {
    pub execution_id: String,
    pub consecutive_rotate_polls: u32,
    pub last_evaluated: DateTime<Utc>,
}

/// Evaluator diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct EvaluatorStatus {
    pub running: bool,
    pub interval_secs: u64,
    pub hysteresis_threshold: u32,
    pub polls_completed: u64,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub rotations_dispatched: u64,
    pub in_flight: usize,
    pub tracked: Vec<TrackedExecution>,
}

pub struct RotationEvaluator {
    config: EvaluatorConfig,
    engine: ExecutionEngine,
    rotation: Arc<RotationEngine>,
    state: Mutex<HashMap<String, EvaluationState>>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    stats: Mutex<EvaluatorStats>,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl RotationEvaluator {
    pub fn new(config: EvaluatorConfig, engine: ExecutionEngine, rotation: Arc<RotationEngine>) -> Self {
        Self {
            config,
            engine,
            rotation,
            state: Mutex::new(HashMap::new()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            stats: Mutex::new(EvaluatorStats::default()),
            shutdown: Mutex::new(None),
        }
    }

    /// Start the periodic job; false if it is already running
    pub fn start(self: &Arc<Self>) -> bool {
        let token = {
            let mut shutdown = self.shutdown.lock();
            if shutdown.is_some() {
                warn!("Rotation evaluator already running");
                return false;
            }
            let token = CancellationToken::new();
            *shutdown = Some(token.clone());
            token
        };

        let evaluator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(evaluator.config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // the first tick completes immediately
            ticker.tick().await;

            info!(
                "Rotation evaluator started (every {:?}, threshold {})",
                evaluator.config.interval(),
                evaluator.config.hysteresis_threshold
            );

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let cycle = Arc::clone(&evaluator);
                        if let Err(e) = tokio::spawn(async move { cycle.poll_once() }).await {
                            error!("Rotation evaluator cycle panicked: {}", e);
                        }
                    }
                }
            }

            info!("Rotation evaluator stopped");
        });

        true
    }

    /// Stop the periodic job; false if it was not running
    pub fn stop(&self) -> bool {
        match self.shutdown.lock().take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.lock().is_some()
    }

    /// Run one evaluation cycle; returns the number of rotations dispatched
    pub fn poll_once(self: &Arc<Self>) -> usize {
        metrics::evaluator_poll();
        let active = self.engine.active_executions();
        let active_ids: HashSet<String> = active.iter().map(|a| a.execution_id.clone()).collect();
        let threshold = self.config.hysteresis_threshold;

        let mut dispatched = 0;
        for execution in active {
            let Some(account_id) = execution.account_id.as_deref() else {
                continue;
            };
            if self.in_flight.lock().contains(&execution.execution_id) {
                continue;
            }

            // A faulty collaborator for one account must not end the cycle
            let checked = panic::catch_unwind(AssertUnwindSafe(|| {
                self.rotation.should_rotate(&execution.execution_id, account_id)
            }));
            let decision = match checked {
                Ok(decision) => decision,
                Err(cause) => {
                    error!(
                        execution_id = %execution.execution_id,
                        account_id,
                        "Rotation check panicked: {}",
                        panic_message(cause.as_ref())
                    );
                    continue;
                }
            };
            let fire = self
                .state
                .lock()
                .entry(execution.execution_id.clone())
                .or_default()
                .observe(decision.rotate, threshold);

            if decision.rotate {
                debug!(
                    execution_id = %execution.execution_id,
                    "Rotation condition holds: {}",
                    decision.reason
                );
            }

            if fire {
                self.dispatch(execution);
                dispatched += 1;
            }
        }

        self.state.lock().retain(|id, _| active_ids.contains(id));

        let mut stats = self.stats.lock();
        stats.polls_completed += 1;
        stats.last_poll_at = Some(Utc::now());
        stats.rotations_dispatched += dispatched as u64;
        dispatched
    }

    fn dispatch(&self, execution: ActiveExecution) {
        let execution_id = execution.execution_id.clone();
        self.in_flight.lock().insert(execution_id.clone());
        info!(execution_id = %execution_id, "Dispatching rotation");

        let rotation = Arc::clone(&self.rotation);
        let in_flight = Arc::clone(&self.in_flight);
        tokio::spawn(async move {
            let id = execution.execution_id.clone();
            let handoff = tokio::spawn(async move {
                rotation
                    .execute_rotation(&execution.execution_id, &execution.spec, &execution.task, None)
                    .await
            });

            match handoff.await {
                Ok(Some(continuation)) => {
                    debug!(execution_id = %id, continuation_id = %continuation, "Rotation dispatched")
                }
                Ok(None) => debug!(execution_id = %id, "Rotation did not produce a continuation"),
                Err(e) => error!(execution_id = %id, "Rotation task panicked: {}", e),
            }
            in_flight.lock().remove(&id);
        });
    }

    pub fn status(&self) -> EvaluatorStatus {
        let mut tracked: Vec<TrackedExecution> = self
            .state
            .lock()
            .iter()
            .map(|(id, state)| TrackedExecution {
                execution_id: id.clone(),
                consecutive_rotate_polls: state.consecutive_rotate_polls,
                last_evaluated: state.last_evaluated,
            })
            .collect();
        tracked.sort_by(|a, b| a.execution_id.cmp(&b.execution_id));

        let in_flight = self.in_flight.lock().len();
        let running = self.is_running();
        let stats = self.stats.lock();

        EvaluatorStatus {
            running,
            interval_secs: self.config.interval_secs,
            hysteresis_threshold: self.config.hysteresis_threshold,
            polls_completed: stats.polls_completed,
            last_poll_at: stats.last_poll_at,
            rotations_dispatched: stats.rotations_dispatched,
            in_flight,
            tracked,
        }
    }
}

fn panic_message(cause: &(dyn Any + Send)) -> &str {
    cause
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| cause.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
