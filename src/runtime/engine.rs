// src/runtime/engine.rs
//! Execution engine: the lifecycle of one agent run
//!
//! ```text
//! run() ──► admission ──► spawn (own pgid) ──► register ──► return id
//!                                                 │
//!                        ┌────────────────────────┴──────────────┐
//!                  stdout pump                             stderr pump
//!              (capture + sink)                (capture + sink + rate-limit scan)
//!                        └────────────────────────┬──────────────┘
//!                                         wait / timeout
//!                                                 │
//!                                             finalize
//!                         (status, usage, persist, broadcast, notify waiters)
//! ```
//!
//! Terminal status precedence: rotation handoff (once its signal landed),
//! cancellation, timeout, then the exit code.

use crate::collaborators::{Admission, BudgetGate, ExecutionStore, LogSink, UsageRecord};
use crate::observability::metrics;
use crate::runtime::execution::{
    AgentSpec, CapturedOutput, Execution, ExecutionOutcome, ExecutionStatus, LogStream,
    RateLimitSignal, RunOverrides,
};
use crate::runtime::process_manager::{ProcessManager, SpawnConfig, StdinMode};
use crate::utils::config::RuntimeConfig;
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::{new_id, EXECUTION_PREFIX};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use std::os::unix::process::ExitStatusExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Extra slack a waiter allows beyond the run's own timeout
const WAIT_SLACK: Duration = Duration::from_secs(5);

/// How long an unclaimed parent -> continuation link is kept, in seconds
const SUCCESSOR_RETENTION_SECS: i64 = 600;

/// In-flight state of one execution
struct LiveExecution {
    record: Mutex<Execution>,
    spec: AgentSpec,
    output: Mutex<CapturedOutput>,

    /// Status to report if the process is terminated on purpose
    intent: Mutex<Option<ExecutionStatus>>,

    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    done: watch::Sender<Option<ExecutionOutcome>>,
    timeout: Duration,
    started: Instant,
}

/// A running execution as seen by the rotation layer
#[derive(Debug, Clone)]
pub struct ActiveExecution {
    pub execution_id: String,
    pub account_id: Option<String>,
    pub spec: AgentSpec,
    pub task: String,
}

/// Spawns and supervises agent CLI processes
#[derive(Clone)]
pub struct ExecutionEngine {
    config: Arc<RuntimeConfig>,
    processes: ProcessManager,
    budget: Arc<dyn BudgetGate>,
    sink: Arc<dyn LogSink>,
    store: Arc<dyn ExecutionStore>,
    live: Arc<DashMap<String, Arc<LiveExecution>>>,
    rate_limits: Arc<DashMap<String, RateLimitSignal>>,

    /// parent execution id -> (continuation execution id, linked at)
    successors: Arc<DashMap<String, (String, DateTime<Utc>)>>,
}

impl ExecutionEngine {
    pub fn new(
        config: RuntimeConfig,
        processes: ProcessManager,
        budget: Arc<dyn BudgetGate>,
        sink: Arc<dyn LogSink>,
        store: Arc<dyn ExecutionStore>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            processes,
            budget,
            sink,
            store,
            live: Arc::new(DashMap::new()),
            rate_limits: Arc::new(DashMap::new()),
            successors: Arc::new(DashMap::new()),
        }
    }

    pub fn processes(&self) -> &ProcessManager {
        &self.processes
    }

    /// Start an agent run and return its execution id
    ///
    /// Returns once the process is registered; output streaming, timeout and
    /// finalization happen on background tasks. Admission denial and spawn
    /// failures still yield an id, for an execution that is already `failed`.
    pub fn run(&self, spec: &AgentSpec, prompt: &str, overrides: RunOverrides) -> Result<String> {
        let execution_id = new_id(EXECUTION_PREFIX);
        let mut record = Execution::start(execution_id.clone(), spec, prompt, &overrides);
        if let Some(parent) = &overrides.parent_execution_id {
            self.link_successor(parent, &execution_id);
        }

        let admission = self.check_admission(spec);
        if !admission.allowed {
            let reason = match admission.reason {
                Some(reason) => format!("budget limit exceeded: {}", reason),
                None => "budget limit exceeded".to_string(),
            };
            warn!(execution_id = %execution_id, owner = %record.owner.id, "Admission denied: {}", reason);
            record.finish(ExecutionStatus::Failed, None, Some(reason));
            self.persist_new(&record);
            self.announce(&record, Duration::ZERO);
            return Ok(execution_id);
        }

        self.persist_new(&record);

        let spawn = self.spawn_config(spec, prompt, &overrides);
        let mut child = match self.processes.spawn(&spawn) {
            Ok(child) => child,
            Err(e) => {
                error!(execution_id = %execution_id, "Failed to launch {}: {}", spec.backend, e);
                self.fail_before_start(record, e.to_string());
                return Ok(execution_id);
            }
        };

        if let Err(e) = self.processes.register(&execution_id, &child) {
            error!(execution_id = %execution_id, "Failed to register process: {}", e);
            let _ = child.start_kill();
            self.fail_before_start(record, e.to_string());
            return Ok(execution_id);
        }

        let timeout = overrides
            .timeout
            .or_else(|| spec.timeout_secs.map(Duration::from_secs))
            .unwrap_or_else(|| self.config.execution_timeout());

        let (done, _) = watch::channel(None);
        let live = Arc::new(LiveExecution {
            record: Mutex::new(record),
            spec: spec.clone(),
            output: Mutex::new(CapturedOutput::default()),
            intent: Mutex::new(None),
            stdin: tokio::sync::Mutex::new(child.stdin.take()),
            done,
            timeout,
            started: Instant::now(),
        });
        self.live.insert(execution_id.clone(), Arc::clone(&live));

        metrics::execution_started(spec.backend);
        info!(
            execution_id = %execution_id,
            agent_id = %spec.agent_id,
            backend = %spec.backend,
            "Execution started (timeout {:?})",
            timeout
        );

        tokio::spawn(self.clone().supervise(live, child));
        Ok(execution_id)
    }

    fn spawn_config(&self, spec: &AgentSpec, prompt: &str, overrides: &RunOverrides) -> SpawnConfig {
        let mut config = SpawnConfig::new(self.config.binary_for(spec.backend));
        config.args = spec
            .backend
            .build_args(prompt, spec.model.as_deref(), &spec.allowed_dirs);
        config.work_dir = spec
            .working_dir
            .clone()
            .or_else(|| spec.backend.default_working_dir(&spec.allowed_dirs));

        let mut env: Vec<(String, String)> = spec.env.clone().into_iter().collect();
        env.extend(overrides.env.clone());
        config.env_vars = env;

        config.stdin = if overrides.interactive {
            StdinMode::Piped
        } else {
            StdinMode::Null
        };
        config
    }

    fn fail_before_start(&self, mut record: Execution, error: String) {
        record.finish(ExecutionStatus::Failed, None, Some(error));
        self.persist_update(&record);
        metrics::execution_finished(record.backend, record.status, Duration::ZERO);
        self.announce(&record, Duration::ZERO);
    }

    async fn supervise(self, live: Arc<LiveExecution>, mut child: Child) {
        let execution_id = live.record.lock().execution_id.clone();

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(self.clone().pump(Arc::clone(&live), LogStream::Stdout, stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(self.clone().pump(Arc::clone(&live), LogStream::Stderr, stderr)));
        }

        let mut timed_out = false;
        let mut wait_error = None;
        let exit_code = match tokio::time::timeout(live.timeout, child.wait()).await {
            Ok(Ok(status)) => status.code().or_else(|| status.signal().map(|s| 128 + s)),
            Ok(Err(e)) => {
                error!(execution_id = %execution_id, "Failed to wait for process: {}", e);
                wait_error = Some(format!("failed to wait for process: {}", e));
                None
            }
            Err(_) => {
                warn!(execution_id = %execution_id, "Execution exceeded {:?}, killing process group", live.timeout);
                timed_out = true;
                if !self.processes.kill_group(&execution_id) {
                    let _ = child.start_kill();
                }
                match tokio::time::timeout(self.config.stream_drain_grace(), child.wait()).await {
                    Ok(Ok(status)) => status.code().or_else(|| status.signal().map(|s| 128 + s)),
                    _ => None,
                }
            }
        };
        self.processes.mark_exited(&execution_id);

        let grace = self.config.stream_drain_grace();
        for reader in readers {
            let abort = reader.abort_handle();
            if tokio::time::timeout(grace, reader).await.is_err() {
                debug!(execution_id = %execution_id, "Stream reader outlived drain grace, aborting");
                abort.abort();
            }
        }

        self.finalize(&live, exit_code, timed_out, wait_error);
    }

    async fn pump<R>(self, live: Arc<LiveExecution>, stream: LogStream, reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let execution_id = live.record.lock().execution_id.clone();
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(&['\r', '\n'][..])
                        .to_string();
                    self.on_line(&live, &execution_id, stream, line);
                }
                Err(e) => {
                    warn!(execution_id = %execution_id, stream = stream.as_str(), "Read error: {}", e);
                    break;
                }
            }
        }
    }

    fn on_line(&self, live: &LiveExecution, execution_id: &str, stream: LogStream, line: String) {
        self.sink.append(execution_id, stream, &line);

        if stream == LogStream::Stderr {
            if let Some(hit) = live.spec.backend.detect_rate_limit(&line) {
                self.record_rate_limit(live, execution_id, &line, hit.retry_after);
            }
        }

        live.output.lock().push(stream, line);
    }

    fn record_rate_limit(
        &self,
        live: &LiveExecution,
        execution_id: &str,
        line: &str,
        retry_after: Option<Duration>,
    ) {
        let account_id = live.record.lock().account_id.clone();
        let cooldown = retry_after.unwrap_or_else(|| self.config.rate_limit_cooldown());
        let now = Utc::now();
        let cooldown_until = now
            + chrono::Duration::from_std(cooldown)
                .unwrap_or_else(|_| chrono::Duration::seconds(self.config.rate_limit_cooldown_secs as i64));

        warn!(
            execution_id,
            account_id = account_id.as_deref().unwrap_or("-"),
            backend = %live.spec.backend,
            "Rate limit detected, cooling down for {:?}",
            cooldown
        );
        metrics::rate_limit_detected(live.spec.backend);

        self.prune_rate_limits();
        self.rate_limits.insert(
            execution_id.to_string(),
            RateLimitSignal {
                execution_id: execution_id.to_string(),
                account_id: account_id.clone(),
                backend: live.spec.backend,
                line: line.to_string(),
                detected_at: now,
                cooldown_until,
            },
        );

        self.sink.broadcast(
            execution_id,
            "rate_limit_detected",
            json!({
                "account_id": account_id,
                "backend": live.spec.backend.as_str(),
                "cooldown_until": cooldown_until.to_rfc3339(),
            }),
        );
    }

    fn finalize(
        &self,
        live: &LiveExecution,
        exit_code: Option<i32>,
        timed_out: bool,
        wait_error: Option<String>,
    ) {
        let execution_id = live.record.lock().execution_id.clone();
        // An intent only names the termination it asked for; a process that
        // exited on its own keeps its real status
        let requested = *live.intent.lock();
        let intent = requested.filter(|_| self.processes.cancel_delivered(&execution_id));
        let cancelled = self.processes.is_cancelled(&execution_id);

        let (status, error) = match (intent, cancelled, timed_out, wait_error, exit_code) {
            (Some(status), _, _, _, _) => (status, None),
            (None, true, _, _, _) => (ExecutionStatus::Cancelled, None),
            (None, false, true, _, _) => (
                ExecutionStatus::Timeout,
                Some(format!("execution exceeded {:?}", live.timeout)),
            ),
            (None, false, false, Some(e), _) => (ExecutionStatus::Failed, Some(e)),
            (None, false, false, None, Some(0)) => (ExecutionStatus::Success, None),
            (None, false, false, None, Some(code)) => {
                (ExecutionStatus::Failed, Some(format!("exit code {}", code)))
            }
            (None, false, false, None, None) => {
                (ExecutionStatus::Failed, Some("process exited without a status".to_string()))
            }
        };

        let output = live.output.lock().clone();
        let usage = match status {
            ExecutionStatus::Success => live.spec.backend.extract_usage(&output.stdout),
            _ => None,
        };

        if let Err(e) = self.store.save_output(&execution_id, &output) {
            warn!(execution_id = %execution_id, "Failed to persist output: {}", e);
        }

        let snapshot = {
            let mut record = live.record.lock();
            if record.finish(status, exit_code, error) {
                record.usage = usage.clone();
            }
            record.clone()
        };

        if let Some(usage) = usage {
            self.budget.record_usage(UsageRecord {
                execution_id: execution_id.clone(),
                owner: snapshot.owner.clone(),
                account_id: snapshot.account_id.clone(),
                backend: snapshot.backend,
                usage,
            });
        }

        self.persist_update(&snapshot);
        let elapsed = live.started.elapsed();
        metrics::execution_finished(snapshot.backend, snapshot.status, elapsed);
        self.announce(&snapshot, elapsed);

        live.done.send_replace(Some(ExecutionOutcome::from(&snapshot)));
        self.live.remove(&execution_id);
        self.processes.cleanup(&execution_id);
    }

    fn announce(&self, record: &Execution, elapsed: Duration) {
        info!(
            execution_id = %record.execution_id,
            status = %record.status,
            exit_code = ?record.exit_code,
            "Execution finished in {:?}",
            elapsed
        );
        self.sink.broadcast(
            &record.execution_id,
            "execution_completed",
            json!({
                "status": record.status.as_str(),
                "exit_code": record.exit_code,
                "error": record.error,
                "duration_ms": elapsed.as_millis() as u64,
            }),
        );
    }

    fn persist_new(&self, record: &Execution) {
        if let Err(e) = self.store.create_execution(record) {
            warn!(execution_id = %record.execution_id, "Failed to persist execution: {}", e);
        }
    }

    fn persist_update(&self, record: &Execution) {
        if let Err(e) = self.store.update_execution(record) {
            warn!(execution_id = %record.execution_id, "Failed to update execution: {}", e);
        }
    }

    fn live(&self, execution_id: &str) -> Option<Arc<LiveExecution>> {
        self.live.get(execution_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Captured stdout, from the live buffer while running, else from the store
    pub fn captured_stdout(&self, execution_id: &str) -> Result<String> {
        if let Some(live) = self.live(execution_id) {
            return Ok(live.output.lock().stdout_text());
        }

        self.store
            .load_output(execution_id)?
            .map(|output| output.stdout_text())
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))
    }

    /// Last `n` captured stdout lines
    pub fn tail_stdout(&self, execution_id: &str, n: usize) -> Result<Vec<String>> {
        let lines = match self.live(execution_id) {
            Some(live) => live.output.lock().stdout.clone(),
            None => self
                .store
                .load_output(execution_id)?
                .map(|output| output.stdout)
                .unwrap_or_default(),
        };
        let skip = lines.len().saturating_sub(n);
        Ok(lines.into_iter().skip(skip).collect())
    }

    /// Current record: live while running, else persisted
    pub fn execution(&self, execution_id: &str) -> Option<Execution> {
        if let Some(live) = self.live(execution_id) {
            return Some(live.record.lock().clone());
        }
        match self.store.get_execution(execution_id) {
            Ok(record) => record,
            Err(e) => {
                warn!(execution_id, "Failed to load execution: {}", e);
                None
            }
        }
    }

    /// Wait for the terminal outcome, bounded by the run's own timeout
    pub async fn wait(&self, execution_id: &str) -> Result<ExecutionOutcome> {
        let Some(live) = self.live(execution_id) else {
            return self.stored_outcome(execution_id);
        };

        let mut rx = live.done.subscribe();
        let bound = live.timeout + self.config.sigterm_timeout() + self.config.stream_drain_grace() * 2 + WAIT_SLACK;
        drop(live);

        let waited = async {
            loop {
                let current = rx.borrow_and_update().clone();
                if let Some(outcome) = current {
                    return Some(outcome);
                }
                if rx.changed().await.is_err() {
                    return rx.borrow().clone();
                }
            }
        };

        match tokio::time::timeout(bound, waited).await {
            Ok(Some(outcome)) => Ok(outcome),
            Ok(None) => self.stored_outcome(execution_id),
            Err(_) => Err(EngineError::ExecutionTimeout),
        }
    }

    fn stored_outcome(&self, execution_id: &str) -> Result<ExecutionOutcome> {
        match self.store.get_execution(execution_id)? {
            Some(record) if record.is_terminal() => Ok(ExecutionOutcome::from(&record)),
            Some(_) => Err(EngineError::RuntimeError(format!(
                "execution {} is not tracked by this engine",
                execution_id
            ))),
            None => Err(EngineError::ExecutionNotFound(execution_id.to_string())),
        }
    }

    /// Running executions with their account and spec
    pub fn active_executions(&self) -> Vec<ActiveExecution> {
        let live: Vec<Arc<LiveExecution>> =
            self.live.iter().map(|entry| Arc::clone(entry.value())).collect();

        let mut active: Vec<(Instant, ActiveExecution)> = live
            .iter()
            .filter_map(|live| {
                let record = live.record.lock();
                (record.status == ExecutionStatus::Running).then(|| {
                    (
                        live.started,
                        ActiveExecution {
                            execution_id: record.execution_id.clone(),
                            account_id: record.account_id.clone(),
                            spec: live.spec.clone(),
                            task: record.task.clone(),
                        },
                    )
                })
            })
            .collect();

        active.sort_by_key(|(started, _)| *started);
        active.into_iter().map(|(_, a)| a).collect()
    }

    pub fn is_running(&self, execution_id: &str) -> bool {
        self.live(execution_id)
            .map(|live| live.record.lock().status == ExecutionStatus::Running)
            .unwrap_or(false)
    }

    /// Ask the budget gate whether `spec` may start now
    pub fn check_admission(&self, spec: &AgentSpec) -> Admission {
        let owner = spec.resolved_owner();
        self.budget.check_admission(owner.kind, &owner.id)
    }

    /// Report the next termination of this execution as `rotated`
    pub fn mark_for_rotation(&self, execution_id: &str) -> bool {
        match self.live(execution_id) {
            Some(live) => {
                *live.intent.lock() = Some(ExecutionStatus::Rotated);
                true
            }
            None => false,
        }
    }

    /// Drop a pending rotation intent, e.g. when the handoff signal failed
    pub fn clear_rotation_intent(&self, execution_id: &str) {
        if let Some(live) = self.live(execution_id) {
            live.intent.lock().take();
        }
    }

    /// Write a line to an interactive run's stdin
    pub async fn send_input(&self, execution_id: &str, text: &str) -> Result<()> {
        let live = self
            .live(execution_id)
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;

        let write = async {
            let mut guard = live.stdin.lock().await;
            let stdin = guard.as_mut().ok_or_else(|| {
                EngineError::RuntimeError(format!(
                    "execution {} was not started interactively",
                    execution_id
                ))
            })?;

            stdin.write_all(text.as_bytes()).await?;
            if !text.ends_with('\n') {
                stdin.write_all(b"\n").await?;
            }
            stdin.flush().await?;
            Ok::<(), EngineError>(())
        };

        tokio::time::timeout(self.config.input_timeout(), write)
            .await
            .map_err(|_| EngineError::InputTimeout(execution_id.to_string()))?
    }

    /// Cancel a run; graceful sends SIGTERM first
    pub fn cancel(&self, execution_id: &str, graceful: bool) -> bool {
        if graceful {
            self.processes
                .cancel_graceful(execution_id, self.config.sigterm_timeout())
        } else {
            self.processes.cancel(execution_id)
        }
    }

    fn link_successor(&self, parent: &str, continuation: &str) {
        let now = Utc::now();
        let retention = chrono::Duration::seconds(SUCCESSOR_RETENTION_SECS);
        self.successors.retain(|_, (_, linked)| now - *linked < retention);
        self.successors
            .insert(parent.to_string(), (continuation.to_string(), now));
    }

    /// The continuation started from this execution, if any
    pub fn successor(&self, execution_id: &str) -> Option<String> {
        self.successors
            .get(execution_id)
            .map(|entry| entry.value().0.clone())
    }

    /// Claim the continuation link, removing it
    pub fn take_successor(&self, execution_id: &str) -> Option<String> {
        self.successors
            .remove(execution_id)
            .map(|(_, (continuation, _))| continuation)
    }

    pub fn rate_limit_signal(&self, execution_id: &str) -> Option<RateLimitSignal> {
        self.prune_rate_limits();
        self.rate_limits
            .get(execution_id)
            .map(|entry| entry.value().clone())
    }

    /// Whether any execution recently hit a rate limit on this account
    pub fn account_in_cooldown(&self, account_id: &str) -> bool {
        self.prune_rate_limits();
        let now = Utc::now();
        self.rate_limits.iter().any(|entry| {
            entry.account_id.as_deref() == Some(account_id) && entry.is_cooling_down(now)
        })
    }

    fn prune_rate_limits(&self) {
        let now = Utc::now();
        self.rate_limits.retain(|_, signal| signal.is_cooling_down(now));
    }
}
