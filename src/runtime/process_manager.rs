// src/runtime/process_manager.rs
//! Process-group tracking for running agent executions
//!
//! Every agent CLI is launched as the leader of its own process group so a
//! whole subtree (the CLI plus any tools it forks) can be signalled at once.
//! The manager keeps one handle per execution id:
//!
//! ```text
//! execution_id ──► ProcessHandle { pid, pgid, cancelled, sigterm_sent, sigkill_count, cancel_delivered, exited }
//! ```
//!
//! OS-level races ("no such process") are treated as success. Only genuine
//! errors such as `EPERM` fail a cancellation.

use crate::observability::metrics;
use crate::utils::errors::{EngineError, Result};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{getpgid, Pid};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// Poll interval while draining on shutdown
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How the child's stdin is wired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdinMode {
    Null,
    Piped,
}

/// Configuration for spawning a process
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Executable to run
    pub program: PathBuf,

    pub args: Vec<String>,

    /// Working directory
    pub work_dir: Option<PathBuf>,

    /// Environment variables
    pub env_vars: Vec<(String, String)>,

    pub stdin: StdinMode,
}

impl SpawnConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            work_dir: None,
            env_vars: vec![],
            stdin: StdinMode::Null,
        }
    }
}

/// Snapshot of one tracked process group
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub execution_id: String,

    pub pid: u32,

    /// Process-group id used for signalling
    pub pgid: i32,

    /// The group lookup failed and `pgid` fell back to the pid
    pub degraded: bool,

    pub cancelled: bool,

    pub sigterm_sent: bool,

    pub sigkill_count: u32,

    /// A cancel signal reached a live process group
    pub cancel_delivered: bool,

    /// The owning task has reaped the process
    pub exited: bool,

    pub registered_at: Instant,
}

/// Outcome of [`ProcessManager::drain_on_shutdown`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub exited: usize,
    pub killed: usize,
}

enum SignalOutcome {
    Delivered,
    AlreadyGone,
    Failed(Errno),
}

fn signal_group(pgid: i32, signal: Signal) -> SignalOutcome {
    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) => SignalOutcome::Delivered,
        Err(Errno::ESRCH) => SignalOutcome::AlreadyGone,
        Err(errno) => SignalOutcome::Failed(errno),
    }
}

/// Process manager for agent process groups
#[derive(Clone, Default)]
pub struct ProcessManager {
    table: Arc<Mutex<HashMap<String, ProcessHandle>>>,
}

impl ProcessManager {
    /// Create a new process manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a process as the leader of a new process group
    pub fn spawn(&self, config: &SpawnConfig) -> Result<Child> {
        debug!("Spawning {:?} with {} args", config.program, config.args.len());

        let mut command = Command::new(&config.program);
        command.args(&config.args);

        if let Some(work_dir) = &config.work_dir {
            command.current_dir(work_dir);
        }

        for (key, value) in &config.env_vars {
            command.env(key, value);
        }

        let stdin = match config.stdin {
            StdinMode::Null => Stdio::null(),
            StdinMode::Piped => Stdio::piped(),
        };

        command
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(false);

        let child = command.spawn().map_err(|e| {
            EngineError::ProcessSpawnFailed(format!("{}: {}", config.program.display(), e))
        })?;

        debug!("Process spawned with PID: {:?}", child.id());
        Ok(child)
    }

    /// Track a spawned child under an execution id
    pub fn register(&self, execution_id: &str, child: &Child) -> Result<ProcessHandle> {
        let pid = child.id().ok_or_else(|| {
            EngineError::ProcessSpawnFailed(format!(
                "process for {} exited before registration",
                execution_id
            ))
        })?;

        let (pgid, degraded) = match getpgid(Some(Pid::from_raw(pid as i32))) {
            Ok(pgid) => (pgid.as_raw(), false),
            Err(e) => {
                warn!(
                    execution_id,
                    pid,
                    "Process group lookup failed ({}); falling back to pid, group signals may miss descendants",
                    e
                );
                (pid as i32, true)
            }
        };

        let handle = ProcessHandle {
            execution_id: execution_id.to_string(),
            pid,
            pgid,
            degraded,
            cancelled: false,
            sigterm_sent: false,
            sigkill_count: 0,
            cancel_delivered: false,
            exited: false,
            registered_at: Instant::now(),
        };

        let mut table = self.table.lock();
        if table.contains_key(execution_id) {
            return Err(EngineError::DuplicateExecution(execution_id.to_string()));
        }
        table.insert(execution_id.to_string(), handle.clone());
        metrics::active_processes(table.len());

        debug!(execution_id, pid, pgid, "Registered process group");
        Ok(handle)
    }

    /// Hard-cancel: SIGKILL the whole group
    ///
    /// Returns true if the execution was known (alive or already exited).
    pub fn cancel(&self, execution_id: &str) -> bool {
        let mut table = self.table.lock();
        let Some(handle) = table.get_mut(execution_id) else {
            debug!(execution_id, "Cancel requested for unknown execution");
            return false;
        };

        handle.cancelled = true;
        if handle.exited || handle.sigkill_count > 0 {
            return true;
        }

        match signal_group(handle.pgid, Signal::SIGKILL) {
            outcome @ (SignalOutcome::Delivered | SignalOutcome::AlreadyGone) => {
                handle.sigkill_count += 1;
                handle.cancel_delivered |= matches!(outcome, SignalOutcome::Delivered);
                info!(execution_id, pgid = handle.pgid, "Sent SIGKILL to process group");
                true
            }
            SignalOutcome::Failed(errno) => {
                error!(execution_id, pgid = handle.pgid, "SIGKILL failed: {}", errno);
                false
            }
        }
    }

    /// Graceful cancel: SIGTERM now, SIGKILL if still running after `sigterm_timeout`
    ///
    /// Repeated calls never send additional signals once a graceful cancel
    /// is pending or the SIGKILL fallback has fired.
    pub fn cancel_graceful(&self, execution_id: &str, sigterm_timeout: Duration) -> bool {
        {
            let mut table = self.table.lock();
            let Some(handle) = table.get_mut(execution_id) else {
                debug!(execution_id, "Graceful cancel requested for unknown execution");
                return false;
            };

            handle.cancelled = true;
            if handle.exited || handle.sigterm_sent || handle.sigkill_count > 0 {
                return true;
            }

            match signal_group(handle.pgid, Signal::SIGTERM) {
                SignalOutcome::Delivered => {
                    handle.sigterm_sent = true;
                    handle.cancel_delivered = true;
                    info!(execution_id, pgid = handle.pgid, "Sent SIGTERM to process group");
                }
                SignalOutcome::AlreadyGone => {
                    handle.sigterm_sent = true;
                    return true;
                }
                SignalOutcome::Failed(errno) => {
                    error!(execution_id, pgid = handle.pgid, "SIGTERM failed: {}", errno);
                    return false;
                }
            }
        }

        self.arm_sigkill_timer(execution_id.to_string(), sigterm_timeout);
        true
    }

    fn arm_sigkill_timer(&self, execution_id: String, sigterm_timeout: Duration) {
        let table = Arc::clone(&self.table);
        let fire = move || {
            let mut table = table.lock();
            let Some(handle) = table.get_mut(&execution_id) else {
                return;
            };
            if handle.exited || handle.sigkill_count > 0 {
                return;
            }

            warn!(
                execution_id = %execution_id,
                "Process did not exit within {:?} of SIGTERM, sending SIGKILL",
                sigterm_timeout
            );
            match signal_group(handle.pgid, Signal::SIGKILL) {
                SignalOutcome::Delivered => {
                    handle.sigkill_count += 1;
                    handle.cancel_delivered = true;
                }
                SignalOutcome::AlreadyGone => handle.sigkill_count += 1,
                SignalOutcome::Failed(errno) => {
                    error!(execution_id = %execution_id, "SIGKILL fallback failed: {}", errno)
                }
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    tokio::time::sleep(sigterm_timeout).await;
                    fire();
                });
            }
            Err(_) => {
                std::thread::spawn(move || {
                    std::thread::sleep(sigterm_timeout);
                    fire();
                });
            }
        }
    }

    /// SIGKILL the group without marking the execution cancelled (timeouts)
    pub fn kill_group(&self, execution_id: &str) -> bool {
        let mut table = self.table.lock();
        let Some(handle) = table.get_mut(execution_id) else {
            return false;
        };
        if handle.exited || handle.sigkill_count > 0 {
            return true;
        }

        match signal_group(handle.pgid, Signal::SIGKILL) {
            SignalOutcome::Delivered | SignalOutcome::AlreadyGone => {
                handle.sigkill_count += 1;
                true
            }
            SignalOutcome::Failed(errno) => {
                error!(execution_id, "SIGKILL failed: {}", errno);
                false
            }
        }
    }

    /// Check whether a cancellation was requested
    pub fn is_cancelled(&self, execution_id: &str) -> bool {
        self.table
            .lock()
            .get(execution_id)
            .map(|h| h.cancelled)
            .unwrap_or(false)
    }

    /// Whether a cancel actually signalled the live group, as opposed to
    /// being requested after the process was gone
    pub fn cancel_delivered(&self, execution_id: &str) -> bool {
        self.table
            .lock()
            .get(execution_id)
            .map(|h| h.cancel_delivered)
            .unwrap_or(false)
    }

    /// Record that the owning task reaped the process
    pub fn mark_exited(&self, execution_id: &str) {
        if let Some(handle) = self.table.lock().get_mut(execution_id) {
            handle.exited = true;
        }
    }

    /// Registered and not yet reaped
    pub fn is_alive(&self, execution_id: &str) -> bool {
        self.table
            .lock()
            .get(execution_id)
            .map(|h| !h.exited)
            .unwrap_or(false)
    }

    /// Drop the handle (idempotent)
    pub fn cleanup(&self, execution_id: &str) {
        let mut table = self.table.lock();
        if table.remove(execution_id).is_some() {
            debug!(execution_id, "Cleaned up process handle");
        }
        metrics::active_processes(table.len());
    }

    pub fn handle(&self, execution_id: &str) -> Option<ProcessHandle> {
        self.table.lock().get(execution_id).cloned()
    }

    /// Execution ids whose processes are still running
    pub fn active_executions(&self) -> Vec<String> {
        let table = self.table.lock();
        let mut active: Vec<&ProcessHandle> = table.values().filter(|h| !h.exited).collect();
        active.sort_by_key(|h| h.registered_at);
        active.into_iter().map(|h| h.execution_id.clone()).collect()
    }

    /// Give each live process `timeout / active` to exit, then kill stragglers
    pub async fn drain_on_shutdown(&self, timeout: Duration) -> DrainReport {
        let active = self.active_executions();
        let mut report = DrainReport::default();
        if active.is_empty() {
            return report;
        }

        let per_process = timeout / active.len() as u32;
        info!(
            "Draining {} active processes ({:?} each)",
            active.len(),
            per_process
        );

        let mut stragglers = Vec::new();
        for execution_id in &active {
            let deadline = Instant::now() + per_process;
            while self.is_alive(execution_id) {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                tokio::time::sleep(DRAIN_POLL_INTERVAL.min(deadline - now)).await;
            }

            if self.is_alive(execution_id) {
                stragglers.push(execution_id.clone());
            } else {
                report.exited += 1;
            }
        }

        for execution_id in stragglers {
            warn!(execution_id = %execution_id, "Force-killing process that outlived shutdown drain");
            if self.cancel(&execution_id) {
                report.killed += 1;
            }
        }

        report
    }
}
