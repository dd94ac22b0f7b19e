// src/topology/tracker.rs
//! Team-execution tracking table and approval gates
//!
//! Every transition is written through to the [`ExecutionStore`]. Terminal
//! entries are dropped from the in-memory table after `gc_delay`; the store
//! keeps the audit row.

use crate::collaborators::ExecutionStore;
use crate::observability::metrics;
use crate::topology::types::{TeamExecution, TeamStatus, Topology};
use crate::utils::ids::{new_id, TEAM_EXECUTION_PREFIX};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub struct TeamTracker {
    executions: Arc<Mutex<HashMap<String, TeamExecution>>>,

    /// Open approval gates, one per team execution at most
    gates: Mutex<HashMap<String, oneshot::Sender<()>>>,

    store: Arc<dyn ExecutionStore>,
    gc_delay: Duration,
}

impl TeamTracker {
    pub fn new(store: Arc<dyn ExecutionStore>, gc_delay: Duration) -> Self {
        Self {
            executions: Arc::new(Mutex::new(HashMap::new())),
            gates: Mutex::new(HashMap::new()),
            store,
            gc_delay,
        }
    }

    /// Register a running team execution
    pub fn create(&self, team_id: &str, topology: &Topology) -> TeamExecution {
        let record = TeamExecution::start(new_id(TEAM_EXECUTION_PREFIX), team_id, topology);
        self.executions
            .lock()
            .insert(record.team_exec_id.clone(), record.clone());
        self.persist(&record);
        record
    }

    pub fn get(&self, team_exec_id: &str) -> Option<TeamExecution> {
        self.executions.lock().get(team_exec_id).cloned()
    }

    pub fn add_child(&self, team_exec_id: &str, execution_id: &str) {
        self.update(team_exec_id, |record| record.children.push(execution_id.to_string()));
    }

    /// Block at an approval gate until [`approve`](Self::approve) or `timeout`
    ///
    /// Returns true when approved; the record is back to `running` then.
    pub async fn await_approval(&self, team_exec_id: &str, agent_id: &str, timeout: Duration) -> bool {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().insert(team_exec_id.to_string(), tx);

        let deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));
        self.update(team_exec_id, |record| {
            record.status = TeamStatus::PendingApproval;
            record.awaiting_agent = Some(agent_id.to_string());
            record.approval_deadline = deadline;
        });
        info!(
            team_exec_id = %team_exec_id,
            agent_id = %agent_id,
            timeout_secs = timeout.as_secs(),
            "Awaiting approval"
        );

        let approved = matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(())));
        self.gates.lock().remove(team_exec_id);

        if approved {
            self.update(team_exec_id, |record| {
                record.status = TeamStatus::Running;
                record.awaiting_agent = None;
                record.approval_deadline = None;
            });
            info!(team_exec_id = %team_exec_id, agent_id = %agent_id, "Approval received");
        } else {
            warn!(team_exec_id = %team_exec_id, agent_id = %agent_id, "Approval timed out");
        }
        approved
    }

    /// Release a waiting gate. False when nothing is awaiting approval.
    pub fn approve(&self, team_exec_id: &str) -> bool {
        let gate = self.gates.lock().remove(team_exec_id);
        match gate {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    pub fn complete(&self, team_exec_id: &str, output: String) {
        self.finish(team_exec_id, TeamStatus::Completed, Some(output), None);
    }

    pub fn fail(&self, team_exec_id: &str, error: String) {
        self.finish(team_exec_id, TeamStatus::Failed, None, Some(error));
    }

    pub fn approval_timeout(&self, team_exec_id: &str) {
        self.finish(team_exec_id, TeamStatus::ApprovalTimeout, None, None);
    }

    fn finish(&self, team_exec_id: &str, status: TeamStatus, output: Option<String>, error: Option<String>) {
        let finished = self.update(team_exec_id, |record| {
            record.status = status;
            record.output = output;
            record.error = error;
            record.finished_at = Some(Utc::now());
        });

        if finished {
            metrics::team_execution(status.as_str());
            info!(team_exec_id = %team_exec_id, status = status.as_str(), "Team execution finished");
            self.schedule_gc(team_exec_id);
        }
    }

    /// Apply `change` to a non-terminal record and persist the result
    fn update(&self, team_exec_id: &str, change: impl FnOnce(&mut TeamExecution)) -> bool {
        let snapshot = {
            let mut executions = self.executions.lock();
            match executions.get_mut(team_exec_id) {
                Some(record) if !record.status.is_terminal() => {
                    change(record);
                    record.clone()
                }
                Some(_) => return false,
                None => {
                    debug!(team_exec_id = %team_exec_id, "Update for untracked team execution");
                    return false;
                }
            }
        };
        self.persist(&snapshot);
        true
    }

    fn persist(&self, record: &TeamExecution) {
        if let Err(e) = self.store.upsert_team_execution(record) {
            warn!(team_exec_id = %record.team_exec_id, "Failed to persist team execution: {}", e);
        }
    }

    fn schedule_gc(&self, team_exec_id: &str) {
        let Ok(handle) = Handle::try_current() else {
            debug!(team_exec_id = %team_exec_id, "No runtime for tracking GC; entry kept");
            return;
        };

        let executions = Arc::clone(&self.executions);
        let team_exec_id = team_exec_id.to_string();
        let delay = self.gc_delay;
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if executions.lock().remove(&team_exec_id).is_some() {
                debug!(team_exec_id = %team_exec_id, "Dropped finished team execution");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MemoryStore;

    fn tracker(gc_delay: Duration) -> (TeamTracker, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        (TeamTracker::new(store.clone(), gc_delay), store)
    }

    fn topology() -> Topology {
        Topology::Sequential {
            agents: vec!["a".into()],
        }
    }

    #[tokio::test]
    async fn test_approve_resumes() {
        let (tracker, store) = tracker(Duration::from_secs(60));
        let tracker = Arc::new(tracker);
        let record = tracker.create("team-1", &topology());
        let id = record.team_exec_id.clone();

        assert!(!tracker.approve(&id), "nothing is waiting yet");

        let waiter = {
            let tracker = Arc::clone(&tracker);
            let id = id.clone();
            tokio::spawn(async move { tracker.await_approval(&id, "b", Duration::from_secs(5)).await })
        };

        let mut pending = false;
        for _ in 0..100 {
            if tracker.get(&id).map(|r| r.status) == Some(TeamStatus::PendingApproval) {
                pending = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(pending);
        assert_eq!(
            store.team_execution(&id).map(|r| r.awaiting_agent),
            Some(Some("b".to_string()))
        );

        assert!(tracker.approve(&id));
        assert!(waiter.await.unwrap());

        let record = tracker.get(&id).unwrap();
        assert_eq!(record.status, TeamStatus::Running);
        assert!(record.approval_deadline.is_none());
    }

    #[tokio::test]
    async fn test_gate_times_out() {
        let (tracker, _store) = tracker(Duration::from_secs(60));
        let record = tracker.create("team-1", &topology());
        let approved = tracker
            .await_approval(&record.team_exec_id, "b", Duration::from_millis(50))
            .await;
        assert!(!approved);
        assert!(!tracker.approve(&record.team_exec_id));
    }

    #[tokio::test]
    async fn test_terminal_is_final_and_collected() {
        let (tracker, store) = tracker(Duration::from_millis(50));
        let record = tracker.create("team-1", &topology());
        let id = record.team_exec_id;

        tracker.add_child(&id, "exec_1");
        tracker.fail(&id, "agent a failed".into());
        tracker.complete(&id, "late".into());

        let persisted = store.team_execution(&id).unwrap();
        assert_eq!(persisted.status, TeamStatus::Failed);
        assert_eq!(persisted.children, vec!["exec_1".to_string()]);
        assert!(persisted.output.is_none());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(tracker.get(&id).is_none());
        assert!(store.team_execution(&id).is_some());
    }
}
