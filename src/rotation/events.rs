// src/rotation/events.rs
//! Rotation audit events

use crate::utils::ids::{new_id, ROTATION_PREFIX};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStatus {
    Pending,
    Completed,
    Failed,
    Skipped,
}

impl RotationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationStatus::Pending => "pending",
            RotationStatus::Completed => "completed",
            RotationStatus::Failed => "failed",
            RotationStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RotationStatus::Pending)
    }
}

/// How close the source account is to exhaustion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Normal,
    High,
    Critical,
}

impl Urgency {
    /// Critical under a minute, high under half the safety margin
    pub fn from_minutes_remaining(minutes: Option<f64>, safety_margin_minutes: f64) -> Self {
        match minutes {
            Some(m) if m < 1.0 => Urgency::Critical,
            Some(m) if m < safety_margin_minutes / 2.0 => Urgency::High,
            _ => Urgency::Normal,
        }
    }
}

/// One account handoff attempt
///
/// Created `pending`; mutated exactly once more to reach a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationEvent {
    pub event_id: String,
    pub execution_id: String,

    /// First execution of the continuation chain
    pub root_execution_id: String,

    pub from_account: String,
    pub to_account: Option<String>,
    pub reason: String,
    pub urgency: Urgency,
    pub utilization_at_rotation: f64,
    pub status: RotationStatus,
    pub continuation_execution_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RotationEvent {
    pub fn pending(
        execution_id: &str,
        root_execution_id: &str,
        from_account: &str,
        reason: &str,
        urgency: Urgency,
        utilization: f64,
    ) -> Self {
        Self {
            event_id: new_id(ROTATION_PREFIX),
            execution_id: execution_id.to_string(),
            root_execution_id: root_execution_id.to_string(),
            from_account: from_account.to_string(),
            to_account: None,
            reason: reason.to_string(),
            urgency,
            utilization_at_rotation: utilization,
            status: RotationStatus::Pending,
            continuation_execution_id: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn complete(&mut self, to_account: &str, continuation_execution_id: &str) {
        if self.settle(RotationStatus::Completed) {
            self.to_account = Some(to_account.to_string());
            self.continuation_execution_id = Some(continuation_execution_id.to_string());
        }
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        if self.settle(RotationStatus::Failed) {
            self.error = Some(error.into());
        }
    }

    pub fn skip(&mut self, why: impl Into<String>) {
        if self.settle(RotationStatus::Skipped) {
            self.error = Some(why.into());
        }
    }

    fn settle(&mut self, status: RotationStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.completed_at = Some(Utc::now());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urgency_from_eta() {
        assert_eq!(Urgency::from_minutes_remaining(Some(0.5), 5.0), Urgency::Critical);
        assert_eq!(Urgency::from_minutes_remaining(Some(2.0), 5.0), Urgency::High);
        assert_eq!(Urgency::from_minutes_remaining(Some(4.0), 5.0), Urgency::Normal);
        assert_eq!(Urgency::from_minutes_remaining(None, 5.0), Urgency::Normal);
    }

    #[test]
    fn test_terminal_status_is_final() {
        let mut event = RotationEvent::pending("exec_1", "exec_1", "a", "hot", Urgency::Normal, 90.0);
        event.fail("spawn failed");
        event.complete("b", "exec_2");
        assert_eq!(event.status, RotationStatus::Failed);
        assert_eq!(event.to_account, None);
        assert!(event.completed_at.is_some());
    }
}
