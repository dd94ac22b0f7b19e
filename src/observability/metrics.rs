// src/observability/metrics.rs
//! Metric names and recording helpers

use crate::runtime::backend::BackendType;
use crate::runtime::execution::ExecutionStatus;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

pub const EXECUTIONS_STARTED: &str = "conductor_executions_started_total";
pub const EXECUTIONS_FINISHED: &str = "conductor_executions_finished_total";
pub const EXECUTION_DURATION: &str = "conductor_execution_duration_seconds";
pub const RATE_LIMITS_DETECTED: &str = "conductor_rate_limits_detected_total";
pub const ACTIVE_PROCESSES: &str = "conductor_active_processes";
pub const ROTATIONS: &str = "conductor_rotations_total";
pub const EVALUATOR_POLLS: &str = "conductor_evaluator_polls_total";
pub const TEAM_EXECUTIONS: &str = "conductor_team_executions_total";

pub(crate) fn describe_all() {
    describe_counter!(EXECUTIONS_STARTED, "Agent executions started, by backend");
    describe_counter!(EXECUTIONS_FINISHED, "Agent executions reaching a terminal status");
    describe_histogram!(EXECUTION_DURATION, "Wall-clock duration of agent executions");
    describe_counter!(RATE_LIMITS_DETECTED, "Rate-limit signatures seen on agent stderr");
    describe_gauge!(ACTIVE_PROCESSES, "Agent process groups currently registered");
    describe_counter!(ROTATIONS, "Account rotations by final event status");
    describe_counter!(EVALUATOR_POLLS, "Rotation evaluator poll cycles");
    describe_counter!(TEAM_EXECUTIONS, "Team executions by final status");
}

pub fn execution_started(backend: BackendType) {
    counter!(EXECUTIONS_STARTED, "backend" => backend.as_str()).increment(1);
}

pub fn execution_finished(backend: BackendType, status: ExecutionStatus, elapsed: Duration) {
    counter!(
        EXECUTIONS_FINISHED,
        "backend" => backend.as_str(),
        "status" => status.as_str()
    )
    .increment(1);
    histogram!(EXECUTION_DURATION, "backend" => backend.as_str()).record(elapsed.as_secs_f64());
}

pub fn rate_limit_detected(backend: BackendType) {
    counter!(RATE_LIMITS_DETECTED, "backend" => backend.as_str()).increment(1);
}

pub fn active_processes(count: usize) {
    gauge!(ACTIVE_PROCESSES).set(count as f64);
}

pub fn rotation(status: &'static str) {
    counter!(ROTATIONS, "status" => status).increment(1);
}

pub fn evaluator_poll() {
    counter!(EVALUATOR_POLLS).increment(1);
}

pub fn team_execution(status: &'static str) {
    counter!(TEAM_EXECUTIONS, "status" => status).increment(1);
}
