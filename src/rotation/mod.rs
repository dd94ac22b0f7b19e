// src/rotation/mod.rs
//! Credential-account rotation
//!
//! When an account's utilization window is about to run out, the running
//! execution is handed off to a continuation on a healthier account. The
//! [`RotationEvaluator`] polls, the [`RotationEngine`] decides and performs
//! the handoff, and every attempt is recorded as a [`RotationEvent`].

pub mod engine;
pub mod evaluator;
pub mod events;
pub mod prompt;
pub mod scoring;

pub use engine::{RotationDecision, RotationEngine};
pub use evaluator::{EvaluatorStatus, RotationEvaluator};
pub use events::{RotationEvent, RotationStatus, Urgency};
pub use scoring::ScoredAccount;
