// src/utils/config.rs
//! Engine configuration
//!
//! Configuration is layered with the `config` crate:
//!
//! 1. Built-in defaults (the values below)
//! 2. An optional `conductor.{toml,yaml,json}` file (override the base name
//!    with `CONDUCTOR_CONFIG`)
//! 3. Environment variables shaped `CONDUCTOR__SECTION__KEY`, e.g.
//!    `CONDUCTOR__RUNTIME__EXECUTION_TIMEOUT_SECS=120`

use crate::runtime::backend::BackendType;
use crate::topology::types::EmptyOutputPolicy;
use crate::utils::errors::{EngineError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub runtime: RuntimeConfig,
    pub rotation: RotationConfig,
    pub evaluator: EvaluatorConfig,
    pub topology: TopologyConfig,
    pub storage: StorageConfig,
    pub observability: ObservabilityConfig,
}

/// Process supervision settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Hard wall-clock limit for a single agent run
    pub execution_timeout_secs: u64,

    /// Grace period between SIGTERM and SIGKILL for user cancellations
    pub sigterm_timeout_secs: u64,

    /// Total budget for draining live processes on shutdown
    pub drain_timeout_secs: u64,

    /// Bound on a single stdin write for interactive runs
    pub input_timeout_secs: u64,

    /// How long to wait for stream readers after the process exits
    pub stream_drain_grace_ms: u64,

    /// Cooldown applied when a rate-limit line carries no retry hint
    pub rate_limit_cooldown_secs: u64,

    /// Per-backend executable overrides (defaults to the CLI name on PATH)
    pub binaries: BTreeMap<BackendType, PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            execution_timeout_secs: 600,
            sigterm_timeout_secs: 5,
            drain_timeout_secs: 30,
            input_timeout_secs: 10,
            stream_drain_grace_ms: 2_000,
            rate_limit_cooldown_secs: 60,
            binaries: BTreeMap::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn sigterm_timeout(&self) -> Duration {
        Duration::from_secs(self.sigterm_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn input_timeout(&self) -> Duration {
        Duration::from_secs(self.input_timeout_secs)
    }

    pub fn stream_drain_grace(&self) -> Duration {
        Duration::from_millis(self.stream_drain_grace_ms)
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_secs(self.rate_limit_cooldown_secs)
    }

    /// Executable used to launch a backend
    pub fn binary_for(&self, backend: BackendType) -> PathBuf {
        self.binaries
            .get(&backend)
            .cloned()
            .unwrap_or_else(|| PathBuf::from(backend.command()))
    }
}

/// Rotation decision and handoff settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Utilization (percent) at or above which an account is a rotation candidate
    pub utilization_threshold_pct: f64,

    /// Rotate only when projected exhaustion is closer than this
    pub safety_margin_minutes: f64,

    /// Anti-thrash ceiling on rotations chained from one root execution
    pub max_rotations_per_execution: u32,

    /// Captured output lines echoed into the continuation prompt
    pub continuation_lines: usize,

    /// Grace period given to the source process during a handoff
    pub sigterm_timeout_secs: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            utilization_threshold_pct: 80.0,
            safety_margin_minutes: 5.0,
            max_rotations_per_execution: 3,
            continuation_lines: 200,
            sigterm_timeout_secs: 5,
        }
    }
}

impl RotationConfig {
    pub fn sigterm_timeout(&self) -> Duration {
        Duration::from_secs(self.sigterm_timeout_secs)
    }
}

/// Periodic rotation evaluator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    pub enabled: bool,

    /// Seconds between poll cycles
    pub interval_secs: u64,

    /// Consecutive positive polls required before dispatching a rotation
    pub hysteresis_threshold: u32,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 15,
            hysteresis_threshold: 2,
        }
    }
}

impl EvaluatorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Team execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Default wait at a human-in-loop gate
    pub approval_timeout_secs: u64,

    /// Delay before a terminal team execution is dropped from the tracking table
    pub gc_delay_secs: u64,

    /// Default generator/critic iteration cap
    pub default_max_iterations: u32,

    /// What to do when an agent hands off empty output
    pub empty_output_policy: EmptyOutputPolicy,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            approval_timeout_secs: 1_800,
            gc_delay_secs: 300,
            default_max_iterations: 3,
            empty_output_policy: EmptyOutputPolicy::FallbackToInput,
        }
    }
}

impl TopologyConfig {
    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }

    pub fn gc_delay(&self) -> Duration {
        Duration::from_secs(self.gc_delay_secs)
    }
}

/// Persistence backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// SQLite database file
    pub db_path: PathBuf,

    /// Optional YAML file with team definitions
    pub teams_file: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            db_path: PathBuf::from(".conductor/conductor.db"),
            teams_file: None,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Logging and metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub log_level: String,

    pub log_format: LogFormat,

    /// Prometheus listen address; metrics export is disabled when unset
    pub metrics_addr: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_addr: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the default file name and environment
    pub fn load() -> Result<Self> {
        let base = std::env::var("CONDUCTOR_CONFIG").unwrap_or_else(|_| "conductor".to_string());
        Self::load_from(&base)
    }

    /// Load configuration from a specific file base name and environment
    pub fn load_from(path: &str) -> Result<Self> {
        let config: EngineConfig = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("CONDUCTOR")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot operate with
    pub fn validate(&self) -> Result<()> {
        let threshold = self.rotation.utilization_threshold_pct;
        if !(0.0..=100.0).contains(&threshold) {
            return Err(EngineError::ConfigError(format!(
                "rotation.utilization_threshold_pct must be within 0-100, got {}",
                threshold
            )));
        }

        if self.rotation.safety_margin_minutes <= 0.0 {
            return Err(EngineError::ConfigError(
                "rotation.safety_margin_minutes must be positive".to_string(),
            ));
        }

        if self.evaluator.hysteresis_threshold == 0 {
            return Err(EngineError::ConfigError(
                "evaluator.hysteresis_threshold must be at least 1".to_string(),
            ));
        }

        if self.evaluator.interval_secs == 0 {
            return Err(EngineError::ConfigError(
                "evaluator.interval_secs must be at least 1".to_string(),
            ));
        }

        if self.runtime.execution_timeout_secs == 0 {
            return Err(EngineError::ConfigError(
                "runtime.execution_timeout_secs must be at least 1".to_string(),
            ));
        }

        if self.topology.default_max_iterations == 0 {
            return Err(EngineError::ConfigError(
                "topology.default_max_iterations must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.runtime.execution_timeout(), Duration::from_secs(600));
        assert_eq!(config.rotation.utilization_threshold_pct, 80.0);
        assert_eq!(config.rotation.safety_margin_minutes, 5.0);
        assert_eq!(config.rotation.max_rotations_per_execution, 3);
        assert_eq!(config.rotation.continuation_lines, 200);
        assert_eq!(config.evaluator.interval(), Duration::from_secs(15));
        assert_eq!(config.evaluator.hysteresis_threshold, 2);
        assert_eq!(config.topology.approval_timeout(), Duration::from_secs(1800));
        assert_eq!(config.topology.gc_delay(), Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_binary_fallback() {
        let mut config = RuntimeConfig::default();
        assert_eq!(config.binary_for(BackendType::Claude), PathBuf::from("claude"));

        config
            .binaries
            .insert(BackendType::Codex, PathBuf::from("/opt/bin/codex"));
        assert_eq!(
            config.binary_for(BackendType::Codex),
            PathBuf::from("/opt/bin/codex")
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[rotation]
utilization_threshold_pct = 90.0

[topology]
empty_output_policy = "fail"

[runtime.binaries]
gemini = "/usr/local/bin/gemini"
"#
        )
        .unwrap();

        let base = dir.path().join("engine");
        let config = EngineConfig::load_from(base.to_str().unwrap()).unwrap();
        assert_eq!(config.rotation.utilization_threshold_pct, 90.0);
        assert_eq!(config.topology.empty_output_policy, EmptyOutputPolicy::Fail);
        assert_eq!(
            config.runtime.binary_for(BackendType::Gemini),
            PathBuf::from("/usr/local/bin/gemini")
        );
        // Untouched sections keep their defaults
        assert_eq!(config.evaluator.hysteresis_threshold, 2);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = EngineConfig::load_from("/nonexistent/conductor-test-config").unwrap();
        assert_eq!(config.runtime.execution_timeout_secs, 600);
    }

    #[test]
    fn test_validation() {
        let mut config = EngineConfig::default();
        config.rotation.utilization_threshold_pct = 120.0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.evaluator.hysteresis_threshold = 0;
        assert!(config.validate().is_err());
    }
}
