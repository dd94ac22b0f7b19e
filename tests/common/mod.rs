// tests/common/mod.rs
//! Helpers shared by the integration tests

#![allow(dead_code)]

use conductor_engine::collaborators::{MemoryStore, StaticTeams};
use conductor_engine::topology::TeamExecution;
use conductor_engine::utils::config::EngineConfig;
use conductor_engine::{BackendType, Collaborators, Orchestrator};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Stand-in agent CLI: echoes the prompt (`-p <prompt>`), or sleeps on "slow"
pub const ECHO_AGENT: &str = r#"if [ "$2" = "slow" ]; then exec sleep 30; fi
echo "processed: $2""#;

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub struct TestEngine {
    pub orchestrator: Orchestrator,
    pub store: Arc<MemoryStore>,
    _dir: TempDir,
}

/// Orchestrator whose backends all run `script`, with the evaluator off
pub fn orchestrator(script: &str, teams: StaticTeams) -> TestEngine {
    let dir = tempfile::tempdir().unwrap();
    let binary = write_script(dir.path(), "agent.sh", script);

    let mut config = EngineConfig::default();
    config.evaluator.enabled = false;
    config.runtime.sigterm_timeout_secs = 1;
    config.runtime.stream_drain_grace_ms = 500;
    for backend in [
        BackendType::Claude,
        BackendType::OpenCode,
        BackendType::Gemini,
        BackendType::Codex,
    ] {
        config.runtime.binaries.insert(backend, binary.clone());
    }

    let store = Arc::new(MemoryStore::default());
    let collaborators = Collaborators {
        store: store.clone(),
        teams: Arc::new(teams),
        ..Collaborators::in_memory()
    };

    TestEngine {
        orchestrator: Orchestrator::new(config, collaborators),
        store,
        _dir: dir,
    }
}

pub async fn wait_team(orchestrator: &Orchestrator, team_exec_id: &str) -> TeamExecution {
    for _ in 0..1_000 {
        if let Some(record) = orchestrator.team_execution(team_exec_id) {
            if record.status.is_terminal() {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("team execution {} did not finish", team_exec_id);
}
