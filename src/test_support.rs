// src/test_support.rs
//! Shared fixtures for unit tests: scripted stand-in backend binaries

use crate::collaborators::{MemoryBudget, MemoryLogSink, MemoryStore};
use crate::runtime::backend::BackendType;
use crate::runtime::engine::ExecutionEngine;
use crate::runtime::process_manager::ProcessManager;
use crate::utils::config::RuntimeConfig;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Write an executable `sh` script
pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Fast timeouts so cancellation paths finish quickly
pub(crate) fn fast_runtime_config() -> RuntimeConfig {
    RuntimeConfig {
        sigterm_timeout_secs: 1,
        stream_drain_grace_ms: 500,
        input_timeout_secs: 2,
        ..Default::default()
    }
}

pub(crate) struct Harness {
    pub engine: ExecutionEngine,
    pub budget: Arc<MemoryBudget>,
    pub sink: Arc<MemoryLogSink>,
    pub store: Arc<MemoryStore>,
    _dir: TempDir,
}

impl Harness {
    /// Every backend runs the given script body
    pub fn with_script(body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "agent.sh", body);
        Self::build(dir, script)
    }

    pub fn with_binary(path: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self::build(dir, PathBuf::from(path))
    }

    fn build(dir: TempDir, binary: PathBuf) -> Self {
        let mut config = fast_runtime_config();
        for backend in [
            BackendType::Claude,
            BackendType::OpenCode,
            BackendType::Gemini,
            BackendType::Codex,
        ] {
            config.binaries.insert(backend, binary.clone());
        }

        let budget = Arc::new(MemoryBudget::allow_all());
        let sink = Arc::new(MemoryLogSink::default());
        let store = Arc::new(MemoryStore::default());
        let engine = ExecutionEngine::new(
            config,
            ProcessManager::new(),
            budget.clone(),
            sink.clone(),
            store.clone(),
        );

        Self {
            engine,
            budget,
            sink,
            store,
            _dir: dir,
        }
    }
}
