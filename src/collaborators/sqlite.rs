// src/collaborators/sqlite.rs
//! Durable execution store on SQLite
//!
//! Each row carries the queryable columns plus the full record as JSON, so
//! records can grow fields without schema migrations.

use super::ExecutionStore;
use crate::rotation::events::RotationEvent;
use crate::runtime::execution::{CapturedOutput, Execution};
use crate::topology::types::TeamExecution;
use crate::utils::errors::{EngineError, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task::block_in_place;
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS executions (
    execution_id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    owner_kind TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    account_id TEXT,
    status TEXT NOT NULL,
    parent_execution_id TEXT,
    team_execution_id TEXT,
    started_at INTEGER NOT NULL,
    finished_at INTEGER,
    record TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
CREATE INDEX IF NOT EXISTS idx_executions_team ON executions(team_execution_id);

CREATE TABLE IF NOT EXISTS execution_output (
    execution_id TEXT PRIMARY KEY,
    stdout TEXT NOT NULL,
    stderr TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rotation_events (
    event_id TEXT PRIMARY KEY,
    execution_id TEXT NOT NULL,
    root_execution_id TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    record TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rotation_root ON rotation_events(root_execution_id);

CREATE TABLE IF NOT EXISTS team_executions (
    team_exec_id TEXT PRIMARY KEY,
    team_id TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    record TEXT NOT NULL
);
"#;

/// SQLite-backed [`ExecutionStore`]
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) a database file
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::StorageFailed(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| {
            EngineError::StorageFailed(format!("Failed to open database: {}", e))
        })?;
        let store = Self::with_connection(conn)?;

        info!("Execution store opened at {:?}", path);
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| EngineError::StorageFailed(format!("Schema creation failed: {}", e)))?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Run `f` against the connection
    ///
    /// On a multi-threaded runtime the worker thread is handed over with
    /// `block_in_place` for the duration of the call, so SQLite I/O does not
    /// stall other tasks scheduled on it.
    fn with_db<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let run = || {
            let db = self.db.lock();
            f(&db)
        };
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => block_in_place(run),
            _ => run(),
        }
    }

    /// Team execution audit row
    pub fn team_execution(&self, team_exec_id: &str) -> Result<Option<TeamExecution>> {
        let record: Option<String> = self.with_db(|db| {
            Ok(db
                .query_row(
                    "SELECT record FROM team_executions WHERE team_exec_id = ?",
                    params![team_exec_id],
                    |row| row.get(0),
                )
                .optional()?)
        })?;

        record
            .map(|r| serde_json::from_str(&r).map_err(EngineError::from))
            .transpose()
    }
}

impl ExecutionStore for SqliteStore {
    fn create_execution(&self, execution: &Execution) -> Result<()> {
        let record = serde_json::to_string(execution)?;
        self.with_db(|db| {
            db.execute(
                r#"
                INSERT INTO executions (execution_id, agent_id, owner_kind, owner_id, account_id, status,
                                        parent_execution_id, team_execution_id, started_at, finished_at, record)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
                params![
                    execution.execution_id,
                    execution.agent_id,
                    execution.owner.kind.as_str(),
                    execution.owner.id,
                    execution.account_id,
                    execution.status.as_str(),
                    execution.parent_execution_id,
                    execution.team_execution_id,
                    execution.started_at.timestamp_micros(),
                    execution.finished_at.map(|t| t.timestamp_micros()),
                    record,
                ],
            )
            .map_err(|e| EngineError::StorageFailed(format!("Failed to insert execution: {}", e)))
        })?;

        debug!(execution_id = %execution.execution_id, "Persisted execution");
        Ok(())
    }

    fn update_execution(&self, execution: &Execution) -> Result<()> {
        let record = serde_json::to_string(execution)?;
        let changed = self.with_db(|db| {
            Ok(db.execute(
                r#"
                UPDATE executions
                SET account_id = ?, status = ?, finished_at = ?, record = ?
                WHERE execution_id = ?
                "#,
                params![
                    execution.account_id,
                    execution.status.as_str(),
                    execution.finished_at.map(|t| t.timestamp_micros()),
                    record,
                    execution.execution_id,
                ],
            )?)
        })?;

        if changed == 0 {
            return Err(EngineError::ExecutionNotFound(execution.execution_id.clone()));
        }
        Ok(())
    }

    fn get_execution(&self, execution_id: &str) -> Result<Option<Execution>> {
        let record: Option<String> = self.with_db(|db| {
            Ok(db
                .query_row(
                    "SELECT record FROM executions WHERE execution_id = ?",
                    params![execution_id],
                    |row| row.get(0),
                )
                .optional()?)
        })?;

        record
            .map(|r| serde_json::from_str(&r).map_err(EngineError::from))
            .transpose()
    }

    fn save_output(&self, execution_id: &str, output: &CapturedOutput) -> Result<()> {
        let stdout = serde_json::to_string(&output.stdout)?;
        let stderr = serde_json::to_string(&output.stderr)?;
        self.with_db(|db| {
            db.execute(
                "INSERT OR REPLACE INTO execution_output (execution_id, stdout, stderr) VALUES (?, ?, ?)",
                params![execution_id, stdout, stderr],
            )
            .map_err(|e| EngineError::StorageFailed(format!("Failed to save output: {}", e)))
        })?;
        Ok(())
    }

    fn load_output(&self, execution_id: &str) -> Result<Option<CapturedOutput>> {
        let row: Option<(String, String)> = self.with_db(|db| {
            Ok(db
                .query_row(
                    "SELECT stdout, stderr FROM execution_output WHERE execution_id = ?",
                    params![execution_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?)
        })?;

        match row {
            Some((stdout, stderr)) => Ok(Some(CapturedOutput {
                stdout: serde_json::from_str(&stdout)?,
                stderr: serde_json::from_str(&stderr)?,
            })),
            None => Ok(None),
        }
    }

    fn upsert_rotation_event(&self, event: &RotationEvent) -> Result<()> {
        let record = serde_json::to_string(event)?;
        self.with_db(|db| {
            db.execute(
                r#"
                INSERT OR REPLACE INTO rotation_events
                    (event_id, execution_id, root_execution_id, status, created_at, record)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
                params![
                    event.event_id,
                    event.execution_id,
                    event.root_execution_id,
                    event.status.as_str(),
                    event.created_at.timestamp_micros(),
                    record,
                ],
            )
            .map_err(|e| EngineError::StorageFailed(format!("Failed to save rotation event: {}", e)))
        })?;
        Ok(())
    }

    fn list_rotation_events(&self) -> Result<Vec<RotationEvent>> {
        let records = self.with_db(|db| {
            let mut stmt =
                db.prepare("SELECT record FROM rotation_events ORDER BY created_at, event_id")?;
            let records = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(records)
        })?;

        records
            .iter()
            .map(|r| serde_json::from_str(r).map_err(EngineError::from))
            .collect()
    }

    fn upsert_team_execution(&self, team_execution: &TeamExecution) -> Result<()> {
        let record = serde_json::to_string(team_execution)?;
        self.with_db(|db| {
            db.execute(
                r#"
                INSERT OR REPLACE INTO team_executions (team_exec_id, team_id, status, started_at, record)
                VALUES (?, ?, ?, ?, ?)
                "#,
                params![
                    team_execution.team_exec_id,
                    team_execution.team_id,
                    team_execution.status.as_str(),
                    team_execution.started_at.timestamp_micros(),
                    record,
                ],
            )
            .map_err(|e| EngineError::StorageFailed(format!("Failed to save team execution: {}", e)))
        })?;
        Ok(())
    }
}
