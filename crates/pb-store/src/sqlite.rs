//! SQLite-backed playbook store.

use crate::{PlaybookStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pb_core::run::{PlaybookRun, RunState, Step, StepConfig, StepRun, StepRunState};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

/// Playbook store backed by a single SQLite database.
/// Uses Mutex<Connection> for thread safety (rusqlite::Connection is !Sync).
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::Database(e.to_string()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        tracing::debug!(path = %path.display(), "playbook store opened");
        Ok(store)
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().map_err(|e| StoreError::Database(e.to_string()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<(), StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS playbook_runs (
                id TEXT PRIMARY KEY,
                playbook_id TEXT NOT NULL,
                org_id TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS playbook_steps (
                id TEXT PRIMARY KEY,
                playbook_id TEXT NOT NULL,
                key TEXT NOT NULL,
                step_type TEXT NOT NULL,
                position INTEGER NOT NULL,
                config_json TEXT NOT NULL,
                next_step_key TEXT
            );

            CREATE TABLE IF NOT EXISTS step_runs (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                step_key TEXT NOT NULL,
                state TEXT NOT NULL,
                input_json TEXT NOT NULL,
                output_json TEXT,
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_steps_playbook
                ON playbook_steps(playbook_id);
            CREATE INDEX IF NOT EXISTS idx_step_runs_run
                ON step_runs(run_id);",
        )
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    /// Insert a run row.
    pub fn insert_run(&self, run: &PlaybookRun) -> Result<(), StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        conn.execute(
            "INSERT INTO playbook_runs (id, playbook_id, org_id, state, created_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                run.id.to_string(),
                run.playbook_id.to_string(),
                run.org_id.to_string(),
                to_json_text(&run.state)?,
                run.created_at.to_rfc3339(),
                run.completed_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    /// Insert a step row for a playbook.
    pub fn insert_step(&self, playbook_id: Uuid, step: &Step) -> Result<(), StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        conn.execute(
            "INSERT INTO playbook_steps (id, playbook_id, key, step_type, position, config_json, next_step_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                step.id.to_string(),
                playbook_id.to_string(),
                step.key,
                step.step_type,
                step.position,
                to_json_text(&step.config)?,
                step.next_step_key,
            ],
        )
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    /// Insert a step-run row.
    pub fn insert_step_run(&self, step_run: &StepRun) -> Result<(), StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        conn.execute(
            "INSERT INTO step_runs (id, run_id, step_id, step_key, state, input_json, output_json, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                step_run.id.to_string(),
                step_run.run_id.to_string(),
                step_run.step_id.to_string(),
                step_run.step_key,
                to_json_text(&step_run.state)?,
                step_run.input.to_string(),
                step_run.output.as_ref().map(|v| v.to_string()),
                step_run.error,
            ],
        )
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl PlaybookStore for SqliteStore {
    async fn run(&self, run_id: Uuid) -> Result<PlaybookRun, StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare(
                "SELECT id, playbook_id, org_id, state, created_at, completed_at
                 FROM playbook_runs WHERE id = ?1",
            )
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let mut rows = stmt
            .query_map(rusqlite::params![run_id.to_string()], |row| {
                Ok(RawRunRow {
                    id: row.get(0)?,
                    playbook_id: row.get(1)?,
                    org_id: row.get(2)?,
                    state: row.get(3)?,
                    created_at: row.get(4)?,
                    completed_at: row.get(5)?,
                })
            })
            .map_err(|e| StoreError::Database(e.to_string()))?;

        match rows.next() {
            Some(row) => raw_to_run(row.map_err(|e| StoreError::Database(e.to_string()))?),
            None => Err(StoreError::RunNotFound(run_id)),
        }
    }

    async fn playbook_steps(&self, playbook_id: Uuid) -> Result<Vec<Step>, StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare(
                "SELECT id, key, step_type, position, config_json, next_step_key
                 FROM playbook_steps WHERE playbook_id = ?1
                 ORDER BY position ASC",
            )
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let rows = stmt
            .query_map(rusqlite::params![playbook_id.to_string()], |row| {
                Ok(RawStepRow {
                    id: row.get(0)?,
                    key: row.get(1)?,
                    step_type: row.get(2)?,
                    position: row.get(3)?,
                    config_json: row.get(4)?,
                    next_step_key: row.get(5)?,
                })
            })
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let mut steps = Vec::new();
        for row in rows {
            let raw = row.map_err(|e| StoreError::Database(e.to_string()))?;
            steps.push(raw_to_step(raw)?);
        }
        if steps.is_empty() {
            return Err(StoreError::PlaybookNotFound(playbook_id));
        }
        Ok(steps)
    }

    async fn step_runs(&self, run_id: Uuid) -> Result<Vec<StepRun>, StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare(
                "SELECT id, run_id, step_id, step_key, state, input_json, output_json, error
                 FROM step_runs WHERE run_id = ?1",
            )
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let rows = stmt
            .query_map(rusqlite::params![run_id.to_string()], |row| {
                Ok(RawStepRunRow {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    step_id: row.get(2)?,
                    step_key: row.get(3)?,
                    state: row.get(4)?,
                    input_json: row.get(5)?,
                    output_json: row.get(6)?,
                    error: row.get(7)?,
                })
            })
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let mut step_runs = Vec::new();
        for row in rows {
            let raw = row.map_err(|e| StoreError::Database(e.to_string()))?;
            step_runs.push(raw_to_step_run(raw)?);
        }
        Ok(step_runs)
    }

    async fn update_step_run_state(
        &self,
        step_run_id: Uuid,
        state: StepRunState,
    ) -> Result<(), StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let updated = conn
            .execute(
                "UPDATE step_runs SET state = ?1 WHERE id = ?2",
                rusqlite::params![to_json_text(&state)?, step_run_id.to_string()],
            )
            .map_err(|e| StoreError::Database(e.to_string()))?;
        if updated == 0 {
            return Err(StoreError::StepRunNotFound(step_run_id));
        }
        Ok(())
    }

    async fn record_step_run_result(
        &self,
        step_run_id: Uuid,
        state: StepRunState,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let updated = conn
            .execute(
                "UPDATE step_runs SET state = ?1, output_json = ?2, error = ?3 WHERE id = ?4",
                rusqlite::params![
                    to_json_text(&state)?,
                    output.as_ref().map(|v| v.to_string()),
                    error,
                    step_run_id.to_string(),
                ],
            )
            .map_err(|e| StoreError::Database(e.to_string()))?;
        if updated == 0 {
            return Err(StoreError::StepRunNotFound(step_run_id));
        }
        Ok(())
    }

    async fn update_run_state(
        &self,
        run_id: Uuid,
        state: RunState,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let updated = conn
            .execute(
                "UPDATE playbook_runs SET state = ?1, completed_at = ?2 WHERE id = ?3",
                rusqlite::params![
                    to_json_text(&state)?,
                    completed_at.map(|t| t.to_rfc3339()),
                    run_id.to_string(),
                ],
            )
            .map_err(|e| StoreError::Database(e.to_string()))?;
        if updated == 0 {
            return Err(StoreError::RunNotFound(run_id));
        }
        Ok(())
    }
}

fn to_json_text<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Internal row structs for SQLite queries.
struct RawRunRow {
    id: String,
    playbook_id: String,
    org_id: String,
    state: String,
    created_at: String,
    completed_at: Option<String>,
}

struct RawStepRow {
    id: String,
    key: String,
    step_type: String,
    position: u32,
    config_json: String,
    next_step_key: Option<String>,
}

struct RawStepRunRow {
    id: String,
    run_id: String,
    step_id: String,
    step_key: String,
    state: String,
    input_json: String,
    output_json: Option<String>,
    error: Option<String>,
}

fn parse_uuid(field: &str, value: &str) -> Result<Uuid, StoreError> {
    value
        .parse()
        .map_err(|e: uuid::Error| StoreError::Database(format!("{field}: {e}")))
}

fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Database(format!("{field}: {e}")))
}

fn raw_to_run(raw: RawRunRow) -> Result<PlaybookRun, StoreError> {
    Ok(PlaybookRun {
        id: parse_uuid("id", &raw.id)?,
        playbook_id: parse_uuid("playbook_id", &raw.playbook_id)?,
        org_id: parse_uuid("org_id", &raw.org_id)?,
        state: serde_json::from_str(&raw.state)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        created_at: parse_timestamp("created_at", &raw.created_at)?,
        completed_at: raw
            .completed_at
            .map(|s| parse_timestamp("completed_at", &s))
            .transpose()?,
    })
}

fn raw_to_step(raw: RawStepRow) -> Result<Step, StoreError> {
    let config: StepConfig = serde_json::from_str(&raw.config_json)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(Step {
        id: parse_uuid("id", &raw.id)?,
        key: raw.key,
        step_type: raw.step_type,
        position: raw.position,
        config,
        next_step_key: raw.next_step_key,
    })
}

fn raw_to_step_run(raw: RawStepRunRow) -> Result<StepRun, StoreError> {
    Ok(StepRun {
        id: parse_uuid("id", &raw.id)?,
        run_id: parse_uuid("run_id", &raw.run_id)?,
        step_id: parse_uuid("step_id", &raw.step_id)?,
        step_key: raw.step_key,
        state: serde_json::from_str(&raw.state)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        input: serde_json::from_str(&raw.input_json)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        output: raw
            .output_json
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        error: raw.error,
    })
}
