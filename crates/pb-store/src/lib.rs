//! pb-store: persistence boundary for playbooks, runs, and step-runs.
//!
//! The engine treats the store as the source of truth for runs and step-runs
//! and only mirrors transient scheduling state into its in-memory jobs. This
//! crate defines the contract plus two reference implementations: an
//! in-memory store for tests and embedders, and a SQLite store.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pb_core::run::{PlaybookRun, RunState, Step, StepRun, StepRunState};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run not found: {0}")]
    RunNotFound(Uuid),
    #[error("playbook not found: {0}")]
    PlaybookNotFound(Uuid),
    #[error("step run not found: {0}")]
    StepRunNotFound(Uuid),
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Read/write contract the execution engine consumes.
///
/// Reads: a run by id, a playbook's steps ordered by position, and all
/// step-runs for a run. Writes: step-run state transitions, step-run results
/// (terminal state plus output/error), and run state transitions.
#[async_trait]
pub trait PlaybookStore: Send + Sync {
    async fn run(&self, run_id: Uuid) -> Result<PlaybookRun, StoreError>;

    /// Steps of a playbook, ordered by position.
    async fn playbook_steps(&self, playbook_id: Uuid) -> Result<Vec<Step>, StoreError>;

    /// All step-runs belonging to a run.
    async fn step_runs(&self, run_id: Uuid) -> Result<Vec<StepRun>, StoreError>;

    async fn update_step_run_state(
        &self,
        step_run_id: Uuid,
        state: StepRunState,
    ) -> Result<(), StoreError>;

    /// Record a terminal step-run outcome: state plus output or error.
    async fn record_step_run_result(
        &self,
        step_run_id: Uuid,
        state: StepRunState,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    async fn update_run_state(
        &self,
        run_id: Uuid,
        state: RunState,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;
}
