//! Worker slot bookkeeping.
//!
//! Workers are reused slots, not one-shot tasks: a pool of N workers exists
//! for the process lifetime and a worker's identity is stable across jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Stopped,
}

/// One logical executor slot in the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: usize,
    pub status: WorkerStatus,
    #[serde(default)]
    pub current_job: Option<Uuid>,
    pub jobs_processed: u64,
    #[serde(default)]
    pub last_completed_at: Option<DateTime<Utc>>,
}

impl Worker {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            status: WorkerStatus::Idle,
            current_job: None,
            jobs_processed: 0,
            last_completed_at: None,
        }
    }
}
