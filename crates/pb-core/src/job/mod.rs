//! Job model — the engine's dispatchable unit of work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Scheduling tier. Lower rank is served first.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Urgent,
    High,
    #[default]
    Medium,
    Low,
}

impl JobPriority {
    /// Numeric rank used for selection ordering (urgent=0 .. low=3).
    pub fn rank(self) -> u8 {
        match self {
            JobPriority::Urgent => 0,
            JobPriority::High => 1,
            JobPriority::Medium => 2,
            JobPriority::Low => 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Retrying,
    Canceled,
}

impl JobStatus {
    /// Terminal statuses are never selected again and are eligible for cleanup.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Statuses from which a job can be picked up by a worker.
    pub fn is_ready(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Retrying)
    }
}

// ---------------------------------------------------------------------------
// Kind
// ---------------------------------------------------------------------------

/// Logical job type. Handlers are registered per kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Execute one step-run of a playbook run.
    ExecuteStep,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::ExecuteStep => "execute_step",
        }
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Everything a handler needs to execute one step-run.
///
/// `previous_outputs` carries the outputs of already-succeeded steps keyed by
/// step key; this is how data flows between dependent steps without a shared
/// mutable context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepJobPayload {
    pub run_id: Uuid,
    pub step_run_id: Uuid,
    pub step_id: Uuid,
    pub playbook_id: Uuid,
    pub org_id: Uuid,
    pub step_key: String,

    /// The step's resolved input.
    #[serde(default)]
    pub input: serde_json::Value,

    /// Outputs of completed upstream steps, keyed by step key.
    #[serde(default)]
    pub previous_outputs: BTreeMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Error captured from a failed execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,

    /// Debug representation of the error chain, when available.
    #[serde(default)]
    pub stack: Option<String>,

    pub timestamp: DateTime<Utc>,

    /// False for configuration errors (e.g. no handler registered) where a
    /// retry cannot change the outcome.
    #[serde(default = "default_retryable")]
    pub retryable: bool,
}

fn default_retryable() -> bool {
    true
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            timestamp: Utc::now(),
            retryable: true,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn not_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A dispatchable unit of work owned by the in-memory queue.
///
/// Invariant: `attempt <= max_attempts`. A retry that would exceed the budget
/// is refused and the job is terminal-failed instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub priority: JobPriority,

    /// Completed execution attempts. 0 until the first retry is scheduled.
    pub attempt: u32,
    pub max_attempts: u32,

    pub status: JobStatus,
    pub payload: StepJobPayload,

    /// Earliest execution time; used for retry backoff delay.
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    /// Slot id of the worker currently (or last) executing this job.
    #[serde(default)]
    pub worker_id: Option<usize>,

    #[serde(default)]
    pub error: Option<JobError>,
}

impl Job {
    pub fn new(payload: StepJobPayload, priority: JobPriority, max_attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: JobKind::ExecuteStep,
            priority,
            attempt: 0,
            max_attempts,
            status: JobStatus::Queued,
            payload,
            scheduled_at: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            worker_id: None,
            error: None,
        }
    }

    /// Whether the job can be selected at `now`: ready status and any
    /// scheduled-at delay elapsed.
    pub fn is_ready_at(&self, now: DateTime<Utc>) -> bool {
        self.status.is_ready() && self.scheduled_at.map_or(true, |at| at <= now)
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Exponential backoff with a ceiling: `base * multiplier^(attempt-1)`,
/// capped at `max_delay_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_max_delay() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Compute the backoff delay before retry attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay_ms =
            (self.base_delay_ms as f64) * self.multiplier.powi(attempt as i32 - 1);
        let capped = delay_ms.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }
}

// ---------------------------------------------------------------------------
// Attempt logs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One leveled message captured during an execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// Outcome of one execution attempt, including the attempt's ordered log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JobError>,
    pub duration_ms: u64,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

impl JobResult {
    pub fn success(output: serde_json::Value, duration_ms: u64, logs: Vec<LogEntry>) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
            duration_ms,
            logs,
        }
    }

    pub fn failure(error: JobError, duration_ms: u64, logs: Vec<LogEntry>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error),
            duration_ms,
            logs,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
