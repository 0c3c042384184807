//! Run types — the store-owned records the engine consumes and mirrors.
//!
//! A `PlaybookRun` is one execution instance of a playbook; it owns one
//! `StepRun` per step. The store is the source of truth for these; the
//! engine only mirrors transient scheduling state into its own jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Canceled
        )
    }
}

// ---------------------------------------------------------------------------
// PlaybookRun
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookRun {
    pub id: Uuid,
    pub playbook_id: Uuid,
    pub org_id: Uuid,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl PlaybookRun {
    pub fn new(playbook_id: Uuid, org_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            playbook_id,
            org_id,
            state: RunState::Queued,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// Step configuration as authored in the playbook definition.
///
/// Dependencies on upstream steps come from two sources: the explicit
/// `dependencies` list, and `{{steps.<key>...}}` references inside the
/// `input` template. Both are honored during graph derivation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepConfig {
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Input template; may reference upstream outputs via `{{steps.<key>...}}`.
    #[serde(default)]
    pub input: Option<String>,

    /// Step-type-specific settings, passed through to the handler.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One node in a playbook's graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,

    /// Stable key unique within the playbook; dependency references use it.
    pub key: String,

    /// Step type, e.g. "generate_content" or "fetch_data". Selects the handler.
    pub step_type: String,

    /// Ordering position within the playbook.
    pub position: u32,

    #[serde(default)]
    pub config: StepConfig,

    #[serde(default)]
    pub next_step_key: Option<String>,
}

// ---------------------------------------------------------------------------
// Step-run state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepRunState {
    WaitingForDependencies,
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl StepRunState {
    /// Active states are canceled along with their run.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            StepRunState::WaitingForDependencies | StepRunState::Queued | StepRunState::Running
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepRunState::Succeeded | StepRunState::Failed | StepRunState::Canceled
        )
    }
}

// ---------------------------------------------------------------------------
// StepRun
// ---------------------------------------------------------------------------

/// Execution record for one step within one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRun {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: Uuid,
    pub step_key: String,
    pub state: StepRunState,

    /// The step's resolved input.
    #[serde(default)]
    pub input: serde_json::Value,

    /// Present once the step has succeeded.
    #[serde(default)]
    pub output: Option<serde_json::Value>,

    #[serde(default)]
    pub error: Option<String>,
}

impl StepRun {
    pub fn new(run_id: Uuid, step: &Step) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            step_id: step.id,
            step_key: step.key.clone(),
            state: StepRunState::WaitingForDependencies,
            input: serde_json::Value::Null,
            output: None,
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
