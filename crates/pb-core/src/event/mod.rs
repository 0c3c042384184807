//! Lifecycle events published for live observers of a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of run/step lifecycle event kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RunEventKind {
    #[serde(rename = "run.updated")]
    RunUpdated,
    #[serde(rename = "run.completed")]
    RunCompleted,
    #[serde(rename = "run.failed")]
    RunFailed,
    #[serde(rename = "step.updated")]
    StepUpdated,
    #[serde(rename = "step.log.appended")]
    StepLogAppended,
    #[serde(rename = "step.completed")]
    StepCompleted,
    #[serde(rename = "step.failed")]
    StepFailed,
}

impl RunEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RunEventKind::RunUpdated => "run.updated",
            RunEventKind::RunCompleted => "run.completed",
            RunEventKind::RunFailed => "run.failed",
            RunEventKind::StepUpdated => "step.updated",
            RunEventKind::StepLogAppended => "step.log.appended",
            RunEventKind::StepCompleted => "step.completed",
            RunEventKind::StepFailed => "step.failed",
        }
    }
}

/// One event delivered to subscribers of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    #[serde(rename = "type")]
    pub kind: RunEventKind,
    pub run_id: Uuid,
    #[serde(default)]
    pub step_key: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RunEvent {
    /// Run-scoped event with no step key.
    pub fn run(kind: RunEventKind, run_id: Uuid, payload: serde_json::Value) -> Self {
        Self {
            kind,
            run_id,
            step_key: None,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Step-scoped event.
    pub fn step(
        kind: RunEventKind,
        run_id: Uuid,
        step_key: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            run_id,
            step_key: Some(step_key.into()),
            timestamp: Utc::now(),
            payload,
        }
    }
}
