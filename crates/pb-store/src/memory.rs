//! In-memory store — used by tests and by embedders that keep run state
//! elsewhere.

use crate::{PlaybookStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pb_core::run::{PlaybookRun, RunState, Step, StepRun, StepRunState};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    runs: HashMap<Uuid, PlaybookRun>,
    /// Steps per playbook, kept sorted by position.
    steps: HashMap<Uuid, Vec<Step>>,
    /// Step-runs per run.
    step_runs: HashMap<Uuid, Vec<StepRun>>,
}

/// `PlaybookStore` backed by process memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_run(&self, run: PlaybookRun) {
        self.inner.write().await.runs.insert(run.id, run);
    }

    pub async fn insert_steps(&self, playbook_id: Uuid, mut steps: Vec<Step>) {
        steps.sort_by_key(|s| s.position);
        self.inner.write().await.steps.insert(playbook_id, steps);
    }

    pub async fn insert_step_runs(&self, run_id: Uuid, step_runs: Vec<StepRun>) {
        self.inner.write().await.step_runs.insert(run_id, step_runs);
    }

    /// Seed a fresh run for `playbook_id`: one waiting step-run per step.
    pub async fn seed_run(&self, playbook_id: Uuid, org_id: Uuid) -> Result<Uuid, StoreError> {
        let mut inner = self.inner.write().await;
        let steps = inner
            .steps
            .get(&playbook_id)
            .ok_or(StoreError::PlaybookNotFound(playbook_id))?
            .clone();
        let run = PlaybookRun::new(playbook_id, org_id);
        let run_id = run.id;
        let step_runs = steps.iter().map(|s| StepRun::new(run_id, s)).collect();
        inner.runs.insert(run_id, run);
        inner.step_runs.insert(run_id, step_runs);
        Ok(run_id)
    }

    /// Test helper: fetch one step-run by its step key.
    pub async fn step_run_by_key(&self, run_id: Uuid, step_key: &str) -> Option<StepRun> {
        self.inner
            .read()
            .await
            .step_runs
            .get(&run_id)?
            .iter()
            .find(|sr| sr.step_key == step_key)
            .cloned()
    }

    fn step_run_mut<'a>(
        inner: &'a mut Inner,
        step_run_id: Uuid,
    ) -> Result<&'a mut StepRun, StoreError> {
        inner
            .step_runs
            .values_mut()
            .flat_map(|runs| runs.iter_mut())
            .find(|sr| sr.id == step_run_id)
            .ok_or(StoreError::StepRunNotFound(step_run_id))
    }
}

#[async_trait]
impl PlaybookStore for MemoryStore {
    async fn run(&self, run_id: Uuid) -> Result<PlaybookRun, StoreError> {
        self.inner
            .read()
            .await
            .runs
            .get(&run_id)
            .cloned()
            .ok_or(StoreError::RunNotFound(run_id))
    }

    async fn playbook_steps(&self, playbook_id: Uuid) -> Result<Vec<Step>, StoreError> {
        self.inner
            .read()
            .await
            .steps
            .get(&playbook_id)
            .cloned()
            .ok_or(StoreError::PlaybookNotFound(playbook_id))
    }

    async fn step_runs(&self, run_id: Uuid) -> Result<Vec<StepRun>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .step_runs
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_step_run_state(
        &self,
        step_run_id: Uuid,
        state: StepRunState,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let step_run = Self::step_run_mut(&mut inner, step_run_id)?;
        step_run.state = state;
        Ok(())
    }

    async fn record_step_run_result(
        &self,
        step_run_id: Uuid,
        state: StepRunState,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let step_run = Self::step_run_mut(&mut inner, step_run_id)?;
        step_run.state = state;
        step_run.output = output;
        step_run.error = error;
        Ok(())
    }

    async fn update_run_state(
        &self,
        run_id: Uuid,
        state: RunState,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;
        run.state = state;
        run.completed_at = completed_at;
        Ok(())
    }
}
