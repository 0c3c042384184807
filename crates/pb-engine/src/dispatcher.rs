//! Execution dispatcher — translates playbook structure into queue
//! operations and reacts to completions.
//!
//! The store is the source of truth: every dispatch pass reloads the run's
//! steps and step-runs and recomputes the dependency graph, so the queue can
//! be rebuilt from persisted state after a restart. Completion of one step
//! triggers a localized re-scan of its dependents rather than a global
//! re-evaluation.

use crate::bus::EventBus;
use crate::graph::dependency_graph;
use crate::pool::CompletionHook;
use crate::queue::JobQueue;
use crate::EngineError;
use async_trait::async_trait;
use chrono::Utc;
use pb_core::event::{RunEvent, RunEventKind};
use pb_core::job::{Job, JobPriority, JobResult, StepJobPayload};
use pb_core::run::{PlaybookRun, RunState, Step, StepRun, StepRunState};
use pb_store::PlaybookStore;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub priority: JobPriority,
    pub max_attempts: u32,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            priority: JobPriority::Medium,
            max_attempts: 3,
        }
    }
}

pub struct Dispatcher {
    store: Arc<dyn PlaybookStore>,
    queue: Arc<JobQueue>,
    bus: Arc<EventBus>,
    options: DispatchOptions,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn PlaybookStore>,
        queue: Arc<JobQueue>,
        bus: Arc<EventBus>,
        options: DispatchOptions,
    ) -> Self {
        Self {
            store,
            queue,
            bus,
            options,
        }
    }

    /// Seed the queue for a run: every step with no unmet dependency is
    /// enqueued, in step-position order; the rest stay
    /// `WaitingForDependencies`. Store errors (unknown run, empty playbook)
    /// propagate — dispatching a nonexistent run is caller misuse.
    pub async fn dispatch_playbook_run(
        &self,
        run_id: Uuid,
        options: Option<DispatchOptions>,
    ) -> Result<Vec<Uuid>, EngineError> {
        let options = options.unwrap_or_else(|| self.options.clone());
        let run = self.store.run(run_id).await?;
        if run.state.is_terminal() {
            tracing::warn!(run_id = %run_id, state = ?run.state, "refusing to dispatch terminal run");
            return Ok(Vec::new());
        }
        let steps = self.store.playbook_steps(run.playbook_id).await?;
        let step_runs = self.store.step_runs(run_id).await?;
        let graph = dependency_graph(&steps);
        let by_step_id: HashMap<Uuid, &StepRun> =
            step_runs.iter().map(|sr| (sr.step_id, sr)).collect();

        self.store
            .update_run_state(run_id, RunState::Running, None)
            .await?;
        self.bus.publish(&RunEvent::run(
            RunEventKind::RunUpdated,
            run_id,
            serde_json::json!({"state": RunState::Running}),
        ));

        let mut job_ids = Vec::new();
        for step in &steps {
            let deps = graph.get(&step.key).map(|d| d.len()).unwrap_or(0);
            if deps > 0 {
                continue;
            }
            let step_run =
                by_step_id
                    .get(&step.id)
                    .copied()
                    .ok_or_else(|| EngineError::StepRunMissing {
                        run_id,
                        step_key: step.key.clone(),
                    })?;
            // Re-dispatch of a partially complete run must not re-run
            // finished or in-flight steps.
            if !matches!(
                step_run.state,
                StepRunState::WaitingForDependencies | StepRunState::Queued
            ) {
                continue;
            }
            let job_id = self
                .dispatch_step_run(&run, step, step_run, BTreeMap::new(), &options)
                .await?;
            job_ids.push(job_id);
        }

        tracing::info!(
            run_id = %run_id,
            steps = steps.len(),
            dispatched = job_ids.len(),
            "playbook run dispatched"
        );
        Ok(job_ids)
    }

    /// The only place a job is created from playbook data.
    pub async fn dispatch_step_run(
        &self,
        run: &PlaybookRun,
        step: &Step,
        step_run: &StepRun,
        previous_outputs: BTreeMap<String, serde_json::Value>,
        options: &DispatchOptions,
    ) -> Result<Uuid, EngineError> {
        let payload = StepJobPayload {
            run_id: run.id,
            step_run_id: step_run.id,
            step_id: step.id,
            playbook_id: run.playbook_id,
            org_id: run.org_id,
            step_key: step.key.clone(),
            input: step_run.input.clone(),
            previous_outputs,
        };
        let job = Job::new(payload, options.priority, options.max_attempts);
        let job_id = self.queue.enqueue(job);

        self.store
            .update_step_run_state(step_run.id, StepRunState::Queued)
            .await?;
        self.bus.publish(&RunEvent::step(
            RunEventKind::StepUpdated,
            run.id,
            step.key.clone(),
            serde_json::json!({"state": StepRunState::Queued}),
        ));
        tracing::debug!(run_id = %run.id, step = %step.key, job_id = %job_id, "step dispatched");
        Ok(job_id)
    }

    /// Topological unblocking: after `completed_step_key` succeeds, dispatch
    /// every dependent still waiting whose dependencies have all succeeded.
    /// A dependency without a step-run counts as unsatisfied, never an
    /// error. A run that is no longer live dispatches nothing.
    pub async fn dispatch_dependent_steps(
        &self,
        run_id: Uuid,
        completed_step_key: &str,
        output: &serde_json::Value,
    ) -> Result<Vec<Uuid>, EngineError> {
        let run = self.store.run(run_id).await?;
        if run.state.is_terminal() {
            tracing::debug!(
                run_id = %run_id,
                state = ?run.state,
                "run no longer live; skipping dependent dispatch"
            );
            return Ok(Vec::new());
        }

        let steps = self.store.playbook_steps(run.playbook_id).await?;
        let step_runs = self.store.step_runs(run_id).await?;
        let graph = dependency_graph(&steps);
        let by_key: HashMap<&str, &StepRun> = step_runs
            .iter()
            .map(|sr| (sr.step_key.as_str(), sr))
            .collect();

        // Accumulated outputs of every succeeded step, plus the one that
        // just finished (its row may not be visible yet on a lagging store).
        let mut outputs: BTreeMap<String, serde_json::Value> = step_runs
            .iter()
            .filter(|sr| sr.state == StepRunState::Succeeded)
            .filter_map(|sr| sr.output.clone().map(|o| (sr.step_key.clone(), o)))
            .collect();
        outputs.insert(completed_step_key.to_string(), output.clone());

        let mut job_ids = Vec::new();
        for step in &steps {
            let Some(deps) = graph.get(&step.key) else {
                continue;
            };
            if !deps.contains(completed_step_key) {
                continue;
            }
            let Some(step_run) = by_key.get(step.key.as_str()).copied() else {
                continue;
            };
            if step_run.state != StepRunState::WaitingForDependencies {
                continue;
            }
            let satisfied = deps.iter().all(|dep| {
                dep == completed_step_key
                    || by_key
                        .get(dep.as_str())
                        .map_or(false, |sr| sr.state == StepRunState::Succeeded)
            });
            if !satisfied {
                continue;
            }
            let job_id = self
                .dispatch_step_run(&run, step, step_run, outputs.clone(), &self.options)
                .await?;
            job_ids.push(job_id);
        }
        Ok(job_ids)
    }

    /// Cancel every active step of a run, then the run itself. Best-effort
    /// for already-running jobs: cancellation is cooperative, not forced.
    pub async fn cancel_playbook_run(&self, run_id: Uuid) -> Result<(), EngineError> {
        let step_runs = self.store.step_runs(run_id).await?;
        let jobs = self.queue.jobs_for_run(run_id);
        let job_by_step_run: HashMap<Uuid, Uuid> = jobs
            .iter()
            .map(|job| (job.payload.step_run_id, job.id))
            .collect();

        for step_run in step_runs.iter().filter(|sr| sr.state.is_active()) {
            if let Some(job_id) = job_by_step_run.get(&step_run.id) {
                self.queue.cancel_job(*job_id);
            }
            self.store
                .update_step_run_state(step_run.id, StepRunState::Canceled)
                .await?;
            self.bus.publish(&RunEvent::step(
                RunEventKind::StepUpdated,
                run_id,
                step_run.step_key.clone(),
                serde_json::json!({"state": StepRunState::Canceled}),
            ));
        }

        self.store
            .update_run_state(run_id, RunState::Canceled, Some(Utc::now()))
            .await?;
        self.bus.publish(&RunEvent::run(
            RunEventKind::RunUpdated,
            run_id,
            serde_json::json!({"state": RunState::Canceled}),
        ));
        tracing::info!(run_id = %run_id, "playbook run canceled");
        Ok(())
    }

    /// Mark the run completed once every step-run has succeeded.
    async fn finalize_run_if_complete(&self, run_id: Uuid) -> Result<(), EngineError> {
        let step_runs = self.store.step_runs(run_id).await?;
        if step_runs.is_empty()
            || !step_runs
                .iter()
                .all(|sr| sr.state == StepRunState::Succeeded)
        {
            return Ok(());
        }
        let run = self.store.run(run_id).await?;
        if run.state.is_terminal() {
            return Ok(());
        }
        self.store
            .update_run_state(run_id, RunState::Completed, Some(Utc::now()))
            .await?;
        self.bus.publish(&RunEvent::run(
            RunEventKind::RunCompleted,
            run_id,
            serde_json::json!({"state": RunState::Completed}),
        ));
        tracing::info!(run_id = %run_id, "playbook run completed");
        Ok(())
    }

    async fn record_success(&self, job: &Job, result: &JobResult) -> Result<(), EngineError> {
        let output = result.output.clone().unwrap_or(serde_json::Value::Null);
        self.store
            .record_step_run_result(
                job.payload.step_run_id,
                StepRunState::Succeeded,
                Some(output.clone()),
                None,
            )
            .await?;
        self.bus.publish(&RunEvent::step(
            RunEventKind::StepCompleted,
            job.payload.run_id,
            job.payload.step_key.clone(),
            serde_json::json!({"output": output}),
        ));

        self.dispatch_dependent_steps(job.payload.run_id, &job.payload.step_key, &output)
            .await?;
        self.finalize_run_if_complete(job.payload.run_id).await
    }

    async fn record_terminal_failure(
        &self,
        job: &Job,
        result: &JobResult,
    ) -> Result<(), EngineError> {
        let message = result
            .error
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "step execution failed".to_string());
        self.store
            .record_step_run_result(
                job.payload.step_run_id,
                StepRunState::Failed,
                None,
                Some(message.clone()),
            )
            .await?;
        self.bus.publish(&RunEvent::step(
            RunEventKind::StepFailed,
            job.payload.run_id,
            job.payload.step_key.clone(),
            serde_json::json!({"error": message, "attempt": job.attempt}),
        ));

        let run = self.store.run(job.payload.run_id).await?;
        if !run.state.is_terminal() {
            self.store
                .update_run_state(job.payload.run_id, RunState::Failed, Some(Utc::now()))
                .await?;
            self.bus.publish(&RunEvent::run(
                RunEventKind::RunFailed,
                job.payload.run_id,
                serde_json::json!({"error": message, "step_key": job.payload.step_key}),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl CompletionHook for Dispatcher {
    async fn on_job_succeeded(&self, job: &Job, result: &JobResult) {
        if let Err(err) = self.record_success(job, result).await {
            tracing::error!(
                job_id = %job.id,
                run_id = %job.payload.run_id,
                error = %err,
                "failed to record step success"
            );
        }
    }

    async fn on_job_failed(&self, job: &Job, result: &JobResult, will_retry: bool) {
        if will_retry {
            self.bus.publish(&RunEvent::step(
                RunEventKind::StepUpdated,
                job.payload.run_id,
                job.payload.step_key.clone(),
                serde_json::json!({
                    "state": "retrying",
                    "attempt": job.attempt + 1,
                    "max_attempts": job.max_attempts,
                }),
            ));
            return;
        }
        if let Err(err) = self.record_terminal_failure(job, result).await {
            tracing::error!(
                job_id = %job.id,
                run_id = %job.payload.run_id,
                error = %err,
                "failed to record step failure"
            );
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pb_core::job::RetryPolicy;
    use pb_core::run::StepConfig;
    use pb_store::MemoryStore;

    fn step(key: &str, position: u32, deps: Vec<&str>, input: Option<&str>) -> Step {
        Step {
            id: Uuid::new_v4(),
            key: key.into(),
            step_type: "generate_content".into(),
            position,
            config: StepConfig {
                dependencies: deps.into_iter().map(String::from).collect(),
                input: input.map(String::from),
                extra: Default::default(),
            },
            next_step_key: None,
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        queue: Arc<JobQueue>,
        dispatcher: Dispatcher,
        run_id: Uuid,
    }

    async fn fixture(steps: Vec<Step>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let playbook_id = Uuid::new_v4();
        store.insert_steps(playbook_id, steps).await;
        let run_id = store.seed_run(playbook_id, Uuid::new_v4()).await.unwrap();

        let queue = Arc::new(JobQueue::new(RetryPolicy::default()));
        let bus = Arc::new(EventBus::new());
        let dispatcher = Dispatcher::new(
            Arc::clone(&store) as Arc<dyn PlaybookStore>,
            Arc::clone(&queue),
            bus,
            DispatchOptions::default(),
        );
        Fixture {
            store,
            queue,
            dispatcher,
            run_id,
        }
    }

    async fn mark_succeeded(fx: &Fixture, key: &str, output: serde_json::Value) {
        let sr = fx.store.step_run_by_key(fx.run_id, key).await.unwrap();
        fx.store
            .record_step_run_result(sr.id, StepRunState::Succeeded, Some(output), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn fresh_linear_run_enqueues_only_the_root() {
        let fx = fixture(vec![
            step("a", 0, vec![], None),
            step("b", 1, vec!["a"], None),
            step("c", 2, vec!["b"], None),
        ])
        .await;

        let jobs = fx
            .dispatcher
            .dispatch_playbook_run(fx.run_id, None)
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);

        let queued = fx.queue.jobs_for_run(fx.run_id);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].payload.step_key, "a");

        // The run is live, the root queued, the rest waiting.
        let run = fx.store.run(fx.run_id).await.unwrap();
        assert_eq!(run.state, RunState::Running);
        let b = fx.store.step_run_by_key(fx.run_id, "b").await.unwrap();
        assert_eq!(b.state, StepRunState::WaitingForDependencies);
    }

    #[tokio::test]
    async fn independent_roots_enqueue_in_position_order() {
        let fx = fixture(vec![
            step("first", 0, vec![], None),
            step("second", 1, vec![], None),
        ])
        .await;

        let jobs = fx
            .dispatcher
            .dispatch_playbook_run(fx.run_id, None)
            .await
            .unwrap();
        assert_eq!(jobs.len(), 2);

        let first = fx.queue.job(jobs[0]).unwrap();
        let second = fx.queue.job(jobs[1]).unwrap();
        assert_eq!(first.payload.step_key, "first");
        assert_eq!(second.payload.step_key, "second");
    }

    #[tokio::test]
    async fn dependent_dispatch_carries_previous_outputs() {
        let fx = fixture(vec![
            step("a", 0, vec![], None),
            step("b", 1, vec!["a"], None),
        ])
        .await;
        fx.dispatcher
            .dispatch_playbook_run(fx.run_id, None)
            .await
            .unwrap();

        let output = serde_json::json!({"x": 1});
        mark_succeeded(&fx, "a", output.clone()).await;
        let jobs = fx
            .dispatcher
            .dispatch_dependent_steps(fx.run_id, "a", &output)
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);

        let job = fx.queue.job(jobs[0]).unwrap();
        assert_eq!(job.payload.step_key, "b");
        assert_eq!(job.payload.previous_outputs.get("a"), Some(&output));
    }

    #[tokio::test]
    async fn step_waits_for_all_dependencies_in_either_order() {
        for order in [["a", "b"], ["b", "a"]] {
            let fx = fixture(vec![
                step("a", 0, vec![], None),
                step("b", 1, vec![], None),
                step("c", 2, vec!["a", "b"], None),
            ])
            .await;
            fx.dispatcher
                .dispatch_playbook_run(fx.run_id, None)
                .await
                .unwrap();

            let first_output = serde_json::json!({"from": order[0]});
            mark_succeeded(&fx, order[0], first_output.clone()).await;
            let jobs = fx
                .dispatcher
                .dispatch_dependent_steps(fx.run_id, order[0], &first_output)
                .await
                .unwrap();
            assert!(jobs.is_empty(), "c dispatched before {} finished", order[1]);

            let second_output = serde_json::json!({"from": order[1]});
            mark_succeeded(&fx, order[1], second_output.clone()).await;
            let jobs = fx
                .dispatcher
                .dispatch_dependent_steps(fx.run_id, order[1], &second_output)
                .await
                .unwrap();
            assert_eq!(jobs.len(), 1);

            let job = fx.queue.job(jobs[0]).unwrap();
            assert_eq!(job.payload.step_key, "c");
            assert_eq!(job.payload.previous_outputs.len(), 2);
        }
    }

    #[tokio::test]
    async fn template_reference_is_a_dependency() {
        let fx = fixture(vec![
            step("a", 0, vec![], None),
            // No explicit dependencies; the input template references a.
            step("b", 1, vec![], Some("Rewrite {{steps.a.output}}")),
        ])
        .await;

        fx.dispatcher
            .dispatch_playbook_run(fx.run_id, None)
            .await
            .unwrap();
        // Only a is a root.
        assert_eq!(fx.queue.jobs_for_run(fx.run_id).len(), 1);

        let output = serde_json::json!({"text": "draft"});
        mark_succeeded(&fx, "a", output.clone()).await;
        let jobs = fx
            .dispatcher
            .dispatch_dependent_steps(fx.run_id, "a", &output)
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(fx.queue.job(jobs[0]).unwrap().payload.step_key, "b");
    }

    #[tokio::test]
    async fn missing_dependency_step_run_waits_instead_of_erroring() {
        let fx = fixture(vec![
            step("a", 0, vec![], None),
            // Depends on a key that has no step at all.
            step("b", 1, vec!["a", "ghost"], None),
        ])
        .await;
        fx.dispatcher
            .dispatch_playbook_run(fx.run_id, None)
            .await
            .unwrap();

        let output = serde_json::json!({});
        mark_succeeded(&fx, "a", output.clone()).await;
        let jobs = fx
            .dispatcher
            .dispatch_dependent_steps(fx.run_id, "a", &output)
            .await
            .unwrap();
        // The ghost dependency is unsatisfied; b silently keeps waiting.
        assert!(jobs.is_empty());
        let b = fx.store.step_run_by_key(fx.run_id, "b").await.unwrap();
        assert_eq!(b.state, StepRunState::WaitingForDependencies);
    }

    #[tokio::test]
    async fn cancel_marks_active_steps_and_blocks_later_dispatch() {
        let fx = fixture(vec![
            step("a", 0, vec![], None),
            step("b", 1, vec!["a"], None),
        ])
        .await;
        fx.dispatcher
            .dispatch_playbook_run(fx.run_id, None)
            .await
            .unwrap();

        fx.dispatcher.cancel_playbook_run(fx.run_id).await.unwrap();

        let run = fx.store.run(fx.run_id).await.unwrap();
        assert_eq!(run.state, RunState::Canceled);
        assert!(run.completed_at.is_some());
        for key in ["a", "b"] {
            let sr = fx.store.step_run_by_key(fx.run_id, key).await.unwrap();
            assert_eq!(sr.state, StepRunState::Canceled);
        }
        let job = &fx.queue.jobs_for_run(fx.run_id)[0];
        assert_eq!(job.status, pb_core::job::JobStatus::Canceled);

        // Even if a completes out-of-band afterwards, b is never dispatched.
        let output = serde_json::json!({});
        let jobs = fx
            .dispatcher
            .dispatch_dependent_steps(fx.run_id, "a", &output)
            .await
            .unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn dispatching_unknown_run_is_an_error() {
        let fx = fixture(vec![step("a", 0, vec![], None)]).await;
        let err = fx
            .dispatcher
            .dispatch_playbook_run(Uuid::new_v4(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Store(pb_store::StoreError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn run_finalizes_once_every_step_succeeded() {
        let fx = fixture(vec![
            step("a", 0, vec![], None),
            step("b", 1, vec!["a"], None),
        ])
        .await;
        fx.dispatcher
            .dispatch_playbook_run(fx.run_id, None)
            .await
            .unwrap();

        mark_succeeded(&fx, "a", serde_json::json!({})).await;
        mark_succeeded(&fx, "b", serde_json::json!({})).await;
        fx.dispatcher
            .finalize_run_if_complete(fx.run_id)
            .await
            .unwrap();

        let run = fx.store.run(fx.run_id).await.unwrap();
        assert_eq!(run.state, RunState::Completed);
        assert!(run.completed_at.is_some());
    }
}
