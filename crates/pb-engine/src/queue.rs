//! Job queue — in-memory, priority-ordered job store and execution driver.
//!
//! The queue owns the volatile scheduling state: jobs, their status
//! transitions, the handler registry, and per-job cancellation tokens. All
//! bookkeeping is synchronous under short locks; handler execution is the
//! only awaited operation and no lock is held across it.

use crate::bus::EventBus;
use crate::logger::AttemptLogger;
use crate::EngineError;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use pb_core::event::{RunEvent, RunEventKind};
use pb_core::job::{Job, JobError, JobKind, JobResult, JobStatus, RetryPolicy};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Execution context handed to a handler for one attempt.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job: Job,
    pub worker_id: usize,
    pub logger: AttemptLogger,
    /// Cooperative cancellation signal. A handler that never checks it runs
    /// to completion; the job is still `Canceled` in bookkeeping and its
    /// result triggers no retry and no dependent dispatch.
    pub cancellation: CancellationToken,
}

/// Business logic for one job kind. Registered once per kind; shared across
/// workers.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, ctx: JobContext) -> anyhow::Result<serde_json::Value>;
}

pub struct JobQueue {
    jobs: Mutex<HashMap<Uuid, Job>>,
    handlers: RwLock<HashMap<&'static str, Arc<dyn JobHandler>>>,
    cancellations: Mutex<HashMap<Uuid, CancellationToken>>,
    retry: RetryPolicy,
    bus: Option<Arc<EventBus>>,
}

impl JobQueue {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            cancellations: Mutex::new(HashMap::new()),
            retry,
            bus: None,
        }
    }

    /// A queue that publishes step lifecycle/log events while executing.
    pub fn with_event_bus(retry: RetryPolicy, bus: Arc<EventBus>) -> Self {
        Self {
            bus: Some(bus),
            ..Self::new(retry)
        }
    }

    pub fn register_handler(&self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        self.handlers
            .write()
            .expect("handler registry lock poisoned")
            .insert(kind.as_str(), handler);
    }

    /// Insert a job. Status is forced to `Queued`; an existing attempt
    /// counter (a re-enqueued retry) is preserved.
    pub fn enqueue(&self, mut job: Job) -> Uuid {
        job.status = JobStatus::Queued;
        let id = job.id;
        tracing::debug!(
            job_id = %id,
            step = %job.payload.step_key,
            priority = ?job.priority,
            attempt = job.attempt,
            "job enqueued"
        );
        self.cancellations
            .lock()
            .expect("cancellation map mutex poisoned")
            .entry(id)
            .or_insert_with(CancellationToken::new);
        self.jobs
            .lock()
            .expect("job map mutex poisoned")
            .insert(id, job);
        id
    }

    /// Non-blocking poll: the ready job with the lowest priority rank,
    /// tie-broken by earliest enqueue time. `None` when nothing is ready.
    pub fn next_job(&self) -> Option<Job> {
        let now = Utc::now();
        let jobs = self.jobs.lock().expect("job map mutex poisoned");
        jobs.values()
            .filter(|job| job.is_ready_at(now))
            .min_by_key(|job| (job.priority.rank(), job.created_at))
            .cloned()
    }

    /// Selection plus the `Running` transition under one lock, so two
    /// workers can never claim the same job. Used by the pool; `next_job`
    /// stays available as a pure poll.
    pub fn claim_next_job(&self, worker_id: usize) -> Option<Job> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().expect("job map mutex poisoned");
        let id = jobs
            .values()
            .filter(|job| job.is_ready_at(now))
            .min_by_key(|job| (job.priority.rank(), job.created_at))
            .map(|job| job.id)?;
        let job = jobs.get_mut(&id).expect("selected job present");
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        job.worker_id = Some(worker_id);
        Some(job.clone())
    }

    /// Drive one job through its handler. Never propagates a handler error:
    /// the returned `JobResult` always carries the attempt's duration and
    /// ordered log, with failures (including a missing handler, which is a
    /// non-retryable configuration error) captured inside it.
    pub async fn execute_job(
        &self,
        job_id: Uuid,
        worker_id: usize,
    ) -> Result<JobResult, EngineError> {
        let started = Instant::now();

        let job = {
            let mut jobs = self.jobs.lock().expect("job map mutex poisoned");
            let job = jobs
                .get_mut(&job_id)
                .ok_or(EngineError::JobNotFound(job_id))?;
            if job.status != JobStatus::Running {
                job.status = JobStatus::Running;
                job.started_at = Some(Utc::now());
            }
            job.worker_id = Some(worker_id);
            job.clone()
        };

        let logger = match &self.bus {
            Some(bus) => AttemptLogger::with_bus(
                job.payload.run_id,
                job.payload.step_key.clone(),
                Arc::clone(bus),
            ),
            None => AttemptLogger::new(job.payload.run_id, job.payload.step_key.clone()),
        };

        self.publish_step_event(
            &job,
            RunEventKind::StepUpdated,
            serde_json::json!({"status": "running", "attempt": job.attempt}),
        );

        let handler = self
            .handlers
            .read()
            .expect("handler registry lock poisoned")
            .get(job.kind.as_str())
            .cloned();

        let Some(handler) = handler else {
            let message = format!("no handler registered for job type '{}'", job.kind.as_str());
            logger.error(&message);
            let error = JobError::new(message).not_retryable();
            let result = JobResult::failure(
                error.clone(),
                started.elapsed().as_millis() as u64,
                logger.take_entries(),
            );
            self.finalize(job_id, JobStatus::Failed, Some(error));
            return Ok(result);
        };

        let cancellation = self.cancellation_token(job_id);
        let ctx = JobContext {
            job: job.clone(),
            worker_id,
            logger: logger.clone(),
            cancellation,
        };

        let outcome = handler.execute(ctx).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(output) => {
                self.finalize(job_id, JobStatus::Completed, None);
                JobResult::success(output, duration_ms, logger.take_entries())
            }
            Err(err) => {
                let message = err.to_string();
                logger.error(format!("step execution failed: {message}"));
                let error = JobError::new(message).with_stack(format!("{err:?}"));
                self.finalize(job_id, JobStatus::Failed, Some(error.clone()));
                JobResult::failure(error, duration_ms, logger.take_entries())
            }
        };
        Ok(result)
    }

    /// Schedule a retry with exponential backoff. Returns false when the
    /// attempt budget is exhausted (or the job is already terminal), leaving
    /// the job terminal-failed rather than rescheduled.
    pub fn retry_job(&self, job_id: Uuid) -> bool {
        let mut jobs = self.jobs.lock().expect("job map mutex poisoned");
        let Some(job) = jobs.get_mut(&job_id) else {
            return false;
        };
        if matches!(job.status, JobStatus::Canceled | JobStatus::Completed) {
            return false;
        }
        if job.attempt + 1 > job.max_attempts {
            return false;
        }
        job.attempt += 1;
        job.status = JobStatus::Retrying;
        let delay = self.retry.delay_for_attempt(job.attempt);
        job.scheduled_at = Some(
            Utc::now()
                + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero()),
        );
        tracing::debug!(
            job_id = %job_id,
            step = %job.payload.step_key,
            attempt = job.attempt,
            delay_ms = delay.as_millis() as u64,
            "job retry scheduled"
        );
        true
    }

    /// Cooperative cancel. A queued or retrying job becomes terminal
    /// immediately; a running job is marked and its token triggered, but the
    /// in-flight handler is not preempted.
    pub fn cancel_job(&self, job_id: Uuid) -> bool {
        let mut jobs = self.jobs.lock().expect("job map mutex poisoned");
        let Some(job) = jobs.get_mut(&job_id) else {
            return false;
        };
        if job.status.is_terminal() {
            return false;
        }
        let was_running = job.status == JobStatus::Running;
        job.status = JobStatus::Canceled;
        if !was_running {
            job.completed_at = Some(Utc::now());
        }
        drop(jobs);

        if let Some(token) = self
            .cancellations
            .lock()
            .expect("cancellation map mutex poisoned")
            .get(&job_id)
        {
            token.cancel();
        }
        tracing::debug!(job_id = %job_id, was_running, "job canceled");
        true
    }

    /// Mark a job terminal-failed outside the normal execution path (used by
    /// the pool when an executing task panics).
    pub fn fail_job(&self, job_id: Uuid, error: JobError) {
        self.finalize(job_id, JobStatus::Failed, Some(error));
    }

    /// Purge terminal jobs whose completion is older than `max_age`.
    /// Returns the number removed; active jobs are untouched.
    pub fn cleanup(&self, max_age: std::time::Duration) -> usize {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(max_age).unwrap_or_else(|_| ChronoDuration::zero());
        let mut jobs = self.jobs.lock().expect("job map mutex poisoned");
        let removed_ids: Vec<Uuid> = jobs
            .values()
            .filter(|job| {
                job.status.is_terminal() && job.completed_at.map_or(false, |at| at < cutoff)
            })
            .map(|job| job.id)
            .collect();
        for id in &removed_ids {
            jobs.remove(id);
        }
        drop(jobs);

        let mut cancellations = self
            .cancellations
            .lock()
            .expect("cancellation map mutex poisoned");
        for id in &removed_ids {
            cancellations.remove(id);
        }
        removed_ids.len()
    }

    pub fn job(&self, job_id: Uuid) -> Option<Job> {
        self.jobs
            .lock()
            .expect("job map mutex poisoned")
            .get(&job_id)
            .cloned()
    }

    /// All jobs belonging to one run.
    pub fn jobs_for_run(&self, run_id: Uuid) -> Vec<Job> {
        self.jobs
            .lock()
            .expect("job map mutex poisoned")
            .values()
            .filter(|job| job.payload.run_id == run_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().expect("job map mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cancellation_token(&self, job_id: Uuid) -> CancellationToken {
        self.cancellations
            .lock()
            .expect("cancellation map mutex poisoned")
            .entry(job_id)
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Terminal bookkeeping after an attempt. A job canceled mid-flight
    /// keeps its `Canceled` status; only the completion timestamp is
    /// stamped.
    fn finalize(&self, job_id: Uuid, status: JobStatus, error: Option<JobError>) {
        let mut jobs = self.jobs.lock().expect("job map mutex poisoned");
        let Some(job) = jobs.get_mut(&job_id) else {
            return;
        };
        if job.status != JobStatus::Canceled {
            job.status = status;
            job.error = error;
        }
        job.completed_at = Some(Utc::now());
    }

    fn publish_step_event(&self, job: &Job, kind: RunEventKind, payload: serde_json::Value) {
        if let Some(bus) = &self.bus {
            bus.publish(&RunEvent::step(
                kind,
                job.payload.run_id,
                job.payload.step_key.clone(),
                payload,
            ));
        }
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("jobs", &self.len())
            .finish_non_exhaustive()
    }
}
