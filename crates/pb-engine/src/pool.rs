//! Worker pool — a fixed set of reusable execution slots fed by a polling
//! loop.
//!
//! The pool provides the only true concurrency in the engine: up to
//! `max_concurrency` job handlers run in parallel. Each poll tick assigns
//! ready jobs to observed-idle workers; assignment is synchronous within the
//! tick while execution is spawned, with one in-flight handle per worker so
//! `stop()` can drain before returning.

use crate::queue::JobQueue;
use crate::EngineError;
use async_trait::async_trait;
use chrono::Utc;
use pb_core::job::{Job, JobError, JobResult, JobStatus};
use pb_core::worker::{Worker, WorkerStatus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Fixed worker count; there is no dynamic scaling.
    pub max_concurrency: usize,
    pub poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Receives terminal job outcomes from workers. The dispatcher implements
/// this to unblock dependents and finalize runs without the queue depending
/// on the dispatcher.
#[async_trait]
pub trait CompletionHook: Send + Sync {
    async fn on_job_succeeded(&self, job: &Job, result: &JobResult);

    /// `will_retry` is true when the queue accepted a retry request; false
    /// means the failure is terminal.
    async fn on_job_failed(&self, job: &Job, result: &JobResult, will_retry: bool);
}

struct PoolInner {
    queue: Arc<JobQueue>,
    hook: Option<Arc<dyn CompletionHook>>,
    config: PoolConfig,
    workers: Mutex<Vec<Worker>>,
    inflight: Mutex<HashMap<usize, JoinHandle<()>>>,
}

pub struct WorkerPool {
    inner: Arc<PoolInner>,
    shutdown_tx: watch::Sender<bool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<JobQueue>,
        hook: Option<Arc<dyn CompletionHook>>,
        config: PoolConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(PoolInner {
                queue,
                hook,
                config,
                workers: Mutex::new(Vec::new()),
                inflight: Mutex::new(HashMap::new()),
            }),
            shutdown_tx,
            loop_handle: Mutex::new(None),
        }
    }

    /// Initialize the worker slots and begin polling.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut handle = self.loop_handle.lock().expect("loop handle mutex poisoned");
        if handle.is_some() {
            return Err(EngineError::PoolAlreadyRunning);
        }

        {
            let mut workers = self.inner.workers.lock().expect("worker list mutex poisoned");
            *workers = (0..self.inner.config.max_concurrency.max(1))
                .map(Worker::new)
                .collect();
        }
        let _ = self.shutdown_tx.send(false);

        tracing::info!(
            workers = self.inner.config.max_concurrency,
            poll_interval_ms = self.inner.config.poll_interval.as_millis() as u64,
            "worker pool started"
        );

        let inner = Arc::clone(&self.inner);
        let shutdown_rx = self.shutdown_tx.subscribe();
        *handle = Some(tokio::spawn(Self::poll_loop(inner, shutdown_rx)));
        Ok(())
    }

    async fn poll_loop(inner: Arc<PoolInner>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval(inner.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    Self::tick(&inner).await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        tracing::info!("worker pool shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn tick(inner: &Arc<PoolInner>) {
        Self::reap_finished(inner).await;

        let idle: Vec<usize> = {
            let workers = inner.workers.lock().expect("worker list mutex poisoned");
            workers
                .iter()
                .filter(|w| w.status == WorkerStatus::Idle)
                .map(|w| w.id)
                .collect()
        };

        for worker_id in idle {
            // No ready job means nothing for the remaining idle workers
            // either; stop scanning this tick.
            let Some(job) = inner.queue.claim_next_job(worker_id) else {
                break;
            };

            {
                let mut workers = inner.workers.lock().expect("worker list mutex poisoned");
                if let Some(worker) = workers.iter_mut().find(|w| w.id == worker_id) {
                    worker.status = WorkerStatus::Busy;
                    worker.current_job = Some(job.id);
                }
            }

            let task_inner = Arc::clone(inner);
            let handle = tokio::spawn(async move {
                Self::run_one(task_inner, worker_id, job).await;
            });
            inner
                .inflight
                .lock()
                .expect("inflight map mutex poisoned")
                .insert(worker_id, handle);
        }
    }

    /// Await workers whose task already finished. A panicked task (a handler
    /// bug) must not leave its slot busy forever: the job is terminal-failed
    /// and the worker returned to idle.
    async fn reap_finished(inner: &Arc<PoolInner>) {
        let finished: Vec<(usize, JoinHandle<()>)> = {
            let mut inflight = inner.inflight.lock().expect("inflight map mutex poisoned");
            let ids: Vec<usize> = inflight
                .iter()
                .filter(|(_, handle)| handle.is_finished())
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| inflight.remove(&id).map(|h| (id, h)))
                .collect()
        };

        for (worker_id, handle) in finished {
            if let Err(join_err) = handle.await {
                tracing::error!(worker_id, error = %join_err, "worker task panicked");
                let job_id = {
                    let workers = inner.workers.lock().expect("worker list mutex poisoned");
                    workers
                        .iter()
                        .find(|w| w.id == worker_id)
                        .and_then(|w| w.current_job)
                };
                if let Some(job_id) = job_id {
                    inner.queue.fail_job(
                        job_id,
                        JobError::new(format!("worker task panicked: {join_err}")),
                    );
                }
                Self::release_worker(inner, worker_id);
            }
        }
    }

    async fn run_one(inner: Arc<PoolInner>, worker_id: usize, job: Job) {
        match inner.queue.execute_job(job.id, worker_id).await {
            Err(err) => {
                tracing::error!(job_id = %job.id, error = %err, "job execution failed to start");
            }
            Ok(result) => {
                // Re-read the job: it may have been canceled mid-flight, in
                // which case neither retry nor completion hooks apply.
                let refreshed = inner.queue.job(job.id);
                match refreshed {
                    Some(current) if current.status == JobStatus::Canceled => {
                        tracing::debug!(
                            job_id = %job.id,
                            step = %job.payload.step_key,
                            "job canceled during execution; result recorded, no follow-up"
                        );
                    }
                    Some(current) => {
                        if result.success {
                            if let Some(hook) = &inner.hook {
                                hook.on_job_succeeded(&current, &result).await;
                            }
                        } else {
                            let retryable =
                                result.error.as_ref().map_or(true, |e| e.retryable);
                            // The worker requests the retry; the queue decides
                            // whether the budget allows it and when it runs.
                            let will_retry = retryable && inner.queue.retry_job(job.id);
                            if let Some(hook) = &inner.hook {
                                hook.on_job_failed(&current, &result, will_retry).await;
                            }
                        }
                    }
                    None => {
                        tracing::warn!(job_id = %job.id, "job disappeared during execution");
                    }
                }
            }
        }

        Self::release_worker(&inner, worker_id);
    }

    fn release_worker(inner: &Arc<PoolInner>, worker_id: usize) {
        let mut workers = inner.workers.lock().expect("worker list mutex poisoned");
        if let Some(worker) = workers.iter_mut().find(|w| w.id == worker_id) {
            if worker.status != WorkerStatus::Stopped {
                worker.status = WorkerStatus::Idle;
            }
            worker.current_job = None;
            worker.jobs_processed += 1;
            worker.last_completed_at = Some(Utc::now());
        }
    }

    /// Halt polling and await every in-flight execution; no job is abandoned
    /// mid-flight.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);

        let handle = self
            .loop_handle
            .lock()
            .expect("loop handle mutex poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let inflight: Vec<JoinHandle<()>> = {
            let mut map = self
                .inner
                .inflight
                .lock()
                .expect("inflight map mutex poisoned");
            map.drain().map(|(_, handle)| handle).collect()
        };
        for handle in inflight {
            let _ = handle.await;
        }

        let mut workers = self
            .inner
            .workers
            .lock()
            .expect("worker list mutex poisoned");
        for worker in workers.iter_mut() {
            worker.status = WorkerStatus::Stopped;
            worker.current_job = None;
        }
        tracing::info!("worker pool stopped");
    }

    pub fn is_running(&self) -> bool {
        self.loop_handle
            .lock()
            .expect("loop handle mutex poisoned")
            .is_some()
    }

    /// Snapshot of the worker slots.
    pub fn workers(&self) -> Vec<Worker> {
        self.inner
            .workers
            .lock()
            .expect("worker list mutex poisoned")
            .clone()
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("max_concurrency", &self.inner.config.max_concurrency)
            .finish_non_exhaustive()
    }
}
