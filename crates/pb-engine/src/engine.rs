//! Engine composition root.
//!
//! One `ExecutionEngine` is constructed per process — typically in the
//! server's startup routine — and handed to whatever needs to dispatch
//! runs or stream their progress. The queue, bus, pool, and dispatcher are
//! plain injected instances; nothing here is a global.

use crate::bus::{EventBus, Subscription};
use crate::dispatcher::{DispatchOptions, Dispatcher};
use crate::pool::{CompletionHook, PoolConfig, WorkerPool};
use crate::queue::{JobHandler, JobQueue};
use crate::EngineError;
use pb_core::event::RunEvent;
use pb_core::job::{JobKind, RetryPolicy};
use pb_core::worker::Worker;
use pb_store::PlaybookStore;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub retry: RetryPolicy,
}

pub struct ExecutionEngine {
    queue: Arc<JobQueue>,
    bus: Arc<EventBus>,
    dispatcher: Arc<Dispatcher>,
    pool: WorkerPool,
}

impl ExecutionEngine {
    pub fn new(store: Arc<dyn PlaybookStore>, config: EngineConfig) -> Self {
        let bus = Arc::new(EventBus::new());
        let queue = Arc::new(JobQueue::with_event_bus(
            config.retry.clone(),
            Arc::clone(&bus),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            store,
            Arc::clone(&queue),
            Arc::clone(&bus),
            DispatchOptions {
                max_attempts: config.retry.max_attempts,
                ..DispatchOptions::default()
            },
        ));
        let pool = WorkerPool::new(
            Arc::clone(&queue),
            Some(Arc::clone(&dispatcher) as Arc<dyn CompletionHook>),
            config.pool,
        );
        Self {
            queue,
            bus,
            dispatcher,
            pool,
        }
    }

    /// Register the business logic for a job kind. Step-type implementers
    /// call this once at startup, before `start`.
    pub fn register_handler(&self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        self.queue.register_handler(kind, handler);
    }

    pub fn start(&self) -> Result<(), EngineError> {
        self.pool.start()
    }

    /// Stop polling and drain in-flight work.
    pub async fn stop(&self) {
        self.pool.stop().await;
    }

    pub async fn dispatch_run(
        &self,
        run_id: Uuid,
        options: Option<DispatchOptions>,
    ) -> Result<Vec<Uuid>, EngineError> {
        self.dispatcher.dispatch_playbook_run(run_id, options).await
    }

    pub async fn cancel_run(&self, run_id: Uuid) -> Result<(), EngineError> {
        self.dispatcher.cancel_playbook_run(run_id).await
    }

    /// Observe a run's lifecycle events; dropping the subscription detaches.
    pub fn subscribe(
        &self,
        run_id: Uuid,
        handler: impl Fn(&RunEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.bus.subscribe(run_id, handler)
    }

    /// Channel form of `subscribe`, for SSE/WebSocket adapters.
    pub fn subscribe_channel(
        &self,
        run_id: Uuid,
    ) -> (Subscription, mpsc::UnboundedReceiver<RunEvent>) {
        self.bus.subscribe_channel(run_id)
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn workers(&self) -> Vec<Worker> {
        self.pool.workers()
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobContext;
    use async_trait::async_trait;
    use pb_core::event::RunEventKind;
    use pb_core::run::{RunState, Step, StepConfig, StepRunState};
    use pb_store::MemoryStore;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn step(key: &str, position: u32, deps: Vec<&str>) -> Step {
        Step {
            id: Uuid::new_v4(),
            key: key.into(),
            step_type: "generate_content".into(),
            position,
            config: StepConfig {
                dependencies: deps.into_iter().map(String::from).collect(),
                input: None,
                extra: Default::default(),
            },
            next_step_key: None,
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            pool: PoolConfig {
                max_concurrency: 2,
                poll_interval: Duration::from_millis(5),
            },
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 5,
                multiplier: 1.0,
                max_delay_ms: 5,
            },
        }
    }

    async fn wait_for_run_state(store: &MemoryStore, run_id: Uuid, state: RunState) {
        for _ in 0..1000 {
            if store.run(run_id).await.unwrap().state == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("run never reached {state:?}");
    }

    /// Records outputs per step key and echoes the accumulated inputs.
    struct RecordingHandler {
        calls_per_step: Mutex<HashMap<String, u32>>,
        seen_previous: Mutex<HashMap<String, Vec<String>>>,
        fail_step: Option<(String, u32)>,
        counter: AtomicU32,
    }

    impl RecordingHandler {
        fn new(fail_step: Option<(&str, u32)>) -> Self {
            Self {
                calls_per_step: Mutex::new(HashMap::new()),
                seen_previous: Mutex::new(HashMap::new()),
                fail_step: fail_step.map(|(k, n)| (k.to_string(), n)),
                counter: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl JobHandler for RecordingHandler {
        async fn execute(&self, ctx: JobContext) -> anyhow::Result<serde_json::Value> {
            let key = ctx.job.payload.step_key.clone();
            let call = {
                let mut calls = self.calls_per_step.lock().unwrap();
                let entry = calls.entry(key.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            self.seen_previous.lock().unwrap().insert(
                key.clone(),
                ctx.job.payload.previous_outputs.keys().cloned().collect(),
            );

            if let Some((fail_key, until)) = &self.fail_step {
                if *fail_key == key && call < *until {
                    anyhow::bail!("transient failure in {key}, call {call}")
                }
            }

            ctx.logger.info(format!("step {key} finished"));
            let seq = self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!({"step": key, "seq": seq}))
        }
    }

    #[tokio::test]
    async fn linear_run_with_flaky_middle_step_completes() {
        init_tracing();
        let store = Arc::new(MemoryStore::new());
        let playbook_id = Uuid::new_v4();
        store
            .insert_steps(
                playbook_id,
                vec![
                    step("a", 0, vec![]),
                    step("b", 1, vec!["a"]),
                    step("c", 2, vec!["b"]),
                ],
            )
            .await;
        let run_id = store.seed_run(playbook_id, Uuid::new_v4()).await.unwrap();

        let engine = ExecutionEngine::new(
            Arc::clone(&store) as Arc<dyn PlaybookStore>,
            fast_config(),
        );
        // b fails twice and succeeds on the third attempt.
        let handler = Arc::new(RecordingHandler::new(Some(("b", 3))));
        engine.register_handler(JobKind::ExecuteStep, Arc::clone(&handler) as Arc<dyn JobHandler>);
        engine.start().unwrap();

        let (_sub, mut events) = engine.subscribe_channel(run_id);

        let initial = engine.dispatch_run(run_id, None).await.unwrap();
        // Fresh dispatch enqueues only the root.
        assert_eq!(initial.len(), 1);

        wait_for_run_state(&store, run_id, RunState::Completed).await;
        engine.stop().await;

        // b took three attempts; c ran only after the third succeeded.
        let calls = handler.calls_per_step.lock().unwrap().clone();
        assert_eq!(calls["a"], 1);
        assert_eq!(calls["b"], 3);
        assert_eq!(calls["c"], 1);

        // c saw both upstream outputs.
        let previous = handler.seen_previous.lock().unwrap().clone();
        assert!(previous["a"].is_empty());
        assert_eq!(previous["b"], vec!["a"]);
        assert_eq!(previous["c"], vec!["a", "b"]);

        // Live observers saw the lifecycle, ending in run.completed.
        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind);
        }
        assert!(kinds.contains(&RunEventKind::StepCompleted));
        assert!(kinds.contains(&RunEventKind::StepLogAppended));
        assert_eq!(kinds.last(), Some(&RunEventKind::RunCompleted));

        // Outputs of every step are persisted.
        for key in ["a", "b", "c"] {
            let sr = store.step_run_by_key(run_id, key).await.unwrap();
            assert_eq!(sr.state, StepRunState::Succeeded);
            assert!(sr.output.is_some());
        }
    }

    #[tokio::test]
    async fn independent_steps_run_and_finalize() {
        init_tracing();
        let store = Arc::new(MemoryStore::new());
        let playbook_id = Uuid::new_v4();
        store
            .insert_steps(
                playbook_id,
                vec![step("left", 0, vec![]), step("right", 1, vec![])],
            )
            .await;
        let run_id = store.seed_run(playbook_id, Uuid::new_v4()).await.unwrap();

        let engine = ExecutionEngine::new(
            Arc::clone(&store) as Arc<dyn PlaybookStore>,
            fast_config(),
        );
        let handler = Arc::new(RecordingHandler::new(None));
        engine.register_handler(JobKind::ExecuteStep, Arc::clone(&handler) as Arc<dyn JobHandler>);
        engine.start().unwrap();

        // Both zero-dependency steps enqueue on the initial dispatch.
        let initial = engine.dispatch_run(run_id, None).await.unwrap();
        assert_eq!(initial.len(), 2);

        wait_for_run_state(&store, run_id, RunState::Completed).await;
        engine.stop().await;

        let calls = handler.calls_per_step.lock().unwrap().clone();
        assert_eq!(calls["left"], 1);
        assert_eq!(calls["right"], 1);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_run() {
        init_tracing();
        let store = Arc::new(MemoryStore::new());
        let playbook_id = Uuid::new_v4();
        store
            .insert_steps(
                playbook_id,
                vec![step("a", 0, vec![]), step("b", 1, vec!["a"])],
            )
            .await;
        let run_id = store.seed_run(playbook_id, Uuid::new_v4()).await.unwrap();

        let engine = ExecutionEngine::new(
            Arc::clone(&store) as Arc<dyn PlaybookStore>,
            fast_config(),
        );
        // a never succeeds.
        let handler = Arc::new(RecordingHandler::new(Some(("a", u32::MAX))));
        engine.register_handler(JobKind::ExecuteStep, Arc::clone(&handler) as Arc<dyn JobHandler>);
        engine.start().unwrap();

        let (_sub, mut events) = engine.subscribe_channel(run_id);
        engine.dispatch_run(run_id, None).await.unwrap();

        wait_for_run_state(&store, run_id, RunState::Failed).await;
        engine.stop().await;

        // Initial execution plus max_attempts retries, then terminal.
        let calls = handler.calls_per_step.lock().unwrap().clone();
        assert_eq!(calls["a"], 4);
        assert!(!handler.calls_per_step.lock().unwrap().contains_key("b"));

        let a = store.step_run_by_key(run_id, "a").await.unwrap();
        assert_eq!(a.state, StepRunState::Failed);
        assert!(a.error.is_some());

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind);
        }
        assert!(kinds.contains(&RunEventKind::StepFailed));
        assert!(kinds.contains(&RunEventKind::RunFailed));
    }

    #[tokio::test]
    async fn cancel_stops_waiting_steps_for_good() {
        init_tracing();
        let store = Arc::new(MemoryStore::new());
        let playbook_id = Uuid::new_v4();
        store
            .insert_steps(
                playbook_id,
                vec![step("a", 0, vec![]), step("b", 1, vec!["a"])],
            )
            .await;
        let run_id = store.seed_run(playbook_id, Uuid::new_v4()).await.unwrap();

        struct BlockingHandler;

        #[async_trait]
        impl JobHandler for BlockingHandler {
            async fn execute(&self, ctx: JobContext) -> anyhow::Result<serde_json::Value> {
                // Cooperative: hold the slot until canceled.
                ctx.cancellation.cancelled().await;
                Ok(serde_json::Value::Null)
            }
        }

        let engine = ExecutionEngine::new(
            Arc::clone(&store) as Arc<dyn PlaybookStore>,
            fast_config(),
        );
        engine.register_handler(JobKind::ExecuteStep, Arc::new(BlockingHandler));
        engine.start().unwrap();

        engine.dispatch_run(run_id, None).await.unwrap();

        // Wait until a is actually running in a worker.
        for _ in 0..500 {
            let jobs = engine.queue().jobs_for_run(run_id);
            if jobs
                .iter()
                .any(|j| j.status == pb_core::job::JobStatus::Running)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        engine.cancel_run(run_id).await.unwrap();
        wait_for_run_state(&store, run_id, RunState::Canceled).await;
        engine.stop().await;

        // Both step-runs canceled: the running one and the waiting one.
        for key in ["a", "b"] {
            let sr = store.step_run_by_key(run_id, key).await.unwrap();
            assert_eq!(sr.state, StepRunState::Canceled, "step {key}");
        }

        // b is never dispatched, even if a's success arrives out-of-band.
        let queued_before = engine.queue().jobs_for_run(run_id).len();
        let sr = store.step_run_by_key(run_id, "a").await.unwrap();
        store
            .record_step_run_result(
                sr.id,
                StepRunState::Succeeded,
                Some(serde_json::json!({})),
                None,
            )
            .await
            .unwrap();
        let dispatched = engine
            .dispatcher
            .dispatch_dependent_steps(run_id, "a", &serde_json::json!({}))
            .await
            .unwrap();
        assert!(dispatched.is_empty());
        assert_eq!(engine.queue().jobs_for_run(run_id).len(), queued_before);
    }
}
