//! pb-engine: playbook execution engine.
//!
//! Runs a playbook's step graph as jobs: a priority job queue, a bounded
//! worker pool with retry/backoff, a store-driven dispatcher that unblocks
//! dependent steps as their predecessors succeed, and a per-run event bus
//! for live observers. One engine instance is constructed per process and
//! injected wherever it is needed; there are no global singletons.

pub mod bus;
pub mod dispatcher;
pub mod engine;
pub mod graph;
pub mod logger;
pub mod pool;
pub mod queue;

use pb_store::StoreError;
use thiserror::Error;
use uuid::Uuid;

pub use bus::{EventBus, Subscription};
pub use dispatcher::{DispatchOptions, Dispatcher};
pub use engine::{EngineConfig, ExecutionEngine};
pub use logger::AttemptLogger;
pub use pool::{CompletionHook, PoolConfig, WorkerPool};
pub use queue::{JobContext, JobHandler, JobQueue};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("job not found: {0}")]
    JobNotFound(Uuid),
    #[error("no step run for step '{step_key}' in run {run_id}")]
    StepRunMissing { run_id: Uuid, step_key: String },
    #[error("worker pool already running")]
    PoolAlreadyRunning,
}
