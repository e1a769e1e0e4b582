//! Cairn - run orchestrator.
//!
//! Turns one research/work request into a supervised graph of parallel
//! subtasks, drives each through a bounded lifecycle, schedules work fairly
//! across tenants, recovers from partial failure, and aggregates results
//! into one outcome. Designed for multiple concurrent orchestrator processes
//! sharing one store and queue: coordination happens through run-level
//! leases, optimistic versioning, and idempotent dispatch, never through
//! process-local state.

pub mod aggregator;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod handlers;
pub mod lifecycle;
pub mod model;
pub mod monitors;
pub mod planner;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use aggregator::{Aggregator, CollectReducer, ResultReducer};
pub use config::{DispatcherConfig, MonitorConfig, OrchestratorConfig, LIFECYCLE_QUEUE};
pub use dispatch::LifecycleDispatcher;
pub use error::{OrchestratorError, OrchestratorResult};
pub use events::{Event, EventBus, EventHandler, EventKind, InProcessEventBus};
pub use handlers::{CompletionHandler, FailureHandler};
pub use lifecycle::{enqueue_tick, FinalizeHook, RunLifecycleManager};
pub use model::{
    Checkpoint, ErrorRecord, ExecutionToken, LeaseToken, Run, RunId, RunLease, RunOutcome,
    RunProgress, RunSettings, RunState, Subtask, SubtaskId, SubtaskKind, SubtaskState, TenantId,
    TransitionEntity, TransitionRecord, WorkerId,
};
pub use monitors::{spawn_monitors, DeadlineMonitor, MonitorSet, ProgressMonitor, StallMonitor};
pub use planner::{
    DecomposeRequest, DecompositionPlan, PlannedSubtask, Planner, ValidationOutcome,
};
pub use queue::{JobQueue, MemoryQueue, PostgresQueue, QueuedJob};
pub use scheduler::{
    backoff_delay, compute_priority, fairness_multiplier, DispatchDecision, SubtaskScheduler,
};
pub use store::{DispatchWindow, MemoryStore, PostgresStore, Store};
pub use worker::WorkerClient;
