/// Runtime
///
/// Everything that moves workflows forward once they are stored:
/// - Node state machine and phase aggregation
/// - The reconcile pass that schedules DAG tasks
/// - Task backends that actually run containers
/// - The controller loop that drives reconciles
/// - The cron trigger scheduler

// Bounded retry and polling with cancellation
pub mod backoff;

// Node phase transitions, retry attempts and aggregation
pub mod node;

// DAG scheduler: one reconcile pass over a workflow
pub mod engine;

// Task execution backends
pub mod executor;

// Worker pool reconciling live workflows
pub mod controller;

// Cron trigger scheduler built on tokio-cron-scheduler
pub mod scheduler;

// Re-export main types
pub use backoff::Backoff;
pub use controller::{ControllerSettings, WorkflowController};
pub use engine::{EngineSettings, ExecutionEngine, ReconcileOutcome};
pub use executor::{LocalProcessBackend, TaskBackend, TaskRequest, TaskState, TaskStatus};
pub use scheduler::{CronSchedulerService, CronTrigger, TickOutcome};
