/// Workflow resources
///
/// This module handles workflow definitions and how they are stored:
/// - Type definitions (Workflow, CronWorkflow, NodeStatus)
/// - Submission validation and guard conditions
/// - The resource store with optimistic concurrency and watch
/// - Status packing for oversized node maps

// Core workflow type definitions
pub mod types;

// Structural checks applied at submission
pub mod validate;

// `when` guard evaluation for DAG tasks
pub mod guard;

// Resource store over SQLite with compare-and-swap updates
pub mod storage;

// Node map compression
pub mod packer;

// Submission entry point shared by the API, cron and archive
pub mod submit;

// Re-export commonly used types
pub use storage::{CronWorkflowStore, ResourceStore, SqliteResourceStore, WorkflowStore};
pub use submit::WorkflowSubmitter;
pub use types::{CronWorkflow, NodePhase, NodeStatus, Workflow, WorkflowPhase};
