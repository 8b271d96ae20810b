/// argosy: DAG workflow orchestration engine
///
/// This library provides the workflow engine: the reconcile pass and node state
/// machine, the status packer, the workflow archive and the cron trigger
/// scheduler, plus the HTTP API and server wiring around them.

// Core configuration and setup
pub mod config;

// Error taxonomy shared by every layer
pub mod error;

// Workflow resources - types, validation, storage, packing and submission
pub mod workflow;

// Relational backing store - archive and offloaded node status
pub mod persist;

// Runtime - engine, task backends, controller and cron scheduler
pub mod runtime;

// HTTP API layer - REST endpoints for workflows, cron workflows and the archive
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use error::{EngineError, Result};
pub use server::start_server;
pub use workflow::{CronWorkflow, Workflow, WorkflowPhase};
