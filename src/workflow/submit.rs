/// Workflow submission
///
/// The single entry point through which new workflows come to life: the HTTP
/// API, the cron trigger and archive resubmission all call `submit`.

use crate::error::{EngineError, Result};
use crate::runtime::backoff::{retry_with_backoff, Backoff, RetryError};
use crate::workflow::{
    storage::WorkflowStore,
    types::{ShutdownStrategy, Workflow, WorkflowStatus},
    validate::validate_workflow,
};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Attempts at finding a free generated name
const GENERATE_NAME_ATTEMPTS: usize = 5;

/// Creates workflows in the resource store
#[derive(Clone)]
pub struct WorkflowSubmitter {
    store: WorkflowStore,
    default_namespace: String,
}

impl WorkflowSubmitter {
    pub fn new(store: WorkflowStore, default_namespace: impl Into<String>) -> Self {
        Self {
            store,
            default_namespace: default_namespace.into(),
        }
    }

    pub fn store(&self) -> &WorkflowStore {
        &self.store
    }

    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    /// Validate and create a new workflow
    ///
    /// A fresh UID and creation timestamp are always assigned and any incoming
    /// status is discarded. When only `generate_name` is set, a random suffix is
    /// appended and collisions are retried with a new suffix; an explicit name
    /// that is already taken fails with `AlreadyExists`.
    pub async fn submit(&self, mut workflow: Workflow) -> Result<Workflow> {
        if workflow.metadata.namespace.is_empty() {
            workflow.metadata.namespace = self.default_namespace.clone();
        }
        validate_workflow(&workflow)?;

        workflow.status = WorkflowStatus::default();
        workflow.spec.shutdown = None;
        workflow.metadata.resource_version = 0;

        if !workflow.metadata.name.is_empty() {
            return self.create(workflow).await;
        }

        let prefix = match workflow.metadata.generate_name.clone() {
            Some(prefix) if !prefix.is_empty() => prefix,
            _ => {
                return Err(EngineError::Validation(
                    "metadata.name or metadata.generateName is required".to_string(),
                ))
            }
        };

        for _ in 0..GENERATE_NAME_ATTEMPTS {
            let mut candidate = workflow.clone();
            candidate.metadata.name = format!("{}{}", prefix, random_suffix());
            match self.create(candidate).await {
                Err(EngineError::AlreadyExists(msg)) => {
                    tracing::debug!("🎲 Generated name collided ({}), trying another", msg);
                }
                other => return other,
            }
        }
        Err(EngineError::AlreadyExists(format!(
            "no free name with prefix '{}' after {} attempts",
            prefix, GENERATE_NAME_ATTEMPTS
        )))
    }

    async fn create(&self, mut workflow: Workflow) -> Result<Workflow> {
        workflow.metadata.uid = Uuid::new_v4().to_string();
        workflow.metadata.creation_timestamp = Some(Utc::now());
        let created = self.store.create(&workflow).await?;
        tracing::info!(
            "📨 Submitted workflow {} (uid {})",
            created.metadata.key(),
            created.metadata.uid
        );
        Ok(created)
    }

    /// Request a graceful shutdown; the exit handler still runs
    pub async fn stop(&self, namespace: &str, name: &str) -> Result<Workflow> {
        self.shutdown(namespace, name, ShutdownStrategy::Stop).await
    }

    /// Request an immediate shutdown; the exit handler is skipped
    pub async fn terminate(&self, namespace: &str, name: &str) -> Result<Workflow> {
        self.shutdown(namespace, name, ShutdownStrategy::Terminate).await
    }

    async fn shutdown(&self, namespace: &str, name: &str, strategy: ShutdownStrategy) -> Result<Workflow> {
        retry_with_backoff(
            &Backoff::default(),
            &CancellationToken::new(),
            || self.try_shutdown(namespace, name, strategy),
            |e| matches!(e, EngineError::Conflict(_)),
        )
        .await
        .map_err(flatten_retry)
    }

    async fn try_shutdown(&self, namespace: &str, name: &str, strategy: ShutdownStrategy) -> Result<Workflow> {
        let mut workflow = self.store.get(namespace, name).await?;
        if workflow.is_completed() {
            return Err(EngineError::Validation(format!(
                "workflow {} has already completed",
                workflow.metadata.key()
            )));
        }
        if workflow.spec.shutdown == Some(strategy) {
            return Ok(workflow);
        }
        workflow.spec.shutdown = Some(strategy);
        let updated = self.store.update(&workflow).await?;
        tracing::info!("🛑 Shutdown ({:?}) requested for {}", strategy, updated.metadata.key());
        Ok(updated)
    }
}

/// Collapse a retry outcome back into the engine error it carried
pub(crate) fn flatten_retry(err: RetryError<EngineError>) -> EngineError {
    err.into_inner()
        .unwrap_or_else(|| EngineError::Infrastructure("operation cancelled".to_string()))
}

fn random_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..5].to_string()
}
