/// Workflow controller
///
/// Owns live workflows: a pool of workers pulls workflow keys off a queue fed by
/// the store's watch stream and a periodic resync, and runs fetch → hydrate →
/// reconcile → dehydrate → conditional update → commit for each. Writes for one
/// workflow are serialized behind a per-key lock; different workflows proceed
/// in parallel. Completed workflows release their backend tasks, are handed to
/// the archive and drop out of the controller's bookkeeping.

use crate::error::{EngineError, Result, StoreError};
use crate::persist::{ArchiveRepository, StatusPersister};
use crate::runtime::{backoff::Backoff, engine::ExecutionEngine};
use crate::workflow::{
    storage::{WatchEvent, WatchEventKind, WorkflowStore},
    types::{LabelSelector, Workflow, WorkflowPhase, ARCHIVING_STATUS_LABEL},
};
use chrono::Utc;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Value of the archiving label once the archive row exists
pub const ARCHIVED: &str = "Archived";

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub workers: usize,
    pub resync: Duration,
    /// Archive completed workflows matching `archive_selector`
    pub archive: bool,
    pub archive_selector: LabelSelector,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            workers: 8,
            resync: Duration::from_secs(2),
            archive: true,
            archive_selector: LabelSelector::default(),
        }
    }
}

/// Deduplicating work queue of `namespace/name` keys
struct WorkQueue {
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<mpsc::UnboundedReceiver<String>>,
    queued: StdMutex<HashSet<String>>,
}

impl WorkQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            queued: StdMutex::new(HashSet::new()),
        }
    }

    fn add(&self, key: String) {
        let fresh = match self.queued.lock() {
            Ok(mut queued) => queued.insert(key.clone()),
            Err(_) => true,
        };
        if fresh {
            let _ = self.tx.send(key);
        }
    }

    async fn next(&self) -> Option<String> {
        let key = self.rx.lock().await.recv().await?;
        if let Ok(mut queued) = self.queued.lock() {
            queued.remove(&key);
        }
        Some(key)
    }
}

/// Reconciles every live workflow in the store
pub struct WorkflowController {
    store: WorkflowStore,
    engine: ExecutionEngine,
    persister: StatusPersister,
    archive: ArchiveRepository,
    settings: ControllerSettings,
    queue: WorkQueue,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    failures: StdMutex<HashMap<String, u32>>,
}

impl WorkflowController {
    pub fn new(
        store: WorkflowStore,
        engine: ExecutionEngine,
        persister: StatusPersister,
        archive: ArchiveRepository,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            store,
            engine,
            persister,
            archive,
            settings,
            queue: WorkQueue::new(),
            locks: Mutex::new(HashMap::new()),
            failures: StdMutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &WorkflowStore {
        &self.store
    }

    pub fn persister(&self) -> &StatusPersister {
        &self.persister
    }

    /// Queue a workflow for reconciliation
    pub fn enqueue(&self, namespace: &str, name: &str) {
        self.queue.add(format!("{}/{}", namespace, name));
    }

    /// Run watch, resync and workers until `shutdown` fires
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(
            "🎛️ Workflow controller starting ({} workers, resync every {:?})",
            self.settings.workers,
            self.settings.resync
        );

        let mut handles = Vec::new();

        let watcher = self.clone();
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move { watcher.watch_loop(token).await }));

        let resyncer = self.clone();
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move { resyncer.resync_loop(token).await }));

        for worker in 0..self.settings.workers.max(1) {
            let controller = self.clone();
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move { controller.worker_loop(worker, token).await }));
        }

        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("🎛️ Workflow controller stopped");
    }

    async fn watch_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut events = self.store.watch();
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return,
                event = events.recv() => event,
            };
            match event {
                Ok(WatchEvent {
                    kind: WatchEventKind::Added | WatchEventKind::Modified,
                    namespace,
                    name,
                    ..
                }) => self.enqueue(&namespace, &name),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("⚠️ Watch lagged by {} events, resyncing", missed);
                    self.resync().await;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    async fn resync_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.resync);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => self.resync().await,
            }
        }
    }

    /// Queue every workflow that still needs attention
    async fn resync(&self) {
        match self.store.list(None, &LabelSelector::default()).await {
            Ok(workflows) => {
                for wf in workflows.iter().filter(|wf| self.needs_attention(wf)) {
                    self.enqueue(&wf.metadata.namespace, &wf.metadata.name);
                }
            }
            Err(e) => tracing::warn!("⚠️ Resync failed: {}", e),
        }
    }

    fn needs_attention(&self, workflow: &Workflow) -> bool {
        !workflow.is_completed() || self.wants_archive(workflow)
    }

    fn wants_archive(&self, workflow: &Workflow) -> bool {
        self.settings.archive
            && workflow.is_completed()
            && workflow.metadata.labels.get(ARCHIVING_STATUS_LABEL).map(String::as_str) != Some(ARCHIVED)
            && self.settings.archive_selector.matches(&workflow.metadata.labels)
    }

    async fn worker_loop(self: Arc<Self>, worker: usize, shutdown: CancellationToken) {
        loop {
            let key = tokio::select! {
                _ = shutdown.cancelled() => return,
                key = self.queue.next() => match key {
                    Some(key) => key,
                    None => return,
                },
            };
            let Some((namespace, name)) = key.split_once('/') else {
                continue;
            };
            tracing::debug!("👷 Worker {} reconciling {}", worker, key);

            match self.reconcile_workflow(namespace, name).await {
                Ok(requeue) => {
                    self.reset_failures(&key);
                    if let Some(after) = requeue {
                        self.clone().requeue_after(key, after);
                    }
                }
                Err(e) if e.is_transient() => {
                    let delay = self.next_failure_delay(&key);
                    tracing::warn!("⚠️ Requeueing {} in {:?}: {}", key, delay, e);
                    self.clone().requeue_after(key, delay);
                }
                Err(e) => {
                    tracing::error!("❌ Reconcile of {} failed: {}", key, e);
                    self.forget(&key).await;
                }
            }
        }
    }

    fn requeue_after(self: Arc<Self>, key: String, after: Duration) {
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            self.queue.add(key);
        });
    }

    fn next_failure_delay(&self, key: &str) -> Duration {
        let attempt = match self.failures.lock() {
            Ok(mut failures) => {
                let count = failures.entry(key.to_string()).or_insert(0);
                *count += 1;
                *count
            }
            Err(_) => 1,
        };
        let backoff = Backoff {
            max: Duration::from_secs(60),
            ..Backoff::default()
        };
        backoff.delay(attempt.saturating_sub(1))
    }

    fn reset_failures(&self, key: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(key);
        }
    }

    /// Drop the lock and failure count of a key nobody will reconcile again
    async fn forget(&self, key: &str) {
        self.locks.lock().await.remove(key);
        self.reset_failures(key);
    }

    /// Keys currently holding a per-workflow lock
    pub async fn lock_count(&self) -> usize {
        self.locks.lock().await.len()
    }

    async fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// One full reconcile cycle for a workflow
    ///
    /// Returns when the workflow should be looked at again, if ever.
    pub async fn reconcile_workflow(&self, namespace: &str, name: &str) -> Result<Option<Duration>> {
        let key = format!("{}/{}", namespace, name);
        let lock = self.lock_for(&key).await;
        let guard = lock.lock().await;
        let result = self.reconcile_locked(namespace, name).await;
        drop(guard);

        if matches!(result, Ok(None)) {
            self.forget(&key).await;
        }
        result
    }

    async fn reconcile_locked(&self, namespace: &str, name: &str) -> Result<Option<Duration>> {
        let stored = match self.store.get(namespace, name).await {
            Ok(wf) => wf,
            Err(StoreError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if stored.is_completed() {
            self.finalize(stored).await?;
            return Ok(None);
        }

        let mut workflow = stored.clone();
        if let Err(e) = self.persister.hydrate(&mut workflow).await {
            if e.is_transient() {
                return Err(e);
            }
            tracing::error!("❌ Node status of {} is unreadable: {}", stored.metadata.key(), e);
            let failed = self.mark_error(stored, e.to_string()).await?;
            self.finalize(failed).await?;
            return Ok(None);
        }

        let outcome = match self.engine.reconcile(&mut workflow, Utc::now()).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                tracing::error!("❌ Workflow {} cannot proceed: {}", stored.metadata.key(), e);
                let failed = self.mark_error(stored, e.to_string()).await?;
                self.engine.release_tasks(&workflow).await;
                self.finalize(failed).await?;
                return Ok(None);
            }
        };

        if !outcome.changed {
            return Ok(Some(outcome.requeue_after.unwrap_or(self.settings.resync)));
        }

        // dehydrate may clear the node map
        let task_refs = ExecutionEngine::task_refs(&workflow);
        let written = match self.persister.dehydrate(&mut workflow).await {
            Ok(()) => self.write(&workflow).await?,
            Err(EngineError::Capacity { size, limit }) => {
                let message = format!(
                    "workflow status is {} bytes, larger than the {} byte limit",
                    size, limit
                );
                tracing::error!("❌ {}: {}", workflow.metadata.key(), message);
                // the stale stored copy carries the current resource version
                self.mark_error(stored, message).await?
            }
            Err(e) => return Err(e),
        };

        if written.is_completed() {
            self.engine.release(&task_refs).await;
            self.finalize(written).await?;
            return Ok(None);
        }
        Ok(Some(outcome.requeue_after.unwrap_or(self.settings.resync)))
    }

    /// Conditional update, then collect offloaded status the new document dropped
    ///
    /// A rejected write returns before anything is collected, so the stored
    /// document always hydrates.
    async fn write(&self, workflow: &Workflow) -> Result<Workflow> {
        let written = self.store.update(workflow).await?;
        if let Err(e) = self.persister.commit(&written).await {
            tracing::warn!("⚠️ Could not collect old node status of {}: {}", written.metadata.key(), e);
        }
        Ok(written)
    }

    /// Write the workflow back as Error with an empty node map
    async fn mark_error(&self, mut workflow: Workflow, message: String) -> Result<Workflow> {
        let now = Utc::now();
        workflow.status.phase = WorkflowPhase::Error;
        workflow.status.message = Some(message);
        workflow.status.finished_at = Some(now);
        workflow.status.started_at.get_or_insert(now);
        workflow.status.nodes.clear();
        workflow.status.compressed_nodes = None;
        workflow.status.offload_node_status_version = None;
        self.write(&workflow).await
    }

    /// Archive a completed workflow once, then label it
    async fn finalize(&self, mut workflow: Workflow) -> Result<()> {
        if !self.wants_archive(&workflow) {
            return Ok(());
        }

        let mut snapshot = workflow.clone();
        self.persister.hydrate(&mut snapshot).await?;
        self.archive.archive(&snapshot).await?;

        workflow
            .metadata
            .labels
            .insert(ARCHIVING_STATUS_LABEL.to_string(), ARCHIVED.to_string());
        self.store.update(&workflow).await?;
        Ok(())
    }

    /// Delete a live workflow, its backend tasks and any offloaded status
    pub async fn delete_workflow(&self, namespace: &str, name: &str) -> Result<()> {
        let key = format!("{}/{}", namespace, name);
        let lock = self.lock_for(&key).await;
        let guard = lock.lock().await;
        let result = self.delete_locked(namespace, name).await;
        drop(guard);

        if matches!(result, Ok(()) | Err(EngineError::NotFound(_))) {
            self.forget(&key).await;
        }
        result
    }

    async fn delete_locked(&self, namespace: &str, name: &str) -> Result<()> {
        let mut workflow = self.store.get(namespace, name).await?;
        if let Err(e) = self.persister.hydrate(&mut workflow).await {
            tracing::warn!("⚠️ Could not hydrate {} for cleanup: {}", workflow.metadata.key(), e);
        }
        self.engine.release_tasks(&workflow).await;
        self.persister.release(&workflow).await?;
        self.store.delete(namespace, name).await?;
        tracing::info!("🗑️ Deleted workflow {}/{}", namespace, name);
        Ok(())
    }
}
