/// Cron trigger scheduler
///
/// `CronTrigger::run_tick` decides what one schedule tick of a CronWorkflow
/// does: skip, replace, or submit. It is a plain async function over the stores
/// so it can be driven by tests with any clock. `CronSchedulerService`
/// registers one tokio-cron-scheduler job per CronWorkflow and keeps the jobs
/// in step with the store.

use crate::error::{EngineError, Result, StoreError};
use crate::runtime::{
    backoff::{retry_with_backoff, Backoff},
    controller::WorkflowController,
};
use crate::workflow::{
    storage::{CronWorkflowStore, WatchEventKind},
    submit::{flatten_retry, WorkflowSubmitter},
    types::{
        ConcurrencyPolicy, CronWorkflow, CronWorkflowStatus, LabelSelector, ObjectMeta, Workflow,
        WorkflowPhase, WorkflowRef, WorkflowStatus, CRON_WORKFLOW_LABEL,
    },
};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::{collections::HashMap, str::FromStr, sync::Arc};
use tokio::sync::{broadcast, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const DEFAULT_SUCCESSFUL_HISTORY: u32 = 3;
const DEFAULT_FAILED_HISTORY: u32 = 1;

/// Accept 5-field Unix expressions by adding a leading seconds field
pub fn normalize_cron_expr(expr: &str) -> String {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    }
}

pub fn parse_schedule(expr: &str) -> std::result::Result<Schedule, String> {
    Schedule::from_str(&normalize_cron_expr(expr))
        .map_err(|e| format!("invalid cron schedule '{}': {}", expr, e))
}

/// Latest tick of `schedule` at or before `now`
pub fn last_tick(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    // ticks are whole seconds, so anchoring on the next second includes `now` itself
    let anchor = DateTime::from_timestamp(now.timestamp() + 1, 0)?;
    schedule.after(&anchor).next_back()
}

/// What a tick did
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The schedule has never come due
    NotDue,
    Suspended,
    /// Skipped and recorded in the status
    Skipped { reason: String },
    Submitted { workflow: String, replaced: Vec<String> },
    /// The workflow for this tick already exists
    AlreadySubmitted { workflow: String },
}

/// Runs schedule ticks for CronWorkflows
#[derive(Clone)]
pub struct CronTrigger {
    crons: CronWorkflowStore,
    submitter: WorkflowSubmitter,
    /// Deletes pruned runs together with their tasks and offloaded status
    controller: Option<Arc<WorkflowController>>,
}

impl CronTrigger {
    pub fn new(crons: CronWorkflowStore, submitter: WorkflowSubmitter) -> Self {
        Self {
            crons,
            submitter,
            controller: None,
        }
    }

    /// Prune history through the controller's delete path
    pub fn with_controller(mut self, controller: Arc<WorkflowController>) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn crons(&self) -> &CronWorkflowStore {
        &self.crons
    }

    /// Handle the most recent tick due at `now`
    pub async fn run_tick(&self, namespace: &str, name: &str, now: DateTime<Utc>) -> Result<TickOutcome> {
        let cron = self.crons.get(namespace, name).await?;
        if cron.spec.suspend {
            tracing::debug!("⏸️ Cron workflow {} is suspended", cron.metadata.key());
            return Ok(TickOutcome::Suspended);
        }

        let schedule = parse_schedule(&cron.spec.schedule).map_err(EngineError::Validation)?;
        let Some(scheduled) = last_tick(&schedule, now) else {
            return Ok(TickOutcome::NotDue);
        };

        let mut status = cron.status.clone();
        status.active = self.live_refs(&status.active).await?;

        let workflow = spawned_workflow(&cron, scheduled);
        let workflow_name = workflow.metadata.name.clone();
        match self.submitter.store().get(namespace, &workflow_name).await {
            Ok(_) => {
                tracing::debug!("⏰ Tick {} of {} was already submitted", scheduled, cron.metadata.key());
                status.last_scheduled_time = Some(scheduled);
                self.save_status(namespace, name, status).await?;
                return Ok(TickOutcome::AlreadySubmitted {
                    workflow: workflow_name,
                });
            }
            Err(StoreError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(deadline) = cron.spec.starting_deadline_seconds {
            if (now - scheduled).num_seconds() > deadline {
                let reason = format!(
                    "missed starting deadline: tick at {} is more than {}s old",
                    scheduled.to_rfc3339(),
                    deadline
                );
                return self.skip(&cron, status, now, reason).await;
            }
        }

        let mut replaced = Vec::new();
        if !status.active.is_empty() {
            match cron.spec.concurrency_policy {
                ConcurrencyPolicy::Allow => {}
                ConcurrencyPolicy::Forbid => {
                    let names: Vec<&str> = status.active.iter().map(|r| r.name.as_str()).collect();
                    let reason = format!(
                        "concurrency policy is Forbid and {} is still active",
                        names.join(", ")
                    );
                    return self.skip(&cron, status, now, reason).await;
                }
                ConcurrencyPolicy::Replace => {
                    let (own, others): (Vec<_>, Vec<_>) = std::mem::take(&mut status.active)
                        .into_iter()
                        .partition(|r| r.name == workflow_name);
                    status.active = own;
                    for active in others {
                        match self.submitter.terminate(&active.namespace, &active.name).await {
                            Ok(_) | Err(EngineError::NotFound(_)) | Err(EngineError::Validation(_)) => {}
                            Err(e) => return Err(e),
                        }
                        tracing::info!("🔁 Replacing workflow {}/{}", active.namespace, active.name);
                        replaced.push(active.name);
                    }
                }
            }
        }

        let outcome = match self.submitter.submit(workflow).await {
            Ok(created) => {
                tracing::info!(
                    "⏰ Cron workflow {} submitted {} for tick {}",
                    cron.metadata.key(),
                    created.metadata.name,
                    scheduled.to_rfc3339()
                );
                status.active.push(WorkflowRef {
                    namespace: created.metadata.namespace,
                    name: created.metadata.name.clone(),
                    uid: created.metadata.uid,
                });
                TickOutcome::Submitted {
                    workflow: created.metadata.name,
                    replaced,
                }
            }
            Err(EngineError::AlreadyExists(_)) => {
                tracing::debug!("⏰ Tick {} of {} was already submitted", scheduled, cron.metadata.key());
                TickOutcome::AlreadySubmitted {
                    workflow: workflow_name,
                }
            }
            Err(e) => {
                tracing::error!("❌ Cron workflow {} failed to submit: {}", cron.metadata.key(), e);
                return Err(e);
            }
        };
        status.last_scheduled_time = Some(scheduled);

        self.enforce_history(&cron).await?;
        self.save_status(namespace, name, status).await?;
        Ok(outcome)
    }

    async fn skip(
        &self,
        cron: &CronWorkflow,
        mut status: CronWorkflowStatus,
        now: DateTime<Utc>,
        reason: String,
    ) -> Result<TickOutcome> {
        tracing::info!("⏭️ Skipping tick of {}: {}", cron.metadata.key(), reason);
        status.last_skipped_time = Some(now);
        status.last_skip_reason = Some(reason.clone());
        self.save_status(&cron.metadata.namespace, &cron.metadata.name, status)
            .await?;
        Ok(TickOutcome::Skipped { reason })
    }

    /// Drop references to workflows that completed or disappeared
    async fn live_refs(&self, refs: &[WorkflowRef]) -> Result<Vec<WorkflowRef>> {
        let mut live = Vec::with_capacity(refs.len());
        for r in refs {
            match self.submitter.store().get(&r.namespace, &r.name).await {
                Ok(wf) if wf.metadata.uid == r.uid && !wf.is_completed() => live.push(r.clone()),
                Ok(_) | Err(StoreError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(live)
    }

    /// Delete completed runs beyond the successful and failed history limits
    async fn enforce_history(&self, cron: &CronWorkflow) -> Result<()> {
        let selector = LabelSelector::parse(&format!("{}={}", CRON_WORKFLOW_LABEL, cron.metadata.name))
            .map_err(EngineError::Validation)?;
        let workflows = self
            .submitter
            .store()
            .list(Some(&cron.metadata.namespace), &selector)
            .await?;

        let (mut succeeded, mut failed): (Vec<Workflow>, Vec<Workflow>) = workflows
            .into_iter()
            .filter(|wf| wf.is_completed())
            .partition(|wf| wf.status.phase == WorkflowPhase::Succeeded);

        let limits = [
            (
                &mut succeeded,
                cron.spec
                    .successful_jobs_history_limit
                    .unwrap_or(DEFAULT_SUCCESSFUL_HISTORY),
            ),
            (
                &mut failed,
                cron.spec.failed_jobs_history_limit.unwrap_or(DEFAULT_FAILED_HISTORY),
            ),
        ];
        for (runs, limit) in limits {
            runs.sort_by(|a, b| b.status.finished_at.cmp(&a.status.finished_at));
            for old in runs.iter().skip(limit as usize) {
                match self.prune(old).await {
                    Ok(()) | Err(EngineError::NotFound(_)) => {
                        tracing::debug!("🧹 Pruned old run {} of {}", old.metadata.name, cron.metadata.key());
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    async fn prune(&self, workflow: &Workflow) -> Result<()> {
        let meta = &workflow.metadata;
        match &self.controller {
            Some(controller) => controller.delete_workflow(&meta.namespace, &meta.name).await,
            None => Ok(self.submitter.store().delete(&meta.namespace, &meta.name).await?),
        }
    }

    /// Write the status back, re-reading on version conflicts
    async fn save_status(&self, namespace: &str, name: &str, status: CronWorkflowStatus) -> Result<CronWorkflow> {
        let status = &status;
        retry_with_backoff(
            &Backoff::default(),
            &CancellationToken::new(),
            || async move {
                let mut fresh = self.crons.get(namespace, name).await?;
                fresh.status = status.clone();
                Ok::<_, EngineError>(self.crons.update(&fresh).await?)
            },
            |e| matches!(e, EngineError::Conflict(_)),
        )
        .await
        .map_err(flatten_retry)
    }
}

/// The workflow a CronWorkflow spawns for the tick at `scheduled`
pub fn spawned_workflow(cron: &CronWorkflow, scheduled: DateTime<Utc>) -> Workflow {
    let mut labels = cron.spec.workflow_metadata.labels.clone();
    labels.insert(CRON_WORKFLOW_LABEL.to_string(), cron.metadata.name.clone());
    Workflow {
        metadata: ObjectMeta {
            name: format!("{}-{}", cron.metadata.name, scheduled.timestamp()),
            namespace: cron.metadata.namespace.clone(),
            labels,
            annotations: cron.spec.workflow_metadata.annotations.clone(),
            ..Default::default()
        },
        spec: cron.spec.workflow_spec.clone(),
        status: WorkflowStatus::default(),
    }
}

struct RegisteredJob {
    uuid: Uuid,
    schedule: String,
}

/// Keeps one scheduler job per CronWorkflow
///
/// Jobs are hot-swapped when a schedule changes and removed when the
/// CronWorkflow is deleted; suspension is checked at tick time.
pub struct CronSchedulerService {
    scheduler: Arc<RwLock<JobScheduler>>,
    jobs: Arc<RwLock<HashMap<String, RegisteredJob>>>,
    trigger: Arc<CronTrigger>,
    shutdown: CancellationToken,
}

impl CronSchedulerService {
    pub async fn new(trigger: Arc<CronTrigger>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            jobs: Arc::new(RwLock::new(HashMap::new())),
            trigger,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn trigger(&self) -> &Arc<CronTrigger> {
        &self.trigger
    }

    /// Register every stored CronWorkflow, start ticking and follow store changes
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        tracing::info!("⏰ Starting cron scheduler service");

        let crons = self.trigger.crons.list(None, &LabelSelector::default()).await?;
        let count = crons.len();
        for cron in &crons {
            if let Err(e) = self.add_or_update(cron).await {
                tracing::warn!("⚠️ Could not schedule {}: {}", cron.metadata.key(), e);
            }
        }

        self.scheduler.read().await.start().await?;

        let service = self.clone();
        let events = self.trigger.crons.watch();
        tokio::spawn(async move { service.follow(events).await });

        tracing::info!("✅ Cron scheduler started with {} cron workflows", count);
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        tracing::info!("⏹️ Stopping cron scheduler service");
        self.shutdown.cancel();
        self.jobs.write().await.clear();
        self.scheduler.write().await.shutdown().await?;
        Ok(())
    }

    async fn follow(&self, mut events: broadcast::Receiver<crate::workflow::storage::WatchEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                event = events.recv() => event,
            };
            let event = match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("⚠️ Cron watch lagged by {} events", missed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };
            match event.kind {
                WatchEventKind::Deleted => self.remove(&event.namespace, &event.name).await,
                WatchEventKind::Added | WatchEventKind::Modified => {
                    match self.trigger.crons.get(&event.namespace, &event.name).await {
                        Ok(cron) => {
                            if let Err(e) = self.add_or_update(&cron).await {
                                tracing::warn!("⚠️ Could not schedule {}: {}", cron.metadata.key(), e);
                            }
                        }
                        Err(StoreError::NotFound { .. }) => self.remove(&event.namespace, &event.name).await,
                        Err(e) => tracing::warn!("⚠️ Cron watch read failed: {}", e),
                    }
                }
            }
        }
    }

    /// Register or hot-swap the job of a CronWorkflow; a no-op if the schedule is unchanged
    pub async fn add_or_update(&self, cron: &CronWorkflow) -> anyhow::Result<()> {
        let key = cron.metadata.key();
        let schedule = normalize_cron_expr(&cron.spec.schedule);

        if let Some(existing) = self.jobs.read().await.get(&key) {
            if existing.schedule == schedule {
                return Ok(());
            }
        }
        self.remove(&cron.metadata.namespace, &cron.metadata.name).await;

        let namespace = cron.metadata.namespace.clone();
        let name = cron.metadata.name.clone();
        let trigger = self.trigger.clone();

        let job = Job::new_async(schedule.as_str(), move |_uuid, _l| {
            let namespace = namespace.clone();
            let name = name.clone();
            let trigger = trigger.clone();
            Box::pin(async move {
                tracing::debug!("🔔 Cron tick for {}/{}", namespace, name);
                match trigger.run_tick(&namespace, &name, Utc::now()).await {
                    Ok(outcome) => tracing::debug!("⏰ Tick of {}/{}: {:?}", namespace, name, outcome),
                    Err(EngineError::NotFound(_)) => {
                        tracing::debug!("⏭️ Cron workflow {}/{} is gone", namespace, name)
                    }
                    Err(e) => tracing::error!("❌ Tick of {}/{} failed: {}", namespace, name, e),
                }
            })
        })?;

        let uuid = self.scheduler.read().await.add(job).await?;
        self.jobs.write().await.insert(
            key.clone(),
            RegisteredJob {
                uuid,
                schedule: schedule.clone(),
            },
        );
        tracing::info!("🔥 Scheduled cron workflow {} ({})", key, schedule);
        Ok(())
    }

    pub async fn remove(&self, namespace: &str, name: &str) {
        let key = format!("{}/{}", namespace, name);
        let Some(job) = self.jobs.write().await.remove(&key) else {
            return;
        };
        if let Err(e) = self.scheduler.read().await.remove(&job.uuid).await {
            tracing::warn!("⚠️ Failed to remove job for {}: {}", key, e);
        } else {
            tracing::info!("🛑 Unscheduled cron workflow {}", key);
        }
    }

    pub async fn scheduled(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.jobs.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}
