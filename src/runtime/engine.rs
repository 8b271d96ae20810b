/// DAG execution engine
///
/// One `reconcile` call is one level-triggered pass over a workflow:
/// 1. observe tasks the backend is running and record finished ones
/// 2. walk the template tree from the entrypoint, creating nodes that became
///    eligible and collecting dispatch intents (declaration order breaks ties)
/// 3. dispatch the intents to the task backend
///
/// Passes never wait for tasks to finish; completion shows up on a later pass.
/// Replaying a pass over unchanged state dispatches nothing new because every
/// node is keyed by a deterministic ID and looked up before it is created.

use crate::error::{BackendError, EngineError, Result};
use crate::runtime::{
    backoff::{wait_until, Backoff},
    executor::{TaskBackend, TaskRequest, TaskState},
    node::{aggregate_phase, attempts, node_id, workflow_phase_from, TransitionError},
};
use crate::workflow::{
    guard::{self, TaskFacts},
    types::{
        ContainerSpec, ContinueOn, DagTask, DagTemplate, NodeOutputs, NodePhase, NodeStatus, NodeType,
        RetryStrategy, ShutdownStrategy, Template, TemplateBody, Workflow, WorkflowPhase,
        WorkflowSpec, COMPLETED_LABEL,
    },
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

/// Tunables for the engine
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Dispatch attempts per node before it is marked Error
    pub dispatch_retries: u32,
    /// How long a terminated task may take to stop before it is killed
    pub cancel_grace: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            dispatch_retries: 3,
            cancel_grace: Duration::from_secs(10),
        }
    }
}

/// What a reconcile pass did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileOutcome {
    /// Whether the status document changed and must be written back
    pub changed: bool,
    /// Node IDs dispatched during this pass
    pub dispatched: Vec<String>,
    pub phase: WorkflowPhase,
    /// Run the next pass no later than this
    pub requeue_after: Option<Duration>,
}

/// Drives workflows forward against a task backend
#[derive(Clone)]
pub struct ExecutionEngine {
    backend: Arc<dyn TaskBackend>,
    settings: EngineSettings,
}

impl ExecutionEngine {
    pub fn new(backend: Arc<dyn TaskBackend>, settings: EngineSettings) -> Self {
        Self { backend, settings }
    }

    pub fn backend(&self) -> &Arc<dyn TaskBackend> {
        &self.backend
    }

    /// Run one pass over a hydrated workflow
    pub async fn reconcile(&self, workflow: &mut Workflow, now: DateTime<Utc>) -> Result<ReconcileOutcome> {
        let mut outcome = ReconcileOutcome {
            phase: workflow.status.phase,
            ..Default::default()
        };
        if workflow.is_completed() {
            return Ok(outcome);
        }

        if workflow.status.phase == WorkflowPhase::Pending {
            tracing::info!("🚀 Starting workflow {}", workflow.metadata.key());
            workflow.status.phase = WorkflowPhase::Running;
            workflow.status.started_at = Some(now);
            outcome.changed = true;
        }

        let root_id = workflow.metadata.name.clone();
        if let Some(strategy) = workflow.spec.shutdown {
            outcome.changed |= self.cancel(workflow, strategy, now).await?;
            if !workflow.status.nodes.contains_key(&root_id) {
                self.complete(workflow, WorkflowPhase::Failed, Some(shutdown_message(strategy)), now);
                outcome.changed = true;
                outcome.phase = workflow.status.phase;
                return Ok(outcome);
            }
        }

        outcome.changed |= self.observe(workflow, now).await;

        let Workflow { metadata, spec, status } = &mut *workflow;
        let (metadata, spec): (&_, &WorkflowSpec) = (&*metadata, &*spec);
        let budget = spec.parallelism.map(|limit| {
            let running = status
                .nodes
                .values()
                .filter(|n| n.node_type == NodeType::Pod && n.phase == NodePhase::Running)
                .count();
            limit.saturating_sub(running)
        });
        let mut pass = Pass {
            workflow: &metadata.name,
            namespace: &metadata.namespace,
            spec,
            nodes: &mut status.nodes,
            now,
            budget,
            dispatches: Vec::new(),
            requeue_after: None,
            changed: false,
        };

        let entry = pass.template(&spec.entrypoint)?;
        let root_phase = pass.execute(&metadata.name, &metadata.name, entry, None, None)?;

        let run_exit = spec.on_exit.is_some() && spec.shutdown != Some(ShutdownStrategy::Terminate);
        let exit_phase = match (&spec.on_exit, root_phase.is_terminal() && run_exit) {
            (Some(on_exit), true) => {
                let template = pass.template(on_exit)?;
                let name = exit_node_name(&metadata.name);
                Some(pass.execute(&name, "onExit", template, None, None)?)
            }
            _ => None,
        };

        let Pass {
            dispatches,
            requeue_after,
            changed,
            ..
        } = pass;
        outcome.changed |= changed;
        outcome.requeue_after = requeue_after.and_then(|d| d.to_std().ok());

        if !dispatches.is_empty() {
            let (dispatched, retry_in) = self.dispatch(workflow, dispatches, now).await;
            outcome.changed |= !dispatched.is_empty() || retry_in.is_some();
            outcome.dispatched = dispatched;
            if let Some(retry_in) = retry_in {
                outcome.requeue_after = Some(match outcome.requeue_after {
                    Some(existing) => existing.min(retry_in),
                    None => retry_in,
                });
            }
        }

        let phase = if !root_phase.is_terminal() {
            WorkflowPhase::Running
        } else {
            match exit_phase {
                Some(exit) if !exit.is_terminal() => WorkflowPhase::Running,
                exit => workflow_phase_from(root_phase, exit),
            }
        };
        if phase.is_completed() {
            let message = workflow
                .status
                .nodes
                .get(&root_id)
                .and_then(|root| root.message.clone())
                .or_else(|| {
                    exit_phase.filter(|p| p.is_failure()).map(|_| "exit handler failed".to_string())
                });
            self.complete(workflow, phase, message, now);
            outcome.changed = true;
        }
        outcome.phase = workflow.status.phase;
        Ok(outcome)
    }

    /// Record finished tasks. Returns whether any node changed.
    async fn observe(&self, workflow: &mut Workflow, now: DateTime<Utc>) -> bool {
        let running: Vec<(String, String)> = workflow
            .status
            .nodes
            .values()
            .filter(|n| n.node_type == NodeType::Pod && n.phase == NodePhase::Running)
            .filter_map(|n| n.task_ref.clone().map(|r| (n.id.clone(), r)))
            .collect();
        if running.is_empty() {
            return false;
        }

        let statuses = join_all(running.iter().map(|(_, task_ref)| self.backend.status(task_ref))).await;

        let mut changed = false;
        for ((id, task_ref), status) in running.into_iter().zip(statuses) {
            let Some(node) = workflow.status.nodes.get_mut(&id) else {
                continue;
            };
            let (phase, message, outputs) = match status {
                Ok(status) => {
                    let phase = match status.state {
                        TaskState::Pending | TaskState::Running => continue,
                        TaskState::Succeeded => NodePhase::Succeeded,
                        TaskState::Failed => NodePhase::Failed,
                        TaskState::Error => NodePhase::Error,
                    };
                    let outputs = NodeOutputs {
                        exit_code: status.exit_code,
                        result: status.result,
                    };
                    (phase, status.message, Some(outputs))
                }
                Err(BackendError::NotFound(_)) => (
                    NodePhase::Error,
                    Some(format!("task {} disappeared", task_ref)),
                    None,
                ),
                Err(e) => {
                    tracing::warn!("⚠️ Could not observe task {}: {}", task_ref, e);
                    continue;
                }
            };

            node.outputs = outputs;
            match node.transition(phase, message, now) {
                Ok(true) => {
                    changed = true;
                    tracing::info!("🏁 Node '{}' {}", node.name, phase);
                }
                Ok(false) => {}
                Err(e) => tracing::warn!("⚠️ {}", e),
            }
        }
        changed
    }

    /// Hand queued tasks to the backend
    ///
    /// Returns the dispatched node IDs and, if any dispatch failed but has
    /// budget left, when to try again.
    async fn dispatch(
        &self,
        workflow: &mut Workflow,
        requests: Vec<TaskRequest>,
        now: DateTime<Utc>,
    ) -> (Vec<String>, Option<Duration>) {
        let results = join_all(requests.iter().map(|r| self.backend.create(r))).await;

        let mut dispatched = Vec::new();
        let mut retry_in: Option<Duration> = None;
        for (request, result) in requests.into_iter().zip(results) {
            let Some(node) = workflow.status.nodes.get_mut(&request.node_id) else {
                continue;
            };
            match result {
                Ok(task_ref) => {
                    tracing::info!("📤 Dispatched node '{}' as {}", node.name, task_ref);
                    node.task_ref = Some(task_ref);
                    if let Err(e) = node.transition(NodePhase::Running, None, now) {
                        tracing::warn!("⚠️ {}", e);
                    }
                    dispatched.push(request.node_id);
                }
                Err(e) => {
                    node.dispatch_attempts += 1;
                    if node.dispatch_attempts >= self.settings.dispatch_retries.max(1) {
                        tracing::error!(
                            "❌ Giving up on node '{}' after {} dispatch attempts: {}",
                            node.name,
                            node.dispatch_attempts,
                            e
                        );
                        let message = format!(
                            "failed to dispatch after {} attempts: {}",
                            node.dispatch_attempts, e
                        );
                        if let Err(e) = node.transition(NodePhase::Error, Some(message), now) {
                            tracing::warn!("⚠️ {}", e);
                        }
                        // surface the Error on the next pass
                        retry_in = Some(Duration::ZERO);
                    } else {
                        let delay = Backoff::default().delay(node.dispatch_attempts - 1);
                        tracing::warn!(
                            "⚠️ Dispatch of node '{}' failed (attempt {}), retrying in {:?}: {}",
                            node.name,
                            node.dispatch_attempts,
                            delay,
                            e
                        );
                        retry_in = Some(retry_in.map_or(delay, |r| r.min(delay)));
                    }
                }
            }
        }
        (dispatched, retry_in)
    }

    /// Bring down every node the shutdown strategy covers
    ///
    /// Cancellation overrides continue-on containment: every covered non-terminal
    /// node ends Failed. Exit handler nodes survive a Stop.
    async fn cancel(&self, workflow: &mut Workflow, strategy: ShutdownStrategy, now: DateTime<Utc>) -> Result<bool> {
        let exit_prefix = exit_node_name(&workflow.metadata.name);
        let covered: Vec<String> = workflow
            .status
            .nodes
            .values()
            .filter(|n| !n.is_terminal())
            .filter(|n| strategy == ShutdownStrategy::Terminate || !n.name.starts_with(&exit_prefix))
            .map(|n| n.id.clone())
            .collect();
        if covered.is_empty() {
            return Ok(false);
        }

        tracing::info!(
            "🛑 Cancelling {} nodes of {} ({:?})",
            covered.len(),
            workflow.metadata.key(),
            strategy
        );

        let tasks: Vec<String> = covered
            .iter()
            .filter_map(|id| workflow.status.nodes.get(id))
            .filter(|n| n.node_type == NodeType::Pod)
            .filter_map(|n| n.task_ref.clone())
            .collect();
        join_all(tasks.iter().map(|task_ref| self.stop_task(task_ref))).await;

        let message = shutdown_message(strategy);
        for id in covered {
            if let Some(node) = workflow.status.nodes.get_mut(&id) {
                node.transition(NodePhase::Failed, Some(message.clone()), now)
                    .map_err(transition_error)?;
            }
        }
        Ok(true)
    }

    /// Graceful termination bounded by the grace period, then a forced kill
    async fn stop_task(&self, task_ref: &str) {
        let grace = self.settings.cancel_grace;
        let stopped = match tokio::time::timeout(grace, self.backend.terminate(task_ref)).await {
            Ok(Ok(())) => {
                let poll = Backoff::polling((grace / 10).max(Duration::from_millis(10)), grace);
                wait_until(&poll, &CancellationToken::new(), || async move {
                    match self.backend.status(task_ref).await {
                        Ok(status) => status.state.is_finished(),
                        Err(BackendError::NotFound(_)) => true,
                        Err(_) => false,
                    }
                })
                .await
                .is_ok()
            }
            Ok(Err(BackendError::NotFound(_))) => true,
            Ok(Err(e)) => {
                tracing::warn!("⚠️ Terminate of task {} failed: {}", task_ref, e);
                false
            }
            Err(_) => {
                tracing::warn!("⏱️ Terminate of task {} timed out after {:?}", task_ref, grace);
                false
            }
        };
        if stopped {
            return;
        }

        tracing::warn!("💀 Killing task {}", task_ref);
        match tokio::time::timeout(grace, self.backend.kill(task_ref)).await {
            Ok(Ok(())) | Ok(Err(BackendError::NotFound(_))) => {}
            Ok(Err(e)) => tracing::error!("❌ Kill of task {} failed: {}", task_ref, e),
            Err(_) => tracing::error!("❌ Kill of task {} timed out", task_ref),
        }
    }

    /// Backend handles held by the nodes of a hydrated workflow
    pub fn task_refs(workflow: &Workflow) -> Vec<String> {
        workflow
            .status
            .nodes
            .values()
            .filter_map(|n| n.task_ref.clone())
            .collect()
    }

    /// Remove backend tasks; already gone ones are fine
    pub async fn release(&self, task_refs: &[String]) {
        for task_ref in task_refs {
            match self.backend.delete(task_ref).await {
                Ok(()) | Err(BackendError::NotFound(_)) => {}
                Err(e) => tracing::warn!("⚠️ Could not delete task {}: {}", task_ref, e),
            }
        }
    }

    /// Remove the backend tasks of a workflow that is finished or going away
    pub async fn release_tasks(&self, workflow: &Workflow) {
        self.release(&Self::task_refs(workflow)).await;
    }

    fn complete(&self, workflow: &mut Workflow, phase: WorkflowPhase, message: Option<String>, now: DateTime<Utc>) {
        workflow.status.phase = phase;
        workflow.status.finished_at = Some(now);
        if message.is_some() {
            workflow.status.message = message;
        }
        workflow
            .metadata
            .labels
            .insert(COMPLETED_LABEL.to_string(), "true".to_string());
        match phase {
            WorkflowPhase::Succeeded => tracing::info!("🎉 Workflow {} succeeded", workflow.metadata.key()),
            _ => tracing::warn!(
                "💥 Workflow {} {}: {}",
                workflow.metadata.key(),
                phase,
                workflow.status.message.as_deref().unwrap_or("")
            ),
        }
    }
}

/// Name of the exit handler node
pub fn exit_node_name(workflow_name: &str) -> String {
    format!("{}.onExit", workflow_name)
}

fn shutdown_message(strategy: ShutdownStrategy) -> String {
    format!("Stopped with strategy '{:?}'", strategy)
}

fn transition_error(err: TransitionError) -> EngineError {
    EngineError::Infrastructure(err.to_string())
}

enum Readiness {
    Waiting,
    DependencyFailed(String),
    Ready,
}

/// Synchronous part of a reconcile pass over one workflow's node map
struct Pass<'a> {
    workflow: &'a str,
    namespace: &'a str,
    spec: &'a WorkflowSpec,
    nodes: &'a mut BTreeMap<String, NodeStatus>,
    now: DateTime<Utc>,
    /// Remaining workflow-level dispatch slots; None when unbounded
    budget: Option<usize>,
    dispatches: Vec<TaskRequest>,
    requeue_after: Option<chrono::Duration>,
    changed: bool,
}

impl<'a> Pass<'a> {
    fn template(&self, name: &str) -> Result<&'a Template> {
        let spec: &'a WorkflowSpec = self.spec;
        spec.templates
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| EngineError::Validation(format!("template '{}' not found", name)))
    }

    fn requeue(&mut self, after: chrono::Duration) {
        self.requeue_after = Some(match self.requeue_after {
            Some(existing) => existing.min(after),
            None => after,
        });
    }

    fn take_budget(&mut self) -> bool {
        match self.budget {
            None => true,
            Some(0) => false,
            Some(n) => {
                self.budget = Some(n - 1);
                true
            }
        }
    }

    /// Create the node if it does not exist yet; returns its ID
    #[allow(clippy::too_many_arguments)]
    fn ensure_node(
        &mut self,
        name: &str,
        display: &str,
        node_type: NodeType,
        template: &str,
        boundary: Option<&str>,
        parent: Option<&str>,
        phase: NodePhase,
    ) -> String {
        let id = node_id(self.workflow, name);
        if !self.nodes.contains_key(&id) {
            let node = NodeStatus::new(
                self.workflow,
                name.to_string(),
                display.to_string(),
                node_type,
                template.to_string(),
                boundary.map(str::to_string),
                phase,
                self.now,
            );
            tracing::debug!("➕ Node '{}' created ({:?}, {})", name, node_type, phase);
            self.nodes.insert(id.clone(), node);
            self.changed = true;
            if let Some(parent) = parent.and_then(|p| self.nodes.get_mut(p)) {
                if !parent.children.contains(&id) {
                    parent.children.push(id.clone());
                }
            }
        }
        id
    }

    fn set_phase(&mut self, id: &str, phase: NodePhase, message: Option<String>) -> Result<()> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| EngineError::Infrastructure(format!("node {} vanished mid-pass", id)))?;
        if node.transition(phase, message, self.now).map_err(transition_error)? {
            self.changed = true;
            tracing::info!("🔁 Node '{}' {}", node.name, phase);
        }
        Ok(())
    }

    fn phase_of(&self, id: &str) -> NodePhase {
        self.nodes.get(id).map(|n| n.phase).unwrap_or_default()
    }

    fn execute(
        &mut self,
        name: &str,
        display: &str,
        template: &'a Template,
        boundary: Option<&str>,
        parent: Option<&str>,
    ) -> Result<NodePhase> {
        match &template.retry_strategy {
            Some(strategy) => self.execute_retry(name, display, template, strategy, boundary, parent),
            None => self.execute_body(name, display, template, boundary, parent),
        }
    }

    fn execute_body(
        &mut self,
        name: &str,
        display: &str,
        template: &'a Template,
        boundary: Option<&str>,
        parent: Option<&str>,
    ) -> Result<NodePhase> {
        match &template.body {
            TemplateBody::Container(container) => {
                Ok(self.execute_pod(name, display, template, container, boundary, parent))
            }
            TemplateBody::Dag(dag) => self.execute_dag(name, display, template, dag, boundary, parent),
        }
    }

    fn execute_pod(
        &mut self,
        name: &str,
        display: &str,
        template: &Template,
        container: &ContainerSpec,
        boundary: Option<&str>,
        parent: Option<&str>,
    ) -> NodePhase {
        let id = self.ensure_node(name, display, NodeType::Pod, &template.name, boundary, parent, NodePhase::Pending);
        let waiting = self
            .nodes
            .get(&id)
            .map(|n| n.phase == NodePhase::Pending && n.task_ref.is_none())
            .unwrap_or(false);
        let queued = self.dispatches.iter().any(|r| r.node_id == id);

        if waiting && !queued && self.take_budget() {
            self.dispatches.push(TaskRequest {
                namespace: self.namespace.to_string(),
                workflow: self.workflow.to_string(),
                node_id: id.clone(),
                node_name: name.to_string(),
                container: container.clone(),
            });
        }
        self.phase_of(&id)
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_dag(
        &mut self,
        name: &str,
        display: &str,
        template: &Template,
        dag: &'a DagTemplate,
        boundary: Option<&str>,
        parent: Option<&str>,
    ) -> Result<NodePhase> {
        let id = self.ensure_node(name, display, NodeType::Dag, &template.name, boundary, parent, NodePhase::Running);
        let phase = self.phase_of(&id);
        if phase.is_terminal() {
            return Ok(phase);
        }

        let workflow = self.workflow;
        let task_id = |task: &str| node_id(workflow, &format!("{}.{}", name, task));

        let mut active = dag
            .tasks
            .iter()
            .filter(|t| self.nodes.get(&task_id(&t.name)).map(|n| !n.is_terminal()).unwrap_or(false))
            .count();
        let mut failed_task = dag
            .tasks
            .iter()
            .find(|t| untolerated(t, self.phase_of(&task_id(&t.name))))
            .map(|t| t.name.clone());

        for task in &dag.tasks {
            let task_name = format!("{}.{}", name, task.name);
            let tid = node_id(self.workflow, &task_name);
            let task_template = self.template(&task.template)?;

            if let Some(existing) = self.nodes.get(&tid) {
                if existing.is_terminal() {
                    continue;
                }
                let phase = self.execute(&task_name, &task.name, task_template, Some(&id), Some(&id))?;
                if phase.is_terminal() {
                    active = active.saturating_sub(1);
                    if untolerated(task, phase) && failed_task.is_none() {
                        failed_task = Some(task.name.clone());
                    }
                }
                continue;
            }

            match self.readiness(name, dag, task) {
                Readiness::Waiting => continue,
                Readiness::DependencyFailed(dep) => {
                    let message = format!("dependency '{}' did not succeed", dep);
                    self.create_terminal(&task_name, &task.name, task_template, &id, NodePhase::Skipped, message);
                    continue;
                }
                Readiness::Ready => {}
            }

            if dag.fail_fast() {
                if let Some(failed) = &failed_task {
                    let message = format!("task '{}' failed and the dag fails fast", failed);
                    self.create_terminal(&task_name, &task.name, task_template, &id, NodePhase::Skipped, message);
                    continue;
                }
            }

            if let Some(expr) = &task.when {
                let verdict = guard::evaluate(expr, |sibling| {
                    let sibling_id = node_id(self.workflow, &format!("{}.{}", name, sibling));
                    self.nodes.get(&sibling_id).map(|n| TaskFacts {
                        phase: n.phase,
                        exit_code: n.outputs.as_ref().and_then(|o| o.exit_code),
                    })
                });
                match verdict {
                    Ok(true) => {}
                    Ok(false) => {
                        let message = format!("when '{}' evaluated false", expr);
                        self.create_terminal(&task_name, &task.name, task_template, &id, NodePhase::Omitted, message);
                        continue;
                    }
                    Err(e) => {
                        let message = format!("invalid when expression: {}", e);
                        self.create_terminal(&task_name, &task.name, task_template, &id, NodePhase::Error, message);
                        if failed_task.is_none() && untolerated(task, NodePhase::Error) {
                            failed_task = Some(task.name.clone());
                        }
                        continue;
                    }
                }
            }

            if let Some(limit) = dag.parallelism {
                if active >= limit {
                    continue;
                }
            }

            let phase = self.execute(&task_name, &task.name, task_template, Some(&id), Some(&id))?;
            if !phase.is_terminal() {
                active += 1;
            } else if untolerated(task, phase) && failed_task.is_none() {
                failed_task = Some(task.name.clone());
            }
        }

        for task in dag.tasks.iter().filter(|t| !t.dependencies.is_empty()) {
            if let Some(node) = self.nodes.get_mut(&task_id(&task.name)) {
                if node.dependencies.is_empty() {
                    node.dependencies = task.dependencies.clone();
                    self.changed = true;
                }
            }
        }

        let pending = dag
            .tasks
            .iter()
            .filter(|t| !self.nodes.contains_key(&task_id(&t.name)))
            .count();
        let children: Vec<(&NodeStatus, Option<ContinueOn>)> = dag
            .tasks
            .iter()
            .filter_map(|t| self.nodes.get(&task_id(&t.name)).map(|n| (n, t.continue_on)))
            .collect();
        let aggregated = aggregate_phase(children.iter().copied(), pending);

        if aggregated.is_terminal() {
            let message = aggregated.is_failure().then(|| {
                let culprit = dag
                    .tasks
                    .iter()
                    .find(|t| untolerated(t, self.phase_of(&task_id(&t.name))))
                    .map(|t| t.name.as_str())
                    .unwrap_or("?");
                format!("child '{}.{}' failed", name, culprit)
            });
            self.set_phase(&id, aggregated, message)?;
        }
        Ok(self.phase_of(&id))
    }

    fn readiness(&self, dag_name: &str, dag: &DagTemplate, task: &DagTask) -> Readiness {
        let mut failed = None;
        for dep in &task.dependencies {
            let dep_id = node_id(self.workflow, &format!("{}.{}", dag_name, dep));
            let Some(dep_node) = self.nodes.get(&dep_id) else {
                return Readiness::Waiting;
            };
            if !dep_node.is_terminal() {
                return Readiness::Waiting;
            }
            let contained = dag
                .task(dep)
                .map(|d| !untolerated(d, dep_node.phase))
                .unwrap_or(false);
            if dep_node.phase.is_failure() && !contained && failed.is_none() {
                failed = Some(dep.clone());
            }
            // a skipped dependency means its own upstream failed
            if dep_node.phase == NodePhase::Skipped && failed.is_none() {
                failed = Some(dep.clone());
            }
        }
        match failed {
            Some(dep) => Readiness::DependencyFailed(dep),
            None => Readiness::Ready,
        }
    }

    fn create_terminal(
        &mut self,
        name: &str,
        display: &str,
        template: &Template,
        parent: &str,
        phase: NodePhase,
        message: String,
    ) {
        let node_type = match (&template.retry_strategy, &template.body) {
            (Some(_), _) => NodeType::Retry,
            (None, TemplateBody::Dag(_)) => NodeType::Dag,
            (None, TemplateBody::Container(_)) => NodeType::Pod,
        };
        let id = self.ensure_node(name, display, node_type, &template.name, Some(parent), Some(parent), phase);
        if let Some(node) = self.nodes.get_mut(&id) {
            tracing::info!("⏭️ Node '{}' {}: {}", name, phase, message);
            node.message = Some(message);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_retry(
        &mut self,
        name: &str,
        display: &str,
        template: &'a Template,
        strategy: &RetryStrategy,
        boundary: Option<&str>,
        parent: Option<&str>,
    ) -> Result<NodePhase> {
        let id = self.ensure_node(name, display, NodeType::Retry, &template.name, boundary, parent, NodePhase::Running);
        if self.phase_of(&id).is_terminal() {
            return Ok(self.phase_of(&id));
        }

        let attempt_count = self.nodes.get(&id).map(|n| n.children.len()).unwrap_or(0);
        if attempt_count == 0 {
            self.start_attempt(name, display, template, boundary, &id, 0)?;
        } else if let Some(last) = self.last_attempt(&id) {
            if !last.is_terminal() {
                let (last_name, last_display) = (last.name.clone(), last.display_name.clone());
                self.execute_body(&last_name, &last_display, template, boundary, Some(&id))?;
            }
        }

        let Some(last) = self.last_attempt(&id) else {
            return Ok(self.phase_of(&id));
        };
        if !last.is_terminal() {
            return Ok(NodePhase::Running);
        }
        let (last_phase, last_finished, last_message, last_outputs) = (
            last.phase,
            last.finished_at,
            last.message.clone(),
            last.outputs.clone(),
        );
        let attempt_count = self.nodes.get(&id).map(|n| n.children.len()).unwrap_or(0);
        let retries_used = attempt_count.saturating_sub(1) as u32;

        if last_phase.is_failure()
            && strategy.retry_policy.should_retry(last_phase)
            && retries_used < strategy.limit
        {
            if let Some(backoff) = &strategy.backoff {
                let ready_at = last_finished.unwrap_or(self.now) + backoff.delay(retries_used);
                if self.now < ready_at {
                    tracing::debug!("⏳ Node '{}' backing off until {}", name, ready_at);
                    self.requeue(ready_at - self.now);
                    return Ok(NodePhase::Running);
                }
            }
            tracing::info!("🔁 Retrying node '{}' (retry {} of {})", name, retries_used + 1, strategy.limit);
            self.start_attempt(name, display, template, boundary, &id, attempt_count)?;
            return Ok(NodePhase::Running);
        }

        if let Some(node) = self.nodes.get_mut(&id) {
            node.outputs = last_outputs;
        }
        let message = if last_phase.is_failure() {
            Some(match last_message {
                Some(m) if strategy.limit > 0 => format!("No more retries left: {}", m),
                Some(m) => m,
                None => "No more retries left".to_string(),
            })
        } else {
            None
        };
        self.set_phase(&id, last_phase, message)?;
        Ok(last_phase)
    }

    fn start_attempt(
        &mut self,
        name: &str,
        display: &str,
        template: &'a Template,
        boundary: Option<&str>,
        retry_id: &str,
        attempt: usize,
    ) -> Result<NodePhase> {
        let attempt_name = format!("{}({})", name, attempt);
        let attempt_display = format!("{}({})", display, attempt);
        self.execute_body(&attempt_name, &attempt_display, template, boundary, Some(retry_id))
    }

    fn last_attempt(&self, retry_id: &str) -> Option<&NodeStatus> {
        let retry = self.nodes.get(retry_id)?;
        attempts(&*self.nodes, retry).last().copied()
    }
}

/// A failure of this task that its continue-on policy does not contain
fn untolerated(task: &DagTask, phase: NodePhase) -> bool {
    phase.is_failure() && !task.continue_on.map(|c| c.tolerates(phase)).unwrap_or(false)
}
