//! Shared fixtures for integration tests
#![allow(dead_code)]

use argosy::{
    error::BackendError,
    persist::Database,
    runtime::executor::{TaskBackend, TaskRequest, TaskState, TaskStatus},
    workflow::{
        storage::{CronWorkflowStore, SqliteResourceStore, WorkflowStore},
        types::{
            ConcurrencyPolicy, ContainerSpec, ContinueOn, CronWorkflow, CronWorkflowSpec, DagTask, DagTemplate,
            NodeStatus, ObjectMeta, RetryPolicy, RetryStrategy, Template, TemplateBody, Workflow, WorkflowSpec,
        },
    },
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Inner {
    /// Every successful create call, repeats included
    creates: Vec<TaskRequest>,
    /// task ref -> status
    tasks: HashMap<String, TaskStatus>,
    /// node name -> task ref
    by_name: HashMap<String, String>,
    /// node name -> dispatch failures still to inject
    dispatch_failures: HashMap<String, u32>,
    terminated: Vec<String>,
    killed: Vec<String>,
    deleted: Vec<String>,
    ignore_terminate: bool,
}

/// Task backend whose task outcomes are set by the test
#[derive(Default)]
pub struct ScriptedBackend {
    inner: Mutex<Inner>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finish the task of node `name` in `state`
    pub fn finish(&self, name: &str, state: TaskState) {
        self.finish_with(name, state, None, None);
    }

    pub fn finish_with(&self, name: &str, state: TaskState, exit_code: Option<i32>, message: Option<&str>) {
        let mut inner = self.inner.lock().unwrap();
        let task_ref = inner
            .by_name
            .get(name)
            .cloned()
            .unwrap_or_else(|| panic!("node '{}' was never dispatched", name));
        let status = inner.tasks.get_mut(&task_ref).unwrap();
        status.state = state;
        status.exit_code = exit_code.or(match state {
            TaskState::Succeeded => Some(0),
            TaskState::Failed => Some(1),
            _ => None,
        });
        status.message = message.map(str::to_string);
    }

    /// Make the next `times` dispatches of node `name` fail
    pub fn fail_dispatch(&self, name: &str, times: u32) {
        self.inner
            .lock()
            .unwrap()
            .dispatch_failures
            .insert(name.to_string(), times);
    }

    /// Leave tasks running when asked to terminate, forcing a kill
    pub fn ignore_terminate(&self) {
        self.inner.lock().unwrap().ignore_terminate = true;
    }

    /// Node names in dispatch order, repeats included
    pub fn created(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .creates
            .iter()
            .map(|r| r.node_name.clone())
            .collect()
    }

    pub fn dispatched(&self, name: &str) -> bool {
        self.inner.lock().unwrap().by_name.contains_key(name)
    }

    pub fn terminated(&self) -> Vec<String> {
        self.inner.lock().unwrap().terminated.clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.inner.lock().unwrap().killed.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.inner.lock().unwrap().deleted.clone()
    }
}

#[async_trait]
impl TaskBackend for ScriptedBackend {
    async fn create(&self, request: &TaskRequest) -> Result<String, BackendError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(remaining) = inner.dispatch_failures.get_mut(&request.node_name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BackendError::Dispatch {
                    node_id: request.node_id.clone(),
                    reason: "quota exceeded".to_string(),
                });
            }
        }
        let task_ref = format!("task-{}", request.node_id);
        inner.creates.push(request.clone());
        inner
            .tasks
            .entry(task_ref.clone())
            .or_insert_with(|| TaskStatus::new(TaskState::Running));
        inner.by_name.insert(request.node_name.clone(), task_ref.clone());
        Ok(task_ref)
    }

    async fn status(&self, task_ref: &str) -> Result<TaskStatus, BackendError> {
        self.inner
            .lock()
            .unwrap()
            .tasks
            .get(task_ref)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(task_ref.to_string()))
    }

    async fn terminate(&self, task_ref: &str) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().unwrap();
        inner.terminated.push(task_ref.to_string());
        if inner.ignore_terminate {
            return Ok(());
        }
        let status = inner
            .tasks
            .get_mut(task_ref)
            .ok_or_else(|| BackendError::NotFound(task_ref.to_string()))?;
        status.state = TaskState::Failed;
        status.message = Some("terminated".to_string());
        Ok(())
    }

    async fn kill(&self, task_ref: &str) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().unwrap();
        inner.killed.push(task_ref.to_string());
        if let Some(status) = inner.tasks.get_mut(task_ref) {
            status.state = TaskState::Failed;
            status.message = Some("killed".to_string());
        }
        Ok(())
    }

    async fn delete(&self, task_ref: &str) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().unwrap();
        inner.deleted.push(task_ref.to_string());
        inner
            .tasks
            .remove(task_ref)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(task_ref.to_string()))
    }

    async fn logs(&self, task_ref: &str) -> Result<String, BackendError> {
        Ok(format!("logs of {}", task_ref))
    }
}

pub fn container(name: &str) -> Template {
    Template {
        name: name.to_string(),
        retry_strategy: None,
        body: TemplateBody::Container(ContainerSpec {
            image: "alpine:3.19".to_string(),
            command: vec!["echo".to_string(), name.to_string()],
            ..Default::default()
        }),
    }
}

pub fn retrying(name: &str, limit: u32, policy: RetryPolicy) -> Template {
    Template {
        retry_strategy: Some(RetryStrategy {
            limit,
            retry_policy: policy,
            backoff: None,
        }),
        ..container(name)
    }
}

pub fn dag(name: &str, tasks: Vec<DagTask>) -> Template {
    Template {
        name: name.to_string(),
        retry_strategy: None,
        body: TemplateBody::Dag(DagTemplate {
            tasks,
            parallelism: None,
            fail_fast: None,
        }),
    }
}

pub fn task(name: &str, template: &str, dependencies: &[&str]) -> DagTask {
    DagTask {
        name: name.to_string(),
        template: template.to_string(),
        dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
        when: None,
        continue_on: None,
    }
}

pub fn tolerant(mut task: DagTask) -> DagTask {
    task.continue_on = Some(ContinueOn {
        failed: true,
        error: false,
    });
    task
}

pub fn workflow(name: &str, entrypoint: &str, templates: Vec<Template>) -> Workflow {
    Workflow {
        metadata: ObjectMeta {
            name: name.to_string(),
            namespace: "argo".to_string(),
            uid: format!("uid-{}", name),
            ..Default::default()
        },
        spec: WorkflowSpec {
            entrypoint: entrypoint.to_string(),
            templates,
            parallelism: None,
            on_exit: None,
            shutdown: None,
        },
        status: Default::default(),
    }
}

/// Node by its fully qualified name
pub fn node<'a>(workflow: &'a Workflow, name: &str) -> &'a NodeStatus {
    workflow
        .status
        .nodes
        .values()
        .find(|n| n.name == name)
        .unwrap_or_else(|| panic!("no node named '{}'", name))
}

pub fn has_node(workflow: &Workflow, name: &str) -> bool {
    workflow.status.nodes.values().any(|n| n.name == name)
}

/// Fresh in-memory database with both resource stores over it
pub async fn stores() -> anyhow::Result<(Database, WorkflowStore, CronWorkflowStore)> {
    let db = Database::in_memory().await?;
    let workflows: WorkflowStore = Arc::new(SqliteResourceStore::<Workflow>::new(db.pool().clone()));
    let crons: CronWorkflowStore = Arc::new(SqliteResourceStore::<CronWorkflow>::new(db.pool().clone()));
    Ok((db, workflows, crons))
}

pub fn cron_workflow(name: &str, schedule: &str, policy: ConcurrencyPolicy) -> CronWorkflow {
    CronWorkflow {
        metadata: ObjectMeta {
            name: name.to_string(),
            namespace: "argo".to_string(),
            uid: format!("uid-{}", name),
            ..Default::default()
        },
        spec: CronWorkflowSpec {
            schedule: schedule.to_string(),
            timezone: None,
            concurrency_policy: policy,
            suspend: false,
            starting_deadline_seconds: None,
            successful_jobs_history_limit: None,
            failed_jobs_history_limit: None,
            workflow_metadata: Default::default(),
            workflow_spec: workflow("ignored", "step", vec![container("step")]).spec,
        },
        status: Default::default(),
    }
}
