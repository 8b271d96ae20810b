/// Task execution backend
///
/// The engine never runs tasks itself: it hands a `TaskRequest` to a
/// `TaskBackend` and observes the outcome on a later reconcile pass.
/// `LocalProcessBackend` runs each container's command as a child process on
/// this host, which is enough to drive real workflows without a cluster.

use crate::error::BackendError;
use crate::workflow::types::ContainerSpec;
use async_trait::async_trait;
use std::{collections::HashMap, process::Stdio, sync::Arc};
use tokio::{io::AsyncReadExt, process::Command, sync::Mutex};
use tokio_util::sync::CancellationToken;

/// Everything needed to start one task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub namespace: String,
    pub workflow: String,
    /// Dispatch key: creating twice with the same node ID yields the same task
    pub node_id: String,
    pub node_name: String,
    pub container: ContainerSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    /// The task ran and reported failure
    Failed,
    /// The task could not run to completion for reasons outside its own logic
    Error,
}

impl TaskState {
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed | TaskState::Error)
    }
}

/// Observed state of a dispatched task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatus {
    pub state: TaskState,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
    /// Last line of stdout, surfaced as the node's result
    pub result: Option<String>,
}

impl TaskStatus {
    pub fn new(state: TaskState) -> Self {
        Self {
            state,
            exit_code: None,
            message: None,
            result: None,
        }
    }
}

/// Interface to whatever actually runs containers
#[async_trait]
pub trait TaskBackend: Send + Sync {
    /// Start a task, returning its reference. Idempotent per `node_id`.
    async fn create(&self, request: &TaskRequest) -> Result<String, BackendError>;

    async fn status(&self, task_ref: &str) -> Result<TaskStatus, BackendError>;

    /// Ask the task to stop
    async fn terminate(&self, task_ref: &str) -> Result<(), BackendError>;

    /// Stop the task without waiting for it to cooperate
    async fn kill(&self, task_ref: &str) -> Result<(), BackendError>;

    /// Forget a finished task
    async fn delete(&self, task_ref: &str) -> Result<(), BackendError>;

    async fn logs(&self, task_ref: &str) -> Result<String, BackendError>;
}

struct LocalTask {
    status: Arc<Mutex<TaskStatus>>,
    output: Arc<Mutex<String>>,
    stop: CancellationToken,
}

/// Runs `command + args` of each container as a local child process
///
/// The image is ignored; the command must exist on this host.
#[derive(Clone, Default)]
pub struct LocalProcessBackend {
    tasks: Arc<Mutex<HashMap<String, LocalTask>>>,
}

impl LocalProcessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn task_ref(request: &TaskRequest) -> String {
        format!("{}/{}", request.namespace, request.node_id)
    }

    fn spawn(request: &TaskRequest) -> Result<LocalTask, BackendError> {
        let mut argv = request
            .container
            .command
            .iter()
            .chain(request.container.args.iter());
        let program = argv.next().ok_or_else(|| BackendError::Dispatch {
            node_id: request.node_id.clone(),
            reason: "container has no command".to_string(),
        })?;

        tracing::debug!(
            "🐳 Starting local task for node '{}' (image {} ignored)",
            request.node_name,
            request.container.image
        );

        let mut child = Command::new(program)
            .args(argv)
            .envs(&request.container.env)
            .env("ARGOSY_WORKFLOW", &request.workflow)
            .env("ARGOSY_NODE", &request.node_name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::Dispatch {
                node_id: request.node_id.clone(),
                reason: e.to_string(),
            })?;

        let status = Arc::new(Mutex::new(TaskStatus::new(TaskState::Running)));
        let output = Arc::new(Mutex::new(String::new()));
        let stop = CancellationToken::new();

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let task_status = status.clone();
        let task_output = output.clone();
        let task_stop = stop.clone();
        let node_name = request.node_name.clone();

        tokio::spawn(async move {
            let read_output = async {
                let mut out = String::new();
                let mut err = String::new();
                tokio::join!(
                    async {
                        if let Some(stdout) = stdout.as_mut() {
                            let _ = stdout.read_to_string(&mut out).await;
                        }
                    },
                    async {
                        if let Some(stderr) = stderr.as_mut() {
                            let _ = stderr.read_to_string(&mut err).await;
                        }
                    }
                );
                (out, err)
            };

            let outcome = tokio::select! {
                _ = task_stop.cancelled() => None,
                finished = async { (read_output.await, child.wait().await) } => Some(finished),
            };
            if outcome.is_none() {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }

            let mut status = task_status.lock().await;
            match outcome {
                None => {
                    status.state = TaskState::Failed;
                    status.message = Some("terminated".to_string());
                }
                Some(((out, err), Ok(exit))) => {
                    status.exit_code = exit.code();
                    status.result = out.lines().last().map(str::to_string);
                    if exit.success() {
                        status.state = TaskState::Succeeded;
                    } else {
                        status.state = TaskState::Failed;
                        status.message = Some(match exit.code() {
                            Some(code) => format!("exit code {}", code),
                            None => "killed by signal".to_string(),
                        });
                    }
                    *task_output.lock().await = out + &err;
                }
                Some((_, Err(e))) => {
                    status.state = TaskState::Error;
                    status.message = Some(format!("failed to wait for process: {}", e));
                }
            }
            tracing::debug!("🏁 Local task for node '{}' finished: {:?}", node_name, status.state);
        });

        Ok(LocalTask { status, output, stop })
    }
}

#[async_trait]
impl TaskBackend for LocalProcessBackend {
    async fn create(&self, request: &TaskRequest) -> Result<String, BackendError> {
        let task_ref = Self::task_ref(request);
        let mut tasks = self.tasks.lock().await;
        if !tasks.contains_key(&task_ref) {
            let task = Self::spawn(request)?;
            tasks.insert(task_ref.clone(), task);
        }
        Ok(task_ref)
    }

    async fn status(&self, task_ref: &str) -> Result<TaskStatus, BackendError> {
        let status = {
            let tasks = self.tasks.lock().await;
            let task = tasks
                .get(task_ref)
                .ok_or_else(|| BackendError::NotFound(task_ref.to_string()))?;
            task.status.clone()
        };
        let status = status.lock().await.clone();
        Ok(status)
    }

    async fn terminate(&self, task_ref: &str) -> Result<(), BackendError> {
        // child processes get no graceful signal, so terminate and kill coincide
        self.kill(task_ref).await
    }

    async fn kill(&self, task_ref: &str) -> Result<(), BackendError> {
        let tasks = self.tasks.lock().await;
        let task = tasks
            .get(task_ref)
            .ok_or_else(|| BackendError::NotFound(task_ref.to_string()))?;
        task.stop.cancel();
        Ok(())
    }

    async fn delete(&self, task_ref: &str) -> Result<(), BackendError> {
        match self.tasks.lock().await.remove(task_ref) {
            Some(task) => {
                task.stop.cancel();
                Ok(())
            }
            None => Err(BackendError::NotFound(task_ref.to_string())),
        }
    }

    async fn logs(&self, task_ref: &str) -> Result<String, BackendError> {
        let output = {
            let tasks = self.tasks.lock().await;
            let task = tasks
                .get(task_ref)
                .ok_or_else(|| BackendError::NotFound(task_ref.to_string()))?;
            task.output.clone()
        };
        let text = output.lock().await.clone();
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::backoff::{wait_until, Backoff};
    use std::time::Duration;

    fn request(node_id: &str, command: &[&str]) -> TaskRequest {
        TaskRequest {
            namespace: "argo".to_string(),
            workflow: "wf".to_string(),
            node_id: node_id.to_string(),
            node_name: format!("wf.{}", node_id),
            container: ContainerSpec {
                image: "alpine".to_string(),
                command: command.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
        }
    }

    async fn finished(backend: &LocalProcessBackend, task_ref: &str) -> TaskStatus {
        let poll = Backoff::polling(Duration::from_millis(20), Duration::from_secs(10));
        wait_until(&poll, &CancellationToken::new(), || async move {
            backend.status(task_ref).await.map(|s| s.state.is_finished()).unwrap_or(false)
        })
        .await
        .unwrap();
        backend.status(task_ref).await.unwrap()
    }

    #[tokio::test]
    async fn test_success_and_output() {
        let backend = LocalProcessBackend::new();
        let task_ref = backend.create(&request("a", &["echo", "hello"])).await.unwrap();
        let status = finished(&backend, &task_ref).await;
        assert_eq!(status.state, TaskState::Succeeded);
        assert_eq!(status.exit_code, Some(0));
        assert_eq!(status.result.as_deref(), Some("hello"));
        assert!(backend.logs(&task_ref).await.unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let backend = LocalProcessBackend::new();
        let task_ref = backend.create(&request("b", &["sh", "-c", "exit 3"])).await.unwrap();
        let status = finished(&backend, &task_ref).await;
        assert_eq!(status.state, TaskState::Failed);
        assert_eq!(status.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_create_is_idempotent_per_node() {
        let backend = LocalProcessBackend::new();
        let first = backend.create(&request("c", &["true"])).await.unwrap();
        let second = backend.create(&request("c", &["true"])).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.tasks.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_command_fails_dispatch() {
        let backend = LocalProcessBackend::new();
        assert!(matches!(
            backend.create(&request("d", &[])).await,
            Err(BackendError::Dispatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_kill_stops_long_task() {
        let backend = LocalProcessBackend::new();
        let task_ref = backend.create(&request("e", &["sleep", "30"])).await.unwrap();
        backend.kill(&task_ref).await.unwrap();
        let status = finished(&backend, &task_ref).await;
        assert_eq!(status.state, TaskState::Failed);
        assert_eq!(status.message.as_deref(), Some("terminated"));
    }
}
