/// Core workflow type definitions
///
/// Defines the resources the engine works on: workflows, their templates and DAG
/// tasks, the execution status document with its per-node entries, and cron
/// workflows. These types are serialized as JSON for the resource store and the
/// archive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label set on a workflow once its archive record has been written
pub const ARCHIVING_STATUS_LABEL: &str = "workflows.argosy.io/workflow-archiving-status";
/// Label linking a workflow to the cron workflow that spawned it
pub const CRON_WORKFLOW_LABEL: &str = "workflows.argosy.io/cron-workflow";
/// Label set on a workflow once it reached a terminal phase
pub const COMPLETED_LABEL: &str = "workflows.argosy.io/completed";

/// Identity and bookkeeping shared by every stored resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Resource name, unique within the namespace
    #[serde(default)]
    pub name: String,
    /// Name prefix; a random suffix is appended at submission when `name` is empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,
    #[serde(default)]
    pub namespace: String,
    /// Assigned at creation, never reused
    #[serde(default)]
    pub uid: String,
    /// Optimistic concurrency token, bumped by every successful update
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// `namespace/name` key used for queues and logs
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// A submitted execution unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub metadata: ObjectMeta,
    pub spec: WorkflowSpec,
    #[serde(default)]
    pub status: WorkflowStatus,
}

impl Workflow {
    /// Look up a template by name
    pub fn template(&self, name: &str) -> Option<&Template> {
        self.spec.templates.iter().find(|t| t.name == name)
    }

    /// Whether the workflow reached a terminal phase
    pub fn is_completed(&self) -> bool {
        self.status.phase.is_completed()
    }
}

/// What to run: templates plus the entrypoint into them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    /// Name of the template executed as the root node
    pub entrypoint: String,
    pub templates: Vec<Template>,
    /// Maximum number of task nodes running at once across the whole workflow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,
    /// Template run after the entrypoint finishes, whatever its outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_exit: Option<String>,
    /// Set to request cancellation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown: Option<ShutdownStrategy>,
}

/// How a running workflow is brought down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownStrategy {
    /// Cancel running nodes, still run the exit handler
    Stop,
    /// Cancel running nodes and skip the exit handler
    Terminate,
}

/// A named unit of work: either a single container or a DAG of tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_strategy: Option<RetryStrategy>,
    #[serde(flatten)]
    pub body: TemplateBody,
}

/// Leaf (container) versus group (DAG) templates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateBody {
    Container(ContainerSpec),
    Dag(DagTemplate),
}

/// Executable unit handed to the task backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A DAG of tasks; edges come from each task's `dependencies`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagTemplate {
    pub tasks: Vec<DagTask>,
    /// Maximum number of task nodes running at once inside this DAG
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,
    /// Stop starting new tasks once one fails (default true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_fast: Option<bool>,
}

impl DagTemplate {
    pub fn fail_fast(&self) -> bool {
        self.fail_fast.unwrap_or(true)
    }

    pub fn task(&self, name: &str) -> Option<&DagTask> {
        self.tasks.iter().find(|t| t.name == name)
    }
}

/// One task inside a DAG template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagTask {
    pub name: String,
    /// Template executed for this task
    pub template: String,
    /// Tasks that must be terminal before this one is eligible
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Guard condition; the task is Omitted when it evaluates false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_on: Option<ContinueOn>,
}

/// Failure containment for a DAG task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinueOn {
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub error: bool,
}

impl ContinueOn {
    /// Whether a node finishing in `phase` should not veto its DAG
    pub fn tolerates(&self, phase: NodePhase) -> bool {
        match phase {
            NodePhase::Failed => self.failed,
            NodePhase::Error => self.error,
            _ => false,
        }
    }
}

/// Re-attempt policy for a template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryStrategy {
    /// Number of retries after the first attempt
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<RetryBackoff>,
}

/// Which attempt outcomes trigger a retry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryPolicy {
    #[default]
    OnFailure,
    OnError,
    Always,
}

impl RetryPolicy {
    pub fn should_retry(&self, phase: NodePhase) -> bool {
        match self {
            RetryPolicy::OnFailure => phase == NodePhase::Failed,
            RetryPolicy::OnError => phase == NodePhase::Error,
            RetryPolicy::Always => matches!(phase, NodePhase::Failed | NodePhase::Error),
        }
    }
}

/// Delay between attempts: `duration * factor^retry`, capped at `max_duration`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryBackoff {
    pub duration_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_seconds: Option<u64>,
}

impl RetryBackoff {
    /// Delay before retry number `retry` (0 = first retry)
    pub fn delay(&self, retry: u32) -> chrono::Duration {
        let factor = self.factor.unwrap_or(1.0).max(1.0);
        let mut seconds = self.duration_seconds as f64 * factor.powi(retry as i32);
        if let Some(max) = self.max_duration_seconds {
            seconds = seconds.min(max as f64);
        }
        chrono::Duration::milliseconds((seconds * 1000.0) as i64)
    }
}

/// Overall workflow phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Error,
}

impl WorkflowPhase {
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            WorkflowPhase::Succeeded | WorkflowPhase::Failed | WorkflowPhase::Error
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowPhase::Pending => "Pending",
            WorkflowPhase::Running => "Running",
            WorkflowPhase::Succeeded => "Succeeded",
            WorkflowPhase::Failed => "Failed",
            WorkflowPhase::Error => "Error",
        }
    }
}

impl std::fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(WorkflowPhase::Pending),
            "Running" => Ok(WorkflowPhase::Running),
            "Succeeded" => Ok(WorkflowPhase::Succeeded),
            "Failed" => Ok(WorkflowPhase::Failed),
            "Error" => Ok(WorkflowPhase::Error),
            other => Err(format!("unknown workflow phase: {}", other)),
        }
    }
}

/// Per-node lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodePhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Error,
    Skipped,
    Omitted,
}

impl NodePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodePhase::Pending => "Pending",
            NodePhase::Running => "Running",
            NodePhase::Succeeded => "Succeeded",
            NodePhase::Failed => "Failed",
            NodePhase::Error => "Error",
            NodePhase::Skipped => "Skipped",
            NodePhase::Omitted => "Omitted",
        }
    }
}

impl std::fmt::Display for NodePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Leaf task versus group container
///
/// `Dag` and `Retry` nodes own children and take their phase from them;
/// `Pod` nodes are dispatched to the task backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    Pod,
    Dag,
    Retry,
}

impl NodeType {
    pub fn is_group(&self) -> bool {
        !matches!(self, NodeType::Pod)
    }
}

/// Output captured from a finished task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeOutputs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

/// One node in the execution graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Stable identifier derived from `name`
    pub id: String,
    /// Fully qualified name, e.g. `basic.A` or `basic.A(1)` for a retry attempt
    pub name: String,
    pub display_name: String,
    pub node_type: NodeType,
    pub template_name: String,
    pub phase: NodePhase,
    /// Enclosing group node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boundary_id: Option<String>,
    #[serde(default)]
    pub children: Vec<String>,
    /// Sibling tasks a DAG task waited on, by task name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<NodeOutputs>,
    /// Handle returned by the task backend once dispatched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_ref: Option<String>,
    /// Failed dispatch attempts, counted against the infrastructure retry budget
    #[serde(default)]
    pub dispatch_attempts: u32,
}

/// Compressed node map stored in place of `nodes`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackedStatus {
    /// base64 of the zstd-compressed JSON node map
    pub data: String,
    /// Length of the uncompressed JSON
    pub raw_size: usize,
    /// hex SHA-256 of the uncompressed JSON
    pub checksum: String,
}

/// Execution state of a workflow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatus {
    #[serde(default)]
    pub phase: WorkflowPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Node map keyed by node ID; empty while packed or offloaded
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_nodes: Option<PackedStatus>,
    /// Content version of the node map held in the offload table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offload_node_status_version: Option<String>,
}

impl WorkflowStatus {
    /// Whether node details must be unpacked or hydrated before reading
    pub fn is_packed(&self) -> bool {
        self.compressed_nodes.is_some() || self.offload_node_status_version.is_some()
    }
}

/// A workflow template plus a schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronWorkflow {
    pub metadata: ObjectMeta,
    pub spec: CronWorkflowSpec,
    #[serde(default)]
    pub status: CronWorkflowStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronWorkflowSpec {
    /// Cron expression, 5-field Unix or 6-field with seconds
    pub schedule: String,
    /// Only UTC is supported; kept for manifest compatibility
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default)]
    pub concurrency_policy: ConcurrencyPolicy,
    #[serde(default)]
    pub suspend: bool,
    /// A tick missed by more than this is skipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starting_deadline_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_jobs_history_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_jobs_history_limit: Option<u32>,
    /// Labels and annotations stamped onto spawned workflows
    #[serde(default)]
    pub workflow_metadata: WorkflowTemplateMeta,
    pub workflow_spec: WorkflowSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplateMeta {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// How overlapping runs of one cron workflow are handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConcurrencyPolicy {
    #[default]
    Allow,
    Forbid,
    Replace,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CronWorkflowStatus {
    /// Spawned workflows that have not completed
    #[serde(default)]
    pub active: Vec<WorkflowRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scheduled_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_skipped_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_skip_reason: Option<String>,
}

/// Reference to a live workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRef {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

/// Label query: comma separated `key=value`, `key!=value` or bare `key` terms
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    terms: Vec<SelectorTerm>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SelectorTerm {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
}

impl LabelSelector {
    pub fn parse(selector: &str) -> Result<Self, String> {
        let mut terms = Vec::new();
        for raw in selector.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let term = if let Some((key, value)) = raw.split_once("!=") {
                SelectorTerm::NotEquals(key.trim().to_string(), value.trim().to_string())
            } else if let Some((key, value)) = raw.split_once('=') {
                SelectorTerm::Equals(
                    key.trim().to_string(),
                    value.trim_start_matches('=').trim().to_string(),
                )
            } else {
                SelectorTerm::Exists(raw.to_string())
            };
            let key = match &term {
                SelectorTerm::Equals(k, _) | SelectorTerm::NotEquals(k, _) | SelectorTerm::Exists(k) => k,
            };
            if key.is_empty() {
                return Err(format!("invalid label selector term: '{}'", raw));
            }
            terms.push(term);
        }
        Ok(Self { terms })
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.terms.iter().all(|term| match term {
            SelectorTerm::Equals(k, v) => labels.get(k) == Some(v),
            SelectorTerm::NotEquals(k, v) => labels.get(k) != Some(v),
            SelectorTerm::Exists(k) => labels.contains_key(k),
        })
    }
}
