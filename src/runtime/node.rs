/// Node state machine
///
/// Lifecycle rules for one node of a workflow's status document:
/// Pending → Running → {Succeeded, Failed, Error, Skipped}, plus nodes created
/// directly in a terminal phase (Omitted when a guard is false, Skipped when a
/// dependency vetoed them). Once terminal, a node never moves again.

use crate::workflow::types::{ContinueOn, NodePhase, NodeStatus, NodeType, WorkflowPhase};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Rejected phase change
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition for node {node}: {from} -> {to}")]
pub struct TransitionError {
    pub node: String,
    pub from: NodePhase,
    pub to: NodePhase,
}

impl NodePhase {
    /// Succeeded, Failed, Error, Skipped or Omitted
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NodePhase::Pending | NodePhase::Running)
    }

    /// Terminal phases that count as success for aggregation
    pub fn is_fulfilled_ok(&self) -> bool {
        matches!(
            self,
            NodePhase::Succeeded | NodePhase::Skipped | NodePhase::Omitted
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, NodePhase::Failed | NodePhase::Error)
    }

    /// Monotonic transition table
    pub fn can_transition_to(&self, to: NodePhase) -> bool {
        match (self, to) {
            (from, to) if *from == to => true,
            (NodePhase::Pending, _) => true,
            (NodePhase::Running, to) => to != NodePhase::Pending && to != NodePhase::Omitted,
            _ => false,
        }
    }
}

/// Deterministic node identifier
///
/// The root node shares the workflow name; every other node hashes its fully
/// qualified name, so re-running a reconcile pass always lands on the same entry.
pub fn node_id(workflow_name: &str, node_name: &str) -> String {
    if node_name == workflow_name {
        return workflow_name.to_string();
    }
    let hash = Uuid::new_v5(&Uuid::NAMESPACE_OID, node_name.as_bytes()).simple().to_string();
    format!("{}-{}", workflow_name, &hash[..10])
}

impl NodeStatus {
    /// New node in the given phase
    pub fn new(
        workflow_name: &str,
        name: String,
        display_name: String,
        node_type: NodeType,
        template_name: String,
        boundary_id: Option<String>,
        phase: NodePhase,
        now: DateTime<Utc>,
    ) -> Self {
        let mut node = Self {
            id: node_id(workflow_name, &name),
            name,
            display_name,
            node_type,
            template_name,
            phase,
            boundary_id,
            children: Vec::new(),
            dependencies: Vec::new(),
            started_at: None,
            finished_at: None,
            message: None,
            outputs: None,
            task_ref: None,
            dispatch_attempts: 0,
        };
        if phase != NodePhase::Pending {
            node.started_at = Some(now);
        }
        if phase.is_terminal() {
            node.finished_at = Some(now);
        }
        node
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Move to `to`, stamping start/finish times
    ///
    /// Re-asserting the current phase is a no-op; anything that would leave a
    /// terminal phase is rejected.
    pub fn transition(
        &mut self,
        to: NodePhase,
        message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<bool, TransitionError> {
        if self.phase == to {
            return Ok(false);
        }
        if !self.phase.can_transition_to(to) {
            return Err(TransitionError {
                node: self.name.clone(),
                from: self.phase,
                to,
            });
        }
        tracing::debug!("🔁 Node '{}' {} -> {}", self.name, self.phase, to);
        self.phase = to;
        if to != NodePhase::Pending && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.finished_at = Some(now);
        }
        if message.is_some() {
            self.message = message;
        }
        Ok(true)
    }
}

/// Phase of a group given its children, applied at every nesting level
///
/// `pending` counts children that have not been created yet but still may be.
/// A child failure is contained when `containment` says so for that child.
pub fn aggregate_phase<'a>(
    children: impl IntoIterator<Item = (&'a NodeStatus, Option<ContinueOn>)>,
    pending: usize,
) -> NodePhase {
    let mut saw_failed = false;
    let mut saw_error = false;
    let mut running = pending > 0;

    for (child, containment) in children {
        match child.phase {
            NodePhase::Pending | NodePhase::Running => running = true,
            NodePhase::Failed | NodePhase::Error
                if containment.map(|c| c.tolerates(child.phase)).unwrap_or(false) => {}
            NodePhase::Failed => saw_failed = true,
            NodePhase::Error => saw_error = true,
            _ => {}
        }
    }

    if running {
        NodePhase::Running
    } else if saw_error && !saw_failed {
        NodePhase::Error
    } else if saw_failed || saw_error {
        NodePhase::Failed
    } else {
        NodePhase::Succeeded
    }
}

/// Workflow phase derived from its root (and exit handler) node
pub fn workflow_phase_from(root: NodePhase, exit_handler: Option<NodePhase>) -> WorkflowPhase {
    let main = match root {
        NodePhase::Pending => WorkflowPhase::Pending,
        NodePhase::Running => WorkflowPhase::Running,
        NodePhase::Failed => WorkflowPhase::Failed,
        NodePhase::Error => WorkflowPhase::Error,
        NodePhase::Succeeded | NodePhase::Skipped | NodePhase::Omitted => WorkflowPhase::Succeeded,
    };
    match (main, exit_handler) {
        (WorkflowPhase::Succeeded, Some(exit)) if exit.is_failure() => WorkflowPhase::Failed,
        _ => main,
    }
}

/// All attempts recorded under a retry node, oldest first
pub fn attempts<'a>(
    nodes: &'a BTreeMap<String, NodeStatus>,
    retry_node: &NodeStatus,
) -> Vec<&'a NodeStatus> {
    retry_node
        .children
        .iter()
        .filter_map(|id| nodes.get(id))
        .collect()
}
