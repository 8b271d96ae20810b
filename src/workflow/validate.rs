/// Submission-time validation
///
/// Every check here runs before a workflow is created, so malformed DAGs never
/// reach the reconciliation loop. Cycle detection reuses petgraph's toposort
/// over the task dependency graph, and again over the template call graph.

use crate::error::{EngineError, Result};
use crate::runtime::scheduler::parse_schedule;
use crate::workflow::types::{CronWorkflow, DagTemplate, TemplateBody, Workflow, WorkflowSpec};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

/// Validate a workflow before submission
pub fn validate_workflow(workflow: &Workflow) -> Result<()> {
    validate_spec(&workflow.spec)
}

/// Validate templates, references, and DAG shape
pub fn validate_spec(spec: &WorkflowSpec) -> Result<()> {
    if spec.entrypoint.trim().is_empty() {
        return Err(invalid("spec.entrypoint is required"));
    }
    if spec.parallelism == Some(0) {
        return Err(invalid("spec.parallelism must be greater than zero"));
    }

    let mut names = HashSet::new();
    for template in &spec.templates {
        if template.name.trim().is_empty() {
            return Err(invalid("template name must not be empty"));
        }
        if !names.insert(template.name.as_str()) {
            return Err(invalid(format!("duplicate template '{}'", template.name)));
        }
    }

    if !names.contains(spec.entrypoint.as_str()) {
        return Err(invalid(format!(
            "entrypoint template '{}' not found",
            spec.entrypoint
        )));
    }
    if let Some(on_exit) = &spec.on_exit {
        if !names.contains(on_exit.as_str()) {
            return Err(invalid(format!("onExit template '{}' not found", on_exit)));
        }
    }

    for template in &spec.templates {
        match &template.body {
            TemplateBody::Container(container) => {
                if container.image.trim().is_empty() {
                    return Err(invalid(format!(
                        "template '{}': container image is required",
                        template.name
                    )));
                }
            }
            TemplateBody::Dag(dag) => validate_dag(&template.name, dag, &names)?,
        }
    }

    validate_template_graph(spec)
}

/// Task names, references, and acyclicity within one DAG template
fn validate_dag(template_name: &str, dag: &DagTemplate, templates: &HashSet<&str>) -> Result<()> {
    if dag.tasks.is_empty() {
        return Err(invalid(format!("template '{}': dag has no tasks", template_name)));
    }
    if dag.parallelism == Some(0) {
        return Err(invalid(format!(
            "template '{}': dag parallelism must be greater than zero",
            template_name
        )));
    }

    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();

    for task in &dag.tasks {
        if task.name.trim().is_empty() || task.name.contains('.') {
            return Err(invalid(format!(
                "template '{}': invalid task name '{}'",
                template_name, task.name
            )));
        }
        if index.contains_key(task.name.as_str()) {
            return Err(invalid(format!(
                "template '{}': duplicate task '{}'",
                template_name, task.name
            )));
        }
        if !templates.contains(task.template.as_str()) {
            return Err(invalid(format!(
                "template '{}': task '{}' references unknown template '{}'",
                template_name, task.name, task.template
            )));
        }
        index.insert(task.name.as_str(), graph.add_node(task.name.as_str()));
    }

    for task in &dag.tasks {
        let to = index[task.name.as_str()];
        for dep in &task.dependencies {
            let from = index.get(dep.as_str()).ok_or_else(|| {
                invalid(format!(
                    "template '{}': task '{}' depends on unknown task '{}'",
                    template_name, task.name, dep
                ))
            })?;
            graph.add_edge(*from, to, ());
        }
    }

    toposort(&graph, None).map_err(|cycle| {
        invalid(format!(
            "template '{}': dependency cycle involving task '{}'",
            template_name, graph[cycle.node_id()]
        ))
    })?;
    Ok(())
}

/// Reject DAG templates that (transitively) call themselves
fn validate_template_graph(spec: &WorkflowSpec) -> Result<()> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let index: HashMap<&str, NodeIndex> = spec
        .templates
        .iter()
        .map(|t| (t.name.as_str(), graph.add_node(t.name.as_str())))
        .collect();

    for template in &spec.templates {
        if let TemplateBody::Dag(dag) = &template.body {
            for task in &dag.tasks {
                graph.add_edge(index[template.name.as_str()], index[task.template.as_str()], ());
            }
        }
    }

    toposort(&graph, None).map_err(|cycle| {
        invalid(format!(
            "template '{}' recursively references itself",
            graph[cycle.node_id()]
        ))
    })?;
    Ok(())
}

/// Validate a cron workflow: schedule, timezone, and embedded spec
pub fn validate_cron_workflow(cron: &CronWorkflow) -> Result<()> {
    parse_schedule(&cron.spec.schedule).map_err(EngineError::Validation)?;
    match cron.spec.timezone.as_deref() {
        None | Some("") | Some("UTC") | Some("Etc/UTC") => {}
        Some(other) => {
            return Err(invalid(format!(
                "unsupported timezone '{}': only UTC schedules are supported",
                other
            )))
        }
    }
    validate_spec(&cron.spec.workflow_spec)
}

fn invalid(message: impl Into<String>) -> EngineError {
    EngineError::Validation(message.into())
}
