//! Reconcile pass integration tests
//!
//! Each test drives a workflow pass by pass against a scripted backend,
//! finishing tasks by hand between passes.

mod common;

use anyhow::Result;
use argosy::{
    runtime::{EngineSettings, ExecutionEngine, TaskState},
    workflow::types::{
        DagTemplate, NodePhase, NodeType, RetryBackoff, RetryPolicy, ShutdownStrategy, TemplateBody, Workflow,
        WorkflowPhase, COMPLETED_LABEL,
    },
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::{container, dag, has_node, node, retrying, task, tolerant, workflow, ScriptedBackend};
use std::{sync::Arc, time::Duration};

fn engine(backend: &Arc<ScriptedBackend>) -> ExecutionEngine {
    ExecutionEngine::new(
        backend.clone(),
        EngineSettings {
            dispatch_retries: 3,
            cancel_grace: Duration::from_millis(50),
        },
    )
}

async fn pass(engine: &ExecutionEngine, wf: &mut Workflow) -> Result<argosy::runtime::ReconcileOutcome> {
    pass_at(engine, wf, Utc::now()).await
}

async fn pass_at(
    engine: &ExecutionEngine,
    wf: &mut Workflow,
    now: DateTime<Utc>,
) -> Result<argosy::runtime::ReconcileOutcome> {
    Ok(engine.reconcile(wf, now).await?)
}

fn set_dag_options(wf: &mut Workflow, parallelism: Option<usize>, fail_fast: Option<bool>) {
    for template in &mut wf.spec.templates {
        if let TemplateBody::Dag(DagTemplate {
            parallelism: p,
            fail_fast: f,
            ..
        }) = &mut template.body
        {
            *p = parallelism;
            *f = fail_fast;
        }
    }
}

#[tokio::test]
async fn test_linear_dag_runs_in_dependency_order() -> Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine(&backend);
    let mut wf = workflow(
        "linear",
        "main",
        vec![
            dag(
                "main",
                vec![task("a", "step", &[]), task("b", "step", &["a"]), task("c", "step", &["b"])],
            ),
            container("step"),
        ],
    );

    let outcome = pass(&engine, &mut wf).await?;
    assert!(outcome.changed);
    assert_eq!(outcome.phase, WorkflowPhase::Running);
    assert_eq!(outcome.dispatched.len(), 1);
    assert_eq!(backend.created(), vec!["linear.a"]);
    assert_eq!(node(&wf, "linear").node_type, NodeType::Dag);
    assert_eq!(node(&wf, "linear.a").phase, NodePhase::Running);
    assert!(!has_node(&wf, "linear.b"));

    backend.finish("linear.a", TaskState::Succeeded);
    pass(&engine, &mut wf).await?;
    assert_eq!(backend.created(), vec!["linear.a", "linear.b"]);

    backend.finish("linear.b", TaskState::Succeeded);
    pass(&engine, &mut wf).await?;
    backend.finish("linear.c", TaskState::Succeeded);
    let outcome = pass(&engine, &mut wf).await?;

    assert_eq!(backend.created(), vec!["linear.a", "linear.b", "linear.c"]);
    assert_eq!(outcome.phase, WorkflowPhase::Succeeded);
    assert_eq!(wf.status.phase, WorkflowPhase::Succeeded);
    assert!(wf.status.started_at.is_some());
    assert!(wf.status.finished_at.is_some());
    assert_eq!(wf.metadata.labels.get(COMPLETED_LABEL).map(String::as_str), Some("true"));
    assert_eq!(node(&wf, "linear").phase, NodePhase::Succeeded);
    assert_eq!(node(&wf, "linear").children.len(), 3);

    Ok(())
}

#[tokio::test]
async fn test_replayed_pass_dispatches_nothing() -> Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine(&backend);
    let mut wf = workflow(
        "replay",
        "main",
        vec![
            dag("main", vec![task("a", "step", &[]), task("b", "step", &[])]),
            container("step"),
        ],
    );

    pass(&engine, &mut wf).await?;
    let before = wf.status.nodes.clone();

    let outcome = pass(&engine, &mut wf).await?;
    assert!(!outcome.changed);
    assert!(outcome.dispatched.is_empty());
    assert_eq!(backend.created().len(), 2);
    assert_eq!(wf.status.nodes, before);

    Ok(())
}

#[tokio::test]
async fn test_completed_workflow_is_left_alone() -> Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine(&backend);
    let mut wf = workflow("done", "step", vec![container("step")]);

    pass(&engine, &mut wf).await?;
    backend.finish("done", TaskState::Succeeded);
    pass(&engine, &mut wf).await?;
    assert_eq!(wf.status.phase, WorkflowPhase::Succeeded);

    let snapshot = wf.clone();
    let outcome = pass(&engine, &mut wf).await?;
    assert!(!outcome.changed);
    assert_eq!(wf, snapshot);

    Ok(())
}

#[tokio::test]
async fn test_failed_dependency_skips_dependents() -> Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine(&backend);
    let mut wf = workflow(
        "skip",
        "main",
        vec![
            dag(
                "main",
                vec![
                    task("a", "step", &[]),
                    task("b", "step", &["a"]),
                    task("c", "step", &["b"]),
                    task("side", "step", &[]),
                ],
            ),
            container("step"),
        ],
    );

    pass(&engine, &mut wf).await?;
    backend.finish("skip.a", TaskState::Failed);
    pass(&engine, &mut wf).await?;

    let b = node(&wf, "skip.b");
    assert_eq!(b.phase, NodePhase::Skipped);
    assert_eq!(b.message.as_deref(), Some("dependency 'a' did not succeed"));
    let c = node(&wf, "skip.c");
    assert_eq!(c.phase, NodePhase::Skipped);
    assert_eq!(c.message.as_deref(), Some("dependency 'b' did not succeed"));
    assert_eq!(c.dependencies, vec!["b"]);
    assert!(node(&wf, "skip.a").dependencies.is_empty());
    assert!(!backend.dispatched("skip.b"));

    // the independent branch keeps the dag alive
    assert_eq!(wf.status.phase, WorkflowPhase::Running);
    backend.finish("skip.side", TaskState::Succeeded);
    pass(&engine, &mut wf).await?;

    assert_eq!(wf.status.phase, WorkflowPhase::Failed);
    assert_eq!(wf.status.message.as_deref(), Some("child 'skip.a' failed"));
    assert_eq!(node(&wf, "skip").phase, NodePhase::Failed);

    Ok(())
}

#[tokio::test]
async fn test_failed_nested_dag_fails_outer_dag() -> Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine(&backend);
    let mut wf = workflow(
        "nested",
        "main",
        vec![
            dag(
                "main",
                vec![task("g", "inner", &[]), task("y", "step", &["g"]), task("z", "step", &["g"])],
            ),
            dag("inner", vec![task("x", "step", &[])]),
            container("step"),
        ],
    );

    pass(&engine, &mut wf).await?;
    assert_eq!(node(&wf, "nested.g").node_type, NodeType::Dag);
    assert_eq!(node(&wf, "nested.g").phase, NodePhase::Running);
    assert_eq!(backend.created(), vec!["nested.g.x"]);

    backend.finish("nested.g.x", TaskState::Failed);
    for _ in 0..3 {
        if wf.is_completed() {
            break;
        }
        pass(&engine, &mut wf).await?;
    }

    assert_eq!(node(&wf, "nested.g.x").phase, NodePhase::Failed);
    assert_eq!(node(&wf, "nested.g").phase, NodePhase::Failed);
    for dependent in ["nested.y", "nested.z"] {
        let skipped = node(&wf, dependent);
        assert_eq!(skipped.phase, NodePhase::Skipped);
        assert_eq!(skipped.message.as_deref(), Some("dependency 'g' did not succeed"));
        assert_eq!(skipped.dependencies, vec!["g"]);
        assert!(!backend.dispatched(dependent));
    }
    assert_eq!(node(&wf, "nested").phase, NodePhase::Failed);
    assert_eq!(wf.status.phase, WorkflowPhase::Failed);

    Ok(())
}

#[tokio::test]
async fn test_task_error_makes_dag_error() -> Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine(&backend);
    let mut wf = workflow(
        "errs",
        "main",
        vec![dag("main", vec![task("a", "step", &[])]), container("step")],
    );

    pass(&engine, &mut wf).await?;
    backend.finish_with("errs.a", TaskState::Error, None, Some("image pull failed"));
    pass(&engine, &mut wf).await?;

    assert_eq!(node(&wf, "errs.a").phase, NodePhase::Error);
    assert_eq!(node(&wf, "errs.a").message.as_deref(), Some("image pull failed"));
    assert_eq!(wf.status.phase, WorkflowPhase::Error);

    Ok(())
}

#[tokio::test]
async fn test_continue_on_failed_contains_failure() -> Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine(&backend);
    let mut wf = workflow(
        "tolerant",
        "main",
        vec![
            dag(
                "main",
                vec![tolerant(task("a", "step", &[])), task("b", "step", &["a"])],
            ),
            container("step"),
        ],
    );

    pass(&engine, &mut wf).await?;
    backend.finish("tolerant.a", TaskState::Failed);
    pass(&engine, &mut wf).await?;
    assert!(backend.dispatched("tolerant.b"));

    backend.finish("tolerant.b", TaskState::Succeeded);
    pass(&engine, &mut wf).await?;

    assert_eq!(node(&wf, "tolerant.a").phase, NodePhase::Failed);
    assert_eq!(wf.status.phase, WorkflowPhase::Succeeded);

    Ok(())
}

#[tokio::test]
async fn test_fail_fast_stops_new_tasks() -> Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine(&backend);
    let mut wf = workflow(
        "fast",
        "main",
        vec![
            dag("main", vec![task("a", "step", &[]), task("b", "step", &[])]),
            container("step"),
        ],
    );
    set_dag_options(&mut wf, Some(1), None);

    pass(&engine, &mut wf).await?;
    assert_eq!(backend.created(), vec!["fast.a"]);
    assert!(!has_node(&wf, "fast.b"));

    backend.finish("fast.a", TaskState::Failed);
    pass(&engine, &mut wf).await?;

    let b = node(&wf, "fast.b");
    assert_eq!(b.phase, NodePhase::Skipped);
    assert_eq!(b.message.as_deref(), Some("task 'a' failed and the dag fails fast"));
    assert_eq!(wf.status.phase, WorkflowPhase::Failed);
    assert_eq!(backend.created(), vec!["fast.a"]);

    Ok(())
}

#[tokio::test]
async fn test_without_fail_fast_remaining_tasks_run() -> Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine(&backend);
    let mut wf = workflow(
        "slow",
        "main",
        vec![
            dag("main", vec![task("a", "step", &[]), task("b", "step", &[])]),
            container("step"),
        ],
    );
    set_dag_options(&mut wf, Some(1), Some(false));

    pass(&engine, &mut wf).await?;
    backend.finish("slow.a", TaskState::Failed);
    pass(&engine, &mut wf).await?;
    assert_eq!(backend.created(), vec!["slow.a", "slow.b"]);
    assert_eq!(wf.status.phase, WorkflowPhase::Running);

    backend.finish("slow.b", TaskState::Succeeded);
    pass(&engine, &mut wf).await?;
    assert_eq!(wf.status.phase, WorkflowPhase::Failed);
    assert_eq!(wf.status.message.as_deref(), Some("child 'slow.a' failed"));

    Ok(())
}

#[tokio::test]
async fn test_false_guard_omits_task() -> Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine(&backend);
    let mut cleanup = task("cleanup", "step", &["a"]);
    cleanup.when = Some("{{tasks.a.status}} == Failed".to_string());
    let mut wf = workflow(
        "guarded",
        "main",
        vec![dag("main", vec![task("a", "step", &[]), cleanup]), container("step")],
    );

    pass(&engine, &mut wf).await?;
    backend.finish("guarded.a", TaskState::Succeeded);
    pass(&engine, &mut wf).await?;

    let omitted = node(&wf, "guarded.cleanup");
    assert_eq!(omitted.phase, NodePhase::Omitted);
    assert!(omitted.message.as_deref().unwrap_or("").contains("evaluated false"));
    assert!(!backend.dispatched("guarded.cleanup"));
    assert_eq!(wf.status.phase, WorkflowPhase::Succeeded);

    Ok(())
}

#[tokio::test]
async fn test_unparseable_guard_errors_task() -> Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine(&backend);
    let mut odd = task("odd", "step", &[]);
    odd.when = Some("maybe".to_string());
    let mut wf = workflow("badguard", "main", vec![dag("main", vec![odd]), container("step")]);

    pass(&engine, &mut wf).await?;

    let odd = node(&wf, "badguard.odd");
    assert_eq!(odd.phase, NodePhase::Error);
    assert!(odd.message.as_deref().unwrap_or("").starts_with("invalid when expression"));
    assert_eq!(wf.status.phase, WorkflowPhase::Error);
    assert!(backend.created().is_empty());

    Ok(())
}

#[tokio::test]
async fn test_retries_until_limit() -> Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine(&backend);
    let mut wf = workflow("flaky", "step", vec![retrying("step", 2, RetryPolicy::OnFailure)]);

    pass(&engine, &mut wf).await?;
    assert_eq!(node(&wf, "flaky").node_type, NodeType::Retry);

    backend.finish("flaky(0)", TaskState::Failed);
    pass(&engine, &mut wf).await?;
    backend.finish("flaky(1)", TaskState::Failed);
    pass(&engine, &mut wf).await?;
    backend.finish_with("flaky(2)", TaskState::Failed, Some(2), Some("exit status 2"));
    pass(&engine, &mut wf).await?;

    assert_eq!(backend.created(), vec!["flaky(0)", "flaky(1)", "flaky(2)"]);
    let retry = node(&wf, "flaky");
    assert_eq!(retry.children.len(), 3);
    assert_eq!(retry.phase, NodePhase::Failed);
    assert_eq!(retry.message.as_deref(), Some("No more retries left: exit status 2"));
    assert_eq!(retry.outputs.as_ref().and_then(|o| o.exit_code), Some(2));
    assert_eq!(wf.status.phase, WorkflowPhase::Failed);
    assert_eq!(wf.status.message.as_deref(), Some("No more retries left: exit status 2"));

    Ok(())
}

#[tokio::test]
async fn test_retry_recovers_after_failure() -> Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine(&backend);
    let mut wf = workflow("recover", "step", vec![retrying("step", 3, RetryPolicy::Always)]);

    pass(&engine, &mut wf).await?;
    backend.finish("recover(0)", TaskState::Error);
    pass(&engine, &mut wf).await?;
    backend.finish("recover(1)", TaskState::Succeeded);
    pass(&engine, &mut wf).await?;

    assert_eq!(node(&wf, "recover").phase, NodePhase::Succeeded);
    assert_eq!(node(&wf, "recover(0)").phase, NodePhase::Error);
    assert_eq!(wf.status.phase, WorkflowPhase::Succeeded);

    Ok(())
}

#[tokio::test]
async fn test_retry_policy_ignores_other_outcomes() -> Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine(&backend);
    let mut wf = workflow("picky", "step", vec![retrying("step", 3, RetryPolicy::OnError)]);

    pass(&engine, &mut wf).await?;
    backend.finish("picky(0)", TaskState::Failed);
    pass(&engine, &mut wf).await?;

    assert_eq!(backend.created(), vec!["picky(0)"]);
    assert_eq!(wf.status.phase, WorkflowPhase::Failed);

    Ok(())
}

#[tokio::test]
async fn test_retry_backoff_delays_next_attempt() -> Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine(&backend);
    let mut template = retrying("step", 1, RetryPolicy::OnFailure);
    if let Some(strategy) = template.retry_strategy.as_mut() {
        strategy.backoff = Some(RetryBackoff {
            duration_seconds: 30,
            factor: None,
            max_duration_seconds: None,
        });
    }
    let mut wf = workflow("patient", "step", vec![template]);

    let t0 = Utc::now();
    pass_at(&engine, &mut wf, t0).await?;
    backend.finish("patient(0)", TaskState::Failed);

    let outcome = pass_at(&engine, &mut wf, t0 + ChronoDuration::seconds(1)).await?;
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(30)));
    assert_eq!(backend.created(), vec!["patient(0)"]);

    let outcome = pass_at(&engine, &mut wf, t0 + ChronoDuration::seconds(11)).await?;
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(20)));
    assert_eq!(backend.created(), vec!["patient(0)"]);

    pass_at(&engine, &mut wf, t0 + ChronoDuration::seconds(32)).await?;
    assert_eq!(backend.created(), vec!["patient(0)", "patient(1)"]);

    Ok(())
}

#[tokio::test]
async fn test_retry_inside_dag() -> Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine(&backend);
    let mut wf = workflow(
        "nested",
        "main",
        vec![
            dag("main", vec![task("a", "flaky", &[]), task("b", "step", &["a"])]),
            retrying("flaky", 1, RetryPolicy::OnFailure),
            container("step"),
        ],
    );

    pass(&engine, &mut wf).await?;
    assert_eq!(node(&wf, "nested.a").node_type, NodeType::Retry);
    backend.finish("nested.a(0)", TaskState::Failed);
    pass(&engine, &mut wf).await?;
    backend.finish("nested.a(1)", TaskState::Succeeded);
    pass(&engine, &mut wf).await?;

    assert_eq!(node(&wf, "nested.a").phase, NodePhase::Succeeded);
    assert!(backend.dispatched("nested.b"));

    Ok(())
}

#[tokio::test]
async fn test_workflow_parallelism_caps_running_pods() -> Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine(&backend);
    let mut wf = workflow(
        "wide",
        "main",
        vec![
            dag(
                "main",
                vec![
                    task("a", "step", &[]),
                    task("b", "step", &[]),
                    task("c", "step", &[]),
                    task("d", "step", &[]),
                ],
            ),
            container("step"),
        ],
    );
    wf.spec.parallelism = Some(2);

    pass(&engine, &mut wf).await?;
    assert_eq!(backend.created(), vec!["wide.a", "wide.b"]);
    assert_eq!(node(&wf, "wide.c").phase, NodePhase::Pending);

    pass(&engine, &mut wf).await?;
    assert_eq!(backend.created().len(), 2);

    backend.finish("wide.a", TaskState::Succeeded);
    pass(&engine, &mut wf).await?;
    assert_eq!(backend.created(), vec!["wide.a", "wide.b", "wide.c"]);

    Ok(())
}

#[tokio::test]
async fn test_dag_parallelism_limits_active_tasks() -> Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine(&backend);
    let mut wf = workflow(
        "narrow",
        "main",
        vec![
            dag(
                "main",
                vec![task("a", "step", &[]), task("b", "step", &[]), task("c", "step", &[])],
            ),
            container("step"),
        ],
    );
    set_dag_options(&mut wf, Some(1), None);

    pass(&engine, &mut wf).await?;
    assert_eq!(backend.created(), vec!["narrow.a"]);
    assert!(!has_node(&wf, "narrow.b"));

    backend.finish("narrow.a", TaskState::Succeeded);
    pass(&engine, &mut wf).await?;
    assert_eq!(backend.created(), vec!["narrow.a", "narrow.b"]);
    assert!(!has_node(&wf, "narrow.c"));

    Ok(())
}

#[tokio::test]
async fn test_dispatch_failures_exhaust_budget() -> Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine(&backend);
    let mut wf = workflow("stuck", "step", vec![container("step")]);
    backend.fail_dispatch("stuck", 10);

    let outcome = pass(&engine, &mut wf).await?;
    assert_eq!(outcome.requeue_after, Some(Duration::from_millis(100)));
    assert_eq!(node(&wf, "stuck").phase, NodePhase::Pending);
    assert_eq!(node(&wf, "stuck").dispatch_attempts, 1);

    let outcome = pass(&engine, &mut wf).await?;
    assert_eq!(outcome.requeue_after, Some(Duration::from_millis(200)));

    let outcome = pass(&engine, &mut wf).await?;
    assert_eq!(outcome.requeue_after, Some(Duration::ZERO));
    let stuck = node(&wf, "stuck");
    assert_eq!(stuck.phase, NodePhase::Error);
    assert!(stuck
        .message
        .as_deref()
        .unwrap_or("")
        .starts_with("failed to dispatch after 3 attempts"));

    pass(&engine, &mut wf).await?;
    assert_eq!(wf.status.phase, WorkflowPhase::Error);
    assert!(backend.created().is_empty());

    Ok(())
}

#[tokio::test]
async fn test_dispatch_recovers_within_budget() -> Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine(&backend);
    let mut wf = workflow("blip", "step", vec![container("step")]);
    backend.fail_dispatch("blip", 1);

    pass(&engine, &mut wf).await?;
    let outcome = pass(&engine, &mut wf).await?;

    assert_eq!(outcome.dispatched.len(), 1);
    assert_eq!(node(&wf, "blip").phase, NodePhase::Running);
    assert_eq!(node(&wf, "blip").dispatch_attempts, 1);

    Ok(())
}

#[tokio::test]
async fn test_exit_handler_runs_after_root() -> Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine(&backend);
    let mut wf = workflow("exits", "step", vec![container("step"), container("cleanup")]);
    wf.spec.on_exit = Some("cleanup".to_string());

    pass(&engine, &mut wf).await?;
    assert!(!has_node(&wf, "exits.onExit"));

    backend.finish("exits", TaskState::Succeeded);
    pass(&engine, &mut wf).await?;
    assert_eq!(wf.status.phase, WorkflowPhase::Running);
    assert_eq!(node(&wf, "exits.onExit").display_name, "onExit");

    backend.finish("exits.onExit", TaskState::Failed);
    pass(&engine, &mut wf).await?;
    assert_eq!(wf.status.phase, WorkflowPhase::Failed);
    assert_eq!(wf.status.message.as_deref(), Some("exit handler failed"));

    Ok(())
}

#[tokio::test]
async fn test_stop_cancels_nodes_but_runs_exit_handler() -> Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine(&backend);
    let mut wf = workflow(
        "stopped",
        "main",
        vec![
            dag("main", vec![task("a", "step", &[]), task("b", "step", &["a"])]),
            container("step"),
            container("cleanup"),
        ],
    );
    wf.spec.on_exit = Some("cleanup".to_string());

    pass(&engine, &mut wf).await?;
    let task_ref = node(&wf, "stopped.a").task_ref.clone();

    wf.spec.shutdown = Some(ShutdownStrategy::Stop);
    pass(&engine, &mut wf).await?;

    assert_eq!(backend.terminated(), task_ref.into_iter().collect::<Vec<_>>());
    assert!(backend.killed().is_empty());
    let a = node(&wf, "stopped.a");
    assert_eq!(a.phase, NodePhase::Failed);
    assert_eq!(a.message.as_deref(), Some("Stopped with strategy 'Stop'"));
    assert!(!has_node(&wf, "stopped.b"));
    assert!(backend.dispatched("stopped.onExit"));
    assert_eq!(wf.status.phase, WorkflowPhase::Running);

    backend.finish("stopped.onExit", TaskState::Succeeded);
    pass(&engine, &mut wf).await?;
    assert_eq!(node(&wf, "stopped.onExit").phase, NodePhase::Succeeded);
    assert_eq!(wf.status.phase, WorkflowPhase::Failed);
    assert_eq!(wf.status.message.as_deref(), Some("Stopped with strategy 'Stop'"));

    Ok(())
}

#[tokio::test]
async fn test_terminate_skips_exit_handler() -> Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine(&backend);
    let mut wf = workflow(
        "killed",
        "main",
        vec![
            dag("main", vec![tolerant(task("a", "step", &[]))]),
            container("step"),
            container("cleanup"),
        ],
    );
    wf.spec.on_exit = Some("cleanup".to_string());

    pass(&engine, &mut wf).await?;
    wf.spec.shutdown = Some(ShutdownStrategy::Terminate);
    let outcome = pass(&engine, &mut wf).await?;

    // cancellation is not contained by continue-on
    assert_eq!(node(&wf, "killed.a").phase, NodePhase::Failed);
    assert_eq!(outcome.phase, WorkflowPhase::Failed);
    assert_eq!(wf.status.message.as_deref(), Some("Stopped with strategy 'Terminate'"));
    assert!(!has_node(&wf, "killed.onExit"));

    Ok(())
}

#[tokio::test]
async fn test_unresponsive_task_is_killed() -> Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    backend.ignore_terminate();
    let engine = engine(&backend);
    let mut wf = workflow("stubborn", "step", vec![container("step")]);

    pass(&engine, &mut wf).await?;
    let task_ref = node(&wf, "stubborn").task_ref.clone().unwrap_or_default();

    wf.spec.shutdown = Some(ShutdownStrategy::Terminate);
    pass(&engine, &mut wf).await?;

    assert_eq!(backend.terminated(), vec![task_ref.clone()]);
    assert_eq!(backend.killed(), vec![task_ref]);
    assert_eq!(wf.status.phase, WorkflowPhase::Failed);

    Ok(())
}

#[tokio::test]
async fn test_shutdown_before_start_fails_immediately() -> Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine(&backend);
    let mut wf = workflow("early", "step", vec![container("step")]);
    wf.spec.shutdown = Some(ShutdownStrategy::Stop);

    let outcome = pass(&engine, &mut wf).await?;

    assert_eq!(outcome.phase, WorkflowPhase::Failed);
    assert!(wf.status.nodes.is_empty());
    assert!(backend.created().is_empty());

    Ok(())
}
