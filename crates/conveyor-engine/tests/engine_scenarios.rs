//! End-to-end engine scenarios against the in-memory store:
//! submission and idempotency, diamond-DAG joins, choice branching,
//! lease exclusion, retry/DLQ policy with replay, quality-gate failures,
//! cancellation, and dry runs.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use conveyor_core::context::WorkflowContext;
use conveyor_core::error::{ErrorCategory, RunError};
use conveyor_core::quality::QualityOutcome;
use conveyor_core::registry::{HandlerRegistry, OperationInvocation, WorkflowRegistry};
use conveyor_core::run::{DuplicatePolicy, JsonMap, Run, RunKind, RunStatus, WorkSpec};
use conveyor_core::step::{ErrorPolicy, Step, StepResult};
use conveyor_core::workflow::{ExecutionPolicy, Workflow};
use conveyor_engine::{
    CancellationHub, ConcurrencyGuard, Dispatcher, DispatcherConfig, Executor,
    ExecutorConfig, QualityGate, RunnerConfig, WorkflowResult, WorkflowRunStatus,
    WorkflowRunner,
};
use conveyor_storage::{CoreStore, DeadLetterFilter, InMemoryStore, Pagination, RunFilter};

struct Harness {
    store: Arc<dyn CoreStore>,
    handlers: Arc<HandlerRegistry>,
    workflows: Arc<WorkflowRegistry>,
    dispatcher: Arc<Dispatcher>,
    #[allow(dead_code)]
    executor: Arc<Executor>,
}

async fn harness() -> Harness {
    tracing_subscriber::fmt()
        .with_env_filter("conveyor=debug")
        .try_init()
        .ok();

    let store: Arc<dyn CoreStore> = Arc::new(InMemoryStore::new());
    let handlers = Arc::new(HandlerRegistry::new());
    let workflows = Arc::new(WorkflowRegistry::new());
    let cancels = Arc::new(CancellationHub::new());
    let (queue_tx, queue_rx) = tokio::sync::mpsc::unbounded_channel();

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        queue_tx,
        Arc::clone(&cancels),
        DispatcherConfig::default(),
    ));
    let guard = ConcurrencyGuard::new(Arc::clone(&store), 1800);
    let runner = Arc::new(WorkflowRunner::new(
        Arc::clone(&store),
        Arc::clone(&dispatcher),
        guard,
        RunnerConfig {
            operation_poll_interval: Duration::from_millis(10),
            wait_poll_interval: Duration::from_millis(25),
            ..Default::default()
        },
    ));
    let executor = Arc::new(Executor::new(
        Arc::clone(&store),
        Arc::clone(&handlers),
        Arc::clone(&workflows),
        Arc::clone(&dispatcher),
        runner,
        cancels,
        queue_rx,
        ExecutorConfig { max_concurrency: 8 },
    ));
    executor.start().await;

    Harness {
        store,
        handlers,
        workflows,
        dispatcher,
        executor,
    }
}

async fn await_terminal(store: &Arc<dyn CoreStore>, run_id: Uuid) -> Run {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(run) = store.get_run(run_id).await.unwrap() {
            if run.status.is_terminal() {
                return run;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run {run_id} did not reach a terminal status"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn workflow_result(run: &Run) -> WorkflowResult {
    let map = run.result.clone().expect("workflow run has a result");
    serde_json::from_value(serde_json::Value::Object(map)).expect("workflow result decodes")
}

fn ok_step(name: &str) -> Step {
    Step::lambda(name, |_ctx, _cfg| StepResult::ok_empty())
}

// =============================================================================
// Idempotent ingest (handler-level dedup plus dispatcher keys)
// =============================================================================

#[tokio::test]
async fn idempotent_ingest_skips_second_run() {
    let h = harness().await;

    let ingested: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let raw_rows = Arc::new(AtomicUsize::new(0));

    let seen = Arc::clone(&ingested);
    let rows = Arc::clone(&raw_rows);
    h.handlers.register(
        RunKind::Task,
        "finra.otc_transparency.ingest_week",
        "weekly OTC transparency ingest",
        move |inv: OperationInvocation| {
            let seen = Arc::clone(&seen);
            let rows = Arc::clone(&rows);
            async move {
                let file = inv
                    .params
                    .get("file_path")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let force = inv
                    .params
                    .get("force")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);

                let mut out = JsonMap::new();
                let mut seen = seen.lock().unwrap();
                if seen.contains(&file) && !force {
                    out.insert("skipped".into(), json!(true));
                    out.insert("records".into(), json!(0));
                    return Ok(out);
                }
                seen.insert(file);
                rows.fetch_add(120, Ordering::SeqCst);
                out.insert("skipped".into(), json!(false));
                out.insert("records".into(), json!(120));
                Ok(out)
            }
        },
    );

    let mut params = JsonMap::new();
    params.insert("file_path".into(), json!("fixtures/week_2025-12-26.psv"));
    params.insert("tier".into(), json!("OTC"));
    params.insert("force".into(), json!(true));

    let first = h
        .dispatcher
        .submit(
            WorkSpec::task("finra.otc_transparency.ingest_week").with_params(params.clone()),
        )
        .await
        .unwrap();
    let first_run = await_terminal(&h.store, first).await;
    assert_eq!(first_run.status, RunStatus::Completed);
    let result = first_run.result.unwrap();
    assert!(result["records"].as_i64().unwrap() > 0);
    assert_eq!(raw_rows.load(Ordering::SeqCst), 120);

    // Same week again, without force: handler skips, raw table unchanged
    params.remove("force");
    let second = h
        .dispatcher
        .submit(
            WorkSpec::task("finra.otc_transparency.ingest_week").with_params(params),
        )
        .await
        .unwrap();
    let second_run = await_terminal(&h.store, second).await;
    assert_eq!(second_run.status, RunStatus::Completed);
    assert_eq!(second_run.result.unwrap()["skipped"], json!(true));
    assert_eq!(raw_rows.load(Ordering::SeqCst), 120);
}

#[tokio::test]
async fn same_idempotency_key_returns_same_run() {
    let h = harness().await;
    h.handlers.register(RunKind::Task, "noop", "", |_inv| async {
        Ok(JsonMap::new())
    });

    let spec = WorkSpec::task("noop").with_idempotency_key("ingest:OTC:2025-12-26");
    let first = h.dispatcher.submit(spec.clone()).await.unwrap();
    let second = h.dispatcher.submit(spec.clone()).await.unwrap();
    assert_eq!(first, second);

    // Still deduplicated after completion
    await_terminal(&h.store, first).await;
    let third = h.dispatcher.submit(spec.clone()).await.unwrap();
    assert_eq!(first, third);

    // ReturnExisting policy keeps even failed runs as-is
    let spec = spec.on_terminal_duplicate(DuplicatePolicy::ReturnExisting);
    let fourth = h.dispatcher.submit(spec).await.unwrap();
    assert_eq!(first, fourth);
}

// =============================================================================
// Diamond DAG
// =============================================================================

#[tokio::test]
async fn diamond_dag_joins_after_both_branches() {
    let h = harness().await;

    let workflow = Workflow::with_policy(
        "test.diamond",
        vec![
            ok_step("a"),
            ok_step("b").with_depends_on(vec!["a".to_string()]),
            ok_step("c").with_depends_on(vec!["a".to_string()]),
            ok_step("d").with_depends_on(vec!["b".to_string(), "c".to_string()]),
        ],
        ExecutionPolicy::parallel(4),
    )
    .unwrap();
    h.workflows.register(workflow).unwrap();

    let run_id = h
        .dispatcher
        .submit(WorkSpec::workflow("test.diamond"))
        .await
        .unwrap();
    let run = await_terminal(&h.store, run_id).await;
    assert_eq!(run.status, RunStatus::Completed);

    let result = workflow_result(&run);
    assert_eq!(result.status, WorkflowRunStatus::Completed);
    let completed: HashSet<&str> =
        result.completed_steps.iter().map(String::as_str).collect();
    assert_eq!(completed, HashSet::from(["a", "b", "c", "d"]));

    let finished = |name: &str| {
        result
            .step_executions
            .iter()
            .find(|e| e.step_name == name)
            .and_then(|e| e.finished_at)
            .unwrap()
    };
    let started_d = result
        .step_executions
        .iter()
        .find(|e| e.step_name == "d")
        .and_then(|e| e.started_at)
        .unwrap();
    assert!(started_d >= finished("b").max(finished("c")));
}

// =============================================================================
// Choice branching
// =============================================================================

#[tokio::test]
async fn choice_routes_to_exactly_one_branch() {
    let h = harness().await;

    let workflow = Workflow::with_policy(
        "test.choice",
        vec![
            Step::choice(
                "route",
                |ctx: &WorkflowContext| ctx.bool_param("valid", false),
                "process",
                Some("reject".to_string()),
            ),
            ok_step("process"),
            ok_step("reject"),
        ],
        ExecutionPolicy::parallel(2),
    )
    .unwrap();
    h.workflows.register(workflow).unwrap();

    // valid=true routes to process
    let mut params = JsonMap::new();
    params.insert("valid".into(), json!(true));
    let run_id = h
        .dispatcher
        .submit(WorkSpec::workflow("test.choice").with_params(params))
        .await
        .unwrap();
    let result = workflow_result(&await_terminal(&h.store, run_id).await);
    assert!(result.completed_steps.contains(&"process".to_string()));
    assert!(result.skipped_steps.contains(&"reject".to_string()));
    assert!(!result.completed_steps.contains(&"reject".to_string()));

    // valid=false routes to reject
    let mut params = JsonMap::new();
    params.insert("valid".into(), json!(false));
    let run_id = h
        .dispatcher
        .submit(WorkSpec::workflow("test.choice").with_params(params))
        .await
        .unwrap();
    let result = workflow_result(&await_terminal(&h.store, run_id).await);
    assert!(result.completed_steps.contains(&"reject".to_string()));
    assert!(result.skipped_steps.contains(&"process".to_string()));
}

#[tokio::test]
async fn sequential_choice_skips_until_target() {
    let h = harness().await;

    let workflow = Workflow::new(
        "test.choice_seq",
        vec![
            Step::choice("route", |_ctx: &WorkflowContext| true, "target", None),
            ok_step("skip_me"),
            ok_step("also_skipped"),
            ok_step("target"),
        ],
    )
    .unwrap();
    h.workflows.register(workflow).unwrap();

    let run_id = h
        .dispatcher
        .submit(WorkSpec::workflow("test.choice_seq"))
        .await
        .unwrap();
    let result = workflow_result(&await_terminal(&h.store, run_id).await);
    assert_eq!(result.status, WorkflowRunStatus::Completed);
    assert_eq!(
        result.skipped_steps,
        vec!["skip_me".to_string(), "also_skipped".to_string()]
    );
    assert!(result.completed_steps.contains(&"target".to_string()));
}

// =============================================================================
// Lease exclusion
// =============================================================================

#[tokio::test]
async fn lease_excludes_second_owner_until_release() {
    let h = harness().await;
    let guard = ConcurrencyGuard::new(Arc::clone(&h.store), 1800);

    assert!(guard
        .acquire("pipeline:otc.ingest", "exec-A", Some(1800))
        .await
        .unwrap());
    assert!(!guard
        .acquire("pipeline:otc.ingest", "exec-B", Some(1800))
        .await
        .unwrap());
    assert!(guard.release("pipeline:otc.ingest", "exec-A").await.unwrap());
    assert!(guard
        .acquire("pipeline:otc.ingest", "exec-B", Some(1800))
        .await
        .unwrap());
}

// =============================================================================
// Retry and dead-letter policy
// =============================================================================

#[tokio::test]
async fn retryable_failure_retries_until_success() {
    let h = harness().await;

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    h.handlers.register(
        RunKind::Task,
        "flaky.fetch",
        "fails once, then succeeds",
        move |_inv| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(RunError::categorized(
                        "connection reset",
                        ErrorCategory::Network,
                    ))
                } else {
                    Ok(JsonMap::new())
                }
            }
        },
    );

    let run_id = h
        .dispatcher
        .submit(
            WorkSpec::task("flaky.fetch")
                .with_max_retries(2)
                .with_retry_delay(0),
        )
        .await
        .unwrap();

    let first = await_terminal(&h.store, run_id).await;
    assert_eq!(first.status, RunStatus::Failed);

    // The retry-linked run completes
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let retry = loop {
        let all = h
            .store
            .list_runs(&RunFilter::default(), Pagination::new(50, 0))
            .await
            .unwrap();
        let found = all
            .items
            .into_iter()
            .find(|r| r.retry_of_run_id == Some(run_id) && r.status.is_terminal());
        if let Some(run) = found {
            break run;
        }
        assert!(tokio::time::Instant::now() < deadline, "retry never appeared");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(retry.status, RunStatus::Completed);
    assert_eq!(retry.attempt, 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    // The failed attempt was not dead-lettered (a retry was scheduled)
    let dead = h
        .store
        .list_dead_letters(&DeadLetterFilter::default(), Pagination::default())
        .await
        .unwrap();
    assert_eq!(dead.total, 0);
}

#[tokio::test]
async fn terminal_failure_dead_letters_and_replays() {
    let h = harness().await;

    let should_fail = Arc::new(AtomicUsize::new(1));
    let flag = Arc::clone(&should_fail);
    h.handlers.register(
        RunKind::Task,
        "doomed.load",
        "fails until the flag clears",
        move |_inv| {
            let flag = Arc::clone(&flag);
            async move {
                if flag.load(Ordering::SeqCst) == 1 {
                    Err(RunError::permanent("schema mismatch in source file"))
                } else {
                    Ok(JsonMap::new())
                }
            }
        },
    );

    let run_id = h.dispatcher.submit(WorkSpec::task("doomed.load")).await.unwrap();
    await_terminal(&h.store, run_id).await;

    // `failed` and `dead_lettered` are written in sequence; wait for the
    // second transition.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let run = h.store.get_run(run_id).await.unwrap().unwrap();
        if run.status == RunStatus::DeadLettered {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "run never dead-lettered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let dead = h
        .store
        .list_dead_letters(&DeadLetterFilter::default(), Pagination::default())
        .await
        .unwrap();
    assert_eq!(dead.total, 1);
    let entry = &dead.items[0];
    assert_eq!(entry.origin_run_id, run_id);
    assert!(!entry.is_replayed());

    // Fix the upstream problem, then replay
    should_fail.store(0, Ordering::SeqCst);
    let new_run_id = h.dispatcher.replay_dead_letter(entry.id).await.unwrap();
    assert_ne!(new_run_id, run_id);

    let replayed = await_terminal(&h.store, new_run_id).await;
    assert_eq!(replayed.status, RunStatus::Completed);
    assert_eq!(replayed.retry_of_run_id, Some(run_id));

    // The entry is kept, annotated with the replay
    let entry = h.store.get_dead_letter(entry.id).await.unwrap().unwrap();
    assert_eq!(entry.replayed_as_run_id, Some(new_run_id));
}

// =============================================================================
// Quality gate
// =============================================================================

#[tokio::test]
async fn quality_gate_failure_fails_the_workflow() {
    let h = harness().await;

    let gate_store = Arc::clone(&h.store);
    h.handlers.register(
        RunKind::Operation,
        "quality.check_partition",
        "runs the partition quality gate",
        move |inv: OperationInvocation| {
            let store = Arc::clone(&gate_store);
            async move {
                let ctx = WorkflowContext::new(inv.run_id, "quality", inv.params.clone());
                let mut gate = QualityGate::new(store, inv.run_id);
                gate.add("row_count_floor", |_| {
                    QualityOutcome::fail("row count below floor")
                        .with_values(json!(12), json!({"min": 100}))
                });
                gate.run_all(&ctx, Some("2025-12-26"))
                    .await
                    .map_err(|e| RunError::new(e.to_string()))?;
                if gate
                    .has_failures()
                    .await
                    .map_err(|e| RunError::new(e.to_string()))?
                {
                    return Err(RunError::categorized(
                        "quality gate failed",
                        ErrorCategory::QualityGate,
                    ));
                }
                Ok(JsonMap::new())
            }
        },
    );

    let workflow = Workflow::new(
        "test.quality",
        vec![
            Step::operation("check", "quality.check_partition", JsonMap::new()),
            ok_step("publish"),
        ],
    )
    .unwrap();
    h.workflows.register(workflow).unwrap();

    let run_id = h
        .dispatcher
        .submit(WorkSpec::workflow("test.quality"))
        .await
        .unwrap();
    let run = await_terminal(&h.store, run_id).await;
    assert!(matches!(
        run.status,
        RunStatus::Failed | RunStatus::DeadLettered
    ));

    let error = run.error.unwrap();
    assert!(error.message.contains("step check failed"));
    assert_eq!(error.category, ErrorCategory::QualityGate);

    // The failed check row is recorded against the child run
    let children = h.store.list_child_runs(run_id).await.unwrap();
    assert_eq!(children.len(), 1);
    assert!(h
        .store
        .run_has_quality_failures(children[0].run_id)
        .await
        .unwrap());
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn cancel_interrupts_a_waiting_workflow() {
    let h = harness().await;

    let workflow = Workflow::new(
        "test.waits",
        vec![Step::wait("pause", 300), ok_step("never_reached")],
    )
    .unwrap();
    h.workflows.register(workflow).unwrap();

    let run_id = h
        .dispatcher
        .submit(WorkSpec::workflow("test.waits"))
        .await
        .unwrap();

    // Wait for the run to start, then cancel
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let run = h.store.get_run(run_id).await.unwrap().unwrap();
        if run.status == RunStatus::Running {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    h.dispatcher.cancel(run_id, "operator requested").await.unwrap();

    let run = await_terminal(&h.store, run_id).await;
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(run.finished_at.is_some());

    let events = h.store.list_events(run_id, None, 100).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == "cancelled"));
    // Event IDs stay monotone through the cancellation path
    assert!(events.windows(2).all(|w| w[0].event_id < w[1].event_id));
}

#[tokio::test]
async fn cancelling_a_completed_run_is_a_noop() {
    let h = harness().await;
    h.handlers
        .register(RunKind::Task, "noop", "", |_inv| async { Ok(JsonMap::new()) });

    let run_id = h.dispatcher.submit(WorkSpec::task("noop")).await.unwrap();
    let run = await_terminal(&h.store, run_id).await;
    assert_eq!(run.status, RunStatus::Completed);

    let after = h.dispatcher.cancel(run_id, "too late").await.unwrap();
    assert_eq!(after.status, RunStatus::Completed);
}

// =============================================================================
// Error policies and dry runs
// =============================================================================

#[tokio::test]
async fn continue_policy_yields_partial_result() {
    let h = harness().await;

    let workflow = Workflow::new(
        "test.partial",
        vec![
            ok_step("a"),
            Step::lambda("b", |_ctx, _cfg| StepResult::fail("intentional failure"))
                .with_on_error(ErrorPolicy::Continue),
            ok_step("c"),
        ],
    )
    .unwrap();
    h.workflows.register(workflow).unwrap();

    let run_id = h
        .dispatcher
        .submit(WorkSpec::workflow("test.partial"))
        .await
        .unwrap();
    let run = await_terminal(&h.store, run_id).await;
    // Partial workflows complete the run; the result records the detail
    assert_eq!(run.status, RunStatus::Completed);

    let result = workflow_result(&run);
    assert_eq!(result.status, WorkflowRunStatus::Partial);
    assert_eq!(result.failed_steps, vec!["b".to_string()]);
    assert!(result.completed_steps.contains(&"c".to_string()));
    assert!(result.error_step.is_none());
}

#[tokio::test]
async fn stop_policy_halts_and_records_error_step() {
    let h = harness().await;

    let workflow = Workflow::new(
        "test.halts",
        vec![
            ok_step("a"),
            Step::lambda("b", |_ctx, _cfg| StepResult::fail("intentional failure")),
            ok_step("c"),
        ],
    )
    .unwrap();
    h.workflows.register(workflow).unwrap();

    let run_id = h
        .dispatcher
        .submit(WorkSpec::workflow("test.halts"))
        .await
        .unwrap();
    let run = await_terminal(&h.store, run_id).await;
    assert!(matches!(
        run.status,
        RunStatus::Failed | RunStatus::DeadLettered
    ));
    assert!(run.error.unwrap().message.contains("step b failed"));

    let events = h.store.list_events(run_id, None, 100).await.unwrap();
    let step_events: Vec<&str> = events
        .iter()
        .filter(|e| e.event_type.starts_with("step_"))
        .filter_map(|e| e.data.get("step").and_then(|v| v.as_str()))
        .collect();
    assert!(step_events.contains(&"b"));
    assert!(!step_events.contains(&"c"));
}

#[tokio::test]
async fn dry_run_evaluates_routing_without_handlers() {
    let h = harness().await;

    let invoked = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invoked);
    let workflow = Workflow::new(
        "test.dry",
        vec![
            Step::choice(
                "route",
                |ctx: &WorkflowContext| ctx.bool_param("valid", false),
                "work",
                None,
            ),
            Step::lambda("work", move |_ctx, _cfg| {
                counter.fetch_add(1, Ordering::SeqCst);
                StepResult::ok_empty()
            }),
        ],
    )
    .unwrap();
    h.workflows.register(workflow).unwrap();

    let mut spec = WorkSpec::workflow("test.dry");
    spec.params.insert("valid".into(), json!(true));
    spec.metadata.insert("dry_run".into(), json!(true));

    let run_id = h.dispatcher.submit(spec).await.unwrap();
    let run = await_terminal(&h.store, run_id).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    let result = workflow_result(&run);
    assert!(result.completed_steps.contains(&"work".to_string()));
}

// =============================================================================
// Operation steps and lineage
// =============================================================================

#[tokio::test]
async fn operation_step_spawns_linked_child_run() {
    let h = harness().await;

    h.handlers.register(
        RunKind::Operation,
        "ingest.partition",
        "",
        |inv: OperationInvocation| async move {
            let mut out = JsonMap::new();
            out.insert(
                "tier".into(),
                inv.params.get("tier").cloned().unwrap_or(json!(null)),
            );
            out.insert("records".into(), json!(42));
            Ok(out)
        },
    );

    let mut op_params = JsonMap::new();
    op_params.insert("tier".into(), json!("OTC"));
    let workflow = Workflow::new(
        "test.lineage",
        vec![Step::operation("ingest", "ingest.partition", op_params)],
    )
    .unwrap();
    h.workflows.register(workflow).unwrap();

    let run_id = h
        .dispatcher
        .submit(WorkSpec::workflow("test.lineage").with_correlation_id("corr-7"))
        .await
        .unwrap();
    let run = await_terminal(&h.store, run_id).await;
    assert_eq!(run.status, RunStatus::Completed);

    let children = h.store.list_child_runs(run_id).await.unwrap();
    assert_eq!(children.len(), 1);
    let child = &children[0];
    assert_eq!(child.kind, RunKind::Operation);
    assert_eq!(child.parent_run_id, Some(run_id));
    assert_eq!(child.correlation_id.as_deref(), Some("corr-7"));
    assert_eq!(child.status, RunStatus::Completed);

    // The child's output is the step's output
    let result = workflow_result(&run);
    let exec = result
        .step_executions
        .iter()
        .find(|e| e.step_name == "ingest")
        .unwrap();
    assert_eq!(exec.output.as_ref().unwrap()["records"], json!(42));
}
