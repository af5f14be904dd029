//! Operations surface: envelope semantics, paging, and the wiring from
//! typed requests down through the engine and back.

use std::time::Duration;

use serde_json::json;

use conveyor_core::context::WorkflowContext;
use conveyor_core::run::{JsonMap, RunKind, RunStatus};
use conveyor_core::step::{Step, StepResult};
use conveyor_core::workflow::Workflow;
use conveyor_ops::requests::*;
use conveyor_ops::{ops, App, Config};

async fn app() -> App {
    App::start(Config::default()).await.unwrap()
}

async fn await_status(app: &App, run_id: uuid::Uuid, wanted: RunStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let result = ops::get_run(app, run_id).await;
        if let Some(detail) = result.data {
            let status = detail.summary.status;
            if status == wanted {
                return;
            }
            assert!(
                !status.is_terminal(),
                "run settled at {status} instead of {wanted}"
            );
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run {run_id} never reached {wanted}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn submit_and_fetch_round_trip() {
    let app = app().await;
    app.handlers
        .register(RunKind::Task, "echo", "echoes params", |inv| async move {
            Ok(inv.params)
        });

    let mut req = SubmitRunRequest::task("echo");
    req.params.insert("x".into(), json!(7));
    let accepted = ops::submit_run(&app, req).await;
    assert!(accepted.success);
    let run_id = accepted.data.unwrap().run_id;

    await_status(&app, run_id, RunStatus::Completed).await;
    let detail = ops::get_run(&app, run_id).await.data.unwrap();
    assert_eq!(detail.result.unwrap()["x"], json!(7));

    let events = ops::get_run_events(
        &app,
        GetRunEventsRequest {
            run_id,
            after_event_id: None,
            limit: 100,
        },
    )
    .await
    .data
    .unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types[..3], ["created", "queued", "started"]);
    assert_eq!(*types.last().unwrap(), "completed");

    app.shutdown();
}

#[tokio::test]
async fn unknown_entities_return_not_found_envelopes() {
    let app = app().await;

    let missing = ops::get_run(&app, uuid::Uuid::now_v7()).await;
    assert!(!missing.success);
    assert_eq!(missing.error.unwrap().code, "not_found");

    let missing = ops::get_workflow(&app, "ghost.workflow").await;
    assert_eq!(missing.error.unwrap().code, "not_found");

    let missing = ops::replay_dead_letter(&app, uuid::Uuid::now_v7()).await;
    assert_eq!(missing.error.unwrap().code, "not_found");

    app.shutdown();
}

#[tokio::test]
async fn list_runs_pages_with_stable_totals() {
    let app = app().await;
    app.handlers
        .register(RunKind::Task, "noop", "", |_inv| async { Ok(JsonMap::new()) });

    let mut last = None;
    for _ in 0..5 {
        let accepted = ops::submit_run(&app, SubmitRunRequest::task("noop")).await;
        last = Some(accepted.data.unwrap().run_id);
    }
    await_status(&app, last.unwrap(), RunStatus::Completed).await;

    let page = ops::list_runs(
        &app,
        ListRunsRequest {
            name: Some("noop".to_string()),
            limit: 2,
            offset: 0,
            ..Default::default()
        },
    )
    .await;
    assert!(page.success);
    assert_eq!(page.data.unwrap().len(), 2);
    let paging = page.paging.unwrap();
    assert_eq!(paging.total, 5);
    assert!(paging.has_more);

    app.shutdown();
}

#[tokio::test]
async fn workflow_surface_runs_registered_definitions() {
    let app = app().await;
    let workflow = Workflow::new(
        "greet",
        vec![Step::lambda("hello", |ctx: &WorkflowContext, _cfg| {
            let name = ctx.str_param("name").unwrap_or("world").to_string();
            let mut out = JsonMap::new();
            out.insert("greeting".into(), json!(format!("hello {name}")));
            StepResult::ok(out)
        })],
    )
    .unwrap();
    app.workflows.register(workflow).unwrap();

    let listed = ops::list_workflows(&app).await.data.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "greet");

    let detail = ops::get_workflow(&app, "greet").await.data.unwrap();
    assert_eq!(detail.steps.len(), 1);
    assert_eq!(detail.steps[0].step_type, "lambda");

    let mut req = RunWorkflowRequest {
        name: "greet".to_string(),
        params: JsonMap::new(),
        idempotency_key: None,
        dry_run: false,
        start_from: None,
    };
    req.params.insert("name".into(), json!("conveyor"));
    let accepted = ops::run_workflow(&app, req).await;
    let run_id = accepted.data.unwrap().run_id;
    await_status(&app, run_id, RunStatus::Completed).await;

    let detail = ops::get_run(&app, run_id).await.data.unwrap();
    let result = detail.result.unwrap();
    assert_eq!(
        result["context_snapshot"]["outputs"]["hello"]["greeting"],
        json!("hello conveyor")
    );

    app.shutdown();
}

#[tokio::test]
async fn schedule_crud_and_validation() {
    let app = app().await;

    // Zero interval is rejected
    let rejected = ops::create_schedule(
        &app,
        CreateScheduleRequest {
            name: "bad".to_string(),
            target_kind: RunKind::Task,
            target_name: "noop".to_string(),
            cron_expression: None,
            interval_seconds: Some(0),
            run_at: None,
            params: JsonMap::new(),
            enabled: true,
            max_instances: None,
            misfire_grace_seconds: None,
        },
    )
    .await;
    assert_eq!(rejected.error.unwrap().code, "validation_failed");

    let created = ops::create_schedule(
        &app,
        CreateScheduleRequest {
            name: "otc-daily".to_string(),
            target_kind: RunKind::Task,
            target_name: "otc.refresh".to_string(),
            cron_expression: Some("0 18 * * 1-5".to_string()),
            interval_seconds: None,
            run_at: None,
            params: JsonMap::new(),
            enabled: true,
            max_instances: None,
            misfire_grace_seconds: None,
        },
    )
    .await;
    assert!(created.success);
    let view = created.data.unwrap();
    // A fresh cron schedule has its first boundary computed
    assert!(view.next_run_at.is_some());

    let updated = ops::update_schedule(
        &app,
        UpdateScheduleRequest {
            schedule_id: view.schedule_id,
            enabled: Some(false),
            cron_expression: None,
            interval_seconds: None,
            run_at: None,
            params: None,
            max_instances: None,
            misfire_grace_seconds: None,
        },
    )
    .await
    .data
    .unwrap();
    assert!(!updated.enabled);

    assert!(ops::delete_schedule(&app, view.schedule_id).await.success);
    let gone = ops::get_schedule(&app, view.schedule_id).await;
    assert_eq!(gone.error.unwrap().code, "not_found");

    app.shutdown();
}

#[tokio::test]
async fn watermark_and_readiness_surface() {
    let app = app().await;

    let advanced = ops::advance_watermark(
        &app,
        AdvanceWatermarkRequest {
            domain: "equity".to_string(),
            source: "polygon".to_string(),
            partition_key: "AAPL".to_string(),
            high_water: "2026-02-15T00:00:00Z".to_string(),
            low_water: None,
            metadata: None,
        },
    )
    .await
    .data
    .unwrap();
    assert_eq!(advanced.high_water, "2026-02-15T00:00:00Z");

    // Backward advance is a no-op
    let unchanged = ops::advance_watermark(
        &app,
        AdvanceWatermarkRequest {
            domain: "equity".to_string(),
            source: "polygon".to_string(),
            partition_key: "AAPL".to_string(),
            high_water: "2026-02-14T00:00:00Z".to_string(),
            low_water: None,
            metadata: None,
        },
    )
    .await
    .data
    .unwrap();
    assert_eq!(unchanged.high_water, "2026-02-15T00:00:00Z");

    let gaps = ops::list_watermark_gaps(
        &app,
        ListWatermarkGapsRequest {
            domain: "equity".to_string(),
            source: "polygon".to_string(),
            expected_partition_keys: vec!["AAPL".to_string(), "MSFT".to_string()],
        },
    )
    .await
    .data
    .unwrap();
    assert_eq!(gaps.len(), 1);
    assert_eq!(gaps[0].partition_key, "MSFT");

    // Readiness is driven by manifest entries
    let not_ready = ops::check_data_readiness(
        &app,
        CheckDataReadinessRequest {
            domain: "equity".to_string(),
            partition_key: "2026-02-14".to_string(),
            stages: vec!["ingest".to_string(), "normalize".to_string()],
        },
    )
    .await
    .data
    .unwrap();
    assert!(!not_ready.ready);
    assert_eq!(not_ready.missing_stages.len(), 2);

    for stage in ["ingest", "normalize"] {
        app.store
            .upsert_manifest(&conveyor_core::readiness::ManifestEntry {
                domain: "equity".to_string(),
                partition_key: "2026-02-14".to_string(),
                stage: stage.to_string(),
                completed_at: chrono::Utc::now(),
                run_id: None,
                metadata: JsonMap::new(),
            })
            .await
            .unwrap();
    }

    let ready = ops::check_data_readiness(
        &app,
        CheckDataReadinessRequest {
            domain: "equity".to_string(),
            partition_key: "2026-02-14".to_string(),
            stages: vec!["ingest".to_string(), "normalize".to_string()],
        },
    )
    .await
    .data
    .unwrap();
    assert!(ready.ready);
    assert!(ready.missing_stages.is_empty());

    app.shutdown();
}

#[tokio::test]
async fn admin_health_and_purge() {
    let app = app().await;

    let health = ops::check_database_health(&app).await.data.unwrap();
    assert_eq!(health.backend, "memory");
    assert!(health
        .tables
        .iter()
        .any(|t| t.table == "core_executions"));

    let rejected = ops::purge_old_data(
        &app,
        PurgeRequest {
            older_than_days: 0,
            tables: None,
        },
    )
    .await;
    assert_eq!(rejected.error.unwrap().code, "validation_failed");

    let purged = ops::purge_old_data(
        &app,
        PurgeRequest {
            older_than_days: 90,
            tables: None,
        },
    )
    .await
    .data
    .unwrap();
    assert!(!purged.is_empty());

    app.shutdown();
}
