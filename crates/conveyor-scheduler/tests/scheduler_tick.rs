//! Scheduler tick behavior: due-schedule firing, idempotent double
//! ticks, misfire handling, lease-based skip, and max-instances.
//!
//! Ticks run against a dispatcher whose executor queue is held but not
//! consumed, so submitted runs stay queued and assertions are stable.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};

use conveyor_core::run::{Priority, Run, RunKind, RunStatus};
use conveyor_core::schedule::{Schedule, ScheduleRunStatus};
use conveyor_engine::{CancellationHub, Dispatcher, DispatcherConfig};
use conveyor_scheduler::{Scheduler, SchedulerConfig};
use conveyor_storage::{CoreStore, InMemoryStore, Pagination, RunFilter};

struct Harness {
    store: Arc<dyn CoreStore>,
    scheduler: Scheduler,
    // Held so the dispatcher queue stays open
    _queue_rx: tokio::sync::mpsc::UnboundedReceiver<uuid::Uuid>,
}

fn harness(instance_id: &str) -> Harness {
    let store: Arc<dyn CoreStore> = Arc::new(InMemoryStore::new());
    let (queue_tx, queue_rx) = tokio::sync::mpsc::unbounded_channel();
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        queue_tx,
        Arc::new(CancellationHub::new()),
        DispatcherConfig::default(),
    ));
    let scheduler = Scheduler::new(
        Arc::clone(&store),
        dispatcher,
        SchedulerConfig {
            instance_id: instance_id.to_string(),
            tick_interval: StdDuration::from_secs(5),
            lock_ttl_margin_seconds: 30,
        },
    );
    Harness {
        store,
        scheduler,
        _queue_rx: queue_rx,
    }
}

async fn run_count(store: &Arc<dyn CoreStore>, name: &str) -> u64 {
    store
        .list_runs(
            &RunFilter {
                name: Some(name.to_string()),
                ..Default::default()
            },
            Pagination::new(1, 0),
        )
        .await
        .unwrap()
        .total
}

#[tokio::test]
async fn due_interval_schedule_fires_and_advances() {
    let h = harness("sched-a");
    let now = Utc::now();

    let mut schedule = Schedule::interval("otc-refresh", RunKind::Task, "otc.refresh", 60);
    schedule.next_run_at = Some(now - Duration::seconds(10));
    h.store.insert_schedule(&schedule).await.unwrap();

    let summary = h.scheduler.tick_at(now).await.unwrap();
    assert_eq!(summary.due, 1);
    assert_eq!(summary.fired, 1);
    assert_eq!(summary.misfired, 0);

    assert_eq!(run_count(&h.store, "otc.refresh").await, 1);

    let updated = h.store.get_schedule(schedule.schedule_id).await.unwrap().unwrap();
    assert_eq!(updated.next_run_at, Some(now + Duration::seconds(60)));
    assert_eq!(updated.last_run_at, Some(now));
    assert_eq!(updated.last_run_status.as_deref(), Some("running"));

    let trigger_rows = h
        .store
        .list_schedule_runs(schedule.schedule_id, 10)
        .await
        .unwrap();
    assert_eq!(trigger_rows.len(), 1);
    assert_eq!(trigger_rows[0].status, ScheduleRunStatus::Triggered);
    assert!(trigger_rows[0].run_id.is_some());

    // The lease was released after the schedule update
    assert!(h.store.list_schedule_locks().await.unwrap().is_empty());
}

#[tokio::test]
async fn boundary_idempotency_prevents_double_fire() {
    let h = harness("sched-a");
    let now = Utc::now();
    let due_at = now - Duration::seconds(10);

    let mut schedule = Schedule::interval("tickly", RunKind::Task, "tick.target", 60);
    // Unlimited instances so the dedup being tested is the boundary key
    schedule.max_instances = 0;
    schedule.next_run_at = Some(due_at);
    h.store.insert_schedule(&schedule).await.unwrap();

    h.scheduler.tick_at(now).await.unwrap();

    // Simulate a second instance that read the schedule before the
    // first instance advanced it: same boundary, second fire.
    let mut stale = h.store.get_schedule(schedule.schedule_id).await.unwrap().unwrap();
    stale.next_run_at = Some(due_at);
    h.store.update_schedule(&stale).await.unwrap();

    let summary = h.scheduler.tick_at(now).await.unwrap();
    assert_eq!(summary.fired, 1);

    // The boundary-derived idempotency key deduplicated the submission
    assert_eq!(run_count(&h.store, "tick.target").await, 1);
}

#[tokio::test]
async fn stale_boundary_misfires_without_submitting() {
    let h = harness("sched-a");
    let now = Utc::now();

    let mut schedule = Schedule::interval("laggy", RunKind::Task, "laggy.target", 60)
        .with_misfire_grace(300);
    schedule.next_run_at = Some(now - Duration::seconds(1000));
    h.store.insert_schedule(&schedule).await.unwrap();

    let summary = h.scheduler.tick_at(now).await.unwrap();
    assert_eq!(summary.fired, 0);
    assert_eq!(summary.misfired, 1);

    assert_eq!(run_count(&h.store, "laggy.target").await, 0);

    let rows = h.store.list_schedule_runs(schedule.schedule_id, 10).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, ScheduleRunStatus::Misfired);
    assert!(rows[0].run_id.is_none());

    let updated = h.store.get_schedule(schedule.schedule_id).await.unwrap().unwrap();
    assert_eq!(updated.last_run_status.as_deref(), Some("misfired"));
    assert_eq!(updated.next_run_at, Some(now + Duration::seconds(60)));
}

#[tokio::test]
async fn past_date_schedule_misfires_and_exhausts() {
    let h = harness("sched-a");
    let now = Utc::now();

    let mut schedule = Schedule::once(
        "oneshot",
        RunKind::Task,
        "oneshot.target",
        now - Duration::seconds(1000),
    )
    .with_misfire_grace(300);
    schedule.next_run_at = schedule.run_at;
    h.store.insert_schedule(&schedule).await.unwrap();

    let summary = h.scheduler.tick_at(now).await.unwrap();
    assert_eq!(summary.misfired, 1);

    // Exhausted: no future boundary, so never due again
    let updated = h.store.get_schedule(schedule.schedule_id).await.unwrap().unwrap();
    assert_eq!(updated.next_run_at, None);

    let summary = h.scheduler.tick_at(now + Duration::seconds(60)).await.unwrap();
    assert_eq!(summary.due, 0);
}

#[tokio::test]
async fn held_lease_skips_the_schedule() {
    let h = harness("sched-a");
    let now = Utc::now();

    let mut schedule = Schedule::interval("contended", RunKind::Task, "contended.target", 60);
    schedule.next_run_at = Some(now - Duration::seconds(10));
    h.store.insert_schedule(&schedule).await.unwrap();

    // Another instance holds the per-schedule lease
    assert!(h
        .store
        .acquire_schedule_lock(schedule.schedule_id, "sched-b", 600, now)
        .await
        .unwrap());

    let summary = h.scheduler.tick_at(now).await.unwrap();
    assert_eq!(summary.skipped_locked, 1);
    assert_eq!(summary.fired, 0);
    assert_eq!(run_count(&h.store, "contended.target").await, 0);
}

#[tokio::test]
async fn max_instances_defers_firing() {
    let h = harness("sched-a");
    let now = Utc::now();

    let mut schedule = Schedule::interval("bounded", RunKind::Task, "bounded.target", 60);
    schedule.max_instances = 1;
    schedule.next_run_at = Some(now - Duration::seconds(10));
    h.store.insert_schedule(&schedule).await.unwrap();

    // A previous instance of the target is still running
    let live = Run {
        run_id: uuid::Uuid::now_v7(),
        kind: RunKind::Task,
        name: "bounded.target".to_string(),
        params: Default::default(),
        status: RunStatus::Running,
        lane: "default".to_string(),
        priority: Priority::Normal,
        parent_run_id: None,
        correlation_id: None,
        batch_id: None,
        idempotency_key: None,
        retry_of_run_id: None,
        attempt: 1,
        max_retries: 0,
        retry_delay_seconds: 30,
        created_at: now,
        started_at: Some(now),
        finished_at: None,
        result: None,
        error: None,
        metadata: Default::default(),
    };
    h.store.insert_run(&live).await.unwrap();

    let summary = h.scheduler.tick_at(now).await.unwrap();
    assert_eq!(summary.skipped_max_instances, 1);
    assert_eq!(summary.fired, 0);
    assert_eq!(run_count(&h.store, "bounded.target").await, 1);

    // The boundary is left in place for a later tick
    let updated = h.store.get_schedule(schedule.schedule_id).await.unwrap().unwrap();
    assert_eq!(updated.next_run_at, Some(now - Duration::seconds(10)));
}
