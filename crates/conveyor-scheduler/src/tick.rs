//! Scheduler tick
//!
//! A tick finds enabled schedules whose `next_run_at` has passed and, for
//! each, under a per-schedule lease:
//!
//! 1. checks the misfire grace — stale boundaries are recorded as
//!    misfires and advanced without submitting,
//! 2. enforces `max_instances` against live runs of the target,
//! 3. submits through the dispatcher with a boundary-derived idempotency
//!    key (so a double tick cannot double-fire),
//! 4. records a `core_schedule_runs` row and advances `next_run_at`.
//!
//! The lease is released after the schedule row update, not after the
//! submitted run completes. Multiple scheduler instances may tick
//! concurrently; the lease is the only coordination.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use conveyor_core::error::CoreError;
use conveyor_core::ids::{new_run_id, short_id};
use conveyor_core::run::{RunStatus, WorkSpec};
use conveyor_core::schedule::{Schedule, ScheduleRun, ScheduleRunStatus};
use conveyor_engine::Dispatcher;
use conveyor_storage::{CoreStore, Pagination, RunFilter};

use crate::compute;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Identifies this scheduler instance in schedule locks
    pub instance_id: String,

    /// Tick cadence for the background loop
    pub tick_interval: Duration,

    /// Margin added to a schedule's misfire grace for the lease TTL
    pub lock_ttl_margin_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("scheduler-{}", short_id(&new_run_id())),
            tick_interval: Duration::from_secs(5),
            lock_ttl_margin_seconds: 30,
        }
    }
}

/// Counters for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub due: u32,
    pub fired: u32,
    pub misfired: u32,
    pub skipped_locked: u32,
    pub skipped_max_instances: u32,
}

/// Periodic schedule evaluator.
pub struct Scheduler {
    store: Arc<dyn CoreStore>,
    dispatcher: Arc<Dispatcher>,
    config: SchedulerConfig,
    shutdown_tx: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn CoreStore>,
        dispatcher: Arc<Dispatcher>,
        config: SchedulerConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            dispatcher,
            config,
            shutdown_tx,
        }
    }

    /// Run one tick at the current instant.
    pub async fn tick(&self) -> Result<TickSummary, CoreError> {
        self.tick_at(Utc::now()).await
    }

    /// Run one tick at an explicit instant (tests, catch-up).
    #[instrument(skip(self))]
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickSummary, CoreError> {
        let due = self.store.due_schedules(now).await?;
        let mut summary = TickSummary {
            due: due.len() as u32,
            ..Default::default()
        };

        for schedule in due {
            let ttl = schedule.misfire_grace_seconds + self.config.lock_ttl_margin_seconds;
            let locked = self
                .store
                .acquire_schedule_lock(
                    schedule.schedule_id,
                    &self.config.instance_id,
                    ttl,
                    now,
                )
                .await?;
            if !locked {
                summary.skipped_locked += 1;
                continue;
            }

            let outcome = self.fire(&schedule, now).await;

            // Release after the schedule-row update, not after the run
            if let Err(err) = self
                .store
                .release_schedule_lock(schedule.schedule_id, &self.config.instance_id)
                .await
            {
                warn!(schedule_id = %schedule.schedule_id, "failed to release schedule lock: {err}");
            }

            match outcome {
                Ok(FireOutcome::Triggered) => summary.fired += 1,
                Ok(FireOutcome::Misfired) => summary.misfired += 1,
                Ok(FireOutcome::AtMaxInstances) => summary.skipped_max_instances += 1,
                Err(err) => {
                    warn!(schedule_id = %schedule.schedule_id, "schedule fire failed: {err}");
                }
            }
        }
        Ok(summary)
    }

    /// Start the background tick loop.
    pub fn start(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let tick_interval = self.config.tick_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(instance_id = %scheduler.config.instance_id, "scheduler started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = scheduler.tick().await {
                            warn!("scheduler tick failed: {err}");
                        }
                    }
                }
            }
            info!("scheduler stopped");
        });
    }

    /// Stop the background loop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn fire(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> Result<FireOutcome, CoreError> {
        let due_at = schedule.next_run_at.unwrap_or(now);
        let lateness = (now - due_at).num_seconds().max(0) as u64;

        if lateness > schedule.misfire_grace_seconds {
            // Stale boundary (downtime catch-up): record a misfire and
            // advance to the next future boundary without submitting.
            self.store
                .insert_schedule_run(&ScheduleRun {
                    id: new_run_id(),
                    schedule_id: schedule.schedule_id,
                    scheduled_at: due_at,
                    started_at: now,
                    run_id: None,
                    status: ScheduleRunStatus::Misfired,
                })
                .await?;
            let mut updated = schedule.clone();
            updated.next_run_at = compute::next_run_at(schedule, now)?;
            updated.last_run_status = Some("misfired".to_string());
            updated.updated_at = now;
            self.store.update_schedule(&updated).await?;
            info!(schedule = %schedule.name, %due_at, "schedule misfired");
            return Ok(FireOutcome::Misfired);
        }

        if self.at_max_instances(schedule).await? {
            // Leave next_run_at in place; a later tick fires (or
            // misfires) the boundary once a slot frees.
            return Ok(FireOutcome::AtMaxInstances);
        }

        let mut spec = WorkSpec::new(schedule.target_kind, schedule.target_name.clone())
            .with_params(schedule.params.clone())
            .with_idempotency_key(format!(
                "schedule:{}:{}",
                schedule.schedule_id,
                due_at.timestamp()
            ));
        spec.metadata.insert(
            "schedule_id".to_string(),
            serde_json::Value::String(schedule.schedule_id.to_string()),
        );
        spec.metadata.insert(
            "trigger_source".to_string(),
            serde_json::Value::String("schedule".to_string()),
        );

        let run_id = self.dispatcher.submit(spec).await?;
        self.store
            .insert_schedule_run(&ScheduleRun {
                id: new_run_id(),
                schedule_id: schedule.schedule_id,
                scheduled_at: due_at,
                started_at: now,
                run_id: Some(run_id),
                status: ScheduleRunStatus::Triggered,
            })
            .await?;

        let mut updated = schedule.clone();
        updated.next_run_at = compute::next_run_at(schedule, now)?;
        updated.last_run_at = Some(now);
        updated.last_run_status = Some("running".to_string());
        updated.updated_at = now;
        self.store.update_schedule(&updated).await?;

        info!(schedule = %schedule.name, %run_id, "schedule fired");
        Ok(FireOutcome::Triggered)
    }

    async fn at_max_instances(&self, schedule: &Schedule) -> Result<bool, CoreError> {
        if schedule.max_instances == 0 {
            return Ok(false);
        }
        let mut live = 0u64;
        for status in [RunStatus::Pending, RunStatus::Queued, RunStatus::Running] {
            let filter = RunFilter {
                kind: Some(schedule.target_kind),
                name: Some(schedule.target_name.clone()),
                status: Some(status),
                ..Default::default()
            };
            let page = self
                .store
                .list_runs(&filter, Pagination::new(1, 0))
                .await?;
            live += page.total;
        }
        Ok(live >= schedule.max_instances as u64)
    }
}

enum FireOutcome {
    Triggered,
    Misfired,
    AtMaxInstances,
}
