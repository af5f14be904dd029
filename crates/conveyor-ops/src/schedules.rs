//! Schedule operations

use chrono::Utc;
use uuid::Uuid;

use conveyor_core::run::JsonMap;
use conveyor_core::schedule::{Schedule, ScheduleKind, ScheduleRun};
use conveyor_scheduler::compute;
use conveyor_storage::Pagination;

use crate::app::App;
use crate::envelope::{OpResult, Paging};
use crate::requests::{CreateScheduleRequest, UpdateScheduleRequest};
use crate::responses::ScheduleView;

/// Register a schedule. The initial `next_run_at` is computed here so
/// the very next tick can pick it up.
pub async fn create_schedule(app: &App, req: CreateScheduleRequest) -> OpResult<ScheduleView> {
    let now = Utc::now();
    let schedule_type = match (&req.cron_expression, req.interval_seconds, req.run_at) {
        (Some(_), None, None) => ScheduleKind::Cron,
        (None, Some(_), None) => ScheduleKind::Interval,
        (None, None, Some(_)) => ScheduleKind::Date,
        _ => {
            return OpResult::err(
                "validation_failed",
                "exactly one of cron_expression, interval_seconds, run_at is required",
            );
        }
    };

    let mut schedule = Schedule {
        schedule_id: conveyor_core::ids::new_run_id(),
        name: req.name,
        target_kind: req.target_kind,
        target_name: req.target_name,
        schedule_type,
        cron_expression: req.cron_expression,
        interval_seconds: req.interval_seconds,
        run_at: req.run_at,
        timezone: "UTC".to_string(),
        params: req.params,
        enabled: req.enabled,
        max_instances: req.max_instances.unwrap_or(1),
        misfire_grace_seconds: req
            .misfire_grace_seconds
            .unwrap_or(app.config.misfire_grace_seconds),
        next_run_at: None,
        last_run_at: None,
        last_run_status: None,
        created_at: now,
        updated_at: now,
    };

    if let Err(err) = compute::validate(&schedule) {
        return err.into();
    }
    schedule.next_run_at = match compute::next_run_at(&schedule, now) {
        Ok(next) => next,
        Err(err) => return err.into(),
    };

    match app.store.insert_schedule(&schedule).await {
        Ok(()) => OpResult::ok(ScheduleView::from(&schedule)),
        Err(err) => conveyor_core::error::CoreError::from(err).into(),
    }
}

pub async fn get_schedule(app: &App, schedule_id: Uuid) -> OpResult<ScheduleView> {
    match app.store.get_schedule(schedule_id).await {
        Ok(Some(schedule)) => OpResult::ok(ScheduleView::from(&schedule)),
        Ok(None) => OpResult::err("not_found", format!("schedule not found: {schedule_id}")),
        Err(err) => conveyor_core::error::CoreError::from(err).into(),
    }
}

pub async fn list_schedules(
    app: &App,
    limit: u32,
    offset: u32,
) -> OpResult<Vec<ScheduleView>> {
    let pagination = Pagination::new(limit, offset);
    match app.store.list_schedules(pagination).await {
        Ok(page) => {
            let paging = Paging::from_page(&page, pagination);
            OpResult::ok_paged(
                page.items.iter().map(ScheduleView::from).collect(),
                paging,
            )
        }
        Err(err) => conveyor_core::error::CoreError::from(err).into(),
    }
}

/// Update trigger, params, or enablement. Changing the trigger
/// recomputes `next_run_at`.
pub async fn update_schedule(app: &App, req: UpdateScheduleRequest) -> OpResult<ScheduleView> {
    let mut schedule = match app.store.get_schedule(req.schedule_id).await {
        Ok(Some(schedule)) => schedule,
        Ok(None) => {
            return OpResult::err(
                "not_found",
                format!("schedule not found: {}", req.schedule_id),
            );
        }
        Err(err) => return conveyor_core::error::CoreError::from(err).into(),
    };

    let mut trigger_changed = false;
    if let Some(expression) = req.cron_expression {
        schedule.schedule_type = ScheduleKind::Cron;
        schedule.cron_expression = Some(expression);
        schedule.interval_seconds = None;
        schedule.run_at = None;
        trigger_changed = true;
    }
    if let Some(seconds) = req.interval_seconds {
        schedule.schedule_type = ScheduleKind::Interval;
        schedule.interval_seconds = Some(seconds);
        schedule.cron_expression = None;
        schedule.run_at = None;
        trigger_changed = true;
    }
    if let Some(run_at) = req.run_at {
        schedule.schedule_type = ScheduleKind::Date;
        schedule.run_at = Some(run_at);
        schedule.cron_expression = None;
        schedule.interval_seconds = None;
        trigger_changed = true;
    }
    if let Some(enabled) = req.enabled {
        schedule.enabled = enabled;
    }
    if let Some(params) = req.params {
        schedule.params = params;
    }
    if let Some(max_instances) = req.max_instances {
        schedule.max_instances = max_instances;
    }
    if let Some(grace) = req.misfire_grace_seconds {
        schedule.misfire_grace_seconds = grace;
    }
    schedule.updated_at = Utc::now();

    if let Err(err) = compute::validate(&schedule) {
        return err.into();
    }
    if trigger_changed {
        schedule.next_run_at = match compute::next_run_at(&schedule, Utc::now()) {
            Ok(next) => next,
            Err(err) => return err.into(),
        };
    }

    match app.store.update_schedule(&schedule).await {
        Ok(()) => OpResult::ok(ScheduleView::from(&schedule)),
        Err(err) => conveyor_core::error::CoreError::from(err).into(),
    }
}

pub async fn delete_schedule(app: &App, schedule_id: Uuid) -> OpResult<bool> {
    match app.store.delete_schedule(schedule_id).await {
        Ok(deleted) => {
            if deleted {
                OpResult::ok(true)
            } else {
                OpResult::err("not_found", format!("schedule not found: {schedule_id}"))
            }
        }
        Err(err) => conveyor_core::error::CoreError::from(err).into(),
    }
}

pub async fn list_schedule_runs(
    app: &App,
    schedule_id: Uuid,
    limit: u32,
) -> OpResult<Vec<ScheduleRun>> {
    match app.store.list_schedule_runs(schedule_id, limit).await {
        Ok(runs) => OpResult::ok(runs),
        Err(err) => conveyor_core::error::CoreError::from(err).into(),
    }
}

/// Convenience for seeding schedule params at call sites.
pub fn params_from(pairs: &[(&str, serde_json::Value)]) -> JsonMap {
    let mut map = JsonMap::new();
    for (key, value) in pairs {
        map.insert((*key).to_string(), value.clone());
    }
    map
}
