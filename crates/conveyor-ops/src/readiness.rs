//! Watermark, readiness, and backfill operations

use chrono::Utc;
use uuid::Uuid;

use conveyor_core::backfill::BackfillPlan;
use conveyor_core::readiness::{CalcDependency, DataReadiness, ExpectedSchedule};
use conveyor_core::watermark::{Watermark, WatermarkGap};
use conveyor_storage::Pagination;

use crate::app::App;
use crate::envelope::{OpResult, Paging};
use crate::requests::{
    AdvanceWatermarkRequest, CheckDataReadinessRequest, CreateBackfillPlanRequest,
    ListWatermarkGapsRequest,
};
use crate::responses::ReadinessView;

// =========================================================================
// Watermarks
// =========================================================================

/// Forward-only watermark advance. A stale `high_water` returns the
/// stored watermark unchanged.
pub async fn advance_watermark(
    app: &App,
    req: AdvanceWatermarkRequest,
) -> OpResult<Watermark> {
    match app
        .store
        .advance_watermark(
            &req.domain,
            &req.source,
            &req.partition_key,
            &req.high_water,
            req.low_water.as_deref(),
            req.metadata.as_ref(),
            Utc::now(),
        )
        .await
    {
        Ok(watermark) => OpResult::ok(watermark),
        Err(err) => conveyor_core::error::CoreError::from(err).into(),
    }
}

pub async fn get_watermark(
    app: &App,
    domain: &str,
    source: &str,
    partition_key: &str,
) -> OpResult<Watermark> {
    match app.store.get_watermark(domain, source, partition_key).await {
        Ok(Some(watermark)) => OpResult::ok(watermark),
        Ok(None) => OpResult::err(
            "not_found",
            format!("watermark not found: {domain}/{source}/{partition_key}"),
        ),
        Err(err) => conveyor_core::error::CoreError::from(err).into(),
    }
}

pub async fn list_watermarks(app: &App, domain: Option<&str>) -> OpResult<Vec<Watermark>> {
    match app.store.list_watermarks(domain).await {
        Ok(watermarks) => OpResult::ok(watermarks),
        Err(err) => conveyor_core::error::CoreError::from(err).into(),
    }
}

pub async fn delete_watermark(
    app: &App,
    domain: &str,
    source: &str,
    partition_key: &str,
) -> OpResult<bool> {
    match app
        .store
        .delete_watermark(domain, source, partition_key)
        .await
    {
        Ok(deleted) => OpResult::ok(deleted),
        Err(err) => conveyor_core::error::CoreError::from(err).into(),
    }
}

/// One gap per expected partition key with no watermark.
pub async fn list_watermark_gaps(
    app: &App,
    req: ListWatermarkGapsRequest,
) -> OpResult<Vec<WatermarkGap>> {
    let mut gaps = Vec::new();
    for partition_key in &req.expected_partition_keys {
        match app
            .store
            .get_watermark(&req.domain, &req.source, partition_key)
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => gaps.push(WatermarkGap {
                domain: req.domain.clone(),
                source: req.source.clone(),
                partition_key: partition_key.clone(),
            }),
            Err(err) => return conveyor_core::error::CoreError::from(err).into(),
        }
    }
    OpResult::ok(gaps)
}

// =========================================================================
// Readiness
// =========================================================================

/// Certify a domain partition: ready iff every expected stage has a
/// manifest entry. The certification row is upserted for audit.
pub async fn check_data_readiness(
    app: &App,
    req: CheckDataReadinessRequest,
) -> OpResult<ReadinessView> {
    if req.stages.is_empty() {
        return OpResult::err("validation_failed", "stages must not be empty");
    }

    let mut complete = Vec::new();
    let mut missing = Vec::new();
    for stage in &req.stages {
        match app
            .store
            .get_manifest(&req.domain, &req.partition_key, stage)
            .await
        {
            Ok(Some(_)) => complete.push(stage.clone()),
            Ok(None) => missing.push(stage.clone()),
            Err(err) => return conveyor_core::error::CoreError::from(err).into(),
        }
    }

    let now = Utc::now();
    let ready = missing.is_empty();
    let row = DataReadiness {
        id: conveyor_core::ids::new_run_id(),
        domain: req.domain.clone(),
        partition_key: req.partition_key.clone(),
        stage: req.stages.join(","),
        ready,
        certified_at: ready.then_some(now),
        checked_at: now,
        metadata: conveyor_core::run::JsonMap::new(),
    };
    if let Err(err) = app.store.upsert_data_readiness(&row).await {
        return conveyor_core::error::CoreError::from(err).into();
    }

    OpResult::ok(ReadinessView {
        domain: req.domain,
        partition_key: req.partition_key,
        ready,
        complete_stages: complete,
        missing_stages: missing,
        checked_at: now,
    })
}

pub async fn list_data_readiness(
    app: &App,
    domain: Option<&str>,
) -> OpResult<Vec<DataReadiness>> {
    match app.store.list_data_readiness(domain).await {
        Ok(rows) => OpResult::ok(rows),
        Err(err) => conveyor_core::error::CoreError::from(err).into(),
    }
}

pub async fn list_calc_dependencies(
    app: &App,
    calc_name: Option<&str>,
) -> OpResult<Vec<CalcDependency>> {
    match app.store.list_calc_dependencies(calc_name).await {
        Ok(deps) => OpResult::ok(deps),
        Err(err) => conveyor_core::error::CoreError::from(err).into(),
    }
}

pub async fn list_expected_schedules(
    app: &App,
    domain: Option<&str>,
) -> OpResult<Vec<ExpectedSchedule>> {
    match app.store.list_expected_schedules(domain).await {
        Ok(rows) => OpResult::ok(rows),
        Err(err) => conveyor_core::error::CoreError::from(err).into(),
    }
}

// =========================================================================
// Backfill plans
// =========================================================================

pub async fn create_backfill_plan(
    app: &App,
    req: CreateBackfillPlanRequest,
) -> OpResult<BackfillPlan> {
    let range = match (req.range_start, req.range_end) {
        (Some(start), Some(end)) => Some((start, end)),
        _ => None,
    };
    match app
        .backfills
        .create(
            &req.domain,
            &req.source,
            req.partition_keys,
            req.reason,
            range,
            req.metadata,
        )
        .await
    {
        Ok(plan) => OpResult::ok(plan),
        Err(err) => err.into(),
    }
}

pub async fn get_backfill_plan(app: &App, plan_id: Uuid) -> OpResult<BackfillPlan> {
    match app.backfills.get(plan_id).await {
        Ok(Some(plan)) => OpResult::ok(plan),
        Ok(None) => OpResult::err("not_found", format!("backfill plan not found: {plan_id}")),
        Err(err) => err.into(),
    }
}

pub async fn list_backfill_plans(
    app: &App,
    domain: Option<&str>,
    limit: u32,
    offset: u32,
) -> OpResult<Vec<BackfillPlan>> {
    let pagination = Pagination::new(limit, offset);
    match app.backfills.list(domain, pagination).await {
        Ok(page) => {
            let paging = Paging::from_page(&page, pagination);
            OpResult::ok_paged(page.items, paging)
        }
        Err(err) => err.into(),
    }
}

pub async fn start_backfill_plan(app: &App, plan_id: Uuid) -> OpResult<BackfillPlan> {
    match app.backfills.start(plan_id).await {
        Ok(plan) => OpResult::ok(plan),
        Err(err) => err.into(),
    }
}

pub async fn cancel_backfill_plan(app: &App, plan_id: Uuid) -> OpResult<BackfillPlan> {
    match app.backfills.cancel(plan_id).await {
        Ok(plan) => OpResult::ok(plan),
        Err(err) => err.into(),
    }
}
