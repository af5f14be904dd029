//! Run operations

use uuid::Uuid;

use conveyor_core::run::WorkSpec;
use conveyor_storage::{Pagination, RunFilter};

use crate::app::App;
use crate::envelope::{OpResult, Paging};
use crate::requests::{CancelRunRequest, GetRunEventsRequest, ListRunsRequest, SubmitRunRequest};
use crate::responses::{RunAccepted, RunDetail, RunEventView, RunSummary};

/// Submit a typed work item. Idempotent when the request carries an
/// idempotency key.
pub async fn submit_run(app: &App, req: SubmitRunRequest) -> OpResult<RunAccepted> {
    let mut spec = WorkSpec::new(req.kind, req.name)
        .with_params(req.params)
        .with_priority(req.priority)
        .with_max_retries(req.max_retries.unwrap_or(app.config.dlq_max_retries))
        .with_metadata(req.metadata);
    if let Some(lane) = req.lane {
        spec = spec.with_lane(lane);
    }
    if let Some(key) = req.idempotency_key {
        spec = spec.with_idempotency_key(key);
    }
    if let Some(correlation_id) = req.correlation_id {
        spec = spec.with_correlation_id(correlation_id);
    }
    if let Some(batch_id) = req.batch_id {
        spec = spec.with_batch_id(batch_id);
    }
    if let Some(delay) = req.retry_delay_seconds {
        spec = spec.with_retry_delay(delay);
    }

    match app.dispatcher.submit(spec).await {
        Ok(run_id) => match app.dispatcher.get(run_id).await {
            Ok(Some(run)) => OpResult::ok(RunAccepted {
                run_id,
                status: run.status,
            }),
            Ok(None) => OpResult::err("not_found", format!("run not found: {run_id}")),
            Err(err) => err.into(),
        },
        Err(err) => err.into(),
    }
}

pub async fn get_run(app: &App, run_id: Uuid) -> OpResult<RunDetail> {
    match app.dispatcher.get(run_id).await {
        Ok(Some(run)) => OpResult::ok(RunDetail::from(&run)),
        Ok(None) => OpResult::err("not_found", format!("run not found: {run_id}")),
        Err(err) => err.into(),
    }
}

pub async fn list_runs(app: &App, req: ListRunsRequest) -> OpResult<Vec<RunSummary>> {
    let filter = RunFilter {
        kind: req.kind,
        status: req.status,
        name: req.name,
        lane: req.lane,
        correlation_id: req.correlation_id,
        batch_id: req.batch_id,
        since: req.since,
        until: req.until,
    };
    let pagination = Pagination::new(req.limit, req.offset);
    match app.dispatcher.list(&filter, pagination).await {
        Ok(page) => {
            let paging = Paging::from_page(&page, pagination);
            OpResult::ok_paged(page.items.iter().map(RunSummary::from).collect(), paging)
        }
        Err(err) => err.into(),
    }
}

pub async fn get_run_children(app: &App, run_id: Uuid) -> OpResult<Vec<RunSummary>> {
    match app.dispatcher.get_children(run_id).await {
        Ok(children) => OpResult::ok(children.iter().map(RunSummary::from).collect()),
        Err(err) => err.into(),
    }
}

/// Cancel a run. Cancelling an already-terminal run is a successful
/// no-op.
pub async fn cancel_run(app: &App, req: CancelRunRequest) -> OpResult<RunDetail> {
    let reason = req.reason.as_deref().unwrap_or("cancelled by operator");
    match app.dispatcher.cancel(req.run_id, reason).await {
        Ok(run) => OpResult::ok(RunDetail::from(&run)),
        Err(err) => err.into(),
    }
}

/// Retry a terminal run as a new linked run.
pub async fn retry_run(app: &App, run_id: Uuid) -> OpResult<RunAccepted> {
    match app.dispatcher.retry(run_id).await {
        Ok(new_run_id) => match app.dispatcher.get(new_run_id).await {
            Ok(Some(run)) => OpResult::ok(RunAccepted {
                run_id: new_run_id,
                status: run.status,
            }),
            Ok(None) => OpResult::err("not_found", format!("run not found: {new_run_id}")),
            Err(err) => err.into(),
        },
        Err(err) => err.into(),
    }
}

pub async fn get_run_events(
    app: &App,
    req: GetRunEventsRequest,
) -> OpResult<Vec<RunEventView>> {
    match app
        .dispatcher
        .get_events(req.run_id, req.after_event_id, req.limit)
        .await
    {
        Ok(events) => OpResult::ok(
            events
                .into_iter()
                .map(|e| RunEventView {
                    event_id: e.event_id,
                    event_type: e.event_type,
                    timestamp: e.timestamp,
                    data: e.data,
                })
                .collect(),
        ),
        Err(err) => err.into(),
    }
}
