//! Quality and anomaly operations

use uuid::Uuid;

use conveyor_core::anomaly::Anomaly;
use conveyor_core::quality::QualityRecord;
use conveyor_storage::{AnomalyFilter, Pagination};

use crate::app::App;
use crate::envelope::{OpResult, Paging};
use crate::requests::{ListAnomaliesRequest, ListQualityResultsRequest};

pub async fn list_quality_results(
    app: &App,
    req: ListQualityResultsRequest,
) -> OpResult<Vec<QualityRecord>> {
    let pagination = Pagination::new(req.limit, req.offset);
    match app.store.list_quality_records(req.run_id, pagination).await {
        Ok(page) => {
            let paging = Paging::from_page(&page, pagination);
            OpResult::ok_paged(page.items, paging)
        }
        Err(err) => conveyor_core::error::CoreError::from(err).into(),
    }
}

pub async fn list_anomalies(app: &App, req: ListAnomaliesRequest) -> OpResult<Vec<Anomaly>> {
    let filter = AnomalyFilter {
        stage: req.stage,
        category: req.category,
        partition_key: req.partition_key,
        min_severity: req.min_severity,
    };
    match app.anomalies.list_unresolved(&filter, req.limit).await {
        Ok(anomalies) => OpResult::ok(anomalies),
        Err(err) => err.into(),
    }
}

pub async fn resolve_anomaly(
    app: &App,
    anomaly_id: Uuid,
    resolution_note: Option<&str>,
) -> OpResult<bool> {
    match app.anomalies.resolve(anomaly_id, resolution_note).await {
        Ok(true) => OpResult::ok(true),
        Ok(false) => OpResult::err(
            "not_found",
            format!("anomaly not found or already resolved: {anomaly_id}"),
        ),
        Err(err) => err.into(),
    }
}
