//! Database administration operations

use chrono::{Duration, Utc};

use conveyor_storage::{StoreHealth, TableCount};

use crate::app::App;
use crate::envelope::OpResult;
use crate::requests::PurgeRequest;

/// Create core tables and indexes. Idempotent.
pub async fn initialize_database(app: &App) -> OpResult<bool> {
    match app.store.init_schema().await {
        Ok(()) => OpResult::ok(true),
        Err(err) => conveyor_core::error::CoreError::from(err).into(),
    }
}

pub async fn check_database_health(app: &App) -> OpResult<StoreHealth> {
    match app.store.health().await {
        Ok(health) => OpResult::ok(health),
        Err(err) => conveyor_core::error::CoreError::from(err).into(),
    }
}

/// Delete terminal rows older than the retention window. Returns
/// per-table deletion counts.
pub async fn purge_old_data(app: &App, req: PurgeRequest) -> OpResult<Vec<TableCount>> {
    if req.older_than_days == 0 {
        return OpResult::err("validation_failed", "older_than_days must be positive");
    }
    let cutoff = Utc::now() - Duration::days(req.older_than_days as i64);
    match app
        .store
        .purge_older_than(cutoff, req.tables.as_deref())
        .await
    {
        Ok(deleted) => OpResult::ok(deleted),
        Err(err) => conveyor_core::error::CoreError::from(err).into(),
    }
}
