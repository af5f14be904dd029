//! Lock operations
//!
//! Operator visibility and overrides for concurrency leases and
//! per-schedule locks. Releases here are force-releases; owner-checked
//! release belongs to the owning run.

use uuid::Uuid;

use conveyor_core::lease::{Lease, ScheduleLock};

use crate::app::App;
use crate::envelope::OpResult;

pub async fn list_locks(app: &App) -> OpResult<Vec<Lease>> {
    match app.guard.list().await {
        Ok(leases) => OpResult::ok(leases),
        Err(err) => err.into(),
    }
}

/// Force-release a concurrency lease (e.g. held by a crashed process).
pub async fn release_lock(app: &App, lock_key: &str) -> OpResult<bool> {
    match app.guard.force_release(lock_key).await {
        Ok(released) => {
            if released {
                OpResult::ok(true)
            } else {
                OpResult::err("not_found", format!("lock not held: {lock_key}"))
            }
        }
        Err(err) => err.into(),
    }
}

pub async fn list_schedule_locks(app: &App) -> OpResult<Vec<ScheduleLock>> {
    match app.store.list_schedule_locks().await {
        Ok(locks) => OpResult::ok(locks),
        Err(err) => conveyor_core::error::CoreError::from(err).into(),
    }
}

pub async fn release_schedule_lock(app: &App, schedule_id: Uuid) -> OpResult<bool> {
    match app.store.force_release_schedule_lock(schedule_id).await {
        Ok(released) => {
            if released {
                OpResult::ok(true)
            } else {
                OpResult::err(
                    "not_found",
                    format!("schedule lock not held: {schedule_id}"),
                )
            }
        }
        Err(err) => conveyor_core::error::CoreError::from(err).into(),
    }
}
