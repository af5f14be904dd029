//! Lease records for the concurrency guard and the scheduler

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A time-bounded lock held in `core_concurrency_locks`.
///
/// At most one lease per `lock_key` may be unexpired at any time; the
/// backing store's transactional uniqueness enforces this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub lock_key: String,

    /// Owner token, typically a run ID or executor instance ID
    pub owner: String,

    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Per-schedule lease held in `core_schedule_locks`, coordinating
/// competing scheduler instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleLock {
    pub schedule_id: Uuid,
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ScheduleLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
