//! CoreStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use conveyor_core::anomaly::{Anomaly, Severity};
use conveyor_core::backfill::BackfillPlan;
use conveyor_core::dead_letter::DeadLetter;
use conveyor_core::event::{EventRecord, RunEvent};
use conveyor_core::lease::{Lease, ScheduleLock};
use conveyor_core::quality::QualityRecord;
use conveyor_core::readiness::{
    CalcDependency, DataReadiness, ExpectedSchedule, ManifestEntry, RejectRecord,
};
use conveyor_core::run::{JsonMap, Run, RunKind, RunStatus};
use conveyor_core::schedule::{Schedule, ScheduleRun};
use conveyor_core::watermark::Watermark;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Referenced row does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Uniqueness or state conflict
    #[error("conflict: {0}")]
    Conflict(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

impl From<StoreError> for conveyor_core::error::CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, id } => {
                conveyor_core::error::CoreError::NotFound { kind, id }
            }
            StoreError::Conflict(msg) => conveyor_core::error::CoreError::Conflict(msg),
            StoreError::Database(msg) => conveyor_core::error::CoreError::Storage(msg),
            StoreError::Serialization(msg) => {
                conveyor_core::error::CoreError::SchemaMismatch(msg)
            }
        }
    }
}

/// Pagination parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: u32, offset: u32) -> Self {
        Self { limit, offset }
    }
}

/// One page of results plus the unpaged total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            total: 0,
        }
    }

    /// Whether rows exist beyond this page.
    pub fn has_more(&self, page: &Pagination) -> bool {
        (page.offset as u64 + self.items.len() as u64) < self.total
    }
}

/// Filter for listing runs
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub kind: Option<RunKind>,
    pub status: Option<RunStatus>,
    pub name: Option<String>,
    pub lane: Option<String>,
    pub correlation_id: Option<String>,
    pub batch_id: Option<String>,

    /// Only runs created at or after this instant
    pub since: Option<DateTime<Utc>>,

    /// Only runs created before this instant
    pub until: Option<DateTime<Utc>>,
}

/// Filter for listing dead letters
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    pub name: Option<String>,
    pub replayed: Option<bool>,
}

/// Filter for listing anomalies
#[derive(Debug, Clone, Default)]
pub struct AnomalyFilter {
    pub stage: Option<String>,
    pub category: Option<String>,
    pub partition_key: Option<String>,
    pub min_severity: Option<Severity>,
}

/// Row count for a table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableCount {
    pub table: String,
    pub rows: u64,
}

/// Store health report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreHealth {
    /// Driver name ("memory" or "postgres")
    pub backend: String,

    pub reachable: bool,
    pub tables: Vec<TableCount>,
}

/// Storage interface for the orchestration engine.
///
/// Implementations must be thread-safe and support concurrent access.
/// All mutating operations are atomic at the transaction level; no method
/// holds locks across await points visible to callers.
#[async_trait]
pub trait CoreStore: Send + Sync + 'static {
    // =========================================================================
    // Runs
    // =========================================================================

    /// Insert a new run row. Fails with `Conflict` if the run ID exists.
    async fn insert_run(&self, run: &Run) -> Result<(), StoreError>;

    /// Replace a run row. Fails with `NotFound` if missing.
    async fn update_run(&self, run: &Run) -> Result<(), StoreError>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, StoreError>;

    /// Most recently created run carrying this idempotency key.
    async fn find_run_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Run>, StoreError>;

    async fn list_runs(
        &self,
        filter: &RunFilter,
        page: Pagination,
    ) -> Result<Page<Run>, StoreError>;

    async fn list_child_runs(&self, parent_run_id: Uuid) -> Result<Vec<Run>, StoreError>;

    // =========================================================================
    // Event ledger
    // =========================================================================

    /// Append one event, assigning the next per-run sequence number.
    /// Events are never reordered or mutated.
    async fn append_event(
        &self,
        run_id: Uuid,
        event: &RunEvent,
    ) -> Result<EventRecord, StoreError>;

    /// Events for a run in append order, optionally after a known ID.
    async fn list_events(
        &self,
        run_id: Uuid,
        after_event_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<EventRecord>, StoreError>;

    /// Secondary scan by event type, for diagnostics.
    async fn list_events_by_type(
        &self,
        event_type: &str,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<EventRecord>, StoreError>;

    // =========================================================================
    // Concurrency leases
    // =========================================================================

    /// Try to acquire a lease. Expired leases on the key are reaped in
    /// the same transaction. Returns `false` (without blocking) if an
    /// unexpired lease exists.
    async fn acquire_lease(
        &self,
        lock_key: &str,
        owner: &str,
        ttl_seconds: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Release a lease if held by `owner`. Returns `false` when the key
    /// was not held by this owner (already released or stolen).
    async fn release_lease(&self, lock_key: &str, owner: &str) -> Result<bool, StoreError>;

    async fn list_leases(&self) -> Result<Vec<Lease>, StoreError>;

    /// Operator override: drop the lease regardless of owner.
    async fn force_release_lease(&self, lock_key: &str) -> Result<bool, StoreError>;

    /// Delete all expired leases; returns how many were reaped.
    async fn reap_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    // =========================================================================
    // Schedule locks
    // =========================================================================

    async fn acquire_schedule_lock(
        &self,
        schedule_id: Uuid,
        locked_by: &str,
        ttl_seconds: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn release_schedule_lock(
        &self,
        schedule_id: Uuid,
        locked_by: &str,
    ) -> Result<bool, StoreError>;

    async fn list_schedule_locks(&self) -> Result<Vec<ScheduleLock>, StoreError>;

    async fn force_release_schedule_lock(
        &self,
        schedule_id: Uuid,
    ) -> Result<bool, StoreError>;

    // =========================================================================
    // Dead-letter queue
    // =========================================================================

    async fn insert_dead_letter(&self, entry: &DeadLetter) -> Result<(), StoreError>;

    async fn get_dead_letter(&self, id: Uuid) -> Result<Option<DeadLetter>, StoreError>;

    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
        page: Pagination,
    ) -> Result<Page<DeadLetter>, StoreError>;

    /// Record a replay. The entry is kept for audit; only the replay
    /// fields change.
    async fn mark_dead_letter_replayed(
        &self,
        id: Uuid,
        new_run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Schedules
    // =========================================================================

    async fn insert_schedule(&self, schedule: &Schedule) -> Result<(), StoreError>;

    async fn update_schedule(&self, schedule: &Schedule) -> Result<(), StoreError>;

    async fn delete_schedule(&self, schedule_id: Uuid) -> Result<bool, StoreError>;

    async fn get_schedule(&self, schedule_id: Uuid) -> Result<Option<Schedule>, StoreError>;

    async fn list_schedules(&self, page: Pagination) -> Result<Page<Schedule>, StoreError>;

    /// Enabled schedules with `next_run_at <= now`, ordered by
    /// `next_run_at` ascending.
    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, StoreError>;

    async fn insert_schedule_run(&self, run: &ScheduleRun) -> Result<(), StoreError>;

    async fn list_schedule_runs(
        &self,
        schedule_id: Uuid,
        limit: u32,
    ) -> Result<Vec<ScheduleRun>, StoreError>;

    // =========================================================================
    // Watermarks
    // =========================================================================

    /// Forward-only upsert. A `high_water` at or below the stored value
    /// is a no-op returning the stored watermark unchanged.
    #[allow(clippy::too_many_arguments)]
    async fn advance_watermark(
        &self,
        domain: &str,
        source: &str,
        partition_key: &str,
        high_water: &str,
        low_water: Option<&str>,
        metadata: Option<&JsonMap>,
        now: DateTime<Utc>,
    ) -> Result<Watermark, StoreError>;

    async fn get_watermark(
        &self,
        domain: &str,
        source: &str,
        partition_key: &str,
    ) -> Result<Option<Watermark>, StoreError>;

    async fn list_watermarks(
        &self,
        domain: Option<&str>,
    ) -> Result<Vec<Watermark>, StoreError>;

    async fn delete_watermark(
        &self,
        domain: &str,
        source: &str,
        partition_key: &str,
    ) -> Result<bool, StoreError>;

    // =========================================================================
    // Backfill plans
    // =========================================================================

    async fn insert_backfill_plan(&self, plan: &BackfillPlan) -> Result<(), StoreError>;

    async fn update_backfill_plan(&self, plan: &BackfillPlan) -> Result<(), StoreError>;

    async fn get_backfill_plan(
        &self,
        plan_id: Uuid,
    ) -> Result<Option<BackfillPlan>, StoreError>;

    async fn list_backfill_plans(
        &self,
        domain: Option<&str>,
        page: Pagination,
    ) -> Result<Page<BackfillPlan>, StoreError>;

    // =========================================================================
    // Quality records
    // =========================================================================

    async fn insert_quality_record(&self, record: &QualityRecord) -> Result<(), StoreError>;

    async fn list_quality_records(
        &self,
        run_id: Option<Uuid>,
        page: Pagination,
    ) -> Result<Page<QualityRecord>, StoreError>;

    /// Whether any recorded check for this run has FAIL status.
    async fn run_has_quality_failures(&self, run_id: Uuid) -> Result<bool, StoreError>;

    // =========================================================================
    // Anomalies
    // =========================================================================

    async fn insert_anomaly(&self, anomaly: &Anomaly) -> Result<(), StoreError>;

    /// Mark resolved; returns `false` if unknown or already resolved.
    async fn resolve_anomaly(
        &self,
        anomaly_id: Uuid,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn list_unresolved_anomalies(
        &self,
        filter: &AnomalyFilter,
        limit: u32,
    ) -> Result<Vec<Anomaly>, StoreError>;

    /// Unresolved counts per severity since the given instant.
    async fn count_anomalies_by_severity(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<(Severity, u64)>, StoreError>;

    // =========================================================================
    // Manifest, rejects, readiness
    // =========================================================================

    async fn upsert_manifest(&self, entry: &ManifestEntry) -> Result<(), StoreError>;

    async fn get_manifest(
        &self,
        domain: &str,
        partition_key: &str,
        stage: &str,
    ) -> Result<Option<ManifestEntry>, StoreError>;

    async fn list_manifest(
        &self,
        domain: &str,
        partition_key: Option<&str>,
    ) -> Result<Vec<ManifestEntry>, StoreError>;

    async fn insert_reject(&self, reject: &RejectRecord) -> Result<(), StoreError>;

    async fn list_rejects(
        &self,
        run_id: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<RejectRecord>, StoreError>;

    async fn insert_calc_dependency(&self, dep: &CalcDependency) -> Result<(), StoreError>;

    async fn list_calc_dependencies(
        &self,
        calc_name: Option<&str>,
    ) -> Result<Vec<CalcDependency>, StoreError>;

    async fn upsert_expected_schedule(
        &self,
        expected: &ExpectedSchedule,
    ) -> Result<(), StoreError>;

    async fn list_expected_schedules(
        &self,
        domain: Option<&str>,
    ) -> Result<Vec<ExpectedSchedule>, StoreError>;

    async fn upsert_data_readiness(&self, row: &DataReadiness) -> Result<(), StoreError>;

    async fn list_data_readiness(
        &self,
        domain: Option<&str>,
    ) -> Result<Vec<DataReadiness>, StoreError>;

    // =========================================================================
    // Admin
    // =========================================================================

    /// Create core tables and indexes if missing. Idempotent.
    async fn init_schema(&self) -> Result<(), StoreError>;

    async fn health(&self) -> Result<StoreHealth, StoreError>;

    /// Delete terminal rows older than `cutoff` from the purgeable
    /// tables (or the named subset). Returns per-table deletion counts.
    async fn purge_older_than(
        &self,
        cutoff: DateTime<Utc>,
        tables: Option<&[String]>,
    ) -> Result<Vec<TableCount>, StoreError>;
}
