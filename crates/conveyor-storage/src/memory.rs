//! In-memory implementation of CoreStore
//!
//! The embedded driver: used by tests and as the fallback backend when no
//! database server is reachable. Provides the same semantics as the
//! PostgreSQL implementation, including lease reaping and watermark
//! monotonicity.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use conveyor_core::anomaly::{Anomaly, Severity};
use conveyor_core::backfill::BackfillPlan;
use conveyor_core::dead_letter::DeadLetter;
use conveyor_core::event::{EventRecord, RunEvent};
use conveyor_core::lease::{Lease, ScheduleLock};
use conveyor_core::quality::{QualityRecord, QualityStatus};
use conveyor_core::readiness::{
    CalcDependency, DataReadiness, ExpectedSchedule, ManifestEntry, RejectRecord,
};
use conveyor_core::run::{JsonMap, Run, RunStatus};
use conveyor_core::schedule::{Schedule, ScheduleRun};
use conveyor_core::watermark::Watermark;

use crate::store::*;

/// All purgeable tables, in purge order.
const PURGEABLE_TABLES: &[&str] = &[
    "core_executions",
    "core_execution_events",
    "core_quality",
    "core_anomalies",
    "core_rejects",
    "core_dead_letters",
    "core_schedule_runs",
];

/// In-memory CoreStore.
#[derive(Default)]
pub struct InMemoryStore {
    runs: RwLock<HashMap<Uuid, Run>>,
    events: RwLock<HashMap<Uuid, Vec<EventRecord>>>,
    leases: RwLock<HashMap<String, Lease>>,
    schedule_locks: RwLock<HashMap<Uuid, ScheduleLock>>,
    dead_letters: RwLock<HashMap<Uuid, DeadLetter>>,
    schedules: RwLock<HashMap<Uuid, Schedule>>,
    schedule_runs: RwLock<Vec<ScheduleRun>>,
    watermarks: RwLock<HashMap<(String, String, String), Watermark>>,
    backfill_plans: RwLock<HashMap<Uuid, BackfillPlan>>,
    quality: RwLock<Vec<QualityRecord>>,
    anomalies: RwLock<HashMap<Uuid, Anomaly>>,
    manifest: RwLock<HashMap<(String, String, String), ManifestEntry>>,
    rejects: RwLock<Vec<RejectRecord>>,
    calc_dependencies: RwLock<Vec<CalcDependency>>,
    expected_schedules: RwLock<Vec<ExpectedSchedule>>,
    data_readiness: RwLock<HashMap<(String, String, String), DataReadiness>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of run rows (for tests).
    pub fn run_count(&self) -> usize {
        self.runs.read().len()
    }

    /// Clear all data (for tests).
    pub fn clear(&self) {
        self.runs.write().clear();
        self.events.write().clear();
        self.leases.write().clear();
        self.schedule_locks.write().clear();
        self.dead_letters.write().clear();
        self.schedules.write().clear();
        self.schedule_runs.write().clear();
        self.watermarks.write().clear();
        self.backfill_plans.write().clear();
        self.quality.write().clear();
        self.anomalies.write().clear();
        self.manifest.write().clear();
        self.rejects.write().clear();
        self.calc_dependencies.write().clear();
        self.expected_schedules.write().clear();
        self.data_readiness.write().clear();
    }

    fn matches_run(filter: &RunFilter, run: &Run) -> bool {
        if let Some(kind) = filter.kind {
            if run.kind != kind {
                return false;
            }
        }
        if let Some(status) = filter.status {
            if run.status != status {
                return false;
            }
        }
        if let Some(name) = &filter.name {
            if &run.name != name {
                return false;
            }
        }
        if let Some(lane) = &filter.lane {
            if &run.lane != lane {
                return false;
            }
        }
        if let Some(correlation_id) = &filter.correlation_id {
            if run.correlation_id.as_ref() != Some(correlation_id) {
                return false;
            }
        }
        if let Some(batch_id) = &filter.batch_id {
            if run.batch_id.as_ref() != Some(batch_id) {
                return false;
            }
        }
        if let Some(since) = filter.since {
            if run.created_at < since {
                return false;
            }
        }
        if let Some(until) = filter.until {
            if run.created_at >= until {
                return false;
            }
        }
        true
    }

    fn paginate<T>(mut items: Vec<T>, page: Pagination) -> Page<T> {
        let total = items.len() as u64;
        let start = (page.offset as usize).min(items.len());
        let end = (start + page.limit as usize).min(items.len());
        items.truncate(end);
        let items = items.split_off(start);
        Page { items, total }
    }
}

#[async_trait]
impl CoreStore for InMemoryStore {
    // =========================================================================
    // Runs
    // =========================================================================

    async fn insert_run(&self, run: &Run) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        if runs.contains_key(&run.run_id) {
            return Err(StoreError::Conflict(format!(
                "run {} already exists",
                run.run_id
            )));
        }
        if let Some(key) = &run.idempotency_key {
            // Same uniqueness the partial index enforces in postgres:
            // one live-or-completed run per key.
            let live_duplicate = runs.values().any(|r| {
                r.idempotency_key.as_ref() == Some(key)
                    && matches!(
                        r.status,
                        RunStatus::Pending
                            | RunStatus::Queued
                            | RunStatus::Running
                            | RunStatus::Completed
                    )
            });
            if live_duplicate {
                return Err(StoreError::Conflict(format!(
                    "idempotency key already active: {key}"
                )));
            }
        }
        runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn update_run(&self, run: &Run) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        if !runs.contains_key(&run.run_id) {
            return Err(StoreError::not_found("run", run.run_id));
        }
        runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, StoreError> {
        Ok(self.runs.read().get(&run_id).cloned())
    }

    async fn find_run_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Run>, StoreError> {
        let runs = self.runs.read();
        let mut matches: Vec<&Run> = runs
            .values()
            .filter(|r| r.idempotency_key.as_deref() == Some(key))
            .collect();
        matches.sort_by_key(|r| (r.created_at, r.run_id));
        Ok(matches.last().map(|r| (*r).clone()))
    }

    async fn list_runs(
        &self,
        filter: &RunFilter,
        page: Pagination,
    ) -> Result<Page<Run>, StoreError> {
        let runs = self.runs.read();
        let mut matched: Vec<Run> = runs
            .values()
            .filter(|r| Self::matches_run(filter, r))
            .cloned()
            .collect();
        // Newest first, matching the postgres ORDER BY
        matched.sort_by(|a, b| (b.created_at, b.run_id).cmp(&(a.created_at, a.run_id)));
        Ok(Self::paginate(matched, page))
    }

    async fn list_child_runs(&self, parent_run_id: Uuid) -> Result<Vec<Run>, StoreError> {
        let runs = self.runs.read();
        let mut children: Vec<Run> = runs
            .values()
            .filter(|r| r.parent_run_id == Some(parent_run_id))
            .cloned()
            .collect();
        children.sort_by_key(|r| (r.created_at, r.run_id));
        Ok(children)
    }

    // =========================================================================
    // Event ledger
    // =========================================================================

    async fn append_event(
        &self,
        run_id: Uuid,
        event: &RunEvent,
    ) -> Result<EventRecord, StoreError> {
        let data = serde_json::to_value(event)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut events = self.events.write();
        let log = events.entry(run_id).or_default();
        let record = EventRecord {
            event_id: log.len() as i64 + 1,
            run_id,
            event_type: event.event_type().to_string(),
            data,
            timestamp: Utc::now(),
        };
        log.push(record.clone());
        Ok(record)
    }

    async fn list_events(
        &self,
        run_id: Uuid,
        after_event_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let events = self.events.read();
        let after = after_event_id.unwrap_or(0);
        Ok(events
            .get(&run_id)
            .map(|log| {
                log.iter()
                    .filter(|e| e.event_id > after)
                    .take(limit as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_events_by_type(
        &self,
        event_type: &str,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let events = self.events.read();
        let mut matched: Vec<EventRecord> = events
            .values()
            .flatten()
            .filter(|e| e.event_type == event_type && e.timestamp >= since)
            .cloned()
            .collect();
        matched.sort_by_key(|e| (e.timestamp, e.run_id, e.event_id));
        matched.truncate(limit as usize);
        Ok(matched)
    }

    // =========================================================================
    // Concurrency leases
    // =========================================================================

    async fn acquire_lease(
        &self,
        lock_key: &str,
        owner: &str,
        ttl_seconds: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut leases = self.leases.write();
        if let Some(existing) = leases.get(lock_key) {
            if !existing.is_expired(now) {
                return Ok(false);
            }
            // Reap the stale lease as part of the acquire
            leases.remove(lock_key);
        }
        leases.insert(
            lock_key.to_string(),
            Lease {
                lock_key: lock_key.to_string(),
                owner: owner.to_string(),
                acquired_at: now,
                expires_at: now + Duration::seconds(ttl_seconds as i64),
            },
        );
        Ok(true)
    }

    async fn release_lease(&self, lock_key: &str, owner: &str) -> Result<bool, StoreError> {
        let mut leases = self.leases.write();
        match leases.get(lock_key) {
            Some(lease) if lease.owner == owner => {
                leases.remove(lock_key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_leases(&self) -> Result<Vec<Lease>, StoreError> {
        let mut leases: Vec<Lease> = self.leases.read().values().cloned().collect();
        leases.sort_by(|a, b| a.lock_key.cmp(&b.lock_key));
        Ok(leases)
    }

    async fn force_release_lease(&self, lock_key: &str) -> Result<bool, StoreError> {
        Ok(self.leases.write().remove(lock_key).is_some())
    }

    async fn reap_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut leases = self.leases.write();
        let before = leases.len();
        leases.retain(|_, lease| !lease.is_expired(now));
        Ok((before - leases.len()) as u64)
    }

    // =========================================================================
    // Schedule locks
    // =========================================================================

    async fn acquire_schedule_lock(
        &self,
        schedule_id: Uuid,
        locked_by: &str,
        ttl_seconds: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut locks = self.schedule_locks.write();
        if let Some(existing) = locks.get(&schedule_id) {
            if !existing.is_expired(now) {
                return Ok(false);
            }
            locks.remove(&schedule_id);
        }
        locks.insert(
            schedule_id,
            ScheduleLock {
                schedule_id,
                locked_by: locked_by.to_string(),
                locked_at: now,
                expires_at: now + Duration::seconds(ttl_seconds as i64),
            },
        );
        Ok(true)
    }

    async fn release_schedule_lock(
        &self,
        schedule_id: Uuid,
        locked_by: &str,
    ) -> Result<bool, StoreError> {
        let mut locks = self.schedule_locks.write();
        match locks.get(&schedule_id) {
            Some(lock) if lock.locked_by == locked_by => {
                locks.remove(&schedule_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_schedule_locks(&self) -> Result<Vec<ScheduleLock>, StoreError> {
        let mut locks: Vec<ScheduleLock> =
            self.schedule_locks.read().values().cloned().collect();
        locks.sort_by_key(|l| l.schedule_id);
        Ok(locks)
    }

    async fn force_release_schedule_lock(
        &self,
        schedule_id: Uuid,
    ) -> Result<bool, StoreError> {
        Ok(self.schedule_locks.write().remove(&schedule_id).is_some())
    }

    // =========================================================================
    // Dead-letter queue
    // =========================================================================

    async fn insert_dead_letter(&self, entry: &DeadLetter) -> Result<(), StoreError> {
        self.dead_letters.write().insert(entry.id, entry.clone());
        Ok(())
    }

    async fn get_dead_letter(&self, id: Uuid) -> Result<Option<DeadLetter>, StoreError> {
        Ok(self.dead_letters.read().get(&id).cloned())
    }

    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
        page: Pagination,
    ) -> Result<Page<DeadLetter>, StoreError> {
        let entries = self.dead_letters.read();
        let mut matched: Vec<DeadLetter> = entries
            .values()
            .filter(|e| {
                filter.name.as_ref().is_none_or(|n| &e.name == n)
                    && filter.replayed.is_none_or(|r| e.is_replayed() == r)
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(Self::paginate(matched, page))
    }

    async fn mark_dead_letter_replayed(
        &self,
        id: Uuid,
        new_run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut entries = self.dead_letters.write();
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("dead_letter", id))?;
        entry.replayed_as_run_id = Some(new_run_id);
        entry.replayed_at = Some(now);
        Ok(())
    }

    // =========================================================================
    // Schedules
    // =========================================================================

    async fn insert_schedule(&self, schedule: &Schedule) -> Result<(), StoreError> {
        let mut schedules = self.schedules.write();
        if schedules.contains_key(&schedule.schedule_id) {
            return Err(StoreError::Conflict(format!(
                "schedule {} already exists",
                schedule.schedule_id
            )));
        }
        schedules.insert(schedule.schedule_id, schedule.clone());
        Ok(())
    }

    async fn update_schedule(&self, schedule: &Schedule) -> Result<(), StoreError> {
        let mut schedules = self.schedules.write();
        if !schedules.contains_key(&schedule.schedule_id) {
            return Err(StoreError::not_found("schedule", schedule.schedule_id));
        }
        schedules.insert(schedule.schedule_id, schedule.clone());
        Ok(())
    }

    async fn delete_schedule(&self, schedule_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.schedules.write().remove(&schedule_id).is_some())
    }

    async fn get_schedule(
        &self,
        schedule_id: Uuid,
    ) -> Result<Option<Schedule>, StoreError> {
        Ok(self.schedules.read().get(&schedule_id).cloned())
    }

    async fn list_schedules(&self, page: Pagination) -> Result<Page<Schedule>, StoreError> {
        let mut all: Vec<Schedule> = self.schedules.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self::paginate(all, page))
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, StoreError> {
        let mut due: Vec<Schedule> = self
            .schedules
            .read()
            .values()
            .filter(|s| s.enabled && s.next_run_at.is_some_and(|t| t <= now))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_run_at);
        Ok(due)
    }

    async fn insert_schedule_run(&self, run: &ScheduleRun) -> Result<(), StoreError> {
        self.schedule_runs.write().push(run.clone());
        Ok(())
    }

    async fn list_schedule_runs(
        &self,
        schedule_id: Uuid,
        limit: u32,
    ) -> Result<Vec<ScheduleRun>, StoreError> {
        let runs = self.schedule_runs.read();
        let mut matched: Vec<ScheduleRun> = runs
            .iter()
            .filter(|r| r.schedule_id == schedule_id)
            .cloned()
            .collect();
        matched.sort_by(|a, b| (b.started_at, b.id).cmp(&(a.started_at, a.id)));
        matched.truncate(limit as usize);
        Ok(matched)
    }

    // =========================================================================
    // Watermarks
    // =========================================================================

    async fn advance_watermark(
        &self,
        domain: &str,
        source: &str,
        partition_key: &str,
        high_water: &str,
        low_water: Option<&str>,
        metadata: Option<&JsonMap>,
        now: DateTime<Utc>,
    ) -> Result<Watermark, StoreError> {
        let key = (
            domain.to_string(),
            source.to_string(),
            partition_key.to_string(),
        );
        let mut watermarks = self.watermarks.write();
        let result = match watermarks.get(&key) {
            Some(existing) => existing.advanced(high_water, low_water, metadata, now),
            None => Watermark {
                domain: domain.to_string(),
                source: source.to_string(),
                partition_key: partition_key.to_string(),
                high_water: high_water.to_string(),
                low_water: low_water.map(str::to_string),
                metadata: metadata.cloned().unwrap_or_default(),
                updated_at: now,
            },
        };
        watermarks.insert(key, result.clone());
        Ok(result)
    }

    async fn get_watermark(
        &self,
        domain: &str,
        source: &str,
        partition_key: &str,
    ) -> Result<Option<Watermark>, StoreError> {
        let key = (
            domain.to_string(),
            source.to_string(),
            partition_key.to_string(),
        );
        Ok(self.watermarks.read().get(&key).cloned())
    }

    async fn list_watermarks(
        &self,
        domain: Option<&str>,
    ) -> Result<Vec<Watermark>, StoreError> {
        let mut marks: Vec<Watermark> = self
            .watermarks
            .read()
            .values()
            .filter(|w| domain.is_none_or(|d| w.domain == d))
            .cloned()
            .collect();
        marks.sort_by(|a, b| {
            (&a.domain, &a.source, &a.partition_key)
                .cmp(&(&b.domain, &b.source, &b.partition_key))
        });
        Ok(marks)
    }

    async fn delete_watermark(
        &self,
        domain: &str,
        source: &str,
        partition_key: &str,
    ) -> Result<bool, StoreError> {
        let key = (
            domain.to_string(),
            source.to_string(),
            partition_key.to_string(),
        );
        Ok(self.watermarks.write().remove(&key).is_some())
    }

    // =========================================================================
    // Backfill plans
    // =========================================================================

    async fn insert_backfill_plan(&self, plan: &BackfillPlan) -> Result<(), StoreError> {
        self.backfill_plans.write().insert(plan.plan_id, plan.clone());
        Ok(())
    }

    async fn update_backfill_plan(&self, plan: &BackfillPlan) -> Result<(), StoreError> {
        let mut plans = self.backfill_plans.write();
        if !plans.contains_key(&plan.plan_id) {
            return Err(StoreError::not_found("backfill_plan", plan.plan_id));
        }
        plans.insert(plan.plan_id, plan.clone());
        Ok(())
    }

    async fn get_backfill_plan(
        &self,
        plan_id: Uuid,
    ) -> Result<Option<BackfillPlan>, StoreError> {
        Ok(self.backfill_plans.read().get(&plan_id).cloned())
    }

    async fn list_backfill_plans(
        &self,
        domain: Option<&str>,
        page: Pagination,
    ) -> Result<Page<BackfillPlan>, StoreError> {
        let mut plans: Vec<BackfillPlan> = self
            .backfill_plans
            .read()
            .values()
            .filter(|p| domain.is_none_or(|d| p.domain == d))
            .cloned()
            .collect();
        plans.sort_by(|a, b| (b.created_at, b.plan_id).cmp(&(a.created_at, a.plan_id)));
        Ok(Self::paginate(plans, page))
    }

    // =========================================================================
    // Quality records
    // =========================================================================

    async fn insert_quality_record(
        &self,
        record: &QualityRecord,
    ) -> Result<(), StoreError> {
        self.quality.write().push(record.clone());
        Ok(())
    }

    async fn list_quality_records(
        &self,
        run_id: Option<Uuid>,
        page: Pagination,
    ) -> Result<Page<QualityRecord>, StoreError> {
        let records = self.quality.read();
        let mut matched: Vec<QualityRecord> = records
            .iter()
            .filter(|r| run_id.is_none_or(|id| r.run_id == id))
            .cloned()
            .collect();
        matched.sort_by(|a, b| (b.recorded_at, b.id).cmp(&(a.recorded_at, a.id)));
        Ok(Self::paginate(matched, page))
    }

    async fn run_has_quality_failures(&self, run_id: Uuid) -> Result<bool, StoreError> {
        Ok(self
            .quality
            .read()
            .iter()
            .any(|r| r.run_id == run_id && r.status == QualityStatus::Fail))
    }

    // =========================================================================
    // Anomalies
    // =========================================================================

    async fn insert_anomaly(&self, anomaly: &Anomaly) -> Result<(), StoreError> {
        self.anomalies.write().insert(anomaly.anomaly_id, anomaly.clone());
        Ok(())
    }

    async fn resolve_anomaly(
        &self,
        anomaly_id: Uuid,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut anomalies = self.anomalies.write();
        match anomalies.get_mut(&anomaly_id) {
            Some(anomaly) if !anomaly.is_resolved() => {
                anomaly.resolved_at = Some(now);
                anomaly.resolution_note = note.map(str::to_string);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_unresolved_anomalies(
        &self,
        filter: &AnomalyFilter,
        limit: u32,
    ) -> Result<Vec<Anomaly>, StoreError> {
        let anomalies = self.anomalies.read();
        let mut matched: Vec<Anomaly> = anomalies
            .values()
            .filter(|a| {
                !a.is_resolved()
                    && filter.stage.as_ref().is_none_or(|s| &a.stage == s)
                    && filter.category.as_ref().is_none_or(|c| &a.category == c)
                    && filter
                        .partition_key
                        .as_ref()
                        .is_none_or(|p| a.partition_key.as_ref() == Some(p))
                    && filter.min_severity.is_none_or(|min| a.severity >= min)
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| (b.detected_at, b.anomaly_id).cmp(&(a.detected_at, a.anomaly_id)));
        matched.truncate(limit as usize);
        Ok(matched)
    }

    async fn count_anomalies_by_severity(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<(Severity, u64)>, StoreError> {
        let anomalies = self.anomalies.read();
        let mut counts: std::collections::BTreeMap<Severity, u64> =
            std::collections::BTreeMap::new();
        for anomaly in anomalies.values() {
            if !anomaly.is_resolved() && anomaly.detected_at >= since {
                *counts.entry(anomaly.severity).or_default() += 1;
            }
        }
        Ok(counts.into_iter().collect())
    }

    // =========================================================================
    // Manifest, rejects, readiness
    // =========================================================================

    async fn upsert_manifest(&self, entry: &ManifestEntry) -> Result<(), StoreError> {
        let key = (
            entry.domain.clone(),
            entry.partition_key.clone(),
            entry.stage.clone(),
        );
        self.manifest.write().insert(key, entry.clone());
        Ok(())
    }

    async fn get_manifest(
        &self,
        domain: &str,
        partition_key: &str,
        stage: &str,
    ) -> Result<Option<ManifestEntry>, StoreError> {
        let key = (
            domain.to_string(),
            partition_key.to_string(),
            stage.to_string(),
        );
        Ok(self.manifest.read().get(&key).cloned())
    }

    async fn list_manifest(
        &self,
        domain: &str,
        partition_key: Option<&str>,
    ) -> Result<Vec<ManifestEntry>, StoreError> {
        let mut entries: Vec<ManifestEntry> = self
            .manifest
            .read()
            .values()
            .filter(|m| {
                m.domain == domain && partition_key.is_none_or(|p| m.partition_key == p)
            })
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            (&a.partition_key, &a.stage).cmp(&(&b.partition_key, &b.stage))
        });
        Ok(entries)
    }

    async fn insert_reject(&self, reject: &RejectRecord) -> Result<(), StoreError> {
        self.rejects.write().push(reject.clone());
        Ok(())
    }

    async fn list_rejects(
        &self,
        run_id: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<RejectRecord>, StoreError> {
        let rejects = self.rejects.read();
        let mut matched: Vec<RejectRecord> = rejects
            .iter()
            .filter(|r| run_id.is_none_or(|id| r.run_id == Some(id)))
            .cloned()
            .collect();
        matched.sort_by(|a, b| (b.rejected_at, b.id).cmp(&(a.rejected_at, a.id)));
        matched.truncate(limit as usize);
        Ok(matched)
    }

    async fn insert_calc_dependency(&self, dep: &CalcDependency) -> Result<(), StoreError> {
        self.calc_dependencies.write().push(dep.clone());
        Ok(())
    }

    async fn list_calc_dependencies(
        &self,
        calc_name: Option<&str>,
    ) -> Result<Vec<CalcDependency>, StoreError> {
        let deps = self.calc_dependencies.read();
        let mut matched: Vec<CalcDependency> = deps
            .iter()
            .filter(|d| calc_name.is_none_or(|n| d.calc_name == n))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.calc_name.cmp(&b.calc_name));
        Ok(matched)
    }

    async fn upsert_expected_schedule(
        &self,
        expected: &ExpectedSchedule,
    ) -> Result<(), StoreError> {
        let mut rows = self.expected_schedules.write();
        match rows
            .iter_mut()
            .find(|r| r.domain == expected.domain && r.workflow == expected.workflow)
        {
            Some(row) => *row = expected.clone(),
            None => rows.push(expected.clone()),
        }
        Ok(())
    }

    async fn list_expected_schedules(
        &self,
        domain: Option<&str>,
    ) -> Result<Vec<ExpectedSchedule>, StoreError> {
        let rows = self.expected_schedules.read();
        let mut matched: Vec<ExpectedSchedule> = rows
            .iter()
            .filter(|r| domain.is_none_or(|d| r.domain == d))
            .cloned()
            .collect();
        matched.sort_by(|a, b| (&a.domain, &a.workflow).cmp(&(&b.domain, &b.workflow)));
        Ok(matched)
    }

    async fn upsert_data_readiness(&self, row: &DataReadiness) -> Result<(), StoreError> {
        let key = (
            row.domain.clone(),
            row.partition_key.clone(),
            row.stage.clone(),
        );
        self.data_readiness.write().insert(key, row.clone());
        Ok(())
    }

    async fn list_data_readiness(
        &self,
        domain: Option<&str>,
    ) -> Result<Vec<DataReadiness>, StoreError> {
        let mut rows: Vec<DataReadiness> = self
            .data_readiness
            .read()
            .values()
            .filter(|r| domain.is_none_or(|d| r.domain == d))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (&a.domain, &a.partition_key, &a.stage)
                .cmp(&(&b.domain, &b.partition_key, &b.stage))
        });
        Ok(rows)
    }

    // =========================================================================
    // Admin
    // =========================================================================

    async fn init_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn health(&self) -> Result<StoreHealth, StoreError> {
        let tables = vec![
            TableCount {
                table: "core_executions".to_string(),
                rows: self.runs.read().len() as u64,
            },
            TableCount {
                table: "core_execution_events".to_string(),
                rows: self.events.read().values().map(Vec::len).sum::<usize>() as u64,
            },
            TableCount {
                table: "core_concurrency_locks".to_string(),
                rows: self.leases.read().len() as u64,
            },
            TableCount {
                table: "core_schedule_locks".to_string(),
                rows: self.schedule_locks.read().len() as u64,
            },
            TableCount {
                table: "core_dead_letters".to_string(),
                rows: self.dead_letters.read().len() as u64,
            },
            TableCount {
                table: "core_schedules".to_string(),
                rows: self.schedules.read().len() as u64,
            },
            TableCount {
                table: "core_schedule_runs".to_string(),
                rows: self.schedule_runs.read().len() as u64,
            },
            TableCount {
                table: "core_watermarks".to_string(),
                rows: self.watermarks.read().len() as u64,
            },
            TableCount {
                table: "core_backfill_plans".to_string(),
                rows: self.backfill_plans.read().len() as u64,
            },
            TableCount {
                table: "core_quality".to_string(),
                rows: self.quality.read().len() as u64,
            },
            TableCount {
                table: "core_anomalies".to_string(),
                rows: self.anomalies.read().len() as u64,
            },
            TableCount {
                table: "core_manifest".to_string(),
                rows: self.manifest.read().len() as u64,
            },
            TableCount {
                table: "core_rejects".to_string(),
                rows: self.rejects.read().len() as u64,
            },
        ];
        Ok(StoreHealth {
            backend: "memory".to_string(),
            reachable: true,
            tables,
        })
    }

    async fn purge_older_than(
        &self,
        cutoff: DateTime<Utc>,
        tables: Option<&[String]>,
    ) -> Result<Vec<TableCount>, StoreError> {
        let selected: Vec<&str> = match tables {
            Some(names) => names.iter().map(String::as_str).collect(),
            None => PURGEABLE_TABLES.to_vec(),
        };
        let mut deleted = Vec::new();

        for table in selected {
            let count = match table {
                "core_executions" => {
                    let mut runs = self.runs.write();
                    let mut events = self.events.write();
                    let doomed: Vec<Uuid> = runs
                        .values()
                        .filter(|r| {
                            r.status.is_terminal()
                                && r.finished_at.is_some_and(|t| t < cutoff)
                        })
                        .map(|r| r.run_id)
                        .collect();
                    for run_id in &doomed {
                        runs.remove(run_id);
                        events.remove(run_id);
                    }
                    doomed.len() as u64
                }
                "core_execution_events" => {
                    // Handled with their runs; standalone purge drops
                    // orphaned logs only.
                    let runs = self.runs.read();
                    let mut events = self.events.write();
                    let before: usize = events.values().map(Vec::len).sum();
                    events.retain(|run_id, _| runs.contains_key(run_id));
                    let after: usize = events.values().map(Vec::len).sum();
                    (before - after) as u64
                }
                "core_quality" => {
                    let mut quality = self.quality.write();
                    let before = quality.len();
                    quality.retain(|r| r.recorded_at >= cutoff);
                    (before - quality.len()) as u64
                }
                "core_anomalies" => {
                    let mut anomalies = self.anomalies.write();
                    let before = anomalies.len();
                    anomalies.retain(|_, a| !a.is_resolved() || a.detected_at >= cutoff);
                    (before - anomalies.len()) as u64
                }
                "core_rejects" => {
                    let mut rejects = self.rejects.write();
                    let before = rejects.len();
                    rejects.retain(|r| r.rejected_at >= cutoff);
                    (before - rejects.len()) as u64
                }
                "core_dead_letters" => {
                    let mut entries = self.dead_letters.write();
                    let before = entries.len();
                    entries.retain(|_, e| !e.is_replayed() || e.created_at >= cutoff);
                    (before - entries.len()) as u64
                }
                "core_schedule_runs" => {
                    let mut runs = self.schedule_runs.write();
                    let before = runs.len();
                    runs.retain(|r| r.started_at >= cutoff);
                    (before - runs.len()) as u64
                }
                other => {
                    return Err(StoreError::Conflict(format!(
                        "table not purgeable: {other}"
                    )));
                }
            };
            deleted.push(TableCount {
                table: table.to_string(),
                rows: count,
            });
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::error::ErrorCategory;
    use conveyor_core::run::{Priority, RunKind};

    fn make_run(status: RunStatus, key: Option<&str>) -> Run {
        let now = Utc::now();
        Run {
            run_id: Uuid::now_v7(),
            kind: RunKind::Task,
            name: "test.task".to_string(),
            params: JsonMap::new(),
            status,
            lane: "default".to_string(),
            priority: Priority::Normal,
            parent_run_id: None,
            correlation_id: None,
            batch_id: None,
            idempotency_key: key.map(str::to_string),
            retry_of_run_id: None,
            attempt: 1,
            max_retries: 0,
            retry_delay_seconds: 30,
            created_at: now,
            started_at: None,
            finished_at: if status.is_terminal() { Some(now) } else { None },
            result: None,
            error: None,
            metadata: JsonMap::new(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_run() {
        let store = InMemoryStore::new();
        let run = make_run(RunStatus::Pending, None);
        store.insert_run(&run).await.unwrap();

        let loaded = store.get_run(run.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "test.task");

        // Duplicate insert conflicts
        assert!(matches!(
            store.insert_run(&run).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_idempotency_uniqueness_among_live_runs() {
        let store = InMemoryStore::new();
        store
            .insert_run(&make_run(RunStatus::Running, Some("k1")))
            .await
            .unwrap();

        // A second live run with the same key is rejected
        let err = store
            .insert_run(&make_run(RunStatus::Pending, Some("k1")))
            .await;
        assert!(matches!(err, Err(StoreError::Conflict(_))));

        // A failed run with the same key does not block a new one
        store
            .insert_run(&make_run(RunStatus::Failed, Some("k2")))
            .await
            .unwrap();
        store
            .insert_run(&make_run(RunStatus::Pending, Some("k2")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_event_ids_monotone_per_run() {
        let store = InMemoryStore::new();
        let run_id = Uuid::now_v7();

        let e1 = store
            .append_event(run_id, &RunEvent::Created { kind: "task".into(), name: "t".into() })
            .await
            .unwrap();
        let e2 = store
            .append_event(run_id, &RunEvent::Queued { lane: "default".into() })
            .await
            .unwrap();
        let e3 = store
            .append_event(run_id, &RunEvent::Started { attempt: 1 })
            .await
            .unwrap();

        assert_eq!((e1.event_id, e2.event_id, e3.event_id), (1, 2, 3));

        let events = store.list_events(run_id, None, 100).await.unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.windows(2).all(|w| w[0].event_id < w[1].event_id));

        let tail = store.list_events(run_id, Some(1), 100).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].event_id, 2);
    }

    #[tokio::test]
    async fn test_lease_mutual_exclusion() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        assert!(store
            .acquire_lease("pipeline:otc.ingest", "exec-A", 1800, now)
            .await
            .unwrap());
        assert!(!store
            .acquire_lease("pipeline:otc.ingest", "exec-B", 1800, now)
            .await
            .unwrap());

        // Wrong owner cannot release
        assert!(!store
            .release_lease("pipeline:otc.ingest", "exec-B")
            .await
            .unwrap());
        assert!(store
            .release_lease("pipeline:otc.ingest", "exec-A")
            .await
            .unwrap());
        assert!(store
            .acquire_lease("pipeline:otc.ingest", "exec-B", 1800, now)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_reaped_on_acquire() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        assert!(store.acquire_lease("k", "old", 60, now).await.unwrap());

        let later = now + Duration::seconds(61);
        assert!(store.acquire_lease("k", "new", 60, later).await.unwrap());

        let leases = store.list_leases().await.unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].owner, "new");
    }

    #[tokio::test]
    async fn test_watermark_monotonic_advance() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        let wm = store
            .advance_watermark(
                "equity", "polygon", "AAPL", "2026-02-15T00:00:00Z", None, None, now,
            )
            .await
            .unwrap();
        assert_eq!(wm.high_water, "2026-02-15T00:00:00Z");

        // Backward advance is a no-op
        let wm = store
            .advance_watermark(
                "equity", "polygon", "AAPL", "2026-02-14T00:00:00Z", None, None, now,
            )
            .await
            .unwrap();
        assert_eq!(wm.high_water, "2026-02-15T00:00:00Z");

        let stored = store
            .get_watermark("equity", "polygon", "AAPL")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.high_water, "2026-02-15T00:00:00Z");
    }

    #[tokio::test]
    async fn test_dead_letter_replay_marking() {
        let store = InMemoryStore::new();
        let mut run = make_run(RunStatus::Failed, None);
        run.error = Some(conveyor_core::error::RunError::categorized(
            "boom",
            ErrorCategory::Network,
        ));
        let entry = DeadLetter::from_run(&run, Utc::now());
        store.insert_dead_letter(&entry).await.unwrap();

        let new_run_id = Uuid::now_v7();
        store
            .mark_dead_letter_replayed(entry.id, new_run_id, Utc::now())
            .await
            .unwrap();

        let loaded = store.get_dead_letter(entry.id).await.unwrap().unwrap();
        assert_eq!(loaded.replayed_as_run_id, Some(new_run_id));

        let replayed = store
            .list_dead_letters(
                &DeadLetterFilter { replayed: Some(true), ..Default::default() },
                Pagination::default(),
            )
            .await
            .unwrap();
        assert_eq!(replayed.total, 1);
    }

    #[tokio::test]
    async fn test_due_schedules_ordering() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        let mut early = Schedule::interval("early", RunKind::Task, "noop", 60);
        early.next_run_at = Some(now - Duration::minutes(10));
        let mut late = Schedule::interval("late", RunKind::Task, "noop", 60);
        late.next_run_at = Some(now - Duration::minutes(5));
        let mut future = Schedule::interval("future", RunKind::Task, "noop", 60);
        future.next_run_at = Some(now + Duration::minutes(5));
        let mut disabled = Schedule::interval("disabled", RunKind::Task, "noop", 60);
        disabled.next_run_at = Some(now - Duration::minutes(10));
        disabled.enabled = false;

        for s in [&early, &late, &future, &disabled] {
            store.insert_schedule(s).await.unwrap();
        }

        let due = store.due_schedules(now).await.unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].name, "early");
        assert_eq!(due[1].name, "late");
    }

    #[tokio::test]
    async fn test_quality_failure_detection() {
        let store = InMemoryStore::new();
        let run_id = Uuid::now_v7();

        store
            .insert_quality_record(&QualityRecord::new(
                run_id,
                "row_count",
                None,
                conveyor_core::quality::QualityOutcome::pass("ok"),
                Utc::now(),
            ))
            .await
            .unwrap();
        assert!(!store.run_has_quality_failures(run_id).await.unwrap());

        store
            .insert_quality_record(&QualityRecord::new(
                run_id,
                "schema",
                None,
                conveyor_core::quality::QualityOutcome::fail("missing column"),
                Utc::now(),
            ))
            .await
            .unwrap();
        assert!(store.run_has_quality_failures(run_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_anomaly_resolution() {
        let store = InMemoryStore::new();
        let anomaly = Anomaly::new("ingest", Severity::Critical, "row_count", "short file");
        store.insert_anomaly(&anomaly).await.unwrap();

        let unresolved = store
            .list_unresolved_anomalies(&AnomalyFilter::default(), 10)
            .await
            .unwrap();
        assert_eq!(unresolved.len(), 1);

        assert!(store
            .resolve_anomaly(anomaly.anomaly_id, Some("backfilled"), Utc::now())
            .await
            .unwrap());
        // Second resolve is a no-op
        assert!(!store
            .resolve_anomaly(anomaly.anomaly_id, None, Utc::now())
            .await
            .unwrap());

        let unresolved = store
            .list_unresolved_anomalies(&AnomalyFilter::default(), 10)
            .await
            .unwrap();
        assert!(unresolved.is_empty());
    }

    #[tokio::test]
    async fn test_purge_removes_terminal_runs_and_events() {
        let store = InMemoryStore::new();
        let cutoff = Utc::now() + Duration::seconds(1);

        let done = make_run(RunStatus::Completed, None);
        let live = make_run(RunStatus::Running, None);
        store.insert_run(&done).await.unwrap();
        store.insert_run(&live).await.unwrap();
        store
            .append_event(done.run_id, &RunEvent::Started { attempt: 1 })
            .await
            .unwrap();

        let deleted = store.purge_older_than(cutoff, None).await.unwrap();
        let runs_deleted = deleted
            .iter()
            .find(|t| t.table == "core_executions")
            .unwrap();
        assert_eq!(runs_deleted.rows, 1);

        assert!(store.get_run(done.run_id).await.unwrap().is_none());
        assert!(store.get_run(live.run_id).await.unwrap().is_some());
        assert!(store
            .list_events(done.run_id, None, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_list_runs_filter_and_paging() {
        let store = InMemoryStore::new();
        for _ in 0..5 {
            store
                .insert_run(&make_run(RunStatus::Completed, None))
                .await
                .unwrap();
        }
        store
            .insert_run(&make_run(RunStatus::Running, None))
            .await
            .unwrap();

        let filter = RunFilter {
            status: Some(RunStatus::Completed),
            ..Default::default()
        };
        let page = store
            .list_runs(&filter, Pagination::new(2, 0))
            .await
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.total, 5);
        assert!(page.has_more(&Pagination::new(2, 0)));
    }
}
