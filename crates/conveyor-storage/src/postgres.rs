//! PostgreSQL implementation of CoreStore
//!
//! Production persistence using sqlx:
//! - Per-run event sequences assigned in the insert statement
//! - Lease acquisition as reap-then-insert with `ON CONFLICT DO NOTHING`
//! - Watermark advancement under `SELECT ... FOR UPDATE`
//! - Idempotency-key uniqueness via a partial unique index

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, QueryBuilder, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use conveyor_core::anomaly::{Anomaly, Severity};
use conveyor_core::backfill::BackfillPlan;
use conveyor_core::dead_letter::DeadLetter;
use conveyor_core::error::RunError;
use conveyor_core::event::{EventRecord, RunEvent};
use conveyor_core::lease::{Lease, ScheduleLock};
use conveyor_core::quality::{QualityRecord, QualityStatus};
use conveyor_core::readiness::{
    CalcDependency, DataReadiness, ExpectedSchedule, ManifestEntry, RejectRecord,
};
use conveyor_core::run::{JsonMap, Run};
use conveyor_core::schedule::{Schedule, ScheduleRun};
use conveyor_core::watermark::Watermark;

use crate::schema::{CORE_TABLES, SCHEMA_STATEMENTS};
use crate::store::*;

const RUN_COLUMNS: &str = "id, kind, name, params, status, lane, priority, parent_run_id, \
     correlation_id, batch_id, idempotency_key, retry_of_run_id, attempt, max_retries, \
     retry_delay_seconds, created_at, started_at, finished_at, result, error, metadata";

const SCHEDULE_COLUMNS: &str = "id, name, target_kind, target_name, schedule_type, \
     cron_expression, interval_seconds, run_at, timezone, params, enabled, max_instances, \
     misfire_grace_seconds, next_run_at, last_run_at, last_run_status, created_at, updated_at";

const PURGEABLE_TABLES: &[&str] = &[
    "core_executions",
    "core_execution_events",
    "core_quality",
    "core_anomalies",
    "core_rejects",
    "core_dead_letters",
    "core_schedule_runs",
];

/// PostgreSQL CoreStore backed by a connection pool.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to a database URL.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await.map_err(db)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn db_or_conflict(e: sqlx::Error, what: &str) -> StoreError {
    match &e {
        sqlx::Error::Database(dbe) if dbe.is_unique_violation() => {
            StoreError::Conflict(what.to_string())
        }
        _ => StoreError::Database(e.to_string()),
    }
}

fn parse<T>(s: String, what: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr<Err = String>,
{
    s.parse()
        .map_err(|e| StoreError::Serialization(format!("{what}: {e}")))
}

fn json_map(value: serde_json::Value) -> JsonMap {
    value.as_object().cloned().unwrap_or_default()
}

fn json_value(map: &JsonMap) -> serde_json::Value {
    serde_json::Value::Object(map.clone())
}

fn run_from_row(row: &PgRow) -> Result<Run, StoreError> {
    let error: Option<serde_json::Value> = row.get("error");
    let error: Option<RunError> = match error {
        Some(value) => Some(
            serde_json::from_value(value)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
        ),
        None => None,
    };
    let result: Option<serde_json::Value> = row.get("result");
    Ok(Run {
        run_id: row.get("id"),
        kind: parse(row.get("kind"), "run kind")?,
        name: row.get("name"),
        params: json_map(row.get("params")),
        status: parse(row.get("status"), "run status")?,
        lane: row.get("lane"),
        priority: parse(row.get("priority"), "priority")?,
        parent_run_id: row.get("parent_run_id"),
        correlation_id: row.get("correlation_id"),
        batch_id: row.get("batch_id"),
        idempotency_key: row.get("idempotency_key"),
        retry_of_run_id: row.get("retry_of_run_id"),
        attempt: row.get::<i32, _>("attempt") as u32,
        max_retries: row.get::<i32, _>("max_retries") as u32,
        retry_delay_seconds: row.get::<i64, _>("retry_delay_seconds") as u64,
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        result: result.map(json_map),
        error,
        metadata: json_map(row.get("metadata")),
    })
}

fn schedule_from_row(row: &PgRow) -> Result<Schedule, StoreError> {
    Ok(Schedule {
        schedule_id: row.get("id"),
        name: row.get("name"),
        target_kind: parse(row.get("target_kind"), "target kind")?,
        target_name: row.get("target_name"),
        schedule_type: parse(row.get("schedule_type"), "schedule type")?,
        cron_expression: row.get("cron_expression"),
        interval_seconds: row
            .get::<Option<i64>, _>("interval_seconds")
            .map(|v| v as u64),
        run_at: row.get("run_at"),
        timezone: row.get("timezone"),
        params: json_map(row.get("params")),
        enabled: row.get("enabled"),
        max_instances: row.get::<i32, _>("max_instances") as u32,
        misfire_grace_seconds: row.get::<i64, _>("misfire_grace_seconds") as u64,
        next_run_at: row.get("next_run_at"),
        last_run_at: row.get("last_run_at"),
        last_run_status: row.get("last_run_status"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn dead_letter_from_row(row: &PgRow) -> Result<DeadLetter, StoreError> {
    let category: String = row.get("category");
    Ok(DeadLetter {
        id: row.get("id"),
        origin_run_id: row.get("origin_run_id"),
        kind: parse(row.get("kind"), "run kind")?,
        name: row.get("name"),
        params: json_map(row.get("params")),
        error: row.get("error"),
        category: serde_json::from_value(serde_json::Value::String(category))
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        retry_count: row.get::<i32, _>("retry_count") as u32,
        max_retries: row.get::<i32, _>("max_retries") as u32,
        created_at: row.get("created_at"),
        replayed_as_run_id: row.get("replayed_as_run_id"),
        replayed_at: row.get("replayed_at"),
    })
}

fn watermark_from_row(row: &PgRow) -> Watermark {
    Watermark {
        domain: row.get("domain"),
        source: row.get("source"),
        partition_key: row.get("partition_key"),
        high_water: row.get("high_water"),
        low_water: row.get("low_water"),
        metadata: json_map(row.get("metadata")),
        updated_at: row.get("updated_at"),
    }
}

fn backfill_from_row(row: &PgRow) -> Result<BackfillPlan, StoreError> {
    let partition_keys: serde_json::Value = row.get("partition_keys");
    let completed_keys: serde_json::Value = row.get("completed_keys");
    let failed_keys: serde_json::Value = row.get("failed_keys");
    Ok(BackfillPlan {
        plan_id: row.get("id"),
        domain: row.get("domain"),
        source: row.get("source"),
        partition_keys: serde_json::from_value(partition_keys)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        reason: parse(row.get("reason"), "backfill reason")?,
        status: parse(row.get("status"), "backfill status")?,
        range_start: row.get("range_start"),
        range_end: row.get("range_end"),
        completed_keys: serde_json::from_value(completed_keys)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        failed_keys: serde_json::from_value(failed_keys)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        checkpoint: row.get("checkpoint"),
        metadata: json_map(row.get("metadata")),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        created_by: row.get("created_by"),
    })
}

fn anomaly_from_row(row: &PgRow) -> Result<Anomaly, StoreError> {
    Ok(Anomaly {
        anomaly_id: row.get("id"),
        stage: row.get("stage"),
        partition_key: row.get("partition_key"),
        severity: parse(row.get("severity"), "severity")?,
        category: row.get("category"),
        message: row.get("message"),
        metadata: json_map(row.get("metadata")),
        run_id: row.get("execution_id"),
        detected_at: row.get("detected_at"),
        resolved_at: row.get("resolved_at"),
        resolution_note: row.get("resolution_note"),
    })
}

fn event_from_row(row: &PgRow) -> EventRecord {
    EventRecord {
        event_id: row.get("id"),
        run_id: row.get("execution_id"),
        event_type: row.get("event_type"),
        data: row.get("data"),
        timestamp: row.get("timestamp"),
    }
}

fn push_run_filters(qb: &mut QueryBuilder<'_, sqlx::Postgres>, filter: &RunFilter) {
    if let Some(kind) = filter.kind {
        qb.push(" AND kind = ").push_bind(kind.to_string());
    }
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.to_string());
    }
    if let Some(name) = &filter.name {
        qb.push(" AND name = ").push_bind(name.clone());
    }
    if let Some(lane) = &filter.lane {
        qb.push(" AND lane = ").push_bind(lane.clone());
    }
    if let Some(correlation_id) = &filter.correlation_id {
        qb.push(" AND correlation_id = ").push_bind(correlation_id.clone());
    }
    if let Some(batch_id) = &filter.batch_id {
        qb.push(" AND batch_id = ").push_bind(batch_id.clone());
    }
    if let Some(since) = filter.since {
        qb.push(" AND created_at >= ").push_bind(since);
    }
    if let Some(until) = filter.until {
        qb.push(" AND created_at < ").push_bind(until);
    }
}

#[async_trait]
impl CoreStore for PostgresStore {
    // =========================================================================
    // Runs
    // =========================================================================

    #[instrument(skip(self, run), fields(run_id = %run.run_id))]
    async fn insert_run(&self, run: &Run) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO core_executions (
                id, kind, name, params, status, lane, priority, parent_run_id,
                correlation_id, batch_id, idempotency_key, retry_of_run_id,
                attempt, max_retries, retry_delay_seconds, created_at,
                started_at, finished_at, result, error, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                    $13, $14, $15, $16, $17, $18, $19, $20, $21)
            "#,
        )
        .bind(run.run_id)
        .bind(run.kind.to_string())
        .bind(&run.name)
        .bind(json_value(&run.params))
        .bind(run.status.to_string())
        .bind(&run.lane)
        .bind(run.priority.to_string())
        .bind(run.parent_run_id)
        .bind(&run.correlation_id)
        .bind(&run.batch_id)
        .bind(&run.idempotency_key)
        .bind(run.retry_of_run_id)
        .bind(run.attempt as i32)
        .bind(run.max_retries as i32)
        .bind(run.retry_delay_seconds as i64)
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.result.as_ref().map(json_value))
        .bind(
            run.error
                .as_ref()
                .map(|e| serde_json::to_value(e).unwrap_or(serde_json::Value::Null)),
        )
        .bind(json_value(&run.metadata))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to insert run: {e}");
            db_or_conflict(e, "run or idempotency key already exists")
        })?;

        debug!("inserted run");
        Ok(())
    }

    #[instrument(skip(self, run), fields(run_id = %run.run_id))]
    async fn update_run(&self, run: &Run) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE core_executions
            SET status = $2, params = $3, attempt = $4, started_at = $5,
                finished_at = $6, result = $7, error = $8, metadata = $9
            WHERE id = $1
            "#,
        )
        .bind(run.run_id)
        .bind(run.status.to_string())
        .bind(json_value(&run.params))
        .bind(run.attempt as i32)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.result.as_ref().map(json_value))
        .bind(
            run.error
                .as_ref()
                .map(|e| serde_json::to_value(e).unwrap_or(serde_json::Value::Null)),
        )
        .bind(json_value(&run.metadata))
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("run", run.run_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM core_executions WHERE id = $1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;

        row.as_ref().map(run_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn find_run_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM core_executions
             WHERE idempotency_key = $1
             ORDER BY created_at DESC, id DESC
             LIMIT 1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;

        row.as_ref().map(run_from_row).transpose()
    }

    #[instrument(skip(self, filter))]
    async fn list_runs(
        &self,
        filter: &RunFilter,
        page: Pagination,
    ) -> Result<Page<Run>, StoreError> {
        let mut count_qb = QueryBuilder::new(
            "SELECT COUNT(*) AS count FROM core_executions WHERE TRUE",
        );
        push_run_filters(&mut count_qb, filter);
        let total: i64 = count_qb
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(db)?
            .get("count");

        let mut qb = QueryBuilder::new(format!(
            "SELECT {RUN_COLUMNS} FROM core_executions WHERE TRUE"
        ));
        push_run_filters(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(page.limit as i64)
            .push(" OFFSET ")
            .push_bind(page.offset as i64);

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db)?;
        let items = rows
            .iter()
            .map(run_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page {
            items,
            total: total as u64,
        })
    }

    #[instrument(skip(self))]
    async fn list_child_runs(&self, parent_run_id: Uuid) -> Result<Vec<Run>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM core_executions
             WHERE parent_run_id = $1
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(parent_run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        rows.iter().map(run_from_row).collect()
    }

    // =========================================================================
    // Event ledger
    // =========================================================================

    #[instrument(skip(self, event), fields(event_type = event.event_type()))]
    async fn append_event(
        &self,
        run_id: Uuid,
        event: &RunEvent,
    ) -> Result<EventRecord, StoreError> {
        let data = serde_json::to_value(event)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let now = Utc::now();

        // Sequence assignment races with concurrent appenders on the
        // (execution_id, id) primary key; one retry absorbs the common
        // case and persistent conflicts surface to the caller.
        for attempt in 0..2 {
            let result = sqlx::query(
                r#"
                INSERT INTO core_execution_events (execution_id, id, event_type, data, timestamp)
                VALUES (
                    $1,
                    COALESCE((SELECT MAX(id) FROM core_execution_events WHERE execution_id = $1), 0) + 1,
                    $2, $3, $4
                )
                RETURNING id
                "#,
            )
            .bind(run_id)
            .bind(event.event_type())
            .bind(&data)
            .bind(now)
            .fetch_one(&self.pool)
            .await;

            match result {
                Ok(row) => {
                    return Ok(EventRecord {
                        event_id: row.get("id"),
                        run_id,
                        event_type: event.event_type().to_string(),
                        data,
                        timestamp: now,
                    });
                }
                Err(e) => {
                    let conflict = matches!(
                        &e,
                        sqlx::Error::Database(dbe) if dbe.is_unique_violation()
                    );
                    if !conflict || attempt == 1 {
                        error!("failed to append event: {e}");
                        return Err(db(e));
                    }
                }
            }
        }
        unreachable!("append_event retry loop always returns");
    }

    #[instrument(skip(self))]
    async fn list_events(
        &self,
        run_id: Uuid,
        after_event_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT execution_id, id, event_type, data, timestamp
            FROM core_execution_events
            WHERE execution_id = $1 AND id > $2
            ORDER BY id ASC
            LIMIT $3
            "#,
        )
        .bind(run_id)
        .bind(after_event_id.unwrap_or(0))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        Ok(rows.iter().map(event_from_row).collect())
    }

    #[instrument(skip(self))]
    async fn list_events_by_type(
        &self,
        event_type: &str,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT execution_id, id, event_type, data, timestamp
            FROM core_execution_events
            WHERE event_type = $1 AND timestamp >= $2
            ORDER BY timestamp ASC, execution_id ASC, id ASC
            LIMIT $3
            "#,
        )
        .bind(event_type)
        .bind(since)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        Ok(rows.iter().map(event_from_row).collect())
    }

    // =========================================================================
    // Concurrency leases
    // =========================================================================

    #[instrument(skip(self))]
    async fn acquire_lease(
        &self,
        lock_key: &str,
        owner: &str,
        ttl_seconds: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        // Reap a stale lease in the same transaction as the acquire
        sqlx::query(
            "DELETE FROM core_concurrency_locks WHERE lock_key = $1 AND expires_at <= $2",
        )
        .bind(lock_key)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        let result = sqlx::query(
            r#"
            INSERT INTO core_concurrency_locks (lock_key, owner, acquired_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (lock_key) DO NOTHING
            "#,
        )
        .bind(lock_key)
        .bind(owner)
        .bind(now)
        .bind(now + Duration::seconds(ttl_seconds as i64))
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        tx.commit().await.map_err(db)?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn release_lease(&self, lock_key: &str, owner: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM core_concurrency_locks WHERE lock_key = $1 AND owner = $2",
        )
        .bind(lock_key)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn list_leases(&self) -> Result<Vec<Lease>, StoreError> {
        let rows = sqlx::query(
            "SELECT lock_key, owner, acquired_at, expires_at
             FROM core_concurrency_locks ORDER BY lock_key",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        Ok(rows
            .iter()
            .map(|row| Lease {
                lock_key: row.get("lock_key"),
                owner: row.get("owner"),
                acquired_at: row.get("acquired_at"),
                expires_at: row.get("expires_at"),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn force_release_lease(&self, lock_key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM core_concurrency_locks WHERE lock_key = $1")
            .bind(lock_key)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn reap_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result =
            sqlx::query("DELETE FROM core_concurrency_locks WHERE expires_at <= $1")
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(db)?;
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Schedule locks
    // =========================================================================

    #[instrument(skip(self))]
    async fn acquire_schedule_lock(
        &self,
        schedule_id: Uuid,
        locked_by: &str,
        ttl_seconds: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        sqlx::query(
            "DELETE FROM core_schedule_locks WHERE schedule_id = $1 AND expires_at <= $2",
        )
        .bind(schedule_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        let result = sqlx::query(
            r#"
            INSERT INTO core_schedule_locks (schedule_id, locked_by, locked_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (schedule_id) DO NOTHING
            "#,
        )
        .bind(schedule_id)
        .bind(locked_by)
        .bind(now)
        .bind(now + Duration::seconds(ttl_seconds as i64))
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        tx.commit().await.map_err(db)?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn release_schedule_lock(
        &self,
        schedule_id: Uuid,
        locked_by: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM core_schedule_locks WHERE schedule_id = $1 AND locked_by = $2",
        )
        .bind(schedule_id)
        .bind(locked_by)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn list_schedule_locks(&self) -> Result<Vec<ScheduleLock>, StoreError> {
        let rows = sqlx::query(
            "SELECT schedule_id, locked_by, locked_at, expires_at
             FROM core_schedule_locks ORDER BY schedule_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        Ok(rows
            .iter()
            .map(|row| ScheduleLock {
                schedule_id: row.get("schedule_id"),
                locked_by: row.get("locked_by"),
                locked_at: row.get("locked_at"),
                expires_at: row.get("expires_at"),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn force_release_schedule_lock(
        &self,
        schedule_id: Uuid,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM core_schedule_locks WHERE schedule_id = $1")
            .bind(schedule_id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // Dead-letter queue
    // =========================================================================

    #[instrument(skip(self, entry), fields(dlq_id = %entry.id))]
    async fn insert_dead_letter(&self, entry: &DeadLetter) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO core_dead_letters (
                id, origin_run_id, kind, name, params, error, category,
                retry_count, max_retries, created_at, replayed_as_run_id, replayed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(entry.id)
        .bind(entry.origin_run_id)
        .bind(entry.kind.to_string())
        .bind(&entry.name)
        .bind(json_value(&entry.params))
        .bind(&entry.error)
        .bind(entry.category.to_string())
        .bind(entry.retry_count as i32)
        .bind(entry.max_retries as i32)
        .bind(entry.created_at)
        .bind(entry.replayed_as_run_id)
        .bind(entry.replayed_at)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_dead_letter(&self, id: Uuid) -> Result<Option<DeadLetter>, StoreError> {
        let row = sqlx::query("SELECT * FROM core_dead_letters WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.as_ref().map(dead_letter_from_row).transpose()
    }

    #[instrument(skip(self, filter))]
    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
        page: Pagination,
    ) -> Result<Page<DeadLetter>, StoreError> {
        let push_filters = |qb: &mut QueryBuilder<'_, sqlx::Postgres>| {
            if let Some(name) = &filter.name {
                qb.push(" AND name = ").push_bind(name.clone());
            }
            match filter.replayed {
                Some(true) => {
                    qb.push(" AND replayed_as_run_id IS NOT NULL");
                }
                Some(false) => {
                    qb.push(" AND replayed_as_run_id IS NULL");
                }
                None => {}
            }
        };

        let mut count_qb =
            QueryBuilder::new("SELECT COUNT(*) AS count FROM core_dead_letters WHERE TRUE");
        push_filters(&mut count_qb);
        let total: i64 = count_qb
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(db)?
            .get("count");

        let mut qb = QueryBuilder::new("SELECT * FROM core_dead_letters WHERE TRUE");
        push_filters(&mut qb);
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(page.limit as i64)
            .push(" OFFSET ")
            .push_bind(page.offset as i64);

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db)?;
        let items = rows
            .iter()
            .map(dead_letter_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page {
            items,
            total: total as u64,
        })
    }

    #[instrument(skip(self))]
    async fn mark_dead_letter_replayed(
        &self,
        id: Uuid,
        new_run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE core_dead_letters SET replayed_as_run_id = $2, replayed_at = $3
             WHERE id = $1",
        )
        .bind(id)
        .bind(new_run_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("dead_letter", id));
        }
        Ok(())
    }

    // =========================================================================
    // Schedules
    // =========================================================================

    #[instrument(skip(self, schedule), fields(schedule_id = %schedule.schedule_id))]
    async fn insert_schedule(&self, schedule: &Schedule) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO core_schedules (
                id, name, target_kind, target_name, schedule_type, cron_expression,
                interval_seconds, run_at, timezone, params, enabled, max_instances,
                misfire_grace_seconds, next_run_at, last_run_at, last_run_status,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                    $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(schedule.schedule_id)
        .bind(&schedule.name)
        .bind(schedule.target_kind.to_string())
        .bind(&schedule.target_name)
        .bind(schedule.schedule_type.to_string())
        .bind(&schedule.cron_expression)
        .bind(schedule.interval_seconds.map(|v| v as i64))
        .bind(schedule.run_at)
        .bind(&schedule.timezone)
        .bind(json_value(&schedule.params))
        .bind(schedule.enabled)
        .bind(schedule.max_instances as i32)
        .bind(schedule.misfire_grace_seconds as i64)
        .bind(schedule.next_run_at)
        .bind(schedule.last_run_at)
        .bind(&schedule.last_run_status)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_or_conflict(e, "schedule already exists"))?;
        Ok(())
    }

    #[instrument(skip(self, schedule), fields(schedule_id = %schedule.schedule_id))]
    async fn update_schedule(&self, schedule: &Schedule) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE core_schedules
            SET name = $2, target_kind = $3, target_name = $4, schedule_type = $5,
                cron_expression = $6, interval_seconds = $7, run_at = $8, timezone = $9,
                params = $10, enabled = $11, max_instances = $12,
                misfire_grace_seconds = $13, next_run_at = $14, last_run_at = $15,
                last_run_status = $16, updated_at = $17
            WHERE id = $1
            "#,
        )
        .bind(schedule.schedule_id)
        .bind(&schedule.name)
        .bind(schedule.target_kind.to_string())
        .bind(&schedule.target_name)
        .bind(schedule.schedule_type.to_string())
        .bind(&schedule.cron_expression)
        .bind(schedule.interval_seconds.map(|v| v as i64))
        .bind(schedule.run_at)
        .bind(&schedule.timezone)
        .bind(json_value(&schedule.params))
        .bind(schedule.enabled)
        .bind(schedule.max_instances as i32)
        .bind(schedule.misfire_grace_seconds as i64)
        .bind(schedule.next_run_at)
        .bind(schedule.last_run_at)
        .bind(&schedule.last_run_status)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("schedule", schedule.schedule_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_schedule(&self, schedule_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM core_schedules WHERE id = $1")
            .bind(schedule_id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn get_schedule(
        &self,
        schedule_id: Uuid,
    ) -> Result<Option<Schedule>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM core_schedules WHERE id = $1"
        ))
        .bind(schedule_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        row.as_ref().map(schedule_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn list_schedules(&self, page: Pagination) -> Result<Page<Schedule>, StoreError> {
        let total: i64 = sqlx::query("SELECT COUNT(*) AS count FROM core_schedules")
            .fetch_one(&self.pool)
            .await
            .map_err(db)?
            .get("count");

        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM core_schedules
             ORDER BY name LIMIT $1 OFFSET $2"
        ))
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        let items = rows
            .iter()
            .map(schedule_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page {
            items,
            total: total as u64,
        })
    }

    #[instrument(skip(self))]
    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM core_schedules
             WHERE enabled = TRUE AND next_run_at IS NOT NULL AND next_run_at <= $1
             ORDER BY next_run_at ASC"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        rows.iter().map(schedule_from_row).collect()
    }

    #[instrument(skip(self, run))]
    async fn insert_schedule_run(&self, run: &ScheduleRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO core_schedule_runs (id, schedule_id, scheduled_at, started_at, run_id, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(run.id)
        .bind(run.schedule_id)
        .bind(run.scheduled_at)
        .bind(run.started_at)
        .bind(run.run_id)
        .bind(run.status.to_string())
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_schedule_runs(
        &self,
        schedule_id: Uuid,
        limit: u32,
    ) -> Result<Vec<ScheduleRun>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, schedule_id, scheduled_at, started_at, run_id, status
            FROM core_schedule_runs
            WHERE schedule_id = $1
            ORDER BY started_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(schedule_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        rows.iter()
            .map(|row| {
                Ok(ScheduleRun {
                    id: row.get("id"),
                    schedule_id: row.get("schedule_id"),
                    scheduled_at: row.get("scheduled_at"),
                    started_at: row.get("started_at"),
                    run_id: row.get("run_id"),
                    status: parse(row.get("status"), "schedule run status")?,
                })
            })
            .collect()
    }

    // =========================================================================
    // Watermarks
    // =========================================================================

    #[instrument(skip(self, metadata))]
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
        let mut tx = self.pool.begin().await.map_err(db)?;

        let existing = sqlx::query(
            r#"
            SELECT domain, source, partition_key, high_water, low_water, metadata, updated_at
            FROM core_watermarks
            WHERE domain = $1 AND source = $2 AND partition_key = $3
            FOR UPDATE
            "#,
        )
        .bind(domain)
        .bind(source)
        .bind(partition_key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db)?;

        let result = match existing.as_ref().map(watermark_from_row) {
            Some(current) => current.advanced(high_water, low_water, metadata, now),
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

        sqlx::query(
            r#"
            INSERT INTO core_watermarks (domain, source, partition_key, high_water, low_water, metadata, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (domain, source, partition_key) DO UPDATE SET
                high_water = EXCLUDED.high_water,
                low_water = EXCLUDED.low_water,
                metadata = EXCLUDED.metadata,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&result.domain)
        .bind(&result.source)
        .bind(&result.partition_key)
        .bind(&result.high_water)
        .bind(&result.low_water)
        .bind(json_value(&result.metadata))
        .bind(result.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        tx.commit().await.map_err(db)?;
        Ok(result)
    }

    #[instrument(skip(self))]
    async fn get_watermark(
        &self,
        domain: &str,
        source: &str,
        partition_key: &str,
    ) -> Result<Option<Watermark>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT domain, source, partition_key, high_water, low_water, metadata, updated_at
            FROM core_watermarks
            WHERE domain = $1 AND source = $2 AND partition_key = $3
            "#,
        )
        .bind(domain)
        .bind(source)
        .bind(partition_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;

        Ok(row.as_ref().map(watermark_from_row))
    }

    #[instrument(skip(self))]
    async fn list_watermarks(
        &self,
        domain: Option<&str>,
    ) -> Result<Vec<Watermark>, StoreError> {
        let rows = match domain {
            Some(domain) => {
                sqlx::query(
                    "SELECT domain, source, partition_key, high_water, low_water, metadata, updated_at
                     FROM core_watermarks WHERE domain = $1
                     ORDER BY domain, source, partition_key",
                )
                .bind(domain)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT domain, source, partition_key, high_water, low_water, metadata, updated_at
                     FROM core_watermarks
                     ORDER BY domain, source, partition_key",
                )
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(db)?;

        Ok(rows.iter().map(watermark_from_row).collect())
    }

    #[instrument(skip(self))]
    async fn delete_watermark(
        &self,
        domain: &str,
        source: &str,
        partition_key: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM core_watermarks
             WHERE domain = $1 AND source = $2 AND partition_key = $3",
        )
        .bind(domain)
        .bind(source)
        .bind(partition_key)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // Backfill plans
    // =========================================================================

    #[instrument(skip(self, plan), fields(plan_id = %plan.plan_id))]
    async fn insert_backfill_plan(&self, plan: &BackfillPlan) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO core_backfill_plans (
                id, domain, source, partition_keys, reason, status, range_start,
                range_end, completed_keys, failed_keys, checkpoint, metadata,
                created_at, started_at, completed_at, created_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(plan.plan_id)
        .bind(&plan.domain)
        .bind(&plan.source)
        .bind(serde_json::to_value(&plan.partition_keys).map_err(ser)?)
        .bind(plan.reason.to_string())
        .bind(plan.status.to_string())
        .bind(&plan.range_start)
        .bind(&plan.range_end)
        .bind(serde_json::to_value(&plan.completed_keys).map_err(ser)?)
        .bind(serde_json::to_value(&plan.failed_keys).map_err(ser)?)
        .bind(&plan.checkpoint)
        .bind(json_value(&plan.metadata))
        .bind(plan.created_at)
        .bind(plan.started_at)
        .bind(plan.completed_at)
        .bind(&plan.created_by)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    #[instrument(skip(self, plan), fields(plan_id = %plan.plan_id))]
    async fn update_backfill_plan(&self, plan: &BackfillPlan) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE core_backfill_plans
            SET status = $2, completed_keys = $3, failed_keys = $4, checkpoint = $5,
                metadata = $6, started_at = $7, completed_at = $8
            WHERE id = $1
            "#,
        )
        .bind(plan.plan_id)
        .bind(plan.status.to_string())
        .bind(serde_json::to_value(&plan.completed_keys).map_err(ser)?)
        .bind(serde_json::to_value(&plan.failed_keys).map_err(ser)?)
        .bind(&plan.checkpoint)
        .bind(json_value(&plan.metadata))
        .bind(plan.started_at)
        .bind(plan.completed_at)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("backfill_plan", plan.plan_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_backfill_plan(
        &self,
        plan_id: Uuid,
    ) -> Result<Option<BackfillPlan>, StoreError> {
        let row = sqlx::query("SELECT * FROM core_backfill_plans WHERE id = $1")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.as_ref().map(backfill_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn list_backfill_plans(
        &self,
        domain: Option<&str>,
        page: Pagination,
    ) -> Result<Page<BackfillPlan>, StoreError> {
        let mut count_qb =
            QueryBuilder::new("SELECT COUNT(*) AS count FROM core_backfill_plans WHERE TRUE");
        if let Some(domain) = domain {
            count_qb.push(" AND domain = ").push_bind(domain);
        }
        let total: i64 = count_qb
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(db)?
            .get("count");

        let mut qb = QueryBuilder::new("SELECT * FROM core_backfill_plans WHERE TRUE");
        if let Some(domain) = domain {
            qb.push(" AND domain = ").push_bind(domain);
        }
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(page.limit as i64)
            .push(" OFFSET ")
            .push_bind(page.offset as i64);

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db)?;
        let items = rows
            .iter()
            .map(backfill_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page {
            items,
            total: total as u64,
        })
    }

    // =========================================================================
    // Quality records
    // =========================================================================

    #[instrument(skip(self, record), fields(run_id = %record.run_id))]
    async fn insert_quality_record(
        &self,
        record: &QualityRecord,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO core_quality (
                id, execution_id, check_name, partition_key, status, message,
                actual, expected, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.id)
        .bind(record.run_id)
        .bind(&record.check_name)
        .bind(&record.partition_key)
        .bind(record.status.to_string())
        .bind(&record.message)
        .bind(&record.actual)
        .bind(&record.expected)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_quality_records(
        &self,
        run_id: Option<Uuid>,
        page: Pagination,
    ) -> Result<Page<QualityRecord>, StoreError> {
        let mut count_qb =
            QueryBuilder::new("SELECT COUNT(*) AS count FROM core_quality WHERE TRUE");
        if let Some(run_id) = run_id {
            count_qb.push(" AND execution_id = ").push_bind(run_id);
        }
        let total: i64 = count_qb
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(db)?
            .get("count");

        let mut qb = QueryBuilder::new("SELECT * FROM core_quality WHERE TRUE");
        if let Some(run_id) = run_id {
            qb.push(" AND execution_id = ").push_bind(run_id);
        }
        qb.push(" ORDER BY recorded_at DESC, id DESC LIMIT ")
            .push_bind(page.limit as i64)
            .push(" OFFSET ")
            .push_bind(page.offset as i64);

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db)?;
        let items = rows
            .iter()
            .map(|row| {
                Ok(QualityRecord {
                    id: row.get("id"),
                    run_id: row.get("execution_id"),
                    check_name: row.get("check_name"),
                    partition_key: row.get("partition_key"),
                    status: parse(row.get("status"), "quality status")?,
                    message: row.get("message"),
                    actual: row.get("actual"),
                    expected: row.get("expected"),
                    recorded_at: row.get("recorded_at"),
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        Ok(Page {
            items,
            total: total as u64,
        })
    }

    #[instrument(skip(self))]
    async fn run_has_quality_failures(&self, run_id: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT EXISTS(
                SELECT 1 FROM core_quality WHERE execution_id = $1 AND status = $2
             ) AS failed",
        )
        .bind(run_id)
        .bind(QualityStatus::Fail.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(db)?;
        Ok(row.get("failed"))
    }

    // =========================================================================
    // Anomalies
    // =========================================================================

    #[instrument(skip(self, anomaly), fields(anomaly_id = %anomaly.anomaly_id))]
    async fn insert_anomaly(&self, anomaly: &Anomaly) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO core_anomalies (
                id, stage, partition_key, severity, category, message, metadata,
                execution_id, detected_at, resolved_at, resolution_note
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(anomaly.anomaly_id)
        .bind(&anomaly.stage)
        .bind(&anomaly.partition_key)
        .bind(anomaly.severity.to_string())
        .bind(&anomaly.category)
        .bind(&anomaly.message)
        .bind(json_value(&anomaly.metadata))
        .bind(anomaly.run_id)
        .bind(anomaly.detected_at)
        .bind(anomaly.resolved_at)
        .bind(&anomaly.resolution_note)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn resolve_anomaly(
        &self,
        anomaly_id: Uuid,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE core_anomalies SET resolved_at = $2, resolution_note = $3
             WHERE id = $1 AND resolved_at IS NULL",
        )
        .bind(anomaly_id)
        .bind(now)
        .bind(note)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, filter))]
    async fn list_unresolved_anomalies(
        &self,
        filter: &AnomalyFilter,
        limit: u32,
    ) -> Result<Vec<Anomaly>, StoreError> {
        let mut qb = QueryBuilder::new(
            "SELECT * FROM core_anomalies WHERE resolved_at IS NULL",
        );
        if let Some(stage) = &filter.stage {
            qb.push(" AND stage = ").push_bind(stage.clone());
        }
        if let Some(category) = &filter.category {
            qb.push(" AND category = ").push_bind(category.clone());
        }
        if let Some(partition_key) = &filter.partition_key {
            qb.push(" AND partition_key = ").push_bind(partition_key.clone());
        }
        if let Some(min) = filter.min_severity {
            // Severity ordering is not lexicographic; enumerate the
            // qualifying levels instead.
            let allowed: Vec<String> = [
                Severity::Debug,
                Severity::Info,
                Severity::Warn,
                Severity::Error,
                Severity::Critical,
            ]
            .iter()
            .filter(|s| **s >= min)
            .map(|s| s.to_string())
            .collect();
            qb.push(" AND severity = ANY(").push_bind(allowed).push(")");
        }
        qb.push(" ORDER BY detected_at DESC, id DESC LIMIT ")
            .push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db)?;
        rows.iter().map(anomaly_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn count_anomalies_by_severity(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<(Severity, u64)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT severity, COUNT(*) AS count
            FROM core_anomalies
            WHERE resolved_at IS NULL AND detected_at >= $1
            GROUP BY severity
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        let mut counts: Vec<(Severity, u64)> = rows
            .iter()
            .map(|row| {
                let severity: Severity = parse(row.get("severity"), "severity")?;
                Ok((severity, row.get::<i64, _>("count") as u64))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        counts.sort_by_key(|(severity, _)| *severity);
        Ok(counts)
    }

    // =========================================================================
    // Manifest, rejects, readiness
    // =========================================================================

    #[instrument(skip(self, entry))]
    async fn upsert_manifest(&self, entry: &ManifestEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO core_manifest (domain, partition_key, stage, completed_at, run_id, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (domain, partition_key, stage) DO UPDATE SET
                completed_at = EXCLUDED.completed_at,
                run_id = EXCLUDED.run_id,
                metadata = EXCLUDED.metadata
            "#,
        )
        .bind(&entry.domain)
        .bind(&entry.partition_key)
        .bind(&entry.stage)
        .bind(entry.completed_at)
        .bind(entry.run_id)
        .bind(json_value(&entry.metadata))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_manifest(
        &self,
        domain: &str,
        partition_key: &str,
        stage: &str,
    ) -> Result<Option<ManifestEntry>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM core_manifest
             WHERE domain = $1 AND partition_key = $2 AND stage = $3",
        )
        .bind(domain)
        .bind(partition_key)
        .bind(stage)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;

        Ok(row.map(|row| ManifestEntry {
            domain: row.get("domain"),
            partition_key: row.get("partition_key"),
            stage: row.get("stage"),
            completed_at: row.get("completed_at"),
            run_id: row.get("run_id"),
            metadata: json_map(row.get("metadata")),
        }))
    }

    #[instrument(skip(self))]
    async fn list_manifest(
        &self,
        domain: &str,
        partition_key: Option<&str>,
    ) -> Result<Vec<ManifestEntry>, StoreError> {
        let mut qb = QueryBuilder::new("SELECT * FROM core_manifest WHERE domain = ");
        qb.push_bind(domain);
        if let Some(partition_key) = partition_key {
            qb.push(" AND partition_key = ").push_bind(partition_key);
        }
        qb.push(" ORDER BY partition_key, stage");

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db)?;
        Ok(rows
            .iter()
            .map(|row| ManifestEntry {
                domain: row.get("domain"),
                partition_key: row.get("partition_key"),
                stage: row.get("stage"),
                completed_at: row.get("completed_at"),
                run_id: row.get("run_id"),
                metadata: json_map(row.get("metadata")),
            })
            .collect())
    }

    #[instrument(skip(self, reject))]
    async fn insert_reject(&self, reject: &RejectRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO core_rejects (id, execution_id, stage, reason_code, detail, rejected_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(reject.id)
        .bind(reject.run_id)
        .bind(&reject.stage)
        .bind(&reject.reason_code)
        .bind(&reject.detail)
        .bind(reject.rejected_at)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_rejects(
        &self,
        run_id: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<RejectRecord>, StoreError> {
        let mut qb = QueryBuilder::new("SELECT * FROM core_rejects WHERE TRUE");
        if let Some(run_id) = run_id {
            qb.push(" AND execution_id = ").push_bind(run_id);
        }
        qb.push(" ORDER BY rejected_at DESC, id DESC LIMIT ")
            .push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db)?;
        Ok(rows
            .iter()
            .map(|row| RejectRecord {
                id: row.get("id"),
                run_id: row.get("execution_id"),
                stage: row.get("stage"),
                reason_code: row.get("reason_code"),
                detail: row.get("detail"),
                rejected_at: row.get("rejected_at"),
            })
            .collect())
    }

    #[instrument(skip(self, dep))]
    async fn insert_calc_dependency(&self, dep: &CalcDependency) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO core_calc_dependencies (id, calc_name, upstream_domain, upstream_workflow, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(dep.id)
        .bind(&dep.calc_name)
        .bind(&dep.upstream_domain)
        .bind(&dep.upstream_workflow)
        .bind(dep.created_at)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_calc_dependencies(
        &self,
        calc_name: Option<&str>,
    ) -> Result<Vec<CalcDependency>, StoreError> {
        let mut qb = QueryBuilder::new("SELECT * FROM core_calc_dependencies WHERE TRUE");
        if let Some(calc_name) = calc_name {
            qb.push(" AND calc_name = ").push_bind(calc_name);
        }
        qb.push(" ORDER BY calc_name");

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db)?;
        Ok(rows
            .iter()
            .map(|row| CalcDependency {
                id: row.get("id"),
                calc_name: row.get("calc_name"),
                upstream_domain: row.get("upstream_domain"),
                upstream_workflow: row.get("upstream_workflow"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    #[instrument(skip(self, expected))]
    async fn upsert_expected_schedule(
        &self,
        expected: &ExpectedSchedule,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO core_expected_schedules (
                id, domain, workflow, schedule_type, cron_expression,
                partition_template, expected_delay_hours, description, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (domain, workflow) DO UPDATE SET
                schedule_type = EXCLUDED.schedule_type,
                cron_expression = EXCLUDED.cron_expression,
                partition_template = EXCLUDED.partition_template,
                expected_delay_hours = EXCLUDED.expected_delay_hours,
                description = EXCLUDED.description,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(expected.id)
        .bind(&expected.domain)
        .bind(&expected.workflow)
        .bind(&expected.schedule_type)
        .bind(&expected.cron_expression)
        .bind(&expected.partition_template)
        .bind(expected.expected_delay_hours as i32)
        .bind(&expected.description)
        .bind(expected.created_at)
        .bind(expected.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_expected_schedules(
        &self,
        domain: Option<&str>,
    ) -> Result<Vec<ExpectedSchedule>, StoreError> {
        let mut qb = QueryBuilder::new("SELECT * FROM core_expected_schedules WHERE TRUE");
        if let Some(domain) = domain {
            qb.push(" AND domain = ").push_bind(domain);
        }
        qb.push(" ORDER BY domain, workflow");

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db)?;
        Ok(rows
            .iter()
            .map(|row| ExpectedSchedule {
                id: row.get("id"),
                domain: row.get("domain"),
                workflow: row.get("workflow"),
                schedule_type: row.get("schedule_type"),
                cron_expression: row.get("cron_expression"),
                partition_template: row.get("partition_template"),
                expected_delay_hours: row.get::<i32, _>("expected_delay_hours") as u32,
                description: row.get("description"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
            })
            .collect())
    }

    #[instrument(skip(self, row))]
    async fn upsert_data_readiness(&self, row: &DataReadiness) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO core_data_readiness (
                id, domain, partition_key, stage, ready, certified_at, checked_at, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (domain, partition_key, stage) DO UPDATE SET
                ready = EXCLUDED.ready,
                certified_at = EXCLUDED.certified_at,
                checked_at = EXCLUDED.checked_at,
                metadata = EXCLUDED.metadata
            "#,
        )
        .bind(row.id)
        .bind(&row.domain)
        .bind(&row.partition_key)
        .bind(&row.stage)
        .bind(row.ready)
        .bind(row.certified_at)
        .bind(row.checked_at)
        .bind(json_value(&row.metadata))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_data_readiness(
        &self,
        domain: Option<&str>,
    ) -> Result<Vec<DataReadiness>, StoreError> {
        let mut qb = QueryBuilder::new("SELECT * FROM core_data_readiness WHERE TRUE");
        if let Some(domain) = domain {
            qb.push(" AND domain = ").push_bind(domain);
        }
        qb.push(" ORDER BY domain, partition_key, stage");

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db)?;
        Ok(rows
            .iter()
            .map(|row| DataReadiness {
                id: row.get("id"),
                domain: row.get("domain"),
                partition_key: row.get("partition_key"),
                stage: row.get("stage"),
                ready: row.get("ready"),
                certified_at: row.get("certified_at"),
                checked_at: row.get("checked_at"),
                metadata: json_map(row.get("metadata")),
            })
            .collect())
    }

    // =========================================================================
    // Admin
    // =========================================================================

    #[instrument(skip(self))]
    async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    error!("schema statement failed: {e}");
                    db(e)
                })?;
        }
        debug!("schema initialized");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn health(&self) -> Result<StoreHealth, StoreError> {
        let mut tables = Vec::with_capacity(CORE_TABLES.len());
        for table in CORE_TABLES {
            let row = sqlx::query(&format!("SELECT COUNT(*) AS count FROM {table}"))
                .fetch_one(&self.pool)
                .await
                .map_err(db)?;
            tables.push(TableCount {
                table: table.to_string(),
                rows: row.get::<i64, _>("count") as u64,
            });
        }
        Ok(StoreHealth {
            backend: "postgres".to_string(),
            reachable: true,
            tables,
        })
    }

    #[instrument(skip(self))]
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
                    let mut tx = self.pool.begin().await.map_err(db)?;
                    sqlx::query(
                        r#"
                        DELETE FROM core_execution_events WHERE execution_id IN (
                            SELECT id FROM core_executions
                            WHERE status IN ('completed', 'failed', 'cancelled', 'dead_lettered')
                              AND finished_at < $1
                        )
                        "#,
                    )
                    .bind(cutoff)
                    .execute(&mut *tx)
                    .await
                    .map_err(db)?;
                    let result = sqlx::query(
                        r#"
                        DELETE FROM core_executions
                        WHERE status IN ('completed', 'failed', 'cancelled', 'dead_lettered')
                          AND finished_at < $1
                        "#,
                    )
                    .bind(cutoff)
                    .execute(&mut *tx)
                    .await
                    .map_err(db)?;
                    tx.commit().await.map_err(db)?;
                    result.rows_affected()
                }
                "core_execution_events" => {
                    let result = sqlx::query(
                        r#"
                        DELETE FROM core_execution_events
                        WHERE execution_id NOT IN (SELECT id FROM core_executions)
                        "#,
                    )
                    .execute(&self.pool)
                    .await
                    .map_err(db)?;
                    result.rows_affected()
                }
                "core_quality" => {
                    let result =
                        sqlx::query("DELETE FROM core_quality WHERE recorded_at < $1")
                            .bind(cutoff)
                            .execute(&self.pool)
                            .await
                            .map_err(db)?;
                    result.rows_affected()
                }
                "core_anomalies" => {
                    let result = sqlx::query(
                        "DELETE FROM core_anomalies
                         WHERE resolved_at IS NOT NULL AND detected_at < $1",
                    )
                    .bind(cutoff)
                    .execute(&self.pool)
                    .await
                    .map_err(db)?;
                    result.rows_affected()
                }
                "core_rejects" => {
                    let result =
                        sqlx::query("DELETE FROM core_rejects WHERE rejected_at < $1")
                            .bind(cutoff)
                            .execute(&self.pool)
                            .await
                            .map_err(db)?;
                    result.rows_affected()
                }
                "core_dead_letters" => {
                    let result = sqlx::query(
                        "DELETE FROM core_dead_letters
                         WHERE replayed_as_run_id IS NOT NULL AND created_at < $1",
                    )
                    .bind(cutoff)
                    .execute(&self.pool)
                    .await
                    .map_err(db)?;
                    result.rows_affected()
                }
                "core_schedule_runs" => {
                    let result =
                        sqlx::query("DELETE FROM core_schedule_runs WHERE started_at < $1")
                            .bind(cutoff)
                            .execute(&self.pool)
                            .await
                            .map_err(db)?;
                    result.rows_affected()
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

fn ser(e: serde_json::Error) -> StoreError {
    StoreError::Serialization(e.to_string())
}
