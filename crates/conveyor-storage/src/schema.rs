//! PostgreSQL schema for the core tables
//!
//! Statements are idempotent (`IF NOT EXISTS`) so startup can always run
//! them. The idempotency-key uniqueness invariant lives here as a partial
//! unique index: at most one live-or-completed run per key; failed and
//! cancelled runs release the key for retry-linked resubmission.

/// DDL statements in dependency order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    // -- runs -----------------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS core_executions (
        id UUID PRIMARY KEY,
        kind TEXT NOT NULL,
        name TEXT NOT NULL,
        params JSONB NOT NULL DEFAULT '{}'::jsonb,
        status TEXT NOT NULL,
        lane TEXT NOT NULL DEFAULT 'default',
        priority TEXT NOT NULL DEFAULT 'normal',
        parent_run_id UUID,
        correlation_id TEXT,
        batch_id TEXT,
        idempotency_key TEXT,
        retry_of_run_id UUID,
        attempt INTEGER NOT NULL DEFAULT 1,
        max_retries INTEGER NOT NULL DEFAULT 0,
        retry_delay_seconds BIGINT NOT NULL DEFAULT 30,
        created_at TIMESTAMPTZ NOT NULL,
        started_at TIMESTAMPTZ,
        finished_at TIMESTAMPTZ,
        result JSONB,
        error JSONB,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS idx_core_executions_status
       ON core_executions (status, created_at)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_core_executions_parent
       ON core_executions (parent_run_id) WHERE parent_run_id IS NOT NULL"#,
    r#"CREATE INDEX IF NOT EXISTS idx_core_executions_name
       ON core_executions (name, created_at)"#,
    r#"CREATE UNIQUE INDEX IF NOT EXISTS uq_core_executions_idempotency_live
       ON core_executions (idempotency_key)
       WHERE idempotency_key IS NOT NULL
         AND status IN ('pending', 'queued', 'running', 'completed')"#,
    // -- event ledger ---------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS core_execution_events (
        execution_id UUID NOT NULL,
        id BIGINT NOT NULL,
        event_type TEXT NOT NULL,
        data JSONB NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (execution_id, id)
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS idx_core_execution_events_type
       ON core_execution_events (event_type, timestamp)"#,
    // -- leases ---------------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS core_concurrency_locks (
        lock_key TEXT PRIMARY KEY,
        owner TEXT NOT NULL,
        acquired_at TIMESTAMPTZ NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS core_schedule_locks (
        schedule_id UUID PRIMARY KEY,
        locked_by TEXT NOT NULL,
        locked_at TIMESTAMPTZ NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL
    )
    "#,
    // -- dead letters ---------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS core_dead_letters (
        id UUID PRIMARY KEY,
        origin_run_id UUID NOT NULL,
        kind TEXT NOT NULL,
        name TEXT NOT NULL,
        params JSONB NOT NULL DEFAULT '{}'::jsonb,
        error TEXT NOT NULL,
        category TEXT NOT NULL,
        retry_count INTEGER NOT NULL,
        max_retries INTEGER NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        replayed_as_run_id UUID,
        replayed_at TIMESTAMPTZ
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS idx_core_dead_letters_created
       ON core_dead_letters (created_at)"#,
    // -- schedules ------------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS core_schedules (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        target_kind TEXT NOT NULL,
        target_name TEXT NOT NULL,
        schedule_type TEXT NOT NULL,
        cron_expression TEXT,
        interval_seconds BIGINT,
        run_at TIMESTAMPTZ,
        timezone TEXT NOT NULL DEFAULT 'UTC',
        params JSONB NOT NULL DEFAULT '{}'::jsonb,
        enabled BOOLEAN NOT NULL DEFAULT TRUE,
        max_instances INTEGER NOT NULL DEFAULT 1,
        misfire_grace_seconds BIGINT NOT NULL DEFAULT 300,
        next_run_at TIMESTAMPTZ,
        last_run_at TIMESTAMPTZ,
        last_run_status TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS idx_core_schedules_due
       ON core_schedules (enabled, next_run_at)"#,
    r#"
    CREATE TABLE IF NOT EXISTS core_schedule_runs (
        id UUID PRIMARY KEY,
        schedule_id UUID NOT NULL,
        scheduled_at TIMESTAMPTZ NOT NULL,
        started_at TIMESTAMPTZ NOT NULL,
        run_id UUID,
        status TEXT NOT NULL
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS idx_core_schedule_runs_schedule
       ON core_schedule_runs (schedule_id, started_at)"#,
    // -- watermarks -----------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS core_watermarks (
        domain TEXT NOT NULL,
        source TEXT NOT NULL,
        partition_key TEXT NOT NULL,
        high_water TEXT NOT NULL,
        low_water TEXT,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
        updated_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (domain, source, partition_key)
    )
    "#,
    // -- backfill plans -------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS core_backfill_plans (
        id UUID PRIMARY KEY,
        domain TEXT NOT NULL,
        source TEXT NOT NULL,
        partition_keys JSONB NOT NULL,
        reason TEXT NOT NULL,
        status TEXT NOT NULL,
        range_start TEXT,
        range_end TEXT,
        completed_keys JSONB NOT NULL DEFAULT '[]'::jsonb,
        failed_keys JSONB NOT NULL DEFAULT '{}'::jsonb,
        checkpoint TEXT,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL,
        started_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ,
        created_by TEXT NOT NULL
    )
    "#,
    // -- quality --------------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS core_quality (
        id UUID PRIMARY KEY,
        execution_id UUID NOT NULL,
        check_name TEXT NOT NULL,
        partition_key TEXT,
        status TEXT NOT NULL,
        message TEXT NOT NULL,
        actual JSONB,
        expected JSONB,
        recorded_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS idx_core_quality_execution
       ON core_quality (execution_id)"#,
    // -- anomalies ------------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS core_anomalies (
        id UUID PRIMARY KEY,
        stage TEXT NOT NULL,
        partition_key TEXT,
        severity TEXT NOT NULL,
        category TEXT NOT NULL,
        message TEXT NOT NULL,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
        execution_id UUID,
        detected_at TIMESTAMPTZ NOT NULL,
        resolved_at TIMESTAMPTZ,
        resolution_note TEXT
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS idx_core_anomalies_unresolved
       ON core_anomalies (detected_at) WHERE resolved_at IS NULL"#,
    // -- manifest, rejects, readiness -----------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS core_manifest (
        domain TEXT NOT NULL,
        partition_key TEXT NOT NULL,
        stage TEXT NOT NULL,
        completed_at TIMESTAMPTZ NOT NULL,
        run_id UUID,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
        PRIMARY KEY (domain, partition_key, stage)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS core_rejects (
        id UUID PRIMARY KEY,
        execution_id UUID,
        stage TEXT NOT NULL,
        reason_code TEXT NOT NULL,
        detail JSONB NOT NULL,
        rejected_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS core_calc_dependencies (
        id UUID PRIMARY KEY,
        calc_name TEXT NOT NULL,
        upstream_domain TEXT NOT NULL,
        upstream_workflow TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS core_expected_schedules (
        id UUID PRIMARY KEY,
        domain TEXT NOT NULL,
        workflow TEXT NOT NULL,
        schedule_type TEXT NOT NULL,
        cron_expression TEXT,
        partition_template TEXT,
        expected_delay_hours INTEGER NOT NULL DEFAULT 0,
        description TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        UNIQUE (domain, workflow)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS core_data_readiness (
        id UUID PRIMARY KEY,
        domain TEXT NOT NULL,
        partition_key TEXT NOT NULL,
        stage TEXT NOT NULL,
        ready BOOLEAN NOT NULL,
        certified_at TIMESTAMPTZ,
        checked_at TIMESTAMPTZ NOT NULL,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
        UNIQUE (domain, partition_key, stage)
    )
    "#,
];

/// Tables reported by health checks, in display order.
pub const CORE_TABLES: &[&str] = &[
    "core_executions",
    "core_execution_events",
    "core_concurrency_locks",
    "core_schedule_locks",
    "core_dead_letters",
    "core_schedules",
    "core_schedule_runs",
    "core_watermarks",
    "core_backfill_plans",
    "core_quality",
    "core_anomalies",
    "core_manifest",
    "core_rejects",
    "core_calc_dependencies",
    "core_expected_schedules",
    "core_data_readiness",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_core_table_has_ddl() {
        for table in CORE_TABLES {
            let created = SCHEMA_STATEMENTS
                .iter()
                .any(|s| s.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")));
            assert!(created, "missing DDL for {table}");
        }
    }

    #[test]
    fn test_idempotency_index_excludes_terminal_states() {
        let index = SCHEMA_STATEMENTS
            .iter()
            .find(|s| s.contains("uq_core_executions_idempotency_live"))
            .unwrap();
        assert!(index.contains("'completed'"));
        assert!(!index.contains("'failed'"));
        assert!(!index.contains("'cancelled'"));
    }
}
