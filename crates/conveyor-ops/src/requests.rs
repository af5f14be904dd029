//! Typed operation requests

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use conveyor_core::run::{JsonMap, Priority, RunKind, RunStatus};

/// Submit a typed work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRunRequest {
    pub kind: RunKind,
    pub name: String,

    #[serde(default)]
    pub params: JsonMap,

    pub idempotency_key: Option<String>,

    #[serde(default)]
    pub priority: Priority,

    pub lane: Option<String>,
    pub correlation_id: Option<String>,
    pub batch_id: Option<String>,

    /// Defaults to the configured `dlq_max_retries`
    pub max_retries: Option<u32>,
    pub retry_delay_seconds: Option<u64>,

    #[serde(default)]
    pub metadata: JsonMap,
}

impl SubmitRunRequest {
    pub fn task(name: impl Into<String>) -> Self {
        Self {
            kind: RunKind::Task,
            name: name.into(),
            params: JsonMap::new(),
            idempotency_key: None,
            priority: Priority::default(),
            lane: None,
            correlation_id: None,
            batch_id: None,
            max_retries: None,
            retry_delay_seconds: None,
            metadata: JsonMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListRunsRequest {
    pub kind: Option<RunKind>,
    pub status: Option<RunStatus>,
    pub name: Option<String>,
    pub lane: Option<String>,
    pub correlation_id: Option<String>,
    pub batch_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,

    #[serde(default = "default_limit")]
    pub limit: u32,

    #[serde(default)]
    pub offset: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRunRequest {
    pub run_id: Uuid,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRunEventsRequest {
    pub run_id: Uuid,

    pub after_event_id: Option<i64>,

    #[serde(default = "default_event_limit")]
    pub limit: u32,
}

/// Execute a registered workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunWorkflowRequest {
    pub name: String,

    #[serde(default)]
    pub params: JsonMap,

    pub idempotency_key: Option<String>,

    /// Evaluate routing only; handlers are not invoked
    #[serde(default)]
    pub dry_run: bool,

    /// Sequential workflows only: skip steps before this one
    pub start_from: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateScheduleRequest {
    pub name: String,
    pub target_kind: RunKind,
    pub target_name: String,

    /// Exactly one of the trigger fields must be set
    pub cron_expression: Option<String>,
    pub interval_seconds: Option<u64>,
    pub run_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub params: JsonMap,

    #[serde(default = "default_true")]
    pub enabled: bool,

    pub max_instances: Option<u32>,
    pub misfire_grace_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateScheduleRequest {
    pub schedule_id: Uuid,
    pub enabled: Option<bool>,
    pub cron_expression: Option<String>,
    pub interval_seconds: Option<u64>,
    pub run_at: Option<DateTime<Utc>>,
    pub params: Option<JsonMap>,
    pub max_instances: Option<u32>,
    pub misfire_grace_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListDeadLettersRequest {
    pub name: Option<String>,
    pub replayed: Option<bool>,

    #[serde(default = "default_limit")]
    pub limit: u32,

    #[serde(default)]
    pub offset: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListAnomaliesRequest {
    pub stage: Option<String>,
    pub category: Option<String>,
    pub partition_key: Option<String>,
    pub min_severity: Option<conveyor_core::anomaly::Severity>,

    #[serde(default = "default_limit")]
    pub limit: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListQualityResultsRequest {
    pub run_id: Option<Uuid>,

    #[serde(default = "default_limit")]
    pub limit: u32,

    #[serde(default)]
    pub offset: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvanceWatermarkRequest {
    pub domain: String,
    pub source: String,
    pub partition_key: String,
    pub high_water: String,
    pub low_water: Option<String>,
    pub metadata: Option<JsonMap>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListWatermarkGapsRequest {
    pub domain: String,
    pub source: String,
    pub expected_partition_keys: Vec<String>,
}

/// Certify whether all stages for a domain partition are complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckDataReadinessRequest {
    pub domain: String,
    pub partition_key: String,
    pub stages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBackfillPlanRequest {
    pub domain: String,
    pub source: String,
    pub partition_keys: Vec<String>,
    pub reason: conveyor_core::backfill::BackfillReason,
    pub range_start: Option<String>,
    pub range_end: Option<String>,
    pub metadata: Option<JsonMap>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeRequest {
    #[serde(default = "default_purge_days")]
    pub older_than_days: u32,

    /// `None` purges all purgeable tables
    pub tables: Option<Vec<String>>,
}

fn default_limit() -> u32 {
    50
}

fn default_event_limit() -> u32 {
    200
}

fn default_true() -> bool {
    true
}

fn default_purge_days() -> u32 {
    90
}
