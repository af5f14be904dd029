//! Typed operation responses
//!
//! Entity types that already serialize cleanly (watermarks, anomalies,
//! backfill plans, leases) are returned as-is; views here shape the rest
//! for API consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use conveyor_core::error::RunError;
use conveyor_core::run::{JsonMap, Priority, Run, RunKind, RunStatus};
use conveyor_core::schedule::Schedule;
use conveyor_core::step::Step;
use conveyor_core::workflow::Workflow;

/// Acknowledgement of an accepted submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunAccepted {
    pub run_id: Uuid,
    pub status: RunStatus,
}

/// Compact run listing row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub kind: RunKind,
    pub name: String,
    pub status: RunStatus,
    pub lane: String,
    pub priority: Priority,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
}

impl From<&Run> for RunSummary {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.run_id,
            kind: run.kind,
            name: run.name.clone(),
            status: run.status,
            lane: run.lane.clone(),
            priority: run.priority,
            attempt: run.attempt,
            created_at: run.created_at,
            started_at: run.started_at,
            finished_at: run.finished_at,
            duration_seconds: run.duration_seconds(),
        }
    }
}

/// Full run detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDetail {
    #[serde(flatten)]
    pub summary: RunSummary,

    pub params: JsonMap,
    pub result: Option<JsonMap>,
    pub error: Option<RunError>,
    pub parent_run_id: Option<Uuid>,
    pub correlation_id: Option<String>,
    pub batch_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub retry_of_run_id: Option<Uuid>,
    pub max_retries: u32,
    pub metadata: JsonMap,
}

impl From<&Run> for RunDetail {
    fn from(run: &Run) -> Self {
        Self {
            summary: run.into(),
            params: run.params.clone(),
            result: run.result.clone(),
            error: run.error.clone(),
            parent_run_id: run.parent_run_id,
            correlation_id: run.correlation_id.clone(),
            batch_id: run.batch_id.clone(),
            idempotency_key: run.idempotency_key.clone(),
            retry_of_run_id: run.retry_of_run_id,
            max_retries: run.max_retries,
            metadata: run.metadata.clone(),
        }
    }
}

/// One ledger event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEventView {
    pub event_id: i64,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

/// Workflow listing row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub name: String,
    pub mode: conveyor_core::workflow::ExecutionMode,
    pub step_count: usize,
}

/// One step of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepView {
    pub name: String,
    pub step_type: String,
    pub depends_on: Vec<String>,
    pub on_error: conveyor_core::step::ErrorPolicy,
}

impl From<&Step> for StepView {
    fn from(step: &Step) -> Self {
        Self {
            name: step.name.clone(),
            step_type: step.step_type.kind().to_string(),
            depends_on: step.depends_on.clone(),
            on_error: step.on_error,
        }
    }
}

/// Full workflow definition view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDetail {
    pub name: String,
    pub mode: conveyor_core::workflow::ExecutionMode,
    pub max_concurrency: usize,
    pub steps: Vec<StepView>,
    pub defaults: JsonMap,
}

impl From<&Workflow> for WorkflowDetail {
    fn from(workflow: &Workflow) -> Self {
        Self {
            name: workflow.name.clone(),
            mode: workflow.policy.mode,
            max_concurrency: workflow.policy.max_concurrency,
            steps: workflow.steps.iter().map(StepView::from).collect(),
            defaults: workflow.defaults.clone(),
        }
    }
}

/// Schedule view with its trigger record history elided.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleView {
    pub schedule_id: Uuid,
    pub name: String,
    pub target_kind: RunKind,
    pub target_name: String,
    pub schedule_type: conveyor_core::schedule::ScheduleKind,
    pub cron_expression: Option<String>,
    pub interval_seconds: Option<u64>,
    pub run_at: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub max_instances: u32,
    pub misfire_grace_seconds: u64,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<String>,
}

impl From<&Schedule> for ScheduleView {
    fn from(schedule: &Schedule) -> Self {
        Self {
            schedule_id: schedule.schedule_id,
            name: schedule.name.clone(),
            target_kind: schedule.target_kind,
            target_name: schedule.target_name.clone(),
            schedule_type: schedule.schedule_type,
            cron_expression: schedule.cron_expression.clone(),
            interval_seconds: schedule.interval_seconds,
            run_at: schedule.run_at,
            enabled: schedule.enabled,
            max_instances: schedule.max_instances,
            misfire_grace_seconds: schedule.misfire_grace_seconds,
            next_run_at: schedule.next_run_at,
            last_run_at: schedule.last_run_at,
            last_run_status: schedule.last_run_status.clone(),
        }
    }
}

/// Readiness certification result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessView {
    pub domain: String,
    pub partition_key: String,
    pub ready: bool,

    /// Stages with a manifest entry
    pub complete_stages: Vec<String>,

    /// Expected stages missing a manifest entry
    pub missing_stages: Vec<String>,

    pub checked_at: DateTime<Utc>,
}
