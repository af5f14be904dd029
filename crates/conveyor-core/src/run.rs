//! Runs and work submissions
//!
//! A [`Run`] is the single unit of observable execution: a task, a
//! workflow, or an operation spawned by a workflow step. Runs are created
//! from a [`WorkSpec`] by the dispatcher, move through a monotonic status
//! lifecycle, and carry lineage links (parent, correlation, batch, retry).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RunError;

/// Free-form JSON object used for params, results, and metadata.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// What sort of work a run represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    /// A standalone handler invocation
    Task,

    /// A named multi-stage pipeline handler
    Pipeline,

    /// A registered workflow definition
    Workflow,

    /// A single step tracked as its own run
    Step,

    /// A handler invoked from a workflow operation step
    Operation,
}

impl std::fmt::Display for RunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Task => "task",
            Self::Pipeline => "pipeline",
            Self::Workflow => "workflow",
            Self::Step => "step",
            Self::Operation => "operation",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RunKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(Self::Task),
            "pipeline" => Ok(Self::Pipeline),
            "workflow" => Ok(Self::Workflow),
            "step" => Ok(Self::Step),
            "operation" => Ok(Self::Operation),
            other => Err(format!("unknown run kind: {other}")),
        }
    }
}

/// Run lifecycle status.
///
/// Transitions are monotonic along
/// `pending → queued → running → {completed, failed, cancelled}`, with
/// `failed → dead_lettered` as the only transition out of a terminal
/// state. Heartbeats are events, not transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    DeadLettered,
}

impl RunStatus {
    /// Whether this status ends the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::DeadLettered
        )
    }

    /// Whether a transition to `next` is allowed.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        if *self == next {
            return false;
        }
        match (self, next) {
            (Self::Failed, Self::DeadLettered) => true,
            (_, Self::DeadLettered) => false,
            _ => !self.is_terminal() && self.rank() < next.rank(),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Queued => 1,
            Self::Running => 2,
            Self::Completed | Self::Failed | Self::Cancelled => 3,
            Self::DeadLettered => 4,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::DeadLettered => "dead_lettered",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "dead_lettered" => Ok(Self::DeadLettered),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Execution priority, used as a queue ordering hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Realtime,
    High,
    Normal,
    Low,
    Slow,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Realtime => "realtime",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
            Self::Slow => "slow",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "realtime" => Ok(Self::Realtime),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            "slow" => Ok(Self::Slow),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// What to do when a submission's idempotency key matches a run that
/// already failed or was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Create a fresh run linked via `retry_of_run_id` (default)
    NewAttempt,

    /// Return the terminal run unchanged
    ReturnExisting,
}

impl Default for DuplicatePolicy {
    fn default() -> Self {
        Self::NewAttempt
    }
}

/// A single observed execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    pub kind: RunKind,
    pub name: String,
    pub params: JsonMap,
    pub status: RunStatus,
    pub lane: String,
    pub priority: Priority,
    pub parent_run_id: Option<Uuid>,
    pub correlation_id: Option<String>,
    pub batch_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub retry_of_run_id: Option<Uuid>,

    /// 1-based attempt counter across retry-linked runs
    pub attempt: u32,

    /// Retry budget; a run whose attempt exceeds this dead-letters on failure
    pub max_retries: u32,

    /// Base delay between retry attempts
    pub retry_delay_seconds: u64,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Present on success
    pub result: Option<JsonMap>,

    /// Present on failure
    pub error: Option<RunError>,

    pub metadata: JsonMap,
}

impl Run {
    /// Whether the run has reached a terminal status with `finished_at` set.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Duration in seconds, if both endpoints are known.
    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

/// A typed work submission, turned into a durable [`Run`] by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkSpec {
    pub kind: RunKind,
    pub name: String,
    pub params: JsonMap,
    pub lane: String,
    pub priority: Priority,
    pub idempotency_key: Option<String>,
    pub parent_run_id: Option<Uuid>,
    pub correlation_id: Option<String>,
    pub batch_id: Option<String>,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub metadata: JsonMap,

    /// Behavior when the idempotency key matches a failed/cancelled run
    #[serde(default)]
    pub on_terminal_duplicate: DuplicatePolicy,
}

impl WorkSpec {
    /// New spec with defaults for everything but kind and name.
    pub fn new(kind: RunKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            params: JsonMap::new(),
            lane: "default".to_string(),
            priority: Priority::default(),
            idempotency_key: None,
            parent_run_id: None,
            correlation_id: None,
            batch_id: None,
            max_retries: 0,
            retry_delay_seconds: 30,
            metadata: JsonMap::new(),
            on_terminal_duplicate: DuplicatePolicy::default(),
        }
    }

    /// Shorthand for a task submission.
    pub fn task(name: impl Into<String>) -> Self {
        Self::new(RunKind::Task, name)
    }

    /// Shorthand for a workflow submission.
    pub fn workflow(name: impl Into<String>) -> Self {
        Self::new(RunKind::Workflow, name)
    }

    pub fn with_params(mut self, params: JsonMap) -> Self {
        self.params = params;
        self
    }

    pub fn with_param(
        mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_lane(mut self, lane: impl Into<String>) -> Self {
        self.lane = lane.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_parent(mut self, parent_run_id: Uuid) -> Self {
        self.parent_run_id = Some(parent_run_id);
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_batch_id(mut self, id: impl Into<String>) -> Self {
        self.batch_id = Some(id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, seconds: u64) -> Self {
        self.retry_delay_seconds = seconds;
        self
    }

    pub fn with_metadata(mut self, metadata: JsonMap) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn on_terminal_duplicate(mut self, policy: DuplicatePolicy) -> Self {
        self.on_terminal_duplicate = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_forward_only() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Queued));
        assert!(RunStatus::Queued.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Completed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Failed));
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Cancelled));

        assert!(!RunStatus::Running.can_transition_to(RunStatus::Queued));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Running));
    }

    #[test]
    fn test_only_failed_runs_dead_letter() {
        assert!(RunStatus::Failed.can_transition_to(RunStatus::DeadLettered));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::DeadLettered));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::DeadLettered));
        assert!(!RunStatus::Cancelled.can_transition_to(RunStatus::DeadLettered));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(RunStatus::DeadLettered.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            RunStatus::Pending,
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
            RunStatus::DeadLettered,
        ] {
            let parsed: RunStatus = status.to_string().parse().unwrap();
            assert_eq!(status, parsed);
        }
    }

    #[test]
    fn test_workspec_builder() {
        let spec = WorkSpec::task("finra.otc.ingest_week")
            .with_param("tier", serde_json::json!("OTC"))
            .with_idempotency_key("ingest:OTC:2025-12-26")
            .with_max_retries(2)
            .with_lane("ingest");

        assert_eq!(spec.kind, RunKind::Task);
        assert_eq!(spec.lane, "ingest");
        assert_eq!(spec.max_retries, 2);
        assert_eq!(
            spec.idempotency_key.as_deref(),
            Some("ingest:OTC:2025-12-26")
        );
        assert_eq!(spec.on_terminal_duplicate, DuplicatePolicy::NewAttempt);
    }
}
