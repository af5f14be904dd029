//! Workflow execution results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use conveyor_core::error::RunError;
use conveyor_core::run::JsonMap;

/// Final status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunStatus {
    Running,
    Completed,

    /// A STOP-policy step failed
    Failed,

    /// All failures carried CONTINUE policy; the rest completed
    Partial,

    Cancelled,
}

impl std::fmt::Display for WorkflowRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Partial => "partial",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Per-step outcome within a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRunStatus {
    Completed,
    Failed,
    Skipped,
}

/// Execution record for a single step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_name: String,
    pub step_type: String,
    pub status: StepRunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: Option<JsonMap>,
    pub error: Option<RunError>,
    pub attempt: u32,
}

impl StepExecution {
    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

/// Outcome of a workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_name: String,
    pub run_id: Uuid,
    pub status: WorkflowRunStatus,
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub skipped_steps: Vec<String>,

    /// The STOP-policy step that halted the workflow
    pub error_step: Option<String>,
    pub error: Option<String>,

    pub step_executions: Vec<StepExecution>,

    /// Serialized context (params + outputs) at completion
    pub context_snapshot: serde_json::Value,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl WorkflowResult {
    pub fn duration_seconds(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    pub fn is_success(&self) -> bool {
        self.status == WorkflowRunStatus::Completed
    }

    /// Result payload stored on the run row.
    pub fn to_run_result(&self) -> JsonMap {
        serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WorkflowResult {
        let now = Utc::now();
        WorkflowResult {
            workflow_name: "test.wf".to_string(),
            run_id: Uuid::now_v7(),
            status: WorkflowRunStatus::Completed,
            completed_steps: vec!["a".to_string(), "b".to_string()],
            failed_steps: vec![],
            skipped_steps: vec![],
            error_step: None,
            error: None,
            step_executions: vec![StepExecution {
                step_name: "a".to_string(),
                step_type: "lambda".to_string(),
                status: StepRunStatus::Completed,
                started_at: Some(now),
                finished_at: Some(now),
                output: Some(JsonMap::new()),
                error: None,
                attempt: 1,
            }],
            context_snapshot: serde_json::json!({}),
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn test_json_round_trip() {
        let result = sample();
        let json = serde_json::to_string(&result).unwrap();
        let parsed: WorkflowResult = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.workflow_name, result.workflow_name);
        assert_eq!(parsed.status, result.status);
        assert_eq!(parsed.completed_steps, result.completed_steps);
        assert_eq!(parsed.step_executions.len(), 1);
    }

    #[test]
    fn test_run_result_map_contains_status() {
        let map = sample().to_run_result();
        assert_eq!(
            map.get("status").and_then(|v| v.as_str()),
            Some("completed")
        );
    }

    #[test]
    fn test_step_duration_none_when_incomplete() {
        let exec = StepExecution {
            step_name: "s".to_string(),
            step_type: "lambda".to_string(),
            status: StepRunStatus::Failed,
            started_at: Some(Utc::now()),
            finished_at: None,
            output: None,
            error: None,
            attempt: 1,
        };
        assert!(exec.duration_ms().is_none());
    }
}
