//! Run ledger events
//!
//! Events form the append-only log for a run. They are used for:
//! - Persisting execution progress
//! - Replay and audit of a run's lifecycle
//! - Diagnostics (secondary scan by event type)
//!
//! Events are immutable once written. The run's status column is a
//! denormalized cache over this ledger; readers may observe events before
//! the corresponding status update and must tolerate that.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorCategory, RunError};
use crate::run::JsonMap;

/// Events stored in the `core_execution_events` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    // =========================================================================
    // Run lifecycle
    // =========================================================================
    /// Run row was created
    Created {
        /// Run kind as submitted
        kind: String,

        /// Handler or workflow name
        name: String,
    },

    /// Run was handed to the executor queue
    Queued {
        /// Queue lane
        lane: String,
    },

    /// Execution began
    Started {
        /// 1-based attempt number
        attempt: u32,
    },

    /// Periodic progress / heartbeat
    Progress {
        message: String,

        #[serde(default)]
        data: JsonMap,
    },

    /// Run completed successfully
    Completed {
        /// Result payload
        result: JsonMap,
    },

    /// Run failed terminally (for this attempt)
    Failed {
        error: String,
        category: ErrorCategory,
        retryable: bool,
    },

    /// Run was cancelled
    Cancelled {
        reason: String,
    },

    /// Terminal failure was captured in the dead-letter queue
    DeadLettered {
        dead_letter_id: Uuid,
    },

    // =========================================================================
    // Step lifecycle (workflow runs)
    // =========================================================================
    /// A workflow step began
    StepStarted {
        step: String,
        step_type: String,
        attempt: u32,
    },

    /// A workflow step finished successfully
    StepCompleted {
        step: String,
        duration_ms: u64,
    },

    /// A workflow step failed
    StepFailed {
        step: String,
        error: String,
        category: ErrorCategory,
        retryable: bool,
    },

    /// A workflow step was skipped (branching, start_from, failed deps)
    StepSkipped {
        step: String,
        reason: String,
    },
}

impl RunEvent {
    /// Snake-case name used for the event_type column and type scans.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Queued { .. } => "queued",
            Self::Started { .. } => "started",
            Self::Progress { .. } => "progress",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled { .. } => "cancelled",
            Self::DeadLettered { .. } => "dlq",
            Self::StepStarted { .. } => "step_started",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::StepSkipped { .. } => "step_skipped",
        }
    }

    /// Whether this event ends the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled { .. }
        )
    }

    /// The step name, if this is a step-scoped event.
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::StepStarted { step, .. }
            | Self::StepCompleted { step, .. }
            | Self::StepFailed { step, .. }
            | Self::StepSkipped { step, .. } => Some(step),
            _ => None,
        }
    }

    /// Failure event from a structured error.
    pub fn failed(error: &RunError) -> Self {
        Self::Failed {
            error: error.message.clone(),
            category: error.category,
            retryable: error.retryable,
        }
    }

    /// Step-failure event from a structured error.
    pub fn step_failed(step: impl Into<String>, error: &RunError) -> Self {
        Self::StepFailed {
            step: step.into(),
            error: error.message.clone(),
            category: error.category,
            retryable: error.retryable,
        }
    }
}

/// A persisted event, as read back from the ledger.
///
/// `event_id` is assigned by the store and is monotone within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: i64,
    pub run_id: Uuid,
    pub event_type: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    /// Decode the payload back into a typed [`RunEvent`].
    pub fn decode(&self) -> Result<RunEvent, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serialization() {
        let event = RunEvent::Created {
            kind: "task".to_string(),
            name: "finra.otc.ingest_week".to_string(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"created\""));

        let parsed: RunEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn test_event_type_names() {
        assert_eq!(
            RunEvent::Queued { lane: "default".into() }.event_type(),
            "queued"
        );
        assert_eq!(
            RunEvent::DeadLettered { dead_letter_id: Uuid::nil() }.event_type(),
            "dlq"
        );
        assert_eq!(
            RunEvent::StepCompleted { step: "a".into(), duration_ms: 5 }.event_type(),
            "step_completed"
        );
    }

    #[test]
    fn test_is_terminal() {
        assert!(RunEvent::Completed { result: JsonMap::new() }.is_terminal());
        assert!(RunEvent::Cancelled { reason: "user".into() }.is_terminal());
        assert!(!RunEvent::Started { attempt: 1 }.is_terminal());
        assert!(!RunEvent::StepFailed {
            step: "x".into(),
            error: "e".into(),
            category: ErrorCategory::Unknown,
            retryable: true,
        }
        .is_terminal());
    }

    #[test]
    fn test_step_extraction() {
        let event = RunEvent::StepStarted {
            step: "ingest".into(),
            step_type: "operation".into(),
            attempt: 1,
        };
        assert_eq!(event.step(), Some("ingest"));
        assert_eq!(RunEvent::Started { attempt: 1 }.step(), None);
    }

    #[test]
    fn test_record_decode() {
        let event = RunEvent::Progress {
            message: "halfway".into(),
            data: JsonMap::new(),
        };
        let record = EventRecord {
            event_id: 3,
            run_id: Uuid::now_v7(),
            event_type: event.event_type().to_string(),
            data: serde_json::to_value(&event).unwrap(),
            timestamp: Utc::now(),
        };
        assert_eq!(record.decode().unwrap(), event);
    }

    #[test]
    fn test_failed_from_run_error() {
        let err = RunError::categorized("gate failed", ErrorCategory::QualityGate);
        let event = RunEvent::failed(&err);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["category"], json!("quality_gate"));
        assert_eq!(json["retryable"], json!(true));
    }
}
