//! Dead-letter entries
//!
//! Terminal failures land here for operator review and replay. Entries
//! are never deleted by replay — `replayed_as_run_id` keeps the audit
//! trail intact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorCategory;
use crate::run::{JsonMap, Run, RunKind};

/// A captured terminal failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,

    /// The run whose failure was captured
    pub origin_run_id: Uuid,

    pub kind: RunKind,

    /// Workflow or handler name
    pub name: String,

    /// Params needed to resubmit
    pub params: JsonMap,

    pub error: String,
    pub category: ErrorCategory,

    /// Attempts consumed before dead-lettering
    pub retry_count: u32,
    pub max_retries: u32,

    pub created_at: DateTime<Utc>,

    /// Set when the entry has been replayed
    pub replayed_as_run_id: Option<Uuid>,
    pub replayed_at: Option<DateTime<Utc>>,
}

impl DeadLetter {
    /// Build an entry from a failed run.
    pub fn from_run(run: &Run, now: DateTime<Utc>) -> Self {
        let (error, category) = match &run.error {
            Some(err) => (err.message.clone(), err.category),
            None => ("unknown failure".to_string(), ErrorCategory::Unknown),
        };
        Self {
            id: crate::ids::new_run_id(),
            origin_run_id: run.run_id,
            kind: run.kind,
            name: run.name.clone(),
            params: run.params.clone(),
            error,
            category,
            retry_count: run.attempt,
            max_retries: run.max_retries,
            created_at: now,
            replayed_as_run_id: None,
            replayed_at: None,
        }
    }

    pub fn is_replayed(&self) -> bool {
        self.replayed_as_run_id.is_some()
    }
}
