//! Backfill plans
//!
//! Structured multi-partition recovery with checkpoint resume. A plan's
//! specification fields (domain, source, partition keys, reason) are fixed
//! at creation; the progress fields mutate as partitions complete or fail.
//! Plans auto-complete when every partition is accounted for.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;
use crate::run::JsonMap;

/// Lifecycle status of a backfill plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillStatus {
    Planned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for BackfillStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Planned => "planned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for BackfillStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planned" => Ok(Self::Planned),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown backfill status: {other}")),
        }
    }
}

/// Why a backfill was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillReason {
    Gap,
    Correction,
    QualityFailure,
    SchemaChange,
    Manual,
}

impl std::fmt::Display for BackfillReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Gap => "gap",
            Self::Correction => "correction",
            Self::QualityFailure => "quality_failure",
            Self::SchemaChange => "schema_change",
            Self::Manual => "manual",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for BackfillReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gap" => Ok(Self::Gap),
            "correction" => Ok(Self::Correction),
            "quality_failure" => Ok(Self::QualityFailure),
            "schema_change" => Ok(Self::SchemaChange),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown backfill reason: {other}")),
        }
    }
}

/// Tracks a backfill across a set of partitions with resume support.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillPlan {
    pub plan_id: Uuid,
    pub domain: String,
    pub source: String,

    /// Full list of partitions to process
    pub partition_keys: Vec<String>,

    pub reason: BackfillReason,
    pub status: BackfillStatus,

    pub range_start: Option<String>,
    pub range_end: Option<String>,

    /// Partitions processed successfully
    pub completed_keys: Vec<String>,

    /// Partitions that failed, with error messages
    pub failed_keys: BTreeMap<String, String>,

    /// Opaque resume token (offset, page cursor, timestamp)
    pub checkpoint: Option<String>,

    pub metadata: JsonMap,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_by: String,
}

impl BackfillPlan {
    /// Create a new plan in `Planned` status.
    pub fn create(
        domain: impl Into<String>,
        source: impl Into<String>,
        partition_keys: Vec<String>,
        reason: BackfillReason,
    ) -> Result<Self, CoreError> {
        if partition_keys.is_empty() {
            return Err(CoreError::ValidationFailed(
                "partition_keys must not be empty".to_string(),
            ));
        }
        Ok(Self {
            plan_id: crate::ids::new_run_id(),
            domain: domain.into(),
            source: source.into(),
            partition_keys,
            reason,
            status: BackfillStatus::Planned,
            range_start: None,
            range_end: None,
            completed_keys: Vec::new(),
            failed_keys: BTreeMap::new(),
            checkpoint: None,
            metadata: JsonMap::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            created_by: "system".to_string(),
        })
    }

    pub fn with_range(mut self, start: Option<String>, end: Option<String>) -> Self {
        self.range_start = start;
        self.range_end = end;
        self
    }

    pub fn with_created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = created_by.into();
        self
    }

    pub fn with_metadata(mut self, metadata: JsonMap) -> Self {
        self.metadata = metadata;
        self
    }

    // =========================================================================
    // Progress
    // =========================================================================

    /// Completion percentage, 0.0–100.0, rounded to 2 decimal places.
    pub fn progress_pct(&self) -> f64 {
        let total = self.partition_keys.len();
        if total == 0 {
            return 100.0;
        }
        let done = self.completed_keys.len() + self.failed_keys.len();
        (done as f64 / total as f64 * 10_000.0).round() / 100.0
    }

    /// Partitions not yet completed or failed, in plan order.
    pub fn remaining_keys(&self) -> Vec<String> {
        self.partition_keys
            .iter()
            .filter(|k| {
                !self.completed_keys.contains(k) && !self.failed_keys.contains_key(k.as_str())
            })
            .cloned()
            .collect()
    }

    /// Whether the plan can be resumed after interruption.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self.status,
            BackfillStatus::Running | BackfillStatus::Failed
        ) && !self.remaining_keys().is_empty()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Transition to `Running`. Allowed from `Planned` or `Failed`
    /// (restart after partial failure).
    pub fn start(&mut self) -> Result<(), CoreError> {
        if !matches!(
            self.status,
            BackfillStatus::Planned | BackfillStatus::Failed
        ) {
            return Err(CoreError::Conflict(format!(
                "cannot start backfill plan in status {}",
                self.status
            )));
        }
        self.status = BackfillStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Record a partition as processed. Auto-completes (or fails, if any
    /// partitions failed) once nothing remains.
    pub fn mark_partition_done(&mut self, partition_key: &str) -> Result<(), CoreError> {
        if !self.partition_keys.iter().any(|k| k == partition_key) {
            return Err(CoreError::ValidationFailed(format!(
                "unknown partition_key: {partition_key}"
            )));
        }
        if !self.completed_keys.iter().any(|k| k == partition_key) {
            self.completed_keys.push(partition_key.to_string());
        }
        self.finish_if_done();
        Ok(())
    }

    /// Record a partition as failed.
    pub fn mark_partition_failed(
        &mut self,
        partition_key: &str,
        error: impl Into<String>,
    ) -> Result<(), CoreError> {
        if !self.partition_keys.iter().any(|k| k == partition_key) {
            return Err(CoreError::ValidationFailed(format!(
                "unknown partition_key: {partition_key}"
            )));
        }
        self.failed_keys
            .insert(partition_key.to_string(), error.into());
        self.finish_if_done();
        Ok(())
    }

    /// Persist an opaque resume token.
    pub fn save_checkpoint(&mut self, checkpoint: impl Into<String>) {
        self.checkpoint = Some(checkpoint.into());
    }

    /// Cancel the plan from any non-terminal status.
    pub fn cancel(&mut self) -> Result<(), CoreError> {
        if matches!(
            self.status,
            BackfillStatus::Completed | BackfillStatus::Cancelled
        ) {
            return Err(CoreError::Conflict(format!(
                "cannot cancel backfill plan in status {}",
                self.status
            )));
        }
        self.status = BackfillStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    fn finish_if_done(&mut self) {
        if self.remaining_keys().is_empty() {
            self.status = if self.failed_keys.is_empty() {
                BackfillStatus::Completed
            } else {
                BackfillStatus::Failed
            };
            self.completed_at = Some(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(keys: &[&str]) -> BackfillPlan {
        BackfillPlan::create(
            "finra",
            "otc_transparency",
            keys.iter().map(|k| k.to_string()).collect(),
            BackfillReason::Gap,
        )
        .unwrap()
    }

    #[test]
    fn test_empty_keys_rejected() {
        let err = BackfillPlan::create("d", "s", vec![], BackfillReason::Manual).unwrap_err();
        assert!(matches!(err, CoreError::ValidationFailed(_)));
    }

    #[test]
    fn test_progress_pct() {
        let mut p = plan(&["w1", "w2", "w3"]);
        assert_eq!(p.progress_pct(), 0.0);

        p.start().unwrap();
        p.mark_partition_done("w1").unwrap();
        assert_eq!(p.progress_pct(), 33.33);

        p.mark_partition_failed("w2", "fetch failed").unwrap();
        assert_eq!(p.progress_pct(), 66.67);

        p.mark_partition_done("w3").unwrap();
        assert_eq!(p.progress_pct(), 100.0);
    }

    #[test]
    fn test_auto_complete_on_all_done() {
        let mut p = plan(&["w1", "w2"]);
        p.start().unwrap();
        p.mark_partition_done("w1").unwrap();
        assert_eq!(p.status, BackfillStatus::Running);
        assert!(p.completed_at.is_none());

        p.mark_partition_done("w2").unwrap();
        assert_eq!(p.status, BackfillStatus::Completed);
        assert!(p.completed_at.is_some());
    }

    #[test]
    fn test_auto_fail_when_failures_remain() {
        let mut p = plan(&["w1", "w2"]);
        p.start().unwrap();
        p.mark_partition_done("w1").unwrap();
        p.mark_partition_failed("w2", "boom").unwrap();
        assert_eq!(p.status, BackfillStatus::Failed);
        assert_eq!(p.failed_keys.get("w2").map(String::as_str), Some("boom"));
    }

    #[test]
    fn test_failed_plan_is_resumable_and_restartable() {
        let mut p = plan(&["w1", "w2", "w3"]);
        p.start().unwrap();
        p.mark_partition_failed("w1", "boom").unwrap();
        assert_eq!(p.status, BackfillStatus::Running);

        // Interrupted with work outstanding, then marked failed by caller
        p.status = BackfillStatus::Failed;
        assert!(p.is_resumable());
        assert_eq!(p.remaining_keys(), vec!["w2".to_string(), "w3".to_string()]);

        p.start().unwrap();
        assert_eq!(p.status, BackfillStatus::Running);
    }

    #[test]
    fn test_duplicate_done_is_idempotent() {
        let mut p = plan(&["w1", "w2"]);
        p.start().unwrap();
        p.mark_partition_done("w1").unwrap();
        p.mark_partition_done("w1").unwrap();
        assert_eq!(p.completed_keys.len(), 1);
        assert_eq!(p.status, BackfillStatus::Running);
    }

    #[test]
    fn test_unknown_partition_rejected() {
        let mut p = plan(&["w1"]);
        assert!(p.mark_partition_done("ghost").is_err());
        assert!(p.mark_partition_failed("ghost", "e").is_err());
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let mut p = plan(&["w1"]);
        assert!(p.checkpoint.is_none());
        p.save_checkpoint("offset:1234");
        assert_eq!(p.checkpoint.as_deref(), Some("offset:1234"));
    }

    #[test]
    fn test_cancel_guards() {
        let mut p = plan(&["w1"]);
        p.cancel().unwrap();
        assert_eq!(p.status, BackfillStatus::Cancelled);
        assert!(p.cancel().is_err());
        assert!(p.start().is_err());
    }
}
