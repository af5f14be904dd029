//! Data-readiness records
//!
//! Rows supporting the readiness model around the watermark store:
//! stage-completion manifests, per-record rejects, static calc
//! dependencies, SLA-tracking expected schedules, and readiness
//! certifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run::JsonMap;

/// Stage-completion marker for a `(domain, partition_key, stage)` triple.
/// Upserted on advance; the latest completion wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub domain: String,
    pub partition_key: String,
    pub stage: String,
    pub completed_at: DateTime<Utc>,
    pub run_id: Option<Uuid>,
    pub metadata: JsonMap,
}

/// Per-record rejection written during ingest or quality checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectRecord {
    pub id: Uuid,
    pub run_id: Option<Uuid>,
    pub stage: String,
    pub reason_code: String,

    /// The offending record, as far as it could be parsed
    pub detail: serde_json::Value,

    pub rejected_at: DateTime<Utc>,
}

impl RejectRecord {
    pub fn new(
        stage: impl Into<String>,
        reason_code: impl Into<String>,
        detail: serde_json::Value,
    ) -> Self {
        Self {
            id: crate::ids::new_run_id(),
            run_id: None,
            stage: stage.into(),
            reason_code: reason_code.into(),
            detail,
            rejected_at: Utc::now(),
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

/// Static declaration that a calculation depends on an upstream
/// domain/workflow pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalcDependency {
    pub id: Uuid,
    pub calc_name: String,
    pub upstream_domain: String,
    pub upstream_workflow: String,
    pub created_at: DateTime<Utc>,
}

impl CalcDependency {
    pub fn new(
        calc_name: impl Into<String>,
        upstream_domain: impl Into<String>,
        upstream_workflow: impl Into<String>,
    ) -> Self {
        Self {
            id: crate::ids::new_run_id(),
            calc_name: calc_name.into(),
            upstream_domain: upstream_domain.into(),
            upstream_workflow: upstream_workflow.into(),
            created_at: Utc::now(),
        }
    }
}

/// Expected cadence for a domain workflow, used for SLA tracking and
/// data-driven (rather than blind-timer) scheduling decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedSchedule {
    pub id: Uuid,
    pub domain: String,
    pub workflow: String,
    pub schedule_type: String,
    pub cron_expression: Option<String>,

    /// Template for the partition each firing should produce,
    /// e.g. `{date}` or `{year}-W{week}`
    pub partition_template: Option<String>,

    /// Hours after the boundary before data is considered late
    pub expected_delay_hours: u32,

    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Readiness certification for a domain partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataReadiness {
    pub id: Uuid,
    pub domain: String,
    pub partition_key: String,

    /// Stage the certification covers
    pub stage: String,

    pub ready: bool,
    pub certified_at: Option<DateTime<Utc>>,
    pub checked_at: DateTime<Utc>,
    pub metadata: JsonMap,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reject_record_builder() {
        let run_id = Uuid::now_v7();
        let reject = RejectRecord::new("parse", "bad_decimal", json!({"line": 42}))
            .with_run_id(run_id);
        assert_eq!(reject.stage, "parse");
        assert_eq!(reject.run_id, Some(run_id));
        assert_eq!(reject.detail["line"], json!(42));
    }

    #[test]
    fn test_manifest_serialization() {
        let entry = ManifestEntry {
            domain: "finra".to_string(),
            partition_key: "2025-12-26".to_string(),
            stage: "ingest".to_string(),
            completed_at: Utc::now(),
            run_id: None,
            metadata: JsonMap::new(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        let parsed: ManifestEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(entry, parsed);
    }
}
