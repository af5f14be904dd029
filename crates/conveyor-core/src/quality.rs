//! Quality check outcomes
//!
//! A quality check is a named predicate over a workflow context producing
//! PASS/WARN/FAIL/SKIP plus actual-vs-expected detail. Results are
//! persisted per run in `core_quality`; the gate itself lives in the
//! engine crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Outcome status of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QualityStatus {
    Pass,
    Warn,
    Fail,
    Skip,
}

impl std::fmt::Display for QualityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pass => "PASS",
            Self::Warn => "WARN",
            Self::Fail => "FAIL",
            Self::Skip => "SKIP",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for QualityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PASS" => Ok(Self::Pass),
            "WARN" => Ok(Self::Warn),
            "FAIL" => Ok(Self::Fail),
            "SKIP" => Ok(Self::Skip),
            other => Err(format!("unknown quality status: {other}")),
        }
    }
}

/// Value returned by a quality check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityOutcome {
    pub status: QualityStatus,
    pub message: String,
    pub actual: Option<Value>,
    pub expected: Option<Value>,
}

impl QualityOutcome {
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            status: QualityStatus::Pass,
            message: message.into(),
            actual: None,
            expected: None,
        }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            status: QualityStatus::Warn,
            message: message.into(),
            actual: None,
            expected: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            status: QualityStatus::Fail,
            message: message.into(),
            actual: None,
            expected: None,
        }
    }

    pub fn skip(message: impl Into<String>) -> Self {
        Self {
            status: QualityStatus::Skip,
            message: message.into(),
            actual: None,
            expected: None,
        }
    }

    pub fn with_values(mut self, actual: Value, expected: Value) -> Self {
        self.actual = Some(actual);
        self.expected = Some(expected);
        self
    }
}

/// A persisted check result row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityRecord {
    pub id: Uuid,

    /// The run that executed the check
    pub run_id: Uuid,

    pub check_name: String,
    pub partition_key: Option<String>,
    pub status: QualityStatus,
    pub message: String,
    pub actual: Option<Value>,
    pub expected: Option<Value>,
    pub recorded_at: DateTime<Utc>,
}

impl QualityRecord {
    pub fn new(
        run_id: Uuid,
        check_name: impl Into<String>,
        partition_key: Option<String>,
        outcome: QualityOutcome,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: crate::ids::new_run_id(),
            run_id,
            check_name: check_name.into(),
            partition_key,
            status: outcome.status,
            message: outcome.message,
            actual: outcome.actual,
            expected: outcome.expected,
            recorded_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_round_trip() {
        for status in [
            QualityStatus::Pass,
            QualityStatus::Warn,
            QualityStatus::Fail,
            QualityStatus::Skip,
        ] {
            let parsed: QualityStatus = status.to_string().parse().unwrap();
            assert_eq!(status, parsed);
        }
    }

    #[test]
    fn test_status_serializes_uppercase() {
        let json = serde_json::to_string(&QualityStatus::Fail).unwrap();
        assert_eq!(json, "\"FAIL\"");
    }

    #[test]
    fn test_outcome_with_values() {
        let outcome = QualityOutcome::fail("row count below floor")
            .with_values(json!(12), json!({"min": 100}));
        assert_eq!(outcome.status, QualityStatus::Fail);
        assert_eq!(outcome.actual, Some(json!(12)));
        assert_eq!(outcome.expected, Some(json!({"min": 100})));
    }

    #[test]
    fn test_record_from_outcome() {
        let run_id = Uuid::now_v7();
        let record = QualityRecord::new(
            run_id,
            "row_count_floor",
            Some("2025-12-26".to_string()),
            QualityOutcome::pass("ok"),
            Utc::now(),
        );
        assert_eq!(record.run_id, run_id);
        assert_eq!(record.status, QualityStatus::Pass);
        assert_eq!(record.partition_key.as_deref(), Some("2025-12-26"));
    }
}
