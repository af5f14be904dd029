//! Anomaly records
//!
//! Structured observational issues with severity and resolution tracking.
//! Anomalies never block a run by themselves; handlers decide whether to
//! inspect them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run::JsonMap;

/// Severity ladder, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// A recorded observational issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub anomaly_id: Uuid,

    /// Pipeline stage where the issue was observed
    pub stage: String,

    pub partition_key: Option<String>,
    pub severity: Severity,

    /// Free-form category, e.g. "row_count", "schema_drift"
    pub category: String,

    pub message: String,
    pub metadata: JsonMap,

    /// Run that recorded the anomaly, when known
    pub run_id: Option<Uuid>,

    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_note: Option<String>,
}

impl Anomaly {
    pub fn new(
        stage: impl Into<String>,
        severity: Severity,
        category: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            anomaly_id: crate::ids::new_run_id(),
            stage: stage.into(),
            partition_key: None,
            severity,
            category: category.into(),
            message: message.into(),
            metadata: JsonMap::new(),
            run_id: None,
            detected_at: Utc::now(),
            resolved_at: None,
            resolution_note: None,
        }
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_metadata(mut self, metadata: JsonMap) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Debug < Severity::Info);
        assert!(Severity::Warn < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
    }

    #[test]
    fn test_severity_round_trip() {
        for sev in [
            Severity::Debug,
            Severity::Info,
            Severity::Warn,
            Severity::Error,
            Severity::Critical,
        ] {
            let parsed: Severity = sev.to_string().parse().unwrap();
            assert_eq!(sev, parsed);
        }
    }

    #[test]
    fn test_anomaly_builder() {
        let run_id = Uuid::now_v7();
        let anomaly = Anomaly::new("ingest", Severity::Error, "row_count", "short file")
            .with_partition_key("2025-12-26")
            .with_run_id(run_id);

        assert_eq!(anomaly.stage, "ingest");
        assert_eq!(anomaly.run_id, Some(run_id));
        assert!(!anomaly.is_resolved());
    }
}
