//! Anomaly recorder
//!
//! Structured issue log with severity, category, and resolution
//! tracking. Recording is observational — nothing blocks on an anomaly
//! unless a handler chooses to inspect them (`has_recent_critical` is
//! the usual gate).

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use conveyor_core::anomaly::{Anomaly, Severity};
use conveyor_core::error::CoreError;
use conveyor_core::run::JsonMap;
use conveyor_storage::{AnomalyFilter, CoreStore};

/// Records and queries anomalies.
#[derive(Clone)]
pub struct AnomalyRecorder {
    store: Arc<dyn CoreStore>,
}

impl AnomalyRecorder {
    pub fn new(store: Arc<dyn CoreStore>) -> Self {
        Self { store }
    }

    /// Record an anomaly; returns its ID.
    pub async fn record(
        &self,
        stage: &str,
        partition_key: Option<&str>,
        severity: Severity,
        category: &str,
        message: &str,
        metadata: Option<JsonMap>,
        run_id: Option<Uuid>,
    ) -> Result<Uuid, CoreError> {
        let mut anomaly = Anomaly::new(stage, severity, category, message);
        if let Some(partition_key) = partition_key {
            anomaly = anomaly.with_partition_key(partition_key);
        }
        if let Some(metadata) = metadata {
            anomaly = anomaly.with_metadata(metadata);
        }
        if let Some(run_id) = run_id {
            anomaly = anomaly.with_run_id(run_id);
        }
        let anomaly_id = anomaly.anomaly_id;
        self.store.insert_anomaly(&anomaly).await?;
        Ok(anomaly_id)
    }

    /// Mark resolved. Returns `false` for unknown or already-resolved IDs.
    pub async fn resolve(
        &self,
        anomaly_id: Uuid,
        resolution_note: Option<&str>,
    ) -> Result<bool, CoreError> {
        Ok(self
            .store
            .resolve_anomaly(anomaly_id, resolution_note, Utc::now())
            .await?)
    }

    pub async fn list_unresolved(
        &self,
        filter: &AnomalyFilter,
        limit: u32,
    ) -> Result<Vec<Anomaly>, CoreError> {
        Ok(self.store.list_unresolved_anomalies(filter, limit).await?)
    }

    /// Unresolved counts per severity over the trailing window.
    pub async fn count_by_severity(
        &self,
        since_hours: u32,
    ) -> Result<Vec<(Severity, u64)>, CoreError> {
        let since = Utc::now() - Duration::hours(since_hours as i64);
        Ok(self.store.count_anomalies_by_severity(since).await?)
    }

    /// Whether any unresolved CRITICAL anomaly was detected in the
    /// trailing window.
    pub async fn has_recent_critical(&self, since_hours: u32) -> Result<bool, CoreError> {
        let counts = self.count_by_severity(since_hours).await?;
        Ok(counts
            .iter()
            .any(|(severity, count)| *severity == Severity::Critical && *count > 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_storage::InMemoryStore;

    fn recorder() -> AnomalyRecorder {
        AnomalyRecorder::new(Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn test_record_and_resolve() {
        let recorder = recorder();
        let id = recorder
            .record(
                "ingest",
                Some("2025-12-26"),
                Severity::Error,
                "row_count",
                "file shorter than expected",
                None,
                None,
            )
            .await
            .unwrap();

        let unresolved = recorder
            .list_unresolved(&AnomalyFilter::default(), 10)
            .await
            .unwrap();
        assert_eq!(unresolved.len(), 1);

        assert!(recorder.resolve(id, Some("backfilled")).await.unwrap());
        assert!(!recorder.resolve(id, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_recent_critical_detection() {
        let recorder = recorder();
        assert!(!recorder.has_recent_critical(24).await.unwrap());

        recorder
            .record("calc", None, Severity::Critical, "schema_drift", "boom", None, None)
            .await
            .unwrap();
        assert!(recorder.has_recent_critical(24).await.unwrap());

        let counts = recorder.count_by_severity(24).await.unwrap();
        assert_eq!(counts, vec![(Severity::Critical, 1)]);
    }
}
