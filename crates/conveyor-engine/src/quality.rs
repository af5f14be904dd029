//! Quality gate
//!
//! A run-scoped collector of named checks. `run_all` executes every
//! registered check against the workflow context and records each
//! outcome to `core_quality` under the run's ID; `has_failures` answers
//! from the recorded rows, so separately-recorded results count too.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use conveyor_core::context::WorkflowContext;
use conveyor_core::error::CoreError;
use conveyor_core::quality::{QualityOutcome, QualityRecord, QualityStatus};
use conveyor_storage::CoreStore;

/// A named check over the workflow context.
pub type QualityCheck = dyn Fn(&WorkflowContext) -> QualityOutcome + Send + Sync;

/// Run-scoped quality check collector.
pub struct QualityGate {
    store: Arc<dyn CoreStore>,
    run_id: Uuid,
    checks: Vec<(String, Arc<QualityCheck>)>,
}

impl QualityGate {
    pub fn new(store: Arc<dyn CoreStore>, run_id: Uuid) -> Self {
        Self {
            store,
            run_id,
            checks: Vec::new(),
        }
    }

    /// Register a named check. Checks run in registration order.
    pub fn add<F>(&mut self, name: impl Into<String>, check: F) -> &mut Self
    where
        F: Fn(&WorkflowContext) -> QualityOutcome + Send + Sync + 'static,
    {
        self.checks.push((name.into(), Arc::new(check)));
        self
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Execute all checks, record every outcome, and return the status
    /// per check name.
    pub async fn run_all(
        &self,
        ctx: &WorkflowContext,
        partition_key: Option<&str>,
    ) -> Result<BTreeMap<String, QualityStatus>, CoreError> {
        let mut statuses = BTreeMap::new();
        for (name, check) in &self.checks {
            let outcome = check(ctx);
            debug!(check = %name, status = %outcome.status, "quality check");
            statuses.insert(name.clone(), outcome.status);
            let record = QualityRecord::new(
                self.run_id,
                name.clone(),
                partition_key.map(str::to_string),
                outcome,
                Utc::now(),
            );
            self.store.insert_quality_record(&record).await?;
        }
        Ok(statuses)
    }

    /// True iff any recorded check for this run has FAIL status.
    pub async fn has_failures(&self) -> Result<bool, CoreError> {
        Ok(self.store.run_has_quality_failures(self.run_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::run::JsonMap;
    use conveyor_storage::InMemoryStore;
    use serde_json::json;

    fn ctx() -> WorkflowContext {
        let mut params = JsonMap::new();
        params.insert("records".into(), json!(120));
        WorkflowContext::new(Uuid::now_v7(), "test.wf", params)
    }

    #[tokio::test]
    async fn test_run_all_records_outcomes() {
        let store = Arc::new(InMemoryStore::new());
        let run_id = Uuid::now_v7();
        let mut gate = QualityGate::new(store.clone(), run_id);

        gate.add("row_count_floor", |ctx| {
            let count = ctx.get_param("records").and_then(|v| v.as_i64()).unwrap_or(0);
            if count >= 100 {
                QualityOutcome::pass("row count ok")
            } else {
                QualityOutcome::fail("row count below floor")
                    .with_values(json!(count), json!({"min": 100}))
            }
        });
        gate.add("always_warn", |_| QualityOutcome::warn("heads up"));

        let statuses = gate.run_all(&ctx(), Some("2025-12-26")).await.unwrap();
        assert_eq!(statuses["row_count_floor"], QualityStatus::Pass);
        assert_eq!(statuses["always_warn"], QualityStatus::Warn);
        assert!(!gate.has_failures().await.unwrap());
    }

    #[tokio::test]
    async fn test_failures_detected_after_recording() {
        let store = Arc::new(InMemoryStore::new());
        let run_id = Uuid::now_v7();
        let mut gate = QualityGate::new(store.clone(), run_id);
        gate.add("doomed", |_| QualityOutcome::fail("nope"));

        assert!(!gate.has_failures().await.unwrap());
        let statuses = gate.run_all(&ctx(), None).await.unwrap();
        assert_eq!(statuses["doomed"], QualityStatus::Fail);
        assert!(gate.has_failures().await.unwrap());
    }
}
