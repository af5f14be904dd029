//! Backfill planner service
//!
//! Persists backfill plans and applies their lifecycle transitions. The
//! planner records progress; it never executes partitions itself — an
//! executing handler iterates `remaining_keys` and reports back through
//! `mark_partition_done` / `mark_partition_failed`.

use std::sync::Arc;

use uuid::Uuid;

use conveyor_core::backfill::{BackfillPlan, BackfillReason};
use conveyor_core::error::CoreError;
use conveyor_core::run::JsonMap;
use conveyor_storage::{CoreStore, Page, Pagination};

/// Structured multi-partition recovery with checkpoint resume.
#[derive(Clone)]
pub struct BackfillPlanner {
    store: Arc<dyn CoreStore>,
}

impl BackfillPlanner {
    pub fn new(store: Arc<dyn CoreStore>) -> Self {
        Self { store }
    }

    /// Create a plan in `Planned` status.
    pub async fn create(
        &self,
        domain: &str,
        source: &str,
        partition_keys: Vec<String>,
        reason: BackfillReason,
        range: Option<(String, String)>,
        metadata: Option<JsonMap>,
    ) -> Result<BackfillPlan, CoreError> {
        let mut plan = BackfillPlan::create(domain, source, partition_keys, reason)?;
        if let Some((start, end)) = range {
            plan = plan.with_range(Some(start), Some(end));
        }
        if let Some(metadata) = metadata {
            plan = plan.with_metadata(metadata);
        }
        self.store.insert_backfill_plan(&plan).await?;
        Ok(plan)
    }

    pub async fn get(&self, plan_id: Uuid) -> Result<Option<BackfillPlan>, CoreError> {
        Ok(self.store.get_backfill_plan(plan_id).await?)
    }

    pub async fn list(
        &self,
        domain: Option<&str>,
        page: Pagination,
    ) -> Result<Page<BackfillPlan>, CoreError> {
        Ok(self.store.list_backfill_plans(domain, page).await?)
    }

    /// Transition to `Running` (from `Planned` or `Failed`).
    pub async fn start(&self, plan_id: Uuid) -> Result<BackfillPlan, CoreError> {
        self.mutate(plan_id, |plan| plan.start()).await
    }

    /// Record a successful partition; auto-completes the plan when all
    /// partitions are accounted for.
    pub async fn mark_partition_done(
        &self,
        plan_id: Uuid,
        partition_key: &str,
    ) -> Result<BackfillPlan, CoreError> {
        self.mutate(plan_id, |plan| plan.mark_partition_done(partition_key))
            .await
    }

    /// Record a failed partition.
    pub async fn mark_partition_failed(
        &self,
        plan_id: Uuid,
        partition_key: &str,
        error: &str,
    ) -> Result<BackfillPlan, CoreError> {
        self.mutate(plan_id, |plan| plan.mark_partition_failed(partition_key, error))
            .await
    }

    /// Persist an opaque resume token.
    pub async fn save_checkpoint(
        &self,
        plan_id: Uuid,
        checkpoint: &str,
    ) -> Result<BackfillPlan, CoreError> {
        self.mutate(plan_id, |plan| {
            plan.save_checkpoint(checkpoint);
            Ok(())
        })
        .await
    }

    pub async fn cancel(&self, plan_id: Uuid) -> Result<BackfillPlan, CoreError> {
        self.mutate(plan_id, |plan| plan.cancel()).await
    }

    async fn mutate<F>(&self, plan_id: Uuid, apply: F) -> Result<BackfillPlan, CoreError>
    where
        F: FnOnce(&mut BackfillPlan) -> Result<(), CoreError>,
    {
        let mut plan = self
            .store
            .get_backfill_plan(plan_id)
            .await?
            .ok_or_else(|| CoreError::not_found("backfill_plan", plan_id.to_string()))?;
        apply(&mut plan)?;
        self.store.update_backfill_plan(&plan).await?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::backfill::BackfillStatus;
    use conveyor_storage::InMemoryStore;

    fn planner() -> BackfillPlanner {
        BackfillPlanner::new(Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn test_full_lifecycle_persists() {
        let planner = planner();
        let plan = planner
            .create(
                "finra",
                "otc_transparency",
                vec!["w1".to_string(), "w2".to_string()],
                BackfillReason::Gap,
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(plan.status, BackfillStatus::Planned);

        planner.start(plan.plan_id).await.unwrap();
        planner
            .save_checkpoint(plan.plan_id, "offset:100")
            .await
            .unwrap();
        planner.mark_partition_done(plan.plan_id, "w1").await.unwrap();
        let done = planner.mark_partition_done(plan.plan_id, "w2").await.unwrap();
        assert_eq!(done.status, BackfillStatus::Completed);
        assert_eq!(done.progress_pct(), 100.0);

        let loaded = planner.get(plan.plan_id).await.unwrap().unwrap();
        assert_eq!(loaded.checkpoint.as_deref(), Some("offset:100"));
        assert_eq!(loaded.status, BackfillStatus::Completed);
    }

    #[tokio::test]
    async fn test_failed_partitions_fail_the_plan() {
        let planner = planner();
        let plan = planner
            .create(
                "finra",
                "otc_transparency",
                vec!["w1".to_string()],
                BackfillReason::QualityFailure,
                None,
                None,
            )
            .await
            .unwrap();

        planner.start(plan.plan_id).await.unwrap();
        let failed = planner
            .mark_partition_failed(plan.plan_id, "w1", "fetch 503")
            .await
            .unwrap();
        assert_eq!(failed.status, BackfillStatus::Failed);

        // A failed plan can be restarted for the remaining work
        let err = planner.mark_partition_done(plan.plan_id, "ghost").await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_unknown_plan_is_not_found() {
        let planner = planner();
        let err = planner.start(Uuid::now_v7()).await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}
