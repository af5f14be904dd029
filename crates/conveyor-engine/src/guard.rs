//! Concurrency guard
//!
//! Lease-based mutual exclusion over the `core_concurrency_locks` table.
//! A lease either inserts (acquired) or conflicts (refused); acquisition
//! never blocks. Expired leases are reaped inside the acquire
//! transaction, so a crashed owner cannot wedge a key past its TTL.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use conveyor_core::error::CoreError;
use conveyor_core::ids::partition_hash;
use conveyor_core::lease::Lease;
use conveyor_core::run::JsonMap;
use conveyor_storage::CoreStore;

/// Lease-based distributed lock manager.
#[derive(Clone)]
pub struct ConcurrencyGuard {
    store: Arc<dyn CoreStore>,
    default_ttl_seconds: u64,
}

impl ConcurrencyGuard {
    pub fn new(store: Arc<dyn CoreStore>, default_ttl_seconds: u64) -> Self {
        Self {
            store,
            default_ttl_seconds,
        }
    }

    /// Lock key for a workflow partition:
    /// `workflow:<name>:<hash of the named params>`.
    pub fn workflow_lock_key(
        workflow: &str,
        params: &JsonMap,
        partition_params: &[String],
    ) -> String {
        format!(
            "workflow:{workflow}:{}",
            partition_hash(params, partition_params)
        )
    }

    /// Try to acquire a lease. Returns `false` if another owner holds an
    /// unexpired lease on the key.
    pub async fn acquire(
        &self,
        lock_key: &str,
        owner: &str,
        ttl_seconds: Option<u64>,
    ) -> Result<bool, CoreError> {
        let ttl = ttl_seconds.unwrap_or(self.default_ttl_seconds);
        let acquired = self
            .store
            .acquire_lease(lock_key, owner, ttl, Utc::now())
            .await?;
        debug!(%lock_key, %owner, acquired, "lease acquire");
        Ok(acquired)
    }

    /// Release a lease held by `owner`. Returns `false` (not an error)
    /// when the lease was already released or held by someone else.
    pub async fn release(&self, lock_key: &str, owner: &str) -> Result<bool, CoreError> {
        Ok(self.store.release_lease(lock_key, owner).await?)
    }

    pub async fn list(&self) -> Result<Vec<Lease>, CoreError> {
        Ok(self.store.list_leases().await?)
    }

    /// Operator override: drop the lease regardless of owner.
    pub async fn force_release(&self, lock_key: &str) -> Result<bool, CoreError> {
        Ok(self.store.force_release_lease(lock_key).await?)
    }

    /// Delete all expired leases.
    pub async fn reap_expired(&self) -> Result<u64, CoreError> {
        Ok(self.store.reap_expired_leases(Utc::now()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_storage::InMemoryStore;
    use serde_json::json;

    fn guard() -> ConcurrencyGuard {
        ConcurrencyGuard::new(Arc::new(InMemoryStore::new()), 1800)
    }

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let guard = guard();

        assert!(guard
            .acquire("pipeline:otc.ingest", "exec-A", Some(1800))
            .await
            .unwrap());
        assert!(!guard
            .acquire("pipeline:otc.ingest", "exec-B", Some(1800))
            .await
            .unwrap());

        assert!(guard.release("pipeline:otc.ingest", "exec-A").await.unwrap());
        assert!(guard
            .acquire("pipeline:otc.ingest", "exec-B", Some(1800))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_release_by_non_owner_is_silent() {
        let guard = guard();
        guard.acquire("k", "owner", None).await.unwrap();
        assert!(!guard.release("k", "intruder").await.unwrap());

        // Lease still held
        assert!(!guard.acquire("k", "intruder", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_force_release() {
        let guard = guard();
        guard.acquire("k", "owner", None).await.unwrap();
        assert!(guard.force_release("k").await.unwrap());
        assert!(!guard.force_release("k").await.unwrap());
        assert!(guard.acquire("k", "other", None).await.unwrap());
    }

    #[test]
    fn test_workflow_lock_key_shape() {
        let mut params = JsonMap::new();
        params.insert("tier".into(), json!("OTC"));

        let key = ConcurrencyGuard::workflow_lock_key(
            "otc.weekly",
            &params,
            &["tier".to_string()],
        );
        assert!(key.starts_with("workflow:otc.weekly:"));

        // Same params, same key
        let again = ConcurrencyGuard::workflow_lock_key(
            "otc.weekly",
            &params,
            &["tier".to_string()],
        );
        assert_eq!(key, again);
    }
}
