//! ID generation and content hashing
//!
//! Run IDs are UUID v7 (time-ordered, so primary-key indexes stay roughly
//! append-only). Batch IDs are human-readable correlation tokens for grouping
//! related runs (backfills, daily sweeps).

use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::run::JsonMap;

/// Generate a new time-ordered run ID.
pub fn new_run_id() -> Uuid {
    Uuid::now_v7()
}

/// Generate a batch ID for correlating related runs.
///
/// Format: `{prefix}_{yyyymmddThhmmss}_{short}`, e.g.
/// `backfill_20260202T150022_a1b2c3d4`. The timestamp makes batch IDs
/// sortable; the suffix keeps them unique within a second.
pub fn new_batch_id(prefix: &str) -> String {
    let ts = Utc::now().format("%Y%m%dT%H%M%S");
    let short = short_id(&Uuid::now_v7());
    if prefix.is_empty() {
        format!("batch_{ts}_{short}")
    } else {
        format!("{prefix}_{ts}_{short}")
    }
}

/// First eight hex characters of a UUID, for log-friendly references.
pub fn short_id(id: &Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

/// Stable hash over a named subset of params, for lock partition keys.
///
/// Selected keys are hashed in the order given so that the same partition
/// always maps to the same lock key regardless of map iteration order.
/// Missing keys hash as null.
pub fn partition_hash(params: &JsonMap, keys: &[String]) -> String {
    let mut hasher = Sha256::new();
    for key in keys {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        match params.get(key) {
            Some(value) => hasher.update(value.to_string().as_bytes()),
            None => hasher.update(b"null"),
        }
        hasher.update(b";");
    }
    hex::encode(&hasher.finalize()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_ids_are_time_ordered() {
        let a = new_run_id();
        let b = new_run_id();
        assert!(a < b);
    }

    #[test]
    fn test_batch_id_format() {
        let id = new_batch_id("backfill");
        assert!(id.starts_with("backfill_"));
        assert_eq!(id.split('_').count(), 3);

        let id = new_batch_id("");
        assert!(id.starts_with("batch_"));
    }

    #[test]
    fn test_partition_hash_is_stable() {
        let mut params = JsonMap::new();
        params.insert("tier".to_string(), json!("OTC"));
        params.insert("week".to_string(), json!("2025-12-26"));

        let keys = vec!["tier".to_string(), "week".to_string()];
        let h1 = partition_hash(&params, &keys);
        let h2 = partition_hash(&params, &keys);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 16);
    }

    #[test]
    fn test_partition_hash_differs_by_value() {
        let mut a = JsonMap::new();
        a.insert("tier".to_string(), json!("OTC"));
        let mut b = JsonMap::new();
        b.insert("tier".to_string(), json!("NMS"));

        let keys = vec!["tier".to_string()];
        assert_ne!(partition_hash(&a, &keys), partition_hash(&b, &keys));
    }

    #[test]
    fn test_partition_hash_missing_key() {
        let params = JsonMap::new();
        let keys = vec!["absent".to_string()];
        // Missing keys hash deterministically rather than erroring.
        assert_eq!(
            partition_hash(&params, &keys),
            partition_hash(&params, &keys)
        );
    }
}
