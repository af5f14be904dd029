//! Incremental-cursor watermarks
//!
//! A watermark records the furthest position consumed for a
//! `(domain, source, partition_key)` triple. High-water values are opaque
//! monotone strings — typically ISO-8601 timestamps or sequence numbers —
//! compared lexicographically. Advancement is forward-only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::run::JsonMap;

/// High-water mark for an incremental cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    pub domain: String,
    pub source: String,
    pub partition_key: String,

    /// Furthest position consumed (opaque monotone string)
    pub high_water: String,

    /// Optional lower retention bound
    pub low_water: Option<String>,

    pub metadata: JsonMap,
    pub updated_at: DateTime<Utc>,
}

impl Watermark {
    /// Apply a forward-only advance, returning the resulting watermark.
    ///
    /// A `new_high ≤ current` advance is a no-op returning `self`
    /// unchanged. Metadata maps merge; an explicit `low_water` replaces
    /// the stored one.
    pub fn advanced(
        &self,
        new_high: &str,
        low_water: Option<&str>,
        metadata: Option<&JsonMap>,
        now: DateTime<Utc>,
    ) -> Watermark {
        if new_high <= self.high_water.as_str() {
            return self.clone();
        }
        let mut merged = self.metadata.clone();
        if let Some(extra) = metadata {
            for (k, v) in extra {
                merged.insert(k.clone(), v.clone());
            }
        }
        Watermark {
            domain: self.domain.clone(),
            source: self.source.clone(),
            partition_key: self.partition_key.clone(),
            high_water: new_high.to_string(),
            low_water: low_water
                .map(str::to_string)
                .or_else(|| self.low_water.clone()),
            metadata: merged,
            updated_at: now,
        }
    }
}

/// A partition expected to have a watermark but missing one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkGap {
    pub domain: String,
    pub source: String,
    pub partition_key: String,
}
