//! Persisted domain types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Size bucket: `round(sqrt(size))` of a workload size.
pub type Bucket = u64;

/// Durable form of a worker profile.
///
/// Holds the smoothed per-token cost of every recorded size bucket and the
/// lifetime sample count. Cooldowns are runtime-only and never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProfileRecord {
    /// Smoothed seconds-per-token, keyed by size bucket.
    pub bucket_values: BTreeMap<Bucket, f64>,
    /// Number of observations folded into the profile.
    pub sample_count: u64,
}

impl ProfileRecord {
    /// True when the record carries no observations.
    pub fn is_empty(&self) -> bool {
        self.bucket_values.is_empty() && self.sample_count == 0
    }
}
