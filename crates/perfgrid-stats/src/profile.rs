//! Per-worker performance profile.
//!
//! A profile keeps one [`SmoothedMetric`] per size bucket, where the bucket of
//! a workload is `round(sqrt(size))`. Nearby sizes share a bucket, which trades
//! resolution for faster convergence when observations are sparse. The value
//! stored per bucket is a per-token cost: elapsed seconds divided by the total
//! tokens the request consumed.
//!
//! Sizes with no bucket of their own are extrapolated from the largest
//! recorded bucket. Growing towards an unseen, larger size uses a steeper
//! exponent than shrinking, so extrapolated upsizing stays pessimistic.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use perfgrid_state::{Bucket, ProfileRecord};

use crate::config::{
    DEFAULT_ALPHA, DEFAULT_DOWNSIZE_EXPONENT, DEFAULT_PUNISH_SENTINEL, DEFAULT_UPSIZE_EXPONENT,
};
use crate::error::{StatsError, StatsResult};
use crate::metric::SmoothedMetric;

/// Token usage reported by a completed request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(total_tokens: u64) -> Self {
        Self { total_tokens }
    }
}

/// Estimation constants shared by every profile of a registry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfileParams {
    pub alpha: f64,
    pub punish_sentinel: f64,
    pub downsize_exponent: f64,
    pub upsize_exponent: f64,
}

impl Default for ProfileParams {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            punish_sentinel: DEFAULT_PUNISH_SENTINEL,
            downsize_exponent: DEFAULT_DOWNSIZE_EXPONENT,
            upsize_exponent: DEFAULT_UPSIZE_EXPONENT,
        }
    }
}

/// Size bucket of a workload: `round(sqrt(size))`, ties to even.
pub fn size_bucket(size: f64) -> Bucket {
    size.sqrt().round_ties_even() as Bucket
}

/// Workload sizes must be positive and finite to land in a bucket.
pub fn validate_size(size: f64) -> StatsResult<()> {
    if size.is_finite() && size > 0.0 {
        Ok(())
    } else {
        Err(StatsError::InvalidObservation(format!(
            "size must be positive and finite, got {size}"
        )))
    }
}

/// Reject observations that would poison the estimate.
pub fn validate_observation(size: f64, usage: &Usage) -> StatsResult<()> {
    validate_size(size)?;
    if usage.total_tokens == 0 {
        return Err(StatsError::InvalidObservation(
            "usage.total_tokens must be positive".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct WorkerProfile {
    params: ProfileParams,
    buckets: BTreeMap<Bucket, SmoothedMetric>,
    cooldown_until: Option<Instant>,
    sample_count: u64,
}

impl Default for WorkerProfile {
    fn default() -> Self {
        Self::new(ProfileParams::default())
    }
}

impl WorkerProfile {
    pub fn new(params: ProfileParams) -> Self {
        Self {
            params,
            buckets: BTreeMap::new(),
            cooldown_until: None,
            sample_count: 0,
        }
    }

    /// Fold one completed request into the profile.
    ///
    /// A successful completion also lifts any active cooldown.
    pub fn bump(&mut self, size: f64, usage: &Usage, elapsed: Duration) -> StatsResult<()> {
        validate_observation(size, usage)?;

        self.sample_count += 1;
        let cost = elapsed.as_secs_f64() / usage.total_tokens as f64;
        let alpha = self.params.alpha;
        self.buckets
            .entry(size_bucket(size))
            .or_insert_with(|| SmoothedMetric::new(alpha))
            .bump(cost);
        self.cooldown_until = None;
        Ok(())
    }

    /// Estimated per-token cost for a workload of `size`.
    ///
    /// Returns the punishment sentinel while a cooldown is active and `None`
    /// when nothing has been recorded yet.
    pub fn estimate(&self, size: f64) -> Option<f64> {
        if self.is_cooling_down() {
            return Some(self.params.punish_sentinel);
        }

        let bucket = size_bucket(size);
        if let Some(exact) = self.buckets.get(&bucket).and_then(SmoothedMetric::value) {
            return Some(exact);
        }

        let (&close_bin, close) = self.buckets.last_key_value()?;
        let close = close.value()?;
        // Bucket 0 would divide by zero; its sizes sit below 1 anyway.
        let reference = (close_bin.max(1) as f64).powi(2);
        let exponent = if bucket < close_bin {
            self.params.downsize_exponent
        } else {
            self.params.upsize_exponent
        };
        Some(close * (size / reference).powf(exponent))
    }

    /// Make the worker look maximally slow for `duration`.
    ///
    /// A second call restarts the clock.
    pub fn punish(&mut self, duration: Duration) {
        self.cooldown_until = Some(Instant::now() + duration);
    }

    pub fn is_cooling_down(&self) -> bool {
        self.cooldown_until
            .is_some_and(|until| until > Instant::now())
    }

    pub fn cooldown_remaining(&self) -> Option<Duration> {
        self.cooldown_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .filter(|d| !d.is_zero())
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    /// True once anything was observed or restored.
    pub fn has_data(&self) -> bool {
        self.sample_count > 0 || !self.buckets.is_empty()
    }

    pub fn bucket_value(&self, bucket: Bucket) -> Option<f64> {
        self.buckets.get(&bucket).and_then(SmoothedMetric::value)
    }

    pub fn buckets(&self) -> impl Iterator<Item = (Bucket, f64)> + '_ {
        self.buckets
            .iter()
            .filter_map(|(&b, m)| m.value().map(|v| (b, v)))
    }

    pub fn to_record(&self) -> ProfileRecord {
        ProfileRecord {
            bucket_values: self.buckets().collect(),
            sample_count: self.sample_count,
        }
    }

    /// Replace the in-memory buckets and count with a persisted record.
    ///
    /// Refused (returns `false`) once the profile holds data of its own, so a
    /// late load never clobbers fresher observations.
    pub fn restore(&mut self, record: &ProfileRecord) -> bool {
        if self.has_data() {
            return false;
        }
        let alpha = self.params.alpha;
        self.buckets = record
            .bucket_values
            .iter()
            .map(|(&b, &v)| (b, SmoothedMetric::with_value(alpha, v)))
            .collect();
        self.sample_count = record.sample_count;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-12 * a.abs().max(b.abs()).max(1.0)
    }

    #[test]
    fn bucket_is_rounded_square_root() {
        assert_eq!(size_bucket(1000.0), 32);
        assert_eq!(size_bucket(4000.0), 63);
        assert_eq!(size_bucket(1.0), 1);
        assert_eq!(size_bucket(0.1), 0);
        // 2.5 rounds to even.
        assert_eq!(size_bucket(6.25), 2);
        assert_eq!(size_bucket(12.25), 4);
    }

    #[test]
    fn empty_profile_has_no_estimate() {
        let profile = WorkerProfile::default();
        assert_eq!(profile.estimate(1000.0), None);
        assert!(!profile.has_data());
    }

    #[test]
    fn bump_records_per_token_cost() {
        let mut profile = WorkerProfile::default();
        profile.bump(1000.0, &Usage::new(500), secs(5.0)).unwrap();

        assert_eq!(profile.sample_count(), 1);
        assert_eq!(profile.bucket_value(32), Some(0.01));
        assert_eq!(profile.estimate(1000.0), Some(0.01));
        // 1010 shares bucket 32.
        assert_eq!(profile.estimate(1010.0), Some(0.01));
    }

    #[test]
    fn bump_rejects_zero_tokens_and_bad_sizes() {
        let mut profile = WorkerProfile::default();
        assert!(matches!(
            profile.bump(1000.0, &Usage::new(0), secs(1.0)),
            Err(StatsError::InvalidObservation(_))
        ));
        assert!(profile.bump(0.0, &Usage::new(10), secs(1.0)).is_err());
        assert!(profile.bump(-4.0, &Usage::new(10), secs(1.0)).is_err());
        assert!(profile.bump(f64::NAN, &Usage::new(10), secs(1.0)).is_err());
        assert_eq!(profile.sample_count(), 0);
        assert!(!profile.has_data());
    }

    #[test]
    fn upsizing_extrapolates_with_steeper_exponent() {
        let mut profile = WorkerProfile::default();
        profile.bump(1000.0, &Usage::new(500), secs(5.0)).unwrap();

        let est = profile.estimate(4000.0).unwrap();
        let expected = 0.01 * (4000.0_f64 / 1024.0).powf(1.8);
        assert!(approx(est, expected), "{est} != {expected}");
    }

    #[test]
    fn downsizing_extrapolates_with_gentler_exponent() {
        let mut profile = WorkerProfile::default();
        profile.bump(1000.0, &Usage::new(500), secs(5.0)).unwrap();

        let est = profile.estimate(100.0).unwrap();
        let expected = 0.01 * (100.0_f64 / 1024.0).powf(1.5);
        assert!(approx(est, expected), "{est} != {expected}");
        assert!(est < 0.01);
    }

    #[test]
    fn extrapolation_uses_largest_bucket() {
        let mut profile = WorkerProfile::default();
        profile.bump(100.0, &Usage::new(100), secs(1.0)).unwrap(); // bucket 10
        profile.bump(900.0, &Usage::new(100), secs(3.0)).unwrap(); // bucket 30

        let est = profile.estimate(400.0).unwrap(); // bucket 20
        let expected = 0.03 * (400.0_f64 / 900.0).powf(1.5);
        assert!(approx(est, expected), "{est} != {expected}");
    }

    #[test]
    fn upsizing_never_below_downsizing_for_same_ratio() {
        let mut profile = WorkerProfile::default();
        profile.bump(1000.0, &Usage::new(500), secs(5.0)).unwrap();

        for size in [1100.0, 2000.0, 4000.0, 10_000.0] {
            let up = profile.estimate(size).unwrap();
            let down = 0.01 * (size / 1024.0_f64).powf(1.5);
            assert!(up >= down, "size {size}: {up} < {down}");
        }
    }

    #[test]
    fn custom_exponents_apply() {
        let params = ProfileParams {
            upsize_exponent: 1.0,
            ..Default::default()
        };
        let mut profile = WorkerProfile::new(params);
        profile.bump(100.0, &Usage::new(10), secs(1.0)).unwrap();

        let est = profile.estimate(200.0).unwrap(); // bucket 14
        assert!(approx(est, 0.1 * 2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn punish_returns_sentinel_until_expiry() {
        let mut profile = WorkerProfile::default();
        profile.bump(1000.0, &Usage::new(500), secs(5.0)).unwrap();

        profile.punish(Duration::from_secs(60));
        assert!(profile.is_cooling_down());
        assert_eq!(profile.estimate(1000.0), Some(9999.0));
        assert_eq!(profile.estimate(7.0), Some(9999.0));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(profile.estimate(1000.0), Some(9999.0));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!profile.is_cooling_down());
        assert_eq!(profile.cooldown_remaining(), None);
        assert_eq!(profile.estimate(1000.0), Some(0.01));
    }

    #[tokio::test(start_paused = true)]
    async fn punish_applies_to_empty_profile() {
        let mut profile = WorkerProfile::default();
        profile.punish(Duration::from_secs(10));
        assert_eq!(profile.estimate(50.0), Some(9999.0));
        // A cooldown is not data.
        assert!(!profile.has_data());
    }

    #[tokio::test(start_paused = true)]
    async fn second_punish_restarts_the_clock() {
        let mut profile = WorkerProfile::default();
        profile.punish(Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(50)).await;

        profile.punish(Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(profile.is_cooling_down());
        assert_eq!(profile.cooldown_remaining(), Some(Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn bump_forgives_punishment() {
        let mut profile = WorkerProfile::default();
        profile.punish(Duration::from_secs(600));
        profile.bump(1000.0, &Usage::new(500), secs(5.0)).unwrap();

        assert!(!profile.is_cooling_down());
        assert_eq!(profile.estimate(1000.0), Some(0.01));
    }

    #[test]
    fn record_roundtrip_preserves_estimates() {
        let mut profile = WorkerProfile::default();
        profile.bump(1000.0, &Usage::new(500), secs(5.0)).unwrap();
        profile.bump(100.0, &Usage::new(100), secs(2.0)).unwrap();

        let record = profile.to_record();
        assert_eq!(record.sample_count, 2);
        assert_eq!(record.bucket_values.len(), 2);

        let mut restored = WorkerProfile::default();
        assert!(restored.restore(&record));
        assert_eq!(restored.sample_count(), 2);
        assert_eq!(restored.estimate(1000.0), profile.estimate(1000.0));
        assert_eq!(restored.estimate(100.0), profile.estimate(100.0));
    }

    #[test]
    fn restore_refused_once_profile_has_data() {
        let mut profile = WorkerProfile::default();
        profile.bump(1000.0, &Usage::new(500), secs(5.0)).unwrap();

        let stale = ProfileRecord {
            bucket_values: [(32, 1.0)].into_iter().collect(),
            sample_count: 40,
        };
        assert!(!profile.restore(&stale));
        assert_eq!(profile.sample_count(), 1);
        assert_eq!(profile.estimate(1000.0), Some(0.01));
    }
}
