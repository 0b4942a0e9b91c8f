//! `perfgrid.toml` configuration.
//!
//! Every field has a default, so an empty file (or no file) yields the
//! tuning the dispatcher has always used.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StatsError, StatsResult};
use crate::profile::ProfileParams;

pub const DEFAULT_ALPHA: f64 = 0.9;
pub const DEFAULT_PUNISH_SECS: u64 = 60 * 15;
pub const DEFAULT_PUNISH_SENTINEL: f64 = 9999.0;
pub const DEFAULT_DOWNSIZE_EXPONENT: f64 = 1.5;
pub const DEFAULT_UPSIZE_EXPONENT: f64 = 1.8;
pub const DEFAULT_SELECTION_POWER: i32 = 2;
pub const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StatsConfig {
    /// EMA weight of the previous value (higher keeps more history).
    pub alpha: f64,
    /// Cooldown applied by `punish_default`.
    pub punish_secs: u64,
    /// Estimate reported for a worker in cooldown.
    pub punish_sentinel: f64,
    /// Extrapolation exponent towards smaller, unseen sizes.
    pub downsize_exponent: f64,
    /// Extrapolation exponent towards larger, unseen sizes.
    pub upsize_exponent: f64,
    /// Skew of the selection draw: 2 strongly favours the front of the
    /// ranking, 1 spreads the tail evenly.
    pub selection_power: i32,
    pub pipeline: PipelineConfig,
}

/// Tuning for the background write and read loops.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Extra ready items drained after the first one, per store round-trip.
    pub batch_size: usize,
    /// Bounded wait on an empty queue before re-checking for shutdown.
    pub poll_timeout_ms: u64,
    /// Pause after a failed store call before the item is retried.
    pub retry_backoff_ms: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            punish_secs: DEFAULT_PUNISH_SECS,
            punish_sentinel: DEFAULT_PUNISH_SENTINEL,
            downsize_exponent: DEFAULT_DOWNSIZE_EXPONENT,
            upsize_exponent: DEFAULT_UPSIZE_EXPONENT,
            selection_power: DEFAULT_SELECTION_POWER,
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            poll_timeout_ms: 4000,
            retry_backoff_ms: 1000,
        }
    }
}

impl PipelineConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl StatsConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    pub fn from_toml_str(s: &str) -> StatsResult<Self> {
        let config: StatsConfig =
            toml::from_str(s).map_err(|e| StatsError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the estimator or the pipeline cannot work with.
    pub fn validate(&self) -> StatsResult<()> {
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(StatsError::InvalidConfig(format!(
                "alpha must be within [0, 1], got {}",
                self.alpha
            )));
        }
        if !(self.downsize_exponent > 0.0 && self.upsize_exponent > 0.0) {
            return Err(StatsError::InvalidConfig(
                "extrapolation exponents must be positive".to_string(),
            ));
        }
        if !self.punish_sentinel.is_finite() {
            return Err(StatsError::InvalidConfig(
                "punish_sentinel must be finite".to_string(),
            ));
        }
        if self.selection_power < 1 {
            return Err(StatsError::InvalidConfig(format!(
                "selection_power must be at least 1, got {}",
                self.selection_power
            )));
        }
        if self.pipeline.batch_size == 0 {
            return Err(StatsError::InvalidConfig(
                "pipeline.batch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn punish_duration(&self) -> Duration {
        Duration::from_secs(self.punish_secs)
    }

    pub fn profile_params(&self) -> ProfileParams {
        ProfileParams {
            alpha: self.alpha,
            punish_sentinel: self.punish_sentinel,
            downsize_exponent: self.downsize_exponent,
            upsize_exponent: self.upsize_exponent,
        }
    }
}
