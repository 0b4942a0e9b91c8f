//! Exponentially smoothed scalar.

/// A single EMA estimate for one (worker, size bucket) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothedMetric {
    value: Option<f64>,
    alpha: f64,
}

impl SmoothedMetric {
    /// An unset metric; the first `bump` sets it outright.
    pub fn new(alpha: f64) -> Self {
        Self { value: None, alpha }
    }

    /// A metric restored from a persisted value.
    pub fn with_value(alpha: f64, value: f64) -> Self {
        Self {
            value: Some(value),
            alpha,
        }
    }

    /// Fold a sample in: `value = alpha * value + (1 - alpha) * sample`.
    pub fn bump(&mut self, sample: f64) {
        self.value = Some(match self.value {
            None => sample,
            Some(prev) => self.alpha * prev + (1.0 - self.alpha) * sample,
        });
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }
}
