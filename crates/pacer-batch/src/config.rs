use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::outcome::BatchError;

/// Inclusive range the inter-batch pause is drawn from, uniformly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayRange {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    pub fn widened(&self, factor: u32) -> Self {
        Self {
            min_ms: self.min_ms.saturating_mul(factor as u64),
            max_ms: self.max_ms.saturating_mul(factor as u64),
        }
    }

    pub fn sample(&self) -> Duration {
        use rand::Rng;
        if self.min_ms >= self.max_ms {
            return Duration::from_millis(self.min_ms);
        }
        Duration::from_millis(rand::thread_rng().gen_range(self.min_ms..=self.max_ms))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub min_batch_size: usize,
    /// Hard ceiling. No dispatched batch ever holds more items than this.
    pub max_batch_size: usize,
    pub inter_batch_delay: DelayRange,
    pub success_rate_threshold: f64,
    pub rolling_window_size: usize,
    /// Multiplier applied to both delay bounds after an `INCREASE_DELAY` signal.
    pub delay_widen_factor: u32,
    /// Run the items of a batch on their own threads.
    pub parallel_items: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 3,
            max_batch_size: 5,
            inter_batch_delay: DelayRange::new(2_000, 5_000),
            success_rate_threshold: 0.5,
            rolling_window_size: 10,
            delay_widen_factor: 2,
            parallel_items: true,
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<(), BatchError> {
        let invalid = |msg: String| Err(BatchError::InvalidConfig(msg));
        if self.min_batch_size == 0 {
            return invalid("min_batch_size must be at least 1".into());
        }
        if self.min_batch_size > self.max_batch_size {
            return invalid(format!(
                "min_batch_size {} exceeds max_batch_size {}",
                self.min_batch_size, self.max_batch_size
            ));
        }
        if self.inter_batch_delay.min_ms > self.inter_batch_delay.max_ms {
            return invalid("inter_batch_delay.min_ms exceeds max_ms".into());
        }
        if !(0.0..=1.0).contains(&self.success_rate_threshold) {
            return invalid(format!("success_rate_threshold {} outside [0, 1]", self.success_rate_threshold));
        }
        if self.rolling_window_size == 0 {
            return invalid("rolling_window_size must be at least 1".into());
        }
        if self.delay_widen_factor == 0 {
            return invalid("delay_widen_factor must be at least 1".into());
        }
        Ok(())
    }
}
