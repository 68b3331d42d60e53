use std::time::Duration;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Pure exponential backoff: `base_delay * 2^attempt_count`.
///
/// `attempt_count` is the number of prior failed attempts (0 for the first
/// failure). No jitter is applied here. Results saturate at `Duration::MAX`
/// once the product no longer fits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    base_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY)
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration) -> Self {
        Self { base_delay }
    }

    pub fn from_millis(base_delay_ms: u64) -> Self {
        Self::new(Duration::from_millis(base_delay_ms))
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        1u32.checked_shl(attempt_count)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }

    /// Due timestamp for a record written at `now_ms` after `attempt_count` failures.
    pub fn due_at_ms(&self, now_ms: i64, attempt_count: u32) -> i64 {
        let delay_ms = i64::try_from(self.delay_for(attempt_count).as_millis()).unwrap_or(i64::MAX);
        now_ms.saturating_add(delay_ms)
    }
}
