//! Exponential backoff with jitter for retry scheduling.

use std::time::Duration;

/// Delay schedule shared by the rate limiter's provider backoff and the
/// request queue's retry loop.
///
/// The delay for attempt `n` is `initial_delay * factor^n`, capped at
/// `max_delay`, with optional +/- 50% jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// The initial backoff duration.
    pub initial_delay: Duration,
    /// The maximum duration to wait between retries.
    pub max_delay: Duration,
    /// The multiplicative factor for each subsequent retry.
    pub factor: f64,
    /// Whether to apply random jitter (+/- 50%) to the delay.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            factor: 2.0,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Fixed-factor schedule without jitter, useful in tests where exact
    /// delays are asserted.
    pub fn deterministic(initial_delay: Duration, factor: f64, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            factor,
            jitter: false,
        }
    }

    /// Calculate the delay for a given attempt (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scale = self.factor.powi(attempt as i32);
        let seconds = self.initial_delay.as_secs_f64() * scale;
        let capped_seconds = seconds.min(self.max_delay.as_secs_f64());

        let mut delay = Duration::from_secs_f64(capped_seconds);

        if self.jitter {
            let jitter_ms = (delay.as_millis() as f64 * 0.5) as u64;
            let random_offset = fastrand::u64(0..=(jitter_ms * 2));
            let total_ms = delay.as_millis() as i64 + (random_offset as i64 - jitter_ms as i64);
            delay = Duration::from_millis(total_ms.max(0) as u64);
        }

        delay
    }
}
