//! Exponential backoff shared by the send queue and the downloader.

use std::time::Duration;

use rand::Rng;

/// `base * 2^(attempt-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

/// Jitter added on top of the computed delay, as a fraction of it.
const JITTER_MIN: f64 = 0.15;
const JITTER_MAX: f64 = 0.30;

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Delay before retry number `attempt` (1-based). Attempt 0 waits nothing.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// [`Self::delay`] plus 15-30% random jitter.
    pub fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        let fraction = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
        delay + delay.mul_f64(fraction)
    }

    pub fn delay_ms(&self, attempt: u32) -> i64 {
        i64::try_from(self.delay(attempt).as_millis()).unwrap_or(i64::MAX)
    }
}
