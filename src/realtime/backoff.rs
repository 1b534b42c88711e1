//! Exponential reconnect delay.

use std::time::Duration;

/// Delay schedule for consecutive reconnect attempts.
///
/// The n-th consecutive failure (counting from zero) waits
/// `min(max, base * 2^n)`. A successful subscription calls [`reset`](Self::reset).
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    /// Consecutive failures since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt; advances the failure counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = 2u32
            .checked_pow(self.attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max));
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
