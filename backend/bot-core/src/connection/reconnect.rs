//! Reconnect delay schedule.
//!
//! Wait before attempt `n` is `min(base * 2^(n-1), cap)` plus a uniform
//! jitter in `0..=jitter`. The attempt counter stops growing once the
//! exponential part reaches the cap.

use crate::config::ConnectionConfig;

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    base: Duration,
    cap: Duration,
    jitter: Duration,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, cap: Duration, jitter: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            jitter,
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            Duration::from_millis(config.jitter_ms),
        )
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }

    pub fn jitter(&self) -> Duration {
        self.jitter
    }

    /// Delay before attempt `attempt` without jitter. Attempt 0 counts as 1.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.cap)
            .min(self.cap)
    }

    /// [`base_delay`](Self::base_delay) plus random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.base_delay(attempt) + jitter
    }

    /// Attempt number after a failure of attempt `previous` (0 = none yet).
    pub fn next_attempt(&self, previous: u32) -> u32 {
        if previous == 0 {
            1
        } else if self.base_delay(previous) >= self.cap {
            previous
        } else {
            previous + 1
        }
    }
}
