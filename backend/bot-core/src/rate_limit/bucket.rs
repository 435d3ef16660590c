use crate::config::BucketConfig;

use std::time::Duration;

use tokio::time::Instant;

/// Token bucket with lazy refill.
///
/// `0 <= tokens <= capacity` holds after every method. Tokens grow only in
/// `refill` and shrink only on a successful `try_acquire`.
#[derive(Debug, Clone)]
pub struct RateBucket {
    capacity: f64,
    refill_per_second: f64,
    tokens: f64,
    last_refill: Instant,
}

impl RateBucket {
    /// New bucket, full.
    pub fn new(config: &BucketConfig, now: Instant) -> Self {
        Self {
            capacity: config.capacity,
            refill_per_second: config.refill_per_second,
            tokens: config.capacity,
            last_refill: now,
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_per_second(&self) -> f64 {
        self.refill_per_second
    }

    /// Tokens as of the last refill.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_per_second)
            .min(self.capacity);
        self.last_refill = now;
    }

    /// Refill, then take `cost` tokens or report how long until there are enough.
    ///
    /// `cost` must be positive and finite; [`RateLimiter`](super::RateLimiter) checks this.
    pub fn try_acquire(&mut self, cost: f64, now: Instant) -> Result<(), Duration> {
        self.refill(now);

        if self.tokens >= cost {
            self.tokens -= cost;
            Ok(())
        } else {
            Err(self.wait_for(cost))
        }
    }

    /// Wait until `amount` tokens will be present, from the current level.
    ///
    /// `amount` may exceed capacity when estimating for a backlog.
    pub fn wait_for(&self, amount: f64) -> Duration {
        let deficit = amount - self.tokens;
        if deficit <= 0.0 {
            return Duration::ZERO;
        }

        let millis = (deficit / self.refill_per_second * 1000.0).ceil();
        Duration::from_millis(millis as u64)
    }

    /// Apply new limits, keeping the current level within the new capacity.
    pub fn reconfigure(&mut self, config: &BucketConfig, now: Instant) {
        self.refill(now);
        self.capacity = config.capacity;
        self.refill_per_second = config.refill_per_second;
        self.tokens = self.tokens.min(self.capacity);
    }
}
