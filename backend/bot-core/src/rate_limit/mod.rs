//! Per-category admission gate for outbound actions.
//!
//! Each category owns one [`RateBucket`] behind its own mutex, so admissions
//! in one category never wait on another. Refill happens on access; there is
//! no timer task.

mod bucket;

pub use bucket::RateBucket;

use crate::clock::{Clock, SystemClock};
use crate::config::{BucketConfig, DenialPolicy, RateLimitsConfig};
use crate::error::rate_limit::RateLimitError;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use log::{debug, info, trace};

/// Point-in-time view of one bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketSnapshot {
    pub category: String,
    pub capacity: f64,
    pub refill_per_second: f64,
    pub tokens: f64,
}

pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    default: RwLock<BucketConfig>,
    configs: RwLock<HashMap<String, BucketConfig>>,
    buckets: Mutex<HashMap<String, Arc<Mutex<RateBucket>>>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitsConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &RateLimitsConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            default: RwLock::new(config.default.clone()),
            configs: RwLock::new(config.categories.clone()),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take `cost` tokens from `category`.
    ///
    /// # Errors
    ///
    /// - [`RateLimitError::Denied`] with the wait until enough tokens exist;
    ///   the bucket level is left as refilled, nothing is deducted.
    /// - [`RateLimitError::CostExceedsCapacity`] if the bucket can never hold `cost`.
    /// - [`RateLimitError::InvalidCost`] if `cost` is not a positive finite number;
    ///   the bucket is not touched.
    #[track_caller]
    pub fn try_acquire(&self, category: &str, cost: f64) -> Result<(), RateLimitError> {
        if !(cost.is_finite() && cost > 0.0) {
            debug!("Refused invalid cost {cost} on '{category}'");
            return Err(RateLimitError::invalid_cost(category, cost));
        }

        let bucket = self.bucket(category);
        let mut bucket = lock(&bucket);

        if cost > bucket.capacity() {
            return Err(RateLimitError::cost_exceeds_capacity(
                category,
                cost,
                bucket.capacity(),
            ));
        }

        match bucket.try_acquire(cost, self.clock.now()) {
            Ok(()) => {
                trace!(
                    "Admitted {cost} on '{category}', {:.2} tokens left",
                    bucket.tokens()
                );
                Ok(())
            }
            Err(retry_after) => {
                debug!("Denied {cost} on '{category}', retry after {retry_after:?}");
                Err(RateLimitError::denied(category, retry_after))
            }
        }
    }

    /// Wait until `amount` tokens will be available in `category`, without
    /// taking any.
    pub fn estimate_wait(&self, category: &str, amount: f64) -> Duration {
        let bucket = self.bucket(category);
        let mut bucket = lock(&bucket);
        bucket.refill(self.clock.now());
        bucket.wait_for(amount)
    }

    /// What to do with actions this category denies.
    pub fn policy(&self, category: &str) -> DenialPolicy {
        self.config_for(category).policy
    }

    /// Replace the limits for a category. Existing buckets keep their level,
    /// clamped to the new capacity.
    pub fn configure(&self, category: &str, config: BucketConfig) {
        info!(
            "Rate limit '{category}': capacity {}, refill {}/s, {:?}",
            config.capacity, config.refill_per_second, config.policy
        );

        if let Some(bucket) = lock(&self.buckets).get(category) {
            lock(bucket).reconfigure(&config, self.clock.now());
        }

        self.configs
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(category.to_string(), config);
    }

    /// Apply every category of a reloaded config.
    pub fn configure_all(&self, config: &RateLimitsConfig) {
        *self.default.write().unwrap_or_else(|p| p.into_inner()) = config.default.clone();
        for (category, bucket) in &config.categories {
            self.configure(category, bucket.clone());
        }
    }

    /// Levels of every bucket touched so far, sorted by category.
    pub fn snapshot(&self) -> Vec<BucketSnapshot> {
        let now = self.clock.now();
        let buckets = lock(&self.buckets);

        let mut snapshot: Vec<BucketSnapshot> = buckets
            .iter()
            .map(|(category, bucket)| {
                let mut bucket = lock(bucket);
                bucket.refill(now);
                BucketSnapshot {
                    category: category.clone(),
                    capacity: bucket.capacity(),
                    refill_per_second: bucket.refill_per_second(),
                    tokens: bucket.tokens(),
                }
            })
            .collect();

        snapshot.sort_by(|a, b| a.category.cmp(&b.category));
        snapshot
    }

    fn config_for(&self, category: &str) -> BucketConfig {
        if let Some(config) = self
            .configs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(category)
        {
            return config.clone();
        }

        self.default
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn bucket(&self, category: &str) -> Arc<Mutex<RateBucket>> {
        let mut buckets = lock(&self.buckets);

        if let Some(bucket) = buckets.get(category) {
            return Arc::clone(bucket);
        }

        let known = self
            .configs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(category);
        if !known {
            info!("Unknown rate limit category '{category}', using default bucket");
        }

        let bucket = Arc::new(Mutex::new(RateBucket::new(
            &self.config_for(category),
            self.clock.now(),
        )));
        buckets.insert(category.to_string(), Arc::clone(&bucket));
        bucket
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}
