// Unit tests for the token bucket and the per-category limiter.
// Time is driven by ManualClock so no test sleeps.

use crate::clock::ManualClock;
use crate::config::{BucketConfig, DenialPolicy, RateLimitsConfig};
use crate::error::rate_limit::RateLimitError;
use crate::rate_limit::{RateBucket, RateLimiter};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

fn limits(category: &str, capacity: f64, refill: f64) -> RateLimitsConfig {
    RateLimitsConfig {
        default: BucketConfig::conservative(),
        categories: HashMap::from([(
            category.to_string(),
            BucketConfig::new(capacity, refill, DenialPolicy::Reject),
        )]),
    }
}

/// **VALUE**: A fresh bucket admits exactly its capacity in a burst.
///
/// **WHY THIS MATTERS**: Capacity is the burst the upstream tolerates. Admitting one more
/// than that is what gets the bot account throttled or banned.
///
/// **BUG THIS CATCHES**: Off-by-one in the `tokens >= cost` comparison, or a bucket that
/// starts empty instead of full.
#[test]
fn given_full_bucket_when_acquiring_past_capacity_then_last_is_denied() {
    // GIVEN: A bucket of 3 refilling at 1/s
    let now = Instant::now();
    let mut bucket = RateBucket::new(&BucketConfig::new(3.0, 1.0, DenialPolicy::Reject), now);

    // WHEN: Acquiring 4 tokens at the same instant
    let results: Vec<_> = (0..4).map(|_| bucket.try_acquire(1.0, now)).collect();

    // THEN: First three pass, the fourth waits one refill period
    assert!(results[..3].iter().all(Result::is_ok));
    assert_eq!(results[3], Err(Duration::from_secs(1)));
}

/// **VALUE**: Refill is lazy, proportional to elapsed time and clamped at capacity.
///
/// **WHY THIS MATTERS**: A bucket left idle for an hour must not bank an hour of tokens.
///
/// **BUG THIS CATCHES**: Missing `min(capacity)` clamp after a long idle period.
#[test]
fn given_idle_bucket_when_refilled_then_tokens_never_exceed_capacity() {
    // GIVEN: An empty bucket of 5
    let start = Instant::now();
    let mut bucket = RateBucket::new(&BucketConfig::new(5.0, 2.0, DenialPolicy::Reject), start);
    for _ in 0..5 {
        bucket.try_acquire(1.0, start).unwrap();
    }

    // WHEN: One second passes, then an hour
    bucket.refill(start + Duration::from_secs(1));
    let after_one_second = bucket.tokens();
    bucket.refill(start + Duration::from_secs(3600));

    // THEN: Two tokens came back, then the level stopped at capacity
    assert!((after_one_second - 2.0).abs() < 1e-9);
    assert!((bucket.tokens() - 5.0).abs() < 1e-9);
}

/// **VALUE**: A denial deducts nothing from the bucket.
///
/// **WHY THIS MATTERS**: Callers retry after `retry_after`. If a denied attempt consumed
/// tokens, the promised wait would be wrong and retries would starve.
///
/// **BUG THIS CATCHES**: Subtracting cost before checking the level.
#[test]
fn given_denied_acquire_when_retrying_after_wait_then_admitted() {
    // GIVEN: An empty bucket refilling at 0.5/s
    let start = Instant::now();
    let mut bucket = RateBucket::new(&BucketConfig::new(1.0, 0.5, DenialPolicy::Reject), start);
    bucket.try_acquire(1.0, start).unwrap();

    // WHEN: Denied, then retried exactly after the reported wait
    let wait = bucket.try_acquire(1.0, start).unwrap_err();
    let retry = bucket.try_acquire(1.0, start + wait);

    // THEN: The wait is two seconds and the retry succeeds
    assert_eq!(wait, Duration::from_secs(2));
    assert!(retry.is_ok());
}

/// **VALUE**: Categories are isolated from each other.
///
/// **WHY THIS MATTERS**: Exhausting the message budget must not block reactions or
/// other independent upstream limits.
///
/// **BUG THIS CATCHES**: A single shared bucket keyed on nothing.
#[test]
fn given_exhausted_category_when_other_category_acquires_then_admitted() {
    // GIVEN: "message" with capacity 1 already spent
    let clock = Arc::new(ManualClock::new());
    let mut config = limits("message", 1.0, 1.0);
    config.categories.insert(
        "reaction".to_string(),
        BucketConfig::new(2.0, 1.0, DenialPolicy::Reject),
    );
    let limiter = RateLimiter::with_clock(&config, clock);
    limiter.try_acquire("message", 1.0).unwrap();

    // WHEN: Acquiring on both categories
    let message = limiter.try_acquire("message", 1.0);
    let reaction = limiter.try_acquire("reaction", 1.0);

    // THEN: Only the exhausted category is denied
    assert!(matches!(message, Err(RateLimitError::Denied { .. })));
    assert!(reaction.is_ok());
}

/// **VALUE**: Unknown categories fall back to the conservative default bucket.
///
/// **WHY THIS MATTERS**: A handler using a new category without config must still be
/// limited, and tightly.
///
/// **BUG THIS CATCHES**: Unknown categories being unlimited.
#[test]
fn given_unknown_category_when_acquiring_twice_then_second_denied_for_five_seconds() {
    // GIVEN: Default bucket of 1 token refilling at 0.2/s
    let clock = Arc::new(ManualClock::new());
    let limiter = RateLimiter::with_clock(&limits("message", 10.0, 1.0), clock);

    // WHEN: Acquiring twice on an unconfigured category
    limiter.try_acquire("typing", 1.0).unwrap();
    let denied = limiter.try_acquire("typing", 1.0).unwrap_err();

    // THEN: Retry hint is one token at 0.2/s
    assert_eq!(denied.retry_after(), Some(Duration::from_secs(5)));
    assert_eq!(limiter.policy("typing"), DenialPolicy::Reject);
}

/// **VALUE**: A cost above capacity is reported as such, not as a retryable denial.
///
/// **WHY THIS MATTERS**: Such an action could never pass. Deferring it would park it
/// forever.
///
/// **BUG THIS CATCHES**: Returning `Denied` with a retry hint that can never be honoured.
#[test]
fn given_cost_above_capacity_when_acquiring_then_cost_exceeds_capacity() {
    // GIVEN: Capacity 2
    let limiter = RateLimiter::with_clock(
        &limits("bulk", 2.0, 1.0),
        Arc::new(ManualClock::new()),
    );

    // WHEN: Asking for 3
    let result = limiter.try_acquire("bulk", 3.0);

    // THEN: Permanent failure, no retry hint
    let err = result.unwrap_err();
    assert!(matches!(err, RateLimitError::CostExceedsCapacity { .. }));
    assert_eq!(err.retry_after(), None);
}

/// **VALUE**: Time moving forward restores admissions at the configured rate.
///
/// **BUG THIS CATCHES**: Refill keyed to wall-clock instead of the injected clock.
#[test]
fn given_manual_clock_when_advanced_then_tokens_return() {
    // GIVEN: Capacity 2 at 1/s, drained
    let clock = Arc::new(ManualClock::new());
    let limiter = RateLimiter::with_clock(&limits("message", 2.0, 1.0), clock.clone());
    limiter.try_acquire("message", 2.0).unwrap();
    assert!(limiter.try_acquire("message", 1.0).is_err());

    // WHEN: 1.5 seconds pass
    clock.advance(Duration::from_millis(1500));

    // THEN: One admission, then a denial for the remaining half token
    assert!(limiter.try_acquire("message", 1.0).is_ok());
    let denied = limiter.try_acquire("message", 1.0).unwrap_err();
    assert_eq!(denied.retry_after(), Some(Duration::from_millis(500)));
}

/// **VALUE**: Reconfiguring shrinks an existing bucket's level to the new capacity.
///
/// **WHY THIS MATTERS**: Runtime config updates must take effect for buckets already in
/// use, without a restart.
///
/// **BUG THIS CATCHES**: New limits applied only to buckets created afterwards.
#[test]
fn given_live_bucket_when_capacity_lowered_then_level_clamped() {
    // GIVEN: A full bucket of 10
    let clock = Arc::new(ManualClock::new());
    let limiter = RateLimiter::with_clock(&limits("message", 10.0, 1.0), clock);
    limiter.try_acquire("message", 1.0).unwrap();

    // WHEN: Capacity drops to 2
    limiter.configure("message", BucketConfig::new(2.0, 1.0, DenialPolicy::Defer));

    // THEN: Level and policy follow the new config
    let snapshot = limiter.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert!((snapshot[0].tokens - 2.0).abs() < 1e-9);
    assert!((snapshot[0].capacity - 2.0).abs() < 1e-9);
    assert_eq!(limiter.policy("message"), DenialPolicy::Defer);
}

/// **VALUE**: `estimate_wait` covers a backlog larger than capacity without taking tokens.
///
/// **BUG THIS CATCHES**: Estimates capped at capacity, which would understate the wait
/// for the tail of a deferred backlog.
#[test]
fn given_drained_bucket_when_estimating_backlog_then_wait_scales_with_amount() {
    // GIVEN: Capacity 5 at 1/s, drained
    let clock = Arc::new(ManualClock::new());
    let limiter = RateLimiter::with_clock(&limits("message", 5.0, 1.0), clock);
    limiter.try_acquire("message", 5.0).unwrap();

    // WHEN: Estimating for 1 and for 7 tokens
    let one = limiter.estimate_wait("message", 1.0);
    let seven = limiter.estimate_wait("message", 7.0);

    // THEN: Waits are linear in the amount and nothing was consumed
    assert_eq!(one, Duration::from_secs(1));
    assert_eq!(seven, Duration::from_secs(7));
    assert!(limiter.snapshot()[0].tokens.abs() < 1e-9);
}

/// **VALUE**: A denied acquire leaves the bucket level exactly where it was.
///
/// **WHY THIS MATTERS**: Denials are the common case under load. If each one nibbled at
/// the level, a busy category would never recover.
///
/// **BUG THIS CATCHES**: Deducting before the comparison, or rounding the level on denial.
#[test]
fn given_partial_bucket_when_acquire_denied_then_level_unchanged() {
    // GIVEN: Capacity 3 at 1/s with 0.5 tokens left
    let now = Instant::now();
    let mut bucket = RateBucket::new(&BucketConfig::new(3.0, 1.0, DenialPolicy::Reject), now);
    bucket.try_acquire(2.5, now).unwrap();
    let before = bucket.tokens();

    // WHEN: Asking for more than is there, at the same instant
    let denied = bucket.try_acquire(1.0, now);
    let denied_large = bucket.try_acquire(3.0, now);

    // THEN
    assert!(denied.is_err());
    assert!(denied_large.is_err());
    assert_eq!(bucket.tokens(), before);
    assert!((before - 0.5).abs() < 1e-9);
}

/// **VALUE**: Zero, negative and non-finite costs are refused before the bucket is touched.
///
/// **WHY THIS MATTERS**: A negative cost passes `tokens >= cost` and would add tokens,
/// letting a handler send past an exhausted limit.
///
/// **BUG THIS CATCHES**: Missing cost validation in `try_acquire`.
#[test]
fn given_drained_bucket_when_cost_not_positive_then_invalid_cost_and_level_unchanged() {
    // GIVEN: Capacity 1 at a very slow refill, drained
    let clock = Arc::new(ManualClock::new());
    let limiter = RateLimiter::with_clock(&limits("message", 1.0, 0.001), clock);
    limiter.try_acquire("message", 1.0).unwrap();

    // WHEN
    let results: Vec<_> = [-1.0, 0.0, f64::NAN, f64::INFINITY, f64::NEG_INFINITY]
        .into_iter()
        .map(|cost| limiter.try_acquire("message", cost))
        .collect();

    // THEN: All refused as invalid, the bucket is still empty
    for result in &results {
        let err = result.as_ref().unwrap_err();
        assert!(matches!(err, RateLimitError::InvalidCost { .. }), "got {err}");
        assert_eq!(err.retry_after(), None);
    }
    assert!(limiter.snapshot()[0].tokens.abs() < 1e-9);
    assert!(matches!(
        limiter.try_acquire("message", 1.0),
        Err(RateLimitError::Denied { .. })
    ));
}

/// **VALUE**: Limiter errors point at the code that asked for tokens.
///
/// **WHY THIS MATTERS**: A denied or invalid acquire is a caller problem. A location
/// inside the limiter tells the operator nothing about which handler misbehaved.
///
/// **BUG THIS CATCHES**: `try_acquire` losing `#[track_caller]`, so every error reports
/// the same line in the rate limit module.
#[test]
fn given_rejected_acquire_when_inspecting_location_then_points_at_caller() {
    // GIVEN
    let limiter = RateLimiter::with_clock(
        &limits("bulk", 2.0, 1.0),
        Arc::new(ManualClock::new()),
    );

    // WHEN
    let too_big = limiter.try_acquire("bulk", 3.0).unwrap_err();
    let negative = limiter.try_acquire("bulk", -1.0).unwrap_err();

    // THEN
    for err in [too_big, negative] {
        let location = match err {
            RateLimitError::CostExceedsCapacity { location, .. }
            | RateLimitError::InvalidCost { location, .. } => location,
            other => panic!("unexpected {other}"),
        };
        assert!(location.file.ends_with("rate_limit.rs"), "{location}");
        assert!(location.file.contains("tests"), "{location}");
    }
}
