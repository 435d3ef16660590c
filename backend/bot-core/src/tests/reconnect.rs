use crate::config::ConnectionConfig;
use crate::connection::ReconnectPolicy;

use std::time::Duration;

fn policy(base_ms: u64, cap_ms: u64, jitter_ms: u64) -> ReconnectPolicy {
    ReconnectPolicy::new(
        Duration::from_millis(base_ms),
        Duration::from_millis(cap_ms),
        Duration::from_millis(jitter_ms),
    )
}

/// **VALUE**: Delays double from the base until they reach the cap.
///
/// **WHY THIS MATTERS**: Reconnecting too aggressively against a failing upstream gets
/// the account throttled. Waiting too long leaves the bot offline after a blip.
///
/// **BUG THIS CATCHES**: Exponent off by one (first retry at 2x base), or no cap.
#[test]
fn given_policy_when_attempts_grow_then_delay_doubles_up_to_cap() {
    // GIVEN: Base 1s, cap 10s, no jitter
    let policy = policy(1_000, 10_000, 0);

    // WHEN: Computing delays for attempts 1..=6
    let delays: Vec<u64> = (1..=6)
        .map(|n| policy.delay(n).as_millis() as u64)
        .collect();

    // THEN: 1, 2, 4, 8, then capped at 10
    assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 10_000, 10_000]);
}

/// **VALUE**: Very large attempt numbers neither overflow nor exceed the cap.
///
/// **BUG THIS CATCHES**: `1 << attempt` panicking on overflow after a long outage.
#[test]
fn given_huge_attempt_when_computing_delay_then_capped_without_overflow() {
    // GIVEN: Default connection config
    let policy = ReconnectPolicy::from_config(&ConnectionConfig::default());

    // WHEN: Asking for attempt u32::MAX
    let delay = policy.base_delay(u32::MAX);

    // THEN: Exactly the cap
    assert_eq!(delay, policy.cap());
}

/// **VALUE**: Jitter stays within `0..=jitter` of the base delay.
///
/// **WHY THIS MATTERS**: Jitter spreads reconnects across instances. It must never shorten
/// the wait below the exponential schedule.
///
/// **BUG THIS CATCHES**: Symmetric jitter that subtracts from the delay.
#[test]
fn given_jitter_when_sampling_delays_then_within_bounds() {
    // GIVEN: Base 100ms with 50ms jitter
    let policy = policy(100, 10_000, 50);

    // WHEN: Sampling attempt 3 many times
    for _ in 0..200 {
        let delay = policy.delay(3);

        // THEN: Between 400ms and 450ms inclusive
        assert!(delay >= Duration::from_millis(400), "{delay:?}");
        assert!(delay <= Duration::from_millis(450), "{delay:?}");
    }
}

/// **VALUE**: The attempt counter stops growing at the cap.
///
/// **WHY THIS MATTERS**: Status reports show the attempt number. Once the delay is capped,
/// incrementing further only makes the number meaningless.
///
/// **BUG THIS CATCHES**: Counter advancing forever during a long outage.
#[test]
fn given_capped_attempt_when_failing_again_then_attempt_stays() {
    // GIVEN: Base 1s, cap 4s (attempt 3 reaches the cap)
    let policy = policy(1_000, 4_000, 0);

    // WHEN: Stepping the counter from zero
    let mut attempts = Vec::new();
    let mut attempt = 0;
    for _ in 0..5 {
        attempt = policy.next_attempt(attempt);
        attempts.push(attempt);
    }

    // THEN: 1, 2, 3, then it holds
    assert_eq!(attempts, vec![1, 2, 3, 3, 3]);
}

/// **VALUE**: Successive jittered delays never shrink below the cap when jitter <= base.
///
/// **BUG THIS CATCHES**: Jitter large enough that attempt n+1 can wait less than attempt n.
#[test]
fn given_jitter_not_above_base_when_stepping_then_delays_non_decreasing() {
    // GIVEN: Base equals jitter
    let policy = policy(200, 100_000, 200);

    // WHEN/THEN: Max of attempt n never exceeds min of attempt n+1
    for n in 1..8 {
        let max_current = policy.base_delay(n) + policy.jitter();
        let min_next = policy.base_delay(n + 1);
        assert!(max_current <= min_next, "attempt {n}");
    }
}
