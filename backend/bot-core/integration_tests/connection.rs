use crate::helpers::eventually;
use crate::helpers::scripted_upstream::{
    ConnectScript, ScriptedUpstream, StaticCredential, TEST_CREDENTIAL, UPSTREAM_THROTTLE, session,
};

use bot_core::config::{
    BucketConfig, ConnectionConfig, DenialPolicy, MESSAGE_CATEGORY, QueueConfig, RateLimitsConfig,
};
use bot_core::connection::{ActionReceipt, ActionSink, ConnectionManager, ConnectionState};
use bot_core::error::connection::ConnectionError;
use bot_core::error::rate_limit::RateLimitError;
use bot_core::queue::{EventConsumer, event_queue};
use bot_core::rate_limit::RateLimiter;
use bot_core::token_store::CredentialProvider;
use bot_core::upstream::{ConnectFailure, OutboundAction};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn connection_config(base_delay_ms: u64) -> ConnectionConfig {
    ConnectionConfig {
        base_delay_ms,
        max_delay_ms: base_delay_ms * 8,
        jitter_ms: 0,
        handshake_timeout_ms: 1_000,
        read_timeout_ms: 3_600_000,
        deferred_capacity: 100,
    }
}

/// "message": 5 tokens, 1 per second, deferred. "reaction": 1 token, 0.5 per second, rejected.
fn limits() -> RateLimitsConfig {
    RateLimitsConfig {
        default: BucketConfig::conservative(),
        categories: HashMap::from([
            (
                MESSAGE_CATEGORY.to_string(),
                BucketConfig::new(5.0, 1.0, DenialPolicy::Defer),
            ),
            (
                "reaction".to_string(),
                BucketConfig::new(1.0, 0.5, DenialPolicy::Reject),
            ),
        ]),
    }
}

fn manager_with(
    config: &ConnectionConfig,
    service: Arc<ScriptedUpstream>,
    credentials: Arc<dyn CredentialProvider>,
) -> ConnectionManager {
    ConnectionManager::new(
        config,
        service,
        credentials,
        Arc::new(RateLimiter::new(&limits())),
    )
}

struct Running {
    task: JoinHandle<()>,
    cancel: CancellationToken,
    consumer: EventConsumer,
}

fn run(manager: &ConnectionManager) -> Running {
    let (producer, consumer) = event_queue(&QueueConfig::default());
    let cancel = CancellationToken::new();
    let task = {
        let manager = manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.run(producer, cancel).await })
    };
    Running {
        task,
        cancel,
        consumer,
    }
}

async fn next_transition(rx: &mut broadcast::Receiver<ConnectionState>) -> ConnectionState {
    tokio::time::timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("no transition within 60s")
        .expect("transition channel closed")
}

/// **VALUE**: A dropped session goes Connected → Backoff(1) → Connecting → Connected.
///
/// **WHY THIS MATTERS**: This is the self-healing path every network blip takes. Each
/// state is visible to operators through status reports.
///
/// **BUG THIS CATCHES**:
/// - Reconnecting without backoff (hammering the upstream)
/// - Attempt counter starting at 0 or not resetting after a success
/// - Skipping the Connecting state
#[tokio::test(start_paused = true)]
async fn given_connected_session_when_connection_drops_then_backs_off_and_reconnects() {
    // GIVEN: Two sessions the upstream will accept
    let (first, first_feed) = session();
    let (second, _second_feed) = session();
    let service = ScriptedUpstream::new(vec![first, second]);
    let manager = manager_with(&connection_config(100), service.clone(), StaticCredential::valid());
    let mut transitions = manager.transitions();

    // WHEN: Running, then the first session drops
    let running = run(&manager);
    assert_eq!(next_transition(&mut transitions).await, ConnectionState::Connecting);
    assert_eq!(next_transition(&mut transitions).await, ConnectionState::Connected);
    first_feed.drop_connection();

    // THEN
    match next_transition(&mut transitions).await {
        ConnectionState::Backoff { attempt, delay, .. } => {
            assert_eq!(attempt, 1);
            assert_eq!(delay, Duration::from_millis(100));
        }
        other => panic!("expected Backoff, got {other}"),
    }
    assert_eq!(next_transition(&mut transitions).await, ConnectionState::Connecting);
    assert_eq!(next_transition(&mut transitions).await, ConnectionState::Connected);

    assert_eq!(service.connect_calls(), 2);
    assert_eq!(manager.stats().connects, 2);
    assert!(
        manager
            .last_error()
            .is_some_and(|e| e.contains("connection reset"))
    );

    running.cancel.cancel();
    running.task.await.unwrap();
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

/// **VALUE**: Consecutive failures grow the delay exponentially.
///
/// **BUG THIS CATCHES**: Fixed delay between retries, or delay growth that ignores
/// failures before the first successful connect.
#[tokio::test(start_paused = true)]
async fn given_upstream_down_when_retrying_then_delays_double() {
    // GIVEN: Every connect fails at the network level
    let service = ScriptedUpstream::new(Vec::new());
    let manager = manager_with(&connection_config(100), service.clone(), StaticCredential::valid());
    let mut transitions = manager.transitions();

    // WHEN
    let running = run(&manager);

    // THEN: 100, 200, 400ms
    let mut delays = Vec::new();
    while delays.len() < 3 {
        if let ConnectionState::Backoff { delay, .. } = next_transition(&mut transitions).await {
            delays.push(delay.as_millis() as u64);
        }
    }
    assert_eq!(delays, vec![100, 200, 400]);

    running.cancel.cancel();
    running.task.await.unwrap();
}

/// **VALUE**: Events reach the queue in arrival order with sequence ids.
#[tokio::test(start_paused = true)]
async fn given_connected_session_when_events_arrive_then_enqueued_in_order() {
    // GIVEN
    let (script, feed) = session();
    let service = ScriptedUpstream::new(vec![script]);
    let manager = manager_with(&connection_config(100), service, StaticCredential::valid());
    let mut running = run(&manager);

    // WHEN
    for n in 0..3 {
        feed.event("message", json!({ "content": format!("hello {n}") }));
    }

    // THEN
    for n in 0..3u64 {
        let event = running.consumer.dequeue().await.expect("event");
        assert_eq!(event.seq, n + 1);
        assert_eq!(event.payload["content"], format!("hello {n}"));
    }
    assert_eq!(manager.stats().events_received, 3);

    running.cancel.cancel();
    running.task.await.unwrap();
}

/// **VALUE**: Shutdown during backoff ends the manager promptly in Disconnected.
///
/// **WHY THIS MATTERS**: With a five-minute backoff cap, a shutdown that waits out the
/// timer makes the worker miss its stop deadline and get killed.
///
/// **BUG THIS CATCHES**: Uncancellable sleep in the backoff state, or one more connect
/// attempt after cancel.
#[tokio::test(start_paused = true)]
async fn given_backoff_when_cancelled_then_disconnected_without_further_attempts() {
    // GIVEN: Upstream unreachable, long backoff
    let service = ScriptedUpstream::new(Vec::new());
    let manager = manager_with(&connection_config(60_000), service.clone(), StaticCredential::valid());
    let mut transitions = manager.transitions();
    let running = run(&manager);

    loop {
        if matches!(
            next_transition(&mut transitions).await,
            ConnectionState::Backoff { .. }
        ) {
            break;
        }
    }

    // WHEN
    let cancelled_at = Instant::now();
    running.cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), running.task)
        .await
        .expect("manager should stop promptly")
        .unwrap();

    // THEN
    assert!(Instant::now() - cancelled_at < Duration::from_secs(1));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(next_transition(&mut transitions).await, ConnectionState::Disconnected);
    assert_eq!(service.connect_calls(), 1);
}

/// **VALUE**: A rejected credential is fatal: no retries, and sends fail with Fatal.
///
/// **WHY THIS MATTERS**: Retrying a revoked token in a loop is what gets an account
/// flagged. Operators must fix the credential first.
///
/// **BUG THIS CATCHES**: AuthRejected treated like a network error and retried.
#[tokio::test(start_paused = true)]
async fn given_auth_rejected_when_connecting_then_fatal_without_retry() {
    // GIVEN
    let service = ScriptedUpstream::new(vec![ConnectScript::Refuse(
        ConnectFailure::AuthRejected("invalid token".to_string()),
    )]);
    let manager = manager_with(&connection_config(100), service.clone(), StaticCredential::valid());

    // WHEN: The manager runs and returns on its own
    let running = run(&manager);
    tokio::time::timeout(Duration::from_secs(5), running.task)
        .await
        .expect("fatal should end run()")
        .unwrap();

    // THEN
    assert!(manager.state().is_fatal());
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(service.connect_calls(), 1);

    let send = manager
        .send_action(OutboundAction::new(MESSAGE_CATEGORY, json!({})))
        .await;
    assert!(matches!(send, Err(ConnectionError::Fatal { .. })));
}

/// **VALUE**: A missing credential is fatal before any connect attempt.
#[tokio::test(start_paused = true)]
async fn given_no_credential_when_running_then_fatal_without_connecting() {
    let service = ScriptedUpstream::new(Vec::new());
    let manager = manager_with(&connection_config(100), service.clone(), StaticCredential::missing());

    let running = run(&manager);
    tokio::time::timeout(Duration::from_secs(5), running.task)
        .await
        .expect("fatal should end run()")
        .unwrap();

    assert!(manager.state().is_fatal());
    assert_eq!(service.connect_calls(), 0);
}

/// **VALUE**: A fatal close mid-session stops reconnects.
#[tokio::test(start_paused = true)]
async fn given_connected_session_when_upstream_sends_fatal_close_then_fatal() {
    // GIVEN
    let (script, feed) = session();
    let (spare, _spare_feed) = session();
    let service = ScriptedUpstream::new(vec![script, spare]);
    let manager = manager_with(&connection_config(100), service.clone(), StaticCredential::valid());
    let running = run(&manager);
    eventually("Connected", Duration::from_secs(5), || {
        manager.is_connected().then_some(())
    })
    .await;

    // WHEN
    feed.fatal("authentication revoked");

    // THEN
    tokio::time::timeout(Duration::from_secs(5), running.task)
        .await
        .expect("fatal should end run()")
        .unwrap();
    assert_eq!(
        manager.state(),
        ConnectionState::Fatal {
            reason: "authentication revoked".to_string()
        }
    );
    assert_eq!(service.connect_calls(), 1);
}

/// **VALUE**: The handshake receives the stored credential.
#[tokio::test(start_paused = true)]
async fn given_credential_provider_when_connecting_then_credential_passed_to_upstream() {
    let (script, _feed) = session();
    let service = ScriptedUpstream::new(vec![script]);
    let manager = manager_with(&connection_config(100), service.clone(), StaticCredential::valid());
    let running = run(&manager);

    eventually("Connected", Duration::from_secs(5), || {
        manager.is_connected().then_some(())
    })
    .await;

    assert_eq!(service.credentials_seen(), vec![TEST_CREDENTIAL.to_string()]);
    running.cancel.cancel();
    running.task.await.unwrap();
}

/// **VALUE**: Ten actions against a 5-token, 1/s bucket: five go at once, the rest one
/// per second, in order, each told when it will go.
///
/// **WHY THIS MATTERS**: This is the upstream ban protection. Bursting past capacity or
/// reordering replies are both user-visible failures.
///
/// **BUG THIS CATCHES**:
/// - Deferred actions sent as a burst when tokens return
/// - Retry hints that ignore actions already waiting
/// - Later actions overtaking the backlog
#[tokio::test(start_paused = true)]
async fn given_five_token_bucket_when_ten_actions_sent_then_five_now_and_one_per_second() {
    // GIVEN
    let (script, _feed) = session();
    let service = ScriptedUpstream::new(vec![script]);
    let manager = manager_with(&connection_config(100), service.clone(), StaticCredential::valid());
    let running = run(&manager);
    eventually("Connected", Duration::from_secs(5), || {
        manager.is_connected().then_some(())
    })
    .await;

    // WHEN
    let started = Instant::now();
    let mut receipts = Vec::new();
    for n in 0..10 {
        let action = OutboundAction::new(MESSAGE_CATEGORY, json!({ "n": n }));
        receipts.push(manager.send_action(action).await.expect("send_action"));
    }

    // THEN: Receipts
    assert!(receipts[..5].iter().all(|r| *r == ActionReceipt::Sent));
    for (k, receipt) in receipts[5..].iter().enumerate() {
        assert_eq!(
            *receipt,
            ActionReceipt::RateLimited {
                retry_after: Duration::from_secs(k as u64 + 1)
            }
        );
    }

    // THEN: Delivery order and pacing
    let sent = eventually("all ten sent", Duration::from_secs(30), || {
        let sent = service.sent();
        (sent.len() == 10).then_some(sent)
    })
    .await;

    let order: Vec<u64> = sent
        .iter()
        .map(|s| s.action.payload["n"].as_u64().unwrap())
        .collect();
    assert_eq!(order, (0..10).collect::<Vec<u64>>());

    for (i, s) in sent.iter().enumerate() {
        let elapsed = s.at - started;
        let allowed = 5 + elapsed.as_secs() as usize;
        assert!(i < allowed, "action {i} sent after only {elapsed:?}");
    }
    assert!(sent[9].at - started >= Duration::from_secs(5));
    assert_eq!(manager.stats().actions_deferred, 5);
    assert_eq!(manager.stats().deferred_pending, 0);

    running.cancel.cancel();
    running.task.await.unwrap();
}

/// **VALUE**: A rejecting category fails the call with a retry hint and sends nothing.
#[tokio::test(start_paused = true)]
async fn given_rejecting_category_when_exhausted_then_rate_limited_error() {
    // GIVEN
    let (script, _feed) = session();
    let service = ScriptedUpstream::new(vec![script]);
    let manager = manager_with(&connection_config(100), service.clone(), StaticCredential::valid());
    let running = run(&manager);
    eventually("Connected", Duration::from_secs(5), || {
        manager.is_connected().then_some(())
    })
    .await;

    // WHEN
    let first = manager
        .send_action(OutboundAction::new("reaction", json!({ "emoji": "+1" })))
        .await;
    let second = manager
        .send_action(OutboundAction::new("reaction", json!({ "emoji": "+1" })))
        .await;

    // THEN
    assert_eq!(first.unwrap(), ActionReceipt::Sent);
    match second {
        Err(ConnectionError::RateLimited {
            category,
            retry_after,
            ..
        }) => {
            assert_eq!(category, "reaction");
            assert_eq!(retry_after, Duration::from_secs(2));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
    assert_eq!(service.sent().len(), 1);
    assert_eq!(manager.stats().actions_rejected, 1);

    running.cancel.cancel();
    running.task.await.unwrap();
}

/// **VALUE**: An action the upstream throttles after the limiter admitted it is retried
/// without being charged again.
///
/// **WHY THIS MATTERS**: Paying twice for one action drains the bucket faster than the
/// configured rate and delays everything queued behind it.
///
/// **BUG THIS CATCHES**: The deferred pump calling `try_acquire` for an action whose tokens
/// were already taken.
#[tokio::test(start_paused = true)]
async fn given_upstream_throttles_admitted_action_when_retried_then_charged_once() {
    // GIVEN: A slow two-token category and an upstream that throttles the next send
    let (script, _feed) = session();
    let service = ScriptedUpstream::new(vec![script]);
    let slow = RateLimitsConfig {
        default: BucketConfig::conservative(),
        categories: HashMap::from([(
            "slow".to_string(),
            BucketConfig::new(2.0, 0.001, DenialPolicy::Defer),
        )]),
    };
    let manager = ConnectionManager::new(
        &connection_config(100),
        service.clone(),
        StaticCredential::valid(),
        Arc::new(RateLimiter::new(&slow)),
    );
    let running = run(&manager);
    eventually("Connected", Duration::from_secs(5), || {
        manager.is_connected().then_some(())
    })
    .await;
    service.throttle_next_sends(1);

    // WHEN
    let receipt = manager
        .send_action(OutboundAction::new("slow", json!({ "n": 1 })))
        .await
        .expect("send_action");

    // THEN: Deferred with the upstream's hint, then delivered once
    assert_eq!(
        receipt,
        ActionReceipt::RateLimited {
            retry_after: UPSTREAM_THROTTLE
        }
    );
    eventually("throttled action sent", Duration::from_secs(5), || {
        (service.sent().len() == 1).then_some(())
    })
    .await;

    let tokens = manager
        .limiter()
        .snapshot()
        .into_iter()
        .find(|b| b.category == "slow")
        .map(|b| b.tokens)
        .expect("slow bucket");
    assert!(tokens > 0.9, "charged twice, {tokens} tokens left");
    assert_eq!(manager.stats().actions_sent, 1);

    running.cancel.cancel();
    running.task.await.unwrap();
}

/// **VALUE**: Actions with a zero, negative or non-finite cost are refused.
///
/// **WHY THIS MATTERS**: A negative cost would add tokens to the bucket and let a handler
/// send past an exhausted limit.
///
/// **BUG THIS CATCHES**: Cost validation missing from the send path.
#[tokio::test(start_paused = true)]
async fn given_invalid_cost_when_sending_then_refused_and_nothing_sent() {
    // GIVEN
    let (script, _feed) = session();
    let service = ScriptedUpstream::new(vec![script]);
    let manager = manager_with(&connection_config(100), service.clone(), StaticCredential::valid());
    let running = run(&manager);
    eventually("Connected", Duration::from_secs(5), || {
        manager.is_connected().then_some(())
    })
    .await;

    // WHEN / THEN
    for cost in [-1.0, 0.0, f64::NAN, f64::INFINITY] {
        let action = OutboundAction::new(MESSAGE_CATEGORY, json!({})).with_cost(cost);
        let result = manager.send_action(action).await;
        assert!(
            matches!(
                result,
                Err(ConnectionError::RateLimit(RateLimitError::InvalidCost { .. }))
            ),
            "cost {cost} gave {result:?}"
        );
    }
    assert!(service.sent().is_empty());

    running.cancel.cancel();
    running.task.await.unwrap();
}

/// **VALUE**: The deferred queue is bounded.
///
/// **BUG THIS CATCHES**: A runaway handler growing memory without limit while the
/// bucket is empty.
#[tokio::test(start_paused = true)]
async fn given_full_deferred_queue_when_sending_then_queue_full() {
    // GIVEN: Room for two deferred actions
    let (script, _feed) = session();
    let service = ScriptedUpstream::new(vec![script]);
    let mut config = connection_config(100);
    config.deferred_capacity = 2;
    let manager = manager_with(&config, service, StaticCredential::valid());
    let running = run(&manager);
    eventually("Connected", Duration::from_secs(5), || {
        manager.is_connected().then_some(())
    })
    .await;

    // WHEN: 5 sent, 2 deferred, then one more
    for _ in 0..7 {
        manager
            .send_action(OutboundAction::new(MESSAGE_CATEGORY, json!({})))
            .await
            .unwrap();
    }
    let overflow = manager
        .send_action(OutboundAction::new(MESSAGE_CATEGORY, json!({})))
        .await;

    // THEN
    assert!(matches!(
        overflow,
        Err(ConnectionError::QueueFull { capacity: 2, .. })
    ));

    running.cancel.cancel();
    running.task.await.unwrap();
}

/// **VALUE**: Sending before any session exists fails with NotConnected.
#[tokio::test]
async fn given_never_connected_manager_when_sending_then_not_connected() {
    let service = ScriptedUpstream::new(Vec::new());
    let manager = manager_with(&connection_config(100), service, StaticCredential::valid());

    let result = manager
        .send_action(OutboundAction::new(MESSAGE_CATEGORY, json!({})))
        .await;

    assert!(matches!(result, Err(ConnectionError::NotConnected { .. })));
}
