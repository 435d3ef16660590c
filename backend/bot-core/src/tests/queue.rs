use crate::config::{OverflowPolicy, QueueConfig};
use crate::error::queue::QueueError;
use crate::queue::{EnqueueOutcome, RawEvent, event_queue};

use std::time::Duration;

use serde_json::json;

fn config(capacity: usize, overflow: OverflowPolicy) -> QueueConfig {
    QueueConfig { capacity, overflow }
}

fn event(n: u64) -> RawEvent {
    RawEvent::new("message", json!({ "n": n }))
}

/// **VALUE**: Events come out in the order they went in, with increasing sequence ids.
///
/// **WHY THIS MATTERS**: Handlers see conversations in order. A reply to a message that
/// has not been "seen" yet is a user-visible bug.
///
/// **BUG THIS CATCHES**: LIFO pops or sequence ids assigned at dequeue time.
#[tokio::test]
async fn given_enqueued_events_when_dequeued_then_fifo_with_sequence_ids() {
    // GIVEN: Five events enqueued
    let (mut producer, mut consumer) = event_queue(&config(10, OverflowPolicy::Block));
    for n in 0..5 {
        producer.enqueue(event(n)).await.unwrap();
    }

    // WHEN: Draining
    let mut seen = Vec::new();
    while let Some(event) = consumer.try_dequeue() {
        seen.push((event.seq, event.payload["n"].as_u64().unwrap()));
    }

    // THEN: Same order, ids 1..=5
    assert_eq!(seen, vec![(1, 0), (2, 1), (3, 2), (4, 3), (5, 4)]);
}

/// **VALUE**: `try_enqueue` fails fast at capacity.
///
/// **BUG THIS CATCHES**: Unbounded growth past the configured capacity.
#[tokio::test]
async fn given_full_queue_when_try_enqueue_then_queue_full() {
    // GIVEN: Capacity 2, filled
    let (mut producer, _consumer) = event_queue(&config(2, OverflowPolicy::Block));
    producer.try_enqueue(event(1)).unwrap();
    producer.try_enqueue(event(2)).unwrap();

    // WHEN: A third event
    let result = producer.try_enqueue(event(3));

    // THEN: QueueFull with the capacity, depth unchanged
    assert!(matches!(result, Err(QueueError::QueueFull { capacity: 2, .. })));
    assert_eq!(producer.stats().depth, 2);
}

/// **VALUE**: With `Block`, a full queue suspends the producer until the consumer pops.
///
/// **WHY THIS MATTERS**: This is the backpressure path. A slow handler must slow intake
/// instead of losing events.
///
/// **BUG THIS CATCHES**: Producer spinning, dropping, or never waking after space frees up.
#[tokio::test]
async fn given_block_policy_when_full_then_producer_waits_for_space() {
    // GIVEN: Capacity 1, filled
    let (mut producer, mut consumer) = event_queue(&config(1, OverflowPolicy::Block));
    producer.enqueue(event(1)).await.unwrap();

    // WHEN: Enqueueing another in the background
    let pending = tokio::spawn(async move {
        let outcome = producer.enqueue(event(2)).await;
        (producer, outcome)
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!pending.is_finished(), "producer should be suspended");

    // THEN: Popping one frees the producer, and order is preserved
    assert_eq!(consumer.dequeue().await.unwrap().seq, 1);
    let (_producer, outcome) = pending.await.unwrap();
    assert_eq!(outcome.unwrap(), EnqueueOutcome::Enqueued { seq: 2 });
    assert_eq!(consumer.dequeue().await.unwrap().seq, 2);
}

/// **VALUE**: `DropOldest` evicts the head and reports which event went.
///
/// **BUG THIS CATCHES**: Evicting from the tail, or losing the drop count.
#[tokio::test]
async fn given_drop_oldest_when_full_then_head_evicted() {
    // GIVEN: Capacity 2 holding #1 and #2
    let (mut producer, mut consumer) = event_queue(&config(2, OverflowPolicy::DropOldest));
    producer.enqueue(event(1)).await.unwrap();
    producer.enqueue(event(2)).await.unwrap();

    // WHEN: #3 arrives
    let outcome = producer.enqueue(event(3)).await.unwrap();

    // THEN: #1 is gone, #2 and #3 remain
    assert_eq!(outcome, EnqueueOutcome::DroppedOldest { seq: 3, dropped_seq: 1 });
    assert_eq!(consumer.try_dequeue().unwrap().seq, 2);
    assert_eq!(consumer.try_dequeue().unwrap().seq, 3);
    assert_eq!(consumer.stats().dropped, 1);
}

/// **VALUE**: `DropNewest` discards the incoming event and keeps the queue intact.
///
/// **BUG THIS CATCHES**: Sequence ids consumed by discarded events, leaving phantom gaps.
#[tokio::test]
async fn given_drop_newest_when_full_then_incoming_discarded() {
    // GIVEN: Capacity 1 holding #1
    let (mut producer, mut consumer) = event_queue(&config(1, OverflowPolicy::DropNewest));
    producer.enqueue(event(1)).await.unwrap();

    // WHEN: Another arrives, then space frees and one more arrives
    let dropped = producer.enqueue(event(2)).await.unwrap();
    consumer.try_dequeue().unwrap();
    let next = producer.enqueue(event(3)).await.unwrap();

    // THEN: The dropped event did not take a sequence id
    assert_eq!(dropped, EnqueueOutcome::DroppedNewest);
    assert_eq!(next, EnqueueOutcome::Enqueued { seq: 2 });
}

/// **VALUE**: The consumer drains remaining events after the producer is dropped, then ends.
///
/// **WHY THIS MATTERS**: On shutdown, events already read from upstream still get handled.
///
/// **BUG THIS CATCHES**: `dequeue` returning `None` while events remain buffered.
#[tokio::test]
async fn given_dropped_producer_when_dequeuing_then_drains_then_none() {
    // GIVEN: Two events, producer dropped
    let (mut producer, mut consumer) = event_queue(&config(4, OverflowPolicy::Block));
    producer.enqueue(event(1)).await.unwrap();
    producer.enqueue(event(2)).await.unwrap();
    drop(producer);

    // WHEN/THEN: Both come out, then the stream ends
    assert!(consumer.dequeue().await.is_some());
    assert!(consumer.dequeue().await.is_some());
    assert!(consumer.dequeue().await.is_none());
}

/// **VALUE**: Enqueueing after the consumer is gone fails instead of blocking forever.
///
/// **BUG THIS CATCHES**: A blocked producer that never wakes because nobody will pop.
#[tokio::test]
async fn given_dropped_consumer_when_enqueue_then_closed() {
    // GIVEN: Full queue, consumer dropped
    let (mut producer, consumer) = event_queue(&config(1, OverflowPolicy::Block));
    producer.enqueue(event(1)).await.unwrap();
    drop(consumer);

    // WHEN: Enqueueing with Block policy
    let result = tokio::time::timeout(Duration::from_secs(1), producer.enqueue(event(2))).await;

    // THEN: Closed error, promptly
    assert!(matches!(result, Ok(Err(QueueError::Closed { .. }))));
}

/// **VALUE**: Stats report depth and utilization.
#[tokio::test]
async fn given_half_full_queue_when_stats_then_fifty_percent() {
    // GIVEN: Capacity 4 with 2 events
    let (mut producer, _consumer) = event_queue(&config(4, OverflowPolicy::Block));
    producer.enqueue(event(1)).await.unwrap();
    producer.enqueue(event(2)).await.unwrap();

    // WHEN
    let stats = producer.monitor().stats();

    // THEN
    assert_eq!(stats.depth, 2);
    assert_eq!(stats.capacity, 4);
    assert!((stats.utilization_percent - 50.0).abs() < 1e-9);
    assert_eq!(stats.enqueued, 2);
}
