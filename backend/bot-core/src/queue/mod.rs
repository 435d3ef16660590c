//! Bounded single-producer/single-consumer FIFO between the upstream read
//! loop and the command dispatcher.
//!
//! The producer half assigns sequence ids at enqueue time. With the default
//! [`OverflowPolicy::Block`], a full queue suspends the producer, which in
//! turn stops the upstream read loop from pulling more events.

use crate::config::{OverflowPolicy, QueueConfig};
use crate::error::queue::QueueError;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use log::{trace, warn};
use serde_json::Value;
use tokio::sync::Notify;

/// Event as read from the upstream service, before it is sequenced.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub kind: String,
    pub payload: Value,
    pub received_at: SystemTime,
}

impl RawEvent {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            received_at: SystemTime::now(),
        }
    }
}

/// Sequenced event handed to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub seq: u64,
    pub kind: String,
    pub payload: Value,
    pub received_at: SystemTime,
}

/// Result of an [`EventProducer::enqueue`] under the configured policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued { seq: u64 },
    /// Queued after evicting the oldest pending event.
    DroppedOldest { seq: u64, dropped_seq: u64 },
    /// The incoming event was discarded.
    DroppedNewest,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueStats {
    pub depth: usize,
    pub capacity: usize,
    pub utilization_percent: f64,
    pub enqueued: u64,
    pub dropped: u64,
}

struct QueueState {
    buffer: VecDeque<InboundEvent>,
    next_seq: u64,
    enqueued: u64,
    dropped: u64,
    producer_closed: bool,
    consumer_closed: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    capacity: usize,
    item_ready: Notify,
    space_ready: Notify,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn stats(&self) -> QueueStats {
        let state = self.state();
        QueueStats {
            depth: state.buffer.len(),
            capacity: self.capacity,
            utilization_percent: state.buffer.len() as f64 / self.capacity as f64 * 100.0,
            enqueued: state.enqueued,
            dropped: state.dropped,
        }
    }
}

/// Read-only handle on queue statistics, usable after both halves moved.
#[derive(Clone)]
pub struct QueueMonitor {
    shared: Arc<Shared>,
}

impl QueueMonitor {
    pub fn stats(&self) -> QueueStats {
        self.shared.stats()
    }
}

/// Create a queue with the configured bound and overflow policy.
pub fn event_queue(config: &QueueConfig) -> (EventProducer, EventConsumer) {
    let capacity = config.capacity.max(1);
    let shared = Arc::new(Shared {
        state: Mutex::new(QueueState {
            buffer: VecDeque::with_capacity(capacity),
            next_seq: 1,
            enqueued: 0,
            dropped: 0,
            producer_closed: false,
            consumer_closed: false,
        }),
        capacity,
        item_ready: Notify::new(),
        space_ready: Notify::new(),
    });

    (
        EventProducer {
            shared: Arc::clone(&shared),
            policy: config.overflow,
        },
        EventConsumer { shared },
    )
}

/// Sending half. Not `Clone`: there is exactly one producer.
pub struct EventProducer {
    shared: Arc<Shared>,
    policy: OverflowPolicy,
}

impl EventProducer {
    /// Append without waiting.
    ///
    /// # Errors
    ///
    /// [`QueueError::QueueFull`] at capacity, [`QueueError::Closed`] once the
    /// consumer is gone.
    pub fn try_enqueue(&mut self, event: RawEvent) -> Result<u64, QueueError> {
        let mut state = self.shared.state();

        if state.consumer_closed {
            return Err(QueueError::closed("event consumer dropped"));
        }
        if state.buffer.len() >= self.shared.capacity {
            return Err(QueueError::full(self.shared.capacity));
        }

        let seq = push(&mut state, event);
        drop(state);

        self.shared.item_ready.notify_one();
        Ok(seq)
    }

    /// Append, resolving a full queue with the configured overflow policy.
    pub async fn enqueue(&mut self, event: RawEvent) -> Result<EnqueueOutcome, QueueError> {
        match self.policy {
            OverflowPolicy::Block => self.enqueue_blocking(event).await,
            OverflowPolicy::DropOldest => self.enqueue_drop_oldest(event),
            OverflowPolicy::DropNewest => match self.try_enqueue(event) {
                Ok(seq) => Ok(EnqueueOutcome::Enqueued { seq }),
                Err(QueueError::QueueFull { capacity, .. }) => {
                    self.shared.state().dropped += 1;
                    warn!("Event queue full ({capacity}), dropped incoming event");
                    Ok(EnqueueOutcome::DroppedNewest)
                }
                Err(e) => Err(e),
            },
        }
    }

    async fn enqueue_blocking(&mut self, event: RawEvent) -> Result<EnqueueOutcome, QueueError> {
        loop {
            {
                let mut state = self.shared.state();

                if state.consumer_closed {
                    return Err(QueueError::closed("event consumer dropped"));
                }

                if state.buffer.len() < self.shared.capacity {
                    let seq = push(&mut state, event);
                    drop(state);
                    self.shared.item_ready.notify_one();
                    return Ok(EnqueueOutcome::Enqueued { seq });
                }
            }

            trace!("Event queue full, producer waiting");
            self.shared.space_ready.notified().await;
        }
    }

    fn enqueue_drop_oldest(&mut self, event: RawEvent) -> Result<EnqueueOutcome, QueueError> {
        let mut state = self.shared.state();

        if state.consumer_closed {
            return Err(QueueError::closed("event consumer dropped"));
        }

        let dropped_seq = if state.buffer.len() >= self.shared.capacity {
            let evicted = state.buffer.pop_front().map(|e| e.seq);
            state.dropped += 1;
            evicted
        } else {
            None
        };

        let seq = push(&mut state, event);
        drop(state);
        self.shared.item_ready.notify_one();

        Ok(match dropped_seq {
            Some(dropped_seq) => {
                warn!("Event queue full, evicted event #{dropped_seq}");
                EnqueueOutcome::DroppedOldest { seq, dropped_seq }
            }
            None => EnqueueOutcome::Enqueued { seq },
        })
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.stats()
    }

    pub fn monitor(&self) -> QueueMonitor {
        QueueMonitor {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for EventProducer {
    fn drop(&mut self) {
        self.shared.state().producer_closed = true;
        self.shared.item_ready.notify_one();
    }
}

/// Receiving half. Not `Clone`: fan-out happens after dequeue.
pub struct EventConsumer {
    shared: Arc<Shared>,
}

impl EventConsumer {
    /// Next event in sequence order; `None` once the producer is gone and the
    /// queue is drained.
    pub async fn dequeue(&mut self) -> Option<InboundEvent> {
        loop {
            {
                let mut state = self.shared.state();

                if let Some(event) = state.buffer.pop_front() {
                    drop(state);
                    self.shared.space_ready.notify_one();
                    return Some(event);
                }

                if state.producer_closed {
                    return None;
                }
            }

            self.shared.item_ready.notified().await;
        }
    }

    pub fn try_dequeue(&mut self) -> Option<InboundEvent> {
        let event = self.shared.state().buffer.pop_front();
        if event.is_some() {
            self.shared.space_ready.notify_one();
        }
        event
    }

    pub fn len(&self) -> usize {
        self.shared.state().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.stats()
    }
}

impl Drop for EventConsumer {
    fn drop(&mut self) {
        self.shared.state().consumer_closed = true;
        self.shared.space_ready.notify_one();
    }
}

fn push(state: &mut QueueState, event: RawEvent) -> u64 {
    let seq = state.next_seq;
    state.next_seq += 1;
    state.enqueued += 1;
    state.buffer.push_back(InboundEvent {
        seq,
        kind: event.kind,
        payload: event.payload,
        received_at: event.received_at,
    });
    seq
}
