//! Reconnect state machine and outbound action path.
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!                    |              |
//!                    v              v
//!               Backoff(n) <--------+        any -> Fatal
//! ```
//!
//! [`ConnectionManager::run`] owns the state machine and the upstream read
//! loop. `send_action` may be called concurrently from handlers; actions
//! denied by a deferring category wait in a bounded local queue that a pump
//! task drains as tokens refill.

use crate::config::{ConnectionConfig, DenialPolicy};
use crate::connection::reconnect::ReconnectPolicy;
use crate::connection::state::ConnectionState;
use crate::connection::{ActionReceipt, ActionSink};
use crate::error::connection::ConnectionError;
use crate::error::rate_limit::RateLimitError;
use crate::queue::EventProducer;
use crate::rate_limit::RateLimiter;
use crate::token_store::CredentialProvider;
use crate::upstream::{
    ConnectFailure, OutboundAction, ReadOutcome, SendOutcome, UpstreamLink, UpstreamReader,
    UpstreamService, UpstreamWriter,
};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::spawn as TokioSpawn;
use tokio::sync::{Notify, RwLock, broadcast, watch};
use tokio::time::{Instant, sleep as TokioSleep};
use tokio_util::sync::CancellationToken;

const TRANSITION_BUFFER: usize = 64;
const IDLE_PUMP_WAIT: Duration = Duration::from_secs(60);
const PUMP_RETRY_AFTER_ERROR: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct Stats {
    events_received: AtomicU64,
    actions_sent: AtomicU64,
    actions_deferred: AtomicU64,
    actions_rejected: AtomicU64,
    connects: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStatsSnapshot {
    pub events_received: u64,
    pub actions_sent: u64,
    pub actions_deferred: u64,
    pub actions_rejected: u64,
    pub deferred_pending: u64,
    pub connects: u64,
}

/// A queued action. `admitted` is set once the limiter has charged for it,
/// so a retry after an upstream throttle does not pay twice.
#[derive(Clone)]
struct Deferred {
    action: OutboundAction,
    admitted: bool,
}

#[derive(Default)]
struct DeferredActions {
    by_category: HashMap<String, VecDeque<Deferred>>,
    total: usize,
}

impl DeferredActions {
    fn has_backlog(&self, category: &str) -> bool {
        self.by_category
            .get(category)
            .is_some_and(|queue| !queue.is_empty())
    }

    fn front(&self, category: &str) -> Option<Deferred> {
        self.by_category
            .get(category)
            .and_then(|queue| queue.front().cloned())
    }

    fn pop_front(&mut self, category: &str) {
        if let Some(queue) = self.by_category.get_mut(category)
            && queue.pop_front().is_some()
        {
            self.total -= 1;
            if queue.is_empty() {
                self.by_category.remove(category);
            }
        }
    }

    fn push_front(&mut self, entry: Deferred) {
        self.by_category
            .entry(entry.action.category.clone())
            .or_default()
            .push_front(entry);
        self.total += 1;
    }
}

/// How a connected session ended.
enum SessionEnd {
    /// Cancelled or the event consumer went away.
    Stopped,
    Dropped(String),
    Fatal(String),
}

struct Inner {
    policy: ReconnectPolicy,
    handshake_timeout: Duration,
    read_timeout: Duration,
    deferred_capacity: usize,
    service: Arc<dyn UpstreamService>,
    credentials: Arc<dyn CredentialProvider>,
    limiter: Arc<RateLimiter>,
    state_tx: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
    writer: RwLock<Option<Arc<dyn UpstreamWriter>>>,
    deferred: Mutex<DeferredActions>,
    deferred_ready: Notify,
    stats: Stats,
    last_error: Mutex<Option<String>>,
}

/// Owns the upstream session. Clones share the same state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        config: &ConnectionConfig,
        service: Arc<dyn UpstreamService>,
        credentials: Arc<dyn CredentialProvider>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(TRANSITION_BUFFER);

        Self {
            inner: Arc::new(Inner {
                policy: ReconnectPolicy::from_config(config),
                handshake_timeout: config.handshake_timeout(),
                read_timeout: config.read_timeout(),
                deferred_capacity: config.deferred_capacity.max(1),
                service,
                credentials,
                limiter,
                state_tx,
                transitions,
                writer: RwLock::new(None),
                deferred: Mutex::new(DeferredActions::default()),
                deferred_ready: Notify::new(),
                stats: Stats::default(),
                last_error: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state_tx.borrow().is_connected()
    }

    /// Latest state, for callers that only care about the current value.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Every transition in order, for callers that need the history.
    pub fn transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.transitions.subscribe()
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.limiter
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.inner.last_error).clone()
    }

    pub fn stats(&self) -> ConnectionStatsSnapshot {
        let stats = &self.inner.stats;
        ConnectionStatsSnapshot {
            events_received: stats.events_received.load(Ordering::Relaxed),
            actions_sent: stats.actions_sent.load(Ordering::Relaxed),
            actions_deferred: stats.actions_deferred.load(Ordering::Relaxed),
            actions_rejected: stats.actions_rejected.load(Ordering::Relaxed),
            deferred_pending: lock(&self.inner.deferred).total as u64,
            connects: stats.connects.load(Ordering::Relaxed),
        }
    }

    /// Drive the connection until `cancel` fires or a fatal error occurs.
    ///
    /// Inbound events go to `producer` in arrival order. Ends in
    /// `Disconnected` when cancelled and stays in `Fatal` otherwise.
    pub async fn run(&self, mut producer: EventProducer, cancel: CancellationToken) {
        let pump_cancel = cancel.child_token();
        let pump = TokioSpawn(self.clone().pump_deferred(pump_cancel.clone()));
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            self.set_state(ConnectionState::Connecting);

            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                connected = self.connect_once() => connected,
            };

            match connected {
                Ok(UpstreamLink { reader, writer }) => {
                    attempt = 0;
                    *self.inner.writer.write().await = Some(Arc::clone(&writer));
                    self.inner.stats.connects.fetch_add(1, Ordering::Relaxed);
                    self.set_state(ConnectionState::Connected);
                    self.inner.deferred_ready.notify_one();

                    let ended = self.read_events(reader, &mut producer, &cancel).await;

                    self.inner.writer.write().await.take();
                    writer.close().await;

                    match ended {
                        SessionEnd::Stopped => break,
                        SessionEnd::Fatal(reason) => {
                            self.enter_fatal(reason);
                            pump_cancel.cancel();
                            let _ = pump.await;
                            return;
                        }
                        SessionEnd::Dropped(reason) => {
                            warn!("Upstream connection dropped: {reason}");
                            self.record_error(reason);
                        }
                    }
                }
                Err(failure) if failure.is_fatal() => {
                    self.enter_fatal(failure.to_string());
                    pump_cancel.cancel();
                    let _ = pump.await;
                    return;
                }
                Err(failure) => {
                    warn!("Upstream connect failed: {failure}");
                    self.record_error(failure.to_string());
                }
            }

            attempt = self.inner.policy.next_attempt(attempt);
            let delay = self.inner.policy.delay(attempt);
            self.set_state(ConnectionState::Backoff {
                attempt,
                delay,
                next_retry_at: Instant::now() + delay,
            });

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = TokioSleep(delay) => {}
            }
        }

        pump_cancel.cancel();
        let _ = pump.await;
        self.set_state(ConnectionState::Disconnected);
        info!("Connection manager stopped");
    }

    async fn connect_once(&self) -> Result<UpstreamLink, ConnectFailure> {
        let credential = self.inner.credentials.credential().map_err(|e| {
            ConnectFailure::AuthRejected(format!("credential unavailable: {e}"))
        })?;

        let result = tokio::time::timeout(
            self.inner.handshake_timeout,
            self.inner.service.connect(&credential),
        )
        .await;
        drop(credential);

        match result {
            Ok(link) => link,
            Err(_) => Err(ConnectFailure::Network(format!(
                "handshake timed out after {:?}",
                self.inner.handshake_timeout
            ))),
        }
    }

    async fn read_events(
        &self,
        mut reader: Box<dyn UpstreamReader>,
        producer: &mut EventProducer,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let read_timeout = self.inner.read_timeout;

        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return SessionEnd::Stopped,
                outcome = tokio::time::timeout(read_timeout, reader.read_event()) => outcome,
            };

            let event = match outcome {
                Ok(ReadOutcome::Event(event)) => event,
                Ok(ReadOutcome::Closed) => {
                    return SessionEnd::Dropped("upstream closed the connection".to_string());
                }
                Ok(ReadOutcome::Error(reason)) => return SessionEnd::Dropped(reason),
                Ok(ReadOutcome::Fatal(reason)) => return SessionEnd::Fatal(reason),
                Err(_) => {
                    return SessionEnd::Dropped(format!(
                        "no upstream traffic for {read_timeout:?}"
                    ));
                }
            };

            self.inner
                .stats
                .events_received
                .fetch_add(1, Ordering::Relaxed);

            let enqueued = tokio::select! {
                _ = cancel.cancelled() => return SessionEnd::Stopped,
                enqueued = producer.enqueue(event) => enqueued,
            };

            if let Err(e) = enqueued {
                debug!("Event queue closed, stopping reads: {e}");
                return SessionEnd::Stopped;
            }
        }
    }

    fn enter_fatal(&self, reason: String) {
        error!("Upstream connection is fatal, not reconnecting: {reason}");
        self.record_error(reason.clone());

        let pending = lock(&self.inner.deferred).total;
        if pending > 0 {
            error!("{pending} deferred action(s) will not be sent");
        }

        self.set_state(ConnectionState::Fatal { reason });
    }

    fn record_error(&self, reason: String) {
        *lock(&self.inner.last_error) = Some(reason);
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.inner.state_tx.send_replace(state.clone());
        if previous != state {
            info!("Connection state {previous} -> {state}");
            let _ = self.inner.transitions.send(state);
        }
    }

    fn defer(&self, action: OutboundAction, admitted: bool) -> Result<ActionReceipt, ConnectionError> {
        let category = action.category.clone();
        let backlog = {
            let mut deferred = lock(&self.inner.deferred);
            if deferred.total >= self.inner.deferred_capacity {
                return Err(ConnectionError::queue_full(self.inner.deferred_capacity));
            }

            let queue = deferred.by_category.entry(category.clone()).or_default();
            queue.push_back(Deferred { action, admitted });
            let backlog: f64 = queue
                .iter()
                .filter(|queued| !queued.admitted)
                .map(|queued| queued.action.cost)
                .sum();
            deferred.total += 1;
            backlog
        };

        self.inner
            .stats
            .actions_deferred
            .fetch_add(1, Ordering::Relaxed);
        self.inner.deferred_ready.notify_one();

        let retry_after = self.inner.limiter.estimate_wait(&category, backlog);
        debug!("Deferred action on '{category}', expected in {retry_after:?}");
        Ok(ActionReceipt::RateLimited { retry_after })
    }

    async fn deliver(
        &self,
        writer: &Arc<dyn UpstreamWriter>,
        action: OutboundAction,
        policy: DenialPolicy,
    ) -> Result<ActionReceipt, ConnectionError> {
        match writer.send_action(&action).await {
            SendOutcome::Ack => {
                self.inner.stats.actions_sent.fetch_add(1, Ordering::Relaxed);
                Ok(ActionReceipt::Sent)
            }
            SendOutcome::RateLimited { retry_after } => match policy {
                DenialPolicy::Defer => match self.defer(action, true)? {
                    ActionReceipt::RateLimited { retry_after: local } => {
                        Ok(ActionReceipt::RateLimited {
                            retry_after: local.max(retry_after),
                        })
                    }
                    receipt => Ok(receipt),
                },
                DenialPolicy::Reject => {
                    self.inner
                        .stats
                        .actions_rejected
                        .fetch_add(1, Ordering::Relaxed);
                    Err(ConnectionError::rate_limited(action.category, retry_after))
                }
            },
            SendOutcome::Error(message) => Err(ConnectionError::upstream(message)),
        }
    }

    async fn pump_deferred(self, cancel: CancellationToken) {
        loop {
            let next = self.drain_deferred().await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.inner.deferred_ready.notified() => {}
                _ = TokioSleep(next.unwrap_or(IDLE_PUMP_WAIT)) => {}
            }
        }

        let pending = lock(&self.inner.deferred).total;
        if pending > 0 {
            warn!("{pending} deferred action(s) not sent before shutdown");
        }
    }

    /// Send every deferred action the limiter admits now. Returns the wait
    /// until the next one could go, if any are left.
    async fn drain_deferred(&self) -> Option<Duration> {
        let writer = self.inner.writer.read().await.clone()?;

        let categories: Vec<String> = lock(&self.inner.deferred)
            .by_category
            .keys()
            .cloned()
            .collect();

        let mut next: Option<Duration> = None;

        for category in categories {
            loop {
                let Some(entry) = lock(&self.inner.deferred).front(&category) else {
                    break;
                };

                if !entry.admitted {
                    match self.inner.limiter.try_acquire(&category, entry.action.cost) {
                        Ok(()) => {}
                        Err(RateLimitError::Denied { retry_after, .. }) => {
                            next = Some(next.map_or(retry_after, |n| n.min(retry_after)));
                            break;
                        }
                        Err(e) => {
                            error!("Discarding deferred action that can never be admitted: {e}");
                            lock(&self.inner.deferred).pop_front(&category);
                            continue;
                        }
                    }
                }

                lock(&self.inner.deferred).pop_front(&category);
                let retry = Deferred {
                    action: entry.action,
                    admitted: true,
                };

                match writer.send_action(&retry.action).await {
                    SendOutcome::Ack => {
                        self.inner.stats.actions_sent.fetch_add(1, Ordering::Relaxed);
                        debug!("Sent deferred action on '{category}'");
                    }
                    SendOutcome::RateLimited { retry_after } => {
                        lock(&self.inner.deferred).push_front(retry);
                        next = Some(next.map_or(retry_after, |n| n.min(retry_after)));
                        break;
                    }
                    SendOutcome::Error(e) => {
                        warn!("Deferred action on '{category}' failed, will retry: {e}");
                        lock(&self.inner.deferred).push_front(retry);
                        return Some(PUMP_RETRY_AFTER_ERROR);
                    }
                }
            }
        }

        next
    }
}

#[async_trait]
impl ActionSink for ConnectionManager {
    /// Admit `action` through the rate limiter and deliver it.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::NotConnected`] outside `Connected`
    /// - [`ConnectionError::Fatal`] once the connection is fatal
    /// - [`ConnectionError::RateLimited`] for a denied action in a rejecting category
    /// - [`ConnectionError::QueueFull`] when the deferred queue is at its bound
    async fn send_action(&self, action: OutboundAction) -> Result<ActionReceipt, ConnectionError> {
        if let ConnectionState::Fatal { reason } = self.state() {
            return Err(ConnectionError::fatal(reason));
        }

        let Some(writer) = self.inner.writer.read().await.clone() else {
            return Err(ConnectionError::not_connected(format!(
                "cannot send while {}",
                self.state().name()
            )));
        };

        let category = action.category.clone();
        if !(action.cost.is_finite() && action.cost > 0.0) {
            return Err(RateLimitError::invalid_cost(category, action.cost).into());
        }

        let policy = self.inner.limiter.policy(&category);

        // Keep category order once a backlog exists.
        if policy == DenialPolicy::Defer && lock(&self.inner.deferred).has_backlog(&category) {
            return self.defer(action, false);
        }

        match self.inner.limiter.try_acquire(&category, action.cost) {
            Ok(()) => self.deliver(&writer, action, policy).await,
            Err(RateLimitError::Denied { retry_after, .. }) => match policy {
                DenialPolicy::Defer => self.defer(action, false),
                DenialPolicy::Reject => {
                    self.inner
                        .stats
                        .actions_rejected
                        .fetch_add(1, Ordering::Relaxed);
                    Err(ConnectionError::rate_limited(category, retry_after))
                }
            },
            Err(e) => Err(e.into()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}
