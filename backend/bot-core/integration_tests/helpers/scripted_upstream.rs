//! Upstream double whose connect results and session traffic are scripted.

use bot_core::connection::{ActionReceipt, ActionSink};
use bot_core::error::connection::ConnectionError;
use bot_core::error::token_store::TokenStoreError;
use bot_core::queue::RawEvent;
use bot_core::token_store::CredentialProvider;
use bot_core::upstream::{
    ConnectFailure, OutboundAction, ReadOutcome, SendOutcome, UpstreamLink, UpstreamReader,
    UpstreamService, UpstreamWriter,
};

use common::RedactedToken;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const TEST_CREDENTIAL: &str =
    "MTA4NzY1NDMyMTA5ODc2NTQz.GhJkLm.aB3dE5fG7hI9jK1lM3nO5pQ7rS9tU1vW3xY5z";

/// What the next `connect` call does.
pub enum ConnectScript {
    Accept(mpsc::UnboundedReceiver<ReadOutcome>),
    Refuse(ConnectFailure),
}

/// Test-side end of an accepted session.
pub struct SessionFeed {
    tx: mpsc::UnboundedSender<ReadOutcome>,
}

impl SessionFeed {
    pub fn event(&self, kind: &str, payload: Value) {
        let _ = self.tx.send(ReadOutcome::Event(RawEvent::new(kind, payload)));
    }

    /// Transport error; the manager should back off and reconnect.
    pub fn drop_connection(&self) {
        let _ = self.tx.send(ReadOutcome::Error("connection reset".to_string()));
    }

    pub fn fatal(&self, reason: &str) {
        let _ = self.tx.send(ReadOutcome::Fatal(reason.to_string()));
    }
}

/// A session the next `connect` will accept, plus its feed.
pub fn session() -> (ConnectScript, SessionFeed) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ConnectScript::Accept(rx), SessionFeed { tx })
}

#[derive(Debug, Clone)]
pub struct SentAction {
    pub at: Instant,
    pub action: OutboundAction,
}

/// Connect attempts beyond the script fail with a network error.
#[derive(Default)]
pub struct ScriptedUpstream {
    script: Mutex<VecDeque<ConnectScript>>,
    connect_calls: AtomicU32,
    credentials_seen: Mutex<Vec<String>>,
    sent: Arc<Mutex<Vec<SentAction>>>,
    throttled_sends: Arc<AtomicU32>,
}

/// Wait the upstream asks for when it throttles a send.
pub const UPSTREAM_THROTTLE: Duration = Duration::from_millis(500);

impl ScriptedUpstream {
    pub fn new(script: Vec<ConnectScript>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        })
    }

    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn credentials_seen(&self) -> Vec<String> {
        lock(&self.credentials_seen).clone()
    }

    pub fn sent(&self) -> Vec<SentAction> {
        lock(&self.sent).clone()
    }

    /// The next `count` sends are answered with `RateLimited` and not recorded.
    pub fn throttle_next_sends(&self, count: u32) {
        self.throttled_sends.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl UpstreamService for ScriptedUpstream {
    async fn connect(&self, credential: &RedactedToken) -> Result<UpstreamLink, ConnectFailure> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.credentials_seen).push(credential.as_str().to_string());

        let next = lock(&self.script).pop_front();
        match next {
            Some(ConnectScript::Accept(events)) => Ok(UpstreamLink {
                reader: Box::new(ScriptedReader { events }),
                writer: Arc::new(RecordingWriter {
                    sent: Arc::clone(&self.sent),
                    throttled_sends: Arc::clone(&self.throttled_sends),
                    closed: AtomicBool::new(false),
                }),
            }),
            Some(ConnectScript::Refuse(failure)) => Err(failure),
            None => Err(ConnectFailure::Network("script exhausted".to_string())),
        }
    }
}

struct ScriptedReader {
    events: mpsc::UnboundedReceiver<ReadOutcome>,
}

#[async_trait]
impl UpstreamReader for ScriptedReader {
    async fn read_event(&mut self) -> ReadOutcome {
        self.events.recv().await.unwrap_or(ReadOutcome::Closed)
    }
}

struct RecordingWriter {
    sent: Arc<Mutex<Vec<SentAction>>>,
    throttled_sends: Arc<AtomicU32>,
    closed: AtomicBool,
}

#[async_trait]
impl UpstreamWriter for RecordingWriter {
    async fn send_action(&self, action: &OutboundAction) -> SendOutcome {
        if self.closed.load(Ordering::SeqCst) {
            return SendOutcome::Error("session closed".to_string());
        }
        let throttled = self
            .throttled_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if throttled {
            return SendOutcome::RateLimited {
                retry_after: UPSTREAM_THROTTLE,
            };
        }
        lock(&self.sent).push(SentAction {
            at: Instant::now(),
            action: action.clone(),
        });
        SendOutcome::Ack
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Credential provider with a fixed answer.
pub struct StaticCredential(pub Option<String>);

impl StaticCredential {
    pub fn valid() -> Arc<Self> {
        Arc::new(Self(Some(TEST_CREDENTIAL.to_string())))
    }

    pub fn missing() -> Arc<Self> {
        Arc::new(Self(None))
    }
}

impl CredentialProvider for StaticCredential {
    fn credential(&self) -> Result<RedactedToken, TokenStoreError> {
        match &self.0 {
            Some(token) => Ok(RedactedToken::new(token.clone())),
            None => Err(TokenStoreError::not_configured()),
        }
    }
}

/// Action sink that records everything and always reports `Sent`.
#[derive(Default)]
pub struct RecordingSink {
    actions: Mutex<Vec<OutboundAction>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn actions(&self) -> Vec<OutboundAction> {
        lock(&self.actions).clone()
    }
}

#[async_trait]
impl ActionSink for RecordingSink {
    async fn send_action(&self, action: OutboundAction) -> Result<ActionReceipt, ConnectionError> {
        lock(&self.actions).push(action);
        Ok(ActionReceipt::Sent)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}
