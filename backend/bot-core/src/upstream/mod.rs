//! Seam between the connection manager and the chat service.
//!
//! The manager only sees these traits; the concrete transport lives in
//! [`websocket`]. Tests drive the manager with scripted implementations.

pub mod websocket;

use crate::queue::RawEvent;

use common::RedactedToken;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Why a handshake did not produce a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
    /// The service refused the credential. Retrying cannot help.
    AuthRejected(String),
    /// The service speaks a protocol this client does not.
    ProtocolMismatch(String),
    /// Transport-level failure; retried with backoff.
    Network(String),
}

impl ConnectFailure {
    /// Fatal failures stop automatic reconnects.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ConnectFailure::Network(_))
    }
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectFailure::AuthRejected(reason) => write!(f, "credential rejected: {reason}"),
            ConnectFailure::ProtocolMismatch(reason) => write!(f, "protocol mismatch: {reason}"),
            ConnectFailure::Network(reason) => write!(f, "network error: {reason}"),
        }
    }
}

/// Result of one upstream read.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    Event(RawEvent),
    /// Orderly close by the service.
    Closed,
    /// Connection lost; reconnect.
    Error(String),
    /// The service ended the session in a way that forbids reconnecting.
    Fatal(String),
}

/// Result of delivering one action.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Ack,
    /// The service itself throttled the action.
    RateLimited { retry_after: Duration },
    Error(String),
}

/// An outbound request produced by a command handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundAction {
    /// Rate-limit category, a configuration string.
    pub category: String,
    pub cost: f64,
    pub payload: Value,
}

impl OutboundAction {
    pub fn new(category: impl Into<String>, payload: Value) -> Self {
        Self {
            category: category.into(),
            cost: 1.0,
            payload,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

#[async_trait]
pub trait UpstreamService: Send + Sync {
    /// Open a session authenticated with `credential`.
    ///
    /// Implementations must not keep the credential past the handshake.
    async fn connect(&self, credential: &RedactedToken) -> Result<UpstreamLink, ConnectFailure>;
}

#[async_trait]
pub trait UpstreamReader: Send {
    async fn read_event(&mut self) -> ReadOutcome;
}

#[async_trait]
pub trait UpstreamWriter: Send + Sync {
    async fn send_action(&self, action: &OutboundAction) -> SendOutcome;

    /// Release the session. Further sends return [`SendOutcome::Error`].
    async fn close(&self);
}

/// An established session, split so reads and writes proceed independently.
pub struct UpstreamLink {
    pub reader: Box<dyn UpstreamReader>,
    pub writer: Arc<dyn UpstreamWriter>,
}
