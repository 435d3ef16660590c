use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

/// Upstream connection lifecycle. Owned by the `ConnectionManager`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting `delay` before attempt `attempt` at `next_retry_at`.
    Backoff {
        attempt: u32,
        delay: Duration,
        next_retry_at: Instant,
    },
    /// Unrecoverable; no automatic reconnects.
    Fatal { reason: String },
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Backoff { .. } => "Backoff",
            ConnectionState::Fatal { .. } => "Fatal",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectionState::Fatal { .. })
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Backoff { attempt, delay, .. } => {
                write!(f, "Backoff(attempt {attempt}, {delay:?})")
            }
            ConnectionState::Fatal { reason } => write!(f, "Fatal({reason})"),
            other => f.write_str(other.name()),
        }
    }
}
