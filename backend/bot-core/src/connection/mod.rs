//! Upstream connection: reconnect state machine, event intake and rate
//! limited action delivery.

mod manager;
mod reconnect;
mod state;

pub use manager::{ConnectionManager, ConnectionStatsSnapshot};
pub use reconnect::ReconnectPolicy;
pub use state::ConnectionState;

use crate::error::connection::ConnectionError;
use crate::upstream::OutboundAction;

use std::time::Duration;

use async_trait::async_trait;

/// What happened to an action accepted by [`ActionSink::send_action`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionReceipt {
    Sent,
    /// Queued locally; expected to go out after `retry_after`.
    RateLimited { retry_after: Duration },
}

/// Outbound path used by command handlers.
///
/// Every action passes the rate limiter before it reaches the upstream.
#[async_trait]
pub trait ActionSink: Send + Sync {
    async fn send_action(&self, action: OutboundAction) -> Result<ActionReceipt, ConnectionError>;
}
