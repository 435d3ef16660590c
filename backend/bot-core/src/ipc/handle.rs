//! Handle to a running control server.

use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;

/// Returned by [`start_control_server`](crate::ipc::start_control_server).
///
/// Dropping the handle leaves the server running; call
/// [`shutdown`](Self::shutdown) to stop accepting connections.
pub struct ControlServerHandle {
    pub(crate) local_addr: SocketAddr,
    pub(crate) auth_token: String,
    pub(crate) shutdown: CancellationToken,
}

impl ControlServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Token clients must send in their `AuthHandshake`.
    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    /// Stop accepting connections and close open sessions.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Resolves once the server was shut down, locally or by a client's
    /// `Shutdown` request.
    pub async fn stopped(&self) {
        self.shutdown.cancelled().await
    }
}
