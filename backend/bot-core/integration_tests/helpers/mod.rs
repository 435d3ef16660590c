//! Test doubles shared by the integration tests.
//!
//! - [`scripted_upstream`]: upstream service whose sessions the test feeds
//! - [`fake_worker`]: in-process worker speaking the IPC protocol over a duplex pipe
//! - [`control_client`]: websocket client for the control server

pub mod control_client;
pub mod fake_worker;
pub mod scripted_upstream;

use std::time::Duration;

use tokio::time::Instant;

/// Poll `check` until it returns `Some`, failing the test after `within`.
pub async fn eventually<T, F>(what: &str, within: Duration, mut check: F) -> T
where
    F: FnMut() -> Option<T>,
{
    let deadline = Instant::now() + within;
    loop {
        if let Some(value) = check() {
            return value;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
