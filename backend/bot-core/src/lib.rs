//! Supervisor, worker runtime and their building blocks for a self-hosted
//! chat bot.
//!
//! The control process runs a [`supervisor::ProcessSupervisor`] and the
//! operator-facing control server; the worker process runs a
//! [`worker::WorkerRuntime`]. The two talk over [`ipc::IpcChannel`].

pub mod clock;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod ipc;
pub mod queue;
pub mod rate_limit;
pub mod supervisor;
pub mod token_store;
pub mod upstream;
pub mod worker;

#[cfg(test)]
mod tests;

pub const WORKER_BINARY: &str = "bot-worker";
pub const CONTROL_HOST: &str = "127.0.0.1";
pub const DEFAULT_CONTROL_PORT: u16 = 19876;
pub const DEFAULT_CONTROL_URL: &str =
    const_format::concatcp!("ws://", CONTROL_HOST, ":", DEFAULT_CONTROL_PORT);
