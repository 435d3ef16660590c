//! IPC between the manager, the worker and control clients.
//!
//! - [`IpcChannel`]: framed protobuf over any byte stream, used on the
//!   worker's stdin/stdout.
//! - [`start_control_server`]: loopback-only WebSocket endpoint carrying the
//!   same [`IpcMessage`] frames for operators.
//!
//! Both sides number their frames from 1 and reject stale sequence numbers.

mod channel;
mod handle;
pub mod message;
mod sequence;
mod server;
mod session;

pub use channel::{ChannelStats, ChannelStatsSnapshot, IpcChannel, IpcReceiver, IpcSender};
pub use handle::ControlServerHandle;
pub use message::{IpcMessage, Payload};
pub use sequence::{SequenceCheck, SequenceTracker};
pub use server::start_control_server;
