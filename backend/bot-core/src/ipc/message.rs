//! Wire messages exchanged between control process, supervisor and worker.
//!
//! Hand-written prost definitions; every frame on a channel is one
//! [`IpcMessage`] carrying a per-direction sequence number.

use prost::{Enumeration, Message};

#[derive(Clone, PartialEq, Message)]
pub struct IpcMessage {
    /// Strictly increasing per channel direction, starting at 1.
    #[prost(uint64, tag = "1")]
    pub seq: u64,
    #[prost(oneof = "ipc_message::Payload", tags = "2, 3, 4, 5, 6, 7, 8, 9, 10")]
    pub payload: Option<ipc_message::Payload>,
}

pub mod ipc_message {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "2")]
        StartRequest(super::StartRequest),
        #[prost(message, tag = "3")]
        StopRequest(super::StopRequest),
        #[prost(message, tag = "4")]
        StatusQuery(super::StatusQuery),
        #[prost(message, tag = "5")]
        StatusReport(super::StatusReport),
        #[prost(message, tag = "6")]
        ConfigUpdate(super::ConfigUpdate),
        #[prost(message, tag = "7")]
        LogLine(super::LogLine),
        #[prost(message, tag = "8")]
        Shutdown(super::Shutdown),
        #[prost(message, tag = "9")]
        AuthHandshake(super::AuthHandshake),
        #[prost(message, tag = "10")]
        Ack(super::Ack),
    }
}

pub use ipc_message::Payload;

#[derive(Clone, PartialEq, Message)]
pub struct StartRequest {
    /// Stop a live worker first instead of failing with AlreadyRunning.
    #[prost(bool, tag = "1")]
    pub restart: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct StopRequest {
    #[prost(bool, tag = "1")]
    pub graceful: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct StatusQuery {}

/// Worker heartbeat and control-surface status in one shape.
///
/// The worker fills the connection and counter fields; the supervisor fills
/// `worker_state`, `pid`, `restart_count` and `last_heartbeat_age_ms`.
#[derive(Clone, PartialEq, Message)]
pub struct StatusReport {
    #[prost(bool, tag = "1")]
    pub running: bool,
    #[prost(bool, tag = "2")]
    pub connected: bool,
    #[prost(string, optional, tag = "3")]
    pub last_error: Option<String>,
    #[prost(uint32, tag = "4")]
    pub restart_count: u32,
    #[prost(string, tag = "5")]
    pub worker_state: String,
    #[prost(uint32, optional, tag = "6")]
    pub pid: Option<u32>,
    #[prost(uint64, tag = "7")]
    pub uptime_ms: u64,
    #[prost(string, tag = "8")]
    pub connection_state: String,
    #[prost(uint64, tag = "9")]
    pub events_received: u64,
    #[prost(uint64, tag = "10")]
    pub events_dispatched: u64,
    #[prost(uint64, tag = "11")]
    pub actions_sent: u64,
    #[prost(uint64, tag = "12")]
    pub actions_deferred: u64,
    #[prost(uint64, tag = "13")]
    pub handler_failures: u64,
    #[prost(uint64, tag = "14")]
    pub queue_depth: u64,
    #[prost(uint64, optional, tag = "15")]
    pub last_heartbeat_age_ms: Option<u64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ConfigUpdate {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum LogLevel {
    Unspecified = 0,
    Trace = 1,
    Debug = 2,
    Info = 3,
    Warn = 4,
    Error = 5,
}

impl From<log::Level> for LogLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Trace => LogLevel::Trace,
            log::Level::Debug => LogLevel::Debug,
            log::Level::Info => LogLevel::Info,
            log::Level::Warn => LogLevel::Warn,
            log::Level::Error => LogLevel::Error,
        }
    }
}

impl LogLevel {
    pub fn to_log_level(self) -> log::Level {
        match self {
            LogLevel::Trace => log::Level::Trace,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Unspecified | LogLevel::Info => log::Level::Info,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct LogLine {
    #[prost(enumeration = "LogLevel", tag = "1")]
    pub level: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Shutdown {
    /// How long the sender waits before force-terminating the receiver.
    #[prost(uint64, tag = "1")]
    pub timeout_ms: u64,
}

/// First frame a control client must send.
#[derive(Clone, PartialEq, Message)]
pub struct AuthHandshake {
    #[prost(string, tag = "1")]
    pub token: String,
}

/// Reply to a control request.
#[derive(Clone, PartialEq, Message)]
pub struct Ack {
    #[prost(uint64, tag = "1")]
    pub request_seq: u64,
    #[prost(bool, tag = "2")]
    pub success: bool,
    #[prost(string, optional, tag = "3")]
    pub error: Option<String>,
}

impl Payload {
    /// Variant name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::StartRequest(_) => "StartRequest",
            Payload::StopRequest(_) => "StopRequest",
            Payload::StatusQuery(_) => "StatusQuery",
            Payload::StatusReport(_) => "StatusReport",
            Payload::ConfigUpdate(_) => "ConfigUpdate",
            Payload::LogLine(_) => "LogLine",
            Payload::Shutdown(_) => "Shutdown",
            Payload::AuthHandshake(_) => "AuthHandshake",
            Payload::Ack(_) => "Ack",
        }
    }

    pub fn log_line(level: log::Level, message: impl Into<String>) -> Self {
        Payload::LogLine(LogLine {
            level: LogLevel::from(level) as i32,
            message: message.into(),
        })
    }

    pub fn ack(request_seq: u64, result: Result<(), String>) -> Self {
        Payload::Ack(Ack {
            request_seq,
            success: result.is_ok(),
            error: result.err(),
        })
    }
}

impl IpcMessage {
    pub fn new(seq: u64, payload: Payload) -> Self {
        Self {
            seq,
            payload: Some(payload),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.payload.as_ref().map_or("Empty", Payload::kind)
    }
}
