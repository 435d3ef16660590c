//! [`UpstreamService`] over a WebSocket bridge speaking JSON envelopes.
//!
//! ```text
//! -> {"op":"identify","token":"..."}
//! <- {"op":"ready","protocol":1}
//! <- {"op":"event","kind":"message_create","data":{...}}
//! -> {"op":"action","category":"message","payload":{...}}
//! ```
//!
//! The bridge closes with code 4004 when it rejects the credential.

use crate::queue::RawEvent;
use crate::upstream::{
    ConnectFailure, OutboundAction, ReadOutcome, SendOutcome, UpstreamLink, UpstreamReader,
    UpstreamService, UpstreamWriter,
};

use common::RedactedToken;

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use zeroize::Zeroizing;

/// Bridge protocol version this client speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Close code the bridge uses for a rejected credential.
pub const CLOSE_AUTH_REJECTED: u16 = 4004;

type BridgeStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Envelope {
    Ready {
        #[serde(default)]
        protocol: Option<u32>,
    },
    Event {
        kind: String,
        #[serde(default)]
        data: Value,
    },
    Action {
        category: String,
        payload: Value,
    },
    RateLimited {
        retry_after_ms: u64,
    },
    Heartbeat,
}

pub struct WebSocketUpstream {
    url: String,
}

impl WebSocketUpstream {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl UpstreamService for WebSocketUpstream {
    async fn connect(&self, credential: &RedactedToken) -> Result<UpstreamLink, ConnectFailure> {
        debug!("Connecting to upstream bridge {}", self.url);

        let (stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(classify_connect_error)?;

        let (mut sink, mut source) = stream.split();

        let identify = Zeroizing::new(
            serde_json::json!({ "op": "identify", "token": credential.as_str() }).to_string(),
        );
        sink.send(Message::text(identify.as_str().to_owned()))
            .await
            .map_err(|e| ConnectFailure::Network(format!("identify failed: {e}")))?;

        await_ready(&mut source).await?;
        info!("Upstream bridge session ready");

        Ok(UpstreamLink {
            reader: Box::new(WebSocketReader { source }),
            writer: std::sync::Arc::new(WebSocketWriter {
                sink: Mutex::new(Some(sink)),
            }),
        })
    }
}

async fn await_ready(source: &mut SplitStream<BridgeStream>) -> Result<(), ConnectFailure> {
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(text.as_str()) {
                Ok(Envelope::Ready { protocol }) => {
                    let protocol = protocol.unwrap_or(PROTOCOL_VERSION);
                    if protocol != PROTOCOL_VERSION {
                        return Err(ConnectFailure::ProtocolMismatch(format!(
                            "bridge speaks protocol {protocol}, expected {PROTOCOL_VERSION}"
                        )));
                    }
                    return Ok(());
                }
                Ok(other) => debug!("Ignoring {other:?} before ready"),
                Err(e) => {
                    return Err(ConnectFailure::ProtocolMismatch(format!(
                        "unexpected handshake frame: {e}"
                    )));
                }
            },
            Ok(Message::Close(frame)) => return Err(classify_close(frame.as_ref())),
            Ok(_) => continue,
            Err(e) => return Err(ConnectFailure::Network(e.to_string())),
        }
    }

    Err(ConnectFailure::Network(
        "bridge closed during handshake".to_string(),
    ))
}

fn classify_connect_error(error: tokio_tungstenite::tungstenite::Error) -> ConnectFailure {
    use tokio_tungstenite::tungstenite::Error as WsError;

    match error {
        WsError::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            ConnectFailure::AuthRejected(format!("bridge answered {}", response.status()))
        }
        other => ConnectFailure::Network(other.to_string()),
    }
}

fn classify_close(frame: Option<&CloseFrame>) -> ConnectFailure {
    match frame {
        Some(frame) if u16::from(frame.code) == CLOSE_AUTH_REJECTED => {
            ConnectFailure::AuthRejected(frame.reason.as_str().to_string())
        }
        Some(frame) => ConnectFailure::Network(format!(
            "bridge closed ({}): {}",
            u16::from(frame.code),
            frame.reason.as_str()
        )),
        None => ConnectFailure::Network("bridge closed".to_string()),
    }
}

struct WebSocketReader {
    source: SplitStream<BridgeStream>,
}

#[async_trait]
impl UpstreamReader for WebSocketReader {
    async fn read_event(&mut self) -> ReadOutcome {
        while let Some(frame) = self.source.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(text.as_str()) {
                    Ok(Envelope::Event { kind, data }) => {
                        return ReadOutcome::Event(RawEvent::new(kind, data));
                    }
                    Ok(Envelope::RateLimited { retry_after_ms }) => {
                        warn!("Bridge throttled this session for {retry_after_ms}ms");
                    }
                    Ok(Envelope::Heartbeat) => {}
                    Ok(other) => debug!("Ignoring bridge frame {other:?}"),
                    Err(e) => warn!("Dropping malformed bridge frame: {e}"),
                },
                Ok(Message::Close(frame)) => {
                    return match classify_close(frame.as_ref()) {
                        ConnectFailure::AuthRejected(reason) => ReadOutcome::Fatal(format!(
                            "bridge revoked the session: {reason}"
                        )),
                        _ => ReadOutcome::Closed,
                    };
                }
                Ok(_) => continue,
                Err(e) => return ReadOutcome::Error(e.to_string()),
            }
        }

        ReadOutcome::Closed
    }
}

struct WebSocketWriter {
    sink: Mutex<Option<SplitSink<BridgeStream, Message>>>,
}

#[async_trait]
impl UpstreamWriter for WebSocketWriter {
    async fn send_action(&self, action: &OutboundAction) -> SendOutcome {
        let mut sink = self.sink.lock().await;
        let Some(sink) = sink.as_mut() else {
            return SendOutcome::Error("session closed".to_string());
        };

        let envelope = Envelope::Action {
            category: action.category.clone(),
            payload: action.payload.clone(),
        };
        let json = match serde_json::to_string(&envelope) {
            Ok(json) => json,
            Err(e) => return SendOutcome::Error(format!("cannot encode action: {e}")),
        };

        match sink.send(Message::text(json)).await {
            Ok(()) => SendOutcome::Ack,
            Err(tokio_tungstenite::tungstenite::Error::Capacity(e)) => {
                warn!("Bridge refused action: {e}");
                SendOutcome::RateLimited {
                    retry_after: Duration::from_secs(1),
                }
            }
            Err(e) => SendOutcome::Error(e.to_string()),
        }
    }

    async fn close(&self) {
        if let Some(mut sink) = self.sink.lock().await.take()
            && let Err(e) = sink.close().await
        {
            debug!("Bridge close failed: {e}");
        }
    }
}
