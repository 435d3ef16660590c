//! Control server for operators.
//!
//! - Binds `127.0.0.1` only and rejects non-loopback peers
//! - Binary protobuf [`IpcMessage`] frames over WebSocket
//! - First frame must be an `AuthHandshake` carrying the server's token
//!
//! Requests are forwarded to the [`ProcessSupervisor`]; every request is
//! answered with an `Ack` (or a `StatusReport` for `StatusQuery`) whose
//! `request_seq` echoes the client's frame seq.

use crate::error::ipc::IpcError;
use crate::ipc::handle::ControlServerHandle;
use crate::ipc::message::{IpcMessage, Payload};
use crate::ipc::sequence::{SequenceCheck, SequenceTracker};
use crate::ipc::session::ControlSession;
use crate::supervisor::ProcessSupervisor;

use common::{ErrorLocation, RedactedToken};

use std::net::SocketAddr;
use std::panic::Location;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use prost::Message as ProstMessage;
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn as TokioSpawn;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

type ControlSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Start the control server on `127.0.0.1:<port>`. Port 0 picks a free port.
///
/// A random token is generated when `auth_token` is `None`; read it back from
/// [`ControlServerHandle::auth_token`].
///
/// # Errors
///
/// [`IpcError::Io`] if the port cannot be bound.
pub async fn start_control_server(
    port: u16,
    auth_token: Option<String>,
    supervisor: ProcessSupervisor,
) -> Result<ControlServerHandle, IpcError> {
    let auth_token = auth_token.unwrap_or_else(|| {
        let token = Uuid::new_v4().to_string();
        info!("Generated control auth token");
        token
    });

    let listener = TcpListener::bind((crate::CONTROL_HOST, port)).await?;
    let local_addr = listener.local_addr()?;
    let shutdown = CancellationToken::new();

    info!("Control server listening on {local_addr}");

    TokioSpawn(accept_loop(
        listener,
        auth_token.clone(),
        supervisor,
        shutdown.clone(),
    ));

    Ok(ControlServerHandle {
        local_addr,
        auth_token,
        shutdown,
    })
}

async fn accept_loop(
    listener: TcpListener,
    auth_token: String,
    supervisor: ProcessSupervisor,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                debug!("Control client connecting from {addr}");
                let session = ControlSession::new(RedactedToken::new(auth_token.clone()));
                let supervisor = supervisor.clone();
                let shutdown = shutdown.clone();

                TokioSpawn(async move {
                    if let Err(e) =
                        handle_connection(stream, addr, session, supervisor, shutdown).await
                    {
                        warn!("Control connection {addr} ended with error: {e}");
                    }
                });
            }
            Err(e) => {
                error!("Control server accept failed: {e}");
                break;
            }
        }
    }

    info!("Control server stopped");
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    mut session: ControlSession,
    supervisor: ProcessSupervisor,
    shutdown: CancellationToken,
) -> Result<(), IpcError> {
    if !addr.ip().is_loopback() {
        warn!("Rejected non-loopback control connection from {addr}");
        return Ok(());
    }

    let ws_stream = accept_async(stream).await.map_err(|e| IpcError::Handshake {
        message: format!("WebSocket handshake failed: {e}"),
        location: ErrorLocation::from(Location::caller()),
    })?;

    let (mut write, mut read) = ws_stream.split();
    let mut outbound_seq = 0u64;
    let mut tracker = SequenceTracker::new();

    // First frame must authenticate.
    let first = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        first = read.next() => first,
    };

    match first {
        Some(Ok(Message::Binary(data))) => {
            let message = IpcMessage::decode(&data[..])?;
            tracker.observe(message.seq);

            match message.payload {
                Some(Payload::AuthHandshake(auth)) if session.validate_token(&auth.token) => {
                    info!("Control client {addr} authenticated");
                    send(&mut write, &mut outbound_seq, Payload::ack(message.seq, Ok(()))).await?;
                }
                Some(Payload::AuthHandshake(_)) => {
                    warn!("Control client {addr} auth failed: invalid token");
                    let denied = Err("Invalid authentication token".to_string());
                    send(&mut write, &mut outbound_seq, Payload::ack(message.seq, denied)).await?;
                    return Ok(());
                }
                _ => {
                    warn!("Control client {addr} auth failed: first frame was not AuthHandshake");
                    return Ok(());
                }
            }
        }
        Some(Ok(_)) => {
            warn!("Control client {addr} sent a non-binary first frame");
            return Ok(());
        }
        Some(Err(e)) => {
            return Err(IpcError::Read {
                message: format!("Error reading first frame: {e}"),
                location: ErrorLocation::from(Location::caller()),
            });
        }
        None => {
            debug!("Control client {addr} disconnected before auth");
            return Ok(());
        }
    }

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = read.next() => next,
        };

        let data = match next {
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(IpcError::Read {
                    message: format!("Error reading frame: {e}"),
                    location: ErrorLocation::from(Location::caller()),
                });
            }
        };

        let message = match IpcMessage::decode(&data[..]) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed control frame from {addr}: {e}");
                continue;
            }
        };

        if let SequenceCheck::Stale { last } = tracker.observe(message.seq) {
            warn!(
                "Rejecting stale control frame #{} from {addr} (last #{last})",
                message.seq
            );
            continue;
        }

        let request_seq = message.seq;
        let Some(payload) = message.payload else {
            let invalid = Err("Frame has no payload".to_string());
            send(&mut write, &mut outbound_seq, Payload::ack(request_seq, invalid)).await?;
            continue;
        };

        debug_assert!(session.is_authenticated());
        let reply = handle_request(payload, request_seq, &supervisor, &shutdown).await;
        send(&mut write, &mut outbound_seq, reply).await?;
    }

    info!("Control client {addr} disconnected");
    Ok(())
}

async fn handle_request(
    payload: Payload,
    request_seq: u64,
    supervisor: &ProcessSupervisor,
    shutdown: &CancellationToken,
) -> Payload {
    let result = match payload {
        Payload::StartRequest(request) => {
            info!("Control: start (restart: {})", request.restart);
            if request.restart {
                supervisor.restart().await
            } else {
                supervisor.start().await
            }
        }
        Payload::StopRequest(request) => {
            info!("Control: stop (graceful: {})", request.graceful);
            supervisor.stop(request.graceful).await
        }
        Payload::StatusQuery(_) => {
            return Payload::StatusReport(supervisor.status_report().await);
        }
        Payload::ConfigUpdate(update) => {
            info!("Control: config update '{}'", update.key);
            supervisor.update_config(&update.key, &update.value).await
        }
        Payload::Shutdown(_) => {
            info!("Control: shutdown requested");
            supervisor.shutdown().await;
            shutdown.cancel();
            Ok(())
        }
        other => {
            return Payload::ack(
                request_seq,
                Err(format!("{} is not a control request", other.kind())),
            );
        }
    };

    Payload::ack(request_seq, result.map_err(|e| e.to_string()))
}

async fn send(write: &mut ControlSink, seq: &mut u64, payload: Payload) -> Result<(), IpcError> {
    *seq += 1;
    let message = IpcMessage::new(*seq, payload);

    write
        .send(Message::Binary(message.encode_to_vec().into()))
        .await
        .map_err(|e| IpcError::Send {
            message: format!("Failed to send {}: {e}", message.kind()),
            location: ErrorLocation::from(Location::caller()),
        })
}
