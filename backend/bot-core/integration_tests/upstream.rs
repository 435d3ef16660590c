use bot_core::upstream::websocket::{CLOSE_AUTH_REJECTED, WebSocketUpstream};
use bot_core::upstream::{ConnectFailure, OutboundAction, ReadOutcome, SendOutcome, UpstreamService};

use common::RedactedToken;

use std::future::Future;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tokio_tungstenite::{WebSocketStream, accept_async};

const BRIDGE_TOKEN: &str = "bridge-credential-for-tests";

type BridgeSide = WebSocketStream<TcpStream>;

/// Serve exactly one bridge connection with `script`; returns the ws url.
async fn bridge<F, Fut>(script: F) -> String
where
    F: FnOnce(BridgeSide) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = accept_async(stream).await.unwrap();
        script(ws).await;
    });

    format!("ws://127.0.0.1:{port}")
}

async fn next_json(ws: &mut BridgeSide) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("No frame within 5s")
            .expect("Client went away")
            .expect("Error reading client frame");
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).expect("Client sent invalid JSON");
        }
    }
}

async fn send_json(ws: &mut BridgeSide, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

async fn close_with(ws: &mut BridgeSide, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: Utf8Bytes::from_static(reason),
    };
    let _ = ws.send(Message::Close(Some(frame))).await;
    while let Some(Ok(_)) = ws.next().await {}
}

fn credential() -> RedactedToken {
    RedactedToken::new(BRIDGE_TOKEN.to_string())
}

/// **VALUE**: Exercises the full bridge session: identify, ready, events in, actions out.
///
/// **WHY THIS MATTERS**: This adapter is the only path between the worker and the chat service.
///
/// **BUG THIS CATCHES**: Heartbeats or junk frames surfacing as events, or the credential
/// not being sent in the identify frame.
#[tokio::test]
async fn given_ready_bridge_when_session_runs_then_events_and_actions_flow() {
    // GIVEN
    let (identify_tx, identify_rx) = oneshot::channel();
    let (action_tx, action_rx) = oneshot::channel();
    let url = bridge(|mut ws| async move {
        let identify = next_json(&mut ws).await;
        let _ = identify_tx.send(identify);
        send_json(&mut ws, json!({ "op": "ready", "protocol": 1 })).await;
        send_json(&mut ws, json!({ "op": "heartbeat" })).await;
        ws.send(Message::text("not json".to_string())).await.unwrap();
        send_json(
            &mut ws,
            json!({ "op": "event", "kind": "message_create", "data": { "content": "!ping" } }),
        )
        .await;
        let action = next_json(&mut ws).await;
        let _ = action_tx.send(action);
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
    let upstream = WebSocketUpstream::new(url);

    // WHEN
    let mut link = upstream.connect(&credential()).await.unwrap();
    let event = link.reader.read_event().await;
    let sent = link
        .writer
        .send_action(&OutboundAction::new("message", json!({ "content": "pong" })))
        .await;

    // THEN
    let identify = identify_rx.await.unwrap();
    assert_eq!(identify["op"], "identify");
    assert_eq!(identify["token"], BRIDGE_TOKEN);

    match event {
        ReadOutcome::Event(raw) => {
            assert_eq!(raw.kind, "message_create");
            assert_eq!(raw.payload, json!({ "content": "!ping" }));
        }
        other => panic!("Expected event, got {other:?}"),
    }

    assert_eq!(sent, SendOutcome::Ack);
    let action = action_rx.await.unwrap();
    assert_eq!(action["op"], "action");
    assert_eq!(action["category"], "message");
    assert_eq!(action["payload"]["content"], "pong");
}

/// **VALUE**: Verifies that a closed writer refuses further actions.
///
/// **WHY THIS MATTERS**: The connection manager closes the writer on shutdown and must not
/// leak actions into a released session.
///
/// **BUG THIS CATCHES**: Sends after close reaching the socket or panicking.
#[tokio::test]
async fn given_closed_writer_when_sending_then_session_closed_error() {
    // GIVEN
    let url = bridge(|mut ws| async move {
        let _ = next_json(&mut ws).await;
        send_json(&mut ws, json!({ "op": "ready" })).await;
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
    let link = WebSocketUpstream::new(url).connect(&credential()).await.unwrap();

    // WHEN
    link.writer.close().await;
    let outcome = link
        .writer
        .send_action(&OutboundAction::new("message", json!({})))
        .await;

    // THEN
    assert_eq!(outcome, SendOutcome::Error("session closed".to_string()));
}

/// **VALUE**: Verifies close code 4004 during the handshake maps to a rejected credential.
///
/// **WHY THIS MATTERS**: A rejected credential is fatal; retrying would hammer the service.
///
/// **BUG THIS CATCHES**: The rejection being classified as a retryable network error.
#[tokio::test]
async fn given_bridge_rejecting_credential_when_connecting_then_auth_rejected() {
    // GIVEN
    let url = bridge(|mut ws| async move {
        let _ = next_json(&mut ws).await;
        close_with(&mut ws, CLOSE_AUTH_REJECTED, "invalid token").await;
    })
    .await;

    // WHEN
    let result = WebSocketUpstream::new(url).connect(&credential()).await;

    // THEN
    let failure = result.err().expect("Handshake should fail");
    assert_eq!(failure, ConnectFailure::AuthRejected("invalid token".to_string()));
    assert!(failure.is_fatal());
}

/// **VALUE**: Verifies a bridge speaking another protocol version is refused.
///
/// **WHY THIS MATTERS**: Envelope shapes differ between versions; decoding would silently
/// drop events.
///
/// **BUG THIS CATCHES**: The protocol field in `ready` being ignored.
#[tokio::test]
async fn given_bridge_with_other_protocol_when_connecting_then_protocol_mismatch() {
    // GIVEN
    let url = bridge(|mut ws| async move {
        let _ = next_json(&mut ws).await;
        send_json(&mut ws, json!({ "op": "ready", "protocol": 2 })).await;
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;

    // WHEN
    let result = WebSocketUpstream::new(url).connect(&credential()).await;

    // THEN
    match result.err() {
        Some(ConnectFailure::ProtocolMismatch(reason)) => assert!(reason.contains("protocol 2")),
        other => panic!("Expected protocol mismatch, got {other:?}"),
    }
}

/// **VALUE**: Verifies how a session ending mid-stream is reported.
///
/// **WHY THIS MATTERS**: An ordinary close is retried, while a revoked credential must stop
/// the reconnect loop.
///
/// **BUG THIS CATCHES**: Both closes being treated the same way.
#[tokio::test]
async fn given_established_session_when_bridge_closes_then_close_code_decides_outcome() {
    // GIVEN
    let normal = bridge(|mut ws| async move {
        let _ = next_json(&mut ws).await;
        send_json(&mut ws, json!({ "op": "ready" })).await;
        close_with(&mut ws, 1000, "maintenance").await;
    })
    .await;
    let revoked = bridge(|mut ws| async move {
        let _ = next_json(&mut ws).await;
        send_json(&mut ws, json!({ "op": "ready" })).await;
        close_with(&mut ws, CLOSE_AUTH_REJECTED, "token revoked").await;
    })
    .await;

    // WHEN
    let mut normal_link = WebSocketUpstream::new(normal).connect(&credential()).await.unwrap();
    let mut revoked_link = WebSocketUpstream::new(revoked).connect(&credential()).await.unwrap();
    let normal_outcome = normal_link.reader.read_event().await;
    let revoked_outcome = revoked_link.reader.read_event().await;

    // THEN
    assert_eq!(normal_outcome, ReadOutcome::Closed);
    match revoked_outcome {
        ReadOutcome::Fatal(reason) => assert!(reason.contains("token revoked")),
        other => panic!("Expected fatal outcome, got {other:?}"),
    }
}

/// **VALUE**: Verifies an unreachable bridge is a retryable network failure.
///
/// **WHY THIS MATTERS**: The bridge starting after the worker is normal; the manager should
/// back off and retry.
///
/// **BUG THIS CATCHES**: Connection refusals being reported as fatal.
#[tokio::test]
async fn given_nothing_listening_when_connecting_then_network_failure() {
    // GIVEN
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    // WHEN
    let result = WebSocketUpstream::new(format!("ws://127.0.0.1:{port}"))
        .connect(&credential())
        .await;

    // THEN
    let failure = result.err().expect("Connect should fail");
    assert!(matches!(failure, ConnectFailure::Network(_)));
    assert!(!failure.is_fatal());
}
