//! Websocket client for the control server.

use bot_core::ipc::message::{AuthHandshake, StatusQuery};
use bot_core::ipc::{IpcMessage, Payload};

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use prost::Message as ProstMessage;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

pub const TEST_AUTH_TOKEN: &str = "control-test-token";

pub type ControlSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn connect(port: u16) -> ControlSocket {
    let url = format!("ws://127.0.0.1:{port}");
    let (ws, _) = connect_async(url.as_str())
        .await
        .expect("Failed to connect to control server");
    ws
}

pub async fn send(ws: &mut ControlSocket, seq: u64, payload: Payload) {
    let message = IpcMessage::new(seq, payload);
    ws.send(Message::Binary(message.encode_to_vec().into()))
        .await
        .expect("Failed to send control frame");
}

pub async fn receive(ws: &mut ControlSocket) -> IpcMessage {
    let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("No reply within 5s")
        .expect("Connection closed")
        .expect("Error receiving frame");

    IpcMessage::decode(&frame.into_data()[..]).expect("Failed to decode reply")
}

/// Send the handshake as frame #1 and return the reply payload.
pub async fn authenticate(ws: &mut ControlSocket, token: &str) -> Payload {
    send(
        ws,
        1,
        Payload::AuthHandshake(AuthHandshake {
            token: token.to_string(),
        }),
    )
    .await;
    receive(ws).await.payload.expect("Reply without payload")
}

pub async fn query_status(ws: &mut ControlSocket, seq: u64) -> Payload {
    send(ws, seq, Payload::StatusQuery(StatusQuery {})).await;
    receive(ws).await.payload.expect("Reply without payload")
}

pub async fn is_connection_closed(ws: &mut ControlSocket) -> bool {
    match tokio::time::timeout(Duration::from_millis(500), ws.next()).await {
        Err(_) => false,
        Ok(None) => true,
        Ok(Some(Ok(Message::Close(_)))) => true,
        Ok(Some(Ok(_))) => false,
        Ok(Some(Err(_))) => true,
    }
}
