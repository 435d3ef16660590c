use crate::helpers::control_client::{
    TEST_AUTH_TOKEN, authenticate, connect, is_connection_closed, query_status, receive, send,
};
use crate::helpers::fake_worker::{FakeWorkerLauncher, fast_config, wait_for_status};

use bot_core::config::MemoryStore;
use bot_core::ipc::message::{ConfigUpdate, Shutdown, StartRequest, StatusQuery, StopRequest};
use bot_core::ipc::{ControlServerHandle, Payload, start_control_server};
use bot_core::supervisor::{ProcessSupervisor, WorkerState};

use std::sync::Arc;
use std::time::Duration;

async fn start_server(token: Option<String>) -> (ControlServerHandle, ProcessSupervisor) {
    let launcher = FakeWorkerLauncher::heartbeating(Duration::from_millis(20));
    let supervisor =
        ProcessSupervisor::spawn(fast_config(3), launcher, Arc::new(MemoryStore::new()));
    let server = start_control_server(0, token, supervisor.clone())
        .await
        .expect("control server should bind");
    (server, supervisor)
}

fn assert_ack(payload: &Payload, request_seq: u64) {
    match payload {
        Payload::Ack(ack) => {
            assert_eq!(ack.request_seq, request_seq);
            assert!(ack.success, "request failed: {:?}", ack.error);
        }
        other => panic!("expected Ack, got {}", other.kind()),
    }
}

/// **VALUE**: A wrong token is answered with a failed Ack and the connection is closed.
///
/// **WHY THIS MATTERS**: The control port can start and stop a process holding the
/// user's credential. Any local process can reach it.
///
/// **BUG THIS CATCHES**:
/// - Serving requests after a failed handshake
/// - Leaving the socket open for brute-force attempts
#[tokio::test]
async fn given_wrong_token_when_authenticating_then_rejected_and_closed() {
    // GIVEN
    let (server, _supervisor) = start_server(Some(TEST_AUTH_TOKEN.to_string())).await;
    let mut ws = connect(server.port()).await;

    // WHEN
    let reply = authenticate(&mut ws, "not-the-token").await;

    // THEN
    match reply {
        Payload::Ack(ack) => {
            assert_eq!(ack.request_seq, 1);
            assert!(!ack.success);
            assert_eq!(ack.error.as_deref(), Some("Invalid authentication token"));
        }
        other => panic!("expected Ack, got {}", other.kind()),
    }
    assert!(is_connection_closed(&mut ws).await);

    server.shutdown();
}

/// **VALUE**: A first frame that is not a handshake closes the connection unanswered.
#[tokio::test]
async fn given_unauthenticated_client_when_sending_request_then_closed_without_reply() {
    let (server, supervisor) = start_server(Some(TEST_AUTH_TOKEN.to_string())).await;
    let mut ws = connect(server.port()).await;

    send(&mut ws, 1, Payload::StartRequest(StartRequest { restart: false })).await;

    assert!(is_connection_closed(&mut ws).await);
    assert_eq!(supervisor.status().await.state, WorkerState::Stopped);

    server.shutdown();
}

/// **VALUE**: An authenticated client can read status and start the worker.
///
/// **BUG THIS CATCHES**:
/// - Replies not echoing the request seq, so clients cannot pair them
/// - StartRequest not reaching the supervisor
#[tokio::test]
async fn given_authenticated_client_when_querying_and_starting_then_supervisor_acts() {
    // GIVEN
    let (server, supervisor) = start_server(Some(TEST_AUTH_TOKEN.to_string())).await;
    let mut ws = connect(server.port()).await;
    assert_ack(&authenticate(&mut ws, TEST_AUTH_TOKEN).await, 1);

    // WHEN: Status while stopped
    match query_status(&mut ws, 2).await {
        Payload::StatusReport(report) => {
            assert!(!report.running);
            assert_eq!(report.worker_state, "Stopped");
        }
        other => panic!("expected StatusReport, got {}", other.kind()),
    }

    // WHEN: Start
    send(&mut ws, 3, Payload::StartRequest(StartRequest { restart: false })).await;
    assert_ack(&receive(&mut ws).await.payload.expect("payload"), 3);

    // THEN
    wait_for_status(&supervisor, "Running", |s| s.state == WorkerState::Running).await;
    match query_status(&mut ws, 4).await {
        Payload::StatusReport(report) => {
            assert!(report.running);
            assert_eq!(report.worker_state, "Running");
            assert!(report.pid.is_some());
        }
        other => panic!("expected StatusReport, got {}", other.kind()),
    }

    // WHEN: Graceful stop
    send(&mut ws, 5, Payload::StopRequest(StopRequest { graceful: true })).await;
    assert_ack(&receive(&mut ws).await.payload.expect("payload"), 5);
    wait_for_status(&supervisor, "Stopped", |s| s.state == WorkerState::Stopped).await;

    server.shutdown();
}

/// **VALUE**: Supervisor errors come back as a failed Ack carrying the message.
#[tokio::test]
async fn given_invalid_config_key_when_updating_then_failed_ack_with_reason() {
    let (server, _supervisor) = start_server(Some(TEST_AUTH_TOKEN.to_string())).await;
    let mut ws = connect(server.port()).await;
    authenticate(&mut ws, TEST_AUTH_TOKEN).await;

    send(
        &mut ws,
        2,
        Payload::ConfigUpdate(ConfigUpdate {
            key: "no.such.key".to_string(),
            value: "1".to_string(),
        }),
    )
    .await;

    match receive(&mut ws).await.payload {
        Some(Payload::Ack(ack)) => {
            assert_eq!(ack.request_seq, 2);
            assert!(!ack.success);
            assert!(ack.error.is_some_and(|e| e.contains("no.such.key")));
        }
        other => panic!("expected Ack, got {other:?}"),
    }

    server.shutdown();
}

/// **VALUE**: Replayed sequence numbers are ignored.
///
/// **BUG THIS CATCHES**: A captured StartRequest frame being replayable on the session.
#[tokio::test]
async fn given_authenticated_client_when_frame_seq_repeats_then_ignored() {
    let (server, _supervisor) = start_server(Some(TEST_AUTH_TOKEN.to_string())).await;
    let mut ws = connect(server.port()).await;
    authenticate(&mut ws, TEST_AUTH_TOKEN).await;

    // WHEN: seq 1 again, then a fresh seq
    send(&mut ws, 1, Payload::StatusQuery(StatusQuery {})).await;
    send(&mut ws, 2, Payload::StatusQuery(StatusQuery {})).await;

    // THEN: Only the fresh one is answered
    let reply = receive(&mut ws).await;
    assert!(matches!(reply.payload, Some(Payload::StatusReport(_))));
    assert!(!is_connection_closed(&mut ws).await);

    server.shutdown();
}

/// **VALUE**: Without a configured token the server generates one.
#[tokio::test]
async fn given_no_token_when_starting_then_generated_token_accepted() {
    let (server, _supervisor) = start_server(None).await;
    assert!(!server.auth_token().is_empty());
    assert!(server.local_addr().ip().is_loopback());

    let token = server.auth_token().to_string();
    let mut ws = connect(server.port()).await;
    assert_ack(&authenticate(&mut ws, &token).await, 1);

    server.shutdown();
}

/// **VALUE**: A Shutdown request stops the supervisor and the server.
#[tokio::test]
async fn given_authenticated_client_when_shutdown_requested_then_server_stops() {
    let (server, supervisor) = start_server(Some(TEST_AUTH_TOKEN.to_string())).await;
    let mut ws = connect(server.port()).await;
    authenticate(&mut ws, TEST_AUTH_TOKEN).await;

    send(&mut ws, 2, Payload::Shutdown(Shutdown { timeout_ms: 500 })).await;
    assert_ack(&receive(&mut ws).await.payload.expect("payload"), 2);

    tokio::time::timeout(Duration::from_secs(5), server.stopped())
        .await
        .expect("server should stop");
    assert_eq!(supervisor.status().await.state, WorkerState::Stopped);
}
