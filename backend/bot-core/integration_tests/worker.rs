use crate::helpers::eventually;
use crate::helpers::fake_worker::fast_config;
use crate::helpers::scripted_upstream::{ScriptedUpstream, SessionFeed, StaticCredential, session};

use bot_core::config::{BotConfig, IpcConfig};
use bot_core::dispatch::{Command, handler_fn};
use bot_core::error::dispatch::HandlerError;
use bot_core::error::ipc::IpcError;
use bot_core::ipc::message::{Ack, ConfigUpdate, Shutdown, StatusQuery, StatusReport};
use bot_core::ipc::{IpcChannel, IpcReceiver, IpcSender, Payload};
use bot_core::worker::WorkerRuntime;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;

const SELF_ID: &str = "1087654321098765432";

struct WorkerUnderTest {
    to_worker: IpcSender,
    from_worker: IpcReceiver,
    upstream: Arc<ScriptedUpstream>,
    feed: SessionFeed,
    task: JoinHandle<Result<(), IpcError>>,
}

fn worker_config() -> BotConfig {
    let mut config = fast_config(3);
    config.supervisor.heartbeat_interval_ms = 50;
    config.upstream.account_id = SELF_ID.to_string();
    config
}

/// Start a worker with a `ping` command over an in-memory pipe.
fn start_worker() -> WorkerUnderTest {
    let (script, feed) = session();
    let upstream = ScriptedUpstream::new(vec![script]);

    let runtime = WorkerRuntime::new(worker_config(), upstream.clone(), StaticCredential::valid());
    runtime
        .dispatcher()
        .register(
            Command::prefix("ping"),
            handler_fn(|event, ctx| async move {
                ctx.reply(&event, "pong").await?;
                Ok::<(), HandlerError>(())
            }),
        )
        .expect("register ping");

    let (supervisor_io, worker_io) = tokio::io::duplex(64 * 1024);
    let (to_worker, from_worker) = IpcChannel::new(supervisor_io, &IpcConfig::default());
    let (worker_tx, worker_rx) = IpcChannel::new(worker_io, &IpcConfig::default());
    let task = tokio::spawn(runtime.run(worker_tx, worker_rx));

    WorkerUnderTest {
        to_worker,
        from_worker,
        upstream,
        feed,
        task,
    }
}

fn ping(feed: &SessionFeed, content: &str) {
    feed.event(
        "message",
        json!({ "author_id": SELF_ID, "channel_id": "7", "content": content }),
    );
}

/// Next Ack, skipping heartbeats and log lines.
async fn next_ack(receiver: &mut IpcReceiver) -> Ack {
    loop {
        let message = receiver
            .receive_timeout(Duration::from_secs(5))
            .await
            .expect("worker reply");
        if let Some(Payload::Ack(ack)) = message.payload {
            return ack;
        }
    }
}

async fn next_status(receiver: &mut IpcReceiver) -> StatusReport {
    loop {
        let message = receiver
            .receive_timeout(Duration::from_secs(5))
            .await
            .expect("worker frame");
        if let Some(Payload::StatusReport(report)) = message.payload {
            return report;
        }
    }
}

async fn wait_until_connected(worker: &mut WorkerUnderTest) -> StatusReport {
    loop {
        let report = next_status(&mut worker.from_worker).await;
        if report.connected {
            return report;
        }
    }
}

/// **VALUE**: The worker heartbeats and reports its connection.
///
/// **WHY THIS MATTERS**: Heartbeats are the only liveness signal the supervisor has.
/// A worker that stops sending them is killed and restarted.
#[tokio::test]
async fn given_running_worker_when_idle_then_heartbeats_with_connection_state() {
    let mut worker = start_worker();

    let report = wait_until_connected(&mut worker).await;

    assert!(report.running);
    assert_eq!(report.connection_state, "Connected");
    assert_eq!(report.pid, Some(std::process::id()));
    assert_eq!(worker.upstream.connect_calls(), 1);

    worker.to_worker.close().await;
}

/// **VALUE**: An upstream command event flows through queue, dispatcher and handler
/// back out to the upstream.
///
/// **BUG THIS CATCHES**: Any broken link in the event path inside the worker.
#[tokio::test]
async fn given_connected_worker_when_ping_arrives_then_pong_sent_upstream() {
    // GIVEN
    let mut worker = start_worker();
    wait_until_connected(&mut worker).await;

    // WHEN
    ping(&worker.feed, "!ping");

    // THEN
    let sent = eventually("pong sent", Duration::from_secs(5), || {
        let sent = worker.upstream.sent();
        (!sent.is_empty()).then_some(sent)
    })
    .await;
    assert_eq!(sent[0].action.payload["content"], "pong");
    assert_eq!(sent[0].action.payload["channel_id"], "7");

    // THEN: Counters surface in the next status
    worker
        .to_worker
        .send(Payload::StatusQuery(StatusQuery {}))
        .await
        .unwrap();
    let report = loop {
        let report = next_status(&mut worker.from_worker).await;
        if report.events_dispatched >= 1 && report.actions_sent >= 1 {
            break report;
        }
    };
    assert_eq!(report.events_received, 1);
    assert_eq!(report.handler_failures, 0);

    worker.to_worker.close().await;
}

/// **VALUE**: A prefix ConfigUpdate is acknowledged and applied live.
#[tokio::test]
async fn given_prefix_update_when_applied_then_new_prefix_triggers_commands() {
    // GIVEN
    let mut worker = start_worker();
    wait_until_connected(&mut worker).await;

    // WHEN
    let seq = worker
        .to_worker
        .send(Payload::ConfigUpdate(ConfigUpdate {
            key: "dispatcher.prefix".to_string(),
            value: "?".to_string(),
        }))
        .await
        .unwrap();
    let ack = next_ack(&mut worker.from_worker).await;

    // THEN
    assert_eq!(ack.request_seq, seq);
    assert!(ack.success, "{:?}", ack.error);

    ping(&worker.feed, "!ping");
    ping(&worker.feed, "?ping");
    let sent = eventually("one pong", Duration::from_secs(5), || {
        let sent = worker.upstream.sent();
        (!sent.is_empty()).then_some(sent)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(worker.upstream.sent().len(), 1);

    worker.to_worker.close().await;
}

/// **VALUE**: A bad ConfigUpdate is refused with a reason and changes nothing.
#[tokio::test]
async fn given_invalid_update_when_applied_then_failed_ack() {
    let mut worker = start_worker();

    worker
        .to_worker
        .send(Payload::ConfigUpdate(ConfigUpdate {
            key: "dispatcher.prefix".to_string(),
            value: "two words".to_string(),
        }))
        .await
        .unwrap();
    let ack = next_ack(&mut worker.from_worker).await;

    assert!(!ack.success);
    assert!(ack.error.is_some());

    worker.to_worker.close().await;
}

/// **VALUE**: Shutdown is acknowledged, a final status is flushed, and the channel
/// then closes with `run` returning Ok.
///
/// **WHY THIS MATTERS**: The supervisor tells a clean stop from a crash by seeing the
/// Ack before the channel closes.
///
/// **BUG THIS CATCHES**:
/// - Exiting before the Ack is written
/// - Leaving the upstream session open after shutdown
#[tokio::test]
async fn given_running_worker_when_shutdown_then_ack_and_clean_exit() {
    // GIVEN
    let mut worker = start_worker();
    wait_until_connected(&mut worker).await;

    // WHEN
    let seq = worker
        .to_worker
        .send(Payload::Shutdown(Shutdown { timeout_ms: 1_000 }))
        .await
        .unwrap();

    // THEN: Ack, then frames until the channel closes
    let ack = next_ack(&mut worker.from_worker).await;
    assert_eq!(ack.request_seq, seq);
    assert!(ack.success);

    loop {
        match worker
            .from_worker
            .receive_timeout(Duration::from_secs(5))
            .await
        {
            Ok(_) => continue,
            Err(IpcError::ChannelClosed { .. }) => break,
            Err(e) => panic!("expected channel close, got {e}"),
        }
    }

    let result = tokio::time::timeout(Duration::from_secs(5), worker.task)
        .await
        .expect("run should return")
        .unwrap();
    assert!(result.is_ok());

    ping(&worker.feed, "!ping");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(worker.upstream.sent().is_empty());
}

/// **VALUE**: Losing the supervisor ends the worker.
///
/// **BUG THIS CATCHES**: An orphaned worker that keeps the account online after its
/// manager died.
#[tokio::test]
async fn given_running_worker_when_supervisor_side_closes_then_run_returns() {
    let worker = start_worker();

    worker.to_worker.close().await;
    drop(worker.from_worker);

    tokio::time::timeout(Duration::from_secs(5), worker.task)
        .await
        .expect("run should return")
        .unwrap()
        .unwrap();
}
