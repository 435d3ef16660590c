use crate::helpers::fake_worker::{FakeWorkerLauncher, fast_config, wait_for_status};

use bot_core::config::{KeyValueStore, MemoryStore};
use bot_core::error::config::ConfigError;
use bot_core::error::supervisor::SupervisorError;
use bot_core::ipc::Payload;
use bot_core::supervisor::{OVERRIDE_PREFIX, ProcessSupervisor, WorkerState};

use std::sync::Arc;
use std::time::Duration;

const HEARTBEAT: Duration = Duration::from_millis(20);

fn spawn_supervisor(
    max_restarts: u32,
    launcher: Arc<FakeWorkerLauncher>,
) -> (ProcessSupervisor, Arc<MemoryStore>) {
    let overrides = Arc::new(MemoryStore::new());
    let supervisor = ProcessSupervisor::spawn(fast_config(max_restarts), launcher, overrides.clone());
    (supervisor, overrides)
}

/// **VALUE**: A started worker reaches Running once it heartbeats.
///
/// **WHY THIS MATTERS**: `Running` is what operators read as "the bot is up". It must
/// mean a live process answered, not merely that a spawn call returned.
///
/// **BUG THIS CATCHES**: Marking the worker Running at launch instead of on first heartbeat.
#[tokio::test]
async fn given_stopped_supervisor_when_started_then_running_after_heartbeat() {
    // GIVEN
    let launcher = FakeWorkerLauncher::heartbeating(HEARTBEAT);
    let (supervisor, _) = spawn_supervisor(5, launcher.clone());

    // WHEN
    supervisor.start().await.expect("start should succeed");

    // THEN
    let snapshot = wait_for_status(&supervisor, "Running", |s| s.state == WorkerState::Running).await;
    assert_eq!(snapshot.restart_count, 0);
    assert!(snapshot.pid.is_some());
    assert!(snapshot.last_heartbeat.is_some());

    let status = supervisor.control_status().await;
    assert!(status.running);
    assert!(status.connected);
    assert_eq!(launcher.launches(), 1);
}

/// **VALUE**: Three crashes under a budget of five leave the worker running with
/// `restart_count` 3.
///
/// **WHY THIS MATTERS**: Transient crashes must heal without an operator. The count is
/// how operators notice a worker that keeps falling over.
///
/// **BUG THIS CATCHES**:
/// - Count not incremented per restart, or incremented twice
/// - Restart never scheduled after the IPC channel closes
#[tokio::test]
async fn given_budget_of_five_when_worker_crashes_three_times_then_running_with_count_three() {
    // GIVEN: A running worker
    let launcher = FakeWorkerLauncher::heartbeating(HEARTBEAT);
    let (supervisor, _) = spawn_supervisor(5, launcher.clone());
    supervisor.start().await.unwrap();
    wait_for_status(&supervisor, "initial Running", |s| s.state == WorkerState::Running).await;

    // WHEN: Each replacement crashes in turn, three times
    for crash in 1..=3u32 {
        launcher.latest().crash();
        wait_for_status(&supervisor, "restarted worker", |s| {
            s.state == WorkerState::Running && s.restart_count == crash
        })
        .await;
    }

    // THEN
    let snapshot = supervisor.status().await;
    assert_eq!(snapshot.state, WorkerState::Running);
    assert_eq!(snapshot.restart_count, 3);
    assert_eq!(launcher.launches(), 4);
}

/// **VALUE**: Exhausting the restart budget ends in Failed, and only an operator start
/// leaves it.
///
/// **WHY THIS MATTERS**: A worker that dies on every launch (bad credential, broken
/// build) must not be restarted forever.
///
/// **BUG THIS CATCHES**:
/// - Off-by-one allowing `max_restarts + 1` restarts
/// - Failed state that auto-restarts
/// - `start()` from Failed not resetting the count
#[tokio::test]
async fn given_budget_of_two_when_worker_keeps_crashing_then_failed_until_operator_start() {
    // GIVEN: Budget of 2, worker running
    let launcher = FakeWorkerLauncher::heartbeating(HEARTBEAT);
    let (supervisor, _) = spawn_supervisor(2, launcher.clone());
    supervisor.start().await.unwrap();
    wait_for_status(&supervisor, "Running", |s| s.state == WorkerState::Running).await;

    // WHEN: Crash twice (both restarted), then a third time
    for crash in 1..=2u32 {
        launcher.latest().crash();
        wait_for_status(&supervisor, "restart", |s| {
            s.state == WorkerState::Running && s.restart_count == crash
        })
        .await;
    }
    launcher.latest().crash();

    // THEN: Failed with the budget spent, and no further launch
    let failed = wait_for_status(&supervisor, "Failed", |s| s.state == WorkerState::Failed).await;
    assert_eq!(failed.restart_count, 2);
    assert!(
        failed
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("failed after 2 restarts")),
        "last_error: {:?}",
        failed.last_error
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(launcher.launches(), 3);
    assert!(!supervisor.control_status().await.running);

    // WHEN: Operator starts again
    supervisor.start().await.unwrap();

    // THEN: Fresh budget
    let restarted = wait_for_status(&supervisor, "Running", |s| s.state == WorkerState::Running).await;
    assert_eq!(restarted.restart_count, 0);
    assert_eq!(restarted.last_error, None);
}

/// **VALUE**: A worker that stops heartbeating is treated as crashed and replaced.
///
/// **WHY THIS MATTERS**: A deadlocked worker keeps its pipe open. Without the heartbeat
/// deadline it would look alive forever while doing nothing.
///
/// **BUG THIS CATCHES**: Liveness based on channel state alone.
#[tokio::test]
async fn given_silent_worker_when_heartbeat_deadline_passes_then_terminated_and_restarted() {
    // GIVEN: Workers that never heartbeat
    let launcher = FakeWorkerLauncher::silent();
    let (supervisor, _) = spawn_supervisor(5, launcher.clone());

    // WHEN
    supervisor.start().await.unwrap();

    // THEN: The first worker is terminated and a second one launched
    wait_for_status(&supervisor, "a restart", |s| s.restart_count >= 1).await;
    assert!(launcher.control(1).was_terminated());
    assert!(launcher.launches() >= 2);

    let snapshot = supervisor.status().await;
    assert!(
        snapshot
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("no heartbeat")),
        "last_error: {:?}",
        snapshot.last_error
    );
}

/// **VALUE**: A graceful stop sends Shutdown and lets the worker exit on its own.
///
/// **WHY THIS MATTERS**: The worker needs the Shutdown to close its upstream session
/// cleanly. Killing it first leaves a ghost session upstream.
///
/// **BUG THIS CATCHES**: Terminating before the grace period, or never sending Shutdown.
#[tokio::test]
async fn given_running_worker_when_stopped_gracefully_then_shutdown_sent_and_no_kill() {
    // GIVEN
    let launcher = FakeWorkerLauncher::heartbeating(HEARTBEAT);
    let (supervisor, _) = spawn_supervisor(5, launcher.clone());
    supervisor.start().await.unwrap();
    wait_for_status(&supervisor, "Running", |s| s.state == WorkerState::Running).await;

    // WHEN
    supervisor.stop(true).await.expect("stop should succeed");

    // THEN
    let control = launcher.control(1);
    assert!(
        control
            .received()
            .iter()
            .any(|p| matches!(p, Payload::Shutdown(_)))
    );
    assert!(!control.was_terminated(), "worker exited on its own");

    let snapshot = supervisor.status().await;
    assert_eq!(snapshot.state, WorkerState::Stopped);
    assert_eq!(snapshot.pid, None);

    // AND: The closed channel is not mistaken for a crash
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(supervisor.status().await.state, WorkerState::Stopped);
    assert_eq!(launcher.launches(), 1);
}

/// **VALUE**: Start while running fails with AlreadyRunning; restart replaces the worker.
///
/// **BUG THIS CATCHES**: Double launch leaving two workers on one upstream account.
#[tokio::test]
async fn given_running_worker_when_started_again_then_already_running() {
    // GIVEN
    let launcher = FakeWorkerLauncher::heartbeating(HEARTBEAT);
    let (supervisor, _) = spawn_supervisor(5, launcher.clone());
    supervisor.start().await.unwrap();
    wait_for_status(&supervisor, "Running", |s| s.state == WorkerState::Running).await;

    // WHEN
    let second = supervisor.start().await;

    // THEN
    assert!(matches!(second, Err(SupervisorError::AlreadyRunning { .. })));
    assert_eq!(launcher.launches(), 1);

    // WHEN: Explicit restart
    supervisor.restart().await.unwrap();

    // THEN: Old worker stopped gracefully, new one running
    wait_for_status(&supervisor, "Running after restart", |s| {
        s.state == WorkerState::Running
    })
    .await;
    assert_eq!(launcher.launches(), 2);
    assert!(!launcher.control(1).was_terminated());
}

/// **VALUE**: Stopping with nothing to stop is reported, not silently accepted.
#[tokio::test]
async fn given_stopped_supervisor_when_stop_called_then_not_running() {
    let launcher = FakeWorkerLauncher::heartbeating(HEARTBEAT);
    let (supervisor, _) = spawn_supervisor(5, launcher);

    let result = supervisor.stop(true).await;

    assert!(matches!(result, Err(SupervisorError::NotRunning { .. })));
}

/// **VALUE**: Config updates are persisted, forwarded to the live worker and replayed to
/// its replacement.
///
/// **WHY THIS MATTERS**: An operator changing the prefix expects it to survive the next
/// crash. Without replay the restarted worker silently reverts to the file config.
///
/// **BUG THIS CATCHES**:
/// - Update applied only to the current worker
/// - Override stored under a key the replay does not read back
#[tokio::test]
async fn given_config_update_when_worker_restarts_then_update_replayed() {
    // GIVEN
    let launcher = FakeWorkerLauncher::heartbeating(HEARTBEAT);
    let (supervisor, overrides) = spawn_supervisor(5, launcher.clone());
    supervisor.start().await.unwrap();
    wait_for_status(&supervisor, "Running", |s| s.state == WorkerState::Running).await;

    // WHEN
    supervisor
        .update_config("dispatcher.prefix", "?")
        .await
        .expect("update should succeed");

    // THEN: Persisted and forwarded
    assert_eq!(
        overrides
            .get(&format!("{OVERRIDE_PREFIX}dispatcher.prefix"))
            .unwrap()
            .as_deref(),
        Some("?")
    );
    let first = launcher.control(1);
    crate::helpers::eventually("forwarded update", Duration::from_secs(2), || {
        first
            .received_config_updates()
            .contains(&("dispatcher.prefix".to_string(), "?".to_string()))
            .then_some(())
    })
    .await;

    // WHEN: The worker crashes and is replaced
    first.crash();
    wait_for_status(&supervisor, "restart", |s| {
        s.state == WorkerState::Running && s.restart_count == 1
    })
    .await;

    // THEN: The replacement received the override
    let second = launcher.control(2);
    let replayed = crate::helpers::eventually("replayed update", Duration::from_secs(2), || {
        let updates = second.received_config_updates();
        (!updates.is_empty()).then_some(updates)
    })
    .await;
    assert_eq!(
        replayed,
        vec![("dispatcher.prefix".to_string(), "?".to_string())]
    );
}

/// **VALUE**: Unknown config keys are refused and nothing is persisted.
#[tokio::test]
async fn given_unknown_key_when_updating_config_then_rejected_and_not_persisted() {
    let launcher = FakeWorkerLauncher::heartbeating(HEARTBEAT);
    let (supervisor, overrides) = spawn_supervisor(5, launcher);

    let result = supervisor.update_config("dispatcher.colour", "blue").await;

    assert!(matches!(
        result,
        Err(SupervisorError::Config(ConfigError::UnknownKey { .. }))
    ));
    assert!(overrides.entries(OVERRIDE_PREFIX).unwrap().is_empty());
}

/// **VALUE**: Shutdown stops the worker and ends the actor; later commands fail cleanly.
#[tokio::test]
async fn given_running_worker_when_shutdown_then_stopped_and_actor_gone() {
    // GIVEN
    let launcher = FakeWorkerLauncher::heartbeating(HEARTBEAT);
    let (supervisor, _) = spawn_supervisor(5, launcher.clone());
    supervisor.start().await.unwrap();
    wait_for_status(&supervisor, "Running", |s| s.state == WorkerState::Running).await;

    // WHEN
    supervisor.shutdown().await;

    // THEN
    assert_eq!(supervisor.status().await.state, WorkerState::Stopped);
    assert!(!launcher.control(1).was_terminated());
    assert!(matches!(
        supervisor.start().await,
        Err(SupervisorError::ActorGone { .. })
    ));
}
