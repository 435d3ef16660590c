use crate::ipc::message::StatusReport;
use crate::supervisor::{WorkerSnapshot, WorkerState};

use std::time::Duration;

use tokio::time::Instant;

fn report(connected: bool) -> StatusReport {
    StatusReport {
        connected,
        connection_state: if connected { "Connected" } else { "Backoff" }.to_string(),
        events_received: 12,
        ..Default::default()
    }
}

/// **VALUE**: `connected` is only reported while a live worker says so.
///
/// **WHY THIS MATTERS**: After a crash the last heartbeat still says `connected: true`.
/// Reporting that to operators hides the outage.
///
/// **BUG THIS CATCHES**: Echoing the stale worker report after the process died.
#[test]
fn given_crashed_worker_with_stale_report_when_reporting_then_not_connected() {
    // GIVEN: Last report said connected, but the worker crashed
    let snapshot = WorkerSnapshot {
        state: WorkerState::Crashed,
        restart_count: 2,
        last_error: Some("exit status 101".to_string()),
        last_report: Some(report(true)),
        ..Default::default()
    };

    // WHEN
    let status = snapshot.control_status();
    let full = snapshot.to_status_report(Instant::now());

    // THEN
    assert!(!status.running);
    assert!(!status.connected);
    assert_eq!(status.restart_count, 2);
    assert_eq!(status.last_error.as_deref(), Some("exit status 101"));
    assert_eq!(full.connection_state, "Disconnected");
    assert_eq!(full.worker_state, "Crashed");
    assert_eq!(full.uptime_ms, 0);
}

/// **VALUE**: A running worker's counters are merged with supervisor-owned fields.
///
/// **BUG THIS CATCHES**: Worker-sent `restart_count` (always 0) overwriting the
/// supervisor's count.
#[test]
fn given_running_worker_when_reporting_then_counters_and_ages_merged() {
    // GIVEN: Started 10s ago, last heartbeat 1s ago
    let now = Instant::now();
    let snapshot = WorkerSnapshot {
        state: WorkerState::Running,
        pid: Some(4242),
        restart_count: 3,
        started_at: Some(now - Duration::from_secs(10)),
        last_heartbeat: Some(now - Duration::from_secs(1)),
        last_report: Some(report(true)),
        ..Default::default()
    };

    // WHEN
    let full = snapshot.to_status_report(now);

    // THEN
    assert!(full.running);
    assert!(full.connected);
    assert_eq!(full.restart_count, 3);
    assert_eq!(full.pid, Some(4242));
    assert_eq!(full.events_received, 12);
    assert_eq!(full.uptime_ms, 10_000);
    assert_eq!(full.last_heartbeat_age_ms, Some(1_000));
}

/// **VALUE**: Only `Starting` and `Running` count as live.
#[test]
fn given_each_state_when_checking_liveness_then_only_starting_and_running() {
    let live: Vec<WorkerState> = [
        WorkerState::Stopped,
        WorkerState::Starting,
        WorkerState::Running,
        WorkerState::Crashed,
        WorkerState::Restarting,
        WorkerState::Stopping,
        WorkerState::Failed,
    ]
    .into_iter()
    .filter(|s| s.is_live())
    .collect();

    assert_eq!(live, vec![WorkerState::Starting, WorkerState::Running]);
}
