use crate::ipc::message::StatusReport;

use std::fmt;

use serde::Serialize;
use tokio::time::Instant;

/// Lifecycle of the supervised worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    Stopped,
    /// Spawned, waiting for the first heartbeat.
    Starting,
    Running,
    Crashed,
    /// Waiting out the fixed restart delay.
    Restarting,
    Stopping,
    /// Restart budget exhausted. Only an operator `start()` leaves this state.
    Failed,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Stopped => "Stopped",
            WorkerState::Starting => "Starting",
            WorkerState::Running => "Running",
            WorkerState::Crashed => "Crashed",
            WorkerState::Restarting => "Restarting",
            WorkerState::Stopping => "Stopping",
            WorkerState::Failed => "Failed",
        }
    }

    /// A worker process exists and is expected to heartbeat.
    pub fn is_live(self) -> bool {
        matches!(self, WorkerState::Starting | WorkerState::Running)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supervisor's view of the worker.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub state: WorkerState,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub started_at: Option<Instant>,
    pub last_heartbeat: Option<Instant>,
    pub last_error: Option<String>,
    /// Latest heartbeat payload from the worker.
    pub last_report: Option<StatusReport>,
}

impl Default for WorkerSnapshot {
    fn default() -> Self {
        Self {
            state: WorkerState::Stopped,
            pid: None,
            restart_count: 0,
            started_at: None,
            last_heartbeat: None,
            last_error: None,
            last_report: None,
        }
    }
}

/// The four fields the control surface promises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlStatus {
    pub running: bool,
    pub connected: bool,
    pub last_error: Option<String>,
    pub restart_count: u32,
}

impl WorkerSnapshot {
    pub fn is_connected(&self) -> bool {
        self.state.is_live() && self.last_report.as_ref().is_some_and(|r| r.connected)
    }

    pub fn control_status(&self) -> ControlStatus {
        ControlStatus {
            running: self.state == WorkerState::Running,
            connected: self.is_connected(),
            last_error: self.last_error.clone(),
            restart_count: self.restart_count,
        }
    }

    /// Full status report: worker counters merged with supervisor fields.
    pub fn to_status_report(&self, now: Instant) -> StatusReport {
        let mut report = self.last_report.clone().unwrap_or_default();

        if !self.state.is_live() {
            report.connected = false;
            report.connection_state = "Disconnected".to_string();
        }

        report.running = self.state == WorkerState::Running;
        report.connected = self.is_connected();
        report.last_error = self.last_error.clone();
        report.restart_count = self.restart_count;
        report.worker_state = self.state.as_str().to_string();
        report.pid = self.pid;
        report.uptime_ms = self
            .started_at
            .filter(|_| self.state.is_live())
            .map_or(0, |at| now.saturating_duration_since(at).as_millis() as u64);
        report.last_heartbeat_age_ms = self
            .last_heartbeat
            .map(|at| now.saturating_duration_since(at).as_millis() as u64);
        report
    }
}
