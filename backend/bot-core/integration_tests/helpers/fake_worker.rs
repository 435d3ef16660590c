//! In-process worker for supervisor tests.
//!
//! Each launch wires a fresh duplex pipe with an [`IpcChannel`] on both ends
//! and runs a small task that heartbeats, records what it receives and exits
//! on Shutdown. Tests crash a worker through its [`WorkerControl`].

use bot_core::config::{BotConfig, IpcConfig};
use bot_core::error::supervisor::SupervisorError;
use bot_core::ipc::message::StatusReport;
use bot_core::ipc::{IpcChannel, IpcReceiver, IpcSender, Payload};
use bot_core::supervisor::{
    LaunchedWorker, ProcessSupervisor, WorkerHandle, WorkerLauncher, WorkerSnapshot,
};

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const PIPE_BUFFER: usize = 64 * 1024;

/// Supervisor config with timings short enough for tests.
pub fn fast_config(max_restarts: u32) -> BotConfig {
    let mut config = BotConfig::default();
    config.supervisor.heartbeat_interval_ms = 20;
    config.supervisor.heartbeat_timeout_ms = 400;
    config.supervisor.restart_delay_ms = 10;
    config.supervisor.stop_timeout_ms = 1_000;
    config.supervisor.max_restarts = max_restarts;
    config
}

/// Test-side view of one launched worker.
#[derive(Clone, Default)]
pub struct WorkerControl {
    crash: CancellationToken,
    received: Arc<Mutex<Vec<Payload>>>,
    terminated: Arc<AtomicBool>,
}

impl WorkerControl {
    /// Drop the worker's side of the channel without a goodbye.
    pub fn crash(&self) {
        self.crash.cancel();
    }

    pub fn received(&self) -> Vec<Payload> {
        lock(&self.received).clone()
    }

    pub fn received_config_updates(&self) -> Vec<(String, String)> {
        self.received()
            .into_iter()
            .filter_map(|payload| match payload {
                Payload::ConfigUpdate(update) => Some((update.key, update.value)),
                _ => None,
            })
            .collect()
    }

    pub fn was_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

pub struct FakeWorkerLauncher {
    ipc: IpcConfig,
    heartbeat: Option<Duration>,
    launches: AtomicU32,
    controls: Mutex<Vec<WorkerControl>>,
}

impl FakeWorkerLauncher {
    /// Workers that heartbeat every `interval`.
    pub fn heartbeating(interval: Duration) -> Arc<Self> {
        Arc::new(Self::new(Some(interval)))
    }

    /// Workers that never heartbeat.
    pub fn silent() -> Arc<Self> {
        Arc::new(Self::new(None))
    }

    fn new(heartbeat: Option<Duration>) -> Self {
        Self {
            ipc: IpcConfig::default(),
            heartbeat,
            launches: AtomicU32::new(0),
            controls: Mutex::new(Vec::new()),
        }
    }

    pub fn launches(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }

    /// Control for the `n`th launch, 1-based.
    pub fn control(&self, n: usize) -> WorkerControl {
        lock(&self.controls)[n - 1].clone()
    }

    pub fn latest(&self) -> WorkerControl {
        let controls = lock(&self.controls);
        controls[controls.len() - 1].clone()
    }
}

#[async_trait]
impl WorkerLauncher for FakeWorkerLauncher {
    async fn launch(&self) -> Result<LaunchedWorker, SupervisorError> {
        let (supervisor_io, worker_io) = tokio::io::duplex(PIPE_BUFFER);
        let (sender, receiver) = IpcChannel::new(supervisor_io, &self.ipc);
        let (worker_tx, worker_rx) = IpcChannel::new(worker_io, &self.ipc);

        let control = WorkerControl::default();
        let task = tokio::spawn(run_fake_worker(
            worker_tx,
            worker_rx,
            self.heartbeat,
            control.clone(),
        ));

        lock(&self.controls).push(control.clone());
        let n = self.launches.fetch_add(1, Ordering::SeqCst) + 1;

        Ok(LaunchedWorker {
            pid: Some(40_000 + n),
            sender,
            receiver,
            handle: Box::new(FakeWorkerHandle {
                task: Some(task),
                control,
            }),
        })
    }
}

async fn run_fake_worker(
    sender: IpcSender,
    mut receiver: IpcReceiver,
    heartbeat: Option<Duration>,
    control: WorkerControl,
) {
    let mut ticker = tokio::time::interval(heartbeat.unwrap_or(Duration::from_secs(3600)));

    loop {
        tokio::select! {
            _ = control.crash.cancelled() => {
                sender.close().await;
                return;
            }
            _ = ticker.tick(), if heartbeat.is_some() => {
                let report = StatusReport {
                    running: true,
                    connected: true,
                    connection_state: "Connected".to_string(),
                    ..Default::default()
                };
                let _ = sender.send(Payload::StatusReport(report)).await;
            }
            received = receiver.receive() => {
                let Ok(message) = received else {
                    return;
                };
                let seq = message.seq;
                let Some(payload) = message.payload else {
                    continue;
                };
                lock(&control.received).push(payload.clone());

                match payload {
                    Payload::Shutdown(_) | Payload::StopRequest(_) => {
                        let _ = sender.send(Payload::ack(seq, Ok(()))).await;
                        sender.close().await;
                        return;
                    }
                    Payload::ConfigUpdate(_) => {
                        let _ = sender.send(Payload::ack(seq, Ok(()))).await;
                    }
                    _ => {}
                }
            }
        }
    }
}

struct FakeWorkerHandle {
    task: Option<JoinHandle<()>>,
    control: WorkerControl,
}

#[async_trait]
impl WorkerHandle for FakeWorkerHandle {
    async fn wait_exit(&mut self, timeout: Duration) -> bool {
        let Some(task) = self.task.as_mut() else {
            return true;
        };

        match tokio::time::timeout(timeout, task).await {
            Ok(_) => {
                self.task = None;
                true
            }
            Err(_) => false,
        }
    }

    async fn terminate(&mut self) -> Result<(), SupervisorError> {
        self.control.terminated.store(true, Ordering::SeqCst);
        self.control.crash.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Ok(())
    }
}

/// Poll the supervisor snapshot until `predicate` holds.
pub async fn wait_for_status<F>(
    supervisor: &ProcessSupervisor,
    what: &str,
    predicate: F,
) -> WorkerSnapshot
where
    F: Fn(&WorkerSnapshot) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = supervisor.status().await;
        if predicate(&snapshot) {
            return snapshot;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {what}; state {} restarts {}",
            snapshot.state,
            snapshot.restart_count
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}
