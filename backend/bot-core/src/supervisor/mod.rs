//! Worker process supervision using the actor pattern.
//!
//! One task owns the [`WorkerSnapshot`] and the live worker handle. Control
//! calls are messages to that task; `status()` reads a published copy behind
//! an `RwLock` and never waits on the actor.
//!
//! Crash detection is heartbeat based: a worker that has not sent a
//! `StatusReport` within `heartbeat_timeout`, or whose channel closes while it
//! should be live, is Crashed. Restarts use a fixed delay up to
//! `max_restarts`, after which the worker is Failed until an operator starts
//! it again.

mod launcher;
pub mod process;
mod state;

pub use launcher::{LaunchedWorker, ProcessLauncher, WorkerHandle, WorkerLauncher};
pub use state::{ControlStatus, WorkerSnapshot, WorkerState};

use crate::config::{BotConfig, KeyValueStore, SupervisorConfig};
use crate::error::supervisor::SupervisorError;
use crate::ipc::message::{ConfigUpdate, LogLevel, Payload, Shutdown, StatusReport};
use crate::ipc::{IpcMessage, IpcReceiver, IpcSender};

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, log, warn};
use tokio::spawn as TokioSpawn;
use tokio::sync::{RwLock, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, sleep_until};

/// Key prefix under which runtime config overrides are persisted.
pub const OVERRIDE_PREFIX: &str = "override.";

const COMMAND_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 256;
const MIN_LIVENESS_TICK: Duration = Duration::from_millis(10);

/// Commands that mutate supervisor state.
enum SupervisorCommand {
    Start {
        restart: bool,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    Stop {
        graceful: bool,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    UpdateConfig {
        key: String,
        value: String,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Frames and closure notices from the current worker's channel.
enum WorkerEvent {
    Frame { generation: u64, message: IpcMessage },
    Closed { generation: u64 },
}

/// Handle to the supervisor actor. Clones share the same actor.
#[derive(Clone)]
pub struct ProcessSupervisor {
    command_tx: mpsc::Sender<SupervisorCommand>,
    snapshot: Arc<RwLock<WorkerSnapshot>>,
    state_rx: watch::Receiver<WorkerState>,
}

impl ProcessSupervisor {
    /// Spawn the supervisor actor. Must be called inside a tokio runtime.
    ///
    /// `overrides` persists config updates so they survive restarts.
    pub fn spawn(
        config: BotConfig,
        launcher: Arc<dyn WorkerLauncher>,
        overrides: Arc<dyn KeyValueStore>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (state_tx, state_rx) = watch::channel(WorkerState::Stopped);
        let snapshot = Arc::new(RwLock::new(WorkerSnapshot::default()));

        let actor = SupervisorActor {
            supervisor: config.supervisor.clone(),
            config,
            launcher,
            overrides,
            process: WorkerSnapshot::default(),
            published: Arc::clone(&snapshot),
            state_tx,
            worker: None,
            generation: 0,
            events_tx,
            restart_at: None,
        };

        TokioSpawn(actor.run(command_rx, events_rx));
        info!("Supervisor actor spawned");

        Self {
            command_tx,
            snapshot,
            state_rx,
        }
    }

    /// Launch the worker.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::AlreadyRunning`] if the worker is Starting, Running
    /// or waiting to restart.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        self.request(|reply| SupervisorCommand::Start {
            restart: false,
            reply,
        })
        .await
    }

    /// Stop a live worker gracefully, then launch a new one.
    pub async fn restart(&self) -> Result<(), SupervisorError> {
        self.request(|reply| SupervisorCommand::Start {
            restart: true,
            reply,
        })
        .await
    }

    /// Stop the worker. Graceful stops send Shutdown and wait up to
    /// `stop_timeout` before force-terminating.
    pub async fn stop(&self, graceful: bool) -> Result<(), SupervisorError> {
        self.request(|reply| SupervisorCommand::Stop { graceful, reply })
            .await
    }

    /// Validate, persist and forward a runtime config update.
    pub async fn update_config(&self, key: &str, value: &str) -> Result<(), SupervisorError> {
        let key = key.to_string();
        let value = value.to_string();
        self.request(|reply| SupervisorCommand::UpdateConfig { key, value, reply })
            .await
    }

    /// Stop the worker gracefully and end the actor.
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self
            .command_tx
            .send(SupervisorCommand::Shutdown { reply })
            .await
            .is_ok()
        {
            let _ = done.await;
        }
    }

    /// Current snapshot. Does not wait on the actor.
    pub async fn status(&self) -> WorkerSnapshot {
        self.snapshot.read().await.clone()
    }

    pub async fn control_status(&self) -> ControlStatus {
        self.snapshot.read().await.control_status()
    }

    pub async fn status_report(&self) -> StatusReport {
        self.snapshot.read().await.to_status_report(Instant::now())
    }

    /// Watch lifecycle state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state_rx.clone()
    }

    async fn request<F>(&self, build: F) -> Result<(), SupervisorError>
    where
        F: FnOnce(oneshot::Sender<Result<(), SupervisorError>>) -> SupervisorCommand,
    {
        let (reply, response) = oneshot::channel();

        self.command_tx
            .send(build(reply))
            .await
            .map_err(|e| SupervisorError::actor_gone(format!("Supervisor actor died: {e}")))?;

        response
            .await
            .map_err(|e| SupervisorError::actor_gone(format!("Supervisor dropped reply: {e}")))?
    }
}

struct ActiveWorker {
    sender: IpcSender,
    handle: Box<dyn WorkerHandle>,
    pump: JoinHandle<()>,
}

struct SupervisorActor {
    supervisor: SupervisorConfig,
    config: BotConfig,
    launcher: Arc<dyn WorkerLauncher>,
    overrides: Arc<dyn KeyValueStore>,
    process: WorkerSnapshot,
    published: Arc<RwLock<WorkerSnapshot>>,
    state_tx: watch::Sender<WorkerState>,
    worker: Option<ActiveWorker>,
    /// Bumped per launch so events from a replaced worker are ignored.
    generation: u64,
    events_tx: mpsc::Sender<WorkerEvent>,
    restart_at: Option<Instant>,
}

impl SupervisorActor {
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<SupervisorCommand>,
        mut events_rx: mpsc::Receiver<WorkerEvent>,
    ) {
        let period = (self.supervisor.heartbeat_interval() / 2).max(MIN_LIVENESS_TICK);
        let mut liveness = tokio::time::interval(period);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Supervisor actor started");

        loop {
            let restart_at = self.restart_at;

            tokio::select! {
                command = command_rx.recv() => {
                    match command {
                        Some(SupervisorCommand::Shutdown { reply }) => {
                            self.shutdown().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            self.shutdown().await;
                            break;
                        }
                    }
                }
                Some(event) = events_rx.recv() => self.handle_worker_event(event).await,
                _ = liveness.tick() => self.check_liveness().await,
                _ = sleep_until(restart_at.unwrap_or_else(Instant::now)), if restart_at.is_some() => {
                    self.restart_at = None;
                    self.perform_restart().await;
                }
            }
        }

        info!("Supervisor actor stopped");
    }

    async fn handle_command(&mut self, command: SupervisorCommand) {
        match command {
            SupervisorCommand::Start { restart, reply } => {
                let result = self.start(restart).await;
                let _ = reply.send(result);
            }
            SupervisorCommand::Stop { graceful, reply } => {
                let result = self.stop(graceful).await;
                let _ = reply.send(result);
            }
            SupervisorCommand::UpdateConfig { key, value, reply } => {
                let result = self.update_config(&key, &value).await;
                let _ = reply.send(result);
            }
            SupervisorCommand::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
            }
        }
    }

    async fn start(&mut self, restart: bool) -> Result<(), SupervisorError> {
        match self.process.state {
            WorkerState::Starting | WorkerState::Running if restart => {
                info!("Restart requested, stopping current worker");
                self.stop(true).await?;
                sleep_until(Instant::now() + self.supervisor.restart_delay()).await;
            }
            state @ (WorkerState::Starting
            | WorkerState::Running
            | WorkerState::Restarting
            | WorkerState::Stopping) => {
                return Err(SupervisorError::already_running(state.as_str()));
            }
            WorkerState::Stopped | WorkerState::Failed => {
                self.process.restart_count = 0;
            }
            WorkerState::Crashed => {}
        }

        self.process.last_error = None;
        self.launch().await
    }

    async fn launch(&mut self) -> Result<(), SupervisorError> {
        let launched = match self.launcher.launch().await {
            Ok(launched) => launched,
            Err(e) => {
                error!("Failed to launch worker: {e}");
                self.process.last_error = Some(e.to_string());
                self.publish().await;
                return Err(e);
            }
        };

        self.generation += 1;
        let now = Instant::now();
        let LaunchedWorker {
            pid,
            sender,
            receiver,
            handle,
        } = launched;

        let pump = TokioSpawn(pump_worker_frames(
            self.generation,
            receiver,
            self.events_tx.clone(),
        ));

        self.process.pid = pid;
        self.process.started_at = Some(now);
        self.process.last_heartbeat = None;
        self.process.last_report = None;
        self.set_state(WorkerState::Starting);

        self.replay_overrides(&sender).await;

        self.worker = Some(ActiveWorker {
            sender,
            handle,
            pump,
        });
        self.publish().await;

        info!(
            "Worker launched (PID: {pid:?}, generation {})",
            self.generation
        );
        Ok(())
    }

    async fn replay_overrides(&self, sender: &IpcSender) {
        let overrides = match self.overrides.entries(OVERRIDE_PREFIX) {
            Ok(overrides) => overrides,
            Err(e) => {
                warn!("Failed to read config overrides: {e}");
                return;
            }
        };

        for (key, value) in overrides {
            let key = key.trim_start_matches(OVERRIDE_PREFIX).to_string();
            let update = Payload::ConfigUpdate(ConfigUpdate {
                key: key.clone(),
                value,
            });

            if let Err(e) = sender
                .send_timeout(update, self.supervisor.stop_timeout())
                .await
            {
                warn!("Failed to replay config override '{key}': {e}");
            }
        }
    }

    async fn stop(&mut self, graceful: bool) -> Result<(), SupervisorError> {
        let Some(worker) = self.worker.take() else {
            return match self.process.state {
                WorkerState::Restarting | WorkerState::Failed | WorkerState::Crashed => {
                    self.restart_at = None;
                    self.set_state(WorkerState::Stopped);
                    self.publish().await;
                    info!("Supervisor stopped without a live worker");
                    Ok(())
                }
                _ => Err(SupervisorError::not_running("No worker is running")),
            };
        };

        self.set_state(WorkerState::Stopping);
        self.publish().await;

        self.stop_worker(worker, graceful).await;

        self.process.pid = None;
        self.process.started_at = None;
        self.restart_at = None;
        self.set_state(WorkerState::Stopped);
        self.publish().await;

        info!("Worker stopped");
        Ok(())
    }

    async fn stop_worker(&self, mut worker: ActiveWorker, graceful: bool) {
        let timeout = self.supervisor.stop_timeout();

        let exited = if graceful {
            let shutdown = Payload::Shutdown(Shutdown {
                timeout_ms: timeout.as_millis() as u64,
            });

            match worker.sender.send_timeout(shutdown, timeout).await {
                Ok(_) => worker.handle.wait_exit(timeout).await,
                Err(e) => {
                    warn!("Could not deliver Shutdown to worker: {e}");
                    false
                }
            }
        } else {
            false
        };

        if !exited {
            if graceful {
                warn!("Worker did not exit within {timeout:?}, terminating");
            }
            if let Err(e) = worker.handle.terminate().await {
                error!("Failed to terminate worker: {e}");
            }
        }

        worker.sender.close().await;
        worker.pump.abort();
    }

    async fn update_config(&mut self, key: &str, value: &str) -> Result<(), SupervisorError> {
        self.config.apply_update(key, value)?;
        self.supervisor = self.config.supervisor.clone();

        self.overrides
            .set(&format!("{OVERRIDE_PREFIX}{key}"), value)?;

        if let Some(worker) = &self.worker {
            let update = Payload::ConfigUpdate(ConfigUpdate {
                key: key.to_string(),
                value: value.to_string(),
            });
            worker
                .sender
                .send_timeout(update, self.supervisor.stop_timeout())
                .await?;
        }

        Ok(())
    }

    async fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Frame {
                generation,
                message,
            } if generation == self.generation => self.handle_frame(message).await,
            WorkerEvent::Closed { generation }
                if generation == self.generation && self.process.state.is_live() =>
            {
                self.crash("worker IPC channel closed").await;
            }
            _ => trace_stale(),
        }
    }

    async fn handle_frame(&mut self, message: IpcMessage) {
        let Some(payload) = message.payload else {
            return;
        };

        match payload {
            Payload::StatusReport(report) => {
                self.process.last_heartbeat = Some(Instant::now());
                if let Some(error) = report.last_error.clone() {
                    self.process.last_error = Some(error);
                }
                self.process.last_report = Some(report);

                if self.process.state == WorkerState::Starting {
                    info!("Worker is running (PID: {:?})", self.process.pid);
                    self.set_state(WorkerState::Running);
                }
                self.publish().await;
            }
            Payload::LogLine(line) => {
                let level = LogLevel::try_from(line.level)
                    .unwrap_or(LogLevel::Info)
                    .to_log_level();
                log!(level, "worker: {}", line.message);

                if level == log::Level::Error {
                    self.process.last_error = Some(line.message);
                    self.publish().await;
                }
            }
            Payload::Ack(ack) => {
                if !ack.success {
                    warn!(
                        "Worker rejected request #{}: {}",
                        ack.request_seq,
                        ack.error.unwrap_or_default()
                    );
                }
            }
            other => debug!("Ignoring unexpected {} from worker", other.kind()),
        }
    }

    async fn check_liveness(&mut self) {
        if !self.process.state.is_live() {
            return;
        }

        let since = self.process.last_heartbeat.or(self.process.started_at);
        let Some(since) = since else {
            return;
        };

        let silent_for = Instant::now().saturating_duration_since(since);
        if silent_for > self.supervisor.heartbeat_timeout() {
            self.crash(&format!("no heartbeat for {silent_for:?}")).await;
        }
    }

    async fn crash(&mut self, reason: &str) {
        warn!("Worker crashed: {reason}");

        self.set_state(WorkerState::Crashed);
        self.process.last_error = Some(reason.to_string());
        self.process.last_report = None;

        if let Some(mut worker) = self.worker.take() {
            if let Err(e) = worker.handle.terminate().await {
                error!("Failed to terminate crashed worker: {e}");
            }
            worker.sender.close().await;
            worker.pump.abort();
        }
        self.process.pid = None;

        if self.process.restart_count < self.supervisor.max_restarts {
            let delay = self.supervisor.restart_delay();
            info!(
                "Restarting worker in {delay:?} (restart {} of {})",
                self.process.restart_count + 1,
                self.supervisor.max_restarts
            );
            self.restart_at = Some(Instant::now() + delay);
            self.set_state(WorkerState::Restarting);
        } else {
            let message = format!(
                "worker failed after {} restarts: {reason}",
                self.process.restart_count
            );
            error!("{message}; operator intervention required");
            let failure = SupervisorError::failed(message);
            self.process.last_error = Some(failure.to_string());
            self.set_state(WorkerState::Failed);
        }

        self.publish().await;
    }

    async fn perform_restart(&mut self) {
        if self.process.state != WorkerState::Restarting {
            return;
        }

        self.process.restart_count += 1;
        info!("Restart {} of worker", self.process.restart_count);

        if let Err(e) = self.launch().await {
            self.crash(&format!("restart failed: {e}")).await;
        }
    }

    async fn shutdown(&mut self) {
        if self.worker.is_some()
            && let Err(e) = self.stop(true).await
        {
            warn!("Error stopping worker during shutdown: {e}");
        }
        self.restart_at = None;
    }

    fn set_state(&mut self, state: WorkerState) {
        if self.process.state != state {
            debug!("Worker state {} -> {}", self.process.state, state);
            self.process.state = state;
            self.state_tx.send_replace(state);
        }
    }

    async fn publish(&self) {
        *self.published.write().await = self.process.clone();
    }
}

fn trace_stale() {
    log::trace!("Ignoring event from a replaced worker");
}

async fn pump_worker_frames(
    generation: u64,
    mut receiver: IpcReceiver,
    events: mpsc::Sender<WorkerEvent>,
) {
    loop {
        match receiver.receive().await {
            Ok(message) => {
                if events
                    .send(WorkerEvent::Frame {
                        generation,
                        message,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(_) => {
                let _ = events.send(WorkerEvent::Closed { generation }).await;
                return;
            }
        }
    }
}
