//! Worker side of the supervisor link.
//!
//! Wires the connection manager, event queue and dispatcher together and
//! serves the supervisor over an [`IpcChannel`](crate::ipc::IpcChannel):
//! heartbeats out, control requests in. On Shutdown every task is cancelled,
//! the upstream session is released and queued IPC frames are flushed before
//! [`WorkerRuntime::run`] returns.

use crate::config::BotConfig;
use crate::connection::ConnectionManager;
use crate::dispatch::CommandDispatcher;
use crate::error::ipc::IpcError;
use crate::ipc::message::{Payload, StatusReport};
use crate::ipc::{IpcMessage, IpcReceiver, IpcSender};
use crate::queue::{QueueMonitor, event_queue};
use crate::rate_limit::RateLimiter;
use crate::token_store::CredentialProvider;
use crate::upstream::UpstreamService;

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::spawn as TokioSpawn;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// A log record routed to the supervisor as a `LogLine`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedLog {
    pub level: log::Level,
    pub message: String,
}

pub type LogReceiver = mpsc::UnboundedReceiver<ForwardedLog>;

enum Control {
    Continue,
    Exit { grace: Duration },
}

pub struct WorkerRuntime {
    config: BotConfig,
    limiter: Arc<RateLimiter>,
    connection: ConnectionManager,
    dispatcher: Arc<CommandDispatcher>,
    logs: Option<LogReceiver>,
    started_at: Instant,
}

impl WorkerRuntime {
    pub fn new(
        config: BotConfig,
        service: Arc<dyn UpstreamService>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(&config.rate_limits));
        let connection = ConnectionManager::new(
            &config.connection,
            service,
            credentials,
            Arc::clone(&limiter),
        );
        let dispatcher = Arc::new(CommandDispatcher::new(
            config.upstream.account_id.clone(),
            config.dispatcher.prefix.clone(),
            Arc::new(connection.clone()),
        ));

        Self {
            config,
            limiter,
            connection,
            dispatcher,
            logs: None,
            started_at: Instant::now(),
        }
    }

    /// Forward records from `logs` to the supervisor.
    pub fn with_log_forwarding(mut self, logs: LogReceiver) -> Self {
        self.logs = Some(logs);
        self
    }

    /// Register commands here before calling [`run`](Self::run).
    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Serve the supervisor until Shutdown, StopRequest or channel loss.
    pub async fn run(mut self, sender: IpcSender, mut receiver: IpcReceiver) -> Result<(), IpcError> {
        let cancel = CancellationToken::new();
        let (producer, consumer) = event_queue(&self.config.queue);
        let queue = producer.monitor();

        let connection_task = {
            let connection = self.connection.clone();
            let cancel = cancel.clone();
            TokioSpawn(async move { connection.run(producer, cancel).await })
        };

        let dispatcher_task = {
            let dispatcher = Arc::clone(&self.dispatcher);
            let cancel = cancel.clone();
            TokioSpawn(async move { dispatcher.run(consumer, cancel).await })
        };

        let mut heartbeat = tokio::time::interval(self.config.supervisor.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut logs = self.logs.take();
        let mut grace = self.config.supervisor.stop_timeout();

        info!("Worker runtime started");

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let report = Payload::StatusReport(self.status_report(&queue));
                    if let Err(e) = sender.send(report).await {
                        warn!("Heartbeat not delivered, supervisor gone: {e}");
                        break;
                    }
                }
                Some(record) = recv_log(&mut logs) => {
                    let line = Payload::log_line(record.level, record.message);
                    if sender.send(line).await.is_err() {
                        break;
                    }
                }
                received = receiver.receive() => match received {
                    Ok(message) => match self.handle_control(message, &sender, &queue).await {
                        Control::Continue => {}
                        Control::Exit { grace: requested } => {
                            grace = requested;
                            break;
                        }
                    },
                    Err(e) => {
                        warn!("Supervisor channel closed: {e}");
                        break;
                    }
                }
            }
        }

        info!("Worker shutting down (grace {grace:?})");
        cancel.cancel();

        let drained = tokio::time::timeout(grace, async {
            let _ = connection_task.await;
            let _ = dispatcher_task.await;
        })
        .await;
        if drained.is_err() {
            warn!("Worker tasks did not stop within {grace:?}");
        }

        let report = Payload::StatusReport(self.status_report(&queue));
        if let Err(e) = sender.send(report).await {
            debug!("Final status not delivered: {e}");
        }

        sender.close().await;
        info!("Worker stopped");
        Ok(())
    }

    async fn handle_control(
        &mut self,
        message: IpcMessage,
        sender: &IpcSender,
        queue: &QueueMonitor,
    ) -> Control {
        let request_seq = message.seq;
        let Some(payload) = message.payload else {
            return Control::Continue;
        };

        match payload {
            Payload::Shutdown(shutdown) => {
                info!("Shutdown requested by supervisor");
                let _ = sender.send(Payload::ack(request_seq, Ok(()))).await;
                let grace = Duration::from_millis(shutdown.timeout_ms);
                Control::Exit {
                    grace: if grace.is_zero() {
                        self.config.supervisor.stop_timeout()
                    } else {
                        grace
                    },
                }
            }
            Payload::StopRequest(_) => {
                info!("Stop requested by supervisor");
                let _ = sender.send(Payload::ack(request_seq, Ok(()))).await;
                Control::Exit {
                    grace: self.config.supervisor.stop_timeout(),
                }
            }
            Payload::ConfigUpdate(update) => {
                let result = self.apply_config(&update.key, &update.value);
                let _ = sender.send(Payload::ack(request_seq, result)).await;
                Control::Continue
            }
            Payload::StatusQuery(_) => {
                let report = Payload::StatusReport(self.status_report(queue));
                let _ = sender.send(report).await;
                Control::Continue
            }
            other => {
                debug!("Worker ignoring {}", other.kind());
                let error = Err(format!("{} is not handled by the worker", other.kind()));
                let _ = sender.send(Payload::ack(request_seq, error)).await;
                Control::Continue
            }
        }
    }

    fn apply_config(&mut self, key: &str, value: &str) -> Result<(), String> {
        self.config
            .apply_update(key, value)
            .map_err(|e| e.to_string())?;

        if key == "dispatcher.prefix" {
            self.dispatcher.set_prefix(self.config.dispatcher.prefix.clone());
        } else if key.starts_with("rate_limits.") {
            self.limiter.configure_all(&self.config.rate_limits);
        }

        Ok(())
    }

    fn status_report(&self, queue: &QueueMonitor) -> StatusReport {
        let connection = self.connection.stats();
        let dispatch = self.dispatcher.stats();
        let state = self.connection.state();

        StatusReport {
            running: true,
            connected: state.is_connected(),
            last_error: self.connection.last_error(),
            restart_count: 0,
            worker_state: "Running".to_string(),
            pid: Some(std::process::id()),
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            connection_state: state.name().to_string(),
            events_received: connection.events_received,
            events_dispatched: dispatch.events_dispatched,
            actions_sent: connection.actions_sent,
            actions_deferred: connection.actions_deferred,
            handler_failures: dispatch.handler_failures,
            queue_depth: queue.stats().depth as u64,
            last_heartbeat_age_ms: None,
        }
    }
}

async fn recv_log(logs: &mut Option<LogReceiver>) -> Option<ForwardedLog> {
    match logs {
        Some(logs) => logs.recv().await,
        None => std::future::pending().await,
    }
}
