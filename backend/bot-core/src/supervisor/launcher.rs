//! How the supervisor gets a worker: a child process in production, anything
//! that speaks the IPC protocol in tests.

use crate::config::IpcConfig;
use crate::error::supervisor::SupervisorError;
use crate::ipc::{IpcChannel, IpcReceiver, IpcSender};
use crate::supervisor::process::terminate_pid;

use common::ErrorLocation;

use std::env::current_exe;
use std::io::ErrorKind;
use std::panic::Location;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, trace, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child as TokioChild;
use tokio::process::Command as TokioCommand;
use tokio::spawn as TokioSpawn;

/// A started worker: its channel ends plus a handle to stop it.
pub struct LaunchedWorker {
    pub pid: Option<u32>,
    pub sender: IpcSender,
    pub receiver: IpcReceiver,
    pub handle: Box<dyn WorkerHandle>,
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync + 'static {
    async fn launch(&self) -> Result<LaunchedWorker, SupervisorError>;
}

#[async_trait]
pub trait WorkerHandle: Send + Sync {
    /// Wait up to `timeout` for the worker to exit on its own.
    async fn wait_exit(&mut self, timeout: Duration) -> bool;

    /// Stop the worker regardless of what it is doing.
    async fn terminate(&mut self) -> Result<(), SupervisorError>;
}

/// Spawns the worker binary with its IPC channel on stdin/stdout.
pub struct ProcessLauncher {
    binary: String,
    args: Vec<String>,
    ipc: IpcConfig,
}

impl ProcessLauncher {
    pub fn new(binary: impl Into<String>, args: Vec<String>, ipc: IpcConfig) -> Self {
        Self {
            binary: binary.into(),
            args,
            ipc,
        }
    }

    fn command(&self, program: &PathBuf) -> TokioCommand {
        let mut cmd = TokioCommand::new(program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn_child(&self) -> Result<TokioChild, SupervisorError> {
        let program = PathBuf::from(&self.binary);
        debug!("Attempting to spawn {} from PATH", self.binary);

        match self.command(&program).spawn() {
            Ok(child) => Ok(child),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("{} not in PATH, trying next to this executable", self.binary);
                self.spawn_sibling()
            }
            Err(err) => Err(SupervisorError::spawn(
                format!("Failed to spawn {}: {err}", self.binary),
                err,
            )),
        }
    }

    fn spawn_sibling(&self) -> Result<TokioChild, SupervisorError> {
        let exe = current_exe().map_err(|e| {
            SupervisorError::spawn(format!("Failed to get current executable path: {e}"), e)
        })?;

        let dir = exe.parent().ok_or_else(|| SupervisorError::NotRunning {
            message: format!("Executable has no parent directory: {}", exe.display()),
            location: ErrorLocation::from(Location::caller()),
        })?;

        let local_path = dir.join(&self.binary);
        debug!("Attempting to spawn from {}", local_path.display());

        self.command(&local_path).spawn().map_err(|e| {
            SupervisorError::spawn(
                format!("Failed to spawn {}: {e}", local_path.display()),
                e,
            )
        })
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self) -> Result<LaunchedWorker, SupervisorError> {
        let mut child = self.spawn_child()?;
        let pid = child.id();

        let stdin = child.stdin.take().ok_or_else(|| SupervisorError::NotRunning {
            message: "Child process has no stdin".to_string(),
            location: ErrorLocation::from(Location::caller()),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| SupervisorError::NotRunning {
            message: "Child process has no stdout".to_string(),
            location: ErrorLocation::from(Location::caller()),
        })?;

        if let Some(stderr) = child.stderr.take() {
            TokioSpawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    trace!("Worker stderr: {line}");
                }
            });
        }

        let (sender, receiver) = IpcChannel::from_parts(stdout, stdin, &self.ipc);

        info!("Spawned worker {} (PID: {pid:?})", self.binary);

        Ok(LaunchedWorker {
            pid,
            sender,
            receiver,
            handle: Box::new(ChildHandle { child }),
        })
    }
}

struct ChildHandle {
    child: TokioChild,
}

#[async_trait]
impl WorkerHandle for ChildHandle {
    async fn wait_exit(&mut self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Worker exited with {status}");
                true
            }
            Ok(Err(e)) => {
                warn!("Failed waiting for worker exit: {e}");
                false
            }
            Err(_) => false,
        }
    }

    async fn terminate(&mut self) -> Result<(), SupervisorError> {
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!("Worker already exited with {status}");
            return Ok(());
        }

        if let Some(pid) = self.child.id()
            && terminate_pid(pid, Duration::from_secs(2)).await
        {
            // Reap the zombie.
            let _ = self.child.wait().await;
            return Ok(());
        }

        self.child
            .kill()
            .await
            .map_err(|e| SupervisorError::Terminate {
                message: format!("Failed to kill worker: {e}"),
                location: ErrorLocation::from(Location::caller()),
            })
    }
}
