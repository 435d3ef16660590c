//! OS-level termination of a worker that ignored Shutdown.

use std::time::Duration;

use backoff::{ExponentialBackoff, backoff::Backoff};
use log::{debug, trace, warn};
use sysinfo::{Pid, Process, ProcessesToUpdate, System};
use tokio::time::sleep as TokioSleep;

const TERM_VERIFY_MAX_ELAPSED: Duration = Duration::from_secs(5);

pub(crate) fn with_process<F, R>(pid: u32, f: F) -> Option<R>
where
    F: FnOnce(&Process) -> R,
{
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);

    sys.process(Pid::from_u32(pid)).map(f)
}

/// Ask a process to terminate (SIGTERM where supported) and wait for it to go away.
///
/// Polls with exponential backoff for up to `max_wait`. Refuses PID 0, PID 1
/// and this process itself.
///
/// # Returns
///
/// * `true` - the process is gone
/// * `false` - it does not exist, refused the signal, or outlived `max_wait`
pub async fn terminate_pid(pid: u32, max_wait: Duration) -> bool {
    if pid <= 1 || pid == std::process::id() {
        warn!("Refusing to terminate PID {pid}");
        return false;
    }

    let signalled = with_process(pid, |p| {
        if let Some(sent) = p.kill_with(sysinfo::Signal::Term) {
            debug!("Sent SIGTERM to PID {pid}: success={sent}");
            sent
        } else {
            let killed = p.kill();
            debug!("Sent SIGKILL to PID {pid}: success={killed}");
            killed
        }
    })
    .unwrap_or_else(|| {
        debug!("Process {pid} not found");
        false
    });

    if !signalled {
        return false;
    }

    let mut backoff = ExponentialBackoff {
        max_elapsed_time: Some(max_wait.min(TERM_VERIFY_MAX_ELAPSED)),
        ..Default::default()
    };

    loop {
        if with_process(pid, |p| p.status() != sysinfo::ProcessStatus::Zombie) != Some(true) {
            debug!("Process {pid} terminated");
            return true;
        }

        match backoff.next_backoff() {
            Some(duration) => {
                trace!("Process {pid} still alive, retrying after {duration:?}");
                TokioSleep(duration).await;
            }
            None => {
                debug!("Process {pid} still running after {max_wait:?}");
                return false;
            }
        }
    }
}
