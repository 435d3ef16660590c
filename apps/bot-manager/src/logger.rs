//! Logging for the manager and worker binaries.
//!
//! Console output (colored) plus a plain log file, initialized once per
//! process. The worker logs to stderr because its stdout carries IPC frames,
//! and can additionally forward warnings and errors to the supervisor.

use crate::error::ManagerError;

use bot_core::worker::ForwardedLog;

use common::ErrorLocation;

use std::io::{stderr, stdout};
use std::panic::Location;
use std::path::Path;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use fern::Dispatch;
use fern::colors::Color::{Blue, Green, Magenta, Red, Yellow};
use fern::colors::ColoredLevelConfig;
use humantime::format_rfc3339;
use log::{LevelFilter, info, warn};
use tokio::sync::mpsc::UnboundedSender;

/// Thread-safe initialization guard.
static INIT_LOGGER_ONCE: Once = Once::new();

/// Tracks if logger initialization was already attempted.
static LOGGER_ALREADY_CALLED: AtomicBool = AtomicBool::new(false);

const LOGGER_INITIALIZED_MESSAGE_PREFIX: &str = "Logger initialized with level: ";

const LOGGER_ALREADY_INITIALIZED_MESSAGE: &str = "Logger already initialized";

/// Default log level for debug builds.
#[cfg(debug_assertions)]
const LOG_LEVEL: LevelFilter = LevelFilter::Debug;

/// Default log level for release builds.
#[cfg(not(debug_assertions))]
const LOG_LEVEL: LevelFilter = LevelFilter::Info;

/// Records at or above this level are forwarded to the supervisor.
const FORWARD_LEVEL: LevelFilter = LevelFilter::Warn;

/// Where console output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    /// Control process.
    Stdout,
    /// Worker process; stdout is the IPC pipe.
    Stderr,
}

impl LogTarget {
    fn file_name(self) -> &'static str {
        match self {
            LogTarget::Stdout => "bot-manager.log",
            LogTarget::Stderr => "bot-worker.log",
        }
    }
}

/// Initialize the logger with console and file output.
///
/// Safe to call more than once: later calls log a warning and return Ok.
///
/// # Errors
///
/// Returns an error if the log file cannot be created or a global logger is
/// already installed by someone else.
pub fn initialize(log_dir: &Path, target: LogTarget) -> Result<(), ManagerError> {
    initialize_with_forwarding(log_dir, target, None)
}

/// Like [`initialize`], also sending warnings and errors to `forward`.
pub fn initialize_with_forwarding(
    log_dir: &Path,
    target: LogTarget,
    forward: Option<UnboundedSender<ForwardedLog>>,
) -> Result<(), ManagerError> {
    if LOGGER_ALREADY_CALLED.swap(true, Ordering::SeqCst) {
        warn!("{LOGGER_ALREADY_INITIALIZED_MESSAGE}");
        return Ok(());
    }

    let mut result = Ok(());

    INIT_LOGGER_ONCE.call_once(|| {
        result = initialize_internal(log_dir, target, forward);
        if result.is_ok() {
            info!("{LOGGER_INITIALIZED_MESSAGE_PREFIX}{LOG_LEVEL:?}");
        }
    });

    result
}

#[track_caller]
fn initialize_internal(
    log_dir: &Path,
    target: LogTarget,
    forward: Option<UnboundedSender<ForwardedLog>>,
) -> Result<(), ManagerError> {
    let log_file_path = log_dir.join(target.file_name());

    let color_configuration = ColoredLevelConfig::new()
        .debug(Blue)
        .info(Green)
        .warn(Yellow)
        .error(Red)
        .trace(Magenta);

    let console_dispatch = Dispatch::new().format(move |out, message, record| {
        out.finish(format_args!(
            "[{date} - {level}] {message} [{file}:{line}]",
            date = format_rfc3339(SystemTime::now()),
            level = color_configuration.color(record.level()),
            message = message,
            file = record.file().unwrap_or("unknown"),
            line = record.line().unwrap_or(0),
        ))
    });
    let console_dispatch = match target {
        LogTarget::Stdout => console_dispatch.chain(stdout()),
        LogTarget::Stderr => console_dispatch.chain(stderr()),
    };

    let file_dispatch = Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{date} - {level}] {message} [{file}:{line}]",
                date = format_rfc3339(SystemTime::now()),
                level = record.level(),
                message = message,
                file = record.file().unwrap_or("unknown"),
                line = record.line().unwrap_or(0)
            ))
        })
        .chain(
            fern::log_file(&log_file_path).map_err(|e| ManagerError::Logger {
                message: format!("Failed to create log file: {e}"),
                location: ErrorLocation::from(Location::caller()),
            })?,
        );

    let mut base_dispatch = Dispatch::new()
        .level(LOG_LEVEL)
        .chain(console_dispatch)
        .chain(file_dispatch);

    if let Some(forward) = forward {
        base_dispatch = base_dispatch.chain(forwarding_dispatch(forward));
    }

    base_dispatch.apply().map_err(|e| ManagerError::Logger {
        message: format!("Failed to initialize logger: {e}"),
        location: ErrorLocation::from(Location::caller()),
    })?;

    Ok(())
}

fn forwarding_dispatch(forward: UnboundedSender<ForwardedLog>) -> Dispatch {
    Dispatch::new()
        .level(FORWARD_LEVEL)
        .chain(fern::Output::call(move |record| {
            // The receiver is gone once the worker shuts down.
            let _ = forward.send(ForwardedLog {
                level: record.level(),
                message: record.args().to_string(),
            });
        }))
}
