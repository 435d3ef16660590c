// Unit tests for logger initialization.
// The logger is process-global, so these run serially.

use crate::logger::{LogTarget, initialize, initialize_with_forwarding};

use std::path::PathBuf;

use serial_test::serial;
use tokio::sync::mpsc;

/// **VALUE**: Calling initialize() again is a warned no-op, not a failure.
///
/// **WHY THIS MATTERS**: The worker and tests may reach initialization from more than
/// one path. A second call that errors or panics would abort startup.
///
/// **BUG THIS CATCHES**: Removing the Once/AtomicBool guards, letting fern try to
/// install a second global logger.
#[test]
#[serial]
fn given_logger_initialized_when_called_again_then_returns_ok() {
    // GIVEN
    let temp_dir = tempfile::tempdir().unwrap();

    // WHEN
    let result1 = initialize(temp_dir.path(), LogTarget::Stdout);
    let result2 = initialize(temp_dir.path(), LogTarget::Stderr);
    let (tx, _rx) = mpsc::unbounded_channel();
    let result3 = initialize_with_forwarding(temp_dir.path(), LogTarget::Stderr, Some(tx));

    // THEN
    assert!(result1.is_ok(), "First initialization should succeed");
    assert!(result2.is_ok(), "Second initialization should be a no-op");
    assert!(result3.is_ok(), "Third initialization should be a no-op");
}

/// **VALUE**: An unusable log directory is an error, not a panic.
///
/// **BUG THIS CATCHES**: Unwrapping `fern::log_file()` so a read-only data directory
/// crashes the manager at startup.
///
/// The guard is process-wide; if another test claimed it first this call is a no-op.
#[test]
#[serial]
fn given_invalid_log_dir_when_initialize_called_then_error_not_panic() {
    // GIVEN
    let invalid_dir = PathBuf::from("/dev/null/invalid-path");

    // WHEN
    let result = initialize(&invalid_dir, LogTarget::Stdout);

    // THEN
    if let Err(err) = result {
        assert!(format!("{err:?}").contains("Logger"));
    }
}
