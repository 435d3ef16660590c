// Unit tests for file layout resolution.

use crate::paths::{AppPaths, CREDENTIALS_FILE_NAME, OVERRIDES_FILE_NAME, SESSION_FILE_NAME};

use std::path::PathBuf;

/// **VALUE**: Explicit paths win and every store lands under the data directory.
///
/// **WHY THIS MATTERS**: The manager passes its own paths to the worker. If the two
/// resolve differently, the worker cannot find the credential the manager stored.
#[test]
fn given_explicit_dirs_when_resolving_then_files_under_data_dir() {
    // GIVEN
    let config = PathBuf::from("/etc/bot/bot.toml");
    let data = PathBuf::from("/var/lib/bot");

    // WHEN
    let paths = AppPaths::resolve(Some(config.clone()), Some(data.clone()));

    // THEN
    assert_eq!(paths.config_file, config);
    assert_eq!(paths.log_dir, data.join("logs"));
    assert_eq!(paths.credentials_file(), data.join(CREDENTIALS_FILE_NAME));
    assert_eq!(paths.overrides_file(), data.join(OVERRIDES_FILE_NAME));
    assert_eq!(paths.session_file(), data.join(SESSION_FILE_NAME));
}

/// **VALUE**: Without overrides the config file is still named bot.toml.
#[test]
fn given_no_overrides_when_resolving_then_default_file_name() {
    let paths = AppPaths::resolve(None, None);

    assert_eq!(
        paths.config_file.file_name().and_then(|n| n.to_str()),
        Some("bot.toml")
    );
    assert!(paths.log_dir.starts_with(&paths.data_dir));
}
