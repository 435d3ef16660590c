use bot_core::config::{
    BotConfig, CONFIG_FILE_NAME, DenialPolicy, JsonFileStore, KeyValueStore, MESSAGE_CATEGORY,
};
use bot_core::error::config::ConfigError;

/// **VALUE**: A missing config file yields the defaults.
///
/// **WHY THIS MATTERS**: First run has no file. The manager must still start.
#[test]
fn given_missing_file_when_loading_then_defaults() {
    let dir = tempfile::tempdir().unwrap();

    let config = BotConfig::load(&dir.path().join(CONFIG_FILE_NAME)).unwrap();

    assert_eq!(config.dispatcher.prefix, "!");
    assert_eq!(
        config.bucket_for(MESSAGE_CATEGORY).policy,
        DenialPolicy::Defer
    );
}

/// **VALUE**: Saved config loads back with every changed field intact.
///
/// **BUG THIS CATCHES**: Fields missing `serde(default)` or skipped on serialize.
#[test]
fn given_modified_config_when_saved_and_loaded_then_values_survive() {
    // GIVEN
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join(CONFIG_FILE_NAME);
    let mut config = BotConfig::default();
    config.apply_update("dispatcher.prefix", "?").unwrap();
    config.apply_update("supervisor.max_restarts", "9").unwrap();
    config.upstream.account_id = "1087654321098765432".to_string();

    // WHEN
    config.save(&path).unwrap();
    let loaded = BotConfig::load(&path).unwrap();

    // THEN
    assert_eq!(loaded.dispatcher.prefix, "?");
    assert_eq!(loaded.supervisor.max_restarts, 9);
    assert_eq!(loaded.upstream.account_id, "1087654321098765432");
    assert_eq!(
        loaded.bucket_for(MESSAGE_CATEGORY),
        config.bucket_for(MESSAGE_CATEGORY)
    );
}

/// **VALUE**: A partial file fills in defaults for everything it omits.
#[test]
fn given_partial_file_when_loading_then_omitted_sections_default() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(CONFIG_FILE_NAME);
    std::fs::write(&path, "[dispatcher]\nprefix = \"$\"\n").unwrap();

    let config = BotConfig::load(&path).unwrap();

    assert_eq!(config.dispatcher.prefix, "$");
    assert_eq!(
        config.supervisor.max_restarts,
        BotConfig::default().supervisor.max_restarts
    );
}

/// **VALUE**: A broken file is an error naming the file, not silent defaults.
///
/// **WHY THIS MATTERS**: Silently falling back would start the bot with settings the
/// operator never chose, such as looser rate limits.
#[test]
fn given_unparseable_file_when_loading_then_parse_error_with_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(CONFIG_FILE_NAME);
    std::fs::write(&path, "[dispatcher\nprefix = ").unwrap();

    match BotConfig::load(&path) {
        Err(ConfigError::ParseError { path: reported, .. }) => assert_eq!(reported, path),
        other => panic!("expected ParseError, got {other:?}"),
    }
}

/// **VALUE**: A file that parses but breaks a rule is rejected.
#[test]
fn given_invalid_values_when_loading_then_validation_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(CONFIG_FILE_NAME);
    std::fs::write(
        &path,
        "[supervisor]\nheartbeat_interval_ms = 5000\nheartbeat_timeout_ms = 1000\n",
    )
    .unwrap();

    assert!(matches!(
        BotConfig::load(&path),
        Err(ConfigError::ValidationError { .. })
    ));
}

/// **VALUE**: The file store persists across instances and lists by prefix.
///
/// **WHY THIS MATTERS**: Runtime overrides are replayed from this store after a
/// manager restart.
#[test]
fn given_file_store_when_reopened_then_entries_persist() {
    // GIVEN
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("overrides.json");
    let store = JsonFileStore::new(&path);
    store.set("override.dispatcher.prefix", "?").unwrap();
    store.set("override.supervisor.max_restarts", "7").unwrap();
    store.set("credential", "{}").unwrap();
    store.remove("missing").unwrap();

    // WHEN
    let reopened = JsonFileStore::new(&path);

    // THEN
    assert_eq!(
        reopened.get("override.dispatcher.prefix").unwrap().as_deref(),
        Some("?")
    );
    assert_eq!(
        reopened.entries("override.").unwrap(),
        vec![
            (
                "override.dispatcher.prefix".to_string(),
                "?".to_string()
            ),
            (
                "override.supervisor.max_restarts".to_string(),
                "7".to_string()
            ),
        ]
    );

    reopened.remove("credential").unwrap();
    assert_eq!(store.get("credential").unwrap(), None);
}

/// **VALUE**: Store files are private to the owner.
#[cfg(unix)]
#[test]
fn given_file_store_when_written_then_owner_only_permissions() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("secrets.json");
    JsonFileStore::new(&path).set("credential", "{}").unwrap();

    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}
