// Unit tests for config validation and runtime updates.
// File round-trips through BotConfig::load live in integration_tests/config.rs.

use crate::config::{BotConfig, DenialPolicy, MESSAGE_CATEGORY, OverflowPolicy};
use crate::error::config::ConfigError;

/// **VALUE**: The built-in defaults are themselves valid.
///
/// **WHY THIS MATTERS**: A missing config file falls back to defaults. If they fail
/// validation, a fresh install cannot start.
///
/// **BUG THIS CATCHES**: A default changed without updating the validation rules.
#[test]
fn given_defaults_when_validated_then_ok() {
    // GIVEN/WHEN
    let config = BotConfig::default();

    // THEN
    assert!(config.validate().is_ok());
    assert_eq!(config.dispatcher.prefix, "!");
    assert_eq!(config.queue.overflow, OverflowPolicy::Block);
    assert_eq!(config.bucket_for(MESSAGE_CATEGORY).policy, DenialPolicy::Defer);
}

/// **VALUE**: A partial TOML document fills the rest from defaults.
///
/// **BUG THIS CATCHES**: Missing `#[serde(default)]` on a section, forcing operators to
/// write every field.
#[test]
fn given_partial_toml_when_parsed_then_missing_fields_defaulted() {
    // GIVEN: Only the prefix and one bucket set
    let toml = r#"
        [dispatcher]
        prefix = "?"

        [rate_limits.categories.reaction]
        capacity = 4.0
        refill_per_second = 1.0
        policy = "defer"
    "#;

    // WHEN
    let config = BotConfig::from_toml(toml).unwrap();

    // THEN: Explicit values kept, other sections defaulted
    assert_eq!(config.dispatcher.prefix, "?");
    assert_eq!(config.bucket_for("reaction").capacity, 4.0);
    assert_eq!(config.bucket_for("reaction").policy, DenialPolicy::Defer);
    assert_eq!(config.supervisor.max_restarts, 5);
}

/// **VALUE**: A heartbeat timeout that is not longer than the interval is rejected.
///
/// **WHY THIS MATTERS**: Such a config would declare every healthy worker hung and
/// restart it in a loop.
///
/// **BUG THIS CATCHES**: Missing cross-field validation.
#[test]
fn given_timeout_not_above_interval_when_parsed_then_validation_error() {
    // GIVEN
    let toml = r#"
        [supervisor]
        heartbeat_interval_ms = 1000
        heartbeat_timeout_ms = 1000
    "#;

    // WHEN
    let result = BotConfig::from_toml(toml);

    // THEN
    assert!(matches!(result, Err(ConfigError::ValidationError { .. })));
}

/// **VALUE**: Malformed TOML produces a parse error, not defaults.
///
/// **BUG THIS CATCHES**: Silently ignoring a broken file the operator thinks is in effect.
#[test]
fn given_malformed_toml_when_parsed_then_parse_error() {
    let result = BotConfig::from_toml("[supervisor\nmax_restarts = ");
    assert!(matches!(result, Err(ConfigError::ParseError { .. })));
}

/// **VALUE**: Runtime updates to known keys take effect.
#[test]
fn given_known_keys_when_applied_then_config_updated() {
    // GIVEN
    let mut config = BotConfig::default();

    // WHEN
    config.apply_update("dispatcher.prefix", "$").unwrap();
    config.apply_update("supervisor.max_restarts", "9").unwrap();
    config.apply_update("rate_limits.message.capacity", "10").unwrap();
    config.apply_update("rate_limits.reaction.policy", "defer").unwrap();

    // THEN: New categories start from the default bucket
    assert_eq!(config.dispatcher.prefix, "$");
    assert_eq!(config.supervisor.max_restarts, 9);
    assert_eq!(config.bucket_for(MESSAGE_CATEGORY).capacity, 10.0);
    let reaction = config.bucket_for("reaction");
    assert_eq!(reaction.policy, DenialPolicy::Defer);
    assert_eq!(reaction.capacity, config.rate_limits.default.capacity);
}

/// **VALUE**: Unknown keys are rejected by name.
///
/// **WHY THIS MATTERS**: A typo in an operator command must be reported, not silently
/// accepted and persisted as an override.
///
/// **BUG THIS CATCHES**: Catch-all match arm that swallows unknown keys.
#[test]
fn given_unknown_key_when_applied_then_unknown_key_error() {
    let mut config = BotConfig::default();

    let result = config.apply_update("dispatcher.prefx", "?");

    match result {
        Err(ConfigError::UnknownKey { key, .. }) => assert_eq!(key, "dispatcher.prefx"),
        other => panic!("expected UnknownKey, got {other:?}"),
    }
}

/// **VALUE**: A rejected update leaves the config unchanged.
///
/// **WHY THIS MATTERS**: Partial application would put the running worker into a state
/// that no file or override describes.
///
/// **BUG THIS CATCHES**: Mutating in place before validation.
#[test]
fn given_invalid_value_when_applied_then_config_untouched() {
    // GIVEN
    let mut config = BotConfig::default();

    // WHEN: Prefix with whitespace, a zero refill, and a non-numeric value
    let prefix = config.apply_update("dispatcher.prefix", "hey bot");
    let refill = config.apply_update("rate_limits.message.refill_per_second", "0");
    let restarts = config.apply_update("supervisor.max_restarts", "many");
    let policy = config.apply_update("rate_limits.message.policy", "sometimes");

    // THEN
    assert!(matches!(prefix, Err(ConfigError::ValidationError { .. })));
    assert!(matches!(refill, Err(ConfigError::ValidationError { .. })));
    assert!(matches!(restarts, Err(ConfigError::InvalidValue { .. })));
    assert!(matches!(policy, Err(ConfigError::InvalidValue { .. })));
    assert_eq!(config.dispatcher.prefix, "!");
    assert!(config.bucket_for(MESSAGE_CATEGORY).refill_per_second > 0.0);
    assert_eq!(config.supervisor.max_restarts, 5);
}

/// **VALUE**: Only websocket URLs are accepted for the upstream.
#[test]
fn given_http_upstream_url_when_parsed_then_validation_error() {
    let toml = r#"
        [upstream]
        url = "http://localhost:9000"
    "#;

    assert!(matches!(
        BotConfig::from_toml(toml),
        Err(ConfigError::ValidationError { .. })
    ));
}
