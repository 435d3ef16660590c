pub mod store;

pub use store::{JsonFileStore, KeyValueStore, MemoryStore};

use crate::error::config::ConfigError;

use common::ErrorLocation;

use std::collections::HashMap;
use std::panic::Location;
use std::path::Path;
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE_NAME: &str = "bot.toml";
const CONFIG_VERSION: u32 = 1;
const MIN_FRAME_LEN: usize = 64;

/// Category used for plain outbound messages.
pub const MESSAGE_CATEGORY: &str = "message";

// ============================================
// ENUMS WITH DEFAULTS
// ============================================

/// What `EventQueue::enqueue` does when the queue is at capacity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Suspend the producer until the consumer makes room.
    #[default]
    Block,
    DropOldest,
    DropNewest,
}

/// What `send_action` does with an action the limiter denies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DenialPolicy {
    /// Park the action in the bounded deferred queue.
    Defer,
    /// Fail the call with `RateLimited`.
    #[default]
    Reject,
}

// ============================================
// CONFIG STRUCTS
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    #[serde(default = "default_worker_binary")]
    pub worker_binary: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            max_restarts: default_max_restarts(),
            restart_delay_ms: default_restart_delay_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            worker_binary: default_worker_binary(),
        }
    }
}

impl SupervisorConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Silence on an open connection longer than this counts as a drop.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_deferred_capacity")]
    pub deferred_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            deferred_capacity: default_deferred_capacity(),
        }
    }
}

impl ConnectionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            overflow: OverflowPolicy::default(),
        }
    }
}

/// One token bucket plus what to do with denied actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    pub capacity: f64,
    pub refill_per_second: f64,
    #[serde(default)]
    pub policy: DenialPolicy,
}

impl BucketConfig {
    pub fn new(capacity: f64, refill_per_second: f64, policy: DenialPolicy) -> Self {
        Self {
            capacity,
            refill_per_second,
            policy,
        }
    }

    /// Conservative bucket for categories nobody configured.
    pub fn conservative() -> Self {
        Self::new(1.0, 0.2, DenialPolicy::Reject)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitsConfig {
    #[serde(default = "BucketConfig::conservative")]
    pub default: BucketConfig,
    #[serde(default = "default_categories")]
    pub categories: HashMap<String, BucketConfig>,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            default: BucketConfig::conservative(),
            categories: default_categories(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Frames buffered per direction before `send` suspends.
    #[serde(default = "default_ipc_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_ipc_buffer_capacity(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Websocket endpoint of the upstream bridge.
    pub url: Option<String>,
    /// Identity of the bot's own account; the only principal handlers act for.
    #[serde(default)]
    pub account_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_control_port")]
    pub port: u16,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            port: default_control_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub rate_limits: RateLimitsConfig,

    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    #[serde(default)]
    pub ipc: IpcConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub control: ControlConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            supervisor: SupervisorConfig::default(),
            connection: ConnectionConfig::default(),
            queue: QueueConfig::default(),
            rate_limits: RateLimitsConfig::default(),
            dispatcher: DispatcherConfig::default(),
            ipc: IpcConfig::default(),
            upstream: UpstreamConfig::default(),
            control: ControlConfig::default(),
        }
    }
}

// ============================================
// DEFAULT FUNCTIONS
// ============================================

fn default_version() -> u32 {
    CONFIG_VERSION
}
fn default_heartbeat_interval_ms() -> u64 {
    1_000
}
fn default_heartbeat_timeout_ms() -> u64 {
    5_000
}
fn default_max_restarts() -> u32 {
    5
}
fn default_restart_delay_ms() -> u64 {
    2_000
}
fn default_stop_timeout_ms() -> u64 {
    5_000
}
fn default_worker_binary() -> String {
    crate::WORKER_BINARY.to_string()
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    300_000
}
fn default_jitter_ms() -> u64 {
    500
}
fn default_handshake_timeout_ms() -> u64 {
    10_000
}
fn default_read_timeout_ms() -> u64 {
    60_000
}
fn default_deferred_capacity() -> usize {
    100
}
fn default_queue_capacity() -> usize {
    1_000
}
fn default_categories() -> HashMap<String, BucketConfig> {
    // 50 messages per 60 second window
    HashMap::from([(
        MESSAGE_CATEGORY.to_string(),
        BucketConfig::new(50.0, 50.0 / 60.0, DenialPolicy::Defer),
    )])
}
fn default_prefix() -> String {
    "!".to_string()
}
fn default_ipc_buffer_capacity() -> usize {
    64
}
fn default_max_frame_len() -> usize {
    1024 * 1024
}
fn default_control_port() -> u16 {
    crate::DEFAULT_CONTROL_PORT
}

// ============================================
// IMPLEMENTATION
// ============================================

impl BotConfig {
    /// Load config from a TOML file.
    ///
    /// A missing file yields defaults; a file that exists but does not parse
    /// or validate is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!("Config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path).map_err(|e| {
            warn!("Failed to read config file {}: {e}", path.display());
            ConfigError::ReadError {
                location: ErrorLocation::from(Location::caller()),
                path: path.to_path_buf(),
                source: e,
            }
        })?;

        let config = Self::from_toml(&contents).map_err(|e| match e {
            ConfigError::ParseError {
                location, reason, ..
            } => ConfigError::ParseError {
                location,
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })?;

        info!("Config loaded from {}", path.display());
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: BotConfig = toml::from_str(contents).map_err(|e| ConfigError::ParseError {
            location: ErrorLocation::from(Location::caller()),
            path: Default::default(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Save config as TOML using temp file + rename.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;

        let contents = toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError {
            location: ErrorLocation::from(Location::caller()),
            reason: e.to_string(),
        })?;

        store::write_atomic(path, contents.as_bytes())?;

        info!("Config saved to {}", path.display());
        Ok(())
    }

    /// Validate config values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if any value is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version == 0 || self.version > CONFIG_VERSION {
            return Err(invalid(format!(
                "Invalid version: {} (expected 1-{CONFIG_VERSION})",
                self.version
            )));
        }

        let supervisor = &self.supervisor;
        if supervisor.heartbeat_interval_ms == 0 {
            return Err(invalid("supervisor.heartbeat_interval_ms must be positive"));
        }
        if supervisor.heartbeat_timeout_ms <= supervisor.heartbeat_interval_ms {
            return Err(invalid(format!(
                "supervisor.heartbeat_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                supervisor.heartbeat_timeout_ms, supervisor.heartbeat_interval_ms
            )));
        }
        if supervisor.worker_binary.trim().is_empty() {
            return Err(invalid("supervisor.worker_binary cannot be empty"));
        }

        let connection = &self.connection;
        if connection.base_delay_ms == 0 {
            return Err(invalid("connection.base_delay_ms must be positive"));
        }
        if connection.max_delay_ms < connection.base_delay_ms {
            return Err(invalid(format!(
                "connection.max_delay_ms ({}) must be at least base_delay_ms ({})",
                connection.max_delay_ms, connection.base_delay_ms
            )));
        }
        // Keeps successive jittered delays non-decreasing below the cap.
        if connection.jitter_ms > connection.base_delay_ms {
            return Err(invalid(format!(
                "connection.jitter_ms ({}) cannot exceed base_delay_ms ({})",
                connection.jitter_ms, connection.base_delay_ms
            )));
        }
        if connection.deferred_capacity == 0 {
            return Err(invalid("connection.deferred_capacity must be positive"));
        }

        if self.queue.capacity == 0 {
            return Err(invalid("queue.capacity must be positive"));
        }

        validate_bucket("rate_limits.default", &self.rate_limits.default)?;
        for (name, bucket) in &self.rate_limits.categories {
            if name.trim().is_empty() {
                return Err(invalid("rate limit category name cannot be empty"));
            }
            validate_bucket(&format!("rate_limits.categories.{name}"), bucket)?;
        }

        let prefix = &self.dispatcher.prefix;
        if prefix.is_empty() || prefix.chars().any(char::is_whitespace) {
            return Err(invalid(format!(
                "dispatcher.prefix '{prefix}' must be non-empty without whitespace"
            )));
        }

        if self.ipc.buffer_capacity == 0 {
            return Err(invalid("ipc.buffer_capacity must be positive"));
        }
        if self.ipc.max_frame_len < MIN_FRAME_LEN {
            return Err(invalid(format!(
                "ipc.max_frame_len must be at least {MIN_FRAME_LEN}"
            )));
        }

        if let Some(ref url) = self.upstream.url
            && !url.starts_with("ws://")
            && !url.starts_with("wss://")
        {
            return Err(invalid(format!("Invalid upstream URL: {url}")));
        }

        Ok(())
    }

    /// Apply a runtime `key = value` update and re-validate.
    ///
    /// The config is left untouched when the key is unknown, the value does
    /// not parse, or the result fails validation.
    pub fn apply_update(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut updated = self.clone();
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["dispatcher", "prefix"] => updated.dispatcher.prefix = value.to_string(),
            ["supervisor", "max_restarts"] => {
                updated.supervisor.max_restarts = parse_value(key, value)?
            }
            ["supervisor", "heartbeat_timeout_ms"] => {
                updated.supervisor.heartbeat_timeout_ms = parse_value(key, value)?
            }
            ["rate_limits", category, field] => {
                let bucket = updated
                    .rate_limits
                    .categories
                    .entry(category.to_string())
                    .or_insert_with(|| self.rate_limits.default.clone());

                match *field {
                    "capacity" => bucket.capacity = parse_value(key, value)?,
                    "refill_per_second" => bucket.refill_per_second = parse_value(key, value)?,
                    "policy" => {
                        bucket.policy = match value {
                            "defer" => DenialPolicy::Defer,
                            "reject" => DenialPolicy::Reject,
                            other => {
                                return Err(ConfigError::InvalidValue {
                                    location: ErrorLocation::from(Location::caller()),
                                    key: key.to_string(),
                                    value: other.to_string(),
                                    reason: "expected 'defer' or 'reject'".to_string(),
                                });
                            }
                        }
                    }
                    _ => return Err(unknown_key(key)),
                }
            }
            _ => return Err(unknown_key(key)),
        }

        updated.validate()?;
        *self = updated;

        info!("Config updated: {key} = {value}");
        Ok(())
    }

    /// Bucket settings for a category, falling back to the conservative default.
    pub fn bucket_for(&self, category: &str) -> &BucketConfig {
        self.rate_limits
            .categories
            .get(category)
            .unwrap_or(&self.rate_limits.default)
    }
}

#[track_caller]
fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        location: ErrorLocation::from(Location::caller()),
        reason: reason.into(),
    }
}

#[track_caller]
fn unknown_key(key: &str) -> ConfigError {
    ConfigError::UnknownKey {
        location: ErrorLocation::from(Location::caller()),
        key: key.to_string(),
    }
}

#[track_caller]
fn parse_value<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
        location: ErrorLocation::from(Location::caller()),
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn validate_bucket(name: &str, bucket: &BucketConfig) -> Result<(), ConfigError> {
    if !(bucket.capacity.is_finite() && bucket.capacity >= 1.0) {
        return Err(invalid(format!(
            "{name}.capacity must be at least 1 (got {})",
            bucket.capacity
        )));
    }
    if !(bucket.refill_per_second.is_finite() && bucket.refill_per_second > 0.0) {
        return Err(invalid(format!(
            "{name}.refill_per_second must be positive (got {})",
            bucket.refill_per_second
        )));
    }
    Ok(())
}
