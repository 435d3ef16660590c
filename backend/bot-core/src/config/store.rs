//! Key-value persistence behind the credential store and runtime overrides.
//!
//! The file format is private to this module; callers only see `get`/`set`.

use crate::error::config::ConfigError;

use common::ErrorLocation;

use std::collections::BTreeMap;
use std::panic::Location;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, info};

/// String key-value storage.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, ConfigError>;

    fn set(&self, key: &str, value: &str) -> Result<(), ConfigError>;

    /// Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), ConfigError>;

    /// All entries whose key starts with `prefix`, in key order.
    fn entries(&self, prefix: &str) -> Result<Vec<(String, String)>, ConfigError>;
}

/// JSON object on disk, rewritten atomically on every change.
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }

        let contents =
            std::fs::read_to_string(&self.path).map_err(|e| ConfigError::ReadError {
                location: ErrorLocation::from(Location::caller()),
                path: self.path.clone(),
                source: e,
            })?;

        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        serde_json::from_str(&contents).map_err(|e| ConfigError::ParseError {
            location: ErrorLocation::from(Location::caller()),
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    fn write_map(&self, map: &BTreeMap<String, String>) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(map).map_err(|e| ConfigError::SerializeError {
            location: ErrorLocation::from(Location::caller()),
            reason: e.to_string(),
        })?;

        write_atomic(&self.path, json.as_bytes())
    }

    fn with_lock<T>(
        &self,
        f: impl FnOnce(&Self) -> Result<T, ConfigError>,
    ) -> Result<T, ConfigError> {
        // A poisoned lock only means another writer panicked; the file itself
        // is always replaced atomically.
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(self)
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>, ConfigError> {
        self.with_lock(|store| Ok(store.read_map()?.get(key).cloned()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        self.with_lock(|store| {
            let mut map = store.read_map()?;
            map.insert(key.to_string(), value.to_string());
            store.write_map(&map)?;
            debug!("Stored key '{key}' in {}", store.path.display());
            Ok(())
        })
    }

    fn remove(&self, key: &str) -> Result<(), ConfigError> {
        self.with_lock(|store| {
            let mut map = store.read_map()?;
            if map.remove(key).is_some() {
                store.write_map(&map)?;
                debug!("Removed key '{key}' from {}", store.path.display());
            }
            Ok(())
        })
    }

    fn entries(&self, prefix: &str) -> Result<Vec<(String, String)>, ConfigError> {
        self.with_lock(|store| {
            Ok(store
                .read_map()?
                .into_iter()
                .filter(|(key, _)| key.starts_with(prefix))
                .collect())
        })
    }
}

/// In-memory store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, ConfigError> {
        Ok(self.map().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        self.map().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), ConfigError> {
        self.map().remove(key);
        Ok(())
    }

    fn entries(&self, prefix: &str) -> Result<Vec<(String, String)>, ConfigError> {
        Ok(self
            .map()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

/// Write `contents` to `path` via a sibling temp file and rename.
///
/// The file is readable by the owner only, since it may hold ciphertext.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        std::fs::create_dir_all(dir).map_err(|e| ConfigError::WriteError {
            location: ErrorLocation::from(Location::caller()),
            path: dir.to_path_buf(),
            source: e,
        })?;
    }

    let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    std::fs::write(&temp_path, contents).map_err(|e| ConfigError::WriteError {
        location: ErrorLocation::from(Location::caller()),
        path: temp_path.clone(),
        source: e,
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        std::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600)).map_err(
            |e| ConfigError::WriteError {
                location: ErrorLocation::from(Location::caller()),
                path: temp_path.clone(),
                source: e,
            },
        )?;
    }

    std::fs::rename(&temp_path, path).map_err(|e| ConfigError::WriteError {
        location: ErrorLocation::from(Location::caller()),
        path: path.to_path_buf(),
        source: e,
    })?;

    info!("Wrote {}", path.display());
    Ok(())
}
