//! Where the binaries keep their files.

use bot_core::config::CONFIG_FILE_NAME;

use std::path::{Path, PathBuf};

const APP_DIR: &str = "bot-manager";

/// Overrides received over the control surface, replayed to new workers.
pub const OVERRIDES_FILE_NAME: &str = "overrides.json";

/// Sealed upstream credential.
pub const CREDENTIALS_FILE_NAME: &str = "credentials.json";

/// Per-run state such as the control token.
pub const SESSION_FILE_NAME: &str = "session.json";

const LOG_DIR_NAME: &str = "logs";

/// Resolved file locations for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub config_file: PathBuf,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl AppPaths {
    /// `config_file` and `data_dir` win over the platform defaults; the
    /// working directory is the last resort.
    pub fn resolve(config_file: Option<PathBuf>, data_dir: Option<PathBuf>) -> Self {
        let config_file = config_file.unwrap_or_else(|| {
            dirs::config_dir()
                .map(|dir| dir.join(APP_DIR))
                .unwrap_or_default()
                .join(CONFIG_FILE_NAME)
        });

        let data_dir = data_dir.unwrap_or_else(|| {
            dirs::data_dir()
                .map(|dir| dir.join(APP_DIR))
                .unwrap_or_else(|| PathBuf::from("."))
        });

        Self::in_dirs(config_file, data_dir)
    }

    pub fn in_dirs(config_file: PathBuf, data_dir: PathBuf) -> Self {
        let log_dir = data_dir.join(LOG_DIR_NAME);
        Self {
            config_file,
            data_dir,
            log_dir,
        }
    }

    pub fn overrides_file(&self) -> PathBuf {
        self.data_dir.join(OVERRIDES_FILE_NAME)
    }

    pub fn credentials_file(&self) -> PathBuf {
        self.data_dir.join(CREDENTIALS_FILE_NAME)
    }

    pub fn session_file(&self) -> PathBuf {
        self.data_dir.join(SESSION_FILE_NAME)
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }
}
