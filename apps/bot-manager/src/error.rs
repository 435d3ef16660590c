use bot_core::error::{
    ConfigError, CoreError, DispatchError, IpcError, SupervisorError, TokenStoreError,
};

use common::ErrorLocation;

use std::panic::Location;

use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the manager and worker binaries.
///
/// Serializable so the control surface can hand them to a UI as JSON, with
/// the location kept for diagnostics.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum ManagerError {
    /// Startup or wiring failure in the binary itself
    #[error("Manager Error: {message} {location}")]
    Manager {
        message: String,
        location: ErrorLocation,
    },

    /// Error from bot-core (config, supervisor, IPC, ...)
    #[error("Core Error: {message} {location}")]
    Core {
        message: String,
        location: ErrorLocation,
    },

    /// Credential missing or unreadable
    #[error("Credential Error: {message} {location}")]
    Credential {
        message: String,
        location: ErrorLocation,
    },

    /// Logger could not be set up
    #[error("Logger Error: {message} {location}")]
    Logger {
        message: String,
        location: ErrorLocation,
    },
}

impl ManagerError {
    #[track_caller]
    pub fn manager(message: impl Into<String>) -> Self {
        ManagerError::Manager {
            message: message.into(),
            location: ErrorLocation::from(Location::caller()),
        }
    }

    #[track_caller]
    pub fn credential(message: impl Into<String>) -> Self {
        ManagerError::Credential {
            message: message.into(),
            location: ErrorLocation::from(Location::caller()),
        }
    }
}

impl From<CoreError> for ManagerError {
    #[track_caller]
    fn from(error: CoreError) -> Self {
        ManagerError::Core {
            message: error.to_string(),
            location: ErrorLocation::from(Location::caller()),
        }
    }
}

macro_rules! from_core_error {
    ($($error:ty),+ $(,)?) => {
        $(
            impl From<$error> for ManagerError {
                #[track_caller]
                fn from(error: $error) -> Self {
                    ManagerError::from(CoreError::from(error))
                }
            }
        )+
    };
}

from_core_error!(ConfigError, DispatchError, IpcError, SupervisorError, TokenStoreError);
