use crate::error::config::ConfigError;
use crate::error::ipc::IpcError;

use common::ErrorLocation;

use std::panic::Location;

use serde::de::StdError;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum SupervisorError {
    #[error("Already Running Error: worker is {state} {location}")]
    AlreadyRunning {
        state: String,
        location: ErrorLocation,
    },

    #[error("Not Running Error: {message} {location}")]
    NotRunning {
        message: String,
        location: ErrorLocation,
    },

    #[error("Spawn Error: {message} {location}")]
    Spawn {
        message: String,
        location: ErrorLocation,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// Restart budget exhausted; only an operator `start()` clears it.
    #[error("Worker Failed Error: {message} {location}")]
    Failed {
        message: String,
        location: ErrorLocation,
    },

    #[error("Terminate Error: {message} {location}")]
    Terminate {
        message: String,
        location: ErrorLocation,
    },

    #[error("Supervisor Actor Error: {message} {location}")]
    ActorGone {
        message: String,
        location: ErrorLocation,
    },

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SupervisorError {
    #[track_caller]
    pub fn already_running(state: impl Into<String>) -> Self {
        SupervisorError::AlreadyRunning {
            state: state.into(),
            location: ErrorLocation::from(Location::caller()),
        }
    }

    #[track_caller]
    pub fn not_running(message: impl Into<String>) -> Self {
        SupervisorError::NotRunning {
            message: message.into(),
            location: ErrorLocation::from(Location::caller()),
        }
    }

    #[track_caller]
    pub fn actor_gone(message: impl Into<String>) -> Self {
        SupervisorError::ActorGone {
            message: message.into(),
            location: ErrorLocation::from(Location::caller()),
        }
    }

    #[track_caller]
    pub fn failed(message: impl Into<String>) -> Self {
        SupervisorError::Failed {
            message: message.into(),
            location: ErrorLocation::from(Location::caller()),
        }
    }

    #[track_caller]
    pub fn spawn(message: impl Into<String>, source: impl StdError + Send + Sync + 'static) -> Self {
        SupervisorError::Spawn {
            message: message.into(),
            location: ErrorLocation::from(Location::caller()),
            source: Box::new(source),
        }
    }
}
