use common::ErrorLocation;

use std::panic::Location;

use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum DispatchError {
    /// Registration asked for a permission wider than the bot's own account.
    #[error("Permission Error: handler '{handler}' requires {permission} {location}")]
    PermissionDenied {
        handler: String,
        permission: String,
        location: ErrorLocation,
    },

    /// A command with this name is already registered. Aliases shared
    /// between commands are not duplicates.
    #[error("Duplicate Trigger Error: '{trigger}' already bound to '{handler}' {location}")]
    DuplicateTrigger {
        trigger: String,
        handler: String,
        location: ErrorLocation,
    },

    #[error("Unknown Command Error: '{name}' {location}")]
    UnknownCommand {
        name: String,
        location: ErrorLocation,
    },
}

impl DispatchError {
    #[track_caller]
    pub fn unknown_command(name: impl Into<String>) -> Self {
        DispatchError::UnknownCommand {
            name: name.into(),
            location: ErrorLocation::from(Location::caller()),
        }
    }
}

/// Failure returned by a command handler.
///
/// Logged by the dispatcher and never propagated past it.
#[derive(Debug, ThisError)]
pub enum HandlerError {
    #[error("Handler Error: {message} {location}")]
    Failed {
        message: String,
        location: ErrorLocation,
    },

    #[error("Handler Panic Error: {message} {location}")]
    Panicked {
        message: String,
        location: ErrorLocation,
    },

    #[error(transparent)]
    Connection(#[from] crate::error::connection::ConnectionError),
}

impl HandlerError {
    #[track_caller]
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed {
            message: message.into(),
            location: ErrorLocation::from(Location::caller()),
        }
    }

    #[track_caller]
    pub fn panicked(message: impl Into<String>) -> Self {
        HandlerError::Panicked {
            message: message.into(),
            location: ErrorLocation::from(Location::caller()),
        }
    }
}
