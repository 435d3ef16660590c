use common::ErrorLocation;

use std::panic::Location;

use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum QueueError {
    #[error("Queue Full Error: capacity {capacity} reached {location}")]
    QueueFull {
        capacity: usize,
        location: ErrorLocation,
    },

    #[error("Queue Closed Error: {message} {location}")]
    Closed {
        message: String,
        location: ErrorLocation,
    },
}

impl QueueError {
    #[track_caller]
    pub fn full(capacity: usize) -> Self {
        QueueError::QueueFull {
            capacity,
            location: ErrorLocation::from(Location::caller()),
        }
    }

    #[track_caller]
    pub fn closed(message: impl Into<String>) -> Self {
        QueueError::Closed {
            message: message.into(),
            location: ErrorLocation::from(Location::caller()),
        }
    }
}
