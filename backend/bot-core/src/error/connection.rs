use crate::error::queue::QueueError;
use crate::error::rate_limit::RateLimitError;
use crate::error::token_store::TokenStoreError;

use common::ErrorLocation;

use std::panic::Location;
use std::time::Duration;

use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum ConnectionError {
    #[error("Not Connected Error: {message} {location}")]
    NotConnected {
        message: String,
        location: ErrorLocation,
    },

    /// Action denied by the limiter and its category rejects instead of deferring.
    #[error("Rate Limited Error: category '{category}' retry after {retry_after:?} {location}")]
    RateLimited {
        category: String,
        retry_after: Duration,
        location: ErrorLocation,
    },

    /// Deferred-action queue is at its bound.
    #[error("Deferred Queue Full Error: {capacity} actions pending {location}")]
    QueueFull {
        capacity: usize,
        location: ErrorLocation,
    },

    /// Connection is in Fatal and needs operator action.
    #[error("Connection Fatal Error: {reason} {location}")]
    Fatal {
        reason: String,
        location: ErrorLocation,
    },

    #[error("Upstream Error: {message} {location}")]
    Upstream {
        message: String,
        location: ErrorLocation,
    },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error(transparent)]
    TokenStore(#[from] TokenStoreError),
}

impl ConnectionError {
    #[track_caller]
    pub fn not_connected(message: impl Into<String>) -> Self {
        ConnectionError::NotConnected {
            message: message.into(),
            location: ErrorLocation::from(Location::caller()),
        }
    }

    #[track_caller]
    pub fn rate_limited(category: impl Into<String>, retry_after: Duration) -> Self {
        ConnectionError::RateLimited {
            category: category.into(),
            retry_after,
            location: ErrorLocation::from(Location::caller()),
        }
    }

    #[track_caller]
    pub fn fatal(reason: impl Into<String>) -> Self {
        ConnectionError::Fatal {
            reason: reason.into(),
            location: ErrorLocation::from(Location::caller()),
        }
    }

    #[track_caller]
    pub fn queue_full(capacity: usize) -> Self {
        ConnectionError::QueueFull {
            capacity,
            location: ErrorLocation::from(Location::caller()),
        }
    }

    #[track_caller]
    pub fn upstream(message: impl Into<String>) -> Self {
        ConnectionError::Upstream {
            message: message.into(),
            location: ErrorLocation::from(Location::caller()),
        }
    }

    /// Transient failures are retried by backoff or the limiter and never
    /// surfaced as hard failures.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectionError::NotConnected { .. }
                | ConnectionError::RateLimited { .. }
                | ConnectionError::Upstream { .. }
        )
    }
}
