//! Error types for the credential store.
//!
//! Messages never include plaintext or derived key material.

use crate::error::config::ConfigError;

use common::ErrorLocation;

use std::panic::Location;

use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum TokenStoreError {
    #[error("Not Configured Error: no credential stored {location}")]
    NotConfigured { location: ErrorLocation },

    #[error("Crypto Error: {message} {location}")]
    Crypto {
        message: String,
        location: ErrorLocation,
    },

    /// Authentication tag mismatch: wrong passphrase or tampered record.
    #[error("Integrity Error: {message} {location}")]
    Integrity {
        message: String,
        location: ErrorLocation,
    },

    #[error("Record Error: {message} {location}")]
    Record {
        message: String,
        location: ErrorLocation,
    },

    #[error("Token Validation Error: {reason} {location}")]
    Validation {
        reason: TokenFormatFailure,
        location: ErrorLocation,
    },

    #[error(transparent)]
    Store(#[from] ConfigError),
}

/// Specific reasons a credential is rejected before it is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenFormatFailure {
    Empty,
    TooShort { min: usize, actual: usize },
    TooLong { max: usize, actual: usize },
    PlaceholderDetected { pattern: &'static str },
    InvalidCharacters,
}

impl std::fmt::Display for TokenFormatFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "token is empty"),
            Self::TooShort { min, actual } => {
                write!(f, "token too short ({actual} chars, minimum {min})")
            }
            Self::TooLong { max, actual } => {
                write!(f, "token too long ({actual} chars, maximum {max})")
            }
            Self::PlaceholderDetected { pattern } => {
                write!(f, "detected placeholder pattern '{pattern}'")
            }
            Self::InvalidCharacters => write!(f, "contains invalid characters"),
        }
    }
}

impl TokenStoreError {
    #[track_caller]
    pub fn not_configured() -> Self {
        TokenStoreError::NotConfigured {
            location: ErrorLocation::from(Location::caller()),
        }
    }

    #[track_caller]
    pub fn crypto(message: impl Into<String>) -> Self {
        TokenStoreError::Crypto {
            message: message.into(),
            location: ErrorLocation::from(Location::caller()),
        }
    }

    #[track_caller]
    pub fn integrity(message: impl Into<String>) -> Self {
        TokenStoreError::Integrity {
            message: message.into(),
            location: ErrorLocation::from(Location::caller()),
        }
    }

    #[track_caller]
    pub fn record(message: impl Into<String>) -> Self {
        TokenStoreError::Record {
            message: message.into(),
            location: ErrorLocation::from(Location::caller()),
        }
    }

    #[track_caller]
    pub fn validation(reason: TokenFormatFailure) -> Self {
        TokenStoreError::Validation {
            reason,
            location: ErrorLocation::from(Location::caller()),
        }
    }
}
