use crate::ErrorLocation;

use thiserror::Error as ThisError;

/// Raised when something tries to move a secret out of its redacted wrapper
/// through a path that would leak it (serialization).
#[derive(Debug, ThisError)]
pub enum RedactError {
    #[error("Serialization Error: {message} {location}")]
    Serialization {
        message: String,
        location: ErrorLocation,
    },
}
