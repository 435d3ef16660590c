//! Shared building blocks for the bot supervisor workspace.
//!
//! ## Architecture
//!
//! - **common** (this crate): error location tracking and secret handling
//! - **bot-core**: supervision, IPC, connection state machine, rate limiting
//! - **bot-manager**: application wiring (control process and worker binaries)

pub mod error;
pub mod redacted_token;

pub use error::error_location::ErrorLocation;
pub use error::redact_error::RedactError;
pub use redacted_token::RedactedToken;

#[cfg(test)]
mod tests;
