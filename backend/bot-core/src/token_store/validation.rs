//! Credential format validation.
//!
//! Runs before a credential is encrypted and stored, so obviously wrong values
//! (pasted placeholders, truncated copies) fail fast instead of at the first
//! upstream handshake.

use crate::error::token_store::{TokenFormatFailure, TokenStoreError};

use std::sync::LazyLock;

use regex::Regex;

pub const MIN_TOKEN_LEN: usize = 50;
pub const MAX_TOKEN_LEN: usize = 100;

static TOKEN_CHARS: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._\-]+$").ok());

static PLACEHOLDERS: &[(&str, &str)] = &[
    ("...", "ellipsis"),
    ("your-token", "your-token"),
    ("your_token", "your_token"),
    ("<your", "<your...>"),
    ("insert", "INSERT"),
    ("xxxx", "xxx"),
    ("placeholder", "placeholder"),
    ("example", "example"),
    ("dummy", "dummy"),
    ("changeme", "changeme"),
    ("replace", "replace"),
];

/// Check a credential before it is stored.
///
/// # Errors
///
/// [`TokenStoreError::Validation`] with the first rule the value breaks.
#[track_caller]
pub fn validate_token_format(token: &str) -> Result<(), TokenStoreError> {
    match check(token) {
        None => Ok(()),
        Some(reason) => Err(TokenStoreError::validation(reason)),
    }
}

fn check(token: &str) -> Option<TokenFormatFailure> {
    let trimmed = token.trim();

    if trimmed.is_empty() {
        return Some(TokenFormatFailure::Empty);
    }

    let actual = trimmed.chars().count();
    if actual < MIN_TOKEN_LEN {
        return Some(TokenFormatFailure::TooShort {
            min: MIN_TOKEN_LEN,
            actual,
        });
    }
    if actual > MAX_TOKEN_LEN {
        return Some(TokenFormatFailure::TooLong {
            max: MAX_TOKEN_LEN,
            actual,
        });
    }

    if let Some(pattern) = detect_placeholder(trimmed) {
        return Some(TokenFormatFailure::PlaceholderDetected { pattern });
    }

    let valid_chars = TOKEN_CHARS
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(trimmed));
    if !valid_chars || trimmed.len() != token.len() {
        return Some(TokenFormatFailure::InvalidCharacters);
    }

    None
}

fn detect_placeholder(token: &str) -> Option<&'static str> {
    let lower = token.to_lowercase();

    if let Some(&(_, name)) = PLACEHOLDERS
        .iter()
        .find(|(pattern, _)| lower.contains(pattern))
    {
        return Some(name);
    }

    let mut chars = token.chars();
    if let Some(first) = chars.next()
        && chars.all(|c| c == first)
    {
        return Some("repeated_char");
    }

    None
}
