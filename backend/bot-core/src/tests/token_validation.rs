use crate::error::token_store::{TokenFormatFailure, TokenStoreError};
use crate::token_store::validate_token_format;
use crate::token_store::validation::{MAX_TOKEN_LEN, MIN_TOKEN_LEN};

const VALID: &str = "MTA4NzY1NDMyMTA5ODc2NTQz.GhJkLm.aB3dE5fG7hI9jK1lM3nO5pQ7rS9tU1vW3xY5z";

fn failure(token: &str) -> TokenFormatFailure {
    match validate_token_format(token) {
        Err(TokenStoreError::Validation { reason, .. }) => reason,
        other => panic!("expected Validation error for {token:?}, got {other:?}"),
    }
}

/// **VALUE**: A realistic credential passes.
///
/// **BUG THIS CATCHES**: Character class missing `.`, `-` or `_`, which real tokens contain.
#[test]
fn given_realistic_token_when_validated_then_ok() {
    assert!(VALID.len() >= MIN_TOKEN_LEN && VALID.len() <= MAX_TOKEN_LEN);
    assert!(validate_token_format(VALID).is_ok());
}

/// **VALUE**: Empty and whitespace-only input is reported as empty, not too short.
///
/// **WHY THIS MATTERS**: The operator sees the reason. "Empty" points at a paste that
/// did not happen; "too short" sends them looking at the wrong thing.
#[test]
fn given_blank_input_when_validated_then_empty() {
    assert_eq!(failure(""), TokenFormatFailure::Empty);
    assert_eq!(failure("   \n"), TokenFormatFailure::Empty);
}

/// **VALUE**: Length bounds are enforced on both sides.
///
/// **BUG THIS CATCHES**: Truncated copies being stored and failing only at connect time.
#[test]
fn given_out_of_range_length_when_validated_then_too_short_or_too_long() {
    // GIVEN
    let short = "a1b2c3";
    let long = "a1".repeat(MAX_TOKEN_LEN);

    // WHEN/THEN
    assert_eq!(
        failure(short),
        TokenFormatFailure::TooShort {
            min: MIN_TOKEN_LEN,
            actual: short.len()
        }
    );
    assert_eq!(
        failure(&long),
        TokenFormatFailure::TooLong {
            max: MAX_TOKEN_LEN,
            actual: long.len()
        }
    );
}

/// **VALUE**: Placeholder text from docs and templates is refused.
///
/// **WHY THIS MATTERS**: Storing "your-token-here" encrypts garbage and leads to a
/// fatal auth rejection that looks like a revoked credential.
///
/// **BUG THIS CATCHES**: Case-sensitive placeholder matching.
#[test]
fn given_placeholder_when_validated_then_placeholder_detected() {
    // GIVEN: Long enough to pass the length check
    let padded = |text: &str| format!("{text}{}", "a1".repeat(30));

    // WHEN/THEN
    assert!(matches!(
        failure(&padded("YOUR_TOKEN")),
        TokenFormatFailure::PlaceholderDetected { .. }
    ));
    assert!(matches!(
        failure(&padded("changeme")),
        TokenFormatFailure::PlaceholderDetected { .. }
    ));
    assert_eq!(
        failure(&"z".repeat(60)),
        TokenFormatFailure::PlaceholderDetected {
            pattern: "repeated_char"
        }
    );
}

/// **VALUE**: Characters outside the token alphabet are rejected, including surrounding
/// whitespace.
///
/// **BUG THIS CATCHES**: Storing a token with a trailing newline from a paste, which the
/// upstream then rejects.
#[test]
fn given_bad_characters_when_validated_then_invalid_characters() {
    assert_eq!(failure(&format!("{VALID}\n")), TokenFormatFailure::InvalidCharacters);
    assert_eq!(
        failure(&VALID.replace('.', "/")),
        TokenFormatFailure::InvalidCharacters
    );
}
