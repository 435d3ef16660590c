use crate::RedactedToken;

/// **VALUE**: Verifies that a token never shows its value through Debug or Display.
///
/// **WHY THIS MATTERS**: Credentials flow through structs that are logged with `{:?}`.
///
/// **BUG THIS CATCHES**: Would catch a derived Debug sneaking back in.
#[test]
fn given_token_when_formatted_then_value_is_redacted() {
    // GIVEN
    let token = RedactedToken::new("super-secret-value".to_string());

    // WHEN
    let debug = format!("{token:?}");
    let display = format!("{token}");

    // THEN
    assert!(!debug.contains("super-secret-value"));
    assert!(!display.contains("super-secret-value"));
    assert_eq!(token.len(), 18);
}

/// **VALUE**: Verifies that serializing a token fails instead of writing it out.
///
/// **WHY THIS MATTERS**: Status snapshots are serialized to JSON; a token embedded in
/// one must never reach disk or the wire.
///
/// **BUG THIS CATCHES**: Would catch a Serialize impl that forwards the inner string.
#[test]
fn given_token_when_serialized_then_returns_error() {
    // GIVEN
    let token = RedactedToken::new("super-secret-value".to_string());

    // WHEN
    let result = serde_json::to_string(&token);

    // THEN
    assert!(result.is_err());
}

#[test]
fn given_matching_and_mismatching_candidates_when_matches_then_compares_exactly() {
    let token = RedactedToken::new("abc123".to_string());

    assert!(token.matches("abc123"));
    assert!(!token.matches("abc124"));
    assert!(!token.matches("abc12"));
}

#[test]
fn given_invalid_utf8_when_from_utf8_then_returns_none() {
    assert!(RedactedToken::from_utf8(vec![0xff, 0xfe]).is_none());
    assert_eq!(
        RedactedToken::from_utf8(b"ok".to_vec()).map(|t| t.len()),
        Some(2)
    );
}
