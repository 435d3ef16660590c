//! Per-connection authentication state for the control server.

use common::RedactedToken;

/// Tracks whether a control client has presented the expected token.
pub(crate) struct ControlSession {
    authenticated: bool,
    expected_token: RedactedToken,
}

impl ControlSession {
    pub(crate) fn new(token: RedactedToken) -> Self {
        Self {
            authenticated: false,
            expected_token: token,
        }
    }

    /// Compare in constant time; marks the session authenticated on match.
    pub(crate) fn validate_token(&mut self, token: &str) -> bool {
        if self.expected_token.matches(token) {
            self.authenticated = true;
        }
        self.authenticated
    }

    pub(crate) fn is_authenticated(&self) -> bool {
        self.authenticated
    }
}
