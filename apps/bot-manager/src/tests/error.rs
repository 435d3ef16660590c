// Unit tests for the app error type.

use crate::error::ManagerError;

use bot_core::error::{ConfigError, SupervisorError};

use common::ErrorLocation;

use std::panic::Location;

/// **VALUE**: Errors serialize to tagged JSON.
///
/// **WHY THIS MATTERS**: A UI reading errors from the control surface needs the
/// variant and message, not an opaque string.
///
/// **BUG THIS CATCHES**: Dropping `#[derive(Serialize)]` or adding a field that
/// cannot be serialized.
#[test]
fn given_manager_error_when_serialized_then_tagged_json() {
    // GIVEN
    let err = ManagerError::Credential {
        message: String::from("Test"),
        location: ErrorLocation::from(Location::caller()),
    };

    // WHEN
    let json = serde_json::to_string(&err).expect("serializable");

    // THEN
    assert!(json.contains("\"type\":\"Credential\""));
    assert!(json.contains("Test"));
}

/// **VALUE**: Core errors convert with their message and the conversion site.
#[test]
fn given_core_error_when_converted_then_message_kept() {
    // GIVEN
    let core = SupervisorError::NotRunning {
        message: "worker is stopped".to_string(),
        location: ErrorLocation::from(Location::caller()),
    };

    // WHEN
    let err = ManagerError::from(core);

    // THEN
    match err {
        ManagerError::Core { message, location } => {
            assert!(message.contains("worker is stopped"));
            assert!(location.file.ends_with("error.rs"));
        }
        other => panic!("expected Core, got {other:?}"),
    }
}

/// **VALUE**: `?` works on config results inside manager code.
#[test]
fn given_config_error_when_propagated_then_core_variant() {
    fn load() -> Result<(), ManagerError> {
        Err::<(), _>(ConfigError::ValidationError {
            location: ErrorLocation::from(Location::caller()),
            reason: "bad".to_string(),
        })?;
        Ok(())
    }

    assert!(matches!(load(), Err(ManagerError::Core { .. })));
}
