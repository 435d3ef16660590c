use crate::ErrorLocation;

use std::panic::Location;

/// **VALUE**: Verifies that `ErrorLocation::from()` captures file, line, and column.
///
/// **WHY THIS MATTERS**: Every error in the workspace carries an ErrorLocation. If it
/// records the wrong site, supervisor and IPC failures become impossible to trace.
///
/// **BUG THIS CATCHES**: Would catch if `Location::caller()` stops being propagated
/// or the line capture breaks.
#[test]
#[track_caller]
fn given_location_caller_when_error_location_created_then_captures_file_line_column() {
    // GIVEN / WHEN: Capturing the current caller location
    let location = ErrorLocation::from(Location::caller());

    // THEN: File, line and column are populated
    assert!(location.file.contains("error_location.rs"));
    assert!(location.line > 0);
    assert!(location.column > 0);
}

/// **VALUE**: Verifies the `[file:line:column]` Display format.
///
/// **WHY THIS MATTERS**: Error messages end with this suffix; log scraping relies on it.
///
/// **BUG THIS CATCHES**: Would catch a Display change that drops brackets or fields.
#[test]
fn given_error_location_when_formatted_then_produces_bracketed_format() {
    // GIVEN
    let location = ErrorLocation::caller();

    // WHEN
    let formatted = location.to_string();

    // THEN
    assert!(formatted.starts_with('['));
    assert!(formatted.ends_with(']'));
    assert!(formatted.contains(&location.line.to_string()));
    assert_eq!(formatted.matches(':').count(), 2);
}

/// **VALUE**: Verifies that `#[track_caller]` helpers report their call site.
///
/// **WHY THIS MATTERS**: Error constructors across bot-core rely on this propagation.
///
/// **BUG THIS CATCHES**: Would catch a missing `#[track_caller]` on `ErrorLocation::caller()`,
/// which would make every error point at this crate.
#[test]
fn given_multiple_call_sites_when_capturing_location_then_each_has_unique_line() {
    // GIVEN
    #[track_caller]
    fn capture_location() -> ErrorLocation {
        ErrorLocation::caller()
    }

    // WHEN
    let first = capture_location();
    let second = capture_location();

    // THEN
    assert_eq!(first.file, second.file);
    assert_eq!(first.line + 1, second.line);
}

#[test]
fn given_nested_path_when_file_name_then_returns_last_component() {
    let location = ErrorLocation {
        file: "backend/bot-core/src/ipc/channel.rs",
        line: 1,
        column: 1,
    };

    assert_eq!(location.file_name(), "channel.rs");
}
