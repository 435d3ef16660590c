use crate::ipc::{SequenceCheck, SequenceTracker};

/// **VALUE**: Consecutive numbers are accepted in order.
///
/// **BUG THIS CATCHES**: Tracker starting at 1 instead of 0 and rejecting the first frame.
#[test]
fn given_new_tracker_when_observing_consecutive_then_in_order() {
    // GIVEN: A fresh tracker
    let mut tracker = SequenceTracker::new();

    // WHEN: Observing 1, 2, 3
    let checks: Vec<_> = (1..=3).map(|seq| tracker.observe(seq)).collect();

    // THEN: All in order
    assert!(checks.iter().all(|c| *c == SequenceCheck::InOrder));
    assert_eq!(tracker.last(), 3);
}

/// **VALUE**: Replayed or reordered frames are rejected without moving the cursor.
///
/// **WHY THIS MATTERS**: A replayed `StopRequest` must not be acted on twice.
///
/// **BUG THIS CATCHES**: Accepting `seq <= last`, or rewinding `last` on a stale frame.
#[test]
fn given_seen_sequence_when_replayed_then_stale_and_cursor_kept() {
    // GIVEN: Frames up to 5 accepted
    let mut tracker = SequenceTracker::new();
    for seq in 1..=5 {
        tracker.observe(seq);
    }

    // WHEN: Seeing 5 again, then 2
    let replay = tracker.observe(5);
    let older = tracker.observe(2);

    // THEN: Both stale, cursor still at 5
    assert_eq!(replay, SequenceCheck::Stale { last: 5 });
    assert_eq!(older, SequenceCheck::Stale { last: 5 });
    assert_eq!(tracker.last(), 5);
}

/// **VALUE**: A forward jump is accepted and reports how many frames were skipped.
///
/// **WHY THIS MATTERS**: A frame dropped as malformed leaves a gap. The stream must keep
/// flowing while the gap is logged.
///
/// **BUG THIS CATCHES**: Treating gaps as fatal, which would wedge the link on one bad frame.
#[test]
fn given_gap_when_observing_then_accepted_with_missing_count() {
    // GIVEN: Frame 1 accepted
    let mut tracker = SequenceTracker::new();
    tracker.observe(1);

    // WHEN: Frame 4 arrives
    let check = tracker.observe(4);

    // THEN: Two missing, cursor moves to 4
    assert_eq!(check, SequenceCheck::Gap { missing: 2 });
    assert_eq!(tracker.observe(5), SequenceCheck::InOrder);
}
