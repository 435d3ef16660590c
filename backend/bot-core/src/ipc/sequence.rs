/// Outcome of checking an incoming sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// Exactly the next expected number.
    InOrder,
    /// Ahead of the expected number; `missing` frames were skipped.
    Gap { missing: u64 },
    /// Not greater than the last accepted number; the frame is rejected.
    Stale { last: u64 },
}

/// Per-direction receive-side sequence check.
///
/// Accepted numbers are strictly increasing. A stream transport cannot
/// reorder, so anything at or below the last accepted number is a replay or
/// a sender bug and is rejected. A forward gap means a frame was lost to a
/// decode failure.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last: u64,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last accepted number, 0 before the first frame.
    pub fn last(&self) -> u64 {
        self.last
    }

    pub fn observe(&mut self, seq: u64) -> SequenceCheck {
        if seq <= self.last {
            return SequenceCheck::Stale { last: self.last };
        }

        let expected = self.last + 1;
        self.last = seq;

        if seq == expected {
            SequenceCheck::InOrder
        } else {
            SequenceCheck::Gap {
                missing: seq - expected,
            }
        }
    }
}
