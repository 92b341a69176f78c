//! Per-segment state machine
//!
//! ```text
//! Allocated -> ReadSubmitted -> ReadDone -> WriteGated -> WriteSubmitted -> WriteDone -> Committed
//!                  ^    |                     ^    |          ^     |
//!                  +----+ retry               +----+ wait     +-----+ retry
//! ```
//!
//! Any state can fall to `Aborted`. Transitions are pure functions of the
//! current state and a completion's [`Disposition`]; the worker performs
//! the side effects the returned [`Outcome`] asks for.

use crate::scsi::sense::{Disposition, SenseCategory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Allocated,
    ReadSubmitted,
    ReadDone,
    WriteGated,
    WriteSubmitted,
    WriteDone,
    Committed,
    Aborted,
}

/// What the worker must do after a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Submit the identical command again
    Resubmit,
    /// Carry on; `zero_fill` replaces the read data with zeros
    Done { zero_fill: bool },
    /// Stop the copy with this classification
    Abort(SenseCategory),
}

impl SegmentState {
    /// A command for this segment was submitted
    pub fn submit(self) -> SegmentState {
        match self {
            SegmentState::Allocated | SegmentState::ReadSubmitted => SegmentState::ReadSubmitted,
            SegmentState::WriteGated | SegmentState::WriteSubmitted | SegmentState::ReadDone => {
                SegmentState::WriteSubmitted
            }
            other => other,
        }
    }

    /// Waiting for the write cursor to reach this segment
    pub fn gate(self) -> SegmentState {
        match self {
            SegmentState::ReadDone | SegmentState::WriteGated => SegmentState::WriteGated,
            other => other,
        }
    }

    /// Apply a completion's disposition
    ///
    /// Medium errors become zero-filled reads or ignored writes when
    /// `coe` is set.
    pub fn complete(self, disposition: Disposition, coe: bool) -> (SegmentState, Outcome) {
        let (retry_state, done_state, reading) = match self {
            SegmentState::ReadSubmitted => (SegmentState::ReadSubmitted, SegmentState::ReadDone, true),
            SegmentState::WriteSubmitted => (SegmentState::WriteSubmitted, SegmentState::WriteDone, false),
            _ => return (SegmentState::Aborted, Outcome::Abort(SenseCategory::Other)),
        };
        match disposition {
            Disposition::Proceed | Disposition::ProceedWithWarning => (done_state, Outcome::Done { zero_fill: false }),
            Disposition::Retry => (retry_state, Outcome::Resubmit),
            Disposition::MediumHard if coe => (done_state, Outcome::Done { zero_fill: reading }),
            Disposition::MediumHard => (SegmentState::Aborted, Outcome::Abort(SenseCategory::MediumHard)),
            Disposition::Fatal(cat) => (SegmentState::Aborted, Outcome::Abort(cat)),
        }
    }

    /// The write landed and the cursor moved past it
    pub fn commit(self) -> SegmentState {
        match self {
            SegmentState::WriteDone | SegmentState::WriteGated => SegmentState::Committed,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let s = SegmentState::Allocated.submit();
        assert_eq!(s, SegmentState::ReadSubmitted);
        let (s, o) = s.complete(Disposition::Proceed, false);
        assert_eq!((s, o), (SegmentState::ReadDone, Outcome::Done { zero_fill: false }));
        let s = s.gate();
        assert_eq!(s, SegmentState::WriteGated);
        assert_eq!(s.gate(), SegmentState::WriteGated);
        let s = s.submit();
        assert_eq!(s, SegmentState::WriteSubmitted);
        let (s, _) = s.complete(Disposition::Proceed, false);
        assert_eq!(s.commit(), SegmentState::Committed);
    }

    #[test]
    fn test_retry_self_loops() {
        let (s, o) = SegmentState::ReadSubmitted.complete(Disposition::Retry, false);
        assert_eq!((s, o), (SegmentState::ReadSubmitted, Outcome::Resubmit));
        let (s, o) = SegmentState::WriteSubmitted.complete(Disposition::Retry, true);
        assert_eq!((s, o), (SegmentState::WriteSubmitted, Outcome::Resubmit));
    }

    #[test]
    fn test_medium_error_policy() {
        let (s, o) = SegmentState::ReadSubmitted.complete(Disposition::MediumHard, true);
        assert_eq!((s, o), (SegmentState::ReadDone, Outcome::Done { zero_fill: true }));

        let (s, o) = SegmentState::WriteSubmitted.complete(Disposition::MediumHard, true);
        assert_eq!((s, o), (SegmentState::WriteDone, Outcome::Done { zero_fill: false }));

        let (s, o) = SegmentState::ReadSubmitted.complete(Disposition::MediumHard, false);
        assert_eq!((s, o), (SegmentState::Aborted, Outcome::Abort(SenseCategory::MediumHard)));
    }

    #[test]
    fn test_recovered_proceeds() {
        let (_, o) = SegmentState::ReadSubmitted.complete(Disposition::ProceedWithWarning, false);
        assert_eq!(o, Outcome::Done { zero_fill: false });
    }

    #[test]
    fn test_fatal_aborts() {
        let (s, o) = SegmentState::WriteSubmitted.complete(Disposition::Fatal(SenseCategory::NotReady), true);
        assert_eq!((s, o), (SegmentState::Aborted, Outcome::Abort(SenseCategory::NotReady)));
    }

    #[test]
    fn test_completion_outside_submitted_state() {
        let (s, o) = SegmentState::ReadDone.complete(Disposition::Proceed, false);
        assert_eq!((s, o), (SegmentState::Aborted, Outcome::Abort(SenseCategory::Other)));
    }
}
