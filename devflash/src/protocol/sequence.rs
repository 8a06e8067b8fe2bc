//! Per-session response sequence tracking.

use crate::error::{Error, Result};

/// Expected sequence number of the next response on a session.
///
/// The counter is 8 bits wide and wraps. It advances only when a response is
/// accepted, so a stale or duplicated frame leaves it untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceTracker {
    expected: u8,
}

impl SequenceTracker {
    /// Start tracking from `initial`.
    pub fn new(initial: u8) -> Self {
        Self { expected: initial }
    }

    /// Sequence number the next response must carry.
    pub fn expected(&self) -> u8 {
        self.expected
    }

    /// Move to the next sequence number, wrapping at 256.
    pub fn advance(&mut self) {
        self.expected = self.expected.wrapping_add(1);
    }

    /// Accept `actual` if it matches, advancing the tracker.
    pub fn accept(&mut self, actual: u8) -> Result<()> {
        if actual != self.expected {
            return Err(Error::SequenceMismatch {
                expected: self.expected,
                actual,
            });
        }
        self.advance();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_starts_at_zero() {
        assert_eq!(SequenceTracker::default().expected(), 0);
    }

    #[test]
    fn test_wraps_at_256() {
        let mut tracker = SequenceTracker::new(0xFF);
        tracker.advance();
        assert_eq!(tracker.expected(), 0x00);
    }

    #[test]
    fn test_accept_matching_advances() {
        let mut tracker = SequenceTracker::new(4);
        tracker.accept(4).unwrap();
        assert_eq!(tracker.expected(), 5);
    }

    #[test]
    fn test_accept_stale_leaves_tracker_untouched() {
        let mut tracker = SequenceTracker::new(4);
        let err = tracker.accept(3).unwrap_err();
        assert!(matches!(
            err,
            Error::SequenceMismatch {
                expected: 4,
                actual: 3
            }
        ));
        assert_eq!(tracker.expected(), 4);
    }

    proptest! {
        #[test]
        fn prop_advance_is_modular(start in any::<u8>(), k in 0usize..1024) {
            let mut tracker = SequenceTracker::new(start);
            for _ in 0..k {
                tracker.advance();
            }
            prop_assert_eq!(usize::from(tracker.expected()), (usize::from(start) + k) % 256);
        }
    }
}
