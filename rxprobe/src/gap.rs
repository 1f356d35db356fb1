//! Loss tracking over the received sequence stream.
//!
//! The stream is expected to be the contiguous range `[0, N)`. Every hole is
//! recorded as a closed [`Gap`] the moment the first value past it arrives,
//! so a stream that resumes after `0..5` at `10` yields exactly `[5, 9]`.
//! A hole that is still open when the run stops is not a gap of its own; see
//! [`GapTracker::trailing_gap`].

use std::fmt;

/// Closed interval `[start, end]` of sequence numbers never observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub start: u64,
    pub end: u64,
}

#[allow(clippy::len_without_is_empty)]
impl Gap {
    /// Number of missing sequence numbers; never zero.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, seq: u64) -> bool {
        self.start <= seq && seq <= self.end
    }
}

impl fmt::Display for Gap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// What one observation did to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// The value that was expected next.
    InOrder,
    /// Values were skipped; the hole is now a closed gap.
    GapClosed(Gap),
    /// A value below the next expected one (duplicate or reordered).
    OutOfOrder,
}

/// Gap detection state machine.
///
/// Retains the first `cap` gaps in detail, oldest first; every gap after
/// that is counted but not stored. The detail list is allocated up front so
/// [`observe`](Self::observe) never allocates.
#[derive(Debug, Clone)]
pub struct GapTracker {
    expected: u64,
    gaps: Vec<Gap>,
    cap: usize,
    total_gaps: u64,
    lost: u64,
    received: u64,
    out_of_order: u64,
}

impl GapTracker {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            expected: 0,
            gaps: Vec::with_capacity(cap),
            cap,
            total_gaps: 0,
            lost: 0,
            received: 0,
            out_of_order: 0,
        }
    }

    /// Feeds one observed sequence number.
    #[inline]
    pub fn observe(&mut self, seq: u64) -> Observation {
        self.received += 1;
        if seq == self.expected {
            self.expected = seq + 1;
            return Observation::InOrder;
        }
        if seq < self.expected {
            self.out_of_order += 1;
            return Observation::OutOfOrder;
        }

        let gap = Gap {
            start: self.expected,
            end: seq - 1,
        };
        self.total_gaps += 1;
        self.lost += gap.len();
        if self.gaps.len() < self.cap {
            self.gaps.push(gap);
        }
        self.expected = seq + 1;
        Observation::GapClosed(gap)
    }

    /// Next sequence number that would continue the stream.
    #[must_use]
    pub const fn expected(&self) -> u64 {
        self.expected
    }

    /// Retained gaps, oldest first.
    #[must_use]
    pub fn gaps(&self) -> &[Gap] {
        &self.gaps
    }

    /// Every closed gap, retained or not.
    #[must_use]
    pub const fn total_gaps(&self) -> u64 {
        self.total_gaps
    }

    /// Closed gaps past the retention cap.
    #[must_use]
    pub fn unreported(&self) -> u64 {
        self.total_gaps - self.gaps.len() as u64
    }

    /// Sequence numbers inside closed gaps.
    #[must_use]
    pub const fn lost(&self) -> u64 {
        self.lost
    }

    #[must_use]
    pub const fn received(&self) -> u64 {
        self.received
    }

    #[must_use]
    pub const fn out_of_order(&self) -> u64 {
        self.out_of_order
    }

    /// The unobserved tail `[expected, target - 1]` of a stream that should
    /// have reached `target` values, if any.
    ///
    /// Reported apart from the closed gaps: nothing after it arrived, so it
    /// is unknown whether those packets were lost or never sent.
    #[must_use]
    pub const fn trailing_gap(&self, target: u64) -> Option<Gap> {
        if self.expected < target {
            Some(Gap {
                start: self.expected,
                end: target - 1,
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn feed(tracker: &mut GapTracker, seqs: impl IntoIterator<Item = u64>) {
        for seq in seqs {
            tracker.observe(seq);
        }
    }

    #[test]
    fn contiguous_run_has_no_gaps() {
        let mut tracker = GapTracker::new(20);
        feed(&mut tracker, 0..1000);
        assert_eq!(tracker.total_gaps(), 0);
        assert!(tracker.gaps().is_empty());
        assert_eq!(tracker.expected(), 1000);
        assert_eq!(tracker.trailing_gap(1000), None);
    }

    #[test]
    fn skipped_run_closes_when_stream_resumes() {
        let mut tracker = GapTracker::new(20);
        feed(&mut tracker, 0..5);
        assert_eq!(
            tracker.observe(10),
            Observation::GapClosed(Gap { start: 5, end: 9 })
        );
        feed(&mut tracker, 11..20);
        assert_eq!(tracker.gaps(), &[Gap { start: 5, end: 9 }]);
        assert_eq!(tracker.lost(), 5);
    }

    #[test]
    fn leading_loss_is_a_gap_from_zero() {
        let mut tracker = GapTracker::new(20);
        tracker.observe(3);
        assert_eq!(tracker.gaps(), &[Gap { start: 0, end: 2 }]);
    }

    #[test]
    fn retention_keeps_oldest_and_counts_the_rest() {
        let mut tracker = GapTracker::new(3);
        // Every other value: gaps [1,1], [3,3], [5,5], ...
        feed(&mut tracker, (0..20).step_by(2));
        assert_eq!(tracker.total_gaps(), 9);
        assert_eq!(tracker.unreported(), 6);
        assert_eq!(
            tracker.gaps(),
            &[
                Gap { start: 1, end: 1 },
                Gap { start: 3, end: 3 },
                Gap { start: 5, end: 5 },
            ]
        );
        assert_eq!(tracker.lost(), 9);
    }

    #[test]
    fn value_below_expected_is_out_of_order() {
        let mut tracker = GapTracker::new(20);
        feed(&mut tracker, 0..10);
        assert_eq!(tracker.observe(4), Observation::OutOfOrder);
        assert_eq!(tracker.expected(), 10);
        assert_eq!(tracker.out_of_order(), 1);
        assert_eq!(tracker.observe(10), Observation::InOrder);
        assert_eq!(tracker.total_gaps(), 0);
    }

    #[test]
    fn trailing_gap_covers_unobserved_tail() {
        let mut tracker = GapTracker::new(20);
        feed(&mut tracker, 0..7);
        assert_eq!(tracker.trailing_gap(10), Some(Gap { start: 7, end: 9 }));
        assert_eq!(tracker.total_gaps(), 0);
    }

    proptest! {
        #[test]
        fn gaps_complement_received_values(values in proptest::collection::btree_set(0u64..2_000, 1..300)) {
            let mut tracker = GapTracker::new(2_000);
            for &seq in &values {
                prop_assert_ne!(tracker.observe(seq), Observation::OutOfOrder);
            }

            let gaps = tracker.gaps();
            for pair in gaps.windows(2) {
                prop_assert!(pair[0].end < pair[1].start, "{} then {}", pair[0], pair[1]);
            }

            let max = *values.last().unwrap();
            let mut missing = BTreeSet::new();
            for gap in gaps {
                prop_assert!(gap.start <= gap.end);
                missing.extend(gap.start..=gap.end);
            }
            prop_assert!(missing.is_disjoint(&values));
            prop_assert_eq!(missing.len() + values.len(), (max + 1) as usize);
            prop_assert_eq!(tracker.lost(), missing.len() as u64);
        }

        #[test]
        fn retention_never_exceeds_cap(values in proptest::collection::btree_set(0u64..500, 1..200), cap in 0usize..8) {
            let mut tracker = GapTracker::new(cap);
            for &seq in &values {
                tracker.observe(seq);
            }
            prop_assert!(tracker.gaps().len() <= cap);
            prop_assert_eq!(tracker.gaps().len() as u64 + tracker.unreported(), tracker.total_gaps());
        }
    }
}
