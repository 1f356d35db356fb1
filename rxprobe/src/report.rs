//! End-of-run summary.
//!
//! [`Report`] is an owned snapshot of a finished session; its `Display`
//! impl renders the console report:
//!
//! ```text
//! receiver finished with errors, 37 packets lost (3.700%)
//! Gaps:
//! -5- +41+ -2- ...
//! 93% receiver polls returned no data
//! packet rate: 1.4 Mpps
//! ```

use std::fmt;
use std::time::Duration;

use crate::config::ReceiverConfig;
use crate::gap::{Gap, GapTracker};
use crate::session::{Outcome, RunStats};

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub outcome: Outcome,
    pub iterations: u64,
    pub received: u64,
    /// Packets still outstanding when the run ended.
    pub remaining: u64,
    /// Retained gaps, oldest first.
    pub gaps: Vec<Gap>,
    pub total_gaps: u64,
    /// Unobserved tail of a run that ended before the final sequence number.
    pub trailing: Option<Gap>,
    pub out_of_order: u64,
    pub empty_polls: u64,
    pub nonempty_polls: u64,
    pub discards: u64,
    pub unknown_events: u64,
    /// First packet to end of run.
    pub elapsed: Option<Duration>,
}

impl Report {
    #[must_use]
    pub fn new(
        outcome: Outcome,
        config: &ReceiverConfig,
        tracker: &GapTracker,
        stats: &RunStats,
    ) -> Self {
        Self {
            outcome,
            iterations: config.iterations,
            received: tracker.received(),
            remaining: stats.remaining(),
            gaps: tracker.gaps().to_vec(),
            total_gaps: tracker.total_gaps(),
            trailing: tracker.trailing_gap(config.iterations),
            out_of_order: tracker.out_of_order(),
            empty_polls: stats.empty_polls(),
            nonempty_polls: stats.nonempty_polls(),
            discards: stats.discards(),
            unknown_events: stats.unknown_events(),
            elapsed: stats.elapsed(),
        }
    }

    /// Outstanding packets as a percentage of the run.
    #[must_use]
    pub fn loss_percent(&self) -> f64 {
        if self.iterations == 0 {
            return 0.0;
        }
        self.remaining as f64 * 100.0 / self.iterations as f64
    }

    /// Share of polls that returned no events.
    #[must_use]
    pub fn empty_poll_percent(&self) -> f64 {
        let polls = self.empty_polls + self.nonempty_polls;
        if polls == 0 {
            return 0.0;
        }
        self.empty_polls as f64 * 100.0 / polls as f64
    }

    /// Received packets per second over the measured span.
    #[must_use]
    pub fn packets_per_sec(&self) -> Option<f64> {
        let secs = self.elapsed?.as_secs_f64();
        (secs > 0.0).then(|| self.received as f64 / secs)
    }

    /// Closed gaps beyond the retained ones.
    #[must_use]
    pub fn unreported_gaps(&self) -> u64 {
        self.total_gaps - self.gaps.len() as u64
    }

    fn write_gaps(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Gaps:")?;
        let mut prev: Option<&Gap> = None;
        for gap in &self.gaps {
            if let Some(prev) = prev {
                // Distance from the end of the previous gap.
                write!(f, "+{}+ ", gap.start - prev.end)?;
            }
            write!(f, "-{}- ", gap.len())?;
            prev = Some(gap);
        }
        writeln!(f)?;
        if self.unreported_gaps() > 0 {
            writeln!(f, "{} more gaps not shown", self.unreported_gaps())?;
        }
        Ok(())
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.outcome {
            Outcome::AllReceived => writeln!(f, "all packets received")?,
            Outcome::Lossy => {
                writeln!(
                    f,
                    "receiver finished with errors, {} packets lost ({:.3}%)",
                    self.remaining,
                    self.loss_percent()
                )?;
                self.write_gaps(f)?;
            }
            Outcome::Interrupted | Outcome::Terminated => {
                writeln!(
                    f,
                    "receiver stopped early, {} packets outstanding ({:.3}%)",
                    self.remaining,
                    self.loss_percent()
                )?;
                if self.total_gaps > 0 {
                    self.write_gaps(f)?;
                }
            }
        }

        if self.outcome != Outcome::AllReceived {
            if let Some(tail) = self.trailing {
                writeln!(f, "unterminated gap {tail}: {} packets never seen", tail.len())?;
            }
        }
        if self.out_of_order > 0 {
            writeln!(f, "{} packets arrived out of order", self.out_of_order)?;
        }
        if self.discards > 0 {
            writeln!(f, "{} receives discarded by the NIC", self.discards)?;
        }
        if self.unknown_events > 0 {
            writeln!(f, "{} unexpected events ignored", self.unknown_events)?;
        }
        writeln!(f, "{:.0}% receiver polls returned no data", self.empty_poll_percent())?;
        match self.packets_per_sec() {
            Some(pps) => write!(f, "packet rate: {:.1} Mpps", pps / 1e6),
            None => write!(f, "packet rate: n/a"),
        }
    }
}
