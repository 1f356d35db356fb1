use std::time::Duration;

use minstant::Instant;

/// Counters owned by one receive run; the loop is their only writer.
#[derive(Debug, Clone)]
pub struct RunStats {
    remaining: u64,
    empty_polls: u64,
    nonempty_polls: u64,
    discards: u64,
    unknown_events: u64,
    commits: u64,
    started: Option<Instant>,
    finished: Option<Instant>,
}

impl RunStats {
    #[must_use]
    pub const fn new(iterations: u64) -> Self {
        Self {
            remaining: iterations,
            empty_polls: 0,
            nonempty_polls: 0,
            discards: 0,
            unknown_events: 0,
            commits: 0,
            started: None,
            finished: None,
        }
    }

    #[inline]
    pub(crate) fn record_poll(&mut self, events: usize) {
        if events == 0 {
            self.empty_polls += 1;
        } else {
            self.nonempty_polls += 1;
        }
    }

    /// Counts one received packet; returns how many are still outstanding.
    #[inline]
    pub(crate) fn record_packet(&mut self) -> u64 {
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining
    }

    #[inline]
    pub(crate) fn record_discard(&mut self) {
        self.discards += 1;
    }

    #[inline]
    pub(crate) fn record_unknown(&mut self) {
        self.unknown_events += 1;
    }

    #[inline]
    pub(crate) fn record_commit(&mut self) {
        self.commits += 1;
    }

    pub(crate) fn start_clock(&mut self) {
        self.started.get_or_insert_with(Instant::now);
    }

    pub(crate) fn stop_clock(&mut self) {
        if self.started.is_some() {
            self.finished.get_or_insert_with(Instant::now);
        }
    }

    /// Packets still expected before the run target is met.
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.remaining
    }

    #[must_use]
    pub const fn empty_polls(&self) -> u64 {
        self.empty_polls
    }

    #[must_use]
    pub const fn nonempty_polls(&self) -> u64 {
        self.nonempty_polls
    }

    #[must_use]
    pub const fn polls(&self) -> u64 {
        self.empty_polls + self.nonempty_polls
    }

    #[must_use]
    pub const fn discards(&self) -> u64 {
        self.discards
    }

    #[must_use]
    pub const fn unknown_events(&self) -> u64 {
        self.unknown_events
    }

    /// Doorbells rung, the initial fill included.
    #[must_use]
    pub const fn commits(&self) -> u64 {
        self.commits
    }

    /// First packet to end of run; `None` until both happened.
    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        Some(self.finished?.duration_since(self.started?))
    }
}
