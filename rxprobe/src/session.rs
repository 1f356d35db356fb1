//! The receive loop.
//!
//! A [`ReceiveSession`] owns everything one run touches: the buffer pool,
//! the gap tracker and the run counters. It is driven against any [`Nic`]:
//!
//! ```text
//!   new()          run()                          run() returns
//!  ───────▶ Filling ──first packet──▶ Steady ──────────────▶ Done(outcome)
//!   (all buffers posted and committed)
//! ```
//!
//! Per completion the loop takes the buffer back, checks framing, reads the
//! sequence number straight from buffer memory, feeds the tracker and
//! re-posts the buffer. Re-posts are committed to the NIC in batches of
//! `push_batch`; whatever is still pending when the run ends is flushed, so
//! no buffer is left between pool and NIC.

pub mod stats;

use thiserror::Error;

use crate::config::{
    ConfigError, LINK_HEADER_LEN, MAX_EVENTS_PER_POLL, ReceiverConfig, SEQ_FIELD_LEN,
};
use crate::gap::{GapTracker, Observation};
use crate::nic::{Event, Nic, NicError};
use crate::pool::{BufferPool, PoolError, SlotId};
use crate::report::Report;
use crate::signal::SignalFlags;
use crate::trace::{debug, error, info, trace, warn};

pub use stats::RunStats;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Every buffer is posted; nothing has completed yet.
    Filling,
    /// At least one packet has been received.
    Steady,
    Done(Outcome),
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The target packet count was reached.
    AllReceived,
    /// The final sequence number arrived with packets missing.
    Lossy,
    /// Stopped by a repeated progress request with no progress in between.
    Interrupted,
    /// Stopped by a terminate request.
    Terminated,
}

impl Outcome {
    /// Process exit status for this outcome.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::AllReceived | Self::Lossy | Self::Interrupted => 0,
            Self::Terminated => 1,
        }
    }
}

/// Failures that end a receive run.
#[derive(Debug, Error)]
pub enum RecvError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Nic(#[from] NicError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    /// The frame did not fit one buffer; descriptor size is below the MTU.
    #[error(
        "slot {slot}: frame spans several buffers (start_of_packet={start_of_packet}, continuation={continuation})"
    )]
    Framing {
        slot: SlotId,
        start_of_packet: bool,
        continuation: bool,
    },
    #[error("slot {slot}: {len} byte frame is too short to carry a sequence number")]
    ShortFrame { slot: SlotId, len: usize },
    /// Sender and receiver disagree on the run length.
    #[error("received sequence number {seq} which is out of expected range (max {target}) in slot {slot}")]
    SequenceOutOfRange { seq: u32, target: u64, slot: SlotId },
}

/// State of one receive run.
pub struct ReceiveSession {
    config: ReceiverConfig,
    pool: BufferPool,
    tracker: GapTracker,
    stats: RunStats,
    state: RunState,
    pending_push: usize,
    last_status: Option<u64>,
}

impl ReceiveSession {
    /// Validates `config`, registers the buffer pool with `nic` and posts
    /// every buffer.
    ///
    /// # Errors
    ///
    /// Fails on an invalid configuration or any setup call the NIC rejects.
    pub fn new<N: Nic>(config: ReceiverConfig, nic: &mut N) -> Result<Self, RecvError> {
        config.validate()?;
        let pool = BufferPool::initialize(nic, &config)?;
        let mut session = Self {
            tracker: GapTracker::new(config.max_gap_details),
            stats: RunStats::new(config.iterations),
            state: RunState::Filling,
            pending_push: 0,
            last_status: None,
            pool,
            config,
        };

        let slots: Vec<SlotId> = session.pool.slots().collect();
        for slot in slots {
            let addr = session.pool.begin_post(slot)?;
            nic.post_receive(addr, slot)?;
        }
        nic.commit_posted();
        session.stats.record_commit();

        info!(
            iterations = session.config.iterations,
            buffers = session.pool.len(),
            push_batch = session.config.push_batch,
            "receive queue filled"
        );
        Ok(session)
    }

    /// Runs the receive loop until the run ends.
    ///
    /// Busy-polls `nic`; `signals` is checked once per poll. Calling `run`
    /// on a finished session returns its outcome again.
    ///
    /// # Errors
    ///
    /// Any [`RecvError`] is fatal to the run; the session is left as it was
    /// when the error was detected.
    pub fn run<N: Nic>(&mut self, nic: &mut N, signals: &SignalFlags) -> Result<Outcome, RecvError> {
        if let RunState::Done(outcome) = self.state {
            return Ok(outcome);
        }

        let mut events = [Event::EMPTY; MAX_EVENTS_PER_POLL];
        let outcome = loop {
            if let Some(outcome) = self.check_signals(signals) {
                break outcome;
            }

            let n = nic.poll_events(&mut events)?;
            self.stats.record_poll(n);
            if let Some(outcome) = self.handle_events(nic, &events[..n])? {
                break outcome;
            }
        };

        self.flush(nic);
        self.stats.stop_clock();
        self.state = RunState::Done(outcome);
        info!(?outcome, remaining = self.stats.remaining(), "receive loop finished");
        Ok(outcome)
    }

    fn check_signals(&mut self, signals: &SignalFlags) -> Option<Outcome> {
        let remaining = self.stats.remaining();
        if signals.terminate_requested() {
            println!("remain: {remaining}");
            return Some(Outcome::Terminated);
        }
        if signals.take_status() {
            if self.last_status == Some(remaining) {
                println!("exiting");
                return Some(Outcome::Interrupted);
            }
            println!("remain: {remaining}");
            self.last_status = Some(remaining);
        }
        None
    }

    fn handle_events<N: Nic>(
        &mut self,
        nic: &mut N,
        events: &[Event],
    ) -> Result<Option<Outcome>, RecvError> {
        for event in events {
            match *event {
                Event::Rx {
                    slot,
                    len,
                    start_of_packet,
                    continuation,
                } => {
                    self.pool.complete(slot)?;
                    if !start_of_packet || continuation {
                        error!(%slot, start_of_packet, continuation, "multi-descriptor frame");
                        return Err(RecvError::Framing {
                            slot,
                            start_of_packet,
                            continuation,
                        });
                    }
                    if len < LINK_HEADER_LEN + SEQ_FIELD_LEN {
                        error!(%slot, len, "short frame");
                        return Err(RecvError::ShortFrame { slot, len });
                    }
                    if let Some(outcome) = self.on_packet(nic, slot)? {
                        return Ok(Some(outcome));
                    }
                }
                Event::RxDiscard {
                    slot,
                    kind,
                    subtype,
                } => {
                    self.pool.complete(slot)?;
                    self.stats.record_discard();
                    warn!(%slot, %kind, subtype, "receive discarded");
                    self.recycle(nic, slot)?;
                }
                Event::Unknown { code } => {
                    self.stats.record_unknown();
                    warn!(code, "unexpected event");
                }
            }
        }
        Ok(None)
    }

    #[inline]
    fn on_packet<N: Nic>(&mut self, nic: &mut N, slot: SlotId) -> Result<Option<Outcome>, RecvError> {
        let seq = self.pool.sequence(slot)?;
        let target = self.config.iterations;
        if u64::from(seq) >= target {
            error!(seq, target, %slot, "sequence number out of range");
            return Err(RecvError::SequenceOutOfRange { seq, target, slot });
        }

        if self.state == RunState::Filling {
            self.stats.start_clock();
            self.state = RunState::Steady;
            debug!(seq, "first packet");
        }

        match self.tracker.observe(u64::from(seq)) {
            Observation::InOrder => trace!(seq, %slot, "packet"),
            Observation::GapClosed(_gap) => debug!(gap = %_gap, "gap"),
            Observation::OutOfOrder => {
                warn!(seq, expected = self.tracker.expected(), "out of order");
            }
        }

        if self.stats.record_packet() == 0 {
            return Ok(Some(Outcome::AllReceived));
        }
        if u64::from(seq) == self.config.final_seq() {
            return Ok(Some(Outcome::Lossy));
        }

        self.recycle(nic, slot)?;
        Ok(None)
    }

    /// Hands `slot` back to the NIC, committing once a batch is pending.
    #[inline]
    fn recycle<N: Nic>(&mut self, nic: &mut N, slot: SlotId) -> Result<(), RecvError> {
        let addr = self.pool.begin_post(slot)?;
        nic.post_receive(addr, slot)?;
        self.pending_push += 1;
        if self.pending_push >= self.config.push_batch {
            self.flush(nic);
        }
        Ok(())
    }

    fn flush<N: Nic>(&mut self, nic: &mut N) {
        if self.pending_push > 0 {
            nic.commit_posted();
            self.stats.record_commit();
            self.pending_push = 0;
        }
    }

    /// Summary of a finished run; `None` while the run is in progress.
    #[must_use]
    pub fn report(&self) -> Option<Report> {
        let RunState::Done(outcome) = self.state else {
            return None;
        };
        Some(Report::new(outcome, &self.config, &self.tracker, &self.stats))
    }

    #[must_use]
    pub const fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    #[must_use]
    pub const fn pool(&self) -> &BufferPool {
        &self.pool
    }

    #[must_use]
    pub const fn tracker(&self) -> &GapTracker {
        &self.tracker
    }

    #[must_use]
    pub const fn stats(&self) -> &RunStats {
        &self.stats
    }

    #[must_use]
    pub const fn state(&self) -> RunState {
        self.state
    }

    /// Re-posts not yet committed to the NIC.
    #[must_use]
    pub const fn pending_push(&self) -> usize {
        self.pending_push
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nic::sim::SimNic;
    use crate::nic::QueueConfig;
    use std::sync::Arc;

    fn config(iterations: u64, buffers: usize) -> ReceiverConfig {
        ReceiverConfig {
            iterations,
            buffer_count: buffers,
            buffer_size: 256,
            ..ReceiverConfig::default()
        }
    }

    fn setup(cfg: ReceiverConfig) -> (ReceiveSession, SimNic) {
        let mut nic = SimNic::new(QueueConfig::for_receiver(&cfg));
        let session = ReceiveSession::new(cfg, &mut nic).unwrap();
        (session, nic)
    }

    #[test]
    fn new_posts_and_commits_every_buffer() {
        let (session, nic) = setup(config(100, 8));
        assert_eq!(session.state(), RunState::Filling);
        assert_eq!(session.pool().posted(), 8);
        assert_eq!(nic.visible_posts(), 8);
        assert_eq!(nic.commits(), 1);
    }

    #[test]
    fn invalid_config_is_rejected_before_setup() {
        let cfg = config(0, 8);
        let mut nic = SimNic::new(QueueConfig::for_receiver(&cfg));
        assert!(matches!(
            ReceiveSession::new(cfg, &mut nic),
            Err(RecvError::Config(ConfigError::NoIterations))
        ));
    }

    #[test]
    fn first_packet_moves_to_steady() {
        let (mut session, mut nic) = setup(config(100, 8));
        let flags = Arc::new(SignalFlags::new());
        nic.script_seqs([0]).terminate_when_drained(flags.clone());
        assert_eq!(session.run(&mut nic, &flags).unwrap(), Outcome::Terminated);
        assert_eq!(session.state(), RunState::Done(Outcome::Terminated));
        assert!(session.stats().elapsed().is_some());
    }

    #[test]
    fn finished_session_returns_its_outcome() {
        let (mut session, mut nic) = setup(config(3, 8));
        nic.script_seqs(0..3);
        let flags = SignalFlags::new();
        assert_eq!(session.run(&mut nic, &flags).unwrap(), Outcome::AllReceived);
        let polls = nic.polls();
        assert_eq!(session.run(&mut nic, &flags).unwrap(), Outcome::AllReceived);
        assert_eq!(nic.polls(), polls);
    }

    #[test]
    fn second_status_request_without_progress_interrupts() {
        let (mut session, _nic) = setup(config(100, 8));
        let flags = SignalFlags::new();
        flags.request_status();
        assert_eq!(session.check_signals(&flags), None);
        assert_eq!(session.last_status, Some(100));

        flags.request_status();
        assert_eq!(session.check_signals(&flags), Some(Outcome::Interrupted));
    }

    #[test]
    fn status_request_after_progress_keeps_running() {
        let (mut session, _nic) = setup(config(100, 8));
        let flags = SignalFlags::new();
        flags.request_status();
        assert_eq!(session.check_signals(&flags), None);
        session.stats.record_packet();
        flags.request_status();
        assert_eq!(session.check_signals(&flags), None);
        assert_eq!(session.last_status, Some(99));
    }

    #[test]
    fn exit_codes() {
        assert_eq!(Outcome::AllReceived.exit_code(), 0);
        assert_eq!(Outcome::Lossy.exit_code(), 0);
        assert_eq!(Outcome::Interrupted.exit_code(), 0);
        assert_eq!(Outcome::Terminated.exit_code(), 1);
    }

    #[test]
    fn report_only_after_run() {
        let (mut session, mut nic) = setup(config(2, 8));
        assert!(session.report().is_none());
        nic.script_seqs(0..2);
        session.run(&mut nic, &SignalFlags::new()).unwrap();
        let report = session.report().unwrap();
        assert_eq!(report.outcome, Outcome::AllReceived);
    }
}
