//! Scripted NIC for driving the receive loop without hardware.
//!
//! Each call to [`poll_events`](Nic::poll_events) consumes one scripted
//! poll. Frames are written into the oldest visible descriptor's buffer just
//! as a device would DMA them, so the loop reads real buffer contents. A
//! frame with no visible descriptor is dropped and counted, which is how a
//! starved ring shows up.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::LINK_HEADER_LEN;
use crate::nic::ring::RxRing;
use crate::nic::{DeviceAddr, DiscardKind, Event, MemRegistration, Nic, NicError, QueueConfig};
use crate::pool::SlotId;
use crate::pool::region::DmaRegion;
use crate::signal::SignalFlags;

/// Minimum Ethernet frame length without FCS.
const MIN_FRAME_LEN: usize = 60;

/// One scripted completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    /// A complete frame, delivered into the next visible buffer.
    Frame(Vec<u8>),
    /// A frame delivered with explicit descriptor flags.
    Fragment {
        frame: Vec<u8>,
        start_of_packet: bool,
        continuation: bool,
    },
    /// The device drops a frame, consuming a descriptor.
    Discard { kind: DiscardKind, subtype: u16 },
    /// A completion the receive path does not handle.
    Unknown { code: u32 },
}

impl SimEvent {
    /// A minimum-size frame carrying `seq`.
    #[must_use]
    pub fn seq(seq: u32) -> Self {
        Self::Frame(sequenced_frame(seq))
    }
}

/// A minimum-size Ethernet frame with `seq` at the start of the payload.
#[must_use]
pub fn sequenced_frame(seq: u32) -> Vec<u8> {
    let mut frame = vec![0u8; MIN_FRAME_LEN];
    frame[LINK_HEADER_LEN..LINK_HEADER_LEN + 4].copy_from_slice(&seq.to_le_bytes());
    frame
}

/// In-memory NIC with a scripted event stream.
pub struct SimNic {
    ring: RxRing,
    script: VecDeque<VecDeque<SimEvent>>,
    commits: usize,
    dropped: usize,
    polls: usize,
    on_drained: Option<Arc<SignalFlags>>,
}

impl SimNic {
    #[must_use]
    pub fn new(queue: QueueConfig) -> Self {
        Self {
            ring: RxRing::new(&queue),
            script: VecDeque::new(),
            commits: 0,
            dropped: 0,
            polls: 0,
            on_drained: None,
        }
    }

    /// Appends one poll returning `events` (in order).
    pub fn script_poll(&mut self, events: impl IntoIterator<Item = SimEvent>) -> &mut Self {
        self.script.push_back(events.into_iter().collect());
        self
    }

    /// Appends one poll delivering a frame per sequence number.
    pub fn script_seqs(&mut self, seqs: impl IntoIterator<Item = u32>) -> &mut Self {
        self.script_poll(seqs.into_iter().map(SimEvent::seq))
    }

    /// Appends `n` polls that return nothing.
    pub fn script_empty_polls(&mut self, n: usize) -> &mut Self {
        for _ in 0..n {
            self.script.push_back(VecDeque::new());
        }
        self
    }

    /// Requests termination on `flags` once the script runs out, so a run
    /// that never sees its final packet still ends.
    pub fn terminate_when_drained(&mut self, flags: Arc<SignalFlags>) -> &mut Self {
        self.on_drained = Some(flags);
        self
    }

    /// Doorbell writes so far.
    #[must_use]
    pub const fn commits(&self) -> usize {
        self.commits
    }

    /// Frames lost because no descriptor was visible.
    #[must_use]
    pub const fn dropped(&self) -> usize {
        self.dropped
    }

    /// Calls to `poll_events`.
    #[must_use]
    pub const fn polls(&self) -> usize {
        self.polls
    }

    /// Descriptors posted but not yet committed.
    #[must_use]
    pub fn pending_posts(&self) -> usize {
        self.ring.pending()
    }

    /// Descriptors the device could fill right now.
    #[must_use]
    pub fn visible_posts(&self) -> usize {
        self.ring.visible()
    }

    /// Scripted polls not yet consumed.
    #[must_use]
    pub fn remaining_polls(&self) -> usize {
        self.script.len()
    }

    fn deliver(&mut self, frame: &[u8], start_of_packet: bool, continuation: bool) -> Option<Event> {
        let Some((desc, buf)) = self.ring.front_buffer() else {
            self.dropped += 1;
            return None;
        };
        let len = frame.len().min(buf.len());
        buf[..len].copy_from_slice(&frame[..len]);
        let continuation = continuation || frame.len() > buf.len();
        self.ring.pop();
        Some(Event::Rx {
            slot: desc.slot,
            len,
            start_of_packet,
            continuation,
        })
    }

    fn discard(&mut self, kind: DiscardKind, subtype: u16) -> Option<Event> {
        let Some(desc) = self.ring.pop() else {
            self.dropped += 1;
            return None;
        };
        Some(Event::RxDiscard {
            slot: desc.slot,
            kind,
            subtype,
        })
    }
}

impl Nic for SimNic {
    fn register_memory(&mut self, region: &DmaRegion) -> Result<MemRegistration, NicError> {
        self.ring.register(region)
    }

    fn post_receive(&mut self, addr: DeviceAddr, slot: SlotId) -> Result<(), NicError> {
        self.ring.post(addr, slot)
    }

    fn commit_posted(&mut self) {
        self.commits += 1;
        self.ring.push();
    }

    fn poll_events(&mut self, events: &mut [Event]) -> Result<usize, NicError> {
        self.polls += 1;
        let Some(mut batch) = self.script.pop_front() else {
            if let Some(flags) = &self.on_drained {
                flags.request_terminate();
            }
            return Ok(0);
        };

        let mut n = 0;
        while n < events.len() {
            let Some(scripted) = batch.pop_front() else {
                break;
            };
            let event = match scripted {
                SimEvent::Frame(frame) => self.deliver(&frame, true, false),
                SimEvent::Fragment {
                    frame,
                    start_of_packet,
                    continuation,
                } => self.deliver(&frame, start_of_packet, continuation),
                SimEvent::Discard { kind, subtype } => self.discard(kind, subtype),
                SimEvent::Unknown { code } => Some(Event::Unknown { code }),
            };
            if let Some(event) = event {
                events[n] = event;
                n += 1;
            }
        }

        // Whatever did not fit is what the next poll sees first.
        if !batch.is_empty() {
            self.script.push_front(batch);
        }
        Ok(n)
    }
}
