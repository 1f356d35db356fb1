//! NIC driver interface consumed by the receive loop.
//!
//! The loop only ever talks to a [`Nic`]: it posts buffers by device address
//! and slot id, commits batches of posts, and polls for completion events.
//! Backends:
//!
//! - [`packet::PacketNic`]: raw Ethernet frames from a Linux interface.
//! - [`udp::UdpNic`]: UDP datagrams, for runs without raw socket privileges.
//! - [`sim::SimNic`]: scripted, in-memory; drives the loop in tests.
//!
//! The software backends share the descriptor bookkeeping in [`ring`], which
//! mirrors a hardware receive ring: posts are invisible until committed and
//! complete in FIFO order.

pub mod packet;
pub mod ring;
pub mod sim;
pub mod udp;

use std::fmt;
use std::io;
use std::panic::Location;

use thiserror::Error;

use crate::config::ReceiverConfig;
use crate::pool::SlotId;
use crate::pool::region::DmaRegion;

/// Device-visible address of a byte in registered memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddr(pub u64);

impl DeviceAddr {
    /// Address `bytes` further into the same registration.
    #[inline]
    #[must_use]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }
}

impl fmt::Display for DeviceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Ethernet MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Addressing mode of a receive queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueMode {
    /// Buffers are addressed through the IOMMU / host virtual addresses.
    #[default]
    Virtual,
    /// Buffers are handed to the device by physical address and must stay
    /// resident for the whole run.
    Physical,
}

/// Receive queue geometry requested at allocation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Descriptor slots in the receive ring.
    pub rx_ring_size: usize,
    /// Bytes the device may write into one posted buffer.
    pub rx_buffer_len: usize,
    pub mode: QueueMode,
}

impl QueueConfig {
    /// Queue sized to hold every buffer of the run's pool.
    #[must_use]
    pub const fn for_receiver(config: &ReceiverConfig) -> Self {
        Self {
            rx_ring_size: config.buffer_count,
            rx_buffer_len: config.rx_buffer_len(),
            mode: if config.phys_mode {
                QueueMode::Physical
            } else {
                QueueMode::Virtual
            },
        }
    }
}

/// Why the NIC discarded a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardKind {
    /// Frame longer than the posted buffer and truncated.
    Truncated,
    /// Ethernet CRC mismatch.
    CrcBad,
    /// IP or L4 checksum mismatch.
    ChecksumBad,
    /// Frame arrived on the queue but failed the installed filter.
    FilterMismatch,
    Other,
}

impl fmt::Display for DiscardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Truncated => "truncated",
            Self::CrcBad => "crc",
            Self::ChecksumBad => "checksum",
            Self::FilterMismatch => "filter",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Completion event reported by [`Nic::poll_events`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A posted buffer was filled.
    Rx {
        slot: SlotId,
        /// Bytes written, starting at the buffer's device address.
        len: usize,
        /// First descriptor of a frame.
        start_of_packet: bool,
        /// More descriptors follow for the same frame.
        continuation: bool,
    },
    /// A posted buffer was consumed by a frame the NIC dropped.
    RxDiscard {
        slot: SlotId,
        kind: DiscardKind,
        subtype: u16,
    },
    /// Anything the receive path does not handle (TX completions, timers, ...).
    Unknown { code: u32 },
}

impl Event {
    /// Filler for event arrays before a poll.
    pub const EMPTY: Self = Self::Unknown { code: 0 };
}

/// A region registered with the NIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRegistration {
    base: DeviceAddr,
    len: usize,
}

impl MemRegistration {
    #[must_use]
    pub const fn new(base: DeviceAddr, len: usize) -> Self {
        Self { base, len }
    }

    /// Device address of the byte at `offset` into the registered region.
    ///
    /// # Panics
    ///
    /// Panics if `offset` lies outside the region.
    #[must_use]
    pub fn dma_addr(&self, offset: usize) -> DeviceAddr {
        assert!(offset < self.len, "offset {offset} outside registration of {} bytes", self.len);
        self.base.offset(offset)
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A failed driver call.
///
/// Carries the operation name and the call site so setup failures can be
/// reported the way the operator needs them: what failed, where, and the OS
/// error behind it.
#[derive(Debug, Error)]
#[error(
    "'{op}' failed at {location}: errno={} ({source})",
    .source.raw_os_error().unwrap_or(0)
)]
pub struct NicError {
    op: &'static str,
    location: &'static Location<'static>,
    #[source]
    source: io::Error,
}

impl NicError {
    #[track_caller]
    #[must_use]
    pub fn new(op: &'static str, source: io::Error) -> Self {
        Self {
            op,
            location: Location::caller(),
            source,
        }
    }

    /// Error for `op` built from the calling thread's `errno`.
    #[track_caller]
    #[must_use]
    pub fn last_os_error(op: &'static str) -> Self {
        Self::new(op, io::Error::last_os_error())
    }

    /// Error for `op` with an explicit errno value.
    #[track_caller]
    #[must_use]
    pub fn from_errno(op: &'static str, errno: i32) -> Self {
        Self::new(op, io::Error::from_raw_os_error(errno))
    }

    #[must_use]
    pub const fn op(&self) -> &'static str {
        self.op
    }

    #[must_use]
    pub const fn location(&self) -> &'static Location<'static> {
        self.location
    }

    #[must_use]
    pub fn errno(&self) -> Option<i32> {
        self.source.raw_os_error()
    }
}

/// Receive side of a NIC virtual interface.
///
/// Implementations never allocate on the post/commit/poll path.
pub trait Nic {
    /// Registers `region` for DMA and returns its device address mapping.
    ///
    /// # Errors
    ///
    /// Fails if the region cannot be registered (already registered, out of
    /// IOMMU space, ...).
    fn register_memory(&mut self, region: &DmaRegion) -> Result<MemRegistration, NicError>;

    /// Queues a receive descriptor for the buffer at `addr`, tagged `slot`.
    ///
    /// The descriptor is not visible to the device until
    /// [`commit_posted`](Nic::commit_posted).
    ///
    /// # Errors
    ///
    /// Fails with `EAGAIN` when the ring is full and `EINVAL` when `addr` is
    /// not inside registered memory.
    fn post_receive(&mut self, addr: DeviceAddr, slot: SlotId) -> Result<(), NicError>;

    /// Makes every queued descriptor visible to the device in one doorbell.
    fn commit_posted(&mut self);

    /// Writes up to `events.len()` completions into `events`, returning how
    /// many were written. Zero is a normal, non-blocking outcome.
    ///
    /// # Errors
    ///
    /// Fails only on an unrecoverable device or socket error.
    fn poll_events(&mut self, events: &mut [Event]) -> Result<usize, NicError>;
}
