//! Fixed pool of receive buffers, addressed by slot id.
//!
//! The pool is an arena: every buffer is carved out of one [`DmaRegion`] at
//! startup and identified by its index, which doubles as the completion tag
//! handed to the NIC. Nothing is allocated or freed after `initialize`.
//!
//! Each slot is either owned by the application or posted to the NIC, never
//! both. Transitions are checked:
//!
//! ```text
//!            begin_post()
//!   Owned ───────────────▶ Posted
//!     ▲                      │
//!     └──────────────────────┘
//!            complete()
//! ```

pub mod region;

use std::fmt;
use std::io;

use thiserror::Error;

use crate::config::{ReceiverConfig, SEQ_FIELD_LEN};
use crate::nic::{DeviceAddr, Nic, NicError};
use crate::trace::debug;

pub use region::DmaRegion;

/// Index of a buffer in the pool; also the NIC's completion tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u32);

impl SlotId {
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for SlotId {
    #[inline]
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl From<SlotId> for u32 {
    #[inline]
    fn from(slot: SlotId) -> Self {
        slot.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Who currently owns a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// The application may read and write it.
    Owned,
    /// A receive descriptor for it is queued at the NIC.
    Posted,
}

/// Buffer pool failures.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to map {len} bytes of buffer memory: {source}")]
    Map {
        len: usize,
        #[source]
        source: io::Error,
    },
    #[error("failed to lock buffer memory: {0}")]
    Lock(#[source] io::Error),
    #[error("memory registration failed: {0}")]
    Register(#[from] NicError),
    /// The NIC reported a slot id the pool never handed out.
    #[error("slot {slot} out of range (pool holds {count} buffers)")]
    OutOfRange { slot: SlotId, count: usize },
    /// The slot is posted to the NIC; posting again or reading it is a bug.
    #[error("slot {0} is posted to the NIC")]
    Posted(SlotId),
    /// The NIC completed a slot that was not posted.
    #[error("slot {0} completed but was not posted to the NIC")]
    NotPosted(SlotId),
}

/// Metadata for one buffer.
#[derive(Debug, Clone, Copy)]
pub struct PacketBuf {
    id: SlotId,
    dma_addr: DeviceAddr,
    offset: usize,
    state: SlotState,
}

impl PacketBuf {
    #[must_use]
    pub const fn id(&self) -> SlotId {
        self.id
    }

    /// Device address the NIC writes to (after the alignment pad).
    #[must_use]
    pub const fn dma_addr(&self) -> DeviceAddr {
        self.dma_addr
    }

    #[must_use]
    pub const fn state(&self) -> SlotState {
        self.state
    }
}

/// The run's receive buffers.
pub struct BufferPool {
    region: DmaRegion,
    bufs: Vec<PacketBuf>,
    buffer_size: usize,
    payload_offset: usize,
    posted: usize,
}

impl BufferPool {
    /// Maps `config.buffer_count` buffers, registers them with `nic` and
    /// computes each buffer's device address.
    ///
    /// All buffers start out [`SlotState::Owned`]. `config` must already be
    /// validated, which bounds the buffer count to the tag space.
    ///
    /// # Errors
    ///
    /// Fails if the memory cannot be mapped or locked, or the NIC refuses the
    /// registration.
    pub fn initialize<N: Nic>(nic: &mut N, config: &ReceiverConfig) -> Result<Self, PoolError> {
        let count = config.buffer_count;
        let size = config.buffer_size;
        let region = DmaRegion::map(count * size, config.phys_mode)?;
        let reg = nic.register_memory(&region)?;

        let bufs = (0..count)
            .map(|i| {
                let offset = i * size;
                PacketBuf {
                    id: SlotId::new(i as u32),
                    dma_addr: reg.dma_addr(offset).offset(config.rx_align),
                    offset,
                    state: SlotState::Owned,
                }
            })
            .collect();

        debug!(
            buffers = count,
            buffer_size = size,
            rx_align = config.rx_align,
            region = ?region,
            "buffer pool registered"
        );

        Ok(Self {
            region,
            bufs,
            buffer_size: size,
            payload_offset: config.payload_offset(),
            posted: 0,
        })
    }

    /// Looks up a buffer by slot id.
    ///
    /// # Errors
    ///
    /// [`PoolError::OutOfRange`] if the id is not one this pool handed out.
    #[inline]
    pub fn buffer_for(&self, slot: SlotId) -> Result<&PacketBuf, PoolError> {
        self.bufs.get(slot.index()).ok_or(PoolError::OutOfRange {
            slot,
            count: self.bufs.len(),
        })
    }

    #[inline]
    fn buffer_mut_meta(&mut self, slot: SlotId) -> Result<&mut PacketBuf, PoolError> {
        let count = self.bufs.len();
        self.bufs
            .get_mut(slot.index())
            .ok_or(PoolError::OutOfRange { slot, count })
    }

    /// Hands `slot` to the NIC and returns the address to post.
    ///
    /// # Errors
    ///
    /// [`PoolError::Posted`] if the slot is already at the NIC.
    #[inline]
    pub fn begin_post(&mut self, slot: SlotId) -> Result<DeviceAddr, PoolError> {
        let buf = self.buffer_mut_meta(slot)?;
        if buf.state == SlotState::Posted {
            return Err(PoolError::Posted(slot));
        }
        buf.state = SlotState::Posted;
        let addr = buf.dma_addr;
        self.posted += 1;
        Ok(addr)
    }

    /// Takes `slot` back from the NIC after a completion.
    ///
    /// # Errors
    ///
    /// [`PoolError::NotPosted`] if the NIC did not own the slot.
    #[inline]
    pub fn complete(&mut self, slot: SlotId) -> Result<(), PoolError> {
        let buf = self.buffer_mut_meta(slot)?;
        if buf.state != SlotState::Posted {
            return Err(PoolError::NotPosted(slot));
        }
        buf.state = SlotState::Owned;
        self.posted -= 1;
        Ok(())
    }

    fn owned(&self, slot: SlotId) -> Result<&PacketBuf, PoolError> {
        let buf = self.buffer_for(slot)?;
        if buf.state == SlotState::Posted {
            return Err(PoolError::Posted(slot));
        }
        Ok(buf)
    }

    /// The whole buffer, alignment pad included.
    ///
    /// # Errors
    ///
    /// Fails if the slot is out of range or posted to the NIC.
    pub fn raw(&self, slot: SlotId) -> Result<&[u8], PoolError> {
        let buf = self.owned(slot)?;
        // SAFETY: the slot is application-owned, so the NIC holds no view of it.
        Ok(unsafe { self.region.bytes(buf.offset, self.buffer_size) })
    }

    /// Mutable access to the whole buffer.
    ///
    /// # Errors
    ///
    /// Fails if the slot is out of range or posted to the NIC.
    pub fn raw_mut(&mut self, slot: SlotId) -> Result<&mut [u8], PoolError> {
        let offset = self.owned(slot)?.offset;
        // SAFETY: owned slot, and `&mut self` rules out other pool views.
        Ok(unsafe { self.region.bytes_mut(offset, self.buffer_size) })
    }

    /// The payload: everything after the pad and the link header.
    ///
    /// # Errors
    ///
    /// Fails if the slot is out of range or posted to the NIC.
    pub fn payload(&self, slot: SlotId) -> Result<&[u8], PoolError> {
        let raw = self.raw(slot)?;
        Ok(&raw[self.payload_offset..])
    }

    /// The little-endian sequence number at the start of the payload.
    ///
    /// Always read from buffer memory; nothing is cached per slot.
    ///
    /// # Errors
    ///
    /// Fails if the slot is out of range or posted to the NIC.
    #[inline]
    pub fn sequence(&self, slot: SlotId) -> Result<u32, PoolError> {
        let payload = self.payload(slot)?;
        let mut seq = [0u8; SEQ_FIELD_LEN];
        seq.copy_from_slice(&payload[..SEQ_FIELD_LEN]);
        Ok(u32::from_le_bytes(seq))
    }

    /// Slot ids in pool order.
    pub fn slots(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.bufs.iter().map(PacketBuf::id)
    }

    /// Number of buffers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bufs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    /// Buffers currently at the NIC.
    #[must_use]
    pub const fn posted(&self) -> usize {
        self.posted
    }

    /// Buffers currently owned by the application.
    #[must_use]
    pub fn owned_count(&self) -> usize {
        self.bufs.len() - self.posted
    }

    #[must_use]
    pub const fn region(&self) -> &DmaRegion {
        &self.region
    }
}
