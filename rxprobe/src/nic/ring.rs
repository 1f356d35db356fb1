//! Receive descriptor ring for the software backends.
//!
//! Models the part of a hardware RX ring the receive loop depends on:
//!
//! - a post lands in a pending list and is invisible until [`RxRing::push`],
//! - visible descriptors are consumed strictly in posting order,
//! - the ring never holds more descriptors than it has slots.
//!
//! Device addresses are host virtual addresses inside the single registered
//! [`DmaRegion`], so a backend "DMAs" by writing through the region.
//! Both queues are allocated once at the ring's capacity and never grow.

use std::collections::VecDeque;

use crate::nic::{DeviceAddr, MemRegistration, NicError, QueueConfig};
use crate::pool::SlotId;
use crate::pool::region::DmaRegion;

/// A receive descriptor: where to write, and the tag to complete with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub addr: DeviceAddr,
    pub slot: SlotId,
}

struct Registered {
    region: DmaRegion,
    reg: MemRegistration,
}

/// Pending and device-visible receive descriptors plus the memory they
/// point into.
pub struct RxRing {
    pending: VecDeque<Descriptor>,
    visible: VecDeque<Descriptor>,
    capacity: usize,
    rx_buffer_len: usize,
    memory: Option<Registered>,
}

impl RxRing {
    #[must_use]
    pub fn new(queue: &QueueConfig) -> Self {
        Self {
            pending: VecDeque::with_capacity(queue.rx_ring_size),
            visible: VecDeque::with_capacity(queue.rx_ring_size),
            capacity: queue.rx_ring_size,
            rx_buffer_len: queue.rx_buffer_len,
            memory: None,
        }
    }

    /// Registers the region descriptors may point into.
    ///
    /// # Errors
    ///
    /// `EBUSY` if a region is already registered.
    pub fn register(&mut self, region: &DmaRegion) -> Result<MemRegistration, NicError> {
        if self.memory.is_some() {
            return Err(NicError::from_errno("register_memory", libc::EBUSY));
        }
        let reg = MemRegistration::new(DeviceAddr(region.host_addr()), region.len());
        self.memory = Some(Registered {
            region: region.clone(),
            reg,
        });
        Ok(reg)
    }

    /// Byte offset of a full receive buffer at `addr` within the region.
    fn offset_of(&self, addr: DeviceAddr) -> Option<usize> {
        let mem = self.memory.as_ref()?;
        let base = mem.reg.dma_addr(0).0;
        let offset = usize::try_from(addr.0.checked_sub(base)?).ok()?;
        let end = offset.checked_add(self.rx_buffer_len)?;
        (end <= mem.reg.len()).then_some(offset)
    }

    /// Queues a descriptor; invisible until [`push`](Self::push).
    ///
    /// # Errors
    ///
    /// `EAGAIN` when every ring slot is taken, `EINVAL` when the buffer does
    /// not lie inside registered memory.
    pub fn post(&mut self, addr: DeviceAddr, slot: SlotId) -> Result<(), NicError> {
        if self.pending.len() + self.visible.len() >= self.capacity {
            return Err(NicError::from_errno("post_receive", libc::EAGAIN));
        }
        if self.offset_of(addr).is_none() {
            return Err(NicError::from_errno("post_receive", libc::EINVAL));
        }
        self.pending.push_back(Descriptor { addr, slot });
        Ok(())
    }

    /// Makes all pending descriptors visible; returns how many moved.
    pub fn push(&mut self) -> usize {
        let moved = self.pending.len();
        self.visible.extend(self.pending.drain(..));
        moved
    }

    /// Oldest visible descriptor and the buffer it points at.
    ///
    /// The descriptor stays in the ring; call [`pop`](Self::pop) once the
    /// frame is accepted.
    pub fn front_buffer(&mut self) -> Option<(Descriptor, &mut [u8])> {
        let desc = *self.visible.front()?;
        let offset = self.offset_of(desc.addr)?;
        let mem = self.memory.as_ref()?;
        // SAFETY: a visible descriptor belongs to a slot the pool has marked
        // posted, so the application holds no view of it; `&mut self` keeps
        // the ring from handing out a second view.
        let buf = unsafe { mem.region.bytes_mut(offset, self.rx_buffer_len) };
        Some((desc, buf))
    }

    /// Consumes the oldest visible descriptor.
    pub fn pop(&mut self) -> Option<Descriptor> {
        self.visible.pop_front()
    }

    /// Posted but not yet pushed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Visible to the device and not yet completed.
    #[must_use]
    pub fn visible(&self) -> usize {
        self.visible.len()
    }

    #[must_use]
    pub const fn rx_buffer_len(&self) -> usize {
        self.rx_buffer_len
    }
}
