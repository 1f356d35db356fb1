//! DMA-capable memory backing the buffer pool.
//!
//! One anonymous, page-aligned mapping per run. The mapping is shared
//! between the pool and the NIC backend that registered it (`Arc`), so a
//! backend can never write into memory that has already been unmapped.
//!
//! ```text
//! host mapping (page aligned)
//! ┌──────────────┬──────────────┬─────┬──────────────┐
//! │ buffer 0     │ buffer 1     │ ... │ buffer n-1   │
//! └──────────────┴──────────────┴─────┴──────────────┘
//!  ↑ pad ↑ link header ↑ payload
//! ```

use std::ffi::c_void;
use std::fmt;
use std::io;
use std::ptr::{NonNull, null_mut};
use std::sync::Arc;

use rustix::mm::{MapFlags, ProtFlags, mlock, mmap_anonymous, munlock, munmap};

use super::PoolError;

struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
    locked: bool,
}

// SAFETY: the mapping is plain memory; access to individual buffers is
// serialized by slot ownership (pool vs NIC), never by thread.
unsafe impl Send for Mapping {}
// SAFETY: see above; `Mapping` itself exposes no interior mutability.
unsafe impl Sync for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe exactly the mapping created in `DmaRegion::map`,
        // and this is the last owner.
        unsafe {
            if self.locked {
                let _ = munlock(self.ptr.as_ptr().cast::<c_void>(), self.len);
            }
            let _ = munmap(self.ptr.as_ptr().cast::<c_void>(), self.len);
        }
    }
}

/// A contiguous, page-aligned block of buffer memory.
///
/// Cloning shares the same mapping; memory is released when the last clone
/// drops.
#[derive(Clone)]
pub struct DmaRegion {
    map: Arc<Mapping>,
}

impl DmaRegion {
    /// Maps `len` bytes of zeroed memory, locked into RAM when `lock` is set.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Map`] if the kernel refuses the mapping and
    /// [`PoolError::Lock`] if the pages cannot be locked (usually
    /// `RLIMIT_MEMLOCK`).
    pub fn map(len: usize, lock: bool) -> Result<Self, PoolError> {
        // SAFETY: a fresh private anonymous mapping aliases nothing.
        let raw = unsafe {
            mmap_anonymous(
                null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE | MapFlags::POPULATE,
            )
        }
        .map_err(|e| PoolError::Map {
            len,
            source: io::Error::from(e),
        })?;

        let ptr = NonNull::new(raw.cast::<u8>()).ok_or_else(|| PoolError::Map {
            len,
            source: io::Error::other("mmap returned null"),
        })?;
        let mut map = Mapping {
            ptr,
            len,
            locked: false,
        };

        if lock {
            // SAFETY: range is the mapping just created.
            unsafe { mlock(ptr.as_ptr().cast::<c_void>(), len) }
                .map_err(|e| PoolError::Lock(io::Error::from(e)))?;
            map.locked = true;
        }

        Ok(Self { map: Arc::new(map) })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.len == 0
    }

    /// Whether the pages are locked into RAM.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.map.locked
    }

    /// Host virtual address of the first byte.
    #[must_use]
    pub fn host_addr(&self) -> u64 {
        self.map.ptr.as_ptr() as u64
    }

    /// Whether both handles refer to the same mapping.
    #[must_use]
    pub fn same_mapping(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.map, &other.map)
    }

    fn check(&self, offset: usize, len: usize) {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.map.len),
            "range {offset}+{len} outside region of {} bytes",
            self.map.len
        );
    }

    /// Shared view of `len` bytes at `offset`.
    ///
    /// # Safety
    ///
    /// No mutable view of any byte in the range may be live, i.e. the buffer
    /// must not be posted to a NIC.
    pub(crate) unsafe fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        self.check(offset, len);
        // SAFETY: range checked above; aliasing guaranteed by the caller.
        unsafe { std::slice::from_raw_parts(self.map.ptr.as_ptr().add(offset), len) }
    }

    /// Mutable view of `len` bytes at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must hold exclusive ownership of the range for the
    /// lifetime of the returned slice: either an application-owned buffer or
    /// a descriptor the NIC backend has popped from its ring.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn bytes_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        self.check(offset, len);
        // SAFETY: range checked above; exclusivity guaranteed by the caller.
        unsafe { std::slice::from_raw_parts_mut(self.map.ptr.as_ptr().add(offset), len) }
    }
}

impl fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaRegion")
            .field("host_addr", &format_args!("{:#x}", self.host_addr()))
            .field("len", &self.len())
            .field("locked", &self.is_locked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_is_page_aligned_and_zeroed() {
        let region = DmaRegion::map(8192, false).unwrap();
        assert_eq!(region.len(), 8192);
        assert_eq!(region.host_addr() % 4096, 0);
        // SAFETY: nothing else references the fresh region.
        let bytes = unsafe { region.bytes(0, 8192) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn clones_share_memory() {
        let region = DmaRegion::map(4096, false).unwrap();
        let shared = region.clone();
        // SAFETY: single-threaded test, views do not overlap in time.
        unsafe { region.bytes_mut(100, 4) }.copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(unsafe { shared.bytes(100, 4) }, &[1, 2, 3, 4]);
        assert!(region.same_mapping(&shared));
        drop(region);
        assert_eq!(unsafe { shared.bytes(102, 1) }, &[3]);
    }

    #[test]
    #[should_panic(expected = "outside region")]
    fn out_of_bounds_view_panics() {
        let region = DmaRegion::map(4096, false).unwrap();
        let _ = unsafe { region.bytes(4090, 8) };
    }
}
