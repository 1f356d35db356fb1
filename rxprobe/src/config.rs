//! Run configuration.
//!
//! Defaults reproduce the classic receive benchmark: ten million packets into
//! a pool of 256 two-kilobyte buffers, re-posts pushed to the NIC in batches
//! of 16.

use thiserror::Error;

/// Length of the Ethernet link header that precedes every payload.
pub const LINK_HEADER_LEN: usize = 14;

/// Width of the sequence number at the start of the payload.
pub const SEQ_FIELD_LEN: usize = 4;

/// Upper bound on completion events handled per poll.
///
/// Sizes the on-stack event array, so it is a compile-time constant rather
/// than a config field.
pub const MAX_EVENTS_PER_POLL: usize = 32;

/// Default number of packets to receive.
pub const DEFAULT_ITERATIONS: u64 = 10_000_000;

/// Default number of receive buffers in the pool.
pub const DEFAULT_BUFFER_COUNT: usize = 256;

/// Default size of each receive buffer in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 2048;

/// Largest pool a 16-bit descriptor tag can address.
pub const MAX_BUFFER_COUNT: usize = 1 << 16;

/// Pending re-posts that trigger a batched push.
pub const DEFAULT_PUSH_BATCH: usize = 16;

/// Gaps retained in detail for the report.
pub const DEFAULT_MAX_GAP_DETAILS: usize = 20;

/// Invalid configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("iteration count must be at least 1")]
    NoIterations,
    #[error("iteration count {0} exceeds the 32-bit sequence space")]
    TooManyIterations(u64),
    #[error("buffer pool must hold at least one buffer")]
    NoBuffers,
    #[error("buffer pool of {0} exceeds the {MAX_BUFFER_COUNT} descriptor tags")]
    TooManyBuffers(usize),
    #[error("push batch must be at least 1")]
    NoPushBatch,
    #[error(
        "buffer size {buffer_size} cannot hold alignment pad {rx_align} + link header + sequence field"
    )]
    BufferTooSmall { buffer_size: usize, rx_align: usize },
}

/// Tunables for one receive run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverConfig {
    /// Packets expected from the sender; sequence numbers cover `0..iterations`.
    pub iterations: u64,
    /// Bytes of padding before the link header in every buffer.
    pub rx_align: usize,
    /// Request physically addressed (page-locked) buffer memory.
    pub phys_mode: bool,
    /// Number of buffers in the pool.
    pub buffer_count: usize,
    /// Bytes per buffer, including the alignment pad.
    pub buffer_size: usize,
    /// Pending re-posts that trigger a push to the NIC.
    pub push_batch: usize,
    /// Gaps kept in detail for the report; later gaps are only counted.
    pub max_gap_details: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
            rx_align: 0,
            phys_mode: false,
            buffer_count: DEFAULT_BUFFER_COUNT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            push_batch: DEFAULT_PUSH_BATCH,
            max_gap_details: DEFAULT_MAX_GAP_DETAILS,
        }
    }
}

impl ReceiverConfig {
    /// Checks that the geometry can carry a sequenced frame.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.iterations == 0 {
            return Err(ConfigError::NoIterations);
        }
        if self.iterations > u64::from(u32::MAX) + 1 {
            return Err(ConfigError::TooManyIterations(self.iterations));
        }
        if self.buffer_count == 0 {
            return Err(ConfigError::NoBuffers);
        }
        if self.buffer_count > MAX_BUFFER_COUNT {
            return Err(ConfigError::TooManyBuffers(self.buffer_count));
        }
        if self.push_batch == 0 {
            return Err(ConfigError::NoPushBatch);
        }
        if self
            .rx_align
            .checked_add(LINK_HEADER_LEN + SEQ_FIELD_LEN)
            .is_none_or(|needed| needed > self.buffer_size)
        {
            return Err(ConfigError::BufferTooSmall {
                buffer_size: self.buffer_size,
                rx_align: self.rx_align,
            });
        }
        Ok(())
    }

    /// Offset of the payload (and its sequence field) within a buffer.
    #[inline]
    #[must_use]
    pub const fn payload_offset(&self) -> usize {
        self.rx_align.saturating_add(LINK_HEADER_LEN)
    }

    /// Bytes the NIC may write into one posted buffer; zero when the pad
    /// swallows the whole buffer, which [`validate`](Self::validate) rejects.
    #[inline]
    #[must_use]
    pub const fn rx_buffer_len(&self) -> usize {
        self.buffer_size.saturating_sub(self.rx_align)
    }

    /// The last sequence number of the run.
    #[inline]
    #[must_use]
    pub const fn final_seq(&self) -> u64 {
        self.iterations - 1
    }
}
