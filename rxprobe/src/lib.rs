//! Single-stream packet receive benchmark and loss probe.
//!
//! A fixed pool of receive buffers is posted to a NIC receive queue and
//! recycled as completions arrive. Every packet carries a little-endian
//! 32-bit sequence number right after the link header; the receive loop
//! validates it, records every run of missing values as a gap and, once the
//! expected count is reached or the last sequence number shows up, reports
//! loss, poll efficiency and packet rate.
//!
//! - [`config`]: run tunables and their validation.
//! - [`pool`]: the buffer arena and its DMA region.
//! - [`nic`]: the driver interface and its backends.
//! - [`gap`]: loss tracking.
//! - [`session`]: the receive loop.
//! - [`report`]: the end-of-run summary.

pub mod config;
pub mod dump;
pub mod gap;
pub mod nic;
pub mod pool;
pub mod report;
pub mod session;
pub mod signal;

mod trace;

pub use config::ReceiverConfig;
pub use session::{Outcome, ReceiveSession, RecvError};
pub use trace::init_tracing;
