//! Out-of-band control of a running receive loop.
//!
//! Signal handlers only flip atomics in [`PROCESS_SIGNALS`]; the loop checks
//! them once per poll and does all printing itself, so nothing in signal
//! context allocates or touches the NIC.
//!
//! - `SIGINT`: print progress. A second `SIGINT` with no progress since the
//!   previous one ends the run.
//! - `SIGTERM`: print progress and end the run with a failure status.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

/// Requests raised against a receive loop.
#[derive(Debug, Default)]
pub struct SignalFlags {
    status: AtomicBool,
    terminate: AtomicBool,
}

impl SignalFlags {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            status: AtomicBool::new(false),
            terminate: AtomicBool::new(false),
        }
    }

    /// Asks the loop for a progress line.
    pub fn request_status(&self) {
        self.status.store(true, Ordering::Relaxed);
    }

    /// Asks the loop to stop after the current poll.
    pub fn request_terminate(&self) {
        self.terminate.store(true, Ordering::Relaxed);
    }

    /// Consumes a pending progress request.
    #[inline]
    pub fn take_status(&self) -> bool {
        self.status.swap(false, Ordering::Relaxed)
    }

    #[inline]
    pub fn terminate_requested(&self) -> bool {
        self.terminate.load(Ordering::Relaxed)
    }
}

/// Flags written by the process signal handlers.
pub static PROCESS_SIGNALS: SignalFlags = SignalFlags::new();

extern "C" fn on_sigint(_sig: libc::c_int) {
    PROCESS_SIGNALS.request_status();
}

extern "C" fn on_sigterm(_sig: libc::c_int) {
    PROCESS_SIGNALS.request_terminate();
}

/// Routes `SIGINT` and `SIGTERM` to [`PROCESS_SIGNALS`].
///
/// # Errors
///
/// Returns the OS error if a handler cannot be installed.
pub fn install() -> io::Result<&'static SignalFlags> {
    let handlers: [(libc::c_int, extern "C" fn(libc::c_int)); 2] =
        [(libc::SIGINT, on_sigint), (libc::SIGTERM, on_sigterm)];
    for (sig, handler) in handlers {
        // SAFETY: the handlers only perform relaxed atomic stores, which are
        // async-signal-safe.
        let prev = unsafe { libc::signal(sig, handler as *const () as libc::sighandler_t) };
        if prev == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(&PROCESS_SIGNALS)
}
