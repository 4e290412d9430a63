//! Process-wide cancellation flag.
//!
//! The original tool uses file-scope mutable state for almost everything;
//! this port keeps that pattern for exactly one field, as design notes
//! require: the stop flag, which must be safe to assign from a signal
//! handler. Everything else is threaded explicitly through the engine.

use std::sync::atomic::{AtomicBool, Ordering};

static STOP: AtomicBool = AtomicBool::new(false);

/// Returns `true` once `SIGINT`, `SIGHUP`, or `SIGTERM` has been observed.
pub fn stop_requested() -> bool {
    STOP.load(Ordering::SeqCst)
}

/// Set directly by the signal handler (and by tests that want to simulate
/// an interrupt without sending a real signal).
pub fn request_stop() {
    STOP.store(true, Ordering::SeqCst);
}

#[cfg(test)]
pub(crate) fn reset_for_test() {
    STOP.store(false, Ordering::SeqCst);
}

#[cfg(unix)]
pub mod unix {
    use super::request_stop;
    use nix::sys::signal::{self, SigHandler, Signal};

    extern "C" fn handle_stop(_sig: libc::c_int) {
        request_stop();
    }

    /// Install handlers for `SIGINT`, `SIGHUP`, and `SIGTERM` that set the
    /// stop flag. Safe to call once at process startup; the handler body
    /// does nothing but an atomic store, so it is signal-safe.
    pub fn install() -> Result<(), nix::Error> {
        let handler = SigHandler::Handler(handle_stop);
        unsafe {
            signal::signal(Signal::SIGINT, handler)?;
            signal::signal(Signal::SIGHUP, handler)?;
            signal::signal(Signal::SIGTERM, handler)?;
        }
        Ok(())
    }
}
