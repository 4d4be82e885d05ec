//! Interrupt handling
//!
//! On Unix, SIGINT and SIGTERM set a process-wide flag that the producer loop
//! polls between ticks. The handler only stores an atomic, so it is
//! async-signal-safe. Non-Unix targets install nothing and rely on the
//! default Ctrl+C behaviour.

use std::sync::atomic::{AtomicBool, Ordering};

/// Set once SIGINT or SIGTERM has been received
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Check whether an interrupt has been received
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::Relaxed)
}

/// Request shutdown as if an interrupt had arrived
pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

/// Forget a previous shutdown request
pub fn clear_shutdown_request() {
    SHUTDOWN_REQUESTED.store(false, Ordering::Relaxed);
}

/// Install SIGINT and SIGTERM handlers that set the shutdown flag
#[cfg(unix)]
pub fn install_handlers() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = shutdown_handler as *const () as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
        libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());
    }
    tracing::debug!("Installed SIGINT/SIGTERM handlers");
}

#[cfg(unix)]
extern "C" fn shutdown_handler(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

/// No-op on non-Unix targets
#[cfg(not(unix))]
pub fn install_handlers() {}
