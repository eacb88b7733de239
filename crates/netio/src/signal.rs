//! SIGUSR1 plumbing for waking threads parked in blocking syscalls.
//!
//! The handler does nothing; its entire purpose is that delivering the
//! signal makes a blocking `recvmsg`/`read` return `EINTR`, which readers
//! and writers treat as a normal request to terminate.

use std::io;
use std::sync::Once;

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

/// Kernel-level thread id usable with [`kick`].
pub type ThreadId = libc::pthread_t;

extern "C" fn wakeup_handler(_: libc::c_int) {}

static INSTALL: Once = Once::new();

/// Install the process-wide no-op SIGUSR1 handler. Installed without
/// SA_RESTART so interrupted syscalls actually return `EINTR` instead of
/// being restarted behind our back. Idempotent.
pub fn install_wakeup_handler() {
    INSTALL.call_once(|| {
        let action = SigAction::new(
            SigHandler::Handler(wakeup_handler),
            SaFlags::empty(),
            SigSet::empty(),
        );
        // Safety: the handler is async-signal-safe (it does nothing).
        if let Err(e) = unsafe { sigaction(Signal::SIGUSR1, &action) } {
            tracing::warn!(error = %e, "failed to install SIGUSR1 wakeup handler");
        }
    });
}

/// The calling thread's kernel-level id, to be stored where a cancel hook
/// can find it.
pub fn current_thread() -> ThreadId {
    unsafe { libc::pthread_self() }
}

/// Kick a thread out of a blocking syscall. Only ever call this with a
/// thread id whose owner is still alive; the chain guarantees that by
/// clearing stored ids before threads exit.
pub fn kick(thread: ThreadId) -> io::Result<()> {
    let rc = unsafe { libc::pthread_kill(thread, libc::SIGUSR1) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

/// Classify an I/O error as the normal termination path: `EINTR` (kicked)
/// or `EBADF` (fd closed under us by a cancel hook).
pub fn is_termination(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EINTR) | Some(libc::EBADF)
    )
}
