//! Stop flag shared between the interrupt handler and a running server.

use crate::error::ServerError;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

const NO_LISTENER: RawFd = -1;

struct Inner {
    stopping: AtomicBool,
    listener_fd: AtomicI32,
}

/// Cloneable handle used to request a server stop.
///
/// Stopping only flips an atomic flag and shuts down the attached listening
/// socket so a blocked `poll`/`accept` returns. Servers check
/// [`StopHandle::is_running`] at the head of their loops.
#[derive(Clone)]
pub struct StopHandle {
    inner: Arc<Inner>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                stopping: AtomicBool::new(false),
                listener_fd: AtomicI32::new(NO_LISTENER),
            }),
        }
    }

    /// True until the first `stop`.
    pub fn is_running(&self) -> bool {
        !self.inner.stopping.load(Ordering::Acquire)
    }

    /// Register the listening socket that `stop` should shut down.
    pub fn attach_listener(&self, fd: RawFd) {
        self.inner.listener_fd.store(fd, Ordering::Release);
    }

    /// Forget the listening socket before it is closed.
    pub fn detach_listener(&self) {
        self.inner.listener_fd.store(NO_LISTENER, Ordering::Release);
    }

    /// Request a stop.
    ///
    /// Returns `false` if a stop was already in progress.
    pub fn stop(&self) -> bool {
        if self.inner.stopping.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!("Server stop requested");

        let fd = self.inner.listener_fd.load(Ordering::Acquire);
        if fd == NO_LISTENER {
            warn!("Listening socket is not set");
            return true;
        }
        // SAFETY: shutdown on a descriptor has no memory-safety requirements;
        // a stale descriptor only yields an error.
        if unsafe { libc::shutdown(fd, libc::SHUT_RDWR) } != 0 {
            let err = std::io::Error::last_os_error();
            // BSDs report ENOTCONN for listeners; waiters still wake up
            if err.raw_os_error() != Some(libc::ENOTCONN) {
                warn!(error = %err, "Failed to shut down listening socket");
            }
        }
        true
    }

    /// Route SIGINT to `stop`; a second SIGINT exits immediately.
    ///
    /// Can be installed once per process.
    pub fn install_signal_handler(&self) -> Result<(), ServerError> {
        let handle = self.clone();
        ctrlc::set_handler(move || {
            if !handle.stop() {
                warn!("Server force stop");
                std::process::exit(1);
            }
        })?;
        Ok(())
    }
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}
