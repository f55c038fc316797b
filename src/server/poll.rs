//! Readiness array for `poll(2)`.
//!
//! Slot 0 always holds the listening socket. A slot whose descriptor is
//! [`DUMMY_FD`] is skipped by the kernel and never reported ready.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Descriptor value that excludes a slot from polling.
pub const DUMMY_FD: RawFd = -1;

/// Slot reserved for the listening socket.
pub const LISTENER_SLOT: usize = 0;

/// Events every slot is armed with.
const ARMED_EVENTS: libc::c_short = libc::POLLIN | libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;

/// Outcome of a readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Number of slots with pending events.
    Ready(usize),
    /// The timeout expired.
    Timeout,
    /// A signal interrupted the wait.
    Interrupted,
}

/// Ordered `pollfd` array.
pub struct PollSet {
    fds: Vec<libc::pollfd>,
}

impl PollSet {
    /// Create a set whose slot 0 is the listening socket.
    pub fn new(listener: RawFd, capacity: usize) -> Self {
        let mut fds = Vec::with_capacity(capacity.max(1));
        fds.push(entry(listener));
        Self { fds }
    }

    /// Append a slot and return its index.
    pub fn push(&mut self, fd: RawFd) -> usize {
        self.fds.push(entry(fd));
        self.fds.len() - 1
    }

    /// Drop every slot except the listener.
    pub fn truncate_to_listener(&mut self) {
        self.fds.truncate(LISTENER_SLOT + 1);
    }

    /// Keep only the slots for which `keep` returns true, preserving order.
    ///
    /// The listener slot is always kept. Returns the number of removed slots.
    pub fn retain<F: FnMut(RawFd) -> bool>(&mut self, mut keep: F) -> usize {
        let before = self.fds.len();
        let mut index = 0;
        self.fds.retain(|pfd| {
            let kept = index == LISTENER_SLOT || keep(pfd.fd);
            index += 1;
            kept
        });
        before - self.fds.len()
    }

    /// Replace the descriptor at `slot`, clearing stale events.
    pub fn set_fd(&mut self, slot: usize, fd: RawFd) {
        let pfd = &mut self.fds[slot];
        pfd.fd = fd;
        pfd.revents = 0;
    }

    /// Exclude `slot` from polling.
    pub fn disarm(&mut self, slot: usize) {
        self.set_fd(slot, DUMMY_FD);
    }

    /// Descriptor currently stored at `slot`.
    pub fn fd(&self, slot: usize) -> RawFd {
        self.fds[slot].fd
    }

    /// Events returned for `slot` by the last wait.
    pub fn revents(&self, slot: usize) -> libc::c_short {
        self.fds[slot].revents
    }

    /// True if the last wait reported plain read readiness and nothing else.
    pub fn is_readable_only(&self, slot: usize) -> bool {
        self.fds[slot].revents == libc::POLLIN
    }

    /// Number of slots, listener included.
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    /// Block until a slot is ready, the timeout expires, or a signal arrives.
    ///
    /// `None` waits indefinitely.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Wait> {
        let timeout_ms = match timeout {
            Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
            None => -1,
        };
        // SAFETY: the pointer and length describe our own initialized
        // pollfd vector, which outlives the call.
        let rc = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Wait::Interrupted);
            }
            return Err(err);
        }
        Ok(match rc {
            0 => Wait::Timeout,
            n => Wait::Ready(n as usize),
        })
    }
}

fn entry(fd: RawFd) -> libc::pollfd {
    libc::pollfd {
        fd,
        events: ARMED_EVENTS,
        revents: 0,
    }
}

/// True if a poll error means the set outgrew the descriptor limit.
pub fn is_exhaustion(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINVAL)
}
