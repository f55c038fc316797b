//! Client connection state machine for the worker-pool server.
//!
//! ```text
//!  accept ──► Idle ──(dispatcher)──► Read ──(worker)──► Write ──(worker)──┐
//!              ▲                                                          │
//!              └──────────────────────────────────────────────────────────┘
//!  any I/O error, EOF or invalid state ──► Closed ──(GC)──► dropped
//! ```
//!
//! State and poll-slot index live behind a per-connection lock, separate
//! from the table lock, so workers never contend with the dispatcher over
//! unrelated connections.

use parking_lot::Mutex;
use std::fmt;
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the dispatcher to see read readiness.
    Idle,
    /// A worker owns the connection and is reading.
    Read,
    /// A worker owns the connection and is writing the echo.
    Write,
    /// Shut down, waiting for the garbage collector.
    Closed,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnState::Idle => "IDLE",
            ConnState::Read => "READ",
            ConnState::Write => "WRITE",
            ConnState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct Guarded {
    state: ConnState,
    slot: usize,
}

/// A single accepted client.
///
/// Shared as `Arc<Connection>` between the table and in-flight jobs; the
/// socket is released when the last reference goes away.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    fd: RawFd,
    name: String,
    guarded: Mutex<Guarded>,
}

impl Connection {
    /// Wrap a freshly accepted stream in `Idle` state at `slot`.
    pub fn new(stream: TcpStream, name: String, slot: usize) -> Self {
        let fd = stream.as_raw_fd();
        Self {
            stream,
            fd,
            name,
            guarded: Mutex::new(Guarded {
                state: ConnState::Idle,
                slot,
            }),
        }
    }

    /// Socket used for the echo I/O.
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Raw descriptor written into the readiness array.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Peer `ip:port`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnState {
        self.guarded.lock().state
    }

    /// Current index in the readiness array.
    pub fn slot(&self) -> usize {
        self.guarded.lock().slot
    }

    /// Move `from` → `to` atomically.
    ///
    /// Fails with the actual state if the connection is not in `from`.
    pub fn transition(&self, from: ConnState, to: ConnState) -> Result<(), ConnState> {
        let mut guarded = self.guarded.lock();
        if guarded.state != from {
            return Err(guarded.state);
        }
        guarded.state = to;
        Ok(())
    }

    /// Mark the connection closed and shut the socket down.
    ///
    /// Idempotent: closing twice only logs a warning. Returns whether this
    /// call performed the close; `garbage` is bumped exactly once.
    pub fn close(&self, garbage: &AtomicUsize) -> bool {
        {
            let mut guarded = self.guarded.lock();
            if guarded.state == ConnState::Closed {
                warn!(peer = %self.name, "Tried to close a closed connection");
                return false;
            }
            guarded.state = ConnState::Closed;
            if let Err(e) = self.stream.shutdown(Shutdown::Both) {
                if e.kind() != std::io::ErrorKind::NotConnected {
                    debug!(peer = %self.name, error = %e, "Socket shutdown failed");
                }
            }
            garbage.fetch_add(1, Ordering::AcqRel);
        }
        debug!(peer = %self.name, "Connection closed");
        true
    }

    /// Run `f` with the lock held, giving access to state and slot.
    ///
    /// Used by the garbage collector to read the state and store the new
    /// slot index in one critical section.
    pub(super) fn with_slot<R>(&self, f: impl FnOnce(ConnState, &mut usize) -> R) -> R {
        let mut guarded = self.guarded.lock();
        let Guarded { state, slot } = &mut *guarded;
        f(*state, slot)
    }
}
