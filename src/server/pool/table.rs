//! Connection table and readiness array, owned by the dispatcher thread.
//!
//! `connections[i]` always sits at readiness slot `i + 1` once the garbage
//! collector has run; slot 0 is the listener. Between collections closed
//! connections keep their slot (disarmed) so no index moves under a
//! connection that is still in flight.

use super::connection::{ConnState, Connection};
use super::Shared;
use crate::error::ServerError;
use crate::server::poll::{PollSet, Wait, DUMMY_FD, LISTENER_SLOT};
use std::io;
use std::net::TcpStream;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct ConnectionTable {
    listener_fd: RawFd,
    connections: Vec<Arc<Connection>>,
    poll: PollSet,
    shared: Arc<Shared>,
    gc_threshold: usize,
}

impl ConnectionTable {
    pub fn new(listener_fd: RawFd, shared: Arc<Shared>, gc_threshold: usize, capacity: usize) -> Self {
        Self {
            listener_fd,
            connections: Vec::with_capacity(capacity),
            poll: PollSet::new(listener_fd, capacity + 1),
            shared,
            gc_threshold,
        }
    }

    /// Register an accepted stream in `Idle` state with an armed slot.
    pub fn insert(&mut self, stream: TcpStream, name: String) -> Arc<Connection> {
        let _table = self.shared.lock_table();
        let slot = self.poll.len();
        let conn = Arc::new(Connection::new(stream, name, slot));
        let pushed = self.poll.push(conn.fd());
        debug_assert_eq!(pushed, slot);
        self.connections.push(Arc::clone(&conn));
        conn
    }

    /// Number of connections in the table, closed ones included.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    pub fn connections(&self) -> &[Arc<Connection>] {
        &self.connections
    }

    #[cfg(test)]
    pub fn poll_set(&self) -> &PollSet {
        &self.poll
    }

    /// Wait for readiness on every armed slot.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<Wait> {
        self.poll.wait(Some(timeout))
    }

    /// Events reported for the listener by the last wait.
    pub fn listener_revents(&self) -> libc::c_short {
        self.poll.revents(LISTENER_SLOT)
    }

    /// Put connections handed back by workers into the readiness array.
    ///
    /// Returns how many slots were re-armed.
    pub fn apply_rearms(&mut self) -> usize {
        let returned = self.shared.take_rearmed();
        let mut armed = 0;
        for conn in &returned {
            let poll = &mut self.poll;
            conn.with_slot(|state, slot| {
                // Closed in between: the slot stays disarmed until GC
                if state == ConnState::Idle {
                    poll.set_fd(*slot, conn.fd());
                    armed += 1;
                }
            });
        }
        armed
    }

    /// Hand every ready client slot to the worker pool.
    ///
    /// Slots reporting anything besides plain read readiness are closed.
    /// `ready` is the number of ready client slots left after the listener.
    pub fn dispatch(&mut self, mut ready: usize) {
        for conn in &self.connections {
            if ready == 0 {
                break;
            }
            let slot = conn.slot();
            if self.poll.revents(slot) == 0 {
                continue;
            }
            ready -= 1;

            if !self.poll.is_readable_only(slot) {
                debug!(peer = %conn.name(), revents = self.poll.revents(slot), "Closing on poll error");
                self.shared.close(conn);
                self.poll.disarm(slot);
                continue;
            }

            if let Err(state) = conn.transition(ConnState::Idle, ConnState::Read) {
                warn!(peer = %conn.name(), %state, "Read readiness on connection outside IDLE");
                continue;
            }
            // Excluded from polling until the worker finishes the echo
            self.poll.disarm(slot);
            self.shared.jobs.push(super::Job::read(Arc::clone(conn)));
        }
    }

    /// Compact the table, dropping closed connections.
    ///
    /// Runs when the garbage counter reached the threshold, or
    /// unconditionally when `force` is set. Survivors keep their relative
    /// order and get their slot index rewritten to the new position;
    /// connections owned by a worker get a dummy slot. Returns the number
    /// of removed connections.
    pub fn collect_garbage(&mut self, force: bool) -> Result<usize, ServerError> {
        if !force && self.shared.garbage() < self.gc_threshold.max(1) {
            return Ok(0);
        }

        let removed = {
            let _table = self.shared.lock_table();
            let before = self.connections.len();
            self.connections
                .retain(|conn| conn.state() != ConnState::Closed);
            let removed = before - self.connections.len();

            self.poll.truncate_to_listener();
            for (index, conn) in self.connections.iter().enumerate() {
                let poll = &mut self.poll;
                conn.with_slot(|state, slot| {
                    let fd = if state == ConnState::Idle { conn.fd() } else { DUMMY_FD };
                    *slot = poll.push(fd);
                    debug_assert_eq!(*slot, index + 1);
                });
            }
            removed
        };

        // Every closed connection bumped the counter before it could be seen
        // as closed here, so the counter can never fall short.
        self.shared
            .release_garbage(removed)
            .map_err(|counted| ServerError::GcMismatch { counted, removed })?;

        info!(
            removed,
            live = self.connections.len(),
            listener = self.listener_fd,
            "GC cleaned up connections"
        );
        Ok(removed)
    }
}
