//! Dispatcher loop: the only thread touching the readiness array.
//!
//! Each cycle re-arms connections returned by workers, waits for readiness
//! with a short timeout, accepts at most one new client, hands ready
//! clients to the worker pool and finally gives the garbage collector a
//! chance to run. It never performs client I/O itself.

use super::table::ConnectionTable;
use super::Shared;
use crate::error::ServerError;
use crate::net;
use crate::server::poll::{self, Wait};
use crate::server::StopHandle;
use std::io;
use std::net::TcpListener;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Repeated descriptor-exhaustion failures between two warnings.
const EXHAUSTION_WARN_EVERY: u64 = 1000;

pub struct Dispatcher {
    listener: TcpListener,
    table: ConnectionTable,
    shared: Arc<Shared>,
    stop: StopHandle,
    poll_timeout: Duration,
    exhaustion: ExhaustionStreak,
}

/// Consecutive accepts that failed for lack of descriptors.
///
/// The listener stays readable while the limit is hit, so every cycle
/// fails the same way; only the first failure and every
/// `EXHAUSTION_WARN_EVERY`-th repeat are worth a warning.
#[derive(Debug, Default)]
struct ExhaustionStreak {
    failures: u64,
}

impl ExhaustionStreak {
    /// Count a failure; returns whether it should be reported as a warning.
    fn record(&mut self) -> bool {
        self.failures += 1;
        self.failures % EXHAUSTION_WARN_EVERY == 1
    }

    /// End the streak, returning its length.
    fn reset(&mut self) -> u64 {
        std::mem::take(&mut self.failures)
    }
}

/// What the dispatcher should do after an accept attempt.
enum Accepted {
    Continue,
    Stop,
}

impl Dispatcher {
    pub fn new(
        listener: TcpListener,
        shared: Arc<Shared>,
        stop: StopHandle,
        gc_threshold: usize,
        poll_timeout: Duration,
        expected_connections: usize,
    ) -> Self {
        let table = ConnectionTable::new(
            listener.as_raw_fd(),
            Arc::clone(&shared),
            gc_threshold,
            expected_connections,
        );
        Self {
            listener,
            table,
            shared,
            stop,
            poll_timeout,
            exhaustion: ExhaustionStreak::default(),
        }
    }

    /// Run until stopped or a fatal error occurs.
    pub fn run(&mut self) -> Result<(), ServerError> {
        while self.stop.is_running() {
            self.table.apply_rearms();

            let mut ready = match self.table.wait(self.poll_timeout) {
                Ok(Wait::Ready(n)) => n,
                Ok(Wait::Timeout) => {
                    self.table.collect_garbage(false)?;
                    continue;
                }
                Ok(Wait::Interrupted) => continue,
                Err(e) if poll::is_exhaustion(&e) => {
                    self.reclaim_slots(e)?;
                    continue;
                }
                Err(e) => {
                    if !self.stop.is_running() {
                        break;
                    }
                    error!(error = %e, "Readiness wait failed");
                    return Err(ServerError::Poll(e));
                }
            };

            let revents = self.table.listener_revents();
            if revents != 0 {
                ready -= 1;
                if revents != libc::POLLIN {
                    if self.stop.is_running() {
                        error!(revents, "Listening socket failed");
                        return Err(ServerError::Listener { revents });
                    }
                    info!("Listening socket closed");
                    break;
                }
                if let Accepted::Stop = self.accept()? {
                    break;
                }
            }

            self.table.dispatch(ready);
            self.table.collect_garbage(false)?;
        }
        Ok(())
    }

    /// Number of connections currently tracked.
    pub fn connections(&self) -> usize {
        self.table.len()
    }

    /// Poll refused the array size: reclaim closed slots or give up.
    fn reclaim_slots(&mut self, e: io::Error) -> Result<(), ServerError> {
        if self.shared.garbage() > 0 {
            warn!(slots = self.table.len() + 1, "Readiness array too large, forcing GC");
            if self.table.collect_garbage(true)? > 0 {
                return Ok(());
            }
        }
        error!(error = %e, "Ran out of file descriptors for polling");
        Err(ServerError::Poll(e))
    }

    fn accept(&mut self) -> Result<Accepted, ServerError> {
        match self.listener.accept() {
            Ok((stream, addr)) => {
                let failures = self.exhaustion.reset();
                if failures > 0 {
                    info!(failures, "Accepting again after running out of descriptors");
                }
                // BSD-derived systems let accepted sockets inherit O_NONBLOCK
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!(error = %e, "Failed to make client socket blocking");
                }
                let name = net::peer_name(&addr);
                debug!(peer = %name, "New connection");
                self.table.insert(stream, name);
                Ok(Accepted::Continue)
            }
            Err(e) if is_fd_exhaustion(&e) => {
                if self.exhaustion.record() {
                    warn!(
                        error = %e,
                        failures = self.exhaustion.failures,
                        "Out of descriptors, accept retrying"
                    );
                } else {
                    debug!(error = %e, "Accept still out of descriptors");
                }
                if self.shared.garbage() > 0 {
                    self.table.collect_garbage(true)?;
                }
                Ok(Accepted::Continue)
            }
            Err(e) if is_transient_accept(&e) => {
                warn!(error = %e, "Accept failed, retrying");
                Ok(Accepted::Continue)
            }
            Err(e) => {
                if !self.stop.is_running() {
                    info!("Listening socket closed");
                    return Ok(Accepted::Stop);
                }
                error!(error = %e, "Accept failed");
                Err(ServerError::Accept(e))
            }
        }
    }
}

fn is_fd_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

fn is_transient_accept(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    ) || is_fd_exhaustion(e)
        || matches!(e.raw_os_error(), Some(libc::ENOBUFS) | Some(libc::ENOMEM))
}
