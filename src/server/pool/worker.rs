//! Fixed pool of worker threads performing the blocking echo I/O.
//!
//! A worker owns a connection from the moment it pops its job until it
//! either closes it or hands it back to the dispatcher in `Idle` state.

use super::connection::{ConnState, Connection};
use super::Shared;
use crate::error::ServerError;
use crate::net;
use crate::queue::Signal;
use bytes::Bytes;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace, warn};

/// Unit of work for one connection phase.
#[derive(Debug)]
pub struct Job {
    pub conn: Arc<Connection>,
    /// Echo payload; empty for read jobs.
    pub message: Bytes,
}

impl Job {
    pub fn read(conn: Arc<Connection>) -> Self {
        Self {
            conn,
            message: Bytes::new(),
        }
    }

    pub fn write(conn: Arc<Connection>, message: Bytes) -> Self {
        Self { conn, message }
    }
}

/// Running worker threads.
///
/// Creating the pool registers it as the job queue's publisher; dropping
/// the publication on `shutdown` poisons the queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl WorkerPool {
    /// Start `count` workers.
    ///
    /// If a thread cannot be spawned, the already running workers are
    /// stopped before the error is returned.
    pub fn start(count: usize, shared: &Arc<Shared>) -> Result<Self, ServerError> {
        shared.jobs.publish();
        let mut pool = Self {
            handles: Vec::with_capacity(count),
            shared: Arc::clone(shared),
        };

        debug!(workers = count, "Starting workers");
        for id in 0..count {
            let shared = Arc::clone(shared);
            let spawned = thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || worker_loop(id, &shared));

            match spawned {
                Ok(handle) => pool.handles.push(handle),
                Err(source) => {
                    error!(worker = id, error = %source, "Failed to start worker");
                    pool.shutdown();
                    return Err(ServerError::Spawn { id, source });
                }
            }
        }
        debug!("All workers started");
        Ok(pool)
    }

    /// Number of running workers.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Poison the queue and wait for every worker to exit.
    ///
    /// Jobs queued before the poison are still processed.
    pub fn shutdown(self) {
        debug!("Stopping workers");
        self.shared.jobs.unpublish(true);
        for handle in self.handles {
            if handle.join().is_err() {
                error!("Worker panicked");
            }
        }
        debug!("All workers stopped");
    }
}

fn worker_loop(id: usize, shared: &Shared) {
    shared.jobs.subscribe();
    trace!(worker = id, "Worker started");

    loop {
        match shared.jobs.pop() {
            Signal::Poison => {
                trace!(worker = id, "Worker received poison pill");
                shared.jobs.unsubscribe();
                shared.jobs.relay_poison();
                break;
            }
            Signal::Message(job) => handle_job(job, shared),
        }
    }

    trace!(worker = id, "Worker stopped");
}

/// Run one phase of the echo cycle.
pub(super) fn handle_job(job: Job, shared: &Shared) {
    let Job { conn, message } = job;

    match conn.state() {
        ConnState::Read => match net::read_message(conn.stream(), shared.max_message_size()) {
            Ok(message) if message.is_empty() => {
                trace!(peer = %conn.name(), "Peer closed its side");
                shared.close(&conn);
            }
            Ok(message) => {
                trace!(peer = %conn.name(), len = message.len(), "Read message");
                schedule_write(conn, message, shared);
            }
            Err(e) => {
                warn!(peer = %conn.name(), error = %e, "Failed to read");
                shared.close(&conn);
            }
        },
        ConnState::Write => match net::write_message(conn.stream(), &message) {
            Ok(()) => {
                trace!(peer = %conn.name(), len = message.len(), "Sent message");
                schedule_idle(conn, shared);
            }
            Err(e) => {
                warn!(peer = %conn.name(), error = %e, "Failed to write");
                shared.close(&conn);
            }
        },
        state @ (ConnState::Idle | ConnState::Closed) => {
            warn!(peer = %conn.name(), %state, "Worker got a job for a connection in invalid state");
        }
    }
}

fn schedule_write(conn: Arc<Connection>, message: Bytes, shared: &Shared) {
    if let Err(state) = conn.transition(ConnState::Read, ConnState::Write) {
        warn!(peer = %conn.name(), %state, "Tried to WRITE outside READ");
        return;
    }
    // This thread already owns the connection, so backpressure is skipped
    shared.jobs.push_force(Job::write(conn, message));
}

fn schedule_idle(conn: Arc<Connection>, shared: &Shared) {
    if let Err(state) = conn.transition(ConnState::Write, ConnState::Idle) {
        warn!(peer = %conn.name(), %state, "Tried to go IDLE outside WRITE");
        return;
    }
    shared.rearm(conn);
}
