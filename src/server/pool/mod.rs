//! Worker-pool echo server.
//!
//! One dispatcher thread owns the listening socket, the connection table and
//! the readiness array. It hands read readiness to a fixed pool of workers
//! through a broadcast queue; workers read, queue the echo, write it, and
//! give the connection back through the re-arm inbox.
//!
//! Lock order: table lock, then per-connection lock. The job queue lock is
//! never held together with either.

mod connection;
mod dispatcher;
mod table;
mod worker;

pub use connection::Connection;
pub use dispatcher::Dispatcher;
pub use worker::{Job, WorkerPool};

use crate::config::Config;
use crate::error::ServerError;
use crate::queue::BroadcastQueue;
use crate::server::StopHandle;
use parking_lot::{Mutex, MutexGuard};
use std::net::TcpListener;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// State shared by the dispatcher and every worker.
pub struct Shared {
    pub(crate) jobs: BroadcastQueue<Job>,
    /// Table lock. Guards structural table changes and holds connections
    /// workers returned to `Idle` until the dispatcher re-arms them.
    rearmed: Mutex<Vec<Arc<Connection>>>,
    garbage: AtomicUsize,
    max_message_size: usize,
}

impl Shared {
    pub fn new(queue_capacity: usize, max_message_size: usize) -> Self {
        Self {
            jobs: BroadcastQueue::with_capacity(queue_capacity),
            rearmed: Mutex::new(Vec::new()),
            garbage: AtomicUsize::new(0),
            max_message_size,
        }
    }

    pub(crate) fn lock_table(&self) -> MutexGuard<'_, Vec<Arc<Connection>>> {
        self.rearmed.lock()
    }

    /// Queue an `Idle` connection for re-arming by the dispatcher.
    pub fn rearm(&self, conn: Arc<Connection>) {
        self.lock_table().push(conn);
    }

    /// Take every connection waiting to be re-armed.
    pub fn take_rearmed(&self) -> Vec<Arc<Connection>> {
        std::mem::take(&mut *self.lock_table())
    }

    /// Close a connection and count it as garbage.
    pub fn close(&self, conn: &Connection) -> bool {
        conn.close(&self.garbage)
    }

    /// Closed connections not yet collected.
    pub fn garbage(&self) -> usize {
        self.garbage.load(Ordering::Acquire)
    }

    /// Subtract collected connections from the garbage counter.
    ///
    /// Fails with the current count if it is smaller than `removed`.
    pub(crate) fn release_garbage(&self, removed: usize) -> Result<(), usize> {
        self.garbage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(removed)
            })
            .map(|_| ())
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

/// Serve on an already bound listener until `stop` is triggered.
pub fn serve(listener: TcpListener, config: &Config, stop: &StopHandle) -> Result<(), ServerError> {
    stop.attach_listener(listener.as_raw_fd());

    let shared = Arc::new(Shared::new(config.queue_capacity, config.max_message_size));
    let pool = match WorkerPool::start(config.workers, &shared) {
        Ok(pool) => pool,
        Err(e) => {
            stop.detach_listener();
            return Err(e);
        }
    };

    info!(
        workers = pool.len(),
        queue_capacity = config.queue_capacity,
        gc_threshold = config.gc_threshold,
        "Worker-pool server running"
    );

    let mut dispatcher = Dispatcher::new(
        listener,
        Arc::clone(&shared),
        stop.clone(),
        config.gc_threshold,
        Duration::from_millis(config.poll_timeout_ms),
        config.expected_connections,
    );
    let result = dispatcher.run();

    info!(connections = dispatcher.connections(), "Dispatcher stopped");
    pool.shutdown();
    stop.detach_listener();
    drop(dispatcher);
    info!("Server stopped");
    result
}
