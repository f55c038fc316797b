//! Errors that stop a server.
//!
//! Per-connection failures never show up here: they close the connection
//! and stay inside the thread that saw them.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to set up listening socket on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("readiness wait failed: {0}")]
    Poll(#[source] io::Error),

    #[error("listening socket reported {revents:#x}")]
    Listener { revents: i16 },

    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    #[error("failed to start worker {id}: {source}")]
    Spawn {
        id: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to install interrupt handler: {0}")]
    Signal(#[from] ctrlc::Error),

    #[error("garbage collector removed {removed} entries but counted {counted}")]
    GcMismatch { counted: usize, removed: usize },
}
