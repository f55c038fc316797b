//! echo-pool: TCP echo servers
//!
//! Every byte a client sends is written back to it. Three concurrency
//! architectures are available:
//! - Worker pool: one poll dispatcher feeding a fixed set of worker threads
//! - Simple: a single-threaded poll loop
//! - Threaded: one thread per connection
//!
//! Configuration via CLI arguments or TOML file.

mod config;
mod error;
mod net;
mod queue;
mod server;

use config::Config;
use server::StopHandle;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("echo-pool: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .init();

    info!(
        listen = %config.listen,
        server = ?config.server,
        workers = config.workers,
        queue_capacity = config.queue_capacity,
        gc_threshold = config.gc_threshold,
        max_message_size = config.max_message_size,
        "Starting echo-pool server"
    );

    match net::raise_nofile_limit() {
        Ok(limit) => info!(limit, "Raised open file limit"),
        Err(e) => warn!(error = %e, "Failed to raise open file limit"),
    }

    let stop = StopHandle::new();
    if let Err(e) = stop.install_signal_handler() {
        error!(error = %e, "Failed to install interrupt handler");
        return ExitCode::FAILURE;
    }

    match server::run(&config, &stop) {
        Ok(()) => {
            info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Server failed");
            ExitCode::FAILURE
        }
    }
}
