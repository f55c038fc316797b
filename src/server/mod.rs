//! Echo server variants.
//!
//! All variants share the same wire contract: whatever a single read
//! returns is written back verbatim; EOF or any I/O error closes the
//! connection.
//!
//! - `pool`: poll dispatcher feeding a fixed worker pool (default)
//! - `simple`: single-threaded poll loop
//! - `threaded`: one thread per connection

pub mod poll;
pub mod pool;
mod shutdown;
pub mod simple;
pub mod threaded;

pub use shutdown::StopHandle;

use crate::config::{Config, ServerKind};
use crate::error::ServerError;
use crate::net;
use std::net::TcpListener;
use tracing::{error, info};

/// Bind the configured address and run the selected server until stopped.
pub fn run(config: &Config, stop: &StopHandle) -> Result<(), ServerError> {
    let listener = net::bind_listener(config.listen, config.backlog).map_err(|source| {
        error!(addr = %config.listen, error = %source, "Failed to set up listening socket");
        ServerError::Bind {
            addr: config.listen,
            source,
        }
    })?;
    info!(addr = %config.listen, kind = ?config.server, "Listening");

    serve(listener, config, stop)
}

/// Run the selected server on an already bound listener.
pub fn serve(listener: TcpListener, config: &Config, stop: &StopHandle) -> Result<(), ServerError> {
    match config.server {
        ServerKind::Pool => pool::serve(listener, config, stop),
        ServerKind::Simple => simple::serve(listener, config, stop),
        ServerKind::Threaded => threaded::serve(listener, config, stop),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::thread;

    #[test]
    fn test_every_kind_echoes() {
        for kind in [ServerKind::Pool, ServerKind::Simple, ServerKind::Threaded] {
            let config = Config {
                listen: "127.0.0.1:0".parse().unwrap(),
                server: kind,
                workers: 2,
                ..Config::default()
            };
            let listener = net::bind_listener(config.listen, config.backlog).unwrap();
            let addr = listener.local_addr().unwrap();
            let stop = StopHandle::new();
            let handle = {
                let stop = stop.clone();
                thread::spawn(move || serve(listener, &config, &stop))
            };

            let mut client = TcpStream::connect(addr).unwrap();
            client.write_all(b"ping").unwrap();
            let mut buf = [0u8; 4];
            client.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"ping", "{kind:?}");

            stop.stop();
            handle.join().unwrap().unwrap();
        }
    }

    #[test]
    fn test_bind_failure_is_reported() {
        let taken = net::bind_listener("127.0.0.1:0".parse().unwrap(), 1).unwrap();
        // Without SO_REUSEPORT a second listener on the same port fails
        let config = Config {
            listen: taken.local_addr().unwrap(),
            ..Config::default()
        };
        match run(&config, &StopHandle::new()) {
            Err(ServerError::Bind { addr, .. }) => assert_eq!(addr, config.listen),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
