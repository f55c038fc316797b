//! Echo server with one OS thread per connection.

use crate::config::Config;
use crate::error::ServerError;
use crate::net;
use crate::server::StopHandle;
use slab::Slab;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

/// Handler threads of live connections, keyed by connection id.
struct HandlerRegistry {
    handlers: Slab<JoinHandle<()>>,
}

impl HandlerRegistry {
    fn new(capacity: usize) -> Self {
        Self {
            handlers: Slab::with_capacity(capacity),
        }
    }

    /// Forget handlers whose connection has ended.
    fn prune(&mut self) -> usize {
        let before = self.handlers.len();
        self.handlers.retain(|_, handle| !handle.is_finished());
        before - self.handlers.len()
    }

    fn len(&self) -> usize {
        self.handlers.len()
    }
}

/// Serve on an already bound listener until `stop` is triggered.
///
/// Handlers still serving a client at shutdown are left running; each
/// exits when its peer disconnects.
pub fn serve(listener: TcpListener, config: &Config, stop: &StopHandle) -> Result<(), ServerError> {
    stop.attach_listener(listener.as_raw_fd());
    let mut registry = HandlerRegistry::new(config.expected_connections);
    info!("Thread-per-connection server running");

    let result = accept_loop(&listener, config, stop, &mut registry);

    registry.prune();
    if registry.len() > 0 {
        info!(active = registry.len(), "Leaving connection handlers running");
    }
    stop.detach_listener();
    info!("Server stopped");
    result
}

fn accept_loop(
    listener: &TcpListener,
    config: &Config,
    stop: &StopHandle,
    registry: &mut HandlerRegistry,
) -> Result<(), ServerError> {
    while stop.is_running() {
        let (stream, addr) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if !stop.is_running() {
                    break;
                }
                error!(error = %e, "Accept failed");
                return Err(ServerError::Accept(e));
            }
        };

        let name = net::peer_name(&addr);
        debug!(peer = %name, "New connection");

        let pruned = registry.prune();
        if pruned > 0 {
            trace!(pruned, "Pruned finished handlers");
        }

        let entry = registry.handlers.vacant_entry();
        let id = entry.key();
        let max_message_size = config.max_message_size;
        match thread::Builder::new()
            .name(format!("client-{id}"))
            .spawn(move || handle_client(stream, &name, max_message_size))
        {
            Ok(handle) => {
                entry.insert(handle);
            }
            // The stream moved into the failed closure and is closed with it
            Err(e) => warn!(peer = %addr, error = %e, "Failed to start connection handler"),
        }
    }
    Ok(())
}

/// Echo until the peer closes or an I/O error occurs.
fn handle_client(stream: TcpStream, name: &str, max_message_size: usize) {
    loop {
        let message = match net::read_message(&stream, max_message_size) {
            Ok(message) if message.is_empty() => break,
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %name, error = %e, "Failed to read");
                break;
            }
        };
        trace!(peer = %name, len = message.len(), "Read message");

        if let Err(e) = net::write_message(&stream, &message) {
            warn!(peer = %name, error = %e, "Failed to write");
            break;
        }
    }
    debug!(peer = %name, "Connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::bind_listener;
    use std::io::{Read, Write};
    use std::net::Shutdown;
    use std::time::Duration;

    #[test]
    fn test_echo_per_thread() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 128).unwrap();
        let addr = listener.local_addr().unwrap();
        let stop = StopHandle::new();
        let handle = {
            let stop = stop.clone();
            let config = Config::default();
            thread::spawn(move || serve(listener, &config, &stop))
        };

        let mut clients: Vec<_> = (0..4).map(|_| TcpStream::connect(addr).unwrap()).collect();
        for (i, client) in clients.iter_mut().enumerate() {
            let msg = format!("hello {i}");
            client.write_all(msg.as_bytes()).unwrap();
            let mut buf = vec![0u8; msg.len()];
            client.read_exact(&mut buf).unwrap();
            assert_eq!(buf, msg.as_bytes());
        }

        clients[0].shutdown(Shutdown::Write).unwrap();
        clients[0]
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(clients[0].read(&mut buf).unwrap(), 0);

        stop.stop();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_registry_prunes_finished() {
        let mut registry = HandlerRegistry::new(4);
        registry.handlers.insert(thread::spawn(|| {}));
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        registry.handlers.insert(thread::spawn(move || {
            let _ = rx.recv();
        }));

        thread::sleep(Duration::from_millis(50));
        assert_eq!(registry.prune(), 1);
        assert_eq!(registry.len(), 1);

        drop(tx);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(registry.prune(), 1);
        assert_eq!(registry.len(), 0);
    }
}
