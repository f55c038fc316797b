//! Single-threaded echo server multiplexed over one `poll` array.
//!
//! Reads and echoes happen inline on the polling thread. Closed clients
//! leave a dummy slot and an empty name behind; the garbage collector
//! removes both once enough have accumulated.

use crate::config::Config;
use crate::error::ServerError;
use crate::net;
use crate::server::poll::{self, PollSet, Wait, DUMMY_FD, LISTENER_SLOT};
use crate::server::StopHandle;
use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Name kept for the listener slot so that an empty name always means garbage.
const LISTENER_NAME: &str = "listener";

struct SimpleServer {
    listener: TcpListener,
    poll: PollSet,
    /// Peer names parallel to the readiness array.
    names: Vec<String>,
    /// Open client sockets by descriptor.
    streams: HashMap<RawFd, TcpStream>,
    garbage: usize,
    gc_threshold: usize,
    max_message_size: usize,
}

/// Serve on an already bound listener until `stop` is triggered.
pub fn serve(listener: TcpListener, config: &Config, stop: &StopHandle) -> Result<(), ServerError> {
    stop.attach_listener(listener.as_raw_fd());
    let mut server = SimpleServer::new(listener, config);
    info!(gc_threshold = server.gc_threshold, "Single-threaded server running");

    let result = server.run(stop, Duration::from_millis(config.poll_timeout_ms));

    stop.detach_listener();
    info!("Server stopped");
    result
}

impl SimpleServer {
    fn new(listener: TcpListener, config: &Config) -> Self {
        let capacity = config.expected_connections + 1;
        let mut names = Vec::with_capacity(capacity);
        names.push(LISTENER_NAME.to_string());
        Self {
            poll: PollSet::new(listener.as_raw_fd(), capacity),
            listener,
            names,
            streams: HashMap::with_capacity(capacity),
            garbage: 0,
            gc_threshold: config.gc_threshold,
            max_message_size: config.max_message_size,
        }
    }

    fn run(&mut self, stop: &StopHandle, timeout: Duration) -> Result<(), ServerError> {
        while stop.is_running() {
            let mut ready = match self.poll.wait(Some(timeout)) {
                Ok(Wait::Ready(n)) => n,
                Ok(Wait::Timeout) | Ok(Wait::Interrupted) => continue,
                Err(e) => {
                    if !stop.is_running() {
                        break;
                    }
                    if poll::is_exhaustion(&e) {
                        error!(error = %e, "Ran out of file descriptors for polling");
                    } else {
                        error!(error = %e, "Readiness wait failed");
                    }
                    return Err(ServerError::Poll(e));
                }
            };

            let revents = self.poll.revents(LISTENER_SLOT);
            if revents != 0 {
                ready -= 1;
                if revents != libc::POLLIN {
                    if stop.is_running() {
                        error!(revents, "Listening socket failed");
                        return Err(ServerError::Listener { revents });
                    }
                    info!("Listening socket closed");
                    break;
                }
                if let Err(e) = self.accept() {
                    if !stop.is_running() {
                        info!("Listening socket closed");
                        break;
                    }
                    error!(error = %e, "Accept failed");
                    return Err(ServerError::Accept(e));
                }
            }

            let mut slot = LISTENER_SLOT + 1;
            while slot < self.poll.len() && ready > 0 {
                if self.poll.revents(slot) != 0 {
                    ready -= 1;
                    if self.poll.is_readable_only(slot) {
                        self.echo(slot);
                    } else {
                        self.close(slot);
                    }
                }
                slot += 1;
            }

            if let Err(e) = self.collect_garbage() {
                error!(error = %e, "Critical bug in garbage collector");
                return Err(e);
            }
        }
        Ok(())
    }

    fn accept(&mut self) -> std::io::Result<()> {
        let (stream, addr) = self.listener.accept()?;
        stream.set_nonblocking(false)?;
        let name = net::peer_name(&addr);
        debug!(peer = %name, "New connection");

        self.poll.push(stream.as_raw_fd());
        self.names.push(name);
        self.streams.insert(stream.as_raw_fd(), stream);
        Ok(())
    }

    fn echo(&mut self, slot: usize) {
        let fd = self.poll.fd(slot);
        let Some(stream) = self.streams.get(&fd) else {
            warn!(slot, "Ready slot without a socket");
            self.close(slot);
            return;
        };

        let message = match net::read_message(stream, self.max_message_size) {
            Ok(message) if message.is_empty() => {
                self.close(slot);
                return;
            }
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %self.names[slot], error = %e, "Failed to read");
                self.close(slot);
                return;
            }
        };
        trace!(peer = %self.names[slot], len = message.len(), "Read message");

        if let Err(e) = net::write_message(stream, &message) {
            warn!(peer = %self.names[slot], error = %e, "Failed to write");
            self.close(slot);
        }
    }

    fn close(&mut self, slot: usize) {
        let fd = self.poll.fd(slot);
        if fd == DUMMY_FD {
            warn!(slot, "Tried to close a closed connection");
            return;
        }
        // Dropping the stream closes the descriptor
        self.streams.remove(&fd);
        debug!(peer = %self.names[slot], "Connection closed");
        self.poll.disarm(slot);
        self.names[slot].clear();
        self.garbage += 1;
    }

    /// Drop dummy slots and empty names once the threshold is reached.
    ///
    /// Both arrays must shrink by exactly the garbage count; anything else
    /// means the two got out of step.
    fn collect_garbage(&mut self) -> Result<usize, ServerError> {
        if self.garbage < self.gc_threshold.max(1) {
            return Ok(0);
        }

        let removed_slots = self.poll.retain(|fd| fd != DUMMY_FD);
        let names_before = self.names.len();
        self.names.retain(|name| !name.is_empty());
        let removed_names = names_before - self.names.len();

        let counted = std::mem::take(&mut self.garbage);
        if removed_slots != counted || removed_names != counted {
            return Err(ServerError::GcMismatch {
                counted,
                removed: removed_slots.max(removed_names),
            });
        }
        info!(removed = counted, live = self.streams.len(), "GC cleaned up connections");
        Ok(counted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::bind_listener;
    use std::io::{Read, Write};
    use std::net::{Shutdown, SocketAddr};
    use std::thread;

    fn test_config() -> Config {
        Config {
            gc_threshold: 3,
            ..Config::default()
        }
    }

    fn start(config: Config) -> (SocketAddr, StopHandle, thread::JoinHandle<Result<(), ServerError>>) {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 128).unwrap();
        let addr = listener.local_addr().unwrap();
        let stop = StopHandle::new();
        let handle = {
            let stop = stop.clone();
            thread::spawn(move || serve(listener, &config, &stop))
        };
        (addr, stop, handle)
    }

    fn echo(client: &mut TcpStream, msg: &[u8]) -> Vec<u8> {
        client.write_all(msg).unwrap();
        let mut buf = vec![0u8; msg.len()];
        client.read_exact(&mut buf).unwrap();
        buf
    }

    /// Server with `n` accepted clients, driven by hand.
    fn server_with_clients(n: usize, gc_threshold: usize) -> (SimpleServer, Vec<TcpStream>) {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = listener.local_addr().unwrap();
        let mut server = SimpleServer::new(
            listener,
            &Config {
                gc_threshold,
                ..Config::default()
            },
        );
        let clients = (0..n)
            .map(|_| {
                let client = TcpStream::connect(addr).unwrap();
                server.accept().unwrap();
                client
            })
            .collect();
        (server, clients)
    }

    #[test]
    fn test_echo_and_half_close() {
        let (addr, stop, handle) = start(test_config());
        let mut client = TcpStream::connect(addr).unwrap();
        assert_eq!(echo(&mut client, b"ping"), b"ping");

        client.shutdown(Shutdown::Write).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(client.read(&mut buf).unwrap(), 0);

        stop.stop();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_serves_through_gc_passes() {
        let (addr, stop, handle) = start(test_config());
        let mut survivor = TcpStream::connect(addr).unwrap();

        for i in 0..7 {
            let mut client = TcpStream::connect(addr).unwrap();
            let msg = format!("msg {i}");
            assert_eq!(echo(&mut client, msg.as_bytes()), msg.as_bytes());
        }
        assert_eq!(echo(&mut survivor, b"alive"), b"alive");

        stop.stop();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_gc_compacts_parallel_arrays() {
        let (mut server, _clients) = server_with_clients(4, 2);
        let names_before = server.names.clone();

        server.close(1);
        assert_eq!(server.collect_garbage().unwrap(), 0);
        server.close(3);
        server.close(3);
        assert_eq!(server.garbage, 2);

        assert_eq!(server.collect_garbage().unwrap(), 2);
        assert_eq!(server.garbage, 0);
        assert_eq!(server.poll.len(), 3);
        assert_eq!(
            server.names,
            vec![
                LISTENER_NAME.to_string(),
                names_before[2].clone(),
                names_before[4].clone()
            ]
        );
        assert_eq!(server.streams.len(), 2);
        for slot in 1..server.poll.len() {
            assert!(server.streams.contains_key(&server.poll.fd(slot)));
        }
    }

    #[test]
    fn test_gc_mismatch_is_fatal() {
        let (mut server, _clients) = server_with_clients(2, 1);
        server.close(1);
        server.garbage += 1;

        match server.collect_garbage() {
            Err(ServerError::GcMismatch { counted, removed }) => {
                assert_eq!(counted, 2);
                assert_eq!(removed, 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
