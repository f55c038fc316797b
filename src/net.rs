//! Socket setup and single-message I/O helpers shared by every server.

use bytes::{Bytes, BytesMut};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener};

/// Create a blocking TCP listener with SO_REUSEADDR.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    // Restarting the server must not wait out TIME_WAIT
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

/// Raise the soft open-file limit to the hard limit.
///
/// Returns the resulting soft limit.
pub fn raise_nofile_limit() -> io::Result<u64> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `limit` is a valid, writable rlimit struct.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    if limit.rlim_cur < limit.rlim_max {
        limit.rlim_cur = limit.rlim_max;
        // SAFETY: `limit` is a valid rlimit struct.
        if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) } != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(limit.rlim_cur as u64)
}

/// Perform one read of at most `max` bytes.
///
/// Interrupted reads are retried. An empty result means the peer closed
/// its side.
pub fn read_message<R: Read>(mut reader: R, max: usize) -> io::Result<Bytes> {
    let mut buf = BytesMut::zeroed(max);
    let n = loop {
        match reader.read(&mut buf) {
            Ok(n) => break n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    };
    buf.truncate(n);
    Ok(buf.freeze())
}

/// Write the whole message, retrying interrupted and short writes.
pub fn write_message<W: Write>(mut writer: W, message: &[u8]) -> io::Result<()> {
    writer.write_all(message)
}

/// Human-readable peer identity used in logs.
pub fn peer_name(addr: &SocketAddr) -> String {
    format!("{}:{}", addr.ip(), addr.port())
}
