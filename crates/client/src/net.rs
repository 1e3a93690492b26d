//! TCP connection setup shared by the attacher and the exporter

use nix::sys::socket::{setsockopt, sockopt};
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

/// Connect to a peer daemon, trying every resolved address in turn
///
/// The returned stream has `TCP_NODELAY` and `SO_KEEPALIVE` set, and read
/// and write timeouts of `timeout` for the request/reply exchange.
pub fn connect(host: &str, port: u16, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_error = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                debug!(%addr, "connected to USB/IP daemon");
                stream.set_nodelay(true)?;
                setsockopt(&stream, sockopt::KeepAlive, &true)?;
                stream.set_read_timeout(Some(timeout))?;
                stream.set_write_timeout(Some(timeout))?;
                return Ok(stream);
            }
            Err(e) => {
                debug!(%addr, error = %e, "connection attempt failed");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("{host} did not resolve"))
    }))
}

/// Clear the exchange timeouts before the kernel takes over the socket
pub fn clear_timeouts(stream: &TcpStream) -> io::Result<()> {
    stream.set_read_timeout(None)?;
    stream.set_write_timeout(None)
}
