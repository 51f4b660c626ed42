#![forbid(unsafe_code)]

//! Transport plug points.
//!
//! The core talks to "a thing that can send/recv datagrams" and "a thing that
//! can accept/read/write a stream"; nothing in it names a socket. The default
//! [`NetTransport`] binds non-blocking `std::net` sockets configured through
//! socket2. Tests substitute in-memory doubles.
//!
//! Every operation is non-blocking: `Ok(None)` uniformly means "no progress
//! right now" (the poll loop moves on), and real errors surface as
//! `io::Error`.

pub mod tcp;
pub mod udp;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

/// Non-blocking datagram endpoint. Shared (`&self`) because the unreliable
/// send fast path runs on producer threads while the poll thread receives.
pub trait Datagram: Send + Sync {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;
    fn local_port(&self) -> u16;
}

/// Non-blocking byte stream.
pub trait Stream: Send {
    /// `Ok(None)` = would block, `Ok(Some(0))` = remote closed.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;
    /// `Ok(None)` = would block, `Ok(Some(n))` = n bytes accepted (short
    /// writes are normal).
    fn write(&mut self, buf: &[u8]) -> io::Result<Option<usize>>;
    /// Completion check for an in-progress connect. `Ok(false)` while still
    /// pending; an error means the connect failed.
    fn connected(&mut self) -> io::Result<bool>;
    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

/// Non-blocking accept source.
pub trait Listener: Send {
    fn accept(&mut self) -> io::Result<Option<(Box<dyn Stream>, SocketAddr)>>;
    fn local_port(&self) -> u16;
}

/// Factory for the platform transports; swap in a double for tests.
pub trait Transport: Send {
    fn bind_listener(&mut self, port: u16) -> io::Result<Box<dyn Listener>>;
    fn connect(&mut self, addr: SocketAddr) -> io::Result<Box<dyn Stream>>;
    fn bind_datagram(&mut self, port: u16, broadcast: bool) -> io::Result<Arc<dyn Datagram>>;
    /// Best-effort primary IPv4 of this host, used for loopback filtering of
    /// our own discovery broadcasts.
    fn local_ipv4(&self) -> Option<std::net::Ipv4Addr> {
        None
    }
}

/// The real-socket transport.
#[derive(Debug, Default)]
pub struct NetTransport;

impl Transport for NetTransport {
    fn bind_listener(&mut self, port: u16) -> io::Result<Box<dyn Listener>> {
        Ok(Box::new(tcp::NetListener::bind(port)?))
    }

    fn connect(&mut self, addr: SocketAddr) -> io::Result<Box<dyn Stream>> {
        Ok(Box::new(tcp::NetStream::connect(addr)?))
    }

    fn bind_datagram(&mut self, port: u16, broadcast: bool) -> io::Result<Arc<dyn Datagram>> {
        Ok(Arc::new(udp::UdpChannel::bind(port, broadcast)?))
    }

    fn local_ipv4(&self) -> Option<std::net::Ipv4Addr> {
        udp::local_ipv4()
    }
}

/// Treat `WouldBlock` (and the spurious `Interrupted`) as "no progress".
pub(crate) fn would_block(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}
