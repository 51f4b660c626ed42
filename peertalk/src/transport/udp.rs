#![forbid(unsafe_code)]

//! UDP channels for discovery broadcast and the unreliable side-channel.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

use super::{would_block, Datagram};

/// A bound, non-blocking UDP socket.
///
/// SO_REUSEADDR (and SO_REUSEPORT where it exists) are set before the bind so
/// several processes on one machine can share the discovery port.
#[derive(Debug)]
pub struct UdpChannel {
    socket: UdpSocket,
    port: u16,
}

impl UdpChannel {
    pub fn bind(port: u16, broadcast: bool) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(not(target_os = "windows"))]
        {
            // Not available everywhere; reuse_address alone is enough there.
            let _ = socket.set_reuse_port(true);
        }
        if broadcast {
            socket.set_broadcast(true)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
        let socket: UdpSocket = socket.into();
        let port = match socket.local_addr()? {
            SocketAddr::V4(a) => a.port(),
            SocketAddr::V6(a) => a.port(),
        };
        Ok(Self { socket, port })
    }
}

impl Datagram for UdpChannel {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, addr)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok(pair) => Ok(Some(pair)),
            Err(e) if would_block(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn local_port(&self) -> u16 {
        self.port
    }
}

/// Best-effort primary IPv4 of this host: connect a UDP socket to a
/// documentation address and read the chosen source address. No packet is
/// sent.
pub fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    match socket.local_addr().ok()? {
        SocketAddr::V4(a) => Some(*a.ip()),
        SocketAddr::V6(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_ephemeral_reports_port() {
        let chan = UdpChannel::bind(0, false).unwrap();
        assert_ne!(chan.local_port(), 0);
    }

    #[test]
    fn recv_on_idle_socket_is_no_progress() {
        let chan = UdpChannel::bind(0, false).unwrap();
        let mut buf = [0u8; 64];
        assert!(chan.recv_from(&mut buf).unwrap().is_none());
    }

    #[test]
    fn loopback_datagram_round_trip() {
        let a = UdpChannel::bind(0, false).unwrap();
        let b = UdpChannel::bind(0, false).unwrap();
        let dest = SocketAddr::from((Ipv4Addr::LOCALHOST, b.local_port()));
        a.send_to(b"ping", dest).unwrap();

        let mut buf = [0u8; 64];
        // Local delivery is fast but not instant; poll briefly.
        for _ in 0..50 {
            if let Some((n, _)) = b.recv_from(&mut buf).unwrap() {
                assert_eq!(&buf[..n], b"ping");
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        panic!("datagram never arrived");
    }
}
