//! In-memory transport doubles and an event recorder for driving a context
//! without sockets.

use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use peertalk::transport::{Datagram, Listener, Stream, Transport};
use peertalk::{DisconnectReason, Events, PeerId, PeerSnapshot};

pub type Shared<T> = Arc<Mutex<T>>;

fn shared<T: Default>() -> Shared<T> {
    Arc::default()
}

// ---------------------------------------------------------------------------
// Datagram double
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct DatagramPipe {
    pub inbox: Shared<VecDeque<(Vec<u8>, SocketAddr)>>,
    pub outbox: Shared<Vec<(Vec<u8>, SocketAddr)>>,
}

pub struct MemDatagram {
    pipe: Arc<DatagramPipe>,
    port: u16,
}

impl Datagram for MemDatagram {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.pipe.outbox.lock().unwrap().push((buf.to_vec(), addr));
        Ok(buf.len())
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.pipe.inbox.lock().unwrap().pop_front() {
            Some((data, src)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(Some((n, src)))
            }
            None => Ok(None),
        }
    }

    fn local_port(&self) -> u16 {
        self.port
    }
}

// ---------------------------------------------------------------------------
// Stream double
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StreamState {
    /// Bytes the context will read.
    rx: VecDeque<u8>,
    /// Bytes the context has written.
    tx: Vec<u8>,
    /// Per-call read cap, for partial-read emulation. 0 = unlimited.
    read_cap: usize,
    /// Per-call write cap, for partial-write emulation. 0 = unlimited;
    /// `usize::MAX` = refuse (would-block).
    write_cap: usize,
    remote_closed: bool,
}

pub struct MemStream {
    state: Shared<StreamState>,
    peer: SocketAddr,
}

/// The test's side of a [`MemStream`].
#[derive(Clone)]
pub struct RemoteEnd {
    state: Shared<StreamState>,
}

impl RemoteEnd {
    /// Queue bytes for the context to read.
    pub fn feed(&self, bytes: &[u8]) {
        self.state.lock().unwrap().rx.extend(bytes.iter().copied());
    }

    /// Take everything the context has written so far.
    pub fn drain_tx(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().unwrap().tx)
    }

    /// Limit how many bytes each read call hands over.
    pub fn set_read_cap(&self, cap: usize) {
        self.state.lock().unwrap().read_cap = cap;
    }

    /// Make writes block (`usize::MAX`) or trickle (`n`).
    pub fn set_write_cap(&self, cap: usize) {
        self.state.lock().unwrap().write_cap = cap;
    }

    pub fn close(&self) {
        self.state.lock().unwrap().remote_closed = true;
    }
}

pub fn stream_pair(peer: SocketAddr) -> (MemStream, RemoteEnd) {
    let state = shared::<StreamState>();
    (MemStream { state: state.clone(), peer }, RemoteEnd { state })
}

impl Stream for MemStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let mut state = self.state.lock().unwrap();
        if state.rx.is_empty() {
            return if state.remote_closed { Ok(Some(0)) } else { Ok(None) };
        }
        let cap = if state.read_cap == 0 { buf.len() } else { state.read_cap.min(buf.len()) };
        let mut n = 0;
        while n < cap {
            match state.rx.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(Some(n))
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<Option<usize>> {
        let mut state = self.state.lock().unwrap();
        if state.write_cap == usize::MAX {
            return Ok(None);
        }
        let n = if state.write_cap == 0 { buf.len() } else { state.write_cap.min(buf.len()) };
        state.tx.extend_from_slice(&buf[..n]);
        Ok(Some(n))
    }

    fn connected(&mut self) -> io::Result<bool> {
        Ok(true)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.peer)
    }
}

// ---------------------------------------------------------------------------
// Listener + transport doubles
// ---------------------------------------------------------------------------

type Backlog = Shared<VecDeque<(Box<dyn Stream>, SocketAddr)>>;

pub struct MemListener {
    backlog: Backlog,
    port: u16,
}

impl Listener for MemListener {
    fn accept(&mut self) -> io::Result<Option<(Box<dyn Stream>, SocketAddr)>> {
        Ok(self.backlog.lock().unwrap().pop_front())
    }

    fn local_port(&self) -> u16 {
        self.port
    }
}

/// Our own address as the transport double reports it.
pub const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

/// Test handles into a [`MemTransport`]'s world.
#[derive(Default)]
pub struct MemWorld {
    pub backlog: Shared<VecDeque<(Box<dyn Stream>, SocketAddr)>>,
    /// The broadcast-enabled channel (discovery).
    pub discovery: Arc<DatagramPipe>,
    /// The plain channel (unreliable messages).
    pub udp: Arc<DatagramPipe>,
    /// Remote ends of outbound connects, in call order.
    pub connected: Shared<Vec<(SocketAddr, RemoteEnd)>>,
}

pub struct MemTransport {
    pub world: Arc<MemWorld>,
}

impl MemTransport {
    pub fn new() -> (Self, Arc<MemWorld>) {
        let world = Arc::new(MemWorld::default());
        (Self { world: world.clone() }, world)
    }

    /// Push an inbound connection; the context accepts it on its next poll.
    pub fn push_inbound(world: &MemWorld, from: SocketAddr) -> RemoteEnd {
        let (stream, remote) = stream_pair(from);
        world.backlog.lock().unwrap().push_back((Box::new(stream), from));
        remote
    }
}

impl Transport for MemTransport {
    fn bind_listener(&mut self, port: u16) -> io::Result<Box<dyn Listener>> {
        Ok(Box::new(MemListener {
            backlog: self.world.backlog.clone(),
            port: if port == 0 { 7354 } else { port },
        }))
    }

    fn connect(&mut self, addr: SocketAddr) -> io::Result<Box<dyn Stream>> {
        let (stream, remote) = stream_pair(addr);
        self.world.connected.lock().unwrap().push((addr, remote));
        Ok(Box::new(stream))
    }

    fn bind_datagram(&mut self, port: u16, broadcast: bool) -> io::Result<Arc<dyn Datagram>> {
        let pipe = if broadcast { self.world.discovery.clone() } else { self.world.udp.clone() };
        Ok(Arc::new(MemDatagram { pipe, port }))
    }

    fn local_ipv4(&self) -> Option<Ipv4Addr> {
        Some(LOCAL_IP)
    }
}

// ---------------------------------------------------------------------------
// Event recorder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ev {
    Discovered(PeerId),
    Lost(PeerId),
    Connected(PeerId),
    Disconnected(PeerId, DisconnectReason),
    Message(PeerId, Vec<u8>),
}

#[derive(Default)]
pub struct Recorder {
    log: Shared<Vec<Ev>>,
}

impl Recorder {
    pub fn new() -> (Box<Self>, Shared<Vec<Ev>>) {
        let log = shared::<Vec<Ev>>();
        (Box::new(Self { log: log.clone() }), log)
    }
}

impl Events for Recorder {
    fn on_peer_discovered(&mut self, peer: PeerSnapshot) {
        self.log.lock().unwrap().push(Ev::Discovered(peer.id));
    }

    fn on_peer_lost(&mut self, peer: PeerSnapshot) {
        self.log.lock().unwrap().push(Ev::Lost(peer.id));
    }

    fn on_peer_connected(&mut self, peer: PeerSnapshot) {
        self.log.lock().unwrap().push(Ev::Connected(peer.id));
    }

    fn on_peer_disconnected(&mut self, peer: PeerSnapshot, reason: DisconnectReason) {
        self.log.lock().unwrap().push(Ev::Disconnected(peer.id, reason));
    }

    fn on_message_received(&mut self, peer: PeerId, data: &[u8]) {
        self.log.lock().unwrap().push(Ev::Message(peer, data.to_vec()));
    }
}

pub fn taken(log: &Shared<Vec<Ev>>) -> Vec<Ev> {
    std::mem::take(&mut log.lock().unwrap())
}
