#![forbid(unsafe_code)]

//! The embeddable context: lifecycle, the poll heartbeat, and inspection.
//!
//! Everything advances inside [`PeerTalk::poll`], driven by the embedder's
//! thread; there is no internal worker. The send API and the ISR push are the
//! only entry points that may run concurrently, and they touch nothing but
//! the per-peer rings (see [`SendHandle`]). Callbacks fire from `poll` only,
//! after each cycle's state mutation settles, and receive ids plus read-only
//! snapshots.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, info, warn};

use crate::batch::{self, Batch};
use crate::clock::Clock;
use crate::config::Config;
use crate::discovery::{DiscoveryEngine, DiscoveryEvent};
use crate::error::{Error, Result};
use crate::handle::{Route, RouteMap, SendHandle, Shared, UdpEndpoint};
use crate::peer::{
    ConnectionState, DisconnectReason, NameIdx, PeerId, PeerRecord, PeerSnapshot, Registry,
};
use crate::queue::{BackpressureLevel, Priority, QueueStatus};
use crate::recv::Step;
use crate::stats::{GlobalSnapshot, GlobalStats, PeerStats};
use crate::telemetry::{PerfCallback, PerfEventKind, PerfRecorder};
use crate::transport::{Datagram, Listener, NetTransport, Transport};
use crate::wire::{
    decode_envelope, encode_frame, MessageFlags, MessageKind, MAX_MESSAGE_SIZE,
};

/// Best-effort queue drain passes run by [`PeerTalk::shutdown`].
const SHUTDOWN_DRAIN_PASSES: usize = 4;

/// Embedder callbacks; every method has a no-op default. Invoked only from
/// within [`PeerTalk::poll`] (and the final flush in `shutdown`).
pub trait Events {
    fn on_peer_discovered(&mut self, _peer: PeerSnapshot) {}
    fn on_peer_lost(&mut self, _peer: PeerSnapshot) {}
    fn on_peer_connected(&mut self, _peer: PeerSnapshot) {}
    fn on_peer_disconnected(&mut self, _peer: PeerSnapshot, _reason: DisconnectReason) {}
    fn on_message_received(&mut self, _peer: PeerId, _data: &[u8]) {}
}

/// Deferred callback invocations, accumulated while registry borrows are
/// live and flushed at the end of the poll cycle in order.
enum Emit {
    Discovered(PeerSnapshot),
    Lost(PeerSnapshot),
    Connected(PeerSnapshot),
    Disconnected(PeerSnapshot, DisconnectReason),
    Message(PeerId, Bytes),
}

pub struct PeerTalk {
    config: Config,
    clock: Clock,
    registry: Registry,
    shared: Arc<Shared>,
    sender: SendHandle,
    events: Option<Box<dyn Events>>,
    transport: Box<dyn Transport>,
    listener: Option<Box<dyn Listener>>,
    udp: Option<Arc<dyn Datagram>>,
    discovery: Option<DiscoveryEngine>,
    perf: PerfRecorder,
    batch: Batch,
    frame_buf: BytesMut,
    pop_buf: Vec<u8>,
    read_buf: Vec<u8>,
    pending_events: Vec<Emit>,
    discovery_scratch: Vec<DiscoveryEvent>,
    local_ip: Option<Ipv4Addr>,
    /// Actual TCP port once listening (resolves an ephemeral bind).
    tcp_port_actual: Option<u16>,
    routes_dirty: bool,
    shut_down: bool,
}

impl PeerTalk {
    /// Create a context over the real network transport.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_transport(config, Box::new(NetTransport))
    }

    /// Create a context over a custom transport (tests use in-memory
    /// doubles).
    pub fn with_transport(config: Config, transport: Box<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let clock = Clock::new();
        let shared = Arc::new(Shared::new());
        let sender = SendHandle::new(shared.clone());
        let local_ip = transport.local_ipv4();
        Ok(Self {
            registry: Registry::new(config.max_peers, config.queue_capacity),
            clock,
            shared,
            sender,
            events: None,
            transport,
            listener: None,
            udp: None,
            discovery: None,
            perf: PerfRecorder::new(clock),
            batch: Batch::new(),
            frame_buf: BytesMut::with_capacity(4096),
            pop_buf: vec![0; MAX_MESSAGE_SIZE],
            read_buf: vec![0; 4096],
            pending_events: Vec::new(),
            discovery_scratch: Vec::new(),
            local_ip,
            tcp_port_actual: None,
            routes_dirty: false,
            shut_down: false,
            config,
        })
    }

    /// Install the callback handler. Replaces any previous handler.
    pub fn set_event_handler(&mut self, events: Box<dyn Events>) {
        self.events = Some(events);
    }

    /// Route perf entries to a dedicated callback.
    pub fn set_perf_callback(&mut self, callback: PerfCallback) {
        self.perf.set_callback(callback);
    }

    /// A cloneable sender usable from any thread.
    pub fn handle(&self) -> SendHandle {
        self.sender.clone()
    }

    pub fn start_discovery(&mut self) -> Result<()> {
        self.ensure_running()?;
        if self.discovery.is_some() {
            return Err(Error::InvalidState("discovery already started"));
        }
        let socket = self.transport.bind_datagram(self.config.discovery_port, true)?;
        self.discovery = Some(DiscoveryEngine::new(socket, &self.config, self.local_ip));
        info!(port = self.config.discovery_port, "discovery started");
        Ok(())
    }

    pub fn stop_discovery(&mut self) -> Result<()> {
        self.ensure_running()?;
        let Some(mut engine) = self.discovery.take() else {
            return Err(Error::InvalidState("discovery not started"));
        };
        engine.goodbye(self.announce_port(), &self.shared.stats);
        info!("discovery stopped");
        Ok(())
    }

    /// Bind the TCP listener and the UDP message channel.
    pub fn start_listening(&mut self) -> Result<()> {
        self.ensure_running()?;
        if self.listener.is_some() {
            return Err(Error::InvalidState("already listening"));
        }
        let listener = self.transport.bind_listener(self.config.tcp_port)?;
        let tcp_port = listener.local_port();
        let udp = self.transport.bind_datagram(self.config.udp_port, false)?;
        self.shared
            .udp
            .store(Some(Arc::new(UdpEndpoint { socket: udp.clone(), sender_port: tcp_port })));
        self.udp = Some(udp);
        self.listener = Some(listener);
        self.tcp_port_actual = Some(tcp_port);
        info!(tcp_port, udp_port = self.config.udp_port, "listening");
        Ok(())
    }

    pub fn stop_listening(&mut self) -> Result<()> {
        self.ensure_running()?;
        if self.listener.take().is_none() {
            return Err(Error::InvalidState("not listening"));
        }
        self.udp = None;
        self.shared.udp.store(None);
        info!("listening stopped");
        Ok(())
    }

    /// Open an outbound session to a discovered peer.
    pub fn connect(&mut self, peer: PeerId) -> Result<()> {
        self.ensure_running()?;
        let (addr, tcp_port) = {
            let rec = self.registry.get(peer).ok_or(Error::PeerNotFound)?;
            match rec.state() {
                ConnectionState::Discovered => {}
                ConnectionState::Dead => return Err(Error::InvalidState("peer is dead")),
                _ => return Err(Error::InvalidState("connection already in progress")),
            }
            (rec.addr, rec.tcp_port)
        };
        if tcp_port == 0 {
            return Err(Error::InvalidState("peer has not announced a port"));
        }
        let stream = self.transport.connect(SocketAddr::from((addr, tcp_port)))?;
        let now = self.clock.now_ms();
        if let Some(rec) = self.registry.get_mut(peer) {
            rec.stream = Some(stream);
            rec.set_state(ConnectionState::Connecting);
            rec.last_seen_ms = now;
        }
        debug!(%peer, %addr, tcp_port, "connecting");
        Ok(())
    }

    /// Flush outstanding sends, then close the session.
    pub fn disconnect(&mut self, peer: PeerId) -> Result<()> {
        self.ensure_running()?;
        let now = self.clock.now_ms();
        let rec = self.registry.get_mut(peer).ok_or(Error::PeerNotFound)?;
        if rec.state() != ConnectionState::Connected {
            return Err(Error::InvalidState("peer not connected"));
        }
        rec.set_state(ConnectionState::Disconnecting);
        rec.last_seen_ms = now;
        Ok(())
    }

    /// The heartbeat. Runs socket readiness, queue drain, pings, timeout
    /// sweeps, and discovery, then fires the accumulated callbacks.
    pub fn poll(&mut self) -> Result<()> {
        self.ensure_running()?;
        let now = self.clock.now_ms();
        self.accept_ready(now);
        self.drive_streams(now);
        self.read_udp(now);
        self.ingest_discovery(now);
        self.drain_queues(now);
        self.emit_pings(now);
        self.sweep(now);
        self.announce(now);
        if self.routes_dirty {
            self.publish_routes();
        }
        self.flush_events();
        Ok(())
    }

    /// Best-effort drain, GOODBYE, then teardown. Idempotent.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        let now = self.clock.now_ms();
        let port = self.announce_port();
        if let Some(engine) = self.discovery.as_mut() {
            engine.goodbye(port, &self.shared.stats);
        }
        for _ in 0..SHUTDOWN_DRAIN_PASSES {
            self.drain_queues(now);
            let outstanding = self
                .registry
                .iter()
                .any(|r| !r.queue.is_empty() || !r.pending_write.is_empty());
            if !outstanding {
                break;
            }
        }
        for id in self.registry.ids() {
            let Self { registry, shared, pending_events, routes_dirty, .. } = self;
            if let Some(rec) = registry.get_mut(id) {
                if matches!(
                    rec.state(),
                    ConnectionState::Connected | ConnectionState::Disconnecting
                ) {
                    kill(rec, &shared.stats, pending_events, routes_dirty, DisconnectReason::Shutdown, now);
                }
            }
            self.registry.remove(id);
        }
        self.listener = None;
        self.udp = None;
        self.shared.udp.store(None);
        self.discovery = None;
        self.publish_routes();
        self.shut_down = true;
        self.flush_events();
        info!("context shut down");
        Ok(())
    }

    // ---- send API (delegates to the producer path) ----

    pub fn send(&self, peer: PeerId, data: &[u8]) -> Result<()> {
        self.sender.send(peer, data)
    }

    pub fn send_ex(
        &self,
        peer: PeerId,
        data: &[u8],
        priority: Priority,
        flags: MessageFlags,
        coalesce_key: u32,
    ) -> Result<()> {
        self.sender.send_ex(peer, data, priority, flags, coalesce_key)
    }

    pub fn broadcast(&self, data: &[u8]) -> Result<usize> {
        self.sender.broadcast(data)
    }

    // ---- inspection ----

    pub fn peer(&self, id: PeerId) -> Option<PeerSnapshot> {
        self.registry.get(id).map(PeerRecord::snapshot)
    }

    pub fn peers(&self, limit: usize) -> Vec<PeerSnapshot> {
        let mut out: Vec<PeerSnapshot> = Vec::with_capacity(limit.min(self.registry.len()));
        for id in self.registry.ids() {
            if out.len() == limit {
                break;
            }
            if let Some(rec) = self.registry.get(id) {
                out.push(rec.snapshot());
            }
        }
        out
    }

    pub fn peer_name(&self, idx: NameIdx) -> Option<&str> {
        self.registry.name(idx)
    }

    pub fn queue_status(&self, id: PeerId) -> Result<QueueStatus> {
        let rec = self.registry.get(id).ok_or(Error::PeerNotFound)?;
        Ok(rec.queue.status())
    }

    pub fn global_stats(&self) -> GlobalSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn peer_stats(&self, id: PeerId) -> Result<PeerStats> {
        let rec = self.registry.get(id).ok_or(Error::PeerNotFound)?;
        Ok(rec.stats)
    }

    pub fn local_name(&self) -> &str {
        &self.config.local_name
    }

    // ---- poll stages ----

    fn accept_ready(&mut self, now: u64) {
        let Self { listener, registry, shared, config, pending_events, routes_dirty, .. } = self;
        let Some(listener) = listener.as_mut() else { return };
        loop {
            match listener.accept() {
                Ok(None) => break,
                Ok(Some((stream, addr))) => {
                    let SocketAddr::V4(addr) = addr else {
                        shared.stats.inc_connections_rejected();
                        continue;
                    };
                    if !config.auto_accept {
                        debug!(%addr, "inbound connection refused (auto_accept off)");
                        shared.stats.inc_connections_rejected();
                        continue;
                    }
                    match registry.attach_inbound(stream, *addr.ip(), config.udp_port, now) {
                        Ok(id) => {
                            shared.stats.inc_connections_accepted();
                            shared.stats.inc_peers_connected();
                            *routes_dirty = true;
                            if let Some(rec) = registry.get(id) {
                                pending_events.push(Emit::Connected(rec.snapshot()));
                            }
                            info!(%id, %addr, "inbound connection accepted");
                        }
                        Err(e) => {
                            warn!(error = %e, %addr, "inbound connection rejected");
                            shared.stats.inc_connections_rejected();
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn drive_streams(&mut self, now: u64) {
        for id in self.registry.ids() {
            self.drive_stream(id, now);
        }
    }

    fn drive_stream(&mut self, id: PeerId, now: u64) {
        let Self { registry, shared, pending_events, read_buf, frame_buf, routes_dirty, .. } = self;
        let Some(rec) = registry.get_mut(id) else { return };
        match rec.state() {
            ConnectionState::Connecting => {
                let result = match rec.stream.as_mut() {
                    Some(stream) => stream.connected(),
                    None => return,
                };
                match result {
                    Ok(true) => {
                        rec.set_state(ConnectionState::Connected);
                        rec.last_seen_ms = now;
                        shared.stats.inc_peers_connected();
                        pending_events.push(Emit::Connected(rec.snapshot()));
                        info!(%id, "connected");
                    }
                    Ok(false) => {}
                    Err(e) => {
                        debug!(%id, error = %e, "connect failed");
                        fail_connect(rec, pending_events, routes_dirty, DisconnectReason::Transport, now);
                    }
                }
            }
            ConnectionState::Connected | ConnectionState::Disconnecting => {
                read_session(rec, shared, pending_events, read_buf, frame_buf, routes_dirty, now);
            }
            _ => {}
        }
    }

    fn read_udp(&mut self, now: u64) {
        let Some(udp) = self.udp.clone() else { return };
        let mut buf = [0u8; 2048];
        loop {
            match udp.recv_from(&mut buf) {
                Ok(None) => break,
                Ok(Some((n, src))) => {
                    self.shared.stats.add_bytes_received(n);
                    let envelope = match decode_envelope(&buf[..n]) {
                        Ok(env) => env,
                        Err(e) => {
                            debug!(error = %e, %src, "discarding malformed datagram");
                            continue;
                        }
                    };
                    let SocketAddr::V4(src) = src else { continue };
                    let Some(id) = self.registry.lookup_endpoint(*src.ip(), envelope.sender_port)
                    else {
                        debug!(%src, sender_port = envelope.sender_port, "datagram from unknown peer");
                        continue;
                    };
                    if let Some(rec) = self.registry.get_mut(id) {
                        rec.last_seen_ms = now;
                        rec.stats.add_received(envelope.payload.len(), 1);
                    }
                    self.shared.stats.add_messages_received(1);
                    self.pending_events
                        .push(Emit::Message(id, Bytes::copy_from_slice(envelope.payload)));
                }
                Err(e) => {
                    warn!(error = %e, "udp recv failed");
                    break;
                }
            }
        }
    }

    fn ingest_discovery(&mut self, now: u64) {
        let own_port = self.announce_port();
        let udp_port = self.config.udp_port;
        if let Some(engine) = self.discovery.as_mut() {
            engine.ingest(
                &mut self.registry,
                now,
                own_port,
                udp_port,
                &self.shared.stats,
                &mut self.discovery_scratch,
            );
        }
        if self.discovery_scratch.is_empty() {
            return;
        }
        let updates = std::mem::take(&mut self.discovery_scratch);
        for update in &updates {
            let Self { registry, shared, pending_events, routes_dirty, .. } = self;
            match *update {
                DiscoveryEvent::Discovered(id) => {
                    if let Some(rec) = registry.get(id) {
                        *routes_dirty = true;
                        pending_events.push(Emit::Discovered(rec.snapshot()));
                    }
                }
                DiscoveryEvent::Lost(id) => {
                    if let Some(rec) = registry.get_mut(id) {
                        let was_connected = matches!(
                            rec.state(),
                            ConnectionState::Connected | ConnectionState::Disconnecting
                        );
                        rec.stream = None;
                        rec.set_state(ConnectionState::Dead);
                        rec.last_seen_ms = now;
                        if was_connected {
                            shared.stats.dec_peers_connected();
                        }
                        *routes_dirty = true;
                        pending_events.push(Emit::Lost(rec.snapshot()));
                    }
                }
            }
        }
        self.discovery_scratch = updates;
        self.discovery_scratch.clear();
    }

    fn drain_queues(&mut self, now: u64) {
        for id in self.registry.ids() {
            self.drain_peer(id, now);
        }
    }

    fn drain_peer(&mut self, id: PeerId, now: u64) {
        let Self {
            registry,
            shared,
            batch,
            pop_buf,
            frame_buf,
            pending_events,
            routes_dirty,
            perf,
            ..
        } = self;
        let Some(rec) = registry.get_mut(id) else { return };
        if !matches!(rec.state(), ConnectionState::Connected | ConnectionState::Disconnecting)
            || rec.stream.is_none()
        {
            return;
        }

        if rec.queue.backpressure() >= BackpressureLevel::Heavy {
            let status = rec.queue.status();
            perf.record(PerfEventKind::QueuePressure, status.pending, rec.queue.capacity() as u32);
        }

        // Retained bytes from an earlier partial write go first.
        if !rec.pending_write.is_empty() {
            let (written, outcome) = flush_pending(rec);
            count_sent_bytes(rec, shared, written);
            match outcome {
                WriteOutcome::Done => {}
                WriteOutcome::Blocked => return,
                WriteOutcome::Error(e) => {
                    warn!(%id, error = %e, "write failed");
                    kill(rec, &shared.stats, pending_events, routes_dirty, DisconnectReason::Transport, now);
                    return;
                }
            }
        }

        loop {
            batch.clear();
            if let Some(carry) = rec.carry.take() {
                batch.add(&carry);
            }
            while let Some(popped) = rec.queue.pop(pop_buf) {
                if !batch.add(&pop_buf[..popped.len]) {
                    rec.carry = Some(pop_buf[..popped.len].to_vec());
                    break;
                }
            }
            if batch.is_empty() {
                if rec.state() == ConnectionState::Disconnecting && rec.pending_write.is_empty() {
                    // Flush complete; finish the requested disconnect.
                    kill(rec, &shared.stats, pending_events, routes_dirty, DisconnectReason::Requested, now);
                }
                return;
            }

            let used = batch.prepare(&mut rec.send_sequence);
            let entry_count = u32::from(batch.count());
            frame_buf.clear();
            encode_frame(
                MessageKind::Data,
                MessageFlags::empty(),
                rec.send_sequence,
                batch.bytes(),
                frame_buf,
            );
            let (written, outcome) = write_frame(rec, frame_buf);
            count_sent_bytes(rec, shared, written);
            rec.stats.add_sent(0, entry_count);
            shared.stats.add_messages_sent(entry_count);
            perf.record(PerfEventKind::BatchFlush, used as u32, entry_count);
            match outcome {
                WriteOutcome::Done => {}
                WriteOutcome::Blocked => return,
                WriteOutcome::Error(e) => {
                    warn!(%id, error = %e, "write failed");
                    kill(rec, &shared.stats, pending_events, routes_dirty, DisconnectReason::Transport, now);
                    return;
                }
            }
        }
    }

    fn emit_pings(&mut self, now: u64) {
        let interval = self.config.ping_interval_ms;
        for id in self.registry.ids() {
            let Self { registry, shared, frame_buf, pending_events, routes_dirty, .. } = self;
            let Some(rec) = registry.get_mut(id) else { continue };
            if rec.state() != ConnectionState::Connected {
                continue;
            }
            if now.saturating_sub(rec.last_seen_ms) < interval
                || now.saturating_sub(rec.last_ping_sent_ms) < interval
            {
                continue;
            }
            let sequence = rec.next_sequence();
            frame_buf.clear();
            encode_frame(
                MessageKind::Ping,
                MessageFlags::empty(),
                sequence,
                &now.to_be_bytes(),
                frame_buf,
            );
            rec.pending_write.extend_from_slice(frame_buf);
            rec.last_ping_sent_ms = now;
            let (written, outcome) = flush_pending(rec);
            count_sent_bytes(rec, shared, written);
            if let WriteOutcome::Error(e) = outcome {
                warn!(%id, error = %e, "ping write failed");
                kill(rec, &shared.stats, pending_events, routes_dirty, DisconnectReason::Transport, now);
            }
        }
    }

    fn sweep(&mut self, now: u64) {
        let timeout = self.config.peer_timeout_ms;
        let auto_cleanup = self.config.auto_cleanup;
        for id in self.registry.ids() {
            enum Action {
                Keep,
                Kill(DisconnectReason),
                Reap,
                Expire,
            }
            let action = {
                let Some(rec) = self.registry.get(id) else { continue };
                let idle = now.saturating_sub(rec.last_seen_ms);
                match rec.state() {
                    ConnectionState::Connected if idle > timeout => {
                        Action::Kill(DisconnectReason::Timeout)
                    }
                    ConnectionState::Connecting if idle > timeout => {
                        Action::Kill(DisconnectReason::Timeout)
                    }
                    ConnectionState::Disconnecting if idle > timeout => {
                        Action::Kill(DisconnectReason::Requested)
                    }
                    ConnectionState::Discovered if auto_cleanup && idle > timeout => Action::Expire,
                    ConnectionState::Dead if auto_cleanup => Action::Reap,
                    _ => Action::Keep,
                }
            };
            match action {
                Action::Keep => {}
                Action::Kill(reason) => {
                    let Self { registry, shared, pending_events, routes_dirty, .. } = self;
                    if let Some(rec) = registry.get_mut(id) {
                        debug!(%id, ?reason, "peer timed out");
                        if rec.state() == ConnectionState::Connecting {
                            fail_connect(rec, pending_events, routes_dirty, reason, now);
                        } else {
                            kill(rec, &shared.stats, pending_events, routes_dirty, reason, now);
                        }
                    }
                }
                Action::Expire => {
                    if let Some(rec) = self.registry.get(id) {
                        self.pending_events.push(Emit::Lost(rec.snapshot()));
                    }
                    self.registry.remove(id);
                    self.routes_dirty = true;
                }
                Action::Reap => {
                    self.registry.remove(id);
                    self.routes_dirty = true;
                }
            }
        }
    }

    fn announce(&mut self, now: u64) {
        let port = self.announce_port();
        let hosting = self.listener.is_some();
        let accepting = hosting && self.config.auto_accept;
        if let Some(engine) = self.discovery.as_mut() {
            if let Err(e) = engine.maybe_announce(now, port, hosting, accepting, &self.shared.stats)
            {
                warn!(error = %e, "announce failed");
            }
        }
    }

    fn publish_routes(&mut self) {
        let mut map = RouteMap::default();
        for rec in self.registry.iter() {
            if rec.state() == ConnectionState::Dead {
                continue;
            }
            map.insert(
                rec.id,
                Route {
                    queue: rec.queue.clone(),
                    state: rec.shared_state.clone(),
                    udp_addr: SocketAddr::from((rec.addr, rec.udp_port)),
                },
            );
        }
        self.shared.routes.store(Arc::new(map));
        self.routes_dirty = false;
    }

    fn flush_events(&mut self) {
        if self.pending_events.is_empty() {
            return;
        }
        let emits = std::mem::take(&mut self.pending_events);
        let Some(handler) = self.events.as_mut() else { return };
        for emit in emits {
            match emit {
                Emit::Discovered(snap) => handler.on_peer_discovered(snap),
                Emit::Lost(snap) => handler.on_peer_lost(snap),
                Emit::Connected(snap) => handler.on_peer_connected(snap),
                Emit::Disconnected(snap, reason) => handler.on_peer_disconnected(snap, reason),
                Emit::Message(id, data) => handler.on_message_received(id, &data),
            }
        }
    }

    fn announce_port(&self) -> u16 {
        self.tcp_port_actual.unwrap_or(self.config.tcp_port)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down {
            return Err(Error::InvalidState("context is shut down"));
        }
        Ok(())
    }
}

impl Drop for PeerTalk {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl std::fmt::Debug for PeerTalk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerTalk")
            .field("local_name", &self.config.local_name)
            .field("peers", &self.registry.len())
            .field("listening", &self.listener.is_some())
            .field("discovering", &self.discovery.is_some())
            .finish()
    }
}

// ---- helpers shared by the poll stages ----

enum WriteOutcome {
    Done,
    Blocked,
    Error(std::io::Error),
}

/// Close a session and mark the record dead.
fn kill(
    rec: &mut PeerRecord,
    stats: &GlobalStats,
    pending_events: &mut Vec<Emit>,
    routes_dirty: &mut bool,
    reason: DisconnectReason,
    now: u64,
) {
    let was_connected = matches!(
        rec.state(),
        ConnectionState::Connected | ConnectionState::Disconnecting
    );
    rec.stream = None;
    rec.pending_write.clear();
    rec.carry = None;
    rec.set_state(ConnectionState::Dead);
    rec.last_seen_ms = now;
    if was_connected {
        stats.dec_peers_connected();
    }
    pending_events.push(Emit::Disconnected(rec.snapshot(), reason));
    *routes_dirty = true;
}

/// A connect attempt that never reached Connected; no peers_connected
/// adjustment.
fn fail_connect(
    rec: &mut PeerRecord,
    pending_events: &mut Vec<Emit>,
    routes_dirty: &mut bool,
    reason: DisconnectReason,
    now: u64,
) {
    rec.stream = None;
    rec.set_state(ConnectionState::Dead);
    rec.last_seen_ms = now;
    pending_events.push(Emit::Disconnected(rec.snapshot(), reason));
    *routes_dirty = true;
}

fn count_sent_bytes(rec: &mut PeerRecord, shared: &Shared, written: usize) {
    if written > 0 {
        rec.stats.add_sent(written, 0);
        shared.stats.add_bytes_sent(written);
    }
}

/// Write out retained bytes; whatever does not go through stays retained.
fn flush_pending(rec: &mut PeerRecord) -> (usize, WriteOutcome) {
    let Some(stream) = rec.stream.as_mut() else {
        return (0, WriteOutcome::Error(std::io::Error::from(std::io::ErrorKind::NotConnected)));
    };
    let mut written = 0;
    while !rec.pending_write.is_empty() {
        match stream.write(&rec.pending_write) {
            Ok(Some(0)) => {
                return (written, WriteOutcome::Error(std::io::ErrorKind::WriteZero.into()))
            }
            Ok(Some(n)) => {
                rec.pending_write.advance(n);
                written += n;
            }
            Ok(None) => return (written, WriteOutcome::Blocked),
            Err(e) => return (written, WriteOutcome::Error(e)),
        }
    }
    (written, WriteOutcome::Done)
}

/// Write a freshly assembled frame; the unwritten tail is retained for the
/// next poll.
fn write_frame(rec: &mut PeerRecord, frame: &[u8]) -> (usize, WriteOutcome) {
    let Some(stream) = rec.stream.as_mut() else {
        return (0, WriteOutcome::Error(std::io::Error::from(std::io::ErrorKind::NotConnected)));
    };
    let mut offset = 0;
    while offset < frame.len() {
        match stream.write(&frame[offset..]) {
            Ok(Some(0)) => {
                return (offset, WriteOutcome::Error(std::io::ErrorKind::WriteZero.into()))
            }
            Ok(Some(n)) => offset += n,
            Ok(None) => {
                rec.pending_write.extend_from_slice(&frame[offset..]);
                return (offset, WriteOutcome::Blocked);
            }
            Err(e) => return (offset, WriteOutcome::Error(e)),
        }
    }
    (offset, WriteOutcome::Done)
}

/// Drain readable bytes from a session into its receive state machine and
/// dispatch the resulting frames.
fn read_session(
    rec: &mut PeerRecord,
    shared: &Shared,
    pending_events: &mut Vec<Emit>,
    read_buf: &mut [u8],
    frame_buf: &mut BytesMut,
    routes_dirty: &mut bool,
    now: u64,
) {
    loop {
        let result = match rec.stream.as_mut() {
            Some(stream) => stream.read(read_buf),
            None => return,
        };
        let n = match result {
            Ok(None) => return,
            Ok(Some(0)) => {
                debug!(id = %rec.id, "remote closed");
                kill(rec, &shared.stats, pending_events, routes_dirty, DisconnectReason::RemoteClosed, now);
                return;
            }
            Ok(Some(n)) => n,
            Err(e) => {
                debug!(id = %rec.id, error = %e, "read failed");
                kill(rec, &shared.stats, pending_events, routes_dirty, DisconnectReason::Transport, now);
                return;
            }
        };
        rec.last_seen_ms = now;
        rec.stats.add_received(n, 0);
        shared.stats.add_bytes_received(n);

        let mut input = &read_buf[..n];
        loop {
            match rec.recv.advance(&mut input) {
                Ok(Step::Pending) => break,
                Ok(Step::BadCrc) => {
                    rec.stats.frames_dropped = rec.stats.frames_dropped.wrapping_add(1);
                    debug!(id = %rec.id, "frame dropped: crc mismatch");
                }
                Ok(Step::Frame { header, payload }) => {
                    if !dispatch_frame(
                        rec,
                        shared,
                        pending_events,
                        frame_buf,
                        routes_dirty,
                        header.kind,
                        payload,
                        now,
                    ) {
                        return;
                    }
                }
                Err(e) => {
                    debug!(id = %rec.id, error = %e, "protocol error");
                    kill(rec, &shared.stats, pending_events, routes_dirty, DisconnectReason::Protocol, now);
                    return;
                }
            }
        }
    }
}

/// Handle one validated frame. Returns false when the connection was torn
/// down.
#[allow(clippy::too_many_arguments)]
fn dispatch_frame(
    rec: &mut PeerRecord,
    shared: &Shared,
    pending_events: &mut Vec<Emit>,
    frame_buf: &mut BytesMut,
    routes_dirty: &mut bool,
    kind: MessageKind,
    payload: Bytes,
    now: u64,
) -> bool {
    match kind {
        MessageKind::Data => {
            for entry in batch::entries(&payload) {
                match entry {
                    Ok(message) => {
                        rec.stats.add_received(0, 1);
                        shared.stats.add_messages_received(1);
                        pending_events.push(Emit::Message(rec.id, payload.slice_ref(message)));
                    }
                    Err(e) => {
                        debug!(id = %rec.id, error = %e, "malformed batch entry");
                        kill(rec, &shared.stats, pending_events, routes_dirty, DisconnectReason::Protocol, now);
                        return false;
                    }
                }
            }
            true
        }
        MessageKind::Ping => {
            // Echo the probe; the reply rides the retained-write path so it
            // keeps FIFO order with any partially written frame.
            let sequence = rec.next_sequence();
            frame_buf.clear();
            encode_frame(MessageKind::Pong, MessageFlags::empty(), sequence, &payload, frame_buf);
            rec.pending_write.extend_from_slice(frame_buf);
            let (written, outcome) = flush_pending(rec);
            count_sent_bytes(rec, shared, written);
            if let WriteOutcome::Error(e) = outcome {
                debug!(id = %rec.id, error = %e, "pong write failed");
                kill(rec, &shared.stats, pending_events, routes_dirty, DisconnectReason::Transport, now);
                return false;
            }
            true
        }
        MessageKind::Pong => {
            if payload.len() == 8 {
                let mut ts = [0u8; 8];
                ts.copy_from_slice(&payload);
                let sent_ms = u64::from_be_bytes(ts);
                let rtt = now.saturating_sub(sent_ms).min(u64::from(u16::MAX)) as u16;
                rec.stats.latency.record(rtt);
                rec.last_pong_ms = now;
            }
            true
        }
    }
}
