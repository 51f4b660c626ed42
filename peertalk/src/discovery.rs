#![forbid(unsafe_code)]

//! Discovery engine: periodic ANNOUNCE emission and ingest of peer
//! announcements.
//!
//! Announcements go to the IPv4 broadcast address on the discovery port.
//! Ingest upserts the registry and reports transitions; the context owns
//! firing the embedder callbacks. Our own broadcasts loop back on most
//! stacks and are filtered by (local address, announced TCP port).

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::error::Result;
use crate::peer::{PeerId, Registry};
use crate::stats::GlobalStats;
use crate::transport::Datagram;
use crate::wire::{DiscoveryFlags, DiscoveryKind, DiscoveryPacket, Transports};

/// Registry changes observed during ingest, in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DiscoveryEvent {
    Discovered(PeerId),
    Lost(PeerId),
}

pub(crate) struct DiscoveryEngine {
    socket: Arc<dyn Datagram>,
    broadcast_addr: SocketAddr,
    interval_ms: u64,
    last_announce_ms: Option<u64>,
    local_name: String,
    transports: Transports,
    local_ip: Option<Ipv4Addr>,
    scratch: BytesMut,
}

impl DiscoveryEngine {
    pub fn new(socket: Arc<dyn Datagram>, config: &Config, local_ip: Option<Ipv4Addr>) -> Self {
        Self {
            socket,
            broadcast_addr: SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::BROADCAST,
                config.discovery_port,
            )),
            interval_ms: config.discovery_interval_ms,
            last_announce_ms: None,
            local_name: config.local_name.clone(),
            transports: config.transports,
            local_ip,
            scratch: BytesMut::with_capacity(64),
        }
    }

    /// Emit an ANNOUNCE when the interval has elapsed (and immediately on the
    /// first call after start).
    pub fn maybe_announce(
        &mut self,
        now_ms: u64,
        sender_port: u16,
        hosting: bool,
        accepting: bool,
        stats: &GlobalStats,
    ) -> Result<()> {
        let due = match self.last_announce_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.interval_ms,
        };
        if !due {
            return Ok(());
        }
        self.last_announce_ms = Some(now_ms);
        let mut flags = DiscoveryFlags::empty();
        flags.set(DiscoveryFlags::HOST, hosting);
        flags.set(DiscoveryFlags::ACCEPTING, accepting);
        self.send(DiscoveryKind::Announce, flags, sender_port)?;
        stats.inc_discovery_sent();
        trace!(port = sender_port, "announce sent");
        Ok(())
    }

    /// Best-effort GOODBYE; errors are irrelevant during teardown.
    pub fn goodbye(&mut self, sender_port: u16, stats: &GlobalStats) {
        if self.send(DiscoveryKind::Goodbye, DiscoveryFlags::empty(), sender_port).is_ok() {
            stats.inc_discovery_sent();
        }
    }

    fn send(&mut self, kind: DiscoveryKind, flags: DiscoveryFlags, sender_port: u16) -> Result<()> {
        let packet = DiscoveryPacket {
            kind,
            flags,
            sender_port,
            transports: self.transports,
            name: self.local_name.clone(),
        };
        self.scratch.clear();
        packet.encode(&mut self.scratch)?;
        self.socket.send_to(&self.scratch, self.broadcast_addr)?;
        Ok(())
    }

    /// Drain and process every waiting discovery datagram.
    pub fn ingest(
        &mut self,
        registry: &mut Registry,
        now_ms: u64,
        own_port: u16,
        udp_port: u16,
        stats: &GlobalStats,
        out: &mut Vec<DiscoveryEvent>,
    ) {
        let mut buf = [0u8; 128];
        loop {
            let (len, src) = match self.socket.recv_from(&mut buf) {
                Ok(Some(pair)) => pair,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "discovery recv failed");
                    break;
                }
            };
            let packet = match DiscoveryPacket::decode(&buf[..len]) {
                Ok(p) => p,
                Err(e) => {
                    debug!(error = %e, %src, "discarding malformed discovery packet");
                    continue;
                }
            };
            stats.inc_discovery_received();
            let SocketAddr::V4(src) = src else { continue };
            let src_ip = *src.ip();
            if self.is_own_packet(src_ip, packet.sender_port, own_port) {
                continue;
            }
            match packet.kind {
                DiscoveryKind::Announce => {
                    match registry.upsert_discovered(
                        src_ip,
                        packet.sender_port,
                        udp_port,
                        &packet.name,
                        now_ms,
                    ) {
                        Ok((id, true)) => {
                            stats.inc_peers_discovered();
                            out.push(DiscoveryEvent::Discovered(id));
                        }
                        Ok((_, false)) => {}
                        Err(e) => debug!(error = %e, %src_ip, "announce ignored"),
                    }
                }
                DiscoveryKind::Goodbye => {
                    if let Some(id) = registry.lookup_endpoint(src_ip, packet.sender_port) {
                        out.push(DiscoveryEvent::Lost(id));
                    }
                }
            }
        }
    }

    fn is_own_packet(&self, src_ip: Ipv4Addr, sender_port: u16, own_port: u16) -> bool {
        sender_port == own_port
            && (src_ip.is_loopback() || Some(src_ip) == self.local_ip)
    }
}

impl std::fmt::Debug for DiscoveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryEngine")
            .field("broadcast_addr", &self.broadcast_addr)
            .field("interval_ms", &self.interval_ms)
            .field("last_announce_ms", &self.last_announce_ms)
            .finish()
    }
}
