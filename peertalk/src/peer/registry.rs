#![forbid(unsafe_code)]

//! Peer record storage and lookup.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use ahash::RandomState;
use bytes::BytesMut;

use super::intern::{NameIdx, NameTable};
use super::{ConnectionState, PeerId, PeerSnapshot};
use crate::error::{Error, Result};
use crate::queue::PriorityQueue;
use crate::recv::RecvState;
use crate::stats::PeerStats;
use crate::transport::Stream;

pub(crate) struct PeerRecord {
    pub id: PeerId,
    pub name: NameIdx,
    pub addr: Ipv4Addr,
    /// Announced TCP listening port; 0 while only an inbound session exists
    /// and the peer has not announced yet.
    pub tcp_port: u16,
    pub udp_port: u16,
    state: ConnectionState,
    /// Mirror of `state` shared with the producer-side routing table.
    pub shared_state: Arc<AtomicU8>,
    pub queue: Arc<PriorityQueue>,
    pub recv: RecvState,
    pub stream: Option<Box<dyn Stream>>,
    /// Frame bytes a previous poll could not fully write.
    pub pending_write: BytesMut,
    /// A popped message that did not fit the batch being assembled.
    pub carry: Option<Vec<u8>>,
    pub stats: PeerStats,
    pub last_seen_ms: u64,
    pub last_ping_sent_ms: u64,
    pub last_pong_ms: u64,
    pub send_sequence: u16,
}

impl PeerRecord {
    fn new(
        id: PeerId,
        name: NameIdx,
        addr: Ipv4Addr,
        tcp_port: u16,
        udp_port: u16,
        state: ConnectionState,
        queue_capacity: usize,
        now_ms: u64,
    ) -> Result<Self> {
        Ok(Self {
            id,
            name,
            addr,
            tcp_port,
            udp_port,
            state,
            shared_state: Arc::new(AtomicU8::new(state as u8)),
            queue: Arc::new(PriorityQueue::new(queue_capacity)?),
            recv: RecvState::new(),
            stream: None,
            pending_write: BytesMut::new(),
            carry: None,
            stats: PeerStats::default(),
            last_seen_ms: now_ms,
            last_ping_sent_ms: 0,
            last_pong_ms: 0,
            send_sequence: 0,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.shared_state.store(state as u8, Ordering::Release);
    }

    /// Advance the wrapping per-frame send sequence.
    pub fn next_sequence(&mut self) -> u16 {
        self.send_sequence = self.send_sequence.wrapping_add(1);
        self.send_sequence
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            id: self.id,
            name: self.name,
            addr: self.addr,
            tcp_port: self.tcp_port,
            udp_port: self.udp_port,
            state: self.state,
            latency_ms: self.stats.latency.mean_ms(),
            quality: self.stats.latency.quality(),
            last_seen_ms: self.last_seen_ms,
            last_ping_ms: self.last_ping_sent_ms,
            last_pong_ms: self.last_pong_ms,
            stats: self.stats,
        }
    }
}

impl std::fmt::Debug for PeerRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRecord")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("tcp_port", &self.tcp_port)
            .field("state", &self.state)
            .finish()
    }
}

pub(crate) struct Registry {
    peers: HashMap<PeerId, PeerRecord, RandomState>,
    /// (address, announced TCP port) → id; the discovery identity key.
    by_endpoint: HashMap<(Ipv4Addr, u16), PeerId, RandomState>,
    names: NameTable,
    next_id: u32,
    max_peers: usize,
    queue_capacity: usize,
}

impl Registry {
    pub fn new(max_peers: usize, queue_capacity: usize) -> Self {
        Self {
            peers: HashMap::default(),
            by_endpoint: HashMap::default(),
            names: NameTable::default(),
            next_id: 1,
            max_peers,
            queue_capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn name(&self, idx: NameIdx) -> Option<&str> {
        self.names.get(idx)
    }

    pub fn get(&self, id: PeerId) -> Option<&PeerRecord> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut PeerRecord> {
        self.peers.get_mut(&id)
    }

    pub fn ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    pub fn lookup_endpoint(&self, addr: Ipv4Addr, tcp_port: u16) -> Option<PeerId> {
        self.by_endpoint.get(&(addr, tcp_port)).copied()
    }

    fn alloc_id(&mut self) -> PeerId {
        let id = PeerId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Ingest an ANNOUNCE. Refreshes an existing record keyed by
    /// (addr, tcp_port), adopts a placeholder record created by an inbound
    /// accept from the same address, or creates a fresh Discovered record.
    /// Returns the id and whether the peer is newly discovered.
    pub fn upsert_discovered(
        &mut self,
        addr: Ipv4Addr,
        tcp_port: u16,
        udp_port: u16,
        name: &str,
        now_ms: u64,
    ) -> Result<(PeerId, bool)> {
        if let Some(&id) = self.by_endpoint.get(&(addr, tcp_port)) {
            let name = self.names.intern(name)?;
            if let Some(rec) = self.peers.get_mut(&id) {
                rec.name = name;
                rec.last_seen_ms = now_ms;
            }
            return Ok((id, false));
        }

        // An inbound session from this address may predate the announce; its
        // record has no announced port yet.
        let adopted = self
            .peers
            .values()
            .find(|r| r.addr == addr && r.tcp_port == 0)
            .map(|r| r.id);
        if let Some(id) = adopted {
            let name = self.names.intern(name)?;
            if let Some(rec) = self.peers.get_mut(&id) {
                rec.name = name;
                rec.tcp_port = tcp_port;
                rec.udp_port = udp_port;
                rec.last_seen_ms = now_ms;
            }
            self.by_endpoint.insert((addr, tcp_port), id);
            return Ok((id, false));
        }

        if self.peers.len() >= self.max_peers {
            return Err(Error::InvalidState("peer table full"));
        }
        let name = self.names.intern(name)?;
        let id = self.alloc_id();
        let record = PeerRecord::new(
            id,
            name,
            addr,
            tcp_port,
            udp_port,
            ConnectionState::Discovered,
            self.queue_capacity,
            now_ms,
        )?;
        self.peers.insert(id, record);
        self.by_endpoint.insert((addr, tcp_port), id);
        Ok((id, true))
    }

    /// Attach an accepted inbound stream. Reuses a Discovered record for the
    /// same address when one exists; otherwise creates a placeholder record
    /// that a later ANNOUNCE fills in.
    pub fn attach_inbound(
        &mut self,
        stream: Box<dyn Stream>,
        addr: Ipv4Addr,
        udp_port: u16,
        now_ms: u64,
    ) -> Result<PeerId> {
        let existing = self
            .peers
            .values()
            .find(|r| {
                r.addr == addr && r.stream.is_none() && r.state() == ConnectionState::Discovered
            })
            .map(|r| r.id);
        let id = match existing {
            Some(id) => id,
            None => {
                if self.peers.len() >= self.max_peers {
                    return Err(Error::InvalidState("peer table full"));
                }
                let name = self.names.intern("")?;
                let id = self.alloc_id();
                let record = PeerRecord::new(
                    id,
                    name,
                    addr,
                    0,
                    udp_port,
                    ConnectionState::Discovered,
                    self.queue_capacity,
                    now_ms,
                )?;
                self.peers.insert(id, record);
                id
            }
        };
        if let Some(rec) = self.peers.get_mut(&id) {
            rec.stream = Some(stream);
            rec.set_state(ConnectionState::Connected);
            rec.last_seen_ms = now_ms;
        }
        Ok(id)
    }

    pub fn remove(&mut self, id: PeerId) -> Option<PeerRecord> {
        let record = self.peers.remove(&id)?;
        self.by_endpoint.remove(&(record.addr, record.tcp_port));
        Some(record)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("peers", &self.peers.len())
            .field("max_peers", &self.max_peers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 20);

    fn registry() -> Registry {
        Registry::new(4, 32)
    }

    #[test]
    fn announce_creates_then_refreshes() {
        let mut reg = registry();
        let (id, new) = reg.upsert_discovered(ADDR, 7354, 7355, "box", 10).unwrap();
        assert!(new);
        let (again, new) = reg.upsert_discovered(ADDR, 7354, 7355, "box", 20).unwrap();
        assert!(!new);
        assert_eq!(id, again);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get(id).unwrap().last_seen_ms, 20);
    }

    #[test]
    fn distinct_endpoints_are_distinct_peers() {
        let mut reg = registry();
        let (a, _) = reg.upsert_discovered(ADDR, 7354, 7355, "a", 0).unwrap();
        let (b, _) = reg.upsert_discovered(ADDR, 9000, 7355, "b", 0).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn ids_are_never_reused() {
        let mut reg = registry();
        let (a, _) = reg.upsert_discovered(ADDR, 7354, 7355, "a", 0).unwrap();
        reg.remove(a);
        let (b, _) = reg.upsert_discovered(ADDR, 7354, 7355, "a", 0).unwrap();
        assert!(b > a);
    }

    #[test]
    fn max_peers_is_enforced() {
        let mut reg = registry();
        for port in 0..4 {
            reg.upsert_discovered(ADDR, 7000 + port, 7355, "p", 0).unwrap();
        }
        assert!(matches!(
            reg.upsert_discovered(ADDR, 8000, 7355, "p", 0),
            Err(Error::InvalidState("peer table full"))
        ));
    }

    #[test]
    fn announce_adopts_inbound_placeholder() {
        let mut reg = registry();
        // Simulate an inbound record the accept path created (no stream
        // available in a unit test, so build the placeholder directly).
        let name = reg.names.intern("").unwrap();
        let id = reg.alloc_id();
        let record = PeerRecord::new(
            id,
            name,
            ADDR,
            0,
            7355,
            ConnectionState::Connected,
            32,
            5,
        )
        .unwrap();
        reg.peers.insert(id, record);

        let (merged, new) = reg.upsert_discovered(ADDR, 7354, 7355, "late", 9).unwrap();
        assert_eq!(merged, id);
        assert!(!new);
        let rec = reg.get(id).unwrap();
        assert_eq!(rec.tcp_port, 7354);
        assert_eq!(reg.name(rec.name), Some("late"));
        assert_eq!(reg.lookup_endpoint(ADDR, 7354), Some(id));
    }

    #[test]
    fn snapshot_is_a_copy() {
        let mut reg = registry();
        let (id, _) = reg.upsert_discovered(ADDR, 7354, 7355, "snap", 3).unwrap();
        let snap = reg.get(id).unwrap().snapshot();
        assert_eq!(snap.id, id);
        assert_eq!(snap.state, ConnectionState::Discovered);
        assert_eq!(snap.quality, 0);
        reg.get_mut(id).unwrap().set_state(ConnectionState::Dead);
        assert_eq!(snap.state, ConnectionState::Discovered);
    }
}
