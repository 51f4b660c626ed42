#![forbid(unsafe_code)]

//! Peer identity, lifecycle, and the registry.
//!
//! Peers are addressed by a stable [`PeerId`] that is never reused within a
//! process. The registry owns every record; the embedder only ever sees ids
//! plus read-only [`PeerSnapshot`] copies, never a handle into the registry.

mod intern;
mod registry;

pub use intern::NameIdx;
pub(crate) use registry::{PeerRecord, Registry};

use std::fmt;
use std::net::Ipv4Addr;

use crate::stats::PeerStats;

/// Stable peer identifier; monotonically assigned, unique per process
/// lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Connection lifecycle of a peer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Seen via ANNOUNCE; no session yet.
    Discovered = 0,
    /// Outbound connect in progress.
    Connecting = 1,
    /// Session established; traffic flows.
    Connected = 2,
    /// Local disconnect requested; flushing outstanding sends.
    Disconnecting = 3,
    /// Session over; record awaits reaping.
    Dead = 4,
}

impl ConnectionState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Discovered,
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Disconnecting,
            _ => Self::Dead,
        }
    }
}

/// Why a peer left the Connected state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The local side called disconnect.
    Requested,
    /// The remote closed the stream.
    RemoteClosed,
    /// No activity within the peer timeout.
    Timeout,
    /// The peer sent bytes that cannot be valid protocol traffic.
    Protocol,
    /// The transport reported an unrecoverable error.
    Transport,
    /// The context is shutting down.
    Shutdown,
}

/// Read-only copy of a peer record handed to callbacks and inspection calls.
///
/// The name is carried as an intern-table index to keep the struct small and
/// `Copy`; resolve it through [`PeerTalk::peer_name`](crate::PeerTalk::peer_name).
#[derive(Debug, Clone, Copy)]
pub struct PeerSnapshot {
    pub id: PeerId,
    pub name: NameIdx,
    pub addr: Ipv4Addr,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub state: ConnectionState,
    pub latency_ms: u16,
    pub quality: u8,
    pub last_seen_ms: u64,
    pub last_ping_ms: u64,
    pub last_pong_ms: u64,
    pub stats: PeerStats,
}
