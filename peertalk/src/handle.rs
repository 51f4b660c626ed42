#![forbid(unsafe_code)]

//! Producer-side send path.
//!
//! [`SendHandle`] is the only surface that may run concurrently with
//! `poll()`. It reaches per-peer queues through an arc-swapped routing
//! snapshot (producers never walk the registry) and hands UNRELIABLE
//! sends straight to the UDP channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use ahash::RandomState;
use arc_swap::{ArcSwap, ArcSwapOption};
use bytes::BytesMut;

use crate::error::{Error, Result};
use crate::peer::{ConnectionState, PeerId};
use crate::queue::{PriorityQueue, Priority};
use crate::stats::GlobalStats;
use crate::telemetry::hot_trace;
use crate::transport::Datagram;
use crate::wire::{encode_envelope, MessageFlags, MAX_MESSAGE_SIZE};

/// Producer-visible entry for one live peer.
pub(crate) struct Route {
    pub queue: Arc<PriorityQueue>,
    /// Mirror of the registry's connection state.
    pub state: Arc<std::sync::atomic::AtomicU8>,
    pub udp_addr: SocketAddr,
}

impl Route {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }
}

pub(crate) type RouteMap = HashMap<PeerId, Route, RandomState>;

/// The UDP side-channel as producers see it.
pub(crate) struct UdpEndpoint {
    pub socket: Arc<dyn Datagram>,
    /// Our TCP listening port; stamped into envelopes as the sender identity.
    pub sender_port: u16,
}

/// State shared between the context and its send handles.
pub(crate) struct Shared {
    pub routes: ArcSwap<RouteMap>,
    pub udp: ArcSwapOption<UdpEndpoint>,
    pub stats: GlobalStats,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            routes: ArcSwap::from_pointee(RouteMap::default()),
            udp: ArcSwapOption::empty(),
            stats: GlobalStats::default(),
        }
    }
}

/// Cloneable, thread-safe sender. Obtain via
/// [`PeerTalk::handle`](crate::PeerTalk::handle).
#[derive(Clone)]
pub struct SendHandle {
    shared: Arc<Shared>,
}

impl SendHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Reliable send at NORMAL priority.
    pub fn send(&self, peer: PeerId, data: &[u8]) -> Result<()> {
        self.send_ex(peer, data, Priority::Normal, MessageFlags::RELIABLE, 0)
    }

    /// Full-form send.
    pub fn send_ex(
        &self,
        peer: PeerId,
        data: &[u8],
        priority: Priority,
        flags: MessageFlags,
        coalesce_key: u32,
    ) -> Result<()> {
        validate_send(data, flags)?;
        let routes = self.shared.routes.load();
        let route = routes.get(&peer).ok_or(Error::PeerNotFound)?;
        if flags.contains(MessageFlags::UNRELIABLE) {
            self.send_datagram(route, data)
        } else {
            route.queue.try_push(data, priority, flags, coalesce_key)?;
            hot_trace!(%peer, len = data.len(), ?priority, "message queued");
            Ok(())
        }
    }

    /// Enqueue to every connected peer. Mirrors the classic semantics:
    /// PeerNotFound when no peer is connected; peers whose queue refuses
    /// admission are skipped. Returns how many peers the message reached.
    pub fn broadcast(&self, data: &[u8]) -> Result<usize> {
        validate_send(data, MessageFlags::RELIABLE)?;
        let routes = self.shared.routes.load();
        let mut connected = 0;
        let mut reached = 0;
        for route in routes.values() {
            if route.state() != ConnectionState::Connected {
                continue;
            }
            connected += 1;
            if route
                .queue
                .try_push(data, Priority::Normal, MessageFlags::RELIABLE, 0)
                .is_ok()
            {
                reached += 1;
            }
        }
        if connected == 0 {
            return Err(Error::PeerNotFound);
        }
        Ok(reached)
    }

    /// UDP fast path: encode an envelope and hand it to the transport now.
    /// Never enters the ring; a transport failure counts the message dropped
    /// and is not retried.
    fn send_datagram(&self, route: &Route, data: &[u8]) -> Result<()> {
        let Some(udp) = self.shared.udp.load_full() else {
            return Err(Error::InvalidState("udp channel not started"));
        };
        let mut buf = BytesMut::with_capacity(data.len() + 16);
        encode_envelope(udp.sender_port, data, &mut buf)?;
        match udp.socket.send_to(&buf, route.udp_addr) {
            Ok(n) => {
                self.shared.stats.add_bytes_sent(n);
                self.shared.stats.add_messages_sent(1);
                Ok(())
            }
            Err(e) => {
                self.shared.stats.inc_messages_dropped();
                Err(Error::Transport(e))
            }
        }
    }
}

impl std::fmt::Debug for SendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendHandle")
            .field("routes", &self.shared.routes.load().len())
            .finish()
    }
}

fn validate_send(data: &[u8], flags: MessageFlags) -> Result<()> {
    if data.is_empty() || data.len() > MAX_MESSAGE_SIZE {
        return Err(Error::InvalidParam("payload length"));
    }
    if !MessageFlags::all().contains(flags) {
        return Err(Error::InvalidParam("unknown flag bits"));
    }
    if flags.contains(MessageFlags::RELIABLE | MessageFlags::UNRELIABLE) {
        return Err(Error::InvalidParam("conflicting delivery flags"));
    }
    Ok(())
}
