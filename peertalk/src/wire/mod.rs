#![forbid(unsafe_code)]

//! Wire protocol: frame layouts, magics, and codecs.
//!
//! All multi-byte integers are big-endian on the wire. Every frame carries a
//! trailing CRC-16/XMODEM computed over all preceding bytes of that frame.
//!
//! Three frame families share the codec:
//! - discovery datagrams (`"PTLK"`-prefixed ANNOUNCE / GOODBYE broadcasts),
//! - stream messages (7-byte header + payload + CRC on a TCP session),
//! - unreliable datagrams (`"PTUD"`-prefixed UDP envelopes).
//!
//! Decode gating is uniform and ordered: buffer length, magic, version,
//! declared-length consistency, CRC. A failed gate returns the matching
//! [`Error`](crate::error::Error) variant and produces no partial output.

pub mod crc;

mod datagram;
mod discovery;
mod stream;

pub use datagram::{decode_envelope, encode_envelope, Envelope, ENVELOPE_PREFIX_LEN};
pub use discovery::{DiscoveryPacket, DISCOVERY_PREFIX_LEN};
pub use stream::{encode_frame, MessageHeader, STREAM_HEADER_LEN};

use bitflags::bitflags;

/// The single supported protocol version byte.
pub const PROTOCOL_VERSION: u8 = 1;

/// Magic prefix of every discovery datagram.
pub const DISCOVERY_MAGIC: [u8; 4] = *b"PTLK";

/// Magic prefix of every unreliable UDP envelope.
pub const DATAGRAM_MAGIC: [u8; 4] = *b"PTUD";

/// Longest peer name carried in a discovery packet, in bytes.
pub const MAX_NAME_LEN: usize = 31;

/// Largest application payload accepted by the send API.
pub const MAX_MESSAGE_SIZE: usize = 1024;

/// Largest stream-frame payload (one packed batch).
pub const MAX_FRAME_PAYLOAD: usize = 4096;

/// Width of the trailing CRC on every frame.
pub const CRC_LEN: usize = 2;

/// Discovery packet type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DiscoveryKind {
    Announce = 1,
    Goodbye = 2,
}

impl DiscoveryKind {
    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Announce),
            2 => Some(Self::Goodbye),
            _ => None,
        }
    }
}

/// Stream message type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// A packed batch of application payloads.
    Data = 1,
    /// Keepalive probe; payload is the sender's millisecond timestamp.
    Ping = 2,
    /// Echo of a ping payload.
    Pong = 3,
}

impl MessageKind {
    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Data),
            2 => Some(Self::Ping),
            3 => Some(Self::Pong),
            _ => None,
        }
    }
}

bitflags! {
    /// Flag bits advertised in a discovery packet.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DiscoveryFlags: u8 {
        /// The sender runs a listening host.
        const HOST = 0b0000_0001;
        /// The sender accepts incoming sessions without app consent.
        const ACCEPTING = 0b0000_0010;
    }

    /// Transport capability mask advertised in a discovery packet.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Transports: u8 {
        const TCP = 0b0000_0001;
        const UDP = 0b0000_0010;
        /// Legacy tag kept in discovery metadata for compatibility with old
        /// peers; never bound to an actual transport.
        const APPLETALK = 0b0000_0100;
    }

    /// Per-message send flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MessageFlags: u8 {
        /// Deliver over the TCP session (the default).
        const RELIABLE = 0b0000_0001;
        /// Route over the UDP envelope; may be lost or reordered.
        const UNRELIABLE = 0b0000_0010;
        /// Hint to flush without waiting to fill a batch.
        const NO_DELAY = 0b0000_0100;
    }
}

impl Default for MessageFlags {
    fn default() -> Self {
        MessageFlags::RELIABLE
    }
}
