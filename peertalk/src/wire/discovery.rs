#![forbid(unsafe_code)]

//! Discovery packet codec.
//!
//! Layout (big-endian):
//!
//! ```text
//! magic "PTLK" (4) | version (1) | type (1) | flags (1) | sender_port (2)
//! | transports (1) | name_len (1) | name (0..=31) | crc16 (2)
//! ```
//!
//! `sender_port` is the announcing peer's TCP listening port; together with
//! the datagram source address it is the peer's identity key.

use bytes::{BufMut, BytesMut};

use super::{
    crc, DiscoveryFlags, DiscoveryKind, Transports, CRC_LEN, DISCOVERY_MAGIC, MAX_NAME_LEN,
    PROTOCOL_VERSION,
};
use crate::error::{Error, Result};

/// Bytes before the variable-length name.
pub const DISCOVERY_PREFIX_LEN: usize = 11;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryPacket {
    pub kind: DiscoveryKind,
    pub flags: DiscoveryFlags,
    pub sender_port: u16,
    pub transports: Transports,
    pub name: String,
}

impl DiscoveryPacket {
    /// Append the encoded packet to `buf` and return the encoded length.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<usize> {
        let name = self.name.as_bytes();
        if name.len() > MAX_NAME_LEN || name.contains(&0) {
            return Err(Error::InvalidParam("discovery name"));
        }
        let start = buf.len();
        buf.put_slice(&DISCOVERY_MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.flags.bits());
        buf.put_u16(self.sender_port);
        buf.put_u8(self.transports.bits());
        buf.put_u8(name.len() as u8);
        buf.put_slice(name);
        let crc = crc::checksum(&buf[start..]);
        buf.put_u16(crc);
        Ok(buf.len() - start)
    }

    /// Decode a packet, gating in order: length, magic, version, declared
    /// length, CRC. No field is produced unless every gate passes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < DISCOVERY_PREFIX_LEN {
            return Err(Error::Truncated);
        }
        if buf[0..4] != DISCOVERY_MAGIC {
            return Err(Error::Magic);
        }
        if buf[4] != PROTOCOL_VERSION {
            return Err(Error::Version);
        }
        let name_len = usize::from(buf[10]);
        if name_len > MAX_NAME_LEN || buf.len() < DISCOVERY_PREFIX_LEN + name_len + CRC_LEN {
            return Err(Error::Truncated);
        }
        let body_end = DISCOVERY_PREFIX_LEN + name_len;
        let expected = u16::from_be_bytes([buf[body_end], buf[body_end + 1]]);
        if !crc::verify(&buf[..body_end], expected) {
            return Err(Error::Crc);
        }
        let kind = DiscoveryKind::from_u8(buf[5]).ok_or(Error::InvalidParam("discovery type"))?;
        let name_bytes = &buf[DISCOVERY_PREFIX_LEN..body_end];
        if name_bytes.contains(&0) {
            return Err(Error::InvalidParam("discovery name"));
        }
        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| Error::InvalidParam("discovery name"))?
            .to_owned();
        Ok(Self {
            kind,
            flags: DiscoveryFlags::from_bits_retain(buf[6]),
            sender_port: u16::from_be_bytes([buf[7], buf[8]]),
            transports: Transports::from_bits_retain(buf[9]),
            name,
        })
    }
}
