#![forbid(unsafe_code)]

//! Stream message framing for TCP sessions.
//!
//! ```text
//! version (1) | type (1) | flags (1) | sequence (2) | payload_len (2)
//! | payload (payload_len) | crc16 (2)
//! ```
//!
//! The CRC trails the payload and covers header plus payload. Header decode
//! gates only version and type; the receive state machine checks the CRC once
//! the payload has arrived (and bounds `payload_len` itself, since the bound
//! depends on connection teardown policy).

use bytes::{BufMut, BytesMut};

use super::{crc, MessageFlags, MessageKind, PROTOCOL_VERSION};
use crate::error::{Error, Result};

/// Fixed header size.
pub const STREAM_HEADER_LEN: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub kind: MessageKind,
    pub flags: MessageFlags,
    pub sequence: u16,
    pub payload_len: u16,
}

impl MessageHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.flags.bits());
        buf.put_u16(self.sequence);
        buf.put_u16(self.payload_len);
    }

    /// Decode and gate a header. An unknown type byte reports `Magic`: the
    /// version/type pair is the stream's frame marker, and a stream carrying
    /// anything else is not speaking this protocol.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < STREAM_HEADER_LEN {
            return Err(Error::Truncated);
        }
        if buf[0] != PROTOCOL_VERSION {
            return Err(Error::Version);
        }
        let kind = MessageKind::from_u8(buf[1]).ok_or(Error::Magic)?;
        Ok(Self {
            kind,
            flags: MessageFlags::from_bits_retain(buf[2]),
            sequence: u16::from_be_bytes([buf[3], buf[4]]),
            payload_len: u16::from_be_bytes([buf[5], buf[6]]),
        })
    }
}

/// Append a complete frame (header, payload, CRC) to `buf`; returns the
/// frame length.
pub fn encode_frame(
    kind: MessageKind,
    flags: MessageFlags,
    sequence: u16,
    payload: &[u8],
    buf: &mut BytesMut,
) -> usize {
    let start = buf.len();
    let header = MessageHeader { kind, flags, sequence, payload_len: payload.len() as u16 };
    header.encode(buf);
    buf.put_slice(payload);
    let crc = crc::checksum(&buf[start..]);
    buf.put_u16(crc);
    buf.len() - start
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = MessageHeader {
            kind: MessageKind::Data,
            flags: MessageFlags::RELIABLE | MessageFlags::NO_DELAY,
            sequence: 0xBEEF,
            payload_len: 512,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), STREAM_HEADER_LEN);
        assert_eq!(MessageHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn header_gates() {
        let mut buf = BytesMut::new();
        MessageHeader {
            kind: MessageKind::Ping,
            flags: MessageFlags::empty(),
            sequence: 1,
            payload_len: 8,
        }
        .encode(&mut buf);

        assert!(matches!(MessageHeader::decode(&buf[..6]), Err(Error::Truncated)));

        let mut bad_version = buf.clone();
        bad_version[0] = 2;
        assert!(matches!(MessageHeader::decode(&bad_version), Err(Error::Version)));

        let mut bad_kind = buf.clone();
        bad_kind[1] = 0x7F;
        assert!(matches!(MessageHeader::decode(&bad_kind), Err(Error::Magic)));
    }

    #[test]
    fn frame_crc_covers_header_and_payload() {
        let mut buf = BytesMut::new();
        let len = encode_frame(MessageKind::Data, MessageFlags::RELIABLE, 7, b"hello", &mut buf);
        assert_eq!(len, STREAM_HEADER_LEN + 5 + 2);
        let expected = crc::checksum(&buf[..len - 2]);
        assert_eq!(u16::from_be_bytes([buf[len - 2], buf[len - 1]]), expected);
    }
}
