#![forbid(unsafe_code)]

//! Unreliable UDP envelope codec.
//!
//! ```text
//! magic "PTUD" (4) | sender_port (2) | payload_len (2) | payload | crc16 (2)
//! ```
//!
//! `sender_port` carries the sender's TCP listening port so the receiver can
//! attribute the datagram to an established peer; the UDP source port is
//! ephemeral and useless for that.

use bytes::{BufMut, BytesMut};

use super::{crc, CRC_LEN, DATAGRAM_MAGIC, MAX_MESSAGE_SIZE};
use crate::error::{Error, Result};

/// Bytes before the payload.
pub const ENVELOPE_PREFIX_LEN: usize = 8;

/// A decoded envelope; the payload borrows the receive buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct Envelope<'a> {
    pub sender_port: u16,
    pub payload: &'a [u8],
}

/// Append an encoded envelope to `buf`; returns the encoded length.
pub fn encode_envelope(sender_port: u16, payload: &[u8], buf: &mut BytesMut) -> Result<usize> {
    if payload.is_empty() || payload.len() > MAX_MESSAGE_SIZE {
        return Err(Error::InvalidParam("datagram payload"));
    }
    let start = buf.len();
    buf.put_slice(&DATAGRAM_MAGIC);
    buf.put_u16(sender_port);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    let crc = crc::checksum(&buf[start..]);
    buf.put_u16(crc);
    Ok(buf.len() - start)
}

/// Decode an envelope, gating length, magic, declared length, CRC in order.
pub fn decode_envelope(buf: &[u8]) -> Result<Envelope<'_>> {
    if buf.len() < ENVELOPE_PREFIX_LEN {
        return Err(Error::Truncated);
    }
    if buf[0..4] != DATAGRAM_MAGIC {
        return Err(Error::Magic);
    }
    let payload_len = usize::from(u16::from_be_bytes([buf[6], buf[7]]));
    if payload_len > MAX_MESSAGE_SIZE || buf.len() < ENVELOPE_PREFIX_LEN + payload_len + CRC_LEN {
        return Err(Error::Truncated);
    }
    let body_end = ENVELOPE_PREFIX_LEN + payload_len;
    let expected = u16::from_be_bytes([buf[body_end], buf[body_end + 1]]);
    if !crc::verify(&buf[..body_end], expected) {
        return Err(Error::Crc);
    }
    Ok(Envelope {
        sender_port: u16::from_be_bytes([buf[4], buf[5]]),
        payload: &buf[ENVELOPE_PREFIX_LEN..body_end],
    })
}
