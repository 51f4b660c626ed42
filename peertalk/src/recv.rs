#![forbid(unsafe_code)]

//! Streaming receive state machine.
//!
//! Turns the unreliable chunking of a TCP byte stream into validated frames:
//! HEADER (7 bytes) → PAYLOAD (declared length) → CRC (2 bytes), resilient to
//! arbitrary partial reads across poll cycles. Each delivered or dropped
//! frame resets the machine to HEADER.
//!
//! There is deliberately no resync heuristic: a header that cannot be valid
//! (wrong version/type marker, or a payload length beyond the frame bound)
//! surfaces as an error and the caller tears the connection down with a
//! protocol-error reason.

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::wire::{crc, MessageHeader, CRC_LEN, MAX_FRAME_PAYLOAD, STREAM_HEADER_LEN};

#[derive(Debug, Clone, Copy)]
enum Phase {
    Header,
    Payload { header: MessageHeader },
    Crc { header: MessageHeader },
}

/// Outcome of one [`RecvState::advance`] step.
#[derive(Debug)]
pub enum Step {
    /// Input exhausted mid-frame; call again when more bytes arrive.
    Pending,
    /// A fully validated frame.
    Frame { header: MessageHeader, payload: Bytes },
    /// CRC mismatch; the frame was dropped and the machine reset.
    BadCrc,
}

#[derive(Debug)]
pub struct RecvState {
    phase: Phase,
    header_buf: [u8; STREAM_HEADER_LEN],
    header_fill: usize,
    payload: BytesMut,
    crc_buf: [u8; CRC_LEN],
    crc_fill: usize,
}

impl RecvState {
    pub fn new() -> Self {
        Self {
            phase: Phase::Header,
            header_buf: [0; STREAM_HEADER_LEN],
            header_fill: 0,
            payload: BytesMut::new(),
            crc_buf: [0; CRC_LEN],
            crc_fill: 0,
        }
    }

    /// Consume bytes from the front of `input` until one outcome is reached.
    /// Call in a loop while `input` is non-empty. An `Err` is a protocol
    /// error; the connection must be torn down.
    pub fn advance(&mut self, input: &mut &[u8]) -> Result<Step> {
        loop {
            match self.phase {
                Phase::Header => {
                    let take = (STREAM_HEADER_LEN - self.header_fill).min(input.len());
                    self.header_buf[self.header_fill..self.header_fill + take]
                        .copy_from_slice(&input[..take]);
                    self.header_fill += take;
                    *input = &input[take..];
                    if self.header_fill < STREAM_HEADER_LEN {
                        return Ok(Step::Pending);
                    }
                    let header = MessageHeader::decode(&self.header_buf)?;
                    if usize::from(header.payload_len) > MAX_FRAME_PAYLOAD {
                        return Err(Error::Truncated);
                    }
                    self.payload.clear();
                    if header.payload_len == 0 {
                        self.phase = Phase::Crc { header };
                    } else {
                        self.payload.reserve(usize::from(header.payload_len));
                        self.phase = Phase::Payload { header };
                    }
                }
                Phase::Payload { header } => {
                    let want = usize::from(header.payload_len) - self.payload.len();
                    let take = want.min(input.len());
                    self.payload.extend_from_slice(&input[..take]);
                    *input = &input[take..];
                    if self.payload.len() < usize::from(header.payload_len) {
                        return Ok(Step::Pending);
                    }
                    self.phase = Phase::Crc { header };
                }
                Phase::Crc { header } => {
                    let take = (CRC_LEN - self.crc_fill).min(input.len());
                    self.crc_buf[self.crc_fill..self.crc_fill + take]
                        .copy_from_slice(&input[..take]);
                    self.crc_fill += take;
                    *input = &input[take..];
                    if self.crc_fill < CRC_LEN {
                        return Ok(Step::Pending);
                    }
                    let expected = u16::from_be_bytes(self.crc_buf);
                    let actual = crc::update(crc::checksum(&self.header_buf), &self.payload);
                    self.reset();
                    if actual == expected {
                        let payload = self.payload.split().freeze();
                        return Ok(Step::Frame { header, payload });
                    }
                    self.payload.clear();
                    return Ok(Step::BadCrc);
                }
            }
        }
    }

    fn reset(&mut self) {
        self.phase = Phase::Header;
        self.header_fill = 0;
        self.crc_fill = 0;
    }
}

impl Default for RecvState {
    fn default() -> Self {
        Self::new()
    }
}
