#![forbid(unsafe_code)]

//! CRC-16/XMODEM: polynomial 0x1021, zero init, no reflection, no xor-out.
//!
//! Reference check value: `checksum(b"123456789") == 0x2189`.

use crc::{Crc, CRC_16_XMODEM};

const XMODEM: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// CRC over a complete byte span.
pub fn checksum(bytes: &[u8]) -> u16 {
    XMODEM.checksum(bytes)
}

/// Continue a CRC from a previous [`checksum`] / [`update`] result, so that
/// `update(checksum(a), b) == checksum(a ++ b)`.
pub fn update(prev: u16, bytes: &[u8]) -> u16 {
    let mut digest = XMODEM.digest_with_initial(prev);
    digest.update(bytes);
    digest.finalize()
}

/// Compare a span against an expected CRC.
pub fn verify(bytes: &[u8], expected: u16) -> bool {
    checksum(bytes) == expected
}
