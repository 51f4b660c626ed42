#![forbid(unsafe_code)]

use thiserror::Error;

use crate::queue::BackpressureLevel;

/// Errors surfaced by the library.
///
/// The Display strings of the wire-gating variants (`Truncated`, `Magic`,
/// `Version`, `Crc`) are part of the public contract; embedder test suites
/// match on them.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid parameter: {0}")]
    InvalidParam(&'static str),

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Peer not found")]
    PeerNotFound,

    #[error("Queue full at {level:?} backpressure")]
    QueueFull { level: BackpressureLevel },

    #[error("Truncated packet")]
    Truncated,

    #[error("Invalid magic number")]
    Magic,

    #[error("Protocol version mismatch")]
    Version,

    #[error("CRC validation failed")]
    Crc,

    #[error("Operation timed out")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
