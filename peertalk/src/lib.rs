#![deny(unsafe_code)]

//! PeerTalk: embeddable peer-to-peer messaging for LANs.
//!
//! Cooperating peers discover each other over UDP broadcast, establish
//! reliable TCP sessions (with an optional unreliable UDP side-channel),
//! exchange length-framed CRC-protected messages, and surface connectivity
//! and quality telemetry to the embedding application.
//!
//! The embedder owns the schedule: everything advances inside
//! [`PeerTalk::poll`], called from a single thread. Sends are the exception:
//! [`SendHandle`] (and the queue's interrupt-safe push) may run from any
//! thread or, on embedded hosts, from interrupt context, touching nothing
//! but the per-peer lock-free rings.
//!
//! ```no_run
//! use peertalk::{Config, PeerTalk};
//!
//! # fn main() -> peertalk::Result<()> {
//! let mut node = PeerTalk::new(Config::default())?;
//! node.start_listening()?;
//! node.start_discovery()?;
//! loop {
//!     node.poll()?;
//!     std::thread::sleep(std::time::Duration::from_millis(10));
//! }
//! # }
//! ```
//!
//! The `unsafe_code` deny has one sanctioned exception: the lock-free slot
//! handoff inside [`queue`].

pub mod batch;
pub mod config;
pub mod queue;
pub mod recv;
pub mod stats;
pub mod telemetry;
pub mod transport;
pub mod wire;

mod clock;
mod context;
mod discovery;
mod error;
mod handle;
mod peer;

pub use config::{load_from_path, Config};
pub use context::{Events, PeerTalk};
pub use error::{Error, Result};
pub use handle::SendHandle;
pub use peer::{ConnectionState, DisconnectReason, NameIdx, PeerId, PeerSnapshot};
pub use queue::{BackpressureLevel, Priority, PriorityQueue, QueueStatus};
pub use stats::{GlobalSnapshot, LatencyFilter, PeerStats};
pub use wire::{DiscoveryFlags, MessageFlags, Transports, MAX_MESSAGE_SIZE, MAX_NAME_LEN};
