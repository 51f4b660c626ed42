#![forbid(unsafe_code)]

use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};
use crate::queue::{DEFAULT_QUEUE_CAPACITY, MAX_QUEUE_CAPACITY};
use crate::telemetry::TelemetryConfig;
use crate::wire::{Transports, MAX_NAME_LEN};

/// Context configuration. Every field has a default, so a TOML file (or a
/// struct literal) only needs to name what it changes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name announced in discovery packets; at most 31 bytes.
    pub local_name: String,
    /// Peer table capacity.
    pub max_peers: usize,
    /// UDP port discovery broadcasts use.
    pub discovery_port: u16,
    /// TCP listening port; doubles as this peer's identity key in discovery.
    pub tcp_port: u16,
    /// UDP port for the unreliable message side-channel.
    pub udp_port: u16,
    /// ANNOUNCE cadence.
    pub discovery_interval_ms: u64,
    /// Keepalive cadence on connected peers.
    pub ping_interval_ms: u64,
    /// Silence after which a peer is dead. Also bounds connect attempts and
    /// the staleness of never-connected discovered peers.
    pub peer_timeout_ms: u64,
    /// Transport capabilities advertised in discovery.
    #[serde(deserialize_with = "de_transports")]
    pub transports: Transports,
    /// Accept incoming sessions without app consent.
    pub auto_accept: bool,
    /// Reap dead and stale peers automatically. When off, dead records stay
    /// observable so the embedder can drive its own reaping policy.
    pub auto_cleanup: bool,
    /// Per-peer send queue capacity; a power of two.
    pub queue_capacity: usize,
    pub telemetry: TelemetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_name: "peer".to_owned(),
            max_peers: 16,
            discovery_port: 7353,
            tcp_port: 7354,
            udp_port: 7355,
            discovery_interval_ms: 5000,
            ping_interval_ms: 3000,
            peer_timeout_ms: 15_000,
            transports: Transports::TCP | Transports::UDP,
            auto_accept: true,
            auto_cleanup: true,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl Config {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.local_name.len() > MAX_NAME_LEN || self.local_name.contains('\0') {
            return Err(Error::InvalidParam("local_name"));
        }
        if self.max_peers == 0 {
            return Err(Error::InvalidParam("max_peers"));
        }
        if !self.queue_capacity.is_power_of_two()
            || self.queue_capacity < 2
            || self.queue_capacity > MAX_QUEUE_CAPACITY
        {
            return Err(Error::InvalidParam("queue_capacity"));
        }
        if self.discovery_interval_ms == 0
            || self.ping_interval_ms == 0
            || self.peer_timeout_ms == 0
        {
            return Err(Error::InvalidParam("interval"));
        }
        if self.transports.is_empty() {
            return Err(Error::InvalidParam("transports"));
        }
        if self.discovery_port != 0 && self.discovery_port == self.udp_port {
            return Err(Error::InvalidParam("discovery_port"));
        }
        Ok(())
    }
}

fn de_transports<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<Transports, D::Error> {
    let names = Vec::<String>::deserialize(de)?;
    let mut mask = Transports::empty();
    for name in &names {
        mask |= match name.to_ascii_lowercase().as_str() {
            "tcp" => Transports::TCP,
            "udp" => Transports::UDP,
            "appletalk" => Transports::APPLETALK,
            other => return Err(serde::de::Error::custom(format!("unknown transport: {other}"))),
        };
    }
    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.discovery_port, 7353);
        assert_eq!(cfg.tcp_port, 7354);
        assert_eq!(cfg.udp_port, 7355);
        assert_eq!(cfg.max_peers, 16);
        assert_eq!(cfg.discovery_interval_ms, 5000);
        assert_eq!(cfg.ping_interval_ms, 3000);
        assert_eq!(cfg.peer_timeout_ms, 15_000);
        assert!(cfg.auto_accept);
        assert!(cfg.auto_cleanup);
    }

    #[test]
    fn rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.local_name = "x".repeat(MAX_NAME_LEN + 1);
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.queue_capacity = 33;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.max_peers = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.transports = Transports::empty();
        assert!(cfg.validate().is_err());
    }
}
