#![forbid(unsafe_code)]

//! Global and per-peer counters, rolling latency, and the quality score.

use std::sync::atomic::{AtomicU32, Ordering};

/// Process-wide counters. All fields are 32-bit and wrap; consumers that
/// need monotonic growth across long runs must detect wrap themselves.
#[derive(Debug, Default)]
pub struct GlobalStats {
    bytes_sent: AtomicU32,
    bytes_received: AtomicU32,
    messages_sent: AtomicU32,
    messages_received: AtomicU32,
    messages_dropped: AtomicU32,
    discovery_packets_sent: AtomicU32,
    discovery_packets_received: AtomicU32,
    connections_accepted: AtomicU32,
    connections_rejected: AtomicU32,
    peers_discovered: AtomicU32,
    peers_connected: AtomicU32,
}

/// Point-in-time copy of [`GlobalStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalSnapshot {
    pub bytes_sent: u32,
    pub bytes_received: u32,
    pub messages_sent: u32,
    pub messages_received: u32,
    pub messages_dropped: u32,
    pub discovery_packets_sent: u32,
    pub discovery_packets_received: u32,
    pub connections_accepted: u32,
    pub connections_rejected: u32,
    pub peers_discovered: u32,
    pub peers_connected: u32,
}

impl GlobalStats {
    pub(crate) fn add_bytes_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u32, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u32, Ordering::Relaxed);
    }

    pub(crate) fn add_messages_sent(&self, n: u32) {
        self.messages_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_messages_received(&self, n: u32) {
        self.messages_received.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn inc_messages_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_discovery_sent(&self) {
        self.discovery_packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_discovery_received(&self) {
        self.discovery_packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_connections_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_connections_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_peers_discovered(&self) {
        self.peers_discovered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_peers_connected(&self) {
        self.peers_connected.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements on disconnect, floored at zero, even when auto-cleanup is
    /// disabled and the dead record remains observable.
    pub(crate) fn dec_peers_connected(&self) {
        self.peers_connected
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1))
            .ok();
    }

    pub fn snapshot(&self) -> GlobalSnapshot {
        GlobalSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            discovery_packets_sent: self.discovery_packets_sent.load(Ordering::Relaxed),
            discovery_packets_received: self.discovery_packets_received.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            peers_discovered: self.peers_discovered.load(Ordering::Relaxed),
            peers_connected: self.peers_connected.load(Ordering::Relaxed),
        }
    }
}

/// Exponentially weighted round-trip filter, smoothing factor 1/8, with the
/// same filter applied to |sample − mean| as a cheap deviation estimate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyFilter {
    mean_ms: u16,
    deviation_ms: u16,
    samples: u32,
}

impl LatencyFilter {
    pub fn record(&mut self, sample_ms: u16) {
        if self.samples == 0 {
            self.mean_ms = sample_ms;
            self.deviation_ms = 0;
        } else {
            let mean = i32::from(self.mean_ms);
            let sample = i32::from(sample_ms);
            let deviation = i32::from(self.deviation_ms);
            self.mean_ms = clamp_u16(mean + (sample - mean) / 8);
            self.deviation_ms = clamp_u16(deviation + ((sample - mean).abs() - deviation) / 8);
        }
        self.samples = self.samples.saturating_add(1);
    }

    pub fn mean_ms(&self) -> u16 {
        self.mean_ms
    }

    pub fn deviation_ms(&self) -> u16 {
        self.deviation_ms
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    /// Coarse health score from the current mean. Zero samples map to 0:
    /// unknown, not perfect.
    pub fn quality(&self) -> u8 {
        if self.samples == 0 {
            return 0;
        }
        match self.mean_ms {
            0..=4 => 100,
            5..=9 => 90,
            10..=19 => 75,
            20..=49 => 50,
            _ => 25,
        }
    }
}

fn clamp_u16(v: i32) -> u16 {
    v.clamp(0, i32::from(u16::MAX)) as u16
}

/// Per-peer data counters; owned and updated by the poll thread, copied into
/// snapshots on request. Same wrapping-u32 policy as the globals.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerStats {
    pub bytes_sent: u32,
    pub bytes_received: u32,
    pub messages_sent: u32,
    pub messages_received: u32,
    pub frames_dropped: u32,
    pub latency: LatencyFilter,
}

impl PeerStats {
    pub(crate) fn add_sent(&mut self, bytes: usize, messages: u32) {
        self.bytes_sent = self.bytes_sent.wrapping_add(bytes as u32);
        self.messages_sent = self.messages_sent.wrapping_add(messages);
    }

    pub(crate) fn add_received(&mut self, bytes: usize, messages: u32) {
        self.bytes_received = self.bytes_received.wrapping_add(bytes as u32);
        self.messages_received = self.messages_received.wrapping_add(messages);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_bands() {
        let mut filter = LatencyFilter::default();
        assert_eq!(filter.quality(), 0, "no samples means unknown");

        for (sample, quality) in [(3u16, 100u8), (4, 100)] {
            let mut f = LatencyFilter::default();
            f.record(sample);
            assert_eq!(f.quality(), quality);
        }
        for (sample, quality) in [(5u16, 90u8), (9, 90), (10, 75), (19, 75), (20, 50), (49, 50), (50, 25), (900, 25)] {
            let mut f = LatencyFilter::default();
            f.record(sample);
            assert_eq!(f.quality(), quality, "sample {sample}");
        }

        filter.record(2);
        assert_eq!(filter.quality(), 100);
    }

    #[test]
    fn filter_converges_toward_samples() {
        let mut filter = LatencyFilter::default();
        filter.record(100);
        assert_eq!(filter.mean_ms(), 100);
        for _ in 0..64 {
            filter.record(20);
        }
        // Integer smoothing settles within one filter step of the input.
        assert!(
            (20..=27).contains(&filter.mean_ms()),
            "mean {} did not converge",
            filter.mean_ms()
        );
        assert!(filter.deviation_ms() < 20);
    }

    #[test]
    fn first_sample_sets_mean_exactly() {
        let mut filter = LatencyFilter::default();
        filter.record(42);
        assert_eq!(filter.mean_ms(), 42);
        assert_eq!(filter.deviation_ms(), 0);
        assert_eq!(filter.samples(), 1);
    }

    #[test]
    fn global_counters_wrap() {
        let stats = GlobalStats::default();
        stats.add_messages_sent(u32::MAX);
        stats.add_messages_sent(2);
        assert_eq!(stats.snapshot().messages_sent, 1);
    }

    #[test]
    fn peers_connected_floors_at_zero() {
        let stats = GlobalStats::default();
        stats.dec_peers_connected();
        assert_eq!(stats.snapshot().peers_connected, 0);
        stats.inc_peers_connected();
        stats.dec_peers_connected();
        assert_eq!(stats.snapshot().peers_connected, 0);
    }
}
