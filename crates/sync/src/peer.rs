//! Per-peer bookkeeping.

use crate::controller::Controller;
use crate::ids::SyncGroupId;

/// Server-side authority data, never synchronized.
#[derive(Debug, Clone, Copy)]
pub struct PeerAuthority {
    pub enabled: bool,
    pub sync_group: SyncGroupId,
}

impl Default for PeerAuthority {
    fn default() -> Self {
        Self {
            enabled: true,
            sync_group: SyncGroupId::GLOBAL,
        }
    }
}

/// Server-side snapshot bookkeeping for one peer.
#[derive(Debug, Clone)]
pub struct PeerServerData {
    /// Notify the state as soon as possible, regardless of the interval.
    pub force_notify_snapshot: bool,
    /// The next snapshot must be a full one.
    pub need_full_snapshot: bool,
    /// Seconds since the latest latency update piggy-backed on a snapshot.
    pub latency_update_via_snapshot_sec: f32,
    /// Seconds since the latest network statistics update.
    pub netstats_peer_update_sec: f32,
}

impl Default for PeerServerData {
    fn default() -> Self {
        Self {
            force_notify_snapshot: true,
            need_full_snapshot: true,
            latency_update_via_snapshot_sec: 0.0,
            netstats_peer_update_sec: 0.0,
        }
    }
}

/// Latency is carried over the wire as an 8-bit value in 4 ms steps
/// (0..=1020 ms).
const LATENCY_STEP_MS: f32 = 4.0;

pub struct PeerData {
    pub authority: PeerAuthority,
    compressed_latency: u8,
    /// Fresh latency measurement not yet distributed via snapshot.
    pub latency_updated: bool,
    out_packet_loss_percentage: f32,
    latency_jitter_ms: f32,
    pub server: PeerServerData,
    pub controller: Option<Controller>,
}

impl Default for PeerData {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerData {
    pub fn new() -> Self {
        Self {
            authority: PeerAuthority::default(),
            compressed_latency: 0,
            latency_updated: false,
            out_packet_loss_percentage: 0.0,
            latency_jitter_ms: 0.0,
            server: PeerServerData::default(),
            controller: None,
        }
    }

    pub fn set_latency(&mut self, ms: f32) {
        self.compressed_latency = (ms / LATENCY_STEP_MS)
            .round()
            .clamp(0.0, u8::MAX as f32) as u8;
        self.latency_updated = true;
    }

    pub fn latency_ms(&self) -> f32 {
        self.compressed_latency as f32 * LATENCY_STEP_MS
    }

    pub fn set_compressed_latency(&mut self, compressed: u8) {
        self.compressed_latency = compressed;
    }

    pub fn compressed_latency(&self) -> u8 {
        self.compressed_latency
    }

    pub fn set_out_packet_loss_percentage(&mut self, loss: f32) {
        self.out_packet_loss_percentage = loss.clamp(0.0, 1.0);
    }

    pub fn out_packet_loss_percentage(&self) -> f32 {
        self.out_packet_loss_percentage
    }

    pub fn set_latency_jitter_ms(&mut self, jitter: f32) {
        self.latency_jitter_ms = jitter;
    }

    pub fn latency_jitter_ms(&self) -> f32 {
        self.latency_jitter_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_quantizes_to_4ms_steps() {
        let mut peer = PeerData::new();
        peer.set_latency(100.0);
        assert_eq!(peer.compressed_latency(), 25);
        assert_eq!(peer.latency_ms(), 100.0);
        assert!(peer.latency_updated);
    }

    #[test]
    fn latency_saturates() {
        let mut peer = PeerData::new();
        peer.set_latency(10_000.0);
        assert_eq!(peer.compressed_latency(), u8::MAX);
    }

    #[test]
    fn new_peers_need_a_full_snapshot() {
        let peer = PeerData::new();
        assert!(peer.server.need_full_snapshot);
        assert!(peer.server.force_notify_snapshot);
    }
}
