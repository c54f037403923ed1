//! Configuration surface of the synchronization core.

use serde::{Deserialize, Serialize};

/// Hard cap on the tick-speed adjustment sent to clients, in extra (or
/// fewer) frames per second.
pub const MAX_ADDITIONAL_TICK_SPEED: f32 = 2.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // -- Snapshot --
    /// Seconds between authoritative state notifications. `0` notifies every
    /// tick.
    pub server_notify_state_interval: f32,
    /// Absolute tolerance used by every float comparison during snapshot
    /// matching.
    pub comparison_float_tolerance: f64,

    // -- Controller --
    /// When true, newly created controllers run server-side
    /// (`AutonomousServer`) and every client sees them as dolls.
    pub server_controlled: bool,
    /// Cap on inputs the player controller may buffer ahead of the server.
    pub player_input_storage_size: usize,
    /// How many past inputs ride along each unreliable input packet.
    pub max_redundant_inputs: usize,
    /// Milliseconds between tick-speed notifications to the owning client.
    pub tick_speedup_notification_delay: u32,
    /// Frames sampled to estimate connection quality.
    pub network_traced_frames: usize,
    /// Input buffering window, in frames, at perfect connection quality.
    pub min_frames_delay: i32,
    /// Input buffering window, in frames, at worst connection quality.
    pub max_frames_delay: i32,
    /// Seconds of inter-arrival deviation mapped to "worst" connection
    /// quality.
    pub net_sensitivity: f32,
    /// Additional frames per second produced while catching up.
    pub tick_acceleration: f32,

    // -- Doll --
    /// Epoch send rate towards dolls, in Hz.
    pub doll_sync_rate: u32,
    pub doll_min_frames_delay: i32,
    pub doll_max_frames_delay: i32,
    /// Seconds of arrival-time divergence mapped to "worst" quality for the
    /// doll interpolation window.
    pub doll_net_sensitivity: f32,
    /// How far past the future epoch the interpolation alpha may run,
    /// normalized.
    pub doll_interpolation_max_overshot: f32,
    /// Frames sampled to estimate the doll connection quality.
    pub doll_connection_stats_frame_span: usize,

    // -- Trickled --
    /// Cap on trickled objects collected into one unreliable packet.
    pub max_trickled_objects_per_update: usize,
    /// Seconds between relevancy (sync-group membership) refreshes.
    pub nodes_relevancy_update_time: f32,
    /// When non-zero, caps the objects carried per snapshot; the rest are
    /// prioritized for the following frames. `0` disables partial updates.
    pub max_objects_count_per_partial_update: usize,

    // -- Latency --
    /// Seconds between latency updates piggy-backed on snapshots.
    pub latency_update_via_snapshot_sec: f32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_notify_state_interval: 0.6,
            comparison_float_tolerance: 0.001,
            server_controlled: false,
            player_input_storage_size: 180,
            max_redundant_inputs: 6,
            tick_speedup_notification_delay: 600,
            network_traced_frames: 120,
            min_frames_delay: 2,
            max_frames_delay: 7,
            net_sensitivity: 0.1,
            tick_acceleration: 5.0,
            doll_sync_rate: 30,
            doll_min_frames_delay: 0,
            doll_max_frames_delay: 25,
            doll_net_sensitivity: 0.21,
            doll_interpolation_max_overshot: 0.2,
            doll_connection_stats_frame_span: 60,
            max_trickled_objects_per_update: 30,
            nodes_relevancy_update_time: 0.5,
            max_objects_count_per_partial_update: 0,
            latency_update_via_snapshot_sec: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert!(s.min_frames_delay <= s.max_frames_delay);
        assert!(s.doll_min_frames_delay <= s.doll_max_frames_delay);
        assert!(s.player_input_storage_size > s.max_redundant_inputs);
        assert!(s.comparison_float_tolerance > 0.0);
    }
}
