//! Epoch interpolation for remote peers' objects.
//!
//! The server streams "epochs" (collected state plus a cadence hint) at the
//! doll sync rate; the receiver keeps a past and a future epoch and
//! interpolates between them, deriving a virtual delay from the observed
//! arrival-time variance so an unstable connection doesn't make the object
//! stutter.

use crate::buffer::{CompressionLevel, DataBuffer};
use crate::host::HostApp;
use crate::ids::ObjectHandle;
use crate::settings::Settings;
use crate::stats::StatRing;

/// The interpolation core shared by [`DollController`] and the trickled
/// client path: two buffered epochs and an alpha advanced each tick.
pub struct EpochStream {
    pub interpolation_alpha: f32,
    pub interpolation_time_window: f32,

    pub current_epoch: u32,
    pub past_epoch: u32,
    pub past_buffer: DataBuffer,
    pub future_epoch: u32,
    pub future_buffer: DataBuffer,

    epoch_received_at_ms: Option<f64>,
    next_epoch_expected_in: f32,
    watcher: StatRing,
}

/// Bits of metadata heading every epoch blob: `next_sync` (real L1) and the
/// epoch number (uint L1).
pub const EPOCH_METADATA_BITS: usize = 64;

impl EpochStream {
    pub fn new(stats_frame_span: usize) -> Self {
        Self {
            interpolation_alpha: 0.0,
            interpolation_time_window: 0.0,
            current_epoch: 0,
            past_epoch: 0,
            past_buffer: DataBuffer::new(),
            future_epoch: 0,
            future_buffer: DataBuffer::new(),
            epoch_received_at_ms: None,
            next_epoch_expected_in: 0.0,
            watcher: StatRing::new(stats_frame_span, 0.0),
        }
    }

    pub fn reset(&mut self, stats_frame_span: usize) {
        self.watcher.resize(stats_frame_span, 0.0);
        self.epoch_received_at_ms = None;
    }

    pub fn has_data(&self) -> bool {
        self.future_buffer.total_bits() > EPOCH_METADATA_BITS
    }

    /// Ingests one epoch blob (`[next_sync real L1][epoch uint L1][data]`).
    /// Returns the decoded epoch number, or `None` when the blob is stale.
    ///
    /// `collect_current` captures the receiver's current interpolated state
    /// as the new past epoch, which is what allows a bounded overshoot.
    pub fn receive<A: HostApp>(
        &mut self,
        app: &mut A,
        handle: ObjectHandle,
        settings: &Settings,
        data: Vec<u8>,
        now_ms: f64,
        iterations_per_sec: f32,
        min_epoch: u32,
    ) -> Option<u32> {
        let mut incoming = DataBuffer::from_bytes(data);
        incoming.begin_read();
        let next_sync_time = incoming.read_real(CompressionLevel::L1) as f32;
        let epoch = incoming.read_uint(CompressionLevel::L1) as u32;

        if epoch <= min_epoch {
            // Paused from this epoch on; a late arrival, discard it.
            return None;
        }
        if epoch <= self.future_epoch {
            log::debug!("late epoch {} discarded (future is {})", epoch, self.future_epoch);
            return None;
        }

        let current_virtual_delay = self.future_epoch as i64 - self.current_epoch as i64;

        if self.current_epoch > self.future_epoch {
            // Normalize the overshoot before re-anchoring.
            self.current_epoch = self.future_epoch;
        }
        self.past_epoch = self.current_epoch;
        self.future_epoch = epoch;

        // Capture the currently displayed state as the interpolation start.
        self.past_buffer.begin_write(0);
        app.trickled_collect(handle, &mut self.past_buffer, 1.0);
        self.past_buffer.dry();
        self.future_buffer = incoming;

        // Judge the connection by how far each arrival lands from when it
        // was announced.
        if let Some(received_at) = self.epoch_received_at_ms {
            let arrived_in = ((now_ms - received_at) / 1000.0) as f32;
            let delta_difference = arrived_in - self.next_epoch_expected_in;
            self.watcher.push(delta_difference.abs());
        }
        self.epoch_received_at_ms = Some(now_ms);
        self.next_epoch_expected_in = next_sync_time;

        let worst_arrival_delta = self.watcher.max();
        let deviation = self.watcher.deviation(worst_arrival_delta);
        let net_poorness =
            ((worst_arrival_delta + deviation) / settings.doll_net_sensitivity).min(1.0);

        let target_virtual_delay = lerp(
            settings.doll_min_frames_delay as f32,
            settings.doll_max_frames_delay as f32,
            net_poorness,
        ) as i64;

        let epochs_span = (target_virtual_delay - current_virtual_delay) as f32;
        let frame_time = 1.0 / iterations_per_sec;
        self.interpolation_time_window = next_sync_time
            + current_virtual_delay as f32 * frame_time
            + epochs_span * frame_time;
        self.interpolation_alpha = 0.0;

        Some(epoch)
    }

    /// Advances the alpha and applies the interpolated state. The alpha may
    /// overshoot past 1 up to the configured bound, extrapolating while the
    /// next epoch is late.
    pub fn advance<A: HostApp>(
        &mut self,
        app: &mut A,
        handle: ObjectHandle,
        settings: &Settings,
        delta: f32,
    ) {
        if !self.has_data() {
            return;
        }

        if self.interpolation_time_window <= f32::EPSILON {
            self.interpolation_alpha = 1.0;
        } else {
            self.interpolation_alpha += delta / self.interpolation_time_window;
            self.interpolation_alpha = self
                .interpolation_alpha
                .min(1.0 + settings.doll_interpolation_max_overshot);
        }

        self.current_epoch = lerp(
            self.past_epoch as f32,
            self.future_epoch as f32,
            self.interpolation_alpha,
        )
        .round() as u32;

        self.past_buffer.begin_read();
        self.future_buffer.begin_read();
        self.future_buffer.seek(EPOCH_METADATA_BITS);

        app.trickled_apply(
            handle,
            delta,
            self.interpolation_alpha,
            &mut self.past_buffer,
            &mut self.future_buffer,
        );
    }
}

/// A remote peer's controlled object as rendered on this peer:
/// non-authoritative, epoch interpolated, pausable by the server.
pub struct DollController {
    stream: EpochStream,
    /// Epochs at or before this one are discarded.
    paused_epoch: u32,
    pub current_epoch: u32,
}

impl DollController {
    pub fn new(stats_frame_span: usize) -> Self {
        Self {
            stream: EpochStream::new(stats_frame_span),
            paused_epoch: 0,
            current_epoch: 0,
        }
    }

    pub fn receive_epoch<A: HostApp>(
        &mut self,
        app: &mut A,
        handle: ObjectHandle,
        settings: &Settings,
        data: Vec<u8>,
        now_ms: f64,
        iterations_per_sec: f32,
    ) {
        self.stream.receive(
            app,
            handle,
            settings,
            data,
            now_ms,
            iterations_per_sec,
            self.paused_epoch,
        );
    }

    pub fn process<A: HostApp>(
        &mut self,
        app: &mut A,
        handle: ObjectHandle,
        settings: &Settings,
        delta: f32,
    ) {
        self.stream.advance(app, handle, settings, delta);
        self.current_epoch = self.stream.current_epoch;
    }

    /// Pauses the stream: everything up to `epoch` is stale from now on.
    pub fn pause(&mut self, epoch: u32, settings: &Settings) {
        self.paused_epoch = epoch;
        self.stream.reset(settings.doll_connection_stats_frame_span);
    }
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ProcessPhase;
    use crate::value::VarValue;

    /// Host with one scalar that lerps between epochs.
    struct LerpApp {
        value: f64,
        applied: Vec<f32>,
    }

    impl HostApp for LerpApp {
        fn get_variable(&self, _: ObjectHandle, _: &str) -> Option<VarValue> {
            None
        }
        fn set_variable(&mut self, _: ObjectHandle, _: &str, _: &VarValue) -> bool {
            true
        }
        fn process(&mut self, _: ObjectHandle, _: ProcessPhase, _: f32) {}
        fn trickled_collect(&mut self, _: ObjectHandle, buffer: &mut DataBuffer, _: f32) {
            buffer.add_real(self.value, CompressionLevel::L1);
        }
        fn trickled_apply(
            &mut self,
            _: ObjectHandle,
            _: f32,
            alpha: f32,
            past: &mut DataBuffer,
            future: &mut DataBuffer,
        ) {
            let from = past.read_real(CompressionLevel::L1);
            let to = future.read_real(CompressionLevel::L1);
            self.value = from + (to - from) * alpha.min(1.0) as f64;
            self.applied.push(alpha);
        }
    }

    fn epoch_blob(next_sync: f32, epoch: u32, value: f64) -> Vec<u8> {
        let mut db = DataBuffer::new();
        db.begin_write(0);
        db.add_real(next_sync as f64, CompressionLevel::L1);
        db.add_uint(epoch as u64, CompressionLevel::L1);
        db.add_real(value, CompressionLevel::L1);
        db.dry();
        db.to_byte_vec()
    }

    #[test]
    fn interpolates_towards_the_future_epoch() {
        let mut app = LerpApp {
            value: 0.0,
            applied: Vec::new(),
        };
        let settings = Settings {
            doll_min_frames_delay: 0,
            doll_max_frames_delay: 0,
            ..Default::default()
        };
        let mut doll = DollController::new(8);

        doll.receive_epoch(
            &mut app,
            ObjectHandle(1),
            &settings,
            epoch_blob(1.0 / 30.0, 1, 10.0),
            0.0,
            60.0,
        );

        for _ in 0..4 {
            doll.process(&mut app, ObjectHandle(1), &settings, 1.0 / 60.0);
        }

        assert!(!app.applied.is_empty());
        assert!(app.value > 0.0 && app.value <= 10.0 + 1e-3, "{}", app.value);
    }

    #[test]
    fn stale_epochs_are_discarded() {
        let mut app = LerpApp {
            value: 0.0,
            applied: Vec::new(),
        };
        let settings = Settings::default();
        let mut doll = DollController::new(8);

        doll.receive_epoch(
            &mut app,
            ObjectHandle(1),
            &settings,
            epoch_blob(0.03, 5, 1.0),
            0.0,
            60.0,
        );
        // Older epoch arrives late: ignored.
        doll.receive_epoch(
            &mut app,
            ObjectHandle(1),
            &settings,
            epoch_blob(0.03, 3, 99.0),
            1.0,
            60.0,
        );
        assert_eq!(doll.stream.future_epoch, 5);
    }

    #[test]
    fn pause_discards_until_newer_epoch() {
        let mut app = LerpApp {
            value: 0.0,
            applied: Vec::new(),
        };
        let settings = Settings::default();
        let mut doll = DollController::new(8);

        doll.pause(10, &settings);
        doll.receive_epoch(
            &mut app,
            ObjectHandle(1),
            &settings,
            epoch_blob(0.03, 9, 1.0),
            0.0,
            60.0,
        );
        assert_eq!(doll.stream.future_epoch, 0);

        doll.receive_epoch(
            &mut app,
            ObjectHandle(1),
            &settings,
            epoch_blob(0.03, 11, 1.0),
            0.0,
            60.0,
        );
        assert_eq!(doll.stream.future_epoch, 11);
    }

    #[test]
    fn alpha_overshoot_is_bounded() {
        let mut app = LerpApp {
            value: 0.0,
            applied: Vec::new(),
        };
        let settings = Settings {
            doll_interpolation_max_overshot: 0.2,
            doll_min_frames_delay: 0,
            doll_max_frames_delay: 0,
            ..Default::default()
        };
        let mut doll = DollController::new(8);
        doll.receive_epoch(
            &mut app,
            ObjectHandle(1),
            &settings,
            epoch_blob(0.016, 1, 5.0),
            0.0,
            60.0,
        );

        // Next epoch never arrives: alpha saturates at 1.2.
        for _ in 0..60 {
            doll.process(&mut app, ObjectHandle(1), &settings, 1.0 / 60.0);
        }
        let max_alpha = app.applied.iter().cloned().fold(0.0f32, f32::max);
        assert!(max_alpha <= 1.2 + 1e-5);
        assert!(max_alpha > 1.0);
    }
}
