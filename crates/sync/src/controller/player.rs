//! Local player input collection and redundant delivery.

use std::collections::VecDeque;

use crate::buffer::DataBuffer;
use crate::controller::{inputs_differ, FrameInput, Outbox, INPUT_METADATA_BITS};
use crate::host::HostApp;
use crate::ids::{FrameIndex, ObjectHandle, SERVER_PEER};
use crate::protocol::{Channel, NetMessage};
use crate::scheme::SerializationScheme;
use crate::settings::{Settings, MAX_ADDITIONAL_TICK_SPEED};

pub struct PlayerController {
    pub current_input_id: FrameIndex,
    /// Next id to assign. Starts at 1; id 0 is the reserved no-rewind
    /// marker.
    input_buffers_counter: u32,
    time_bank: f32,
    pub tick_additional_speed: f32,
    pub streaming_paused: bool,
    /// Inputs produced locally, kept until the server confirms them.
    pub inputs: VecDeque<FrameInput>,
    pub input_buffer: DataBuffer,
    pub has_new_input: bool,
}

impl Default for PlayerController {
    fn default() -> Self {
        Self::new()
    }
}

impl PlayerController {
    pub fn new() -> Self {
        Self {
            current_input_id: FrameIndex::NONE,
            input_buffers_counter: 1,
            time_bank: 0.0,
            tick_additional_speed: 0.0,
            streaming_paused: false,
            inputs: VecDeque::new(),
            input_buffer: DataBuffer::new(),
            has_new_input: false,
        }
    }

    /// Sub-ticks to run this frame. The pretended delta shrinks or grows
    /// with the server-driven speed correction; a time bank carries the
    /// remainder.
    pub fn calculates_sub_ticks(&mut self, delta: f32, iterations_per_sec: f32) -> u32 {
        let pretended_delta = self.pretended_delta(iterations_per_sec);
        self.time_bank += delta;
        let sub_ticks = (self.time_bank / pretended_delta).floor() as u32;
        self.time_bank -= sub_ticks as f32 * pretended_delta;
        sub_ticks
    }

    pub fn pretended_delta(&self, iterations_per_sec: f32) -> f32 {
        1.0 / (iterations_per_sec + self.tick_additional_speed)
    }

    /// Applies a quantized speed correction from the server.
    pub fn receive_tick_speed(&mut self, speed: u8) {
        let normalized = (speed as f32 / u8::MAX as f32 - 0.5) / 0.5;
        self.tick_additional_speed =
            (MAX_ADDITIONAL_TICK_SPEED * normalized).clamp(-MAX_ADDITIONAL_TICK_SPEED, MAX_ADDITIONAL_TICK_SPEED);
    }

    pub fn can_accept_new_inputs(&self, storage_size: usize) -> bool {
        self.inputs.len() < storage_size
    }

    pub fn last_known_input(&self) -> FrameIndex {
        self.inputs.back().map(|i| i.id).unwrap_or(FrameIndex::NONE)
    }

    pub fn stored_input_id(&self, i: usize) -> FrameIndex {
        self.inputs.get(i).map(|f| f.id).unwrap_or(FrameIndex::NONE)
    }

    /// One prediction tick: collect, process, store and send redundantly.
    ///
    /// When the input storage is full (bad connection) the new input is not
    /// collected, but the simulation still advances with the previous
    /// buffer so the character keeps moving.
    pub fn process<A: HostApp>(
        &mut self,
        app: &mut A,
        handle: ObjectHandle,
        scheme: Option<&SerializationScheme>,
        settings: &Settings,
        delta: f32,
        outbox: &mut Outbox,
    ) {
        let accept_new_inputs = self.can_accept_new_inputs(settings.player_input_storage_size);

        if accept_new_inputs {
            self.current_input_id = FrameIndex(self.input_buffers_counter);

            self.input_buffer.begin_write(INPUT_METADATA_BITS);
            self.input_buffer.seek(INPUT_METADATA_BITS);
            app.collect_input(handle, delta, &mut self.input_buffer);

            self.input_buffer.seek(0);
            if self.input_buffer.size() > 0 {
                self.input_buffer.add_bool(true);
                self.streaming_paused = false;
            } else {
                self.input_buffer.add_bool(false);
            }
        } else {
            log::warn!("can't accept new inputs, the connection is lagging");
        }

        self.input_buffer.dry();
        self.input_buffer.begin_read();
        self.input_buffer.seek(INPUT_METADATA_BITS);

        // The simulation always advances, even when the input is not stored.
        app.controller_process(handle, delta, &mut self.input_buffer);

        self.has_new_input = false;
        if accept_new_inputs && !self.streaming_paused {
            self.input_buffers_counter += 1;
            self.store_input_buffer(self.current_input_id);
            self.send_frame_input_buffer_to_server(app, handle, scheme, settings, outbox);
            self.has_new_input = true;
        }
    }

    fn store_input_buffer(&mut self, id: FrameIndex) {
        self.inputs.push_back(FrameInput {
            id,
            buffer: self.input_buffer.bit_array().clone(),
            size_bits: self.input_buffer.total_bits(),
            similarity: FrameIndex::NONE,
            received_at_ms: 0.0,
        });
    }

    /// Builds and sends the unreliable redundant packet: the newest inputs
    /// (up to `max_redundant_inputs + 1`), run-length-coalescing consecutive
    /// inputs the host judges identical. Comparison verdicts are memoized in
    /// `similarity` so each pair is compared at most once across sends.
    fn send_frame_input_buffer_to_server<A: HostApp>(
        &mut self,
        app: &A,
        handle: ObjectHandle,
        scheme: Option<&SerializationScheme>,
        settings: &Settings,
        outbox: &mut Outbox,
    ) {
        let inputs_count = self.inputs.len().min(settings.max_redundant_inputs + 1);
        debug_assert!(inputs_count >= 1);
        let first = self.inputs.len() - inputs_count;

        let mut packet: Vec<u8> = Vec::new();
        packet.extend_from_slice(&self.inputs[first].id.0.to_le_bytes());

        let mut previous_input_id = FrameIndex::NONE;
        let mut previous_similarity = FrameIndex::NONE;
        let mut previous_buffer_len = 0usize;
        let mut duplication_count: u8 = 0;
        let mut reference: Option<FrameInput> = None;

        for i in first..self.inputs.len() {
            let is_similar = if previous_input_id.is_none() {
                // First input of the packet, just write it.
                false
            } else if duplication_count == u8::MAX {
                false
            } else if self.inputs[i].similarity != previous_input_id {
                if self.inputs[i].similarity.is_none() {
                    // Never compared against the reference; do it now.
                    !inputs_differ(
                        app,
                        handle,
                        scheme,
                        reference.as_ref().unwrap(),
                        &self.inputs[i],
                    )
                } else {
                    // Compared earlier against an older input: similarity
                    // ids still identify the same content.
                    self.inputs[i].similarity == previous_similarity
                }
            } else {
                true
            };

            if is_similar {
                duplication_count += 1;
                self.inputs[i].similarity = previous_input_id;
            } else {
                if !previous_input_id.is_none() {
                    // Finalize the previous record's duplication count.
                    let at = packet.len() - previous_buffer_len - 1;
                    packet[at] = duplication_count;
                }
                duplication_count = 0;

                packet.push(0);
                let bytes = byte_padded(&self.inputs[i]);
                previous_buffer_len = bytes.len();
                packet.extend_from_slice(&bytes);

                previous_input_id = self.inputs[i].id;
                previous_similarity = self.inputs[i].similarity;
                reference = Some(self.inputs[i].clone());
            }
        }

        let at = packet.len() - previous_buffer_len - 1;
        packet[at] = duplication_count;

        outbox.send(
            SERVER_PEER,
            Channel::Unreliable,
            NetMessage::SyncInputs { data: packet },
        );
    }

    /// Drops inputs the server confirmed with a snapshot. Returns how many
    /// stored inputs remain. When the confirmed input and everything after
    /// it are void, streaming pauses until a real input shows up.
    pub fn notify_input_checked(&mut self, input_id: FrameIndex) -> usize {
        if self.inputs.is_empty()
            || input_id < self.inputs.front().unwrap().id
            || input_id > self.inputs.back().unwrap().id
        {
            log::warn!(
                "the received snapshot confirms unknown input {}; dropping the notification",
                input_id
            );
            return self.inputs.len();
        }

        while let Some(front) = self.inputs.front() {
            if front.id > input_id {
                break;
            }
            if front.id == input_id {
                self.streaming_paused = front.is_empty_payload();
            }
            self.inputs.pop_front();
        }

        if self.streaming_paused
            && self.inputs.iter().any(|input| !input.is_empty_payload())
        {
            self.streaming_paused = false;
        }

        self.inputs.len()
    }

    /// Re-processes the `i`-th stored input during a rewind. Returns true
    /// while more stored inputs follow.
    pub fn process_instant<A: HostApp>(
        &mut self,
        app: &mut A,
        handle: ObjectHandle,
        i: usize,
        delta: f32,
    ) -> bool {
        if let Some(input) = self.inputs.get(i) {
            let mut buffer = input.payload_buffer();
            app.controller_process(handle, delta, &mut buffer);
            i + 1 < self.inputs.len()
        } else {
            false
        }
    }

    /// Drops every stored input and resets pacing. Used when the rewind
    /// depth was exceeded and the server state is accepted wholesale.
    pub fn hard_reset(&mut self) {
        self.inputs.clear();
        self.time_bank = 0.0;
        self.streaming_paused = true;
        self.has_new_input = false;
    }
}

/// Serializes a stored input back to its byte-padded wire form.
fn byte_padded(input: &FrameInput) -> Vec<u8> {
    let mut bytes = input.buffer.bytes().to_vec();
    bytes.resize(input.size_bits.div_ceil(8), 0);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::CompressionLevel;
    use crate::host::ProcessPhase;
    use crate::value::VarValue;

    /// Emits a scripted sequence of inputs, one value per tick.
    struct ScriptedApp {
        script: Vec<Option<u64>>,
        cursor: usize,
        processed: Vec<u64>,
    }

    impl ScriptedApp {
        fn new(script: Vec<Option<u64>>) -> Self {
            Self {
                script,
                cursor: 0,
                processed: Vec::new(),
            }
        }
    }

    impl HostApp for ScriptedApp {
        fn get_variable(&self, _: ObjectHandle, _: &str) -> Option<VarValue> {
            None
        }
        fn set_variable(&mut self, _: ObjectHandle, _: &str, _: &VarValue) -> bool {
            true
        }
        fn process(&mut self, _: ObjectHandle, _: ProcessPhase, _: f32) {}
        fn collect_input(&mut self, _: ObjectHandle, _: f32, buffer: &mut DataBuffer) {
            if let Some(Some(v)) = self.script.get(self.cursor) {
                buffer.add_uint(*v, CompressionLevel::L3);
            }
            self.cursor += 1;
        }
        fn are_inputs_different(
            &self,
            _: ObjectHandle,
            a: &mut DataBuffer,
            b: &mut DataBuffer,
        ) -> bool {
            a.read_uint(CompressionLevel::L3) != b.read_uint(CompressionLevel::L3)
        }
        fn count_input_size(&self, _: ObjectHandle, _: &mut DataBuffer) -> usize {
            8
        }
        fn controller_process(&mut self, _: ObjectHandle, _: f32, buffer: &mut DataBuffer) {
            self.processed.push(buffer.read_uint(CompressionLevel::L3));
        }
    }

    fn tick(pc: &mut PlayerController, app: &mut ScriptedApp, outbox: &mut Outbox) {
        pc.process(
            app,
            ObjectHandle(1),
            None,
            &Settings::default(),
            1.0 / 60.0,
            outbox,
        );
    }

    #[test]
    fn input_ids_start_at_one_and_advance() {
        let mut app = ScriptedApp::new(vec![Some(1), Some(2), Some(3)]);
        let mut pc = PlayerController::new();
        let mut outbox = Outbox::default();

        tick(&mut pc, &mut app, &mut outbox);
        assert_eq!(pc.current_input_id, FrameIndex(1));
        tick(&mut pc, &mut app, &mut outbox);
        assert_eq!(pc.current_input_id, FrameIndex(2));
        assert_eq!(pc.inputs.len(), 2);
        assert_eq!(app.processed, vec![1, 2]);
    }

    #[test]
    fn redundant_packet_coalesces_identical_runs() {
        // Three identical inputs then a different one.
        let mut app = ScriptedApp::new(vec![Some(7), Some(7), Some(7), Some(9)]);
        let mut pc = PlayerController::new();
        let mut outbox = Outbox::default();

        for _ in 0..4 {
            tick(&mut pc, &mut app, &mut outbox);
        }

        let messages = outbox.drain();
        let NetMessage::SyncInputs { data } = &messages.last().unwrap().2 else {
            panic!("expected an input packet");
        };

        // first_id(4) + rec(7)x{dup=2} [1 hdr + 2 bytes] + rec(9) [1 + 2].
        assert_eq!(u32::from_le_bytes([data[0], data[1], data[2], data[3]]), 1);
        assert_eq!(data[4], 2, "three identical inputs share one payload");
        let second_record_at = 4 + 1 + 2;
        assert_eq!(data[second_record_at], 0);
    }

    #[test]
    fn notify_input_checked_drops_confirmed() {
        let mut app = ScriptedApp::new(vec![Some(1), Some(2), Some(3), Some(4)]);
        let mut pc = PlayerController::new();
        let mut outbox = Outbox::default();
        for _ in 0..4 {
            tick(&mut pc, &mut app, &mut outbox);
        }

        let remaining = pc.notify_input_checked(FrameIndex(2));
        assert_eq!(remaining, 2);
        assert_eq!(pc.inputs.front().unwrap().id, FrameIndex(3));
        assert!(!pc.streaming_paused);
    }

    #[test]
    fn void_confirmed_inputs_pause_streaming() {
        // All inputs empty: has_data = false.
        let mut app = ScriptedApp::new(vec![None, None, None]);
        let mut pc = PlayerController::new();
        let mut outbox = Outbox::default();
        tick(&mut pc, &mut app, &mut outbox);

        // The first (empty) input is stored and sent; once confirmed the
        // stream pauses.
        assert_eq!(pc.inputs.len(), 1);
        pc.notify_input_checked(FrameIndex(1));
        assert!(pc.streaming_paused);

        // While paused no new inputs are produced.
        tick(&mut pc, &mut app, &mut outbox);
        assert_eq!(pc.inputs.len(), 0);
        assert!(!pc.has_new_input);
    }

    #[test]
    fn sub_ticks_follow_the_speed_correction() {
        let mut pc = PlayerController::new();

        // Neutral speed: one sub-tick per frame at 60 Hz.
        pc.receive_tick_speed(128);
        let mut total = 0;
        for _ in 0..60 {
            total += pc.calculates_sub_ticks(1.0 / 60.0, 60.0);
        }
        assert!((59..=61).contains(&total));

        // Full speed-up: noticeably more sub-ticks over a second.
        pc.tick_additional_speed = MAX_ADDITIONAL_TICK_SPEED;
        pc.time_bank = 0.0;
        let mut fast = 0;
        for _ in 0..60 {
            fast += pc.calculates_sub_ticks(1.0 / 60.0, 60.0);
        }
        assert!(fast > total, "{fast} vs {total}");
    }

    #[test]
    fn storage_cap_stops_collection_but_not_simulation() {
        let mut app = ScriptedApp::new(vec![Some(1); 8]);
        let mut pc = PlayerController::new();
        let mut outbox = Outbox::default();
        let settings = Settings {
            player_input_storage_size: 2,
            ..Default::default()
        };

        for _ in 0..4 {
            pc.process(
                &mut app,
                ObjectHandle(1),
                None,
                &settings,
                1.0 / 60.0,
                &mut outbox,
            );
        }

        assert_eq!(pc.inputs.len(), 2);
        // The simulation kept running every tick.
        assert_eq!(app.processed.len(), 4);
    }

    #[test]
    fn speed_quantization_roundtrip() {
        let mut pc = PlayerController::new();
        pc.receive_tick_speed(u8::MAX);
        assert!((pc.tick_additional_speed - MAX_ADDITIONAL_TICK_SPEED).abs() < 0.02);
        pc.receive_tick_speed(0);
        assert!((pc.tick_additional_speed + MAX_ADDITIONAL_TICK_SPEED).abs() < 0.02);
    }
}
