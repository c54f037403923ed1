//! Authoritative side of a remote player's input stream.

use std::collections::VecDeque;

use crate::buffer::{CompressionLevel, DataBuffer};
use crate::controller::{
    count_input_bits, inputs_differ, FrameInput, Outbox, INPUT_METADATA_BITS,
};
use crate::error::InputPacketError;
use crate::host::HostApp;
use crate::ids::{FrameIndex, ObjectHandle, ObjectNetId, PeerId};
use crate::protocol::{Channel, NetMessage};
use crate::scheme::SerializationScheme;
use crate::settings::{Settings, MAX_ADDITIONAL_TICK_SPEED};
use crate::stats::StatRing;

/// A doll peer receiving epoch batches for this controller's object.
#[derive(Debug, Clone)]
struct DollPeer {
    peer: PeerId,
    active: bool,
    sync_rate_factor: f32,
    sync_timer: f32,
    sync_time_threshold: f32,
}

impl DollPeer {
    fn new(peer: PeerId) -> Self {
        Self {
            peer,
            active: true,
            sync_rate_factor: 1.0,
            sync_timer: 0.0,
            sync_time_threshold: 0.0,
        }
    }
}

pub struct ServerController {
    pub enabled: bool,
    pub current_input_id: FrameIndex,
    pub ghost_input_count: u32,
    pub last_sent_state_input_id: FrameIndex,
    /// Inbound inputs, strictly ordered by id, duplicates discarded.
    pub inputs: VecDeque<FrameInput>,
    pub streaming_paused: bool,
    /// The input currently being executed.
    pub input_buffer: DataBuffer,

    client_tick_additional_speed: f32,
    speed_notif_timer_ms: f32,
    input_arrival_time_ms: Option<f64>,
    network_watcher: StatRing,

    // Doll epoch distribution.
    pub epoch: u32,
    is_epoch_important: bool,
    doll_peers: Vec<DollPeer>,
    doll_sync_timer_bootstrap: bool,
}

impl ServerController {
    pub fn new(traced_frames: usize) -> Self {
        Self {
            enabled: true,
            current_input_id: FrameIndex::NONE,
            ghost_input_count: 0,
            last_sent_state_input_id: FrameIndex::NONE,
            inputs: VecDeque::new(),
            streaming_paused: false,
            input_buffer: DataBuffer::new(),
            client_tick_additional_speed: 0.0,
            speed_notif_timer_ms: 0.0,
            input_arrival_time_ms: None,
            network_watcher: StatRing::new(traced_frames, 0.0),
            epoch: 0,
            is_epoch_important: false,
            doll_peers: Vec::new(),
            doll_sync_timer_bootstrap: true,
        }
    }

    pub fn last_known_input(&self) -> FrameIndex {
        self.inputs.back().map(|i| i.id).unwrap_or(FrameIndex::NONE)
    }

    pub fn inputs_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn client_tick_additional_speed(&self) -> f32 {
        self.client_tick_additional_speed
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;

        // On state change drop everything, so stale data can't accumulate.
        self.ghost_input_count = 0;
        self.last_sent_state_input_id = FrameIndex::NONE;
        self.client_tick_additional_speed = 0.0;
        self.speed_notif_timer_ms = 0.0;
        self.inputs.clear();
        self.input_arrival_time_ms = None;
        self.network_watcher.reset(0.0);
        self.is_epoch_important = false;
    }

    pub fn clear_peers(&mut self) {
        self.doll_peers.clear();
    }

    pub fn activate_peer(&mut self, peer: PeerId) {
        if !self.doll_peers.iter().any(|p| p.peer == peer) {
            self.doll_peers.push(DollPeer::new(peer));
        }
    }

    pub fn deactivate_peer(&mut self, peer: PeerId) {
        self.doll_peers.retain(|p| p.peer != peer);
    }

    pub fn set_doll_peer_active(&mut self, peer: PeerId, active: bool) {
        if let Some(p) = self.doll_peers.iter_mut().find(|p| p.peer == peer) {
            p.active = active;
        }
    }

    pub fn set_doll_collect_rate_factor(&mut self, peer: PeerId, factor: f32) {
        if let Some(p) = self.doll_peers.iter_mut().find(|p| p.peer == peer) {
            p.sync_rate_factor = factor.max(0.001);
        }
    }

    pub fn doll_peer_ids(&self) -> Vec<PeerId> {
        self.doll_peers.iter().map(|p| p.peer).collect()
    }

    pub fn mark_epoch_as_important(&mut self) {
        self.is_epoch_important = true;
    }

    /// Decodes a redundant input packet:
    /// `[first_input_id: u32 LE] [dup: u8, has_data: 1 bit, payload]*`.
    ///
    /// Records are applied in order; already-executed ids are skipped and
    /// new ids are inserted sorted. The FIFO is capped at the player input
    /// storage size, dropping the oldest entries. Returns how many records
    /// were inserted.
    pub fn receive_inputs<A: HostApp>(
        &mut self,
        app: &A,
        handle: ObjectHandle,
        scheme: Option<&SerializationScheme>,
        data: &[u8],
        now_ms: f64,
    ) -> Result<u32, InputPacketError> {
        self.receive_inputs_bounded(app, handle, scheme, data, now_ms, usize::MAX)
    }

    pub fn receive_inputs_bounded<A: HostApp>(
        &mut self,
        app: &A,
        handle: ObjectHandle,
        scheme: Option<&SerializationScheme>,
        data: &[u8],
        now_ms: f64,
        max_inputs: usize,
    ) -> Result<u32, InputPacketError> {
        // Watch the packet inter-arrival time; it drives the client
        // tick-rate control loop.
        if let Some(previous) = self.input_arrival_time_ms {
            let gap = (now_ms - previous).max(0.0);
            self.network_watcher.push(gap as f32);
        }
        self.input_arrival_time_ms = Some(now_ms);

        if data.len() < 4 {
            return Err(InputPacketError::Undersized);
        }
        let first_input_id =
            FrameIndex(u32::from_le_bytes([data[0], data[1], data[2], data[3]]));
        let mut ofs = 4usize;

        let mut whole = DataBuffer::from_bytes(data.to_vec());
        let mut inserted_count = 0u32;
        let mut next_id = first_input_id;

        while ofs < data.len() {
            let duplication = data[ofs];
            ofs += 1;
            if ofs > data.len() {
                return Err(InputPacketError::RecordOverrun(ofs));
            }

            // Size the record by reading it where it sits in the packet.
            whole.begin_read();
            whole.seek(ofs * 8);
            let has_data = whole.read_bool();
            let payload_bits = if has_data {
                count_input_bits(app, handle, scheme, &mut whole)
            } else {
                0
            };
            let record_bits = payload_bits + INPUT_METADATA_BITS;
            let record_bytes = record_bits.div_ceil(8);
            if ofs + record_bytes > data.len() {
                return Err(InputPacketError::RecordOverrun(ofs));
            }

            for _ in 0..=duplication {
                let input_id = next_id;
                next_id = next_id.next();

                if !self.current_input_id.is_none() && self.current_input_id >= input_id {
                    // Already executed, not needed anymore.
                    continue;
                }
                if self.inputs.iter().any(|i| i.id == input_id) {
                    continue;
                }

                let mut record = DataBuffer::from_bytes(data[ofs..ofs + record_bytes].to_vec());
                record.shrink_to(INPUT_METADATA_BITS, payload_bits);
                self.inputs.push_back(FrameInput {
                    id: input_id,
                    buffer: record.into_bit_array(),
                    size_bits: record_bits,
                    similarity: FrameIndex::NONE,
                    received_at_ms: now_ms,
                });
                inserted_count += 1;
            }

            ofs += record_bytes;
        }

        if ofs != data.len() {
            return Err(InputPacketError::TrailingBytes);
        }

        self.inputs.make_contiguous().sort_by_key(|i| i.id);
        while self.inputs.len() > max_inputs {
            self.inputs.pop_front();
        }
        Ok(inserted_count)
    }

    fn take_front_input(&mut self) {
        let front = self.inputs.pop_front().expect("checked by caller");
        self.current_input_id = front.id;
        let payload_bits = front.payload_bits();
        self.input_buffer =
            DataBuffer::from_bit_array(front.buffer, INPUT_METADATA_BITS, payload_bits);
    }

    /// Chooses the input to execute this tick. Returns true when a new input
    /// was consumed.
    pub fn fetch_next_input<A: HostApp>(
        &mut self,
        app: &A,
        handle: ObjectHandle,
        scheme: Option<&SerializationScheme>,
    ) -> bool {
        if self.current_input_id.is_none() {
            // As the initial input, anything is good.
            if !self.inputs.is_empty() {
                self.take_front_input();
                self.network_watcher.reset(0.0);
                self.input_arrival_time_ms = None;
                return true;
            }
            return false;
        }

        let next_input_id = self.current_input_id.next();

        if self.streaming_paused {
            if self
                .inputs
                .front()
                .is_some_and(|front| front.id >= next_input_id)
            {
                // A new input arrived while paused; resume unless it's void.
                let resumes = !self.inputs.front().unwrap().is_empty_payload();
                self.take_front_input();
                self.streaming_paused = !resumes;
                self.network_watcher.reset(0.0);
                self.input_arrival_time_ms = None;
                return true;
            }
            // Pretend the next input is void.
            let mut void = DataBuffer::new();
            void.begin_write(INPUT_METADATA_BITS);
            self.input_buffer = void;
            return false;
        }

        if self.inputs.is_empty() {
            // A packet is missing: reuse the previous input as a ghost.
            self.ghost_input_count += 1;
            log::debug!("input buffer is void, reusing the previous input");
            return false;
        }

        if self.inputs.front().unwrap().id == next_input_id {
            self.take_front_input();
            self.ghost_input_count = 0;
            return true;
        }

        // The next input is late. Widen the search window by one each missed
        // tick and fast-forward through buffered inputs, stopping at the
        // first one that is meaningfully different from the input being
        // repeated, so the server doesn't fall behind the client.
        self.ghost_input_count += 1;
        let window = (self.ghost_input_count as usize).min(self.inputs.len());
        let ghost_packet_id = FrameIndex(next_input_id.0 + self.ghost_input_count);

        let current = FrameInput {
            id: self.current_input_id,
            buffer: self.input_buffer.bit_array().clone(),
            size_bits: self.input_buffer.size() + INPUT_METADATA_BITS,
            similarity: FrameIndex::NONE,
            received_at_ms: 0.0,
        };

        let mut recovered: Option<FrameInput> = None;
        for _ in 0..window {
            let Some(front) = self.inputs.front() else {
                break;
            };
            if ghost_packet_id < front.id {
                break;
            }
            let candidate = self.inputs.pop_front().unwrap();
            let meaningful = inputs_differ(app, handle, scheme, &current, &candidate);
            recovered = Some(candidate);
            if meaningful {
                break;
            }
        }

        if let Some(input) = recovered {
            self.current_input_id = input.id;
            let payload_bits = input.payload_bits();
            self.input_buffer =
                DataBuffer::from_bit_array(input.buffer, INPUT_METADATA_BITS, payload_bits);
            self.ghost_input_count = 0;
            log::debug!("late input recovered at {}", self.current_input_id);
            true
        } else {
            log::debug!("input {} still missing", next_input_id);
            false
        }
    }

    /// One authoritative tick: pick the input and advance the simulation.
    /// Returns false while no input ever arrived.
    pub fn process<A: HostApp>(
        &mut self,
        app: &mut A,
        handle: ObjectHandle,
        scheme: Option<&SerializationScheme>,
        delta: f32,
    ) -> bool {
        if !self.enabled {
            return false;
        }

        self.fetch_next_input(app, handle, scheme);

        if self.current_input_id.is_none() {
            // Skip everything until the first input arrives.
            return false;
        }

        self.input_buffer.begin_read();
        self.input_buffer.seek(INPUT_METADATA_BITS);
        app.controller_process(handle, delta, &mut self.input_buffer);
        true
    }

    /// How many buffered inputs follow the current one without gaps.
    pub fn consecutive_buffered_inputs(&self) -> i32 {
        if self.current_input_id.is_none() {
            return self.inputs.len() as i32;
        }
        let mut consecutive = 0;
        for input in &self.inputs {
            if input.id.0 == self.current_input_id.0 + consecutive as u32 + 1 {
                consecutive += 1;
            }
        }
        consecutive
    }

    /// Integrates the client tick-speed correction from the connection
    /// health. Runs every tick while streaming is active.
    pub fn calculates_player_tick_rate(&mut self, settings: &Settings, delta: f32) {
        let avg_receive_time = self.network_watcher.average();
        let deviation_sec = self.network_watcher.deviation(avg_receive_time) / 1000.0;

        // Stable connections have a deviation that tends to zero.
        let net_poorness = (deviation_sec / settings.net_sensitivity).clamp(0.0, 1.0);

        let optimal_frame_delay = lerp(
            settings.min_frames_delay as f32,
            settings.max_frames_delay as f32,
            net_poorness,
        );

        let distance = optimal_frame_delay - self.consecutive_buffered_inputs() as f32;

        let acc = distance * settings.tick_acceleration * delta;
        let damp = -(self.client_tick_additional_speed * 0.95);
        // The damping is only applied when it opposes the acceleration, to
        // avoid oscillations.
        self.client_tick_additional_speed +=
            acc + damp * ((acc.signum() * damp.signum() + 1.0) / 2.0);
        self.client_tick_additional_speed = self
            .client_tick_additional_speed
            .clamp(-MAX_ADDITIONAL_TICK_SPEED, MAX_ADDITIONAL_TICK_SPEED);
    }

    /// Sends the quantized speed correction to the owning client at the
    /// configured cadence.
    pub fn adjust_player_tick_rate(
        &mut self,
        settings: &Settings,
        delta: f32,
        owner: PeerId,
        outbox: &mut Outbox,
    ) {
        self.speed_notif_timer_ms += delta * 1000.0;
        if self.speed_notif_timer_ms < settings.tick_speedup_notification_delay as f32 {
            return;
        }
        self.speed_notif_timer_ms = 0.0;

        let normalized =
            (self.client_tick_additional_speed / MAX_ADDITIONAL_TICK_SPEED + 1.0) / 2.0;
        let speed = (u8::MAX as f32 * normalized).round() as u8;
        outbox.send(
            owner,
            Channel::Unreliable,
            NetMessage::NotifyFpsAcceleration { speed },
        );
    }

    /// Called when a snapshot confirming `current_input_id` was emitted. A
    /// void confirmed input allows the client to pause the stream, so
    /// missing packets are treated as void from here on.
    pub fn notify_send_state(&mut self) {
        self.last_sent_state_input_id = self.current_input_id;
        if self.input_buffer.size() == 0 {
            self.streaming_paused = true;
        }
    }

    /// Streams the controlled object's epoch to every doll peer whose timer
    /// elapsed. The payload travels as one `TrickledSyncData` entry:
    /// `[net_id: u16] [blob: {next_sync real L1, epoch uint L1, data}]`.
    pub fn doll_sync<A: HostApp>(
        &mut self,
        app: &mut A,
        handle: ObjectHandle,
        net_id: ObjectNetId,
        settings: &Settings,
        delta: f32,
        outbox: &mut Outbox,
    ) {
        self.epoch = self.epoch.wrapping_add(1);
        let sync_rate_time = 1.0 / settings.doll_sync_rate.max(1) as f32;

        let mut collected: Option<DataBuffer> = None;

        for i in 0..self.doll_peers.len() {
            if !self.doll_peers[i].active {
                continue;
            }

            self.doll_peers[i].sync_timer += delta;
            if !self.is_epoch_important
                && !self.doll_sync_timer_bootstrap
                && self.doll_peers[i].sync_timer < self.doll_peers[i].sync_time_threshold
            {
                continue;
            }
            self.doll_peers[i].sync_timer = 0.0;
            self.doll_peers[i].sync_time_threshold =
                sync_rate_time * self.doll_peers[i].sync_rate_factor;

            let next_sync = self.doll_peers[i].sync_time_threshold;

            if collected.is_none() {
                let mut blob = DataBuffer::new();
                blob.begin_write(0);
                blob.add_real(0.0, CompressionLevel::L1); // next_sync placeholder
                blob.add_uint(self.epoch as u64, CompressionLevel::L1);
                app.trickled_collect(handle, &mut blob, 1.0);
                blob.dry();
                collected = Some(blob);
            }

            let blob = collected.as_mut().unwrap();
            // Patch this peer's sync cadence into the shared blob.
            blob.seek(0);
            blob.add_real(next_sync as f64, CompressionLevel::L1);

            let mut entry = DataBuffer::new();
            entry.begin_write(0);
            entry.add_uint(net_id.0 as u64, CompressionLevel::L2);
            entry.add_bytes(&blob.to_byte_vec());

            outbox.send(
                self.doll_peers[i].peer,
                Channel::Unreliable,
                NetMessage::TrickledSyncData {
                    data: entry.to_byte_vec(),
                },
            );
        }

        self.doll_sync_timer_bootstrap = false;
        self.is_epoch_important = false;
    }
}

/// Server-side controller for server-owned objects (bots): inputs are
/// collected locally each tick, no remote stream and no rate control.
pub struct AutonomousServerController {
    pub base: ServerController,
}

impl AutonomousServerController {
    pub fn new() -> Self {
        Self {
            base: ServerController::new(1),
        }
    }

    pub fn process<A: HostApp>(&mut self, app: &mut A, handle: ObjectHandle, delta: f32) -> bool {
        if !self.base.enabled {
            return false;
        }

        let mut buffer = DataBuffer::new();
        buffer.begin_write(INPUT_METADATA_BITS);
        buffer.seek(INPUT_METADATA_BITS);
        app.collect_input(handle, delta, &mut buffer);
        buffer.seek(0);
        buffer.add_bool(buffer.size() > 0);
        buffer.dry();

        self.base.current_input_id = if self.base.current_input_id.is_none() {
            FrameIndex(1)
        } else {
            self.base.current_input_id.next()
        };

        buffer.begin_read();
        buffer.seek(INPUT_METADATA_BITS);
        app.controller_process(handle, delta, &mut buffer);
        self.base.input_buffer = buffer;
        true
    }
}

impl Default for AutonomousServerController {
    fn default() -> Self {
        Self::new()
    }
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}
