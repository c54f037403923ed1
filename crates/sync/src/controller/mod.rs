//! Per-peer input controllers.
//!
//! A controller owns one peer's input stream for the object that peer
//! controls. The same object is driven by a different variant depending on
//! where the process runs:
//!
//! - [`ServerController`]: authoritative side of a remote player.
//! - [`AutonomousServerController`]: server-driven controller (bots); clients
//!   see it as a doll.
//! - [`PlayerController`]: the local player collecting real inputs.
//! - [`DollController`]: a remote peer's object rendered locally, epoch
//!   interpolated.
//! - [`NoNetController`]: offline single-process variant.

mod doll;
mod player;
mod server;

pub use doll::{DollController, EpochStream};
pub use player::PlayerController;
pub use server::{AutonomousServerController, ServerController};

use crate::buffer::{BitArray, DataBuffer};
use crate::host::HostApp;
use crate::ids::{FrameIndex, ObjectHandle, PeerId};
use crate::protocol::{Channel, NetMessage};
use crate::scheme::SerializationScheme;

/// Bits of metadata preceding every input payload: the `has_data` flag.
pub const INPUT_METADATA_BITS: usize = 1;

/// One collected (or received) input record.
#[derive(Debug, Clone)]
pub struct FrameInput {
    pub id: FrameIndex,
    /// Byte-padded buffer, metadata bit included.
    pub buffer: BitArray,
    /// Valid bits, metadata included.
    pub size_bits: usize,
    /// Id of a previous input this one is known to be identical to, used to
    /// coalesce redundant sends. `NONE` when never compared.
    pub similarity: FrameIndex,
    /// Virtual receive timestamp, milliseconds.
    pub received_at_ms: f64,
}

impl FrameInput {
    pub fn payload_bits(&self) -> usize {
        self.size_bits.saturating_sub(INPUT_METADATA_BITS)
    }

    pub fn is_empty_payload(&self) -> bool {
        self.payload_bits() == 0
    }

    /// A read-positioned buffer over the payload (metadata skipped).
    pub fn payload_buffer(&self) -> DataBuffer {
        let mut db =
            DataBuffer::from_bit_array(self.buffer.clone(), INPUT_METADATA_BITS, self.payload_bits());
        db.begin_read();
        db.seek(INPUT_METADATA_BITS);
        db
    }
}

/// Messages produced during a controller step, flushed to the transport by
/// the orchestrator once the tick settles.
#[derive(Debug, Default)]
pub struct Outbox {
    pub messages: Vec<(PeerId, Channel, NetMessage)>,
}

impl Outbox {
    pub fn send(&mut self, peer: PeerId, channel: Channel, message: NetMessage) {
        self.messages.push((peer, channel, message));
    }

    pub fn drain(&mut self) -> Vec<(PeerId, Channel, NetMessage)> {
        std::mem::take(&mut self.messages)
    }
}

/// Compares the payloads of two inputs, preferring the registered scheme
/// over the host hook.
pub(crate) fn inputs_differ<A: HostApp>(
    app: &A,
    handle: ObjectHandle,
    scheme: Option<&SerializationScheme>,
    a: &FrameInput,
    b: &FrameInput,
) -> bool {
    // An empty payload differs from a non-empty one by definition.
    if a.is_empty_payload() != b.is_empty_payload() {
        return true;
    }
    if a.is_empty_payload() {
        return false;
    }

    let mut buf_a = a.payload_buffer();
    let mut buf_b = b.payload_buffer();
    match scheme {
        Some(scheme) => scheme.are_different(&mut buf_a, &mut buf_b),
        None => app.are_inputs_different(handle, &mut buf_a, &mut buf_b),
    }
}

/// Bits of one input payload starting at the buffer cursor.
pub(crate) fn count_input_bits<A: HostApp>(
    app: &A,
    handle: ObjectHandle,
    scheme: Option<&SerializationScheme>,
    buffer: &mut DataBuffer,
) -> usize {
    match scheme {
        Some(scheme) => scheme.count_bits(buffer),
        None => app.count_input_size(handle, buffer),
    }
}

/// Closed set of controller variants.
pub enum Controller {
    Server(ServerController),
    AutonomousServer(AutonomousServerController),
    Player(PlayerController),
    Doll(DollController),
    NoNet(NoNetController),
}

impl Controller {
    /// The frame index the controller is currently at, `NONE` before the
    /// first processed input.
    pub fn current_frame_index(&self) -> FrameIndex {
        match self {
            Controller::Server(c) => c.current_input_id,
            Controller::AutonomousServer(c) => c.base.current_input_id,
            Controller::Player(c) => c.current_input_id,
            Controller::Doll(c) => FrameIndex(c.current_epoch),
            Controller::NoNet(c) => FrameIndex(c.frame_id),
        }
    }

    pub fn ready(&mut self) {}

    pub fn clear_peers(&mut self) {
        match self {
            Controller::Server(c) => c.clear_peers(),
            Controller::AutonomousServer(c) => c.base.clear_peers(),
            _ => {}
        }
    }

    pub fn activate_peer(&mut self, peer: PeerId) {
        match self {
            Controller::Server(c) => c.activate_peer(peer),
            Controller::AutonomousServer(c) => c.base.activate_peer(peer),
            _ => {}
        }
    }

    pub fn deactivate_peer(&mut self, peer: PeerId) {
        match self {
            Controller::Server(c) => c.deactivate_peer(peer),
            Controller::AutonomousServer(c) => c.base.deactivate_peer(peer),
            _ => {}
        }
    }

    pub fn as_server(&mut self) -> Option<&mut ServerController> {
        match self {
            Controller::Server(c) => Some(c),
            Controller::AutonomousServer(c) => Some(&mut c.base),
            _ => None,
        }
    }

    pub fn as_player(&mut self) -> Option<&mut PlayerController> {
        match self {
            Controller::Player(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_doll(&mut self) -> Option<&mut DollController> {
        match self {
            Controller::Doll(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_server_controller(&self) -> bool {
        matches!(self, Controller::Server(_) | Controller::AutonomousServer(_))
    }

    pub fn is_player_controller(&self) -> bool {
        matches!(self, Controller::Player(_))
    }

    pub fn is_doll_controller(&self) -> bool {
        matches!(self, Controller::Doll(_))
    }
}

/// Offline controller: collects and processes in the same tick, no network.
pub struct NoNetController {
    pub frame_id: u32,
    input_buffer: DataBuffer,
}

impl Default for NoNetController {
    fn default() -> Self {
        Self::new()
    }
}

impl NoNetController {
    pub fn new() -> Self {
        Self {
            frame_id: 0,
            input_buffer: DataBuffer::new(),
        }
    }

    pub fn process<A: HostApp>(&mut self, app: &mut A, handle: ObjectHandle, delta: f32) {
        self.input_buffer.begin_write(0);
        app.collect_input(handle, delta, &mut self.input_buffer);
        self.input_buffer.dry();
        self.input_buffer.begin_read();
        app.controller_process(handle, delta, &mut self.input_buffer);
        self.frame_id = self.frame_id.wrapping_add(1);
    }
}
