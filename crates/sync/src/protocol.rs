//! Wire message envelope.
//!
//! Message names are part of the protocol contract; the opaque byte bodies
//! are bit-exact [`DataBuffer`](crate::buffer::DataBuffer) payloads whose
//! layouts are defined by the controller (`SyncInputs`), the snapshot
//! encoder (`State`) and the trickled collector (`TrickledSyncData`).
//! The envelope itself is serialized with rkyv by transports that put it on
//! a real wire.

use rkyv::{rancor, Archive, Deserialize, Serialize};

/// Delivery class requested from the transport. The core assumes no
/// fragmentation guarantees for [`Channel::Unreliable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub enum Channel {
    Reliable,
    Unreliable,
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum NetMessage {
    /// client -> server, unreliable. Redundant input packet:
    /// `u32 first_id; [u8 dup; bit has_data; input payload]*`.
    SyncInputs { data: Vec<u8> },
    /// server -> client, reliable. The peer's controller switched between
    /// player-driven and server-driven.
    SetServerControlled { enabled: bool },
    /// server -> client, unreliable. Quantized tick-speed delta.
    NotifyFpsAcceleration { speed: u8 },
    /// server -> client, reliable. Delta-snapshot body.
    State { data: Vec<u8> },
    /// client -> server, reliable. The client lost track of the scene and
    /// needs a full snapshot.
    NotifyNeedFullSnapshot,
    /// client -> server, reliable. The client asks to (de)activate its own
    /// networking.
    SetNetworkEnabled { enabled: bool },
    /// server -> client, reliable. The peer got (de)activated.
    NotifyPeerStatus { enabled: bool },
    /// server -> client, unreliable. Epoch batch:
    /// `[u16 net_id; real next_sync; u32 epoch; payload]*`.
    TrickledSyncData { data: Vec<u8> },
    /// server -> client, reliable. Epochs at or before `epoch` for the
    /// given object must be discarded; the doll stream is paused.
    DollSyncPaused { net_id: u16, epoch: u32 },
}

#[derive(Debug)]
pub enum CodecError {
    Serialize(rancor::Error),
    Deserialize(rancor::Error),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Serialize(e) => write!(f, "message serialization failed: {}", e),
            CodecError::Deserialize(e) => write!(f, "message deserialization failed: {}", e),
        }
    }
}

impl std::error::Error for CodecError {}

impl NetMessage {
    pub fn serialize(&self) -> Result<Vec<u8>, CodecError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(CodecError::Serialize)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, CodecError> {
        rkyv::from_bytes::<Self, rancor::Error>(data).map_err(CodecError::Deserialize)
    }
}
