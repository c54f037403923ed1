//! Client-server scene synchronization with prediction and rollback.
//!
//! The authoritative server advances every peer's input stream, tracks the
//! variables registered on each object and broadcasts delta snapshots;
//! clients predict their own controller, interpolate everything else and,
//! when a snapshot disagrees with what they predicted, rewind to the
//! confirmed frame and replay their stored inputs.
//!
//! The host engine stays on the other side of two small traits:
//! [`HostApp`] (variable access, controller callbacks, trickled
//! interpolation) and [`Transport`] (message delivery). Everything in
//! between lives here: input redundancy, tick-rate adjustment, snapshot
//! diffing, sync groups, trickled scheduling, scheduled procedures.

pub mod buffer;
pub mod controller;
pub mod error;
pub mod event;
pub mod groups;
pub mod host;
pub mod ids;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod scheme;
pub mod settings;
pub mod snapshot;
pub mod stats;
pub mod sync;
pub mod transport;
pub mod value;

pub use buffer::{BitArray, CompressionLevel, DataBuffer, DataType};
pub use controller::{
    AutonomousServerController, Controller, DollController, EpochStream, FrameInput,
    NoNetController, PlayerController, ServerController,
};
pub use error::{InputPacketError, SnapshotError};
pub use event::{Event, EventHandler, EventProcessor, PHandler, Processor};
pub use groups::{Change, SimulatedObjectInfo, SyncGroup, TrickledObjectInfo};
pub use host::{HostApp, ProcedurePhase, ProcessPhase};
pub use ids::{
    FrameIndex, GlobalFrameIndex, ObjectHandle, ObjectLocalId, ObjectNetId, PeerId,
    ScheduledProcedureId, SchemeId, SyncGroupId, VarId, NO_PEER, SERVER_PEER,
};
pub use peer::{PeerAuthority, PeerData, PeerServerData};
pub use protocol::{Channel, NetMessage};
pub use registry::{
    ChangeNotification, ListenerHandle, NetEventFlag, ObjectCapabilities, ObjectData,
    ProcedureRecord, Registry, VarDescriptor,
};
pub use scheme::{SchemeEntry, SerializationScheme};
pub use settings::{Settings, MAX_ADDITIONAL_TICK_SPEED};
pub use snapshot::{
    compare_snapshots, decode_snapshot, encode_snapshot, ComparisonReport, ObjectSnapshot,
    SimulatedObjectRef, Snapshot, NO_REWIND_INPUT_ID,
};
pub use stats::StatRing;
pub use sync::{DesyncReport, SceneSync, SyncSignals};
pub use transport::{LinkConditions, LocalEndpoint, LocalHub, Transport};
pub use value::VarValue;
