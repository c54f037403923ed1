//! Identifier domain of the synchronization core.
//!
//! Every cross-reference in the engine is an integer id with a `NONE`
//! sentinel at the type's maximum value; nothing holds pointers into the
//! host application or into other subsystems.

use serde::{Deserialize, Serialize};

/// Network peer identifier. The server is always peer `1`; `-1` marks
/// "no peer" (server-only / unowned objects).
pub type PeerId = i32;

/// The peer id the authoritative server runs under.
pub const SERVER_PEER: PeerId = 1;

/// Sentinel for "not controlled by any peer".
pub const NO_PEER: PeerId = -1;

macro_rules! sentinel_id {
    ($(#[$doc:meta])* $name:ident, $raw:ty) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub $raw);

        impl $name {
            pub const NONE: $name = $name(<$raw>::MAX);

            #[inline]
            pub fn is_none(self) -> bool {
                self == Self::NONE
            }

            #[inline]
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::NONE
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                if self.is_none() {
                    write!(f, "{}(NONE)", stringify!($name))
                } else {
                    write!(f, "{}({})", stringify!($name), self.0)
                }
            }
        }
    };
}

sentinel_id!(
    /// Per-controller input tick counter. `FrameIndex(0)` is reserved as the
    /// "no-rewind recover" marker inside snapshots, so real input streams
    /// start counting at 1.
    FrameIndex,
    u32
);

sentinel_id!(
    /// Wall tick counter, incremented once per scheduler iteration.
    GlobalFrameIndex,
    u32
);

sentinel_id!(
    /// Server-assigned network-wide object id, broadcast to clients.
    ObjectNetId,
    u16
);

sentinel_id!(
    /// Per-process stable object id, assigned at registration and never
    /// reused for a different object.
    ObjectLocalId,
    u32
);

sentinel_id!(
    /// Opaque key into the host application. The core never interprets it.
    ObjectHandle,
    u64
);

sentinel_id!(
    /// Ordinal of a variable inside one object. Immutable for the object's
    /// lifetime; erasing a variable disables the slot but never shifts ids.
    VarId,
    u8
);

sentinel_id!(
    /// Ordinal of a scheduled procedure inside one object.
    ScheduledProcedureId,
    u8
);

sentinel_id!(
    /// Serialization scheme selector (see [`crate::scheme`]).
    SchemeId,
    u8
);

/// Sync group identifier. Group `0` is the global group every peer starts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SyncGroupId(pub u32);

impl SyncGroupId {
    pub const GLOBAL: SyncGroupId = SyncGroupId(0);
    pub const NONE: SyncGroupId = SyncGroupId(u32::MAX);

    #[inline]
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl Default for SyncGroupId {
    fn default() -> Self {
        Self::GLOBAL
    }
}

impl FrameIndex {
    /// The next input frame, saturating below `NONE`.
    #[inline]
    pub fn next(self) -> FrameIndex {
        debug_assert!(!self.is_none());
        FrameIndex(self.0.wrapping_add(1))
    }

    #[inline]
    pub fn advance(&mut self) {
        *self = self.next();
    }
}

impl GlobalFrameIndex {
    #[inline]
    pub fn advance(&mut self) {
        debug_assert!(!self.is_none());
        self.0 = self.0.wrapping_add(1);
    }
}
