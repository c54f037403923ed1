//! Error types for the fallible wire paths.
//!
//! Registry lookups and host-facing operations stay sentinel-based (NONE
//! ids, `None` values); only packet parsing surfaces typed errors, which the
//! engine maps to the recovery behaviors of the protocol (skip object and
//! request a full snapshot on the client, drop the packet on the server).

use thiserror::Error;

use crate::ids::{ObjectNetId, VarId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot body ended before the declared content")]
    Truncated,
    #[error("unknown object {0} referenced without an accompanying path")]
    UnknownObject(ObjectNetId),
    #[error("unknown variable {var} on object {object} referenced without a name")]
    UnknownVariable { object: ObjectNetId, var: VarId },
    #[error("object {0} carries a malformed value")]
    BadValue(ObjectNetId),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputPacketError {
    #[error("input packet smaller than its header")]
    Undersized,
    #[error("input record at byte {0} overruns the packet")]
    RecordOverrun(usize),
    #[error("trailing bytes after the last input record")]
    TrailingBytes,
}
