//! Server-side delta snapshot encoding.
//!
//! Body layout (bit-packed, in order):
//!
//! ```text
//! [has_input_id:1] [input_id:u32]?
//! [global_frame_index:u32]
//! [partial:1]
//! [has_latency:1] [latency:u8]?
//! [simulated_list:1] { [count:u16] ([net_id:u16][controlled_by:i32])* }?
//! object*:
//!   [1] [net_id:u16] [has_path:1][path]? [has_frame:1][frame:u32]?
//!   var*: [1] [var_id:u8] [has_name:1][name]? [value:variant]
//!   [0]
//!   [has_procedures:1] { [count:u8] ([id:u8][frame:u32][args:bytes])* }?
//! [0]
//! [has_custom:1] [custom:bytes]?
//! ```
//!
//! A normal snapshot carries only changed objects/variables; a full one
//! carries every registered object with ids *and* names so a fresh client
//! can bind them.

use std::collections::HashSet;

use crate::buffer::{CompressionLevel, DataBuffer};
use crate::groups::SyncGroup;
use crate::ids::{FrameIndex, GlobalFrameIndex, ObjectLocalId, ObjectNetId, PeerId};
use crate::registry::Registry;

/// Input confirmations for objects controlled by peers other than the
/// recipient.
pub type ControllerFrames = Vec<(ObjectNetId, FrameIndex)>;

pub struct SnapshotEncodeParams<'a> {
    /// The recipient's own controller confirmation, `NONE` when absent.
    pub input_id: FrameIndex,
    pub global_frame_index: GlobalFrameIndex,
    /// Include every object and every variable, names included.
    pub force_full: bool,
    /// When set, only these objects are carried and the snapshot is flagged
    /// partial.
    pub partial_objects: Option<&'a HashSet<ObjectLocalId>>,
    pub latency: Option<u8>,
    pub controller_frames: &'a ControllerFrames,
    pub custom_data: Option<&'a [u8]>,
}

pub fn encode_snapshot(
    registry: &Registry,
    group: &SyncGroup,
    params: &SnapshotEncodeParams<'_>,
) -> Vec<u8> {
    let mut db = DataBuffer::new();
    db.begin_write(0);

    if params.input_id.is_none() {
        db.add_bool(false);
    } else {
        db.add_bool(true);
        db.add_uint(params.input_id.0 as u64, CompressionLevel::L1);
    }

    db.add_uint(params.global_frame_index.0 as u64, CompressionLevel::L1);
    db.add_bool(params.partial_objects.is_some());

    match params.latency {
        Some(latency) => {
            db.add_bool(true);
            db.add_uint(latency as u64, CompressionLevel::L3);
        }
        None => {
            db.add_bool(false);
        }
    }

    // The simulated-objects list travels when it changed (or on a full
    // snapshot) so clients can keep their rollback set aligned.
    let include_list = params.force_full || group.is_simulated_list_changed();
    db.add_bool(include_list);
    if include_list {
        let members: Vec<(ObjectNetId, PeerId)> = group
            .simulated()
            .iter()
            .filter_map(|info| {
                registry
                    .object(info.local_id)
                    .map(|o| (o.net_id(), info.controlled_by))
            })
            .filter(|(net_id, _)| !net_id.is_none())
            .collect();
        db.add_uint(members.len() as u64, CompressionLevel::L2);
        for (net_id, controlled_by) in members {
            db.add_uint(net_id.0 as u64, CompressionLevel::L2);
            db.add_int(controlled_by as i64, CompressionLevel::L1);
        }
    }

    for info in group.simulated() {
        let Some(object) = registry.object(info.local_id) else {
            continue;
        };
        if object.net_id().is_none() {
            continue;
        }

        let change = &info.change;
        let include = params.force_full || !change.is_empty();
        if !include {
            continue;
        }
        if let Some(allowed) = params.partial_objects {
            if !allowed.contains(&info.local_id) {
                continue;
            }
        }

        db.add_bool(true);
        db.add_uint(object.net_id().0 as u64, CompressionLevel::L2);

        let send_path = params.force_full || change.unknown;
        db.add_bool(send_path);
        if send_path {
            db.add_string(&object.path);
        }

        let frame = params
            .controller_frames
            .iter()
            .find(|(net_id, _)| *net_id == object.net_id())
            .map(|(_, frame)| *frame)
            .filter(|frame| !frame.is_none());
        db.add_bool(frame.is_some());
        if let Some(frame) = frame {
            db.add_uint(frame.0 as u64, CompressionLevel::L1);
        }

        for var in &object.vars {
            if !var.enabled {
                continue;
            }
            if !params.force_full && !change.changed_vars.contains(&var.name) {
                continue;
            }

            db.add_bool(true);
            db.add_uint(var.id.0 as u64, CompressionLevel::L3);

            let send_name = params.force_full || change.unknown_vars.contains(&var.name);
            db.add_bool(send_name);
            if send_name {
                db.add_string(&var.name);
            }

            db.add_variant(&var.value);
        }
        db.add_bool(false);

        // An empty list still travels when the set changed, so clients drop
        // what the server already executed.
        let send_procedures =
            params.force_full || change.procedures_changed || change.unknown;
        db.add_bool(send_procedures);
        if send_procedures {
            db.add_uint(object.procedures.len() as u64, CompressionLevel::L3);
            for procedure in &object.procedures {
                db.add_uint(procedure.procedure_id.0 as u64, CompressionLevel::L3);
                db.add_uint(procedure.execute_at_frame.0 as u64, CompressionLevel::L1);
                db.add_bytes(&procedure.arguments);
            }
        }
    }
    db.add_bool(false);

    match params.custom_data {
        Some(data) => {
            db.add_bool(true);
            db.add_bytes(data);
        }
        None => {
            db.add_bool(false);
        }
    }

    db.dry();
    db.to_byte_vec()
}
