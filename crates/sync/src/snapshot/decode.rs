//! Client-side snapshot parsing.
//!
//! Deltas are additive: every parsed snapshot is an overlay on the last
//! received one, so the full state is always reconstructible without
//! re-transmission. Parsing also performs the client-side bindings: unknown
//! net ids arriving with a path are attached to (or spawned as) host
//! objects, unknown var ids arriving with a name are aligned to the right
//! ordinal.

use crate::buffer::{CompressionLevel, DataBuffer};
use crate::error::SnapshotError;
use crate::host::HostApp;
use crate::ids::{
    FrameIndex, GlobalFrameIndex, ObjectLocalId, ObjectNetId, ScheduledProcedureId, VarId,
};
use crate::registry::{ObjectCapabilities, ProcedureRecord, Registry};
use crate::snapshot::{ObjectSnapshot, SimulatedObjectRef, Snapshot};

/// Result of parsing one `State` message.
#[derive(Debug)]
pub struct DecodeOutcome {
    pub snapshot: Snapshot,
    /// Objects bound to a net id for the first time by this snapshot.
    pub newly_bound: Vec<ObjectLocalId>,
    /// Some object had to be skipped; the caller should request a full
    /// snapshot.
    pub needs_full_snapshot: bool,
}

pub fn decode_snapshot<A: HostApp>(
    app: &mut A,
    registry: &mut Registry,
    base: &Snapshot,
    data: &[u8],
) -> Result<DecodeOutcome, SnapshotError> {
    let mut db = DataBuffer::from_bytes(data.to_vec());
    db.begin_read();

    let mut snapshot = base.clone();
    snapshot.latency = None;
    let mut newly_bound = Vec::new();
    let mut needs_full_snapshot = false;

    snapshot.input_id = if db.read_bool() {
        FrameIndex(db.read_uint(CompressionLevel::L1) as u32)
    } else {
        FrameIndex::NONE
    };

    snapshot.global_frame_index = GlobalFrameIndex(db.read_uint(CompressionLevel::L1) as u32);
    snapshot.partial = db.read_bool();

    if db.read_bool() {
        snapshot.latency = Some(db.read_uint(CompressionLevel::L3) as u8);
    }

    if db.read_bool() {
        let count = db.read_uint(CompressionLevel::L2) as usize;
        let mut refs = Vec::with_capacity(count);
        for _ in 0..count {
            let net_id = ObjectNetId(db.read_uint(CompressionLevel::L2) as u16);
            let controlled_by = db.read_int(CompressionLevel::L1) as i32;
            refs.push(SimulatedObjectRef {
                net_id,
                controlled_by,
            });
        }
        if db.is_overflowed() {
            return Err(SnapshotError::Truncated);
        }
        apply_simulated_list(registry, &refs);
        snapshot.simulated_objects = refs;
    }

    while db.read_bool() {
        if db.is_overflowed() {
            return Err(SnapshotError::Truncated);
        }

        let net_id = ObjectNetId(db.read_uint(CompressionLevel::L2) as u16);
        let path = if db.read_bool() {
            Some(db.read_string())
        } else {
            None
        };
        let controller_frame = if db.read_bool() {
            FrameIndex(db.read_uint(CompressionLevel::L1) as u32)
        } else {
            FrameIndex::NONE
        };

        let local_id = bind_object(app, registry, net_id, path.as_deref());
        if local_id.is_none() {
            // Unknown object with no usable path: consume its content so the
            // rest of the snapshot survives, then ask for a full state.
            if path.is_none() {
                log::warn!(
                    "snapshot references unknown object {} without a path; skipping",
                    net_id
                );
                needs_full_snapshot = true;
            }
            skip_object_body(&mut db)?;
            continue;
        }
        let local_id = local_id.unwrap();
        if !newly_bound.contains(&local_id)
            && registry.object(local_id).is_some_and(|o| !o.net_id().is_none())
            && base.object(net_id).is_none()
        {
            newly_bound.push(local_id);
        }

        let object_snapshot = snapshot.object_mut_padded(net_id);
        object_snapshot.controller_frame = controller_frame;

        // Variables.
        let mut pending: Vec<(VarId, Option<String>, crate::value::VarValue)> = Vec::new();
        while db.read_bool() {
            let var_id = VarId(db.read_uint(CompressionLevel::L3) as u8);
            let name = if db.read_bool() {
                Some(db.read_string())
            } else {
                None
            };
            let value = db.read_variant();
            if db.is_overflowed() {
                return Err(SnapshotError::Truncated);
            }
            pending.push((var_id, name, value));
        }

        // Procedures.
        let mut procedures = None;
        if db.read_bool() {
            let count = db.read_uint(CompressionLevel::L3) as usize;
            let mut list = Vec::with_capacity(count);
            for _ in 0..count {
                let procedure_id = ScheduledProcedureId(db.read_uint(CompressionLevel::L3) as u8);
                let execute_at_frame =
                    GlobalFrameIndex(db.read_uint(CompressionLevel::L1) as u32);
                let arguments = db.read_bytes();
                if db.is_overflowed() {
                    return Err(SnapshotError::Truncated);
                }
                list.push(ProcedureRecord {
                    procedure_id,
                    execute_at_frame,
                    arguments,
                });
            }
            procedures = Some(list);
        }

        // Commit the parsed body into the registry and the overlay.
        let mut object_ok = true;
        for (var_id, name, _) in &pending {
            let known = registry
                .object(local_id)
                .and_then(|o| o.vars.get(var_id.index()))
                .is_some_and(|v| v.enabled);
            match name {
                Some(name) => registry.align_variable(local_id, *var_id, name),
                None if !known => {
                    log::warn!(
                        "snapshot references unknown variable {} on {} without a name",
                        var_id,
                        net_id
                    );
                    needs_full_snapshot = true;
                    object_ok = false;
                }
                None => {}
            }
        }

        let object_snapshot = snapshot.object_mut_padded(net_id);
        if object_ok {
            for (var_id, _, value) in pending {
                if object_snapshot.vars.len() <= var_id.index() {
                    object_snapshot.vars.resize(var_id.index() + 1, None);
                }
                object_snapshot.vars[var_id.index()] = Some(value);
            }
            if let Some(list) = procedures {
                object_snapshot.procedures = list;
            }
        }
    }
    if db.is_overflowed() {
        return Err(SnapshotError::Truncated);
    }

    if db.read_bool() {
        snapshot.custom_data = db.read_bytes();
        snapshot.has_custom_data = true;
    } else {
        snapshot.has_custom_data = false;
        snapshot.custom_data.clear();
    }
    if db.is_overflowed() {
        return Err(SnapshotError::Truncated);
    }

    Ok(DecodeOutcome {
        snapshot,
        newly_bound,
        needs_full_snapshot,
    })
}

/// Binds a net id to a local object, spawning through the host when the
/// path names an object this process doesn't know yet.
fn bind_object<A: HostApp>(
    app: &mut A,
    registry: &mut Registry,
    net_id: ObjectNetId,
    path: Option<&str>,
) -> Option<ObjectLocalId> {
    if let Some(local_id) = registry.local_of_net(net_id) {
        return Some(local_id);
    }

    let path = path?;
    let local_id = match registry.find_by_path(path) {
        Some(local_id) => local_id,
        None => {
            let handle = app.locate_object(path)?;
            match registry.local_of_handle(handle) {
                Some(local_id) => local_id,
                None => registry.register_object(handle, path, ObjectCapabilities::default()),
            }
        }
    };
    registry.set_net_id(local_id, net_id);
    Some(local_id)
}

/// Keeps the client's rollback set aligned with the server's simulated
/// list: listed objects are realtime, everything else is not.
fn apply_simulated_list(registry: &mut Registry, refs: &[SimulatedObjectRef]) {
    let all: Vec<ObjectLocalId> = registry.local_ids();
    for local_id in all {
        let Some(object) = registry.object(local_id) else {
            continue;
        };
        let net_id = object.net_id();
        if net_id.is_none() {
            continue;
        }
        let listed = refs.iter().find(|r| r.net_id == net_id);
        if let Some(object) = registry.object_mut(local_id) {
            object.realtime_sync_enabled_on_client = listed.is_some();
        }
        if let Some(listed) = listed {
            registry.set_controlled_by(local_id, listed.controlled_by);
        }
    }
}

/// Consumes the body of one object entry without committing anything.
fn skip_object_body(db: &mut DataBuffer) -> Result<(), SnapshotError> {
    while db.read_bool() {
        let _var_id = db.read_uint(CompressionLevel::L3);
        if db.read_bool() {
            let _ = db.read_string();
        }
        let _ = db.read_variant();
        if db.is_overflowed() {
            return Err(SnapshotError::Truncated);
        }
    }
    if db.read_bool() {
        let count = db.read_uint(CompressionLevel::L3) as usize;
        for _ in 0..count {
            let _ = db.read_uint(CompressionLevel::L3);
            let _ = db.read_uint(CompressionLevel::L1);
            let _ = db.read_bytes();
            if db.is_overflowed() {
                return Err(SnapshotError::Truncated);
            }
        }
    }
    Ok(())
}

/// Equality used by the "applying the same snapshot twice is a no-op"
/// guarantee: overlays compare by content.
pub fn overlays_equal(a: &Snapshot, b: &Snapshot, tolerance: f64) -> bool {
    if a.simulated_objects != b.simulated_objects
        || a.has_custom_data != b.has_custom_data
        || a.custom_data != b.custom_data
        || a.objects.len() != b.objects.len()
    {
        return false;
    }
    a.objects.iter().zip(b.objects.iter()).all(|(oa, ob)| {
        object_snapshots_equal(oa, ob, tolerance)
    })
}

fn object_snapshots_equal(a: &ObjectSnapshot, b: &ObjectSnapshot, tolerance: f64) -> bool {
    if a.procedures != b.procedures || a.vars.len() != b.vars.len() {
        return false;
    }
    a.vars.iter().zip(b.vars.iter()).all(|(va, vb)| match (va, vb) {
        (None, None) => true,
        (Some(va), Some(vb)) => va.compare(vb, tolerance),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groups::SyncGroup;
    use crate::ids::{ObjectHandle, SyncGroupId, NO_PEER};
    use crate::snapshot::encode::{encode_snapshot, ControllerFrames, SnapshotEncodeParams};
    use crate::value::VarValue;

    struct NullApp;
    impl HostApp for NullApp {
        fn get_variable(&self, _: ObjectHandle, _: &str) -> Option<VarValue> {
            None
        }
        fn set_variable(&mut self, _: ObjectHandle, _: &str, _: &VarValue) -> bool {
            true
        }
        fn process(&mut self, _: ObjectHandle, _: crate::host::ProcessPhase, _: f32) {}
        fn locate_object(&mut self, path: &str) -> Option<ObjectHandle> {
            // Spawn objects named "spawn/N" on demand.
            path.strip_prefix("spawn/")
                .and_then(|n| n.parse::<u64>().ok())
                .map(|n| ObjectHandle(1000 + n))
        }
    }

    fn server_side() -> (Registry, SyncGroup) {
        let mut registry = Registry::new(0.001);
        let mut group = SyncGroup::new(SyncGroupId::GLOBAL);

        let local = registry.register_object(
            ObjectHandle(1),
            "spawn/1",
            ObjectCapabilities::default(),
        );
        registry.set_net_id(local, ObjectNetId(0));
        registry.register_variable(local, "hp", VarValue::Int(42), false);
        registry.register_variable(local, "pos", VarValue::Real(1.5), false);
        group.add_new_object(local, NO_PEER, true);
        group.notify_new_variable(local, "hp");
        group.notify_new_variable(local, "pos");

        (registry, group)
    }

    fn full_params<'a>(frames: &'a ControllerFrames) -> SnapshotEncodeParams<'a> {
        SnapshotEncodeParams {
            input_id: FrameIndex(7),
            global_frame_index: GlobalFrameIndex(100),
            force_full: true,
            partial_objects: None,
            latency: Some(12),
            controller_frames: frames,
            custom_data: None,
        }
    }

    #[test]
    fn full_snapshot_roundtrip_binds_and_populates() {
        let (server_registry, group) = server_side();
        let frames = ControllerFrames::new();
        let bytes = encode_snapshot(&server_registry, &group, &full_params(&frames));

        // Fresh client registry: object unknown, spawned via path.
        let mut client_registry = Registry::new(0.001);
        let mut app = NullApp;
        let base = Snapshot::default();
        let outcome = decode_snapshot(&mut app, &mut client_registry, &base, &bytes).unwrap();

        assert!(!outcome.needs_full_snapshot);
        assert_eq!(outcome.snapshot.input_id, FrameIndex(7));
        assert_eq!(outcome.snapshot.global_frame_index, GlobalFrameIndex(100));
        assert_eq!(outcome.snapshot.latency, Some(12));
        assert_eq!(
            outcome.snapshot.get_var(ObjectNetId(0), 0),
            Some(&VarValue::Int(42))
        );
        assert_eq!(
            outcome.snapshot.get_var(ObjectNetId(0), 1),
            Some(&VarValue::Real(1.5))
        );

        // The client registry learned the binding and the variable names.
        let local = client_registry.local_of_net(ObjectNetId(0)).unwrap();
        let object = client_registry.object(local).unwrap();
        assert_eq!(object.vars[0].name, "hp");
        assert_eq!(object.vars[1].name, "pos");
    }

    #[test]
    fn delta_overlays_on_base() {
        let (mut server_registry, mut group) = server_side();
        let frames = ControllerFrames::new();

        // Full first.
        let full = encode_snapshot(&server_registry, &group, &full_params(&frames));
        let mut client_registry = Registry::new(0.001);
        let mut app = NullApp;
        let outcome =
            decode_snapshot(&mut app, &mut client_registry, &Snapshot::default(), &full).unwrap();
        let base = outcome.snapshot;
        group.mark_changes_as_notified();

        // Only `hp` changes.
        let local = server_registry.local_of_net(ObjectNetId(0)).unwrap();
        server_registry.object_mut(local).unwrap().vars[0].value = VarValue::Int(7);
        group.notify_variable_changed(local, "hp");

        let delta_params = SnapshotEncodeParams {
            input_id: FrameIndex(8),
            global_frame_index: GlobalFrameIndex(101),
            force_full: false,
            partial_objects: None,
            latency: None,
            controller_frames: &frames,
            custom_data: None,
        };
        let delta = encode_snapshot(&server_registry, &group, &delta_params);
        let outcome = decode_snapshot(&mut app, &mut client_registry, &base, &delta).unwrap();

        // hp updated, pos carried over from the base.
        assert_eq!(
            outcome.snapshot.get_var(ObjectNetId(0), 0),
            Some(&VarValue::Int(7))
        );
        assert_eq!(
            outcome.snapshot.get_var(ObjectNetId(0), 1),
            Some(&VarValue::Real(1.5))
        );
        assert!(outcome.snapshot.latency.is_none());
    }

    #[test]
    fn unknown_object_without_path_requests_full() {
        let (mut server_registry, mut group) = server_side();
        group.mark_changes_as_notified();
        let frames = ControllerFrames::new();

        // Delta referencing an object the client never saw.
        let local = server_registry.local_of_net(ObjectNetId(0)).unwrap();
        server_registry.object_mut(local).unwrap().vars[0].value = VarValue::Int(9);
        group.notify_variable_changed(local, "hp");

        let params = SnapshotEncodeParams {
            input_id: FrameIndex::NONE,
            global_frame_index: GlobalFrameIndex(5),
            force_full: false,
            partial_objects: None,
            latency: None,
            controller_frames: &frames,
            custom_data: None,
        };
        let bytes = encode_snapshot(&server_registry, &group, &params);

        let mut client_registry = Registry::new(0.001);
        let mut app = NullApp;
        let outcome =
            decode_snapshot(&mut app, &mut client_registry, &Snapshot::default(), &bytes).unwrap();
        assert!(outcome.needs_full_snapshot);
        assert!(outcome.snapshot.object(ObjectNetId(0)).is_none_or(|o| o.is_empty()));
    }

    #[test]
    fn truncated_body_errors() {
        let (server_registry, group) = server_side();
        let frames = ControllerFrames::new();
        let mut bytes = encode_snapshot(&server_registry, &group, &full_params(&frames));
        // Cut inside the header so the overflow is unavoidable.
        bytes.truncate(3);

        let mut client_registry = Registry::new(0.001);
        let mut app = NullApp;
        let result = decode_snapshot(&mut app, &mut client_registry, &Snapshot::default(), &bytes);
        assert_eq!(result.unwrap_err(), SnapshotError::Truncated);
    }

    #[test]
    fn applying_the_same_snapshot_twice_is_a_no_op() {
        let (server_registry, group) = server_side();
        let frames = ControllerFrames::new();
        let bytes = encode_snapshot(&server_registry, &group, &full_params(&frames));

        let mut client_registry = Registry::new(0.001);
        let mut app = NullApp;
        let first =
            decode_snapshot(&mut app, &mut client_registry, &Snapshot::default(), &bytes)
                .unwrap()
                .snapshot;
        let second = decode_snapshot(&mut app, &mut client_registry, &first, &bytes)
            .unwrap()
            .snapshot;
        assert!(overlays_equal(&first, &second, 0.001));
    }

    #[test]
    fn simulated_list_updates_client_rollback_set() {
        let (server_registry, group) = server_side();
        let frames = ControllerFrames::new();
        let bytes = encode_snapshot(&server_registry, &group, &full_params(&frames));

        let mut client_registry = Registry::new(0.001);
        // Pre-register a second object that the server's list doesn't carry.
        let other = client_registry.register_object(
            ObjectHandle(50),
            "spawn/50",
            ObjectCapabilities::default(),
        );
        client_registry.set_net_id(other, ObjectNetId(9));

        let mut app = NullApp;
        decode_snapshot(&mut app, &mut client_registry, &Snapshot::default(), &bytes).unwrap();

        let bound = client_registry.local_of_net(ObjectNetId(0)).unwrap();
        assert!(client_registry.object(bound).unwrap().realtime_sync_enabled_on_client);
        assert!(!client_registry.object(other).unwrap().realtime_sync_enabled_on_client);
    }
}
