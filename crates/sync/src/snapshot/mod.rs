//! World-state snapshots: capture, comparison, wire encode/decode.

mod decode;
mod encode;

pub use decode::{decode_snapshot, DecodeOutcome};
pub use encode::{encode_snapshot, ControllerFrames, SnapshotEncodeParams};

use crate::ids::{FrameIndex, GlobalFrameIndex, ObjectNetId, PeerId, NO_PEER};
use crate::registry::{ProcedureRecord, Registry};
use crate::value::VarValue;

/// The reserved `input_id` marking a snapshot that carries only no-rewind
/// recovery data.
pub const NO_REWIND_INPUT_ID: FrameIndex = FrameIndex(0);

/// One object's slice of a snapshot. Variable slots are ordered by `VarId`;
/// a `None` means the snapshot carries no value for that slot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectSnapshot {
    pub vars: Vec<Option<VarValue>>,
    pub procedures: Vec<ProcedureRecord>,
    /// Input confirmation for an object controlled by another peer.
    /// Informational; never compared.
    pub controller_frame: FrameIndex,
}

impl ObjectSnapshot {
    pub fn is_empty(&self) -> bool {
        self.vars.iter().all(Option::is_none) && self.procedures.is_empty()
    }
}

/// Entry of the simulated-objects list carried by snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatedObjectRef {
    pub net_id: ObjectNetId,
    pub controlled_by: PeerId,
}

/// A captured view of all simulated objects at one input frame.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// The emitting controller's input frame. `NONE` when the receiving
    /// peer has no controller; [`NO_REWIND_INPUT_ID`] marks a pure
    /// no-rewind recovery overlay.
    pub input_id: FrameIndex,
    pub global_frame_index: GlobalFrameIndex,
    pub simulated_objects: Vec<SimulatedObjectRef>,
    /// Indexed by `ObjectNetId`.
    pub objects: Vec<ObjectSnapshot>,
    pub has_custom_data: bool,
    pub custom_data: Vec<u8>,
    /// Emitted under a partial-update budget: untouched variables are not
    /// authoritatively confirmed by this snapshot.
    pub partial: bool,
    /// Compressed latency piggy-backed by the server, if any.
    pub latency: Option<u8>,
}

impl Snapshot {
    pub fn object(&self, net_id: ObjectNetId) -> Option<&ObjectSnapshot> {
        self.objects.get(net_id.index())
    }

    pub fn object_mut_padded(&mut self, net_id: ObjectNetId) -> &mut ObjectSnapshot {
        if self.objects.len() <= net_id.index() {
            self.objects.resize(net_id.index() + 1, ObjectSnapshot::default());
        }
        &mut self.objects[net_id.index()]
    }

    pub fn get_var(&self, net_id: ObjectNetId, var_index: usize) -> Option<&VarValue> {
        self.objects
            .get(net_id.index())?
            .vars
            .get(var_index)?
            .as_ref()
    }
}

/// Result of a snapshot comparison.
pub struct ComparisonReport {
    /// True when nothing that forces a rewind differs.
    pub equal: bool,
    /// Objects whose rewind-relevant state differs.
    pub different_objects: Vec<ObjectNetId>,
    /// Overlay of skip-rewinding values (and procedure sets) to snap-apply
    /// without replaying. `input_id` is [`NO_REWIND_INPUT_ID`] when
    /// populated.
    pub no_rewind_recover: Snapshot,
}

/// Compares a server snapshot against a client prediction.
///
/// Ordering: global frame index first (when both sides carry one), then the
/// simulated-objects list, then custom data, then per-object per-variable
/// values under `tolerance`. Objects controlled by a peer other than
/// `local_peer` reconcile through their own doll stream and are skipped.
///
/// Mismatches on skip-rewinding variables, and any scheduled-procedure
/// difference, never force a rewind: they are collected into
/// `no_rewind_recover` instead.
pub fn compare_snapshots(
    registry: &Registry,
    server: &Snapshot,
    client: &Snapshot,
    local_peer: PeerId,
    tolerance: f64,
) -> ComparisonReport {
    let mut report = ComparisonReport {
        equal: true,
        different_objects: Vec::new(),
        no_rewind_recover: Snapshot {
            input_id: FrameIndex::NONE,
            ..Default::default()
        },
    };

    if !server.global_frame_index.is_none()
        && !client.global_frame_index.is_none()
        && server.global_frame_index != client.global_frame_index
    {
        log::debug!(
            "global frame index differs: server {} client {}",
            server.global_frame_index,
            client.global_frame_index
        );
        report.equal = false;
    }

    if server.simulated_objects != client.simulated_objects {
        log::debug!("simulated objects list differs");
        report.equal = false;
    }

    if server.has_custom_data != client.has_custom_data
        || (server.has_custom_data && server.custom_data != client.custom_data)
    {
        log::debug!("custom data differs");
        report.equal = false;
    }

    for (index, server_object) in server.objects.iter().enumerate() {
        let net_id = ObjectNetId(index as u16);
        let Some(object_data) = registry.object_by_net(net_id) else {
            continue;
        };
        if !object_data.realtime_sync_enabled_on_client {
            continue;
        }
        let controlled_by = object_data.controlled_by_peer();
        if controlled_by != NO_PEER && controlled_by != local_peer {
            // A doll's object: its own epoch stream reconciles it.
            continue;
        }

        let client_object = client.objects.get(index);
        let mut object_differs = false;

        for (var_index, server_var) in server_object.vars.iter().enumerate() {
            let Some(server_value) = server_var else {
                // Not carried by the server snapshot; assumed correct.
                continue;
            };
            let client_value = client_object
                .and_then(|o| o.vars.get(var_index))
                .and_then(|v| v.as_ref());

            let different = match client_value {
                Some(value) => !server_value.compare(value, tolerance),
                None => true,
            };
            if !different {
                continue;
            }

            let skip_rewinding = object_data
                .vars
                .get(var_index)
                .map(|v| v.skip_rewinding)
                .unwrap_or(false);

            if skip_rewinding {
                let slot = report.no_rewind_recover.object_mut_padded(net_id);
                if slot.vars.len() <= var_index {
                    slot.vars.resize(var_index + 1, None);
                }
                slot.vars[var_index] = Some(server_value.clone());
                report.no_rewind_recover.input_id = NO_REWIND_INPUT_ID;
                if !report
                    .no_rewind_recover
                    .simulated_objects
                    .iter()
                    .any(|r| r.net_id == net_id)
                {
                    report.no_rewind_recover.simulated_objects.push(SimulatedObjectRef {
                        net_id,
                        controlled_by,
                    });
                }
            } else {
                object_differs = true;
            }
        }

        // Scheduled procedures are information about the future; a client
        // missing them just needs the update, never a rewind.
        let client_procedures = client_object.map(|o| o.procedures.as_slice()).unwrap_or(&[]);
        if server_object.procedures != client_procedures && !server_object.procedures.is_empty() {
            let slot = report.no_rewind_recover.object_mut_padded(net_id);
            slot.procedures = server_object.procedures.clone();
            report.no_rewind_recover.input_id = NO_REWIND_INPUT_ID;
        }

        if object_differs {
            report.equal = false;
            report.different_objects.push(net_id);
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ObjectHandle, ObjectLocalId};
    use crate::registry::ObjectCapabilities;

    fn registry_with(n: usize) -> (Registry, Vec<ObjectLocalId>) {
        let mut registry = Registry::new(0.001);
        let mut ids = Vec::new();
        for i in 0..n {
            let local = registry.register_object(
                ObjectHandle(i as u64 + 1),
                &format!("obj/{i}"),
                ObjectCapabilities::default(),
            );
            registry.set_net_id(local, ObjectNetId(i as u16));
            registry.register_variable(local, "value", VarValue::Int(0), false);
            ids.push(local);
        }
        (registry, ids)
    }

    fn snapshot_with(values: &[i64]) -> Snapshot {
        let mut snap = Snapshot {
            input_id: FrameIndex(5),
            ..Default::default()
        };
        for (i, v) in values.iter().enumerate() {
            let slot = snap.object_mut_padded(ObjectNetId(i as u16));
            slot.vars = vec![Some(VarValue::Int(*v))];
        }
        snap
    }

    #[test]
    fn equal_snapshots_report_equal() {
        let (registry, _) = registry_with(2);
        let a = snapshot_with(&[1, 2]);
        let b = snapshot_with(&[1, 2]);
        let report = compare_snapshots(&registry, &a, &b, 2, 0.001);
        assert!(report.equal);
        assert!(report.different_objects.is_empty());
        assert!(report.no_rewind_recover.input_id.is_none());
    }

    #[test]
    fn value_difference_triggers_rewind() {
        let (registry, _) = registry_with(2);
        let server = snapshot_with(&[1, 9]);
        let client = snapshot_with(&[1, 2]);
        let report = compare_snapshots(&registry, &server, &client, 2, 0.001);
        assert!(!report.equal);
        assert_eq!(report.different_objects, vec![ObjectNetId(1)]);
    }

    #[test]
    fn float_tolerance_suppresses_noise() {
        let (mut registry, ids) = registry_with(1);
        registry.register_variable(ids[0], "value", VarValue::Real(0.0), false);

        let mut server = Snapshot::default();
        server.object_mut_padded(ObjectNetId(0)).vars = vec![Some(VarValue::Real(1.0))];
        let mut client = Snapshot::default();
        client.object_mut_padded(ObjectNetId(0)).vars = vec![Some(VarValue::Real(1.0004))];

        let report = compare_snapshots(&registry, &server, &client, 2, 0.001);
        assert!(report.equal);
    }

    #[test]
    fn skip_rewinding_goes_to_no_rewind_recover() {
        let (mut registry, ids) = registry_with(1);
        registry.set_skip_rewinding(ids[0], "value", true);

        let server = snapshot_with(&[9]);
        let client = snapshot_with(&[1]);
        let report = compare_snapshots(&registry, &server, &client, 2, 0.001);

        assert!(report.equal, "skip-rewinding difference must not rewind");
        assert_eq!(report.no_rewind_recover.input_id, NO_REWIND_INPUT_ID);
        assert_eq!(
            report.no_rewind_recover.get_var(ObjectNetId(0), 0),
            Some(&VarValue::Int(9))
        );
    }

    #[test]
    fn doll_objects_are_skipped() {
        let (mut registry, ids) = registry_with(1);
        registry.set_controlled_by(ids[0], 9);

        let server = snapshot_with(&[5]);
        let client = snapshot_with(&[1]);
        // Local peer is 2; the object belongs to doll peer 9.
        let report = compare_snapshots(&registry, &server, &client, 2, 0.001);
        assert!(report.equal);
    }

    #[test]
    fn missing_server_value_is_assumed_correct() {
        let (registry, _) = registry_with(1);
        let mut server = snapshot_with(&[0]);
        server.objects[0].vars[0] = None;
        let client = snapshot_with(&[123]);
        let report = compare_snapshots(&registry, &server, &client, 2, 0.001);
        assert!(report.equal);
    }

    #[test]
    fn procedure_difference_never_rewinds() {
        let (registry, _) = registry_with(1);
        let mut server = snapshot_with(&[1]);
        server.objects[0].procedures = vec![ProcedureRecord {
            procedure_id: crate::ids::ScheduledProcedureId(0),
            execute_at_frame: GlobalFrameIndex(100),
            arguments: vec![1, 2],
        }];
        let client = snapshot_with(&[1]);

        let report = compare_snapshots(&registry, &server, &client, 2, 0.001);
        assert!(report.equal);
        assert_eq!(report.no_rewind_recover.input_id, NO_REWIND_INPUT_ID);
        assert_eq!(
            report.no_rewind_recover.objects[0].procedures,
            server.objects[0].procedures
        );
    }

    #[test]
    fn global_frame_mismatch_fails_when_both_present() {
        let (registry, _) = registry_with(1);
        let mut server = snapshot_with(&[1]);
        server.global_frame_index = GlobalFrameIndex(10);
        let mut client = snapshot_with(&[1]);
        client.global_frame_index = GlobalFrameIndex(11);

        assert!(!compare_snapshots(&registry, &server, &client, 2, 0.001).equal);

        // Client predictions without a global frame skip the check.
        client.global_frame_index = GlobalFrameIndex::NONE;
        assert!(compare_snapshots(&registry, &server, &client, 2, 0.001).equal);
    }
}
