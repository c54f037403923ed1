//! Per-object bookkeeping.

use crate::buffer::DataBuffer;
use crate::host::PROCESS_PHASE_COUNT;
use crate::ids::{
    GlobalFrameIndex, ObjectHandle, ObjectLocalId, ObjectNetId, PeerId, ScheduledProcedureId,
    SchemeId, VarId, NO_PEER,
};
use crate::value::VarValue;

/// Capabilities declared at registration. They decide which [`HostApp`]
/// (see [`crate::host::HostApp`]) families the core will invoke on the
/// object's handle.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectCapabilities {
    /// The object can act as a controller (input collection + processing).
    pub controller: bool,
    /// The object supports trickled collect/apply.
    pub trickled: bool,
    /// Number of scheduled-procedure slots the host exposes.
    pub procedure_count: u8,
    /// Serialization scheme describing the controller input layout, when
    /// the host wants the built-in codec for `are_inputs_different` /
    /// `count_input_size`.
    pub input_scheme: Option<SchemeId>,
}

/// A named slot inside one object. Its position in `ObjectData::vars` is its
/// `VarId` and never changes; erasing a variable only disables the slot.
#[derive(Debug)]
pub struct VarDescriptor {
    pub id: VarId,
    pub name: String,
    /// Last committed value, compared against the host on every change pull.
    pub value: VarValue,
    pub skip_rewinding: bool,
    pub enabled: bool,
    pub(crate) listeners: Vec<usize>,
}

/// A procedure scheduled on this object, broadcast inside snapshots until
/// executed.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureRecord {
    pub procedure_id: ScheduledProcedureId,
    pub execute_at_frame: GlobalFrameIndex,
    pub arguments: Vec<u8>,
}

impl ProcedureRecord {
    pub fn arguments_buffer(&self) -> DataBuffer {
        DataBuffer::from_bytes(self.arguments.clone())
    }
}

#[derive(Debug)]
pub struct ObjectData {
    pub local_id: ObjectLocalId,
    pub(crate) net_id: ObjectNetId,
    pub handle: ObjectHandle,
    /// Stable path identifying the object across processes; travels in full
    /// snapshots so clients can bind net ids.
    pub path: String,
    pub(crate) controlled_by_peer: PeerId,
    pub capabilities: ObjectCapabilities,
    /// True while this object participates in client-side realtime rollback.
    pub realtime_sync_enabled_on_client: bool,
    pub vars: Vec<VarDescriptor>,
    /// Which tick phases the host registered process callbacks for.
    pub process_phases: [bool; PROCESS_PHASE_COUNT],
    /// Objects rewound together with this controller.
    pub dependencies: Vec<ObjectLocalId>,
    /// Scheduled procedures not yet executed.
    pub procedures: Vec<ProcedureRecord>,
    /// Recently executed procedures; keeps late or re-delivered snapshot
    /// overlays from scheduling them twice.
    pub executed_procedures: Vec<ProcedureRecord>,
}

/// Executed-procedure history kept per object.
pub(crate) const EXECUTED_PROCEDURES_HISTORY: usize = 32;

impl ObjectData {
    pub(crate) fn new(
        local_id: ObjectLocalId,
        handle: ObjectHandle,
        path: String,
        capabilities: ObjectCapabilities,
    ) -> Self {
        Self {
            local_id,
            net_id: ObjectNetId::NONE,
            handle,
            path,
            controlled_by_peer: NO_PEER,
            capabilities,
            realtime_sync_enabled_on_client: true,
            vars: Vec::new(),
            process_phases: [false; PROCESS_PHASE_COUNT],
            dependencies: Vec::new(),
            procedures: Vec::new(),
            executed_procedures: Vec::new(),
        }
    }

    /// Records an executed procedure in the bounded history.
    pub fn mark_procedure_executed(&mut self, record: ProcedureRecord) {
        if self.executed_procedures.len() >= EXECUTED_PROCEDURES_HISTORY {
            self.executed_procedures.remove(0);
        }
        self.executed_procedures.push(record);
    }

    pub fn net_id(&self) -> ObjectNetId {
        self.net_id
    }

    pub fn controlled_by_peer(&self) -> PeerId {
        self.controlled_by_peer
    }

    pub fn is_controller(&self) -> bool {
        self.capabilities.controller
    }

    pub fn can_trickled_sync(&self) -> bool {
        self.capabilities.trickled
    }

    pub fn find_variable_id(&self, name: &str) -> VarId {
        self.vars
            .iter()
            .find(|v| v.name == name)
            .map(|v| v.id)
            .unwrap_or(VarId::NONE)
    }

    pub fn has_registered_process_functions(&self) -> bool {
        self.process_phases.iter().any(|p| *p)
    }
}
