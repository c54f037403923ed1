//! The capability interface the host application supplies to the core.
//!
//! The core never holds references into the host: every callback receives an
//! [`ObjectHandle`] and the host resolves it internally. All calls are
//! synchronous and happen on the tick thread.

use crate::buffer::DataBuffer;
use crate::ids::{ObjectHandle, ScheduledProcedureId};
use crate::value::VarValue;

/// Processing phases of one tick. Every object runs a phase before any
/// object enters the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(usize)]
pub enum ProcessPhase {
    Early = 0,
    Pre = 1,
    Process = 2,
    Post = 3,
    Late = 4,
}

pub const PROCESS_PHASE_COUNT: usize = 5;

pub const PROCESS_PHASES: [ProcessPhase; PROCESS_PHASE_COUNT] = [
    ProcessPhase::Early,
    ProcessPhase::Pre,
    ProcessPhase::Process,
    ProcessPhase::Post,
    ProcessPhase::Late,
];

/// Lifecycle phase of a scheduled procedure invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcedurePhase {
    /// Server only, while the procedure is being emitted: the host fills the
    /// argument buffer.
    CollectingArguments,
    /// Client only, when the procedure is first observed in a snapshot.
    Received,
    /// Both sides, when the current frame reaches `execute_at_frame`.
    Executing,
}

/// Host-side capabilities, consumed by the core.
///
/// The variable accessors and `process` are mandatory for any registered
/// object; the controller, trickled and procedure families are only invoked
/// on objects registered with the matching capability.
pub trait HostApp {
    /// Reads a named variable. `None` when the object or variable is gone;
    /// the registry treats that as "no change".
    fn get_variable(&self, handle: ObjectHandle, name: &str) -> Option<VarValue>;

    /// Writes a named variable. Returning `false` signals a type mismatch:
    /// the core skips the assignment and records a de-sync hint so the next
    /// change pull triggers a recovery.
    fn set_variable(&mut self, handle: ObjectHandle, name: &str, value: &VarValue) -> bool;

    /// Runs one registered process phase for the object.
    fn process(&mut self, handle: ObjectHandle, phase: ProcessPhase, delta: f32);

    // -- controller capability --

    /// Gathers the local player's input for this tick into `buffer`.
    fn collect_input(&mut self, handle: ObjectHandle, delta: f32, buffer: &mut DataBuffer) {
        let _ = (handle, delta, buffer);
    }

    /// True when the two encoded inputs differ in a way that matters to the
    /// simulation. Both buffers are positioned at the start of the payload.
    fn are_inputs_different(
        &self,
        handle: ObjectHandle,
        a: &mut DataBuffer,
        b: &mut DataBuffer,
    ) -> bool {
        let _ = (handle, a, b);
        false
    }

    /// Size in bits of one encoded input starting at the buffer's cursor.
    /// Needed to split undelimited records out of a redundant input packet.
    fn count_input_size(&self, handle: ObjectHandle, buffer: &mut DataBuffer) -> usize {
        let _ = (handle, buffer);
        0
    }

    /// Advances the controlled object by one tick using the decoded input.
    fn controller_process(&mut self, handle: ObjectHandle, delta: f32, buffer: &mut DataBuffer) {
        let _ = (handle, delta, buffer);
    }

    // -- trickled capability --

    /// Collects the streamed state of a trickled object. `update_rate` is the
    /// fraction of ticks this object is synced on, usable to tune precision.
    fn trickled_collect(&mut self, handle: ObjectHandle, buffer: &mut DataBuffer, update_rate: f32) {
        let _ = (handle, buffer, update_rate);
    }

    /// Interpolates a trickled object between two received epochs.
    fn trickled_apply(
        &mut self,
        handle: ObjectHandle,
        delta: f32,
        alpha: f32,
        past: &mut DataBuffer,
        future: &mut DataBuffer,
    ) {
        let _ = (handle, delta, alpha, past, future);
    }

    // -- scheduled procedures --

    /// Server-side: fills the argument buffer for a procedure being
    /// scheduled.
    fn collect_procedure_arguments(
        &mut self,
        handle: ObjectHandle,
        procedure: ScheduledProcedureId,
        buffer: &mut DataBuffer,
    ) {
        let _ = (handle, procedure, buffer);
    }

    /// Invoked for `Received` (client, first observation) and `Executing`
    /// (both sides, at the target frame).
    fn execute_procedure(
        &mut self,
        handle: ObjectHandle,
        procedure: ScheduledProcedureId,
        phase: ProcedurePhase,
        arguments: &mut DataBuffer,
    ) {
        let _ = (handle, procedure, phase, arguments);
    }

    // -- lifecycle --

    /// False once the host object died; the registry scrubs the entry on the
    /// next tick.
    fn is_object_alive(&self, handle: ObjectHandle) -> bool {
        let _ = handle;
        true
    }

    /// Resolves an object path from a snapshot to a host object, spawning it
    /// if the host wants to. `None` skips the object.
    fn locate_object(&mut self, path: &str) -> Option<ObjectHandle> {
        let _ = path;
        None
    }
}
