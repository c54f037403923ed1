//! The tick orchestrator tying registry, controllers, groups and snapshots
//! together.
//!
//! One [`SceneSync`] instance runs per process. Its role is decided by the
//! transport: the authoritative server advances every peer's controller and
//! emits snapshots; clients predict their own controller, interpolate
//! everything else and reconcile against inbound snapshots; the offline
//! variant keeps the same object workflow with no network at all.
//!
//! Everything happens inside [`SceneSync::process`], single threaded; all
//! host callbacks are synchronous.

mod client;
mod server;

pub use client::SnapshotQueues;

use std::collections::BTreeMap;

use crate::controller::{NoNetController, Outbox};
use crate::event::{EventProcessor, Processor};
use crate::groups::SyncGroup;
use crate::host::{HostApp, ProcedurePhase, ProcessPhase, PROCESS_PHASES};
use crate::ids::{
    FrameIndex, GlobalFrameIndex, ObjectHandle, ObjectLocalId, ObjectNetId, PeerId,
    ScheduledProcedureId, SchemeId, SyncGroupId, VarId, NO_PEER,
};
use crate::peer::PeerData;
use crate::protocol::{Channel, NetMessage};
use crate::registry::{
    ListenerHandle, NetEventFlag, ObjectCapabilities, ProcedureRecord, Registry,
};
use crate::scheme::SerializationScheme;
use crate::settings::Settings;
use crate::transport::Transport;
use crate::value::VarValue;

/// Payload of the `desync_detected` signal.
#[derive(Debug, Clone)]
pub struct DesyncReport {
    pub input_id: FrameIndex,
    pub objects: Vec<ObjectNetId>,
}

/// Side-band state transitions, exposed as processors so the host can hook
/// tooling without the core knowing about it.
pub struct SyncSignals {
    pub sync_started: Processor<()>,
    pub sync_paused: Processor<()>,
    pub peer_status_updated: Processor<(PeerId, bool)>,
    /// A server snapshot was checked against the local prediction and
    /// matched.
    pub state_validated: Processor<FrameIndex>,
    /// `(frame being re-executed, replay step index)`.
    pub rewind_frame_begin: Processor<(FrameIndex, usize)>,
    pub desync_detected: EventProcessor<DesyncReport>,
}

impl Default for SyncSignals {
    fn default() -> Self {
        Self {
            sync_started: Processor::new(),
            sync_paused: Processor::new(),
            peer_status_updated: Processor::new(),
            state_validated: Processor::new(),
            rewind_frame_begin: Processor::new(),
            desync_detected: EventProcessor::new(),
        }
    }
}

enum Role {
    Server(server::ServerState),
    Client(client::ClientState),
    NoNet(NoNetState),
    /// Transient placeholder while the role is borrowed during a tick.
    Transition,
}

#[derive(Default)]
struct NoNetState {
    controllers: BTreeMap<ObjectLocalId, NoNetController>,
}

pub struct SceneSync<T: Transport> {
    pub settings: Settings,
    pub signals: SyncSignals,
    transport: T,
    registry: Registry,
    peers: BTreeMap<PeerId, PeerData>,
    groups: Vec<SyncGroup>,
    role: Role,
    global_frame: GlobalFrameIndex,
    /// Virtual clock, advanced by the host-provided delta.
    time_ms: f64,
    enabled: bool,
    peers_dirty: bool,
    outbox: Outbox,
}

impl<T: Transport> SceneSync<T> {
    /// Builds the synchronizer; the role follows the transport.
    pub fn new(transport: T, settings: Settings) -> Self {
        let role = if transport.is_server() {
            Role::Server(server::ServerState::new())
        } else {
            Role::Client(client::ClientState::new())
        };
        Self::with_role(transport, settings, role)
    }

    /// Offline variant: no peers, no snapshots, controllers still run.
    pub fn new_offline(transport: T, settings: Settings) -> Self {
        Self::with_role(transport, settings, Role::NoNet(NoNetState::default()))
    }

    fn with_role(transport: T, settings: Settings, role: Role) -> Self {
        let registry = Registry::new(settings.comparison_float_tolerance);
        let mut groups = Vec::new();
        groups.push(SyncGroup::new(SyncGroupId::GLOBAL));
        Self {
            settings,
            signals: SyncSignals::default(),
            transport,
            registry,
            peers: BTreeMap::new(),
            groups,
            role,
            global_frame: GlobalFrameIndex(0),
            time_ms: 0.0,
            enabled: true,
            peers_dirty: true,
            outbox: Outbox::default(),
        }
    }

    pub fn is_server(&self) -> bool {
        matches!(self.role, Role::Server(_))
    }

    pub fn is_client(&self) -> bool {
        matches!(self.role, Role::Client(_))
    }

    pub fn is_no_network(&self) -> bool {
        matches!(self.role, Role::NoNet(_))
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.transport.local_peer_id()
    }

    pub fn global_frame_index(&self) -> GlobalFrameIndex {
        self.global_frame
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    // -- registration surface --

    pub fn register_object(
        &mut self,
        handle: ObjectHandle,
        path: &str,
        capabilities: ObjectCapabilities,
    ) -> ObjectLocalId {
        let local_id = self.registry.register_object(handle, path, capabilities);

        if self.is_server() {
            // The server assigns net ids immediately and networks the object
            // through the global group by default.
            if self.registry.object(local_id).is_some_and(|o| o.net_id().is_none()) {
                let next = match self.registry.biggest_net_id() {
                    id if id.is_none() => ObjectNetId(0),
                    id => ObjectNetId(id.0 + 1),
                };
                self.registry.set_net_id(local_id, next);
            }
            self.groups[SyncGroupId::GLOBAL.index()].add_new_object(local_id, NO_PEER, true);
        }
        local_id
    }

    pub fn unregister_object(&mut self, local_id: ObjectLocalId) {
        for group in &mut self.groups {
            group.remove_object(local_id);
        }
        self.registry.unregister_object(local_id);
        self.peers_dirty = true;
    }

    pub fn register_variable(
        &mut self,
        local_id: ObjectLocalId,
        name: &str,
        default: VarValue,
    ) -> VarId {
        let var_id = self.registry.register_variable(local_id, name, default, false);
        if self.is_server() {
            for group in &mut self.groups {
                group.notify_new_variable(local_id, name);
            }
        }
        var_id
    }

    pub fn unregister_variable(&mut self, local_id: ObjectLocalId, name: &str) {
        self.registry.unregister_variable(local_id, name);
    }

    pub fn set_skip_rewinding(&mut self, local_id: ObjectLocalId, name: &str, skip: bool) {
        self.registry.set_skip_rewinding(local_id, name, skip);
    }

    pub fn track_variable_changes(
        &mut self,
        local_id: ObjectLocalId,
        var_id: VarId,
        mask: NetEventFlag,
        func: Box<dyn FnMut(&[VarValue])>,
    ) -> ListenerHandle {
        self.registry.track_change(local_id, var_id, mask, func)
    }

    pub fn untrack_variable_changes(&mut self, handle: ListenerHandle) {
        self.registry.untrack_change(handle);
    }

    pub fn register_process(&mut self, local_id: ObjectLocalId, phase: ProcessPhase) {
        if let Some(object) = self.registry.object_mut(local_id) {
            object.process_phases[phase as usize] = true;
        }
    }

    pub fn unregister_process(&mut self, local_id: ObjectLocalId, phase: ProcessPhase) {
        if let Some(object) = self.registry.object_mut(local_id) {
            object.process_phases[phase as usize] = false;
        }
    }

    pub fn register_scheme(&mut self, scheme: SerializationScheme) -> SchemeId {
        self.registry.register_scheme(scheme)
    }

    /// Hands control of an object to a peer. On the server this also moves
    /// the object into the peer's association sets and (when the object has
    /// the controller capability) spins up the peer's controller on the next
    /// tick.
    pub fn set_controlled_by(&mut self, local_id: ObjectLocalId, peer: PeerId) {
        self.registry.set_controlled_by(local_id, peer);
        for group in &mut self.groups {
            group.notify_controller_changed(local_id, peer);
        }
        self.peers_dirty = true;
    }

    pub fn controller_add_dependency(&mut self, controller: ObjectLocalId, dep: ObjectLocalId) {
        if let Some(object) = self.registry.object_mut(controller) {
            if !object.dependencies.contains(&dep) {
                object.dependencies.push(dep);
            }
        }
    }

    pub fn controller_remove_dependency(&mut self, controller: ObjectLocalId, dep: ObjectLocalId) {
        if let Some(object) = self.registry.object_mut(controller) {
            object.dependencies.retain(|d| *d != dep);
        }
    }

    // -- sync groups --

    pub fn create_sync_group(&mut self) -> SyncGroupId {
        let id = SyncGroupId(self.groups.len() as u32);
        self.groups.push(SyncGroup::new(id));
        id
    }

    pub fn sync_group(&self, id: SyncGroupId) -> Option<&SyncGroup> {
        self.groups.get(id.index())
    }

    pub fn sync_group_mut(&mut self, id: SyncGroupId) -> Option<&mut SyncGroup> {
        self.groups.get_mut(id.index())
    }

    pub fn group_add_object(
        &mut self,
        group_id: SyncGroupId,
        local_id: ObjectLocalId,
        simulated: bool,
    ) {
        let controlled_by = self
            .registry
            .object(local_id)
            .map(|o| o.controlled_by_peer())
            .unwrap_or(NO_PEER);
        if let Some(group) = self.groups.get_mut(group_id.index()) {
            group.add_new_object(local_id, controlled_by, simulated);
        }
    }

    pub fn group_remove_object(&mut self, group_id: SyncGroupId, local_id: ObjectLocalId) {
        if let Some(group) = self.groups.get_mut(group_id.index()) {
            group.remove_object(local_id);
        }
    }

    /// Moves a peer to another sync group; it will receive a full snapshot
    /// of its new visibility set.
    pub fn move_peer_to_group(&mut self, peer: PeerId, group_id: SyncGroupId) {
        for group in &mut self.groups {
            group.remove_listening_peer(peer);
        }
        if let Some(group) = self.groups.get_mut(group_id.index()) {
            group.add_listening_peer(peer);
        }
        if let Some(data) = self.peers.get_mut(&peer) {
            data.authority.sync_group = group_id;
            data.server.need_full_snapshot = true;
            data.server.force_notify_snapshot = true;
        }
    }

    pub fn set_trickled_update_rate(
        &mut self,
        group_id: SyncGroupId,
        local_id: ObjectLocalId,
        rate: f32,
    ) {
        if let Some(group) = self.groups.get_mut(group_id.index()) {
            group.set_trickled_update_rate(local_id, rate);
        }
    }

    // -- scheduled procedures --

    /// Server-side: schedules a host procedure `delay_frames` ahead on every
    /// peer. Arguments are collected from the host right away.
    pub fn schedule_procedure<A: HostApp>(
        &mut self,
        app: &mut A,
        local_id: ObjectLocalId,
        procedure_id: ScheduledProcedureId,
        delay_frames: u32,
    ) -> GlobalFrameIndex {
        let Some(object) = self.registry.object(local_id) else {
            return GlobalFrameIndex::NONE;
        };
        if procedure_id.index() >= object.capabilities.procedure_count as usize {
            log::warn!("procedure {} is not declared on {}", procedure_id, local_id);
            return GlobalFrameIndex::NONE;
        }
        let handle = object.handle;

        let mut arguments = crate::buffer::DataBuffer::new();
        arguments.begin_write(0);
        app.collect_procedure_arguments(handle, procedure_id, &mut arguments);
        arguments.dry();

        let execute_at_frame = GlobalFrameIndex(self.global_frame.0 + delay_frames);
        if let Some(object) = self.registry.object_mut(local_id) {
            object.procedures.push(ProcedureRecord {
                procedure_id,
                execute_at_frame,
                arguments: arguments.to_byte_vec(),
            });
        }
        for group in &mut self.groups {
            group.notify_procedures_changed(local_id);
        }
        execute_at_frame
    }

    // -- peers & enabling --

    pub fn peer(&self, peer: PeerId) -> Option<&PeerData> {
        self.peers.get(&peer)
    }

    pub fn peer_mut(&mut self, peer: PeerId) -> Option<&mut PeerData> {
        self.peers.get_mut(&peer)
    }

    /// Feeds a transport-measured round-trip time into the peer bookkeeping;
    /// the value is compressed and redistributed via snapshots.
    pub fn set_peer_latency(&mut self, peer: PeerId, ms: f32) {
        if let Some(data) = self.peers.get_mut(&peer) {
            data.set_latency(ms);
            for group in &mut self.groups {
                if group.listening_peers().contains(&peer) {
                    group.notify_peer_has_newly_calculated_latency(peer);
                }
            }
        }
    }

    /// This process's own latency as last reported by the server (client
    /// side) or measured for a peer (server side).
    pub fn local_latency_ms(&self) -> f32 {
        match &self.role {
            Role::Client(state) => state.latency_ms(),
            _ => 0.0,
        }
    }

    pub fn force_state_notify(&mut self, group_id: SyncGroupId) {
        if let Some(group) = self.groups.get(group_id.index()) {
            for peer in group.listening_peers().to_vec() {
                if let Some(data) = self.peers.get_mut(&peer) {
                    data.server.force_notify_snapshot = true;
                }
            }
        }
    }

    pub fn force_full_snapshot(&mut self, peer: PeerId) {
        if let Some(data) = self.peers.get_mut(&peer) {
            data.server.force_notify_snapshot = true;
            data.server.need_full_snapshot = true;
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        if enabled {
            self.signals.sync_started.broadcast(&());
        } else {
            self.signals.sync_paused.broadcast(&());
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Server-side: (de)activates networking for one peer and notifies it.
    /// Disabling also pauses the peer's doll streams on everyone else, so
    /// late epochs are discarded until the controller resumes.
    pub fn set_peer_networking_enable(&mut self, peer: PeerId, enabled: bool) {
        let Some(data) = self.peers.get_mut(&peer) else {
            return;
        };
        if data.authority.enabled == enabled {
            return;
        }
        data.authority.enabled = enabled;
        data.server.need_full_snapshot = enabled;
        data.server.force_notify_snapshot = enabled;
        let mut paused_epoch = None;
        if let Some(controller) = data.controller.as_mut() {
            if let Some(sc) = controller.as_server() {
                sc.set_enabled(enabled);
                if !enabled {
                    paused_epoch = Some(sc.epoch);
                }
            }
        }

        if let Some(epoch) = paused_epoch {
            let net_id = self
                .registry
                .controller_of_peer(peer)
                .and_then(|local| self.registry.object(local))
                .map(|o| o.net_id())
                .filter(|id| !id.is_none());
            if let Some(net_id) = net_id {
                let others: Vec<PeerId> =
                    self.peers.keys().copied().filter(|p| *p != peer).collect();
                for other in others {
                    self.outbox.send(
                        other,
                        Channel::Reliable,
                        NetMessage::DollSyncPaused {
                            net_id: net_id.0,
                            epoch,
                        },
                    );
                }
            }
        }

        self.outbox
            .send(peer, Channel::Reliable, NetMessage::NotifyPeerStatus { enabled });
        self.signals.peer_status_updated.broadcast(&(peer, enabled));
    }

    /// Client-side: asks the server to (de)activate this process.
    pub fn request_network_enabled(&mut self, enabled: bool) {
        self.outbox.send(
            crate::ids::SERVER_PEER,
            Channel::Reliable,
            NetMessage::SetNetworkEnabled { enabled },
        );
    }

    /// Marks the peer set changed; association and controllers are rebuilt
    /// at the start of the next tick.
    pub fn dirty_peers(&mut self) {
        self.peers_dirty = true;
    }

    // -- the tick --

    /// Advances the whole synchronizer by exactly one tick.
    pub fn process<A: HostApp>(&mut self, app: &mut A, delta: f32) {
        self.time_ms += delta as f64 * 1000.0;

        let mut role = std::mem::replace(&mut self.role, Role::Transition);
        match &mut role {
            Role::Server(state) => self.server_tick(app, state, delta),
            Role::Client(state) => self.client_tick(app, state, delta),
            Role::NoNet(state) => self.nonet_tick(app, state, delta),
            Role::Transition => unreachable!("the role is only detached inside process"),
        }
        self.role = role;

        self.flush_outbox();
        self.global_frame.advance();
    }

    fn nonet_tick<A: HostApp>(&mut self, app: &mut A, state: &mut NoNetState, delta: f32) {
        if !self.enabled {
            return;
        }

        self.registry.scrub_dead_objects(app);
        self.run_phases(app, delta);

        for local_id in self.registry.local_ids() {
            let Some(object) = self.registry.object(local_id) else {
                continue;
            };
            if !object.is_controller() {
                continue;
            }
            let handle = object.handle;
            state
                .controllers
                .entry(local_id)
                .or_insert_with(NoNetController::new)
                .process(app, handle, delta);
        }

        self.execute_due_procedures(app, self.global_frame);

        self.registry.change_events_begin(NetEventFlag::CHANGE);
        for local_id in self.registry.local_ids() {
            self.registry.pull_changes(app, local_id);
        }
        self.registry.change_events_flush();
        self.registry.take_notifications();
    }

    /// Runs every registered phase callback, all objects per phase before
    /// the next phase starts.
    pub(crate) fn run_phases<A: HostApp>(&mut self, app: &mut A, delta: f32) {
        let locals = self.registry.local_ids();
        for phase in PROCESS_PHASES {
            for local_id in &locals {
                let Some(object) = self.registry.object(*local_id) else {
                    continue;
                };
                if object.process_phases[phase as usize] {
                    app.process(object.handle, phase, delta);
                }
            }
        }
    }

    /// Executes every pending procedure whose frame came due.
    pub(crate) fn execute_due_procedures<A: HostApp>(
        &mut self,
        app: &mut A,
        current_frame: GlobalFrameIndex,
    ) {
        if current_frame.is_none() {
            return;
        }
        for local_id in self.registry.local_ids() {
            let Some(object) = self.registry.object(local_id) else {
                continue;
            };
            let handle = object.handle;
            let due: Vec<ProcedureRecord> = object
                .procedures
                .iter()
                .filter(|p| p.execute_at_frame.0 <= current_frame.0)
                .cloned()
                .collect();
            if due.is_empty() {
                continue;
            }

            for procedure in &due {
                let mut arguments = procedure.arguments_buffer();
                arguments.begin_read();
                app.execute_procedure(
                    handle,
                    procedure.procedure_id,
                    ProcedurePhase::Executing,
                    &mut arguments,
                );
            }
            if let Some(object) = self.registry.object_mut(local_id) {
                object
                    .procedures
                    .retain(|p| p.execute_at_frame.0 > current_frame.0);
                for procedure in due {
                    object.mark_procedure_executed(procedure);
                }
            }
            // The emptied list must reach the clients, or a late overlay
            // would re-schedule what just ran.
            for group in &mut self.groups {
                group.notify_procedures_changed(local_id);
            }
        }
    }

    pub(crate) fn flush_outbox(&mut self) {
        for (peer, channel, message) in self.outbox.drain() {
            self.transport.send(peer, channel, message);
        }
    }

    pub(crate) fn drain_messages(&mut self) -> Vec<(PeerId, NetMessage)> {
        let mut messages = Vec::new();
        while let Some(entry) = self.transport.poll() {
            messages.push(entry);
        }
        messages
    }

    /// Clones the input codec registered for an object's controller, if any.
    pub(crate) fn input_scheme_of(&self, local_id: ObjectLocalId) -> Option<SerializationScheme> {
        let object = self.registry.object(local_id)?;
        let scheme_id = object.capabilities.input_scheme?;
        self.registry.scheme(scheme_id).cloned()
    }

    /// Dispatches change notifications gathered during a flush: on the
    /// server they feed sync-group change tracking, on the client the
    /// end-sync bookkeeping.
    pub(crate) fn route_notifications_to_groups(&mut self) {
        for notification in self.registry.take_notifications() {
            let Some(object) = self.registry.object(notification.object) else {
                continue;
            };
            let Some(var) = object.vars.get(notification.var.index()) else {
                continue;
            };
            let name = var.name.clone();
            let local_id = notification.object;
            for group in &mut self.groups {
                group.notify_variable_changed(local_id, &name);
            }
        }
    }
}

// Role-specific ticks live next to their state types.
impl<T: Transport> SceneSync<T> {
    fn server_tick<A: HostApp>(
        &mut self,
        app: &mut A,
        state: &mut server::ServerState,
        delta: f32,
    ) {
        server::tick(self, state, app, delta);
    }

    fn client_tick<A: HostApp>(
        &mut self,
        app: &mut A,
        state: &mut client::ClientState,
        delta: f32,
    ) {
        client::tick(self, state, app, delta);
    }
}

/// Test-only introspection used by the integration suites.
impl<T: Transport> SceneSync<T> {
    pub fn peers(&self) -> impl Iterator<Item = (&PeerId, &PeerData)> {
        self.peers.iter()
    }

    pub fn client_queues(&self) -> Option<SnapshotQueues<'_>> {
        match &self.role {
            Role::Client(state) => Some(state.queues()),
            _ => None,
        }
    }

    pub fn controller_frame_of(&self, peer: PeerId) -> FrameIndex {
        self.peers
            .get(&peer)
            .and_then(|p| p.controller.as_ref())
            .map(|c| c.current_frame_index())
            .unwrap_or(FrameIndex::NONE)
    }
}
