//! Client tick: prediction, reconciliation, rewind and interpolation.

use std::collections::VecDeque;

use crate::buffer::{CompressionLevel, DataBuffer};
use crate::controller::{Controller, DollController, EpochStream, PlayerController};
use crate::host::{HostApp, ProcedurePhase, PROCESS_PHASES};
use crate::ids::{
    FrameIndex, GlobalFrameIndex, ObjectLocalId, ObjectNetId, PeerId, VarId, NO_PEER, SERVER_PEER,
};
use crate::protocol::{Channel, NetMessage};
use crate::registry::NetEventFlag;
use crate::snapshot::{compare_snapshots, decode_snapshot, Snapshot};
use crate::transport::Transport;
use crate::value::VarValue;

use super::{DesyncReport, SceneSync};

pub(crate) struct ClientState {
    last_received_snapshot: Snapshot,
    server_snapshots: VecDeque<Snapshot>,
    client_snapshots: VecDeque<Snapshot>,
    last_checked_input: FrameIndex,
    need_full_snapshot_notified: bool,
    /// Server frame estimate: re-anchored by snapshots, advanced per
    /// prediction sub-tick. Drives client-side procedure execution.
    estimated_global_frame: GlobalFrameIndex,
    latency: u8,
    /// Whether the server currently networks this peer.
    net_enabled: bool,
    /// The local controller runs server-side; we render it as a doll.
    server_controlled: bool,
    trickled: Vec<(ObjectNetId, EpochStream)>,
    /// `(object, var, pre-sync value)`; flushed as END_SYNC after recovery.
    end_sync_events: Vec<(ObjectLocalId, VarId, VarValue)>,
}

/// Read-only view over the reconciliation queues, for tests and tooling.
pub struct SnapshotQueues<'a> {
    pub server: &'a VecDeque<Snapshot>,
    pub client: &'a VecDeque<Snapshot>,
    pub last_checked_input: FrameIndex,
}

impl ClientState {
    pub(crate) fn new() -> Self {
        Self {
            last_received_snapshot: Snapshot::default(),
            server_snapshots: VecDeque::new(),
            client_snapshots: VecDeque::new(),
            last_checked_input: FrameIndex::NONE,
            need_full_snapshot_notified: false,
            estimated_global_frame: GlobalFrameIndex::NONE,
            latency: 0,
            net_enabled: true,
            server_controlled: false,
            trickled: Vec::new(),
            end_sync_events: Vec::new(),
        }
    }

    pub(crate) fn latency_ms(&self) -> f32 {
        self.latency as f32 * 4.0
    }

    pub(crate) fn queues(&self) -> SnapshotQueues<'_> {
        SnapshotQueues {
            server: &self.server_snapshots,
            client: &self.client_snapshots,
            last_checked_input: self.last_checked_input,
        }
    }

    fn push_end_sync(&mut self, local_id: ObjectLocalId, var: VarId, old: VarValue) {
        if !self
            .end_sync_events
            .iter()
            .any(|(l, v, _)| *l == local_id && *v == var)
        {
            self.end_sync_events.push((local_id, var, old));
        }
    }
}

pub(crate) fn tick<A: HostApp, T: Transport>(
    sync: &mut SceneSync<T>,
    state: &mut ClientState,
    app: &mut A,
    delta: f32,
) {
    dispatch_messages(sync, state, app, delta);
    ensure_controllers(sync, state);

    if !sync.enabled || !state.net_enabled {
        return;
    }

    sync.registry.scrub_dead_objects(app);

    let local_peer = sync.transport.local_peer_id();
    let iterations_per_sec = 1.0 / delta.max(1.0e-6);

    // -- prediction sub-ticks --

    let mut player = take_player(sync, local_peer);
    if player.is_none() {
        // Observer client: the phase loop still runs once per tick.
        sync.run_phases(app, delta);
    }
    if let Some((ctrl_local, controller)) = player.as_mut() {
        let handle = sync.registry.object(*ctrl_local).map(|o| o.handle);
        let scheme = sync.input_scheme_of(*ctrl_local);
        controller.has_new_input = false;

        if let Some(handle) = handle {
            // Due to lag we may want to speed up input generation; time is
            // only pretended to run faster, each sub-tick still uses the
            // nominal delta.
            let sub_ticks = controller.calculates_sub_ticks(delta, iterations_per_sec);

            for _ in 0..sub_ticks {
                sync.run_phases(app, delta);

                let settings = sync.settings.clone();
                let mut outbox = std::mem::take(&mut sync.outbox);
                controller.process(app, handle, scheme.as_ref(), &settings, delta, &mut outbox);
                sync.outbox = outbox;

                if !state.estimated_global_frame.is_none() {
                    state.estimated_global_frame.advance();
                    sync.execute_due_procedures(app, state.estimated_global_frame);
                }

                sync.registry.change_events_begin(NetEventFlag::CHANGE);
                for local_id in sync.registry.local_ids() {
                    sync.registry.pull_changes(app, local_id);
                }
                sync.registry.change_events_flush();
                sync.registry.take_notifications();

                if controller.has_new_input {
                    store_client_snapshot(sync, state, controller, local_peer);
                }
            }
        }
    }
    restore_player(sync, local_peer, player);

    // -- dolls & trickled interpolation --

    process_dolls(sync, app, delta, local_peer);
    process_trickled(sync, state, app, delta);

    // -- reconciliation --

    process_recovery(sync, state, app, delta, local_peer);

    // -- end-sync events --

    if !state.end_sync_events.is_empty() {
        let tolerance = sync.registry.comparison_tolerance();
        sync.registry.change_events_begin(NetEventFlag::END_SYNC);
        for (local_id, var, old) in std::mem::take(&mut state.end_sync_events) {
            let current = sync
                .registry
                .object(local_id)
                .and_then(|o| o.vars.get(var.index()))
                .map(|v| v.value.clone());
            if let Some(current) = current {
                if !current.compare(&old, tolerance) {
                    sync.registry.change_event_add(local_id, var, old);
                }
            }
        }
        sync.registry.change_events_flush();
        sync.registry.take_notifications();
    }
}

fn take_player<T: Transport>(
    sync: &mut SceneSync<T>,
    local_peer: PeerId,
) -> Option<(ObjectLocalId, PlayerController)> {
    let ctrl_local = sync.registry.controller_of_peer(local_peer)?;
    let data = sync.peers.get_mut(&local_peer)?;
    match data.controller.take() {
        Some(Controller::Player(player)) => Some((ctrl_local, player)),
        other => {
            data.controller = other;
            None
        }
    }
}

fn restore_player<T: Transport>(
    sync: &mut SceneSync<T>,
    local_peer: PeerId,
    player: Option<(ObjectLocalId, PlayerController)>,
) {
    if let Some((_, controller)) = player {
        if let Some(data) = sync.peers.get_mut(&local_peer) {
            data.controller = Some(Controller::Player(controller));
        }
    }
}

fn dispatch_messages<A: HostApp, T: Transport>(
    sync: &mut SceneSync<T>,
    state: &mut ClientState,
    app: &mut A,
    delta: f32,
) {
    let now_ms = sync.time_ms;
    let iterations_per_sec = 1.0 / delta.max(1.0e-6);

    for (from, message) in sync.drain_messages() {
        if from != SERVER_PEER {
            log::warn!("client received a message from non-server peer {}; dropped", from);
            continue;
        }
        match message {
            NetMessage::State { data } => {
                receive_snapshot(sync, state, app, &data);
            }
            NetMessage::NotifyFpsAcceleration { speed } => {
                let local_peer = sync.transport.local_peer_id();
                if let Some(player) = sync
                    .peers
                    .get_mut(&local_peer)
                    .and_then(|d| d.controller.as_mut())
                    .and_then(|c| c.as_player())
                {
                    player.receive_tick_speed(speed);
                }
            }
            NetMessage::SetServerControlled { enabled } => {
                state.server_controlled = enabled;
                let local_peer = sync.transport.local_peer_id();
                if let Some(data) = sync.peers.get_mut(&local_peer) {
                    // The controller flavor is rebuilt on the next tick.
                    data.controller = None;
                }
                state.server_snapshots.clear();
                state.client_snapshots.clear();
            }
            NetMessage::NotifyPeerStatus { enabled } => {
                let was = state.net_enabled;
                state.net_enabled = enabled;
                let local_peer = sync.transport.local_peer_id();
                sync.signals.peer_status_updated.broadcast(&(local_peer, enabled));
                if was != enabled {
                    if enabled {
                        sync.signals.sync_started.broadcast(&());
                    } else {
                        sync.signals.sync_paused.broadcast(&());
                        state.server_snapshots.clear();
                        state.client_snapshots.clear();
                    }
                }
            }
            NetMessage::TrickledSyncData { data } => {
                receive_trickled_batch(sync, state, app, data, now_ms, iterations_per_sec);
            }
            NetMessage::DollSyncPaused { net_id, epoch } => {
                pause_doll(sync, ObjectNetId(net_id), epoch);
            }
            other => {
                log::warn!("unexpected message on the client: {:?}", other);
            }
        }
    }
}

/// Creates the local player controller and one doll controller per remote
/// peer that controls an object, as learned from snapshots.
fn ensure_controllers<T: Transport>(sync: &mut SceneSync<T>, state: &ClientState) {
    let local_peer = sync.transport.local_peer_id();
    let owners: Vec<(ObjectLocalId, PeerId)> = sync
        .registry
        .iter()
        .filter(|o| o.is_controller() && o.controlled_by_peer() != NO_PEER)
        .map(|o| (o.local_id, o.controlled_by_peer()))
        .collect();

    for (_, owner) in owners {
        let wants_player = owner == local_peer && !state.server_controlled;
        let data = sync.peers.entry(owner).or_default();

        let matches = match (&data.controller, wants_player) {
            (Some(Controller::Player(_)), true) => true,
            (Some(Controller::Doll(_)), false) => true,
            _ => false,
        };
        if !matches {
            data.controller = Some(if wants_player {
                Controller::Player(PlayerController::new())
            } else {
                Controller::Doll(DollController::new(
                    sync.settings.doll_connection_stats_frame_span,
                ))
            });
        }
    }
}

fn receive_snapshot<A: HostApp, T: Transport>(
    sync: &mut SceneSync<T>,
    state: &mut ClientState,
    app: &mut A,
    data: &[u8],
) {
    let outcome = match decode_snapshot(app, &mut sync.registry, &state.last_received_snapshot, data)
    {
        Ok(outcome) => outcome,
        Err(err) => {
            log::warn!("malformed snapshot: {}; requesting a full state", err);
            request_full_snapshot(sync, state);
            return;
        }
    };

    if outcome.needs_full_snapshot {
        request_full_snapshot(sync, state);
    } else {
        state.need_full_snapshot_notified = false;
    }

    let snapshot = outcome.snapshot;
    if let Some(latency) = snapshot.latency {
        state.latency = latency;
    }
    if state.estimated_global_frame.is_none()
        || state.estimated_global_frame < snapshot.global_frame_index
    {
        state.estimated_global_frame = snapshot.global_frame_index;
    }

    notify_received_procedures(sync, app, &snapshot);
    state.last_received_snapshot = snapshot.clone();

    // Queue it for reconciliation, ordered by input id.
    let has_player = sync
        .registry
        .controller_of_peer(sync.transport.local_peer_id())
        .is_some()
        && !state.server_controlled;

    if snapshot.input_id.is_none() {
        if has_player {
            // No info for the local controller; useless for rollback.
            return;
        }
        state.server_snapshots.clear();
        state.server_snapshots.push_back(snapshot);
        return;
    }

    if let Some(back) = state.server_snapshots.back_mut() {
        if back.input_id == snapshot.input_id {
            // Same confirmed input arriving twice: the newer body wins.
            log::debug!("snapshot for input {} overwritten by a newer body", back.input_id);
            *back = snapshot;
            return;
        }
        if snapshot.input_id < back.input_id {
            log::warn!(
                "snapshot {} older than the last stored {}; dropped",
                snapshot.input_id,
                back.input_id
            );
            return;
        }
    }
    if !state.last_checked_input.is_none() && snapshot.input_id <= state.last_checked_input {
        // Already reconciled past this point.
        return;
    }
    state.server_snapshots.push_back(snapshot);
}

fn request_full_snapshot<T: Transport>(sync: &mut SceneSync<T>, state: &mut ClientState) {
    if state.need_full_snapshot_notified {
        return;
    }
    state.need_full_snapshot_notified = true;
    sync.outbox.send(
        SERVER_PEER,
        Channel::Reliable,
        NetMessage::NotifyNeedFullSnapshot,
    );
}

/// Surfaces procedures seen for the first time (phase `Received`) and
/// stores them on the registry objects so snapshots and execution see them.
fn notify_received_procedures<A: HostApp, T: Transport>(
    sync: &mut SceneSync<T>,
    app: &mut A,
    snapshot: &Snapshot,
) {
    for (index, object_snapshot) in snapshot.objects.iter().enumerate() {
        if object_snapshot.procedures.is_empty() {
            continue;
        }
        let net_id = ObjectNetId(index as u16);
        let Some(local_id) = sync.registry.local_of_net(net_id) else {
            continue;
        };
        let Some(object) = sync.registry.object(local_id) else {
            continue;
        };
        let handle = object.handle;

        let fresh: Vec<_> = object_snapshot
            .procedures
            .iter()
            .filter(|p| !object.procedures.contains(p) && !object.executed_procedures.contains(p))
            .cloned()
            .collect();
        if fresh.is_empty() {
            continue;
        }

        for procedure in &fresh {
            let mut arguments = procedure.arguments_buffer();
            arguments.begin_read();
            app.execute_procedure(
                handle,
                procedure.procedure_id,
                ProcedurePhase::Received,
                &mut arguments,
            );
        }
        if let Some(object) = sync.registry.object_mut(local_id) {
            for procedure in fresh {
                object.procedures.push(procedure);
            }
        }
    }
}

fn receive_trickled_batch<A: HostApp, T: Transport>(
    sync: &mut SceneSync<T>,
    state: &mut ClientState,
    app: &mut A,
    data: Vec<u8>,
    now_ms: f64,
    iterations_per_sec: f32,
) {
    let local_peer = sync.transport.local_peer_id();
    let mut db = DataBuffer::from_bytes(data);
    db.begin_read();

    loop {
        if db.bit_offset() + 16 > db.total_bits() {
            break;
        }
        let net_id = ObjectNetId(db.read_uint(CompressionLevel::L2) as u16);
        let blob = db.read_bytes();
        if db.is_overflowed() {
            break;
        }

        let Some(local_id) = sync.registry.local_of_net(net_id) else {
            log::debug!("trickled data for unknown object {}; dropped", net_id);
            continue;
        };
        let Some(object) = sync.registry.object(local_id) else {
            continue;
        };
        let handle = object.handle;
        let owner = object.controlled_by_peer();

        if owner != NO_PEER && owner != local_peer {
            // Epoch stream of a doll-controlled object.
            let settings = sync.settings.clone();
            if let Some(doll) = sync
                .peers
                .entry(owner)
                .or_default()
                .controller
                .get_or_insert_with(|| {
                    Controller::Doll(DollController::new(settings.doll_connection_stats_frame_span))
                })
                .as_doll()
            {
                doll.receive_epoch(app, handle, &settings, blob, now_ms, iterations_per_sec);
            }
        } else {
            let settings = sync.settings.clone();
            let index = match state.trickled.iter().position(|(id, _)| *id == net_id) {
                Some(index) => index,
                None => {
                    state.trickled.push((
                        net_id,
                        EpochStream::new(settings.doll_connection_stats_frame_span),
                    ));
                    state.trickled.len() - 1
                }
            };
            state.trickled[index].1.receive(
                app,
                handle,
                &settings,
                blob,
                now_ms,
                iterations_per_sec,
                0,
            );
        }
    }
}

fn pause_doll<T: Transport>(sync: &mut SceneSync<T>, net_id: ObjectNetId, epoch: u32) {
    let Some(owner) = sync
        .registry
        .object_by_net(net_id)
        .map(|o| o.controlled_by_peer())
    else {
        return;
    };
    let settings = sync.settings.clone();
    if let Some(doll) = sync
        .peers
        .get_mut(&owner)
        .and_then(|d| d.controller.as_mut())
        .and_then(|c| c.as_doll())
    {
        doll.pause(epoch, &settings);
    }
}

fn process_dolls<A: HostApp, T: Transport>(
    sync: &mut SceneSync<T>,
    app: &mut A,
    delta: f32,
    local_peer: PeerId,
) {
    let owners: Vec<(PeerId, ObjectLocalId)> = sync
        .registry
        .iter()
        .filter(|o| {
            o.is_controller()
                && o.controlled_by_peer() != NO_PEER
                && o.controlled_by_peer() != local_peer
        })
        .map(|o| (o.controlled_by_peer(), o.local_id))
        .collect();

    for (owner, ctrl_local) in owners {
        let Some(handle) = sync.registry.object(ctrl_local).map(|o| o.handle) else {
            continue;
        };
        let settings = sync.settings.clone();
        if let Some(mut controller) = sync.peers.get_mut(&owner).and_then(|d| d.controller.take()) {
            if let Controller::Doll(doll) = &mut controller {
                doll.process(app, handle, &settings, delta);
            }
            if let Some(data) = sync.peers.get_mut(&owner) {
                data.controller = Some(controller);
            }
        }
    }
}

fn process_trickled<A: HostApp, T: Transport>(
    sync: &mut SceneSync<T>,
    state: &mut ClientState,
    app: &mut A,
    delta: f32,
) {
    let settings = sync.settings.clone();
    for (net_id, stream) in &mut state.trickled {
        let Some(object) = sync.registry.object_by_net(*net_id) else {
            continue;
        };
        stream.advance(app, object.handle, &settings, delta);
    }
}

/// Captures the predicted world right after a new input was produced.
fn store_client_snapshot<T: Transport>(
    sync: &mut SceneSync<T>,
    state: &mut ClientState,
    player: &PlayerController,
    local_peer: PeerId,
) {
    debug_assert!(
        state
            .client_snapshots
            .back()
            .is_none_or(|s| s.input_id < player.current_input_id),
        "client snapshots must be stored in input order"
    );

    let mut snapshot = Snapshot {
        input_id: player.current_input_id,
        global_frame_index: GlobalFrameIndex::NONE,
        simulated_objects: state.last_received_snapshot.simulated_objects.clone(),
        ..Default::default()
    };

    for object in sync.registry.iter() {
        let net_id = object.net_id();
        if net_id.is_none() {
            continue;
        }
        let owner = object.controlled_by_peer();
        if owner != NO_PEER && owner != local_peer {
            // Dolls are not part of the local prediction.
            continue;
        }

        let slot = snapshot.object_mut_padded(net_id);
        slot.vars = object
            .vars
            .iter()
            .map(|v| v.enabled.then(|| v.value.clone()))
            .collect();
        slot.procedures = object.procedures.clone();
    }

    state.client_snapshots.push_back(snapshot);
}

// -- reconciliation --

fn process_recovery<A: HostApp, T: Transport>(
    sync: &mut SceneSync<T>,
    state: &mut ClientState,
    app: &mut A,
    delta: f32,
    local_peer: PeerId,
) {
    if state.server_snapshots.is_empty() {
        return;
    }

    if state.server_snapshots.back().unwrap().input_id.is_none() {
        // Snapshot-only client: overwrite from the newest state.
        let snapshot = state.server_snapshots.back().unwrap().clone();
        apply_snapshot(sync, state, app, &snapshot, NetEventFlag::SERVER_UPDATE, true);
        state.server_snapshots.clear();
        state.client_snapshots.clear();
        return;
    }

    if state.client_snapshots.is_empty() {
        process_paused_controller_recovery(sync, state, app);
        return;
    }

    // Newest server snapshot that also exists client-side.
    let mut checkable = FrameIndex::NONE;
    for server_snapshot in state.server_snapshots.iter().rev() {
        if state
            .client_snapshots
            .iter()
            .any(|c| c.input_id == server_snapshot.input_id)
        {
            checkable = server_snapshot.input_id;
            break;
        }
    }
    if checkable.is_none() {
        return;
    }

    while state
        .server_snapshots
        .front()
        .is_some_and(|s| s.input_id < checkable)
    {
        state.server_snapshots.pop_front();
    }
    while state
        .client_snapshots
        .front()
        .is_some_and(|s| s.input_id < checkable)
    {
        state.client_snapshots.pop_front();
    }

    let server_snapshot = state.server_snapshots.front().unwrap().clone();
    let client_snapshot = state.client_snapshots.pop_front().unwrap();

    let report = compare_snapshots(
        &sync.registry,
        &server_snapshot,
        &client_snapshot,
        local_peer,
        sync.registry.comparison_tolerance(),
    );

    if !report.equal {
        sync.signals.desync_detected.broadcast(&DesyncReport {
            input_id: checkable,
            objects: report.different_objects.clone(),
        });
        rewind_and_replay(sync, state, app, delta, local_peer, checkable, &server_snapshot, &report);
    } else {
        apply_no_rewind(sync, state, app, &report.no_rewind_recover);
        if let Some((ctrl_local, mut controller)) = take_player(sync, local_peer) {
            controller.notify_input_checked(checkable);
            restore_player(sync, local_peer, Some((ctrl_local, controller)));
        }
        sync.signals.state_validated.broadcast(&checkable);
    }

    state.server_snapshots.pop_front();
    state.last_checked_input = checkable;
}

fn rewind_and_replay<A: HostApp, T: Transport>(
    sync: &mut SceneSync<T>,
    state: &mut ClientState,
    app: &mut A,
    delta: f32,
    local_peer: PeerId,
    checkable: FrameIndex,
    server_snapshot: &Snapshot,
    report: &crate::snapshot::ComparisonReport,
) {
    // -- build the rewind set --

    let mut recover_controller = false;
    let mut rewind_set: Vec<ObjectLocalId> = Vec::new();
    let controller_local = sync.registry.controller_of_peer(local_peer);
    let dependencies: Vec<ObjectLocalId> = controller_local
        .and_then(|c| sync.registry.object(c))
        .map(|o| o.dependencies.clone())
        .unwrap_or_default();

    for net_id in &report.different_objects {
        let Some(local_id) = sync.registry.local_of_net(*net_id) else {
            continue;
        };
        let Some(object) = sync.registry.object(local_id) else {
            continue;
        };
        let controller_related = object.controlled_by_peer() == local_peer
            || dependencies.contains(&local_id);
        if controller_related {
            recover_controller = true;
        } else if !rewind_set.contains(&local_id) {
            rewind_set.push(local_id);
        }
    }

    // No-rewind differences are restored together with the rest once a
    // rewind happens anyway.
    for reference in &report.no_rewind_recover.simulated_objects {
        if let Some(local_id) = sync.registry.local_of_net(reference.net_id) {
            if !rewind_set.contains(&local_id) {
                rewind_set.push(local_id);
            }
        }
    }

    if recover_controller {
        // The whole controller bundle rewinds together, no matter where the
        // difference was found.
        for local_id in sync.registry.objects_of_peer(local_peer) {
            if !rewind_set.contains(&local_id) {
                rewind_set.push(local_id);
            }
        }
        for local_id in dependencies {
            if !rewind_set.contains(&local_id) {
                rewind_set.push(local_id);
            }
        }
    }

    // -- phase 1: reset to the authoritative state --

    sync.registry
        .change_events_begin(NetEventFlag::SERVER_UPDATE | NetEventFlag::SYNC_RESET);
    for local_id in &rewind_set {
        apply_object_values(sync, app, server_snapshot, *local_id, false);
        apply_object_procedures(sync, &report.no_rewind_recover, *local_id);
    }
    sync.registry.change_events_flush();
    collect_end_sync(sync, state);

    // -- phase 2: replay the stored inputs --

    let mut player = take_player(sync, local_peer);
    let remaining = match player.as_mut() {
        Some((_, controller)) => controller.notify_input_checked(checkable),
        None => 0,
    };

    if recover_controller && remaining != state.client_snapshots.len() {
        // The input FIFO no longer covers the frames that must be replayed.
        // Give up on prediction: accept the server state wholesale and
        // pause until the next confirmed tick.
        log::warn!(
            "rewind depth exceeded at {} ({} inputs vs {} snapshots); accepting the server state",
            checkable,
            remaining,
            state.client_snapshots.len()
        );
        if let Some((_, controller)) = player.as_mut() {
            controller.hard_reset();
        }
        restore_player(sync, local_peer, player);

        apply_snapshot(sync, state, app, server_snapshot, NetEventFlag::SERVER_UPDATE | NetEventFlag::SYNC_RESET, false);
        state.client_snapshots.clear();
        state.server_snapshots.clear();
        return;
    }

    let replay_count = state.client_snapshots.len();
    for i in 0..replay_count {
        let frame = FrameIndex(checkable.0 + 1 + i as u32);
        sync.signals.rewind_frame_begin.broadcast(&(frame, i));

        sync.registry
            .change_events_begin(NetEventFlag::SERVER_UPDATE | NetEventFlag::SYNC_REWIND);

        // Step 1: per-phase processing of the rewound objects.
        for phase in PROCESS_PHASES {
            for local_id in &rewind_set {
                let Some(object) = sync.registry.object(*local_id) else {
                    continue;
                };
                if object.process_phases[phase as usize] {
                    app.process(object.handle, phase, delta);
                }
            }
        }

        // Step 2: re-run the stored input through the controller.
        if recover_controller {
            if let Some((ctrl_local, controller)) = player.as_mut() {
                if let Some(handle) = sync.registry.object(*ctrl_local).map(|o| o.handle) {
                    controller.process_instant(app, handle, i, delta);
                }
            }
        }

        // Step 3: pull the changes and refresh the client-side snapshot so
        // future comparisons run against the corrected prediction.
        for local_id in &rewind_set {
            sync.registry.pull_changes(app, *local_id);
        }
        let snapshot = &mut state.client_snapshots[i];
        for local_id in &rewind_set {
            let Some(object) = sync.registry.object(*local_id) else {
                continue;
            };
            if object.net_id().is_none() {
                continue;
            }
            let slot = snapshot.object_mut_padded(object.net_id());
            slot.vars = object
                .vars
                .iter()
                .map(|v| v.enabled.then(|| v.value.clone()))
                .collect();
            slot.procedures = object.procedures.clone();
        }

        sync.registry.change_events_flush();
        collect_end_sync(sync, state);
    }

    restore_player(sync, local_peer, player);
}

/// Applies the no-rewind overlay directly to the live state, then patches
/// the newest client snapshot so the fix isn't re-detected next frame.
fn apply_no_rewind<A: HostApp, T: Transport>(
    sync: &mut SceneSync<T>,
    state: &mut ClientState,
    app: &mut A,
    overlay: &Snapshot,
) {
    if overlay.input_id.is_none() {
        return;
    }

    sync.registry.change_events_begin(NetEventFlag::SERVER_UPDATE);
    for (index, object_snapshot) in overlay.objects.iter().enumerate() {
        let net_id = ObjectNetId(index as u16);
        let Some(local_id) = sync.registry.local_of_net(net_id) else {
            continue;
        };

        for (var_index, value) in object_snapshot.vars.iter().enumerate() {
            let Some(value) = value else { continue };
            if let Some(old) =
                sync.registry
                    .apply_variable(app, local_id, VarId(var_index as u8), value)
            {
                sync.registry
                    .change_event_add(local_id, VarId(var_index as u8), old);
            }
        }
        if !object_snapshot.procedures.is_empty() {
            if let Some(object) = sync.registry.object_mut(local_id) {
                let pending: Vec<_> = object_snapshot
                    .procedures
                    .iter()
                    .filter(|p| !object.executed_procedures.contains(p))
                    .cloned()
                    .collect();
                object.procedures = pending;
            }
        }

        if let Some(back) = state.client_snapshots.back_mut() {
            let slot = back.object_mut_padded(net_id);
            for (var_index, value) in object_snapshot.vars.iter().enumerate() {
                if let Some(value) = value {
                    if slot.vars.len() <= var_index {
                        slot.vars.resize(var_index + 1, None);
                    }
                    slot.vars[var_index] = Some(value.clone());
                }
            }
        }
    }
    sync.registry.change_events_flush();
    collect_end_sync(sync, state);
}

/// While the input stream is paused there is nothing to replay: the server
/// state is applied wherever it differs.
fn process_paused_controller_recovery<A: HostApp, T: Transport>(
    sync: &mut SceneSync<T>,
    state: &mut ClientState,
    app: &mut A,
) {
    while state.server_snapshots.len() > 1 {
        state.server_snapshots.pop_front();
    }
    let snapshot = state.server_snapshots.pop_front().unwrap();
    apply_snapshot(sync, state, app, &snapshot, NetEventFlag::SERVER_UPDATE, true);
    state.last_checked_input = snapshot.input_id;
}

/// Applies every value carried by `snapshot` to the live state under
/// `flag`. With `only_different` set, untouched values emit no events.
fn apply_snapshot<A: HostApp, T: Transport>(
    sync: &mut SceneSync<T>,
    state: &mut ClientState,
    app: &mut A,
    snapshot: &Snapshot,
    flag: NetEventFlag,
    only_different: bool,
) {
    sync.registry.change_events_begin(flag);
    for index in 0..snapshot.objects.len() {
        let net_id = ObjectNetId(index as u16);
        let Some(local_id) = sync.registry.local_of_net(net_id) else {
            continue;
        };
        apply_object_values(sync, app, snapshot, local_id, only_different);
    }
    sync.registry.change_events_flush();
    collect_end_sync(sync, state);
}

fn apply_object_values<A: HostApp, T: Transport>(
    sync: &mut SceneSync<T>,
    app: &mut A,
    snapshot: &Snapshot,
    local_id: ObjectLocalId,
    only_different: bool,
) {
    let Some(object) = sync.registry.object(local_id) else {
        return;
    };
    let net_id = object.net_id();
    if net_id.is_none() {
        return;
    }
    let Some(object_snapshot) = snapshot.object(net_id) else {
        return;
    };
    let tolerance = sync.registry.comparison_tolerance();

    let values: Vec<(usize, VarValue)> = object_snapshot
        .vars
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.clone().map(|v| (i, v)))
        .collect();

    for (var_index, value) in values {
        if only_different {
            let current = sync
                .registry
                .object(local_id)
                .and_then(|o| o.vars.get(var_index))
                .map(|v| v.value.clone());
            if current.is_some_and(|c| c.compare(&value, tolerance)) {
                continue;
            }
        }
        if let Some(old) =
            sync.registry
                .apply_variable(app, local_id, VarId(var_index as u8), &value)
        {
            sync.registry
                .change_event_add(local_id, VarId(var_index as u8), old);
        }
    }
}

fn apply_object_procedures<T: Transport>(
    sync: &mut SceneSync<T>,
    overlay: &Snapshot,
    local_id: ObjectLocalId,
) {
    let Some(object) = sync.registry.object(local_id) else {
        return;
    };
    let net_id = object.net_id();
    if net_id.is_none() {
        return;
    }
    let Some(object_snapshot) = overlay.object(net_id) else {
        return;
    };
    if object_snapshot.procedures.is_empty() {
        return;
    }
    if let Some(object) = sync.registry.object_mut(local_id) {
        let pending: Vec<_> = object_snapshot
            .procedures
            .iter()
            .filter(|p| !object.executed_procedures.contains(p))
            .cloned()
            .collect();
        object.procedures = pending;
    }
}

/// Remembers the pre-sync value of everything touched during a recovery
/// phase; END_SYNC fires for values still different once recovery ends.
fn collect_end_sync<T: Transport>(sync: &mut SceneSync<T>, state: &mut ClientState) {
    for notification in sync.registry.take_notifications() {
        if notification.flag.intersects(NetEventFlag::SYNC) {
            state.push_end_sync(notification.object, notification.var, notification.old);
        }
    }
}
