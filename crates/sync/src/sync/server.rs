//! Authoritative server tick.

use std::collections::HashSet;

use crate::buffer::{CompressionLevel, DataBuffer};
use crate::controller::{AutonomousServerController, Controller, ServerController};
use crate::host::HostApp;
use crate::ids::{FrameIndex, ObjectLocalId, PeerId, SyncGroupId};
use crate::peer::PeerData;
use crate::protocol::{Channel, NetMessage};
use crate::snapshot::{encode_snapshot, ControllerFrames, SnapshotEncodeParams};
use crate::transport::Transport;

use super::SceneSync;

pub(crate) struct ServerState {
    relevancy_timer: f32,
}

impl ServerState {
    pub(crate) fn new() -> Self {
        Self {
            relevancy_timer: 0.0,
        }
    }
}

pub(crate) fn tick<A: HostApp, T: Transport>(
    sync: &mut SceneSync<T>,
    state: &mut ServerState,
    app: &mut A,
    delta: f32,
) {
    dispatch_messages(sync, app);

    let connected = sync.transport.connected_peers();
    let peer_set_changed = connected.len() != sync.peers.len()
        || connected.iter().any(|p| !sync.peers.contains_key(p));
    if sync.peers_dirty || peer_set_changed {
        update_peers(sync);
        sync.peers_dirty = false;
    }

    if !sync.enabled {
        return;
    }

    let dead = sync.registry.scrub_dead_objects(app);
    for local_id in dead {
        for group in &mut sync.groups {
            group.remove_object(local_id);
        }
    }

    // Periodic association sweep: group membership is host-driven, this
    // only prunes peers that lost their last object since the last pass.
    state.relevancy_timer += delta;
    if state.relevancy_timer >= sync.settings.nodes_relevancy_update_time {
        state.relevancy_timer = 0.0;
        let peers: Vec<PeerId> = sync.peers.keys().copied().collect();
        for group in &mut sync.groups {
            for peer in &peers {
                group.validate_peer_association(*peer);
            }
        }
    }

    sync.run_phases(app, delta);
    process_controllers(sync, app, delta);
    sync.execute_due_procedures(app, sync.global_frame);

    // Pull the end-of-frame changes and feed the per-group change tracking.
    sync.registry.change_events_begin(crate::registry::NetEventFlag::CHANGE);
    for local_id in sync.registry.local_ids() {
        sync.registry.pull_changes(app, local_id);
    }
    sync.registry.change_events_flush();
    sync.route_notifications_to_groups();

    process_snapshot_notificator(sync, delta);
    process_trickled_sync(sync, app, delta);
}

fn dispatch_messages<A: HostApp, T: Transport>(sync: &mut SceneSync<T>, app: &mut A) {
    let now_ms = sync.time_ms;
    for (from, message) in sync.drain_messages() {
        match message {
            NetMessage::SyncInputs { data } => {
                let Some(ctrl_local) = sync.registry.controller_of_peer(from) else {
                    log::warn!("inputs from peer {} which controls nothing; dropped", from);
                    continue;
                };
                let handle = sync.registry.object(ctrl_local).unwrap().handle;
                let scheme = sync.input_scheme_of(ctrl_local);
                let Some(peer) = sync.peers.get_mut(&from) else {
                    continue;
                };
                let Some(controller) = peer.controller.as_mut() else {
                    continue;
                };
                if let Some(sc) = controller.as_server() {
                    if let Err(err) = sc.receive_inputs_bounded(
                        app,
                        handle,
                        scheme.as_ref(),
                        &data,
                        now_ms,
                        sync.settings.player_input_storage_size,
                    ) {
                        log::warn!("malformed input packet from {}: {}; dropped", from, err);
                    }
                }
            }
            NetMessage::NotifyNeedFullSnapshot => {
                if let Some(peer) = sync.peers.get_mut(&from) {
                    peer.server.need_full_snapshot = true;
                    peer.server.force_notify_snapshot = true;
                }
            }
            NetMessage::SetNetworkEnabled { enabled } => {
                sync.set_peer_networking_enable(from, enabled);
            }
            other => {
                log::warn!("unexpected message on the server from {}: {:?}", from, other);
            }
        }
    }
}

/// Rebuilds peer data and controllers after the peer set (or object
/// ownership) changed.
fn update_peers<T: Transport>(sync: &mut SceneSync<T>) {
    let connected = sync.transport.connected_peers();

    let known: Vec<PeerId> = sync.peers.keys().copied().collect();
    for peer in known {
        if !connected.contains(&peer) {
            on_peer_disconnected(sync, peer);
        }
    }
    for peer in &connected {
        if !sync.peers.contains_key(peer) {
            sync.peers.insert(*peer, PeerData::new());
            sync.groups[SyncGroupId::GLOBAL.index()].add_listening_peer(*peer);
            log::debug!("peer {} connected", peer);
        }
    }

    // Bind one controller per peer owning a controller-capable object.
    let server_controlled = sync.settings.server_controlled;
    for peer in &connected {
        let owns_controller = sync.registry.controller_of_peer(*peer).is_some();
        let data = sync.peers.get_mut(peer).unwrap();

        match (&mut data.controller, owns_controller) {
            (slot @ None, true) => {
                *slot = Some(if server_controlled {
                    Controller::AutonomousServer(AutonomousServerController::new())
                } else {
                    Controller::Server(ServerController::new(
                        sync.settings.network_traced_frames,
                    ))
                });
                sync.outbox.send(
                    *peer,
                    Channel::Reliable,
                    NetMessage::SetServerControlled {
                        enabled: server_controlled,
                    },
                );
            }
            (slot @ Some(_), false) => {
                *slot = None;
            }
            _ => {}
        }
    }

    // Every controller streams epochs to all the other peers (the dolls).
    for peer in &connected {
        let others: Vec<PeerId> = connected.iter().copied().filter(|p| p != peer).collect();
        if let Some(controller) = sync.peers.get_mut(peer).and_then(|d| d.controller.as_mut()) {
            controller.clear_peers();
            for other in others {
                controller.activate_peer(other);
            }
        }
    }
}

fn on_peer_disconnected<T: Transport>(sync: &mut SceneSync<T>, peer: PeerId) {
    sync.peers.remove(&peer);
    sync.registry.clear_peer_control(peer);
    for group in &mut sync.groups {
        group.remove_listening_peer(peer);
        group.validate_peer_association(peer);
    }
    for data in sync.peers.values_mut() {
        if let Some(controller) = data.controller.as_mut() {
            controller.deactivate_peer(peer);
        }
    }
    log::debug!("peer {} disconnected; controller and pending inputs dropped", peer);
}

fn process_controllers<A: HostApp, T: Transport>(
    sync: &mut SceneSync<T>,
    app: &mut A,
    delta: f32,
) {
    let peer_ids: Vec<PeerId> = sync.peers.keys().copied().collect();
    for peer in peer_ids {
        let Some(ctrl_local) = sync.registry.controller_of_peer(peer) else {
            continue;
        };
        let Some(object) = sync.registry.object(ctrl_local) else {
            continue;
        };
        let handle = object.handle;
        let net_id = object.net_id();
        let scheme = sync.input_scheme_of(ctrl_local);

        let Some(mut controller) = sync.peers.get_mut(&peer).and_then(|d| d.controller.take())
        else {
            continue;
        };

        match &mut controller {
            Controller::Server(sc) => {
                sc.process(app, handle, scheme.as_ref(), delta);
                sc.doll_sync(app, handle, net_id, &sync.settings, delta, &mut sync.outbox);
                if !sc.streaming_paused {
                    sc.calculates_player_tick_rate(&sync.settings, delta);
                    sc.adjust_player_tick_rate(&sync.settings, delta, peer, &mut sync.outbox);
                }
            }
            Controller::AutonomousServer(ac) => {
                ac.process(app, handle, delta);
                ac.base
                    .doll_sync(app, handle, net_id, &sync.settings, delta, &mut sync.outbox);
            }
            _ => {}
        }

        if let Some(data) = sync.peers.get_mut(&peer) {
            data.controller = Some(controller);
        }
    }
}

/// Emits delta snapshots when a group's timer elapses (or a peer forces
/// one), and budget-capped partial snapshots on the ticks in between.
fn process_snapshot_notificator<T: Transport>(sync: &mut SceneSync<T>, delta: f32) {
    if sync.peers.is_empty() {
        return;
    }

    for data in sync.peers.values_mut() {
        data.server.latency_update_via_snapshot_sec += delta;
    }

    let interval = sync.settings.server_notify_state_interval;
    let partial_budget = sync.settings.max_objects_count_per_partial_update;

    for group_index in 0..sync.groups.len() {
        sync.groups[group_index].state_notifier_timer += delta;
        let notify = sync.groups[group_index].state_notifier_timer >= interval;
        let listening: Vec<PeerId> = sync.groups[group_index].listening_peers().to_vec();
        if listening.is_empty() {
            continue;
        }

        let any_forced = listening.iter().any(|p| {
            sync.peers
                .get(p)
                .is_some_and(|d| d.authority.enabled && d.server.force_notify_snapshot)
        });

        if notify || any_forced {
            emit_group_state(sync, group_index, &listening, notify);
            if notify {
                sync.groups[group_index].state_notifier_timer = 0.0;
                sync.groups[group_index].mark_changes_as_notified();
            }
        } else if partial_budget > 0 {
            emit_partial_state(sync, group_index, &listening, partial_budget);
        }
    }
}

fn controller_frames_for<T: Transport>(
    sync: &SceneSync<T>,
    group_index: usize,
    recipient: PeerId,
) -> ControllerFrames {
    let mut frames = ControllerFrames::new();
    for info in sync.groups[group_index].simulated() {
        let Some(object) = sync.registry.object(info.local_id) else {
            continue;
        };
        if !object.is_controller() || object.net_id().is_none() {
            continue;
        }
        let owner = object.controlled_by_peer();
        if owner == recipient || owner < 0 {
            continue;
        }
        let frame = sync
            .peers
            .get(&owner)
            .and_then(|d| d.controller.as_ref())
            .map(|c| c.current_frame_index())
            .unwrap_or(FrameIndex::NONE);
        if !frame.is_none() {
            frames.push((object.net_id(), frame));
        }
    }
    frames
}

fn emit_group_state<T: Transport>(
    sync: &mut SceneSync<T>,
    group_index: usize,
    listening: &[PeerId],
    notify: bool,
) {
    for peer in listening {
        let Some(data) = sync.peers.get(peer) else {
            continue;
        };
        if !data.authority.enabled {
            continue;
        }
        if !notify && !data.server.force_notify_snapshot {
            continue;
        }

        let force_full = data.server.need_full_snapshot;
        let input_id = sync
            .peers
            .get(peer)
            .and_then(|d| d.controller.as_ref())
            .filter(|c| c.is_server_controller())
            .map(|c| c.current_frame_index())
            .unwrap_or(FrameIndex::NONE);

        // Latency rides along at its own cadence.
        let latency = {
            let data = sync.peers.get_mut(peer).unwrap();
            if data.latency_updated
                && data.server.latency_update_via_snapshot_sec
                    >= sync.settings.latency_update_via_snapshot_sec
            {
                data.server.latency_update_via_snapshot_sec = 0.0;
                data.latency_updated = false;
                Some(data.compressed_latency())
            } else {
                None
            }
        };

        let frames = controller_frames_for(sync, group_index, *peer);
        let group = &sync.groups[group_index];
        let custom = group.custom_data.clone();
        let params = SnapshotEncodeParams {
            input_id,
            global_frame_index: sync.global_frame,
            force_full,
            partial_objects: None,
            latency,
            controller_frames: &frames,
            custom_data: custom.as_deref(),
        };
        let body = encode_snapshot(&sync.registry, group, &params);

        sync.outbox
            .send(*peer, Channel::Reliable, NetMessage::State { data: body });

        let data = sync.peers.get_mut(peer).unwrap();
        data.server.force_notify_snapshot = false;
        data.server.need_full_snapshot = false;
        if let Some(sc) = data.controller.as_mut().and_then(|c| c.as_server()) {
            sc.notify_send_state();
        }
    }
}

/// Under a partial budget the top-N changed objects (by starvation
/// priority) go out every tick; the ones left behind get a boost so no
/// object starves.
fn emit_partial_state<T: Transport>(
    sync: &mut SceneSync<T>,
    group_index: usize,
    listening: &[PeerId],
    budget: usize,
) {
    let mut changed: Vec<(ObjectLocalId, f32)> = sync.groups[group_index]
        .simulated()
        .iter()
        .filter(|info| !info.change.is_empty())
        .map(|info| (info.local_id, info.partial_priority))
        .collect();
    if changed.is_empty() {
        return;
    }

    changed.sort_by(|a, b| b.1.total_cmp(&a.1));
    let included: HashSet<ObjectLocalId> =
        changed.iter().take(budget).map(|(id, _)| *id).collect();
    let excluded: Vec<ObjectLocalId> =
        changed.iter().skip(budget).map(|(id, _)| *id).collect();

    for peer in listening {
        let Some(data) = sync.peers.get(peer) else {
            continue;
        };
        if !data.authority.enabled || data.server.need_full_snapshot {
            // A peer waiting for its full state gets nothing partial.
            continue;
        }

        let input_id = data
            .controller
            .as_ref()
            .filter(|c| c.is_server_controller())
            .map(|c| c.current_frame_index())
            .unwrap_or(FrameIndex::NONE);

        let frames = controller_frames_for(sync, group_index, *peer);
        let params = SnapshotEncodeParams {
            input_id,
            global_frame_index: sync.global_frame,
            force_full: false,
            partial_objects: Some(&included),
            latency: None,
            controller_frames: &frames,
            custom_data: None,
        };
        let body = encode_snapshot(&sync.registry, &sync.groups[group_index], &params);
        sync.outbox
            .send(*peer, Channel::Reliable, NetMessage::State { data: body });

        let data = sync.peers.get_mut(peer).unwrap();
        if let Some(sc) = data.controller.as_mut().and_then(|c| c.as_server()) {
            sc.notify_send_state();
        }
    }

    let group = &mut sync.groups[group_index];
    for local_id in &included {
        group.mark_object_as_notified(*local_id);
        if let Some(info) = group
            .simulated_mut()
            .iter_mut()
            .find(|i| i.local_id == *local_id)
        {
            info.partial_priority = 0.0;
        }
    }
    for local_id in excluded {
        if let Some(info) = group
            .simulated_mut()
            .iter_mut()
            .find(|i| i.local_id == local_id)
        {
            info.partial_priority += 1.0;
        }
    }
}

/// Streams trickled objects: priorities accumulate by update rate, the top
/// of the queue is collected up to the per-update budget and reset.
fn process_trickled_sync<A: HostApp, T: Transport>(
    sync: &mut SceneSync<T>,
    app: &mut A,
    delta: f32,
) {
    let budget = sync.settings.max_trickled_objects_per_update;
    let epoch = sync.global_frame.0;

    for group_index in 0..sync.groups.len() {
        let listening: Vec<PeerId> = sync.groups[group_index]
            .listening_peers()
            .iter()
            .copied()
            .filter(|p| {
                sync.peers
                    .get(p)
                    .is_some_and(|d| d.authority.enabled)
            })
            .collect();
        if listening.is_empty() || sync.groups[group_index].trickled().is_empty() {
            continue;
        }

        for info in sync.groups[group_index].trickled_mut() {
            info.update_priority += info.update_rate;
        }
        sync.groups[group_index].sort_trickled_by_priority();

        // Objects become due once a whole update interval accumulated.
        let due: Vec<(ObjectLocalId, f32)> = sync.groups[group_index]
            .trickled()
            .iter()
            .filter(|info| info.update_priority >= 1.0)
            .take(budget.max(1))
            .map(|info| (info.local_id, info.update_rate))
            .collect();
        if due.is_empty() {
            continue;
        }

        let mut batch = DataBuffer::new();
        batch.begin_write(0);
        let mut collected_any = false;

        for (local_id, rate) in &due {
            let Some(object) = sync.registry.object(*local_id) else {
                continue;
            };
            if !object.can_trickled_sync() || object.net_id().is_none() {
                continue;
            }
            let handle = object.handle;
            let net_id = object.net_id();

            let mut blob = DataBuffer::new();
            blob.begin_write(0);
            blob.add_real((delta / rate) as f64, CompressionLevel::L1);
            blob.add_uint(epoch as u64, CompressionLevel::L1);
            app.trickled_collect(handle, &mut blob, *rate);
            blob.dry();

            batch.add_uint(net_id.0 as u64, CompressionLevel::L2);
            batch.add_bytes(&blob.to_byte_vec());
            collected_any = true;
        }

        for (local_id, _) in &due {
            if let Some(info) = sync.groups[group_index]
                .trickled_mut()
                .iter_mut()
                .find(|i| i.local_id == *local_id)
            {
                info.update_priority = 0.0;
            }
        }

        if !collected_any {
            continue;
        }
        batch.dry();
        let data = batch.to_byte_vec();
        for peer in listening {
            sync.outbox.send(
                peer,
                Channel::Unreliable,
                NetMessage::TrickledSyncData { data: data.clone() },
            );
        }
    }
}
