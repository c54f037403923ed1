//! Per-peer visibility partitioning.
//!
//! A sync group decides which objects a set of peers receives and how:
//! *simulated* objects get realtime delta snapshots and participate in
//! client rollback, *trickled* objects are streamed at a fractional rate and
//! interpolated. The server owns one global group plus any number of custom
//! groups; each peer listens to exactly one.

use std::collections::HashSet;

use crate::ids::{ObjectLocalId, PeerId, SyncGroupId, NO_PEER};

/// Accumulated changes of one simulated object since the last notified
/// snapshot.
#[derive(Debug, Clone, Default)]
pub struct Change {
    /// The listening peers have never seen this object.
    pub unknown: bool,
    /// Variables whose name must travel with the next snapshot.
    pub unknown_vars: HashSet<String>,
    /// Variables that changed since the last notified snapshot.
    pub changed_vars: HashSet<String>,
    /// The object's scheduled procedures changed.
    pub procedures_changed: bool,
}

impl Change {
    pub fn is_empty(&self) -> bool {
        !self.unknown && self.changed_vars.is_empty() && !self.procedures_changed
    }

    pub fn clear(&mut self) {
        self.unknown = false;
        self.unknown_vars.clear();
        self.changed_vars.clear();
        self.procedures_changed = false;
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedObjectInfo {
    pub local_id: ObjectLocalId,
    pub controlled_by: PeerId,
    pub change: Change,
    /// Starvation counter for the partial-update budget: bumped when the
    /// object was excluded from a capped snapshot, cleared when included.
    pub partial_priority: f32,
}

impl SimulatedObjectInfo {
    fn new(local_id: ObjectLocalId, controlled_by: PeerId) -> Self {
        Self {
            local_id,
            controlled_by,
            change: Change {
                unknown: true,
                ..Default::default()
            },
            partial_priority: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrickledObjectInfo {
    pub local_id: ObjectLocalId,
    pub controlled_by: PeerId,
    /// Update rate relative to the tick rate: with 60 ticks per second,
    /// `0.5` means 30 updates per second.
    pub update_rate: f32,
    /// Accumulated each tick by `update_rate`; highest priority objects are
    /// collected first and reset to zero.
    pub update_priority: f32,
    pub unknown: bool,
}

impl TrickledObjectInfo {
    fn new(local_id: ObjectLocalId, controlled_by: PeerId) -> Self {
        Self {
            local_id,
            controlled_by,
            update_rate: 0.5,
            update_priority: 0.0,
            unknown: true,
        }
    }

    /// Copies only the mutable tuning fields, preserving scheduling state.
    pub fn update_from(&mut self, other: &TrickledObjectInfo) {
        self.update_rate = other.update_rate;
    }
}

#[derive(Debug)]
pub struct SyncGroup {
    pub group_id: SyncGroupId,
    simulated: Vec<SimulatedObjectInfo>,
    trickled: Vec<TrickledObjectInfo>,
    simulated_list_changed: bool,
    trickled_list_changed: bool,
    /// Peers owning at least one object in either list.
    networked_peers: Vec<PeerId>,
    /// Peers owning at least one simulated object.
    simulating_peers: Vec<PeerId>,
    peers_with_newly_calculated_latency: Vec<PeerId>,
    listening_peers: Vec<PeerId>,
    /// Opaque word for the host.
    pub user_data: u64,
    /// Opaque blob carried by this group's snapshots, when set.
    pub custom_data: Option<Vec<u8>>,
    pub state_notifier_timer: f32,
}

impl SyncGroup {
    pub fn new(group_id: SyncGroupId) -> Self {
        Self {
            group_id,
            simulated: Vec::new(),
            trickled: Vec::new(),
            simulated_list_changed: false,
            trickled_list_changed: false,
            networked_peers: Vec::new(),
            simulating_peers: Vec::new(),
            peers_with_newly_calculated_latency: Vec::new(),
            listening_peers: Vec::new(),
            user_data: 0,
            custom_data: None,
            state_notifier_timer: 0.0,
        }
    }

    pub fn simulated(&self) -> &[SimulatedObjectInfo] {
        &self.simulated
    }

    pub fn simulated_mut(&mut self) -> &mut [SimulatedObjectInfo] {
        &mut self.simulated
    }

    pub fn trickled(&self) -> &[TrickledObjectInfo] {
        &self.trickled
    }

    pub fn trickled_mut(&mut self) -> &mut [TrickledObjectInfo] {
        &mut self.trickled
    }

    pub fn is_simulated_list_changed(&self) -> bool {
        self.simulated_list_changed
    }

    pub fn is_trickled_list_changed(&self) -> bool {
        self.trickled_list_changed
    }

    pub fn listening_peers(&self) -> &[PeerId] {
        &self.listening_peers
    }

    pub fn networked_peers(&self) -> &[PeerId] {
        &self.networked_peers
    }

    pub fn simulating_peers(&self) -> &[PeerId] {
        &self.simulating_peers
    }

    pub fn add_listening_peer(&mut self, peer: PeerId) {
        if !self.listening_peers.contains(&peer) {
            self.listening_peers.push(peer);
        }
    }

    pub fn remove_listening_peer(&mut self, peer: PeerId) {
        self.listening_peers.retain(|p| *p != peer);
    }

    fn find_simulated(&self, local_id: ObjectLocalId) -> Option<usize> {
        self.simulated.iter().position(|o| o.local_id == local_id)
    }

    fn find_trickled(&self, local_id: ObjectLocalId) -> Option<usize> {
        self.trickled.iter().position(|o| o.local_id == local_id)
    }

    pub fn has_simulated(&self, local_id: ObjectLocalId) -> bool {
        self.find_simulated(local_id).is_some()
    }

    pub fn has_trickled(&self, local_id: ObjectLocalId) -> bool {
        self.find_trickled(local_id).is_some()
    }

    fn track_peer(&mut self, controlled_by: PeerId, simulated: bool) {
        if controlled_by == NO_PEER {
            return;
        }
        if !self.networked_peers.contains(&controlled_by) {
            self.networked_peers.push(controlled_by);
        }
        if simulated && !self.simulating_peers.contains(&controlled_by) {
            self.simulating_peers.push(controlled_by);
        }
    }

    /// Adds an object to one of the lists, moving it from the other if
    /// needed. Returns its index in the destination list.
    pub fn add_new_object(
        &mut self,
        local_id: ObjectLocalId,
        controlled_by: PeerId,
        simulated: bool,
    ) -> usize {
        if simulated {
            if let Some(i) = self.find_trickled(local_id) {
                self.trickled.remove(i);
                self.trickled_list_changed = true;
            }
            if let Some(i) = self.find_simulated(local_id) {
                return i;
            }
            self.simulated.push(SimulatedObjectInfo::new(local_id, controlled_by));
            self.simulated_list_changed = true;
            self.track_peer(controlled_by, true);
            self.simulated.len() - 1
        } else {
            if let Some(i) = self.find_simulated(local_id) {
                self.simulated.remove(i);
                self.simulated_list_changed = true;
            }
            if let Some(i) = self.find_trickled(local_id) {
                return i;
            }
            self.trickled.push(TrickledObjectInfo::new(local_id, controlled_by));
            self.trickled_list_changed = true;
            self.track_peer(controlled_by, false);
            self.trickled.len() - 1
        }
    }

    pub fn remove_object(&mut self, local_id: ObjectLocalId) {
        let mut removed_peer = NO_PEER;
        if let Some(i) = self.find_simulated(local_id) {
            removed_peer = self.simulated[i].controlled_by;
            self.simulated.remove(i);
            self.simulated_list_changed = true;
        }
        if let Some(i) = self.find_trickled(local_id) {
            removed_peer = self.trickled[i].controlled_by;
            self.trickled.remove(i);
            self.trickled_list_changed = true;
        }
        if removed_peer != NO_PEER {
            self.validate_peer_association(removed_peer);
        }
    }

    /// Swaps in new membership lists with a minimal diff: objects present in
    /// both keep their scheduling/change state and only copy the mutable
    /// fields; objects absent from the new lists are removed.
    pub fn replace_objects(
        &mut self,
        new_simulated: Vec<SimulatedObjectInfo>,
        new_trickled: Vec<TrickledObjectInfo>,
    ) {
        let wanted_simulated: HashSet<ObjectLocalId> =
            new_simulated.iter().map(|o| o.local_id).collect();
        let wanted_trickled: HashSet<ObjectLocalId> =
            new_trickled.iter().map(|o| o.local_id).collect();

        let to_remove: Vec<ObjectLocalId> = self
            .simulated
            .iter()
            .map(|o| o.local_id)
            .filter(|id| !wanted_simulated.contains(id) && !wanted_trickled.contains(id))
            .chain(
                self.trickled
                    .iter()
                    .map(|o| o.local_id)
                    .filter(|id| !wanted_simulated.contains(id) && !wanted_trickled.contains(id)),
            )
            .collect();
        for local_id in to_remove {
            self.remove_object(local_id);
        }

        for info in new_simulated {
            if self.find_simulated(info.local_id).is_none() {
                self.add_new_object(info.local_id, info.controlled_by, true);
            }
        }
        for info in &new_trickled {
            match self.find_trickled(info.local_id) {
                Some(i) => self.trickled[i].update_from(info),
                None => {
                    let i = self.add_new_object(info.local_id, info.controlled_by, false);
                    self.trickled[i].update_from(info);
                }
            }
        }
    }

    pub fn notify_new_variable(&mut self, local_id: ObjectLocalId, var_name: &str) {
        if let Some(i) = self.find_simulated(local_id) {
            self.simulated[i].change.unknown_vars.insert(var_name.to_string());
            self.simulated[i].change.changed_vars.insert(var_name.to_string());
        }
    }

    pub fn notify_variable_changed(&mut self, local_id: ObjectLocalId, var_name: &str) {
        if let Some(i) = self.find_simulated(local_id) {
            self.simulated[i].change.changed_vars.insert(var_name.to_string());
        }
    }

    pub fn notify_procedures_changed(&mut self, local_id: ObjectLocalId) {
        if let Some(i) = self.find_simulated(local_id) {
            self.simulated[i].change.procedures_changed = true;
        }
    }

    pub fn set_trickled_update_rate(&mut self, local_id: ObjectLocalId, rate: f32) {
        if let Some(i) = self.find_trickled(local_id) {
            self.trickled[i].update_rate = rate.clamp(0.001, 1.0);
        }
    }

    pub fn get_trickled_update_rate(&self, local_id: ObjectLocalId) -> Option<f32> {
        self.find_trickled(local_id).map(|i| self.trickled[i].update_rate)
    }

    /// Stable sort, highest priority first.
    pub fn sort_trickled_by_priority(&mut self) {
        self.trickled
            .sort_by(|a, b| b.update_priority.total_cmp(&a.update_priority));
    }

    /// Clears every change record and both dirty bits; called right after a
    /// full-state snapshot went out.
    pub fn mark_changes_as_notified(&mut self) {
        for info in &mut self.simulated {
            info.change.clear();
        }
        for info in &mut self.trickled {
            info.unknown = false;
        }
        self.simulated_list_changed = false;
        self.trickled_list_changed = false;
    }

    /// Clears the change record of a single object, used by capped partial
    /// snapshots that covered only part of the group.
    pub fn mark_object_as_notified(&mut self, local_id: ObjectLocalId) {
        if let Some(i) = self.find_simulated(local_id) {
            self.simulated[i].change.clear();
        }
    }

    pub fn notify_controller_changed(
        &mut self,
        local_id: ObjectLocalId,
        new_peer: PeerId,
    ) {
        let mut old_peer = NO_PEER;
        let mut simulated = false;
        if let Some(i) = self.find_simulated(local_id) {
            old_peer = self.simulated[i].controlled_by;
            self.simulated[i].controlled_by = new_peer;
            simulated = true;
        } else if let Some(i) = self.find_trickled(local_id) {
            old_peer = self.trickled[i].controlled_by;
            self.trickled[i].controlled_by = new_peer;
        }

        self.track_peer(new_peer, simulated);
        if old_peer != NO_PEER && old_peer != new_peer {
            self.validate_peer_association(old_peer);
        }
    }

    /// Drops the peer from the association sets when it no longer controls
    /// any object in this group. Applied immediately, within the mutation
    /// that removed the last object.
    pub fn validate_peer_association(&mut self, peer: PeerId) {
        let controls_simulated = self.simulated.iter().any(|o| o.controlled_by == peer);
        let controls_any =
            controls_simulated || self.trickled.iter().any(|o| o.controlled_by == peer);

        if !controls_any {
            self.networked_peers.retain(|p| *p != peer);
        }
        if !controls_simulated {
            self.simulating_peers.retain(|p| *p != peer);
        }
    }

    pub fn notify_peer_has_newly_calculated_latency(&mut self, peer: PeerId) {
        if !self.peers_with_newly_calculated_latency.contains(&peer) {
            self.peers_with_newly_calculated_latency.push(peer);
        }
    }

    pub fn take_peers_with_newly_calculated_latency(&mut self) -> Vec<PeerId> {
        std::mem::take(&mut self.peers_with_newly_calculated_latency)
    }

    pub fn remove_all_objects(&mut self) {
        self.simulated.clear();
        self.trickled.clear();
        self.simulated_list_changed = true;
        self.trickled_list_changed = true;
        self.networked_peers.clear();
        self.simulating_peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> SyncGroup {
        SyncGroup::new(SyncGroupId::GLOBAL)
    }

    #[test]
    fn add_moves_between_lists() {
        let mut g = group();
        g.add_new_object(ObjectLocalId(1), NO_PEER, true);
        assert!(g.has_simulated(ObjectLocalId(1)));

        g.add_new_object(ObjectLocalId(1), NO_PEER, false);
        assert!(!g.has_simulated(ObjectLocalId(1)));
        assert!(g.has_trickled(ObjectLocalId(1)));
        assert!(g.is_simulated_list_changed());
        assert!(g.is_trickled_list_changed());
    }

    #[test]
    fn new_simulated_objects_start_unknown() {
        let mut g = group();
        let i = g.add_new_object(ObjectLocalId(1), NO_PEER, true);
        assert!(g.simulated()[i].change.unknown);
    }

    #[test]
    fn changes_accumulate_until_notified() {
        let mut g = group();
        g.add_new_object(ObjectLocalId(1), NO_PEER, true);
        g.notify_new_variable(ObjectLocalId(1), "hp");
        g.notify_variable_changed(ObjectLocalId(1), "hp");
        g.notify_variable_changed(ObjectLocalId(1), "pos");

        let change = &g.simulated()[0].change;
        assert!(change.unknown_vars.contains("hp"));
        assert!(change.changed_vars.contains("pos"));

        g.mark_changes_as_notified();
        assert!(g.simulated()[0].change.is_empty());
        assert!(!g.is_simulated_list_changed());
    }

    #[test]
    fn trickled_sort_is_descending_and_stable() {
        let mut g = group();
        for i in 0..4 {
            g.add_new_object(ObjectLocalId(i), NO_PEER, false);
        }
        g.trickled_mut()[0].update_priority = 1.0;
        g.trickled_mut()[1].update_priority = 3.0;
        g.trickled_mut()[2].update_priority = 3.0;
        g.trickled_mut()[3].update_priority = 2.0;

        g.sort_trickled_by_priority();
        let order: Vec<u32> = g.trickled().iter().map(|o| o.local_id.0).collect();
        // Equal priorities keep their relative order.
        assert_eq!(order, vec![1, 2, 3, 0]);
    }

    #[test]
    fn update_rate_is_clamped() {
        let mut g = group();
        g.add_new_object(ObjectLocalId(1), NO_PEER, false);
        g.set_trickled_update_rate(ObjectLocalId(1), 4.0);
        assert_eq!(g.get_trickled_update_rate(ObjectLocalId(1)), Some(1.0));
    }

    #[test]
    fn peer_association_follows_objects() {
        let mut g = group();
        g.add_new_object(ObjectLocalId(1), 7, true);
        assert_eq!(g.networked_peers(), &[7]);
        assert_eq!(g.simulating_peers(), &[7]);

        g.remove_object(ObjectLocalId(1));
        assert!(g.networked_peers().is_empty());
        assert!(g.simulating_peers().is_empty());
    }

    #[test]
    fn controller_handover_revalidates_peers() {
        let mut g = group();
        g.add_new_object(ObjectLocalId(1), 7, true);
        g.notify_controller_changed(ObjectLocalId(1), 9);
        assert!(g.simulating_peers().contains(&9));
        assert!(!g.simulating_peers().contains(&7));
    }

    #[test]
    fn replace_objects_diffs_in_place() {
        let mut g = group();
        g.add_new_object(ObjectLocalId(1), NO_PEER, true);
        g.add_new_object(ObjectLocalId(2), NO_PEER, false);
        g.trickled_mut()[0].update_priority = 5.0;
        g.mark_changes_as_notified();

        let new_sim = vec![SimulatedObjectInfo::new(ObjectLocalId(3), NO_PEER)];
        let mut kept = TrickledObjectInfo::new(ObjectLocalId(2), NO_PEER);
        kept.update_rate = 0.25;
        let new_trickled = vec![kept];

        g.replace_objects(new_sim, new_trickled);

        assert!(!g.has_simulated(ObjectLocalId(1)));
        assert!(g.has_simulated(ObjectLocalId(3)));
        // Present in both: scheduling state preserved, rate updated.
        assert_eq!(g.get_trickled_update_rate(ObjectLocalId(2)), Some(0.25));
        assert_eq!(g.trickled()[0].update_priority, 5.0);
    }

    #[test]
    fn latency_notifications_drain() {
        let mut g = group();
        g.notify_peer_has_newly_calculated_latency(4);
        g.notify_peer_has_newly_calculated_latency(4);
        assert_eq!(g.take_peers_with_newly_calculated_latency(), vec![4]);
        assert!(g.take_peers_with_newly_calculated_latency().is_empty());
    }
}
