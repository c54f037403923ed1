//! Object & variable registry with change-event dispatch.
//!
//! Objects and listeners live in owning, index-stable collections; every
//! cross-reference is an id. Change dispatch is two-phased: a phase flag is
//! set with [`Registry::change_events_begin`], changes are buffered with
//! [`Registry::change_event_add`], and [`Registry::change_events_flush`]
//! invokes each listener at most once with the first observed old value per
//! watched variable, de-duplicating cascading changes during a rewind.

mod object;

pub use object::{ObjectCapabilities, ObjectData, ProcedureRecord, VarDescriptor};

use std::collections::HashMap;

use bitflags::bitflags;

use crate::host::HostApp;
use crate::ids::{ObjectHandle, ObjectLocalId, ObjectNetId, PeerId, SchemeId, VarId, NO_PEER};
use crate::scheme::SerializationScheme;
use crate::value::VarValue;

bitflags! {
    /// Synchronization phases a listener can subscribe to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NetEventFlag: u8 {
        /// End-of-frame change detected by the regular change pull.
        const CHANGE = 1 << 0;
        /// A server value was applied to the local state.
        const SERVER_UPDATE = 1 << 1;
        /// State was reset to a server snapshot ahead of a replay.
        const SYNC_RESET = 1 << 2;
        /// Change produced while re-executing frames during a rewind.
        const SYNC_REWIND = 1 << 3;
        /// Value still differs once the whole recovery completed.
        const END_SYNC = 1 << 4;
    }
}

impl NetEventFlag {
    pub const SYNC: NetEventFlag = NetEventFlag::SERVER_UPDATE
        .union(NetEventFlag::SYNC_RESET)
        .union(NetEventFlag::SYNC_REWIND);
    pub const DEFAULT: NetEventFlag = NetEventFlag::CHANGE.union(NetEventFlag::END_SYNC);
}

/// Stable numeric id of a change listener. Lookups are fallible: a dropped
/// listener leaves a dead slot behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle(pub usize);

struct WatchedVar {
    object: ObjectLocalId,
    var: VarId,
    old: VarValue,
    old_set: bool,
}

struct ChangesListener {
    func: Option<Box<dyn FnMut(&[VarValue])>>,
    flags: NetEventFlag,
    watching: Vec<WatchedVar>,
    emitted: bool,
}

/// A buffered change, drained by the synchronizer after each dispatch cycle
/// to feed sync-group bookkeeping and end-sync tracking.
#[derive(Debug, Clone)]
pub struct ChangeNotification {
    pub object: ObjectLocalId,
    pub var: VarId,
    pub old: VarValue,
    pub flag: NetEventFlag,
}

pub struct Registry {
    objects: Vec<Option<ObjectData>>,
    by_net: Vec<Option<ObjectLocalId>>,
    by_handle: HashMap<ObjectHandle, ObjectLocalId>,
    listeners: Vec<ChangesListener>,
    schemes: Vec<SerializationScheme>,
    event_flag: NetEventFlag,
    notifications: Vec<ChangeNotification>,
    comparison_tolerance: f64,
}

impl Registry {
    pub fn new(comparison_tolerance: f64) -> Self {
        Self {
            objects: Vec::new(),
            by_net: Vec::new(),
            by_handle: HashMap::new(),
            listeners: Vec::new(),
            schemes: Vec::new(),
            event_flag: NetEventFlag::CHANGE,
            notifications: Vec::new(),
            comparison_tolerance,
        }
    }

    pub fn set_comparison_tolerance(&mut self, tolerance: f64) {
        self.comparison_tolerance = tolerance;
    }

    // -- object lifecycle --

    /// Registers a host object. Idempotent: re-registering a live handle
    /// returns the existing id.
    pub fn register_object(
        &mut self,
        handle: ObjectHandle,
        path: &str,
        capabilities: ObjectCapabilities,
    ) -> ObjectLocalId {
        if let Some(existing) = self.by_handle.get(&handle) {
            return *existing;
        }

        let local_id = ObjectLocalId(self.objects.len() as u32);
        self.objects.push(Some(ObjectData::new(
            local_id,
            handle,
            path.to_string(),
            capabilities,
        )));
        self.by_handle.insert(handle, local_id);
        log::debug!("registered object `{}` as {}", path, local_id);
        local_id
    }

    /// Drops an object. Idempotent; local ids are never reused.
    pub fn unregister_object(&mut self, local_id: ObjectLocalId) {
        let Some(slot) = self.objects.get_mut(local_id.index()) else {
            return;
        };
        let Some(object) = slot.take() else {
            return;
        };

        self.by_handle.remove(&object.handle);
        if !object.net_id.is_none() {
            if let Some(entry) = self.by_net.get_mut(object.net_id.index()) {
                *entry = None;
            }
        }

        // Detach every listener watching this object.
        for listener in &mut self.listeners {
            listener.watching.retain(|w| w.object != local_id);
        }
        log::debug!("unregistered object {}", local_id);
    }

    /// Removes objects whose host side died. Called once per tick before
    /// snapshots are emitted.
    pub fn scrub_dead_objects<A: HostApp>(&mut self, app: &A) -> Vec<ObjectLocalId> {
        let dead: Vec<ObjectLocalId> = self
            .objects
            .iter()
            .flatten()
            .filter(|o| !app.is_object_alive(o.handle))
            .map(|o| o.local_id)
            .collect();
        for local_id in &dead {
            self.unregister_object(*local_id);
        }
        dead
    }

    pub fn set_net_id(&mut self, local_id: ObjectLocalId, net_id: ObjectNetId) {
        let Some(object) = self.object_mut(local_id) else {
            return;
        };
        let previous = object.net_id;
        object.net_id = net_id;

        if !previous.is_none() {
            if let Some(entry) = self.by_net.get_mut(previous.index()) {
                *entry = None;
            }
        }
        if !net_id.is_none() {
            if self.by_net.len() <= net_id.index() {
                self.by_net.resize(net_id.index() + 1, None);
            }
            self.by_net[net_id.index()] = Some(local_id);
        }
    }

    // -- lookups --

    pub fn object(&self, local_id: ObjectLocalId) -> Option<&ObjectData> {
        self.objects.get(local_id.index())?.as_ref()
    }

    pub fn object_mut(&mut self, local_id: ObjectLocalId) -> Option<&mut ObjectData> {
        self.objects.get_mut(local_id.index())?.as_mut()
    }

    pub fn object_by_net(&self, net_id: ObjectNetId) -> Option<&ObjectData> {
        let local = (*self.by_net.get(net_id.index())?)?;
        self.object(local)
    }

    pub fn local_of_net(&self, net_id: ObjectNetId) -> Option<ObjectLocalId> {
        *self.by_net.get(net_id.index())?
    }

    pub fn local_of_handle(&self, handle: ObjectHandle) -> Option<ObjectLocalId> {
        self.by_handle.get(&handle).copied()
    }

    pub fn find_by_path(&self, path: &str) -> Option<ObjectLocalId> {
        self.objects
            .iter()
            .flatten()
            .find(|o| o.path == path)
            .map(|o| o.local_id)
    }

    /// Live objects in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ObjectData> {
        self.objects.iter().flatten()
    }

    pub fn local_ids(&self) -> Vec<ObjectLocalId> {
        self.objects.iter().flatten().map(|o| o.local_id).collect()
    }

    pub fn biggest_net_id(&self) -> ObjectNetId {
        self.objects
            .iter()
            .flatten()
            .map(|o| o.net_id)
            .filter(|id| !id.is_none())
            .max()
            .unwrap_or(ObjectNetId::NONE)
    }

    /// The controller object owned by `peer`, if any.
    pub fn controller_of_peer(&self, peer: PeerId) -> Option<ObjectLocalId> {
        self.objects
            .iter()
            .flatten()
            .find(|o| o.is_controller() && o.controlled_by_peer == peer)
            .map(|o| o.local_id)
    }

    /// Every object controlled by `peer`, controller included.
    pub fn objects_of_peer(&self, peer: PeerId) -> Vec<ObjectLocalId> {
        self.objects
            .iter()
            .flatten()
            .filter(|o| o.controlled_by_peer == peer)
            .map(|o| o.local_id)
            .collect()
    }

    pub fn set_controlled_by(&mut self, local_id: ObjectLocalId, peer: PeerId) {
        if let Some(object) = self.object_mut(local_id) {
            object.controlled_by_peer = peer;
        }
    }

    pub fn clear_peer_control(&mut self, peer: PeerId) {
        for object in self.objects.iter_mut().flatten() {
            if object.controlled_by_peer == peer {
                object.controlled_by_peer = NO_PEER;
            }
        }
    }

    // -- variables --

    /// Registers (or re-enables) a variable. The returned ordinal is stable:
    /// register / unregister / register of the same name yields the same
    /// `VarId`.
    pub fn register_variable(
        &mut self,
        local_id: ObjectLocalId,
        name: &str,
        default: VarValue,
        skip_rewinding: bool,
    ) -> VarId {
        let Some(object) = self.object_mut(local_id) else {
            return VarId::NONE;
        };

        if let Some(var) = object.vars.iter_mut().find(|v| v.name == name) {
            var.enabled = true;
            var.value = default;
            var.skip_rewinding = skip_rewinding;
            return var.id;
        }

        let id = VarId(object.vars.len() as u8);
        object.vars.push(VarDescriptor {
            id,
            name: name.to_string(),
            value: default,
            skip_rewinding,
            enabled: true,
            listeners: Vec::new(),
        });
        id
    }

    /// Disables a variable without shifting ordinals.
    pub fn unregister_variable(&mut self, local_id: ObjectLocalId, name: &str) {
        if let Some(object) = self.object_mut(local_id) {
            if let Some(var) = object.vars.iter_mut().find(|v| v.name == name) {
                var.enabled = false;
            }
        }
    }

    pub fn set_skip_rewinding(&mut self, local_id: ObjectLocalId, name: &str, skip: bool) {
        if let Some(object) = self.object_mut(local_id) {
            if let Some(var) = object.vars.iter_mut().find(|v| v.name == name) {
                var.skip_rewinding = skip;
            }
        }
    }

    /// Client-side: makes sure ordinal `var_id` holds the variable `name`,
    /// padding with disabled placeholders or relocating a misplaced entry.
    pub fn align_variable(&mut self, local_id: ObjectLocalId, var_id: VarId, name: &str) {
        let Some(object) = self.object_mut(local_id) else {
            return;
        };

        while object.vars.len() <= var_id.index() {
            let id = VarId(object.vars.len() as u8);
            object.vars.push(VarDescriptor {
                id,
                name: String::new(),
                value: VarValue::Nil,
                skip_rewinding: false,
                enabled: false,
                listeners: Vec::new(),
            });
        }

        if object.vars[var_id.index()].name != name {
            if let Some(misplaced) = object.vars.iter().position(|v| v.name == name) {
                if misplaced != var_id.index() {
                    let value = object.vars[misplaced].value.clone();
                    let skip = object.vars[misplaced].skip_rewinding;
                    object.vars[misplaced].enabled = false;
                    object.vars[misplaced].name.clear();
                    object.vars[var_id.index()].value = value;
                    object.vars[var_id.index()].skip_rewinding = skip;
                }
            }
            object.vars[var_id.index()].name = name.to_string();
        }
        object.vars[var_id.index()].enabled = true;
    }

    // -- serialization schemes --

    pub fn register_scheme(&mut self, scheme: SerializationScheme) -> SchemeId {
        let id = SchemeId(self.schemes.len() as u8);
        self.schemes.push(scheme);
        id
    }

    pub fn scheme(&self, id: SchemeId) -> Option<&SerializationScheme> {
        self.schemes.get(id.index())
    }

    // -- change listeners --

    /// Subscribes `func` to changes of one variable under the phases in
    /// `mask`. The listener receives the first observed old value of each
    /// variable it watches.
    pub fn track_change(
        &mut self,
        local_id: ObjectLocalId,
        var_id: VarId,
        mask: NetEventFlag,
        func: Box<dyn FnMut(&[VarValue])>,
    ) -> ListenerHandle {
        let handle = ListenerHandle(self.listeners.len());

        let Some(object) = self.object_mut(local_id) else {
            return ListenerHandle(usize::MAX);
        };
        let Some(var) = object.vars.get_mut(var_id.index()) else {
            return ListenerHandle(usize::MAX);
        };
        var.listeners.push(handle.0);

        self.listeners.push(ChangesListener {
            func: Some(func),
            flags: mask,
            watching: vec![WatchedVar {
                object: local_id,
                var: var_id,
                old: VarValue::Nil,
                old_set: false,
            }],
            emitted: true,
        });
        handle
    }

    /// Adds another variable to an existing listener's watch set.
    pub fn track_another_change(
        &mut self,
        handle: ListenerHandle,
        local_id: ObjectLocalId,
        var_id: VarId,
    ) {
        if self.listeners.get(handle.0).is_none() {
            return;
        }
        let Some(object) = self.object_mut(local_id) else {
            return;
        };
        let Some(var) = object.vars.get_mut(var_id.index()) else {
            return;
        };
        var.listeners.push(handle.0);
        self.listeners[handle.0].watching.push(WatchedVar {
            object: local_id,
            var: var_id,
            old: VarValue::Nil,
            old_set: false,
        });
    }

    /// Kills a listener: its mask empties and it detaches from every watched
    /// variable without ever being invoked again.
    pub fn untrack_change(&mut self, handle: ListenerHandle) {
        let Some(listener) = self.listeners.get_mut(handle.0) else {
            return;
        };
        listener.func = None;
        listener.flags = NetEventFlag::empty();
        let watched: Vec<(ObjectLocalId, VarId)> = listener
            .watching
            .drain(..)
            .map(|w| (w.object, w.var))
            .collect();
        for (object, var) in watched {
            if let Some(object) = self.object_mut(object) {
                if let Some(var) = object.vars.get_mut(var.index()) {
                    var.listeners.retain(|l| *l != handle.0);
                }
            }
        }
    }

    // -- change events --

    /// Opens a dispatch cycle under `flag`.
    pub fn change_events_begin(&mut self, flag: NetEventFlag) {
        self.event_flag = flag;
    }

    pub fn current_event_flag(&self) -> NetEventFlag {
        self.event_flag
    }

    pub fn is_recovered(&self) -> bool {
        self.event_flag.intersects(NetEventFlag::SERVER_UPDATE)
    }

    pub fn is_resetted(&self) -> bool {
        self.event_flag.intersects(NetEventFlag::SYNC_RESET)
    }

    pub fn is_rewinding(&self) -> bool {
        self.event_flag.intersects(NetEventFlag::SYNC_REWIND)
    }

    pub fn is_end_sync(&self) -> bool {
        self.event_flag.intersects(NetEventFlag::END_SYNC)
    }

    /// Buffers a change for the current cycle and stores the old value on
    /// every interested listener (first observation wins).
    pub fn change_event_add(&mut self, local_id: ObjectLocalId, var_id: VarId, old: VarValue) {
        let flag = self.event_flag;

        let listener_ids: Vec<usize> = self
            .object(local_id)
            .and_then(|o| o.vars.get(var_id.index()))
            .map(|v| v.listeners.clone())
            .unwrap_or_default();

        for id in listener_ids {
            let Some(listener) = self.listeners.get_mut(id) else {
                continue;
            };
            if !listener.flags.intersects(flag) {
                continue;
            }
            listener.emitted = false;
            if let Some(watched) = listener
                .watching
                .iter_mut()
                .find(|w| w.object == local_id && w.var == var_id)
            {
                if !watched.old_set {
                    watched.old = old.clone();
                    watched.old_set = true;
                }
            }
        }

        self.notifications.push(ChangeNotification {
            object: local_id,
            var: var_id,
            old,
            flag,
        });
    }

    /// Invokes every listener touched since `change_events_begin`, at most
    /// once each, then closes the cycle.
    pub fn change_events_flush(&mut self) {
        for i in 0..self.listeners.len() {
            if self.listeners[i].emitted {
                continue;
            }
            self.listeners[i].emitted = true;

            // Gather old values (or current committed values for untouched
            // watches) before borrowing the callback.
            let mut args = Vec::with_capacity(self.listeners[i].watching.len());
            for w in &self.listeners[i].watching {
                if w.old_set {
                    args.push(w.old.clone());
                } else {
                    let current = self
                        .object(w.object)
                        .and_then(|o| o.vars.get(w.var.index()))
                        .map(|v| v.value.clone())
                        .unwrap_or(VarValue::Nil);
                    args.push(current);
                }
            }
            for w in &mut self.listeners[i].watching {
                w.old_set = false;
            }

            if let Some(func) = self.listeners[i].func.as_mut() {
                func(&args);
            }
        }
        self.event_flag = NetEventFlag::CHANGE;
    }

    /// Drains the notifications buffered since the last call.
    pub fn take_notifications(&mut self) -> Vec<ChangeNotification> {
        std::mem::take(&mut self.notifications)
    }

    // -- change pull --

    /// Reads the current host values and emits a change event for every
    /// variable whose value differs from the committed one.
    pub fn pull_changes<A: HostApp>(&mut self, app: &A, local_id: ObjectLocalId) {
        let Some(object) = self.object(local_id) else {
            return;
        };
        let handle = object.handle;

        let mut changed: Vec<(VarId, VarValue, VarValue)> = Vec::new();
        for var in &object.vars {
            if !var.enabled {
                continue;
            }
            let Some(new_value) = app.get_variable(handle, &var.name) else {
                continue;
            };
            if !var.value.compare(&new_value, self.comparison_tolerance) {
                changed.push((var.id, var.value.clone(), new_value));
            }
        }

        for (var_id, old, new) in changed {
            if let Some(object) = self.object_mut(local_id) {
                object.vars[var_id.index()].value = new;
            }
            self.change_event_add(local_id, var_id, old);
        }
    }

    /// Writes a value to the host and commits it. On a host-side type
    /// mismatch the committed value is left stale so the next pull emits a
    /// change, which in turn triggers a recovery.
    pub fn apply_variable<A: HostApp>(
        &mut self,
        app: &mut A,
        local_id: ObjectLocalId,
        var_id: VarId,
        value: &VarValue,
    ) -> Option<VarValue> {
        let object = self.object(local_id)?;
        let handle = object.handle;
        let var = object.vars.get(var_id.index())?;
        if !var.enabled {
            return None;
        }
        let name = var.name.clone();
        let old = var.value.clone();

        if app.set_variable(handle, &name, value) {
            self.object_mut(local_id)?.vars[var_id.index()].value = value.clone();
        } else {
            log::warn!(
                "type mismatch assigning `{}` on object {}; flagging for recovery",
                name,
                local_id
            );
        }
        Some(old)
    }

    pub fn comparison_tolerance(&self) -> f64 {
        self.comparison_tolerance
    }
}
