//! Shared harness: a scripted host application plus a server-and-clients
//! network over the in-memory hub.

use std::collections::HashMap;

use stitch::{
    CompressionLevel, DataBuffer, HostApp, LocalEndpoint, LocalHub, ObjectCapabilities,
    ObjectHandle, ObjectLocalId, PeerId, ProcedurePhase, ProcessPhase, ScheduledProcedureId,
    SceneSync, Settings, VarValue,
};

pub const TICK: f32 = 1.0 / 60.0;

/// Minimal host: named variables per object, a controller that integrates
/// the input value into `pos`, and a trickled codec streaming `pos`.
#[derive(Default)]
pub struct TestWorld {
    pub objects: HashMap<ObjectHandle, TestObject>,
}

#[derive(Default)]
pub struct TestObject {
    pub vars: HashMap<String, VarValue>,
    /// Next input `collect_input` emits; 0 means "no input".
    pub next_input: u64,
    /// Every input value the controller processed, ghosts included.
    pub processed_inputs: Vec<u64>,
    /// `(procedure, phase, argument)` invocations observed.
    pub procedure_calls: Vec<(ScheduledProcedureId, ProcedurePhase, i64)>,
    /// Argument emitted when the server collects procedure arguments.
    pub procedure_argument: i64,
}

impl TestWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_object(&mut self, handle: ObjectHandle) -> &mut TestObject {
        self.objects.entry(handle).or_default()
    }

    pub fn object(&self, handle: ObjectHandle) -> &TestObject {
        self.objects.get(&handle).expect("object registered")
    }

    pub fn object_mut(&mut self, handle: ObjectHandle) -> &mut TestObject {
        self.objects.get_mut(&handle).expect("object registered")
    }

    pub fn set(&mut self, handle: ObjectHandle, name: &str, value: VarValue) {
        self.object_mut(handle).vars.insert(name.to_string(), value);
    }

    pub fn get(&self, handle: ObjectHandle, name: &str) -> VarValue {
        self.object(handle)
            .vars
            .get(name)
            .cloned()
            .unwrap_or(VarValue::Nil)
    }

    pub fn pos(&self, handle: ObjectHandle) -> f64 {
        self.get(handle, "pos").as_real().unwrap_or(0.0)
    }
}

impl HostApp for TestWorld {
    fn get_variable(&self, handle: ObjectHandle, name: &str) -> Option<VarValue> {
        self.objects.get(&handle)?.vars.get(name).cloned()
    }

    fn set_variable(&mut self, handle: ObjectHandle, name: &str, value: &VarValue) -> bool {
        let Some(object) = self.objects.get_mut(&handle) else {
            return false;
        };
        object.vars.insert(name.to_string(), value.clone());
        true
    }

    fn process(&mut self, _handle: ObjectHandle, _phase: ProcessPhase, _delta: f32) {}

    fn collect_input(&mut self, handle: ObjectHandle, _delta: f32, buffer: &mut DataBuffer) {
        let Some(object) = self.objects.get_mut(&handle) else {
            return;
        };
        if object.next_input != 0 {
            buffer.add_uint(object.next_input, CompressionLevel::L3);
        }
    }

    fn are_inputs_different(
        &self,
        _handle: ObjectHandle,
        a: &mut DataBuffer,
        b: &mut DataBuffer,
    ) -> bool {
        a.read_uint(CompressionLevel::L3) != b.read_uint(CompressionLevel::L3)
    }

    fn count_input_size(&self, _handle: ObjectHandle, _buffer: &mut DataBuffer) -> usize {
        8
    }

    fn controller_process(&mut self, handle: ObjectHandle, _delta: f32, buffer: &mut DataBuffer) {
        let value = buffer.read_uint(CompressionLevel::L3);
        let Some(object) = self.objects.get_mut(&handle) else {
            return;
        };
        object.processed_inputs.push(value);
        let pos = object
            .vars
            .get("pos")
            .and_then(|v| v.as_real())
            .unwrap_or(0.0);
        object
            .vars
            .insert("pos".to_string(), VarValue::Real(pos + value as f64));
    }

    fn trickled_collect(&mut self, handle: ObjectHandle, buffer: &mut DataBuffer, _rate: f32) {
        let pos = self.pos(handle);
        buffer.add_real(pos, CompressionLevel::L1);
    }

    fn trickled_apply(
        &mut self,
        handle: ObjectHandle,
        _delta: f32,
        alpha: f32,
        past: &mut DataBuffer,
        future: &mut DataBuffer,
    ) {
        let from = past.read_real(CompressionLevel::L1);
        let to = future.read_real(CompressionLevel::L1);
        let blend = alpha.clamp(0.0, 1.0) as f64;
        self.set(
            handle,
            "pos",
            VarValue::Real(from + (to - from) * blend),
        );
    }

    fn collect_procedure_arguments(
        &mut self,
        handle: ObjectHandle,
        _procedure: ScheduledProcedureId,
        buffer: &mut DataBuffer,
    ) {
        let argument = self.object(handle).procedure_argument;
        buffer.add_int(argument, CompressionLevel::L1);
    }

    fn execute_procedure(
        &mut self,
        handle: ObjectHandle,
        procedure: ScheduledProcedureId,
        phase: ProcedurePhase,
        arguments: &mut DataBuffer,
    ) {
        let argument = arguments.read_int(CompressionLevel::L1);
        if let Some(object) = self.objects.get_mut(&handle) {
            object.procedure_calls.push((procedure, phase, argument));
        }
    }
}

pub struct Endpoint {
    pub sync: SceneSync<LocalEndpoint>,
    pub world: TestWorld,
}

pub struct Net {
    pub hub: LocalHub,
    pub server: Endpoint,
    pub clients: Vec<(PeerId, Endpoint)>,
}

impl Net {
    pub fn new(client_ids: &[PeerId], settings: Settings) -> Self {
        let hub = LocalHub::new(0xC0FFEE);
        let server = Endpoint {
            sync: SceneSync::new(hub.server_endpoint(), settings.clone()),
            world: TestWorld::new(),
        };
        let clients = client_ids
            .iter()
            .map(|peer| {
                (
                    *peer,
                    Endpoint {
                        sync: SceneSync::new(hub.client_endpoint(*peer), settings.clone()),
                        world: TestWorld::new(),
                    },
                )
            })
            .collect();
        Self {
            hub,
            server,
            clients,
        }
    }

    pub fn client(&mut self, peer: PeerId) -> &mut Endpoint {
        &mut self
            .clients
            .iter_mut()
            .find(|(id, _)| *id == peer)
            .expect("client exists")
            .1
    }

    pub fn tick(&mut self) {
        self.server.sync.process(&mut self.server.world, TICK);
        for (_, client) in &mut self.clients {
            client.sync.process(&mut client.world, TICK);
        }
        self.hub.advance(TICK);
    }

    pub fn tick_n(&mut self, count: usize) {
        for _ in 0..count {
            self.tick();
        }
    }
}

/// Registers the same plain object on an endpoint; the server auto-assigns
/// the net id, clients bind it from the first full snapshot.
pub fn register_scalar(endpoint: &mut Endpoint, handle: ObjectHandle, path: &str, initial: f64)
-> ObjectLocalId {
    endpoint.world.add_object(handle);
    endpoint
        .world
        .set(handle, "value", VarValue::Real(initial));
    let local = endpoint
        .sync
        .register_object(handle, path, ObjectCapabilities::default());
    endpoint
        .sync
        .register_variable(local, "value", VarValue::Real(initial));
    local
}

/// Registers a player-controllable object (controller capability plus the
/// `pos` variable driven by the input stream).
pub fn register_player(endpoint: &mut Endpoint, handle: ObjectHandle, path: &str) -> ObjectLocalId {
    endpoint.world.add_object(handle);
    endpoint.world.set(handle, "pos", VarValue::Real(0.0));
    let local = endpoint.sync.register_object(
        handle,
        path,
        ObjectCapabilities {
            controller: true,
            trickled: true,
            procedure_count: 2,
            input_scheme: None,
        },
    );
    endpoint.sync.register_variable(local, "pos", VarValue::Real(0.0));
    local
}
