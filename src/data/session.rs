use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use smallvec::SmallVec;

use crate::config::SessionConfig;
use crate::data::codec::{decode_value, encode_value, wrap_container};
use crate::data::proxy_object::CHANGE_SERVER_ID_EVENT;
use crate::data::{
    CallResult, ClassDefinition, ClassDescriptor, ClassRef, ClassRegistry, CommandQueue, ContainerKind,
    DirtyCollection, DirtyDelta, ListChange, ListenerId, MapChange, ObjectStore, PendingCall, PendingCalls,
    Placement, Promise, PropertyDescriptor, ProxyEvent, ProxyObject, Sequencer, SessionEvent, SessionEventKind,
    SessionListeners, SyncMode,
};
use crate::protocol::{
    decode_response_body, digest, encode_request_body, parse_edit_array_data, verify_digest, BootstrapData,
    CallTarget, ExceptionData, Headers, InboundCommand, InboundKind, MapClientIdData, OutboundCommand, RestoreData,
    ReturnData, HEADER_DIGEST, HEADER_REQUEST_INDEX, HEADER_SESSION_ID,
};
use crate::transport::{Transport, TransportRequest, TransportResponse};
use crate::{Error, Result, Value};

/// Counters describing the traffic of a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub requests_sent: u64,
    pub commands_sent: u64,
    pub bytes_sent: u64,
    pub responses_applied: u64,
    pub responses_buffered: u64,
    pub bytes_received: u64,
    pub objects_created: u64,
}

/// Called with every request just before it is handed to the transport
pub type PreRequestHook = Box<dyn Fn(&mut TransportRequest)>;

/// A change reported by a watched property container
pub(crate) enum CollectionChange<'a> {
    List(&'a ListChange),
    Map(&'a MapChange),
}

pub(crate) struct CallSpec {
    pub target: CallTarget,
    pub method_name: String,
    pub return_container: ContainerKind,
    pub args: Vec<Value>,
    /// Makes the call asynchronous; settled with the outcome
    pub promise: Option<Promise>,
    /// Runs before any other completion of the call
    pub on_result: Option<Box<dyn FnOnce(&CallResult)>>,
}

struct FlagGuard<'a>(&'a Cell<bool>);

impl<'a> FlagGuard<'a> {
    fn raise(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        FlagGuard(flag)
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

struct DepthGuard<'a>(&'a Cell<u32>);

impl<'a> DepthGuard<'a> {
    fn enter(depth: &'a Cell<u32>) -> Self {
        depth.set(depth.get() + 1);
        DepthGuard(depth)
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get().saturating_sub(1));
    }
}

/// While alive, writes to the marked object (and property) are known to
/// come from the server and are not echoed back.
pub(crate) struct ServerWriteGuard<'a> {
    writes: &'a RefCell<Vec<(usize, Option<String>)>>,
}

impl Drop for ServerWriteGuard<'_> {
    fn drop(&mut self) {
        self.writes.borrow_mut().pop();
    }
}

pub(crate) struct SessionInner {
    this: Weak<SessionInner>,
    config: RefCell<SessionConfig>,
    transport: RefCell<Box<dyn Transport>>,
    pub(crate) registry: RefCell<ClassRegistry>,
    pub(crate) store: RefCell<ObjectStore>,
    pub(crate) queue: RefCell<CommandQueue>,
    sequencer: RefCell<Sequencer>,
    calls: RefCell<PendingCalls>,
    listeners: SessionListeners,
    session_id: RefCell<Option<String>>,
    bootstrap: RefCell<Option<ProxyObject>>,
    bootstrap_call: RefCell<Option<(u64, Promise)>>,
    building: Cell<bool>,
    processing: Cell<u32>,
    server_writes: RefCell<Vec<(usize, Option<String>)>>,
    shutdown: RefCell<Option<Promise>>,
    exception: RefCell<Option<Error>>,
    /// Failure recorded against each request while it is being applied
    request_errors: RefCell<AHashMap<u64, Error>>,
    /// Failures of synchronous requests, collected by their waiters
    sync_errors: RefCell<AHashMap<u64, Error>>,
    flush_scheduled: Cell<bool>,
    last_activity: Cell<Instant>,
    pub(crate) stats: RefCell<SessionStats>,
    pre_request: RefCell<Option<PreRequestHook>>,
}

/// One conversation with a Proxy Manager endpoint.
///
/// A session is single-threaded. The host drives it by calling `pump` (or
/// `run_until_idle`) from its main loop; blocking calls pump internally
/// until their own response has been applied.
#[derive(Clone)]
pub struct Session(Rc<SessionInner>);

impl Session {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self::with_config(transport, SessionConfig::default())
    }

    pub fn with_config(transport: impl Transport + 'static, config: SessionConfig) -> Self {
        let transport: Box<dyn Transport> = Box::new(transport);
        Session(Rc::new_cyclic(|this| SessionInner {
            this: this.clone(),
            config: RefCell::new(config),
            transport: RefCell::new(transport),
            registry: RefCell::new(ClassRegistry::new()),
            store: RefCell::new(ObjectStore::new()),
            queue: RefCell::new(CommandQueue::new()),
            sequencer: RefCell::new(Sequencer::new()),
            calls: RefCell::new(PendingCalls::new()),
            listeners: SessionListeners::default(),
            session_id: RefCell::new(None),
            bootstrap: RefCell::new(None),
            bootstrap_call: RefCell::new(None),
            building: Cell::new(false),
            processing: Cell::new(0),
            server_writes: RefCell::new(Vec::new()),
            shutdown: RefCell::new(None),
            exception: RefCell::new(None),
            request_errors: RefCell::new(AHashMap::new()),
            sync_errors: RefCell::new(AHashMap::new()),
            flush_scheduled: Cell::new(false),
            last_activity: Cell::new(Instant::now()),
            stats: RefCell::new(SessionStats::default()),
            pre_request: RefCell::new(None),
        }))
    }

    pub fn config(&self) -> SessionConfig {
        self.0.config.borrow().clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.0.session_id.borrow().clone()
    }

    pub fn stats(&self) -> SessionStats {
        self.0.stats.borrow().clone()
    }

    /// Fetches the bootstrap object, blocking until it arrives. Later calls
    /// return the same object without contacting the server.
    pub fn bootstrap(&self) -> Result<ProxyObject> {
        if let Some(obj) = self.bootstrap_object() {
            return Ok(obj);
        }
        let (promise, request_index) = self.0.start_bootstrap(false)?;
        let value = self.0.wait_for(&promise, request_index)?;
        value
            .as_object()
            .cloned()
            .ok_or_else(|| Error::Protocol("Bootstrap did not produce an object".to_string()))
    }

    pub fn bootstrap_async(&self) -> Promise {
        if let Some(obj) = self.bootstrap_object() {
            return Promise::resolved(Value::Object(obj));
        }
        match self.0.start_bootstrap(true) {
            Ok((promise, _)) => promise,
            Err(e) => Promise::rejected(e),
        }
    }

    pub fn bootstrap_object(&self) -> Option<ProxyObject> {
        self.0.bootstrap.borrow().clone()
    }

    pub fn class(&self, name: &str) -> Option<Rc<ClassDescriptor>> {
        self.0.registry.borrow().get(name)
    }

    /// Registers a class ahead of any server traffic that mentions it.
    pub fn define_class(&self, definition: ClassDefinition) -> Result<Rc<ClassDescriptor>> {
        let class_ref = ClassRef::from(definition);
        self.0
            .registry
            .borrow_mut()
            .resolve_or_create(&class_ref)?
            .ok_or_else(|| Error::Protocol(format!("Class {} is still being defined", class_ref.name())))
    }

    /// Creates an object on the client. The server learns about it with the
    /// next request that is sent.
    pub fn create_object(&self, class_name: &str) -> Result<ProxyObject> {
        let class = self
            .class(class_name)
            .ok_or_else(|| Error::UnknownClass(class_name.to_string()))?;
        if class.is_interface {
            return Err(Error::Protocol(format!("Cannot instantiate interface {}", class_name)));
        }
        let obj = ProxyObject::new(class, self.0.weak(), Vec::new());
        let id = self.0.store.borrow_mut().register_pending(&obj);
        obj.init_defaults();
        debug!("Created {} with client id {}", class_name, id);
        Ok(obj)
    }

    pub fn object(&self, id: i64) -> Result<Option<ProxyObject>> {
        self.0.store.borrow().get_or_null(id)
    }

    pub fn invoke_static(&self, class_name: &str, method: &str, args: Vec<Value>) -> Result<Value> {
        self.0.call(self.static_call(class_name, method, args, None)?)
    }

    pub fn invoke_static_async(&self, class_name: &str, method: &str, args: Vec<Value>) -> Promise {
        let promise = Promise::new();
        let issued = self
            .static_call(class_name, method, args, Some(promise.clone()))
            .and_then(|spec| self.0.call(spec));
        if let Err(e) = issued {
            promise.settle(Err(e));
        }
        promise
    }

    fn static_call(&self, class_name: &str, method: &str, args: Vec<Value>, promise: Option<Promise>) -> Result<CallSpec> {
        let class = self
            .class(class_name)
            .ok_or_else(|| Error::UnknownClass(class_name.to_string()))?;
        let descriptor = class.method(method).cloned().ok_or_else(|| Error::UnknownMethod {
            class: class_name.to_string(),
            method: method.to_string(),
        })?;
        if !descriptor.is_static {
            return Err(Error::Protocol(format!("{}.{} is not static", class_name, method)));
        }
        Ok(CallSpec {
            target: CallTarget::Class(class.class_name.clone()),
            method_name: descriptor.name.clone(),
            return_container: descriptor.return_container,
            args,
            promise,
            on_result: None,
        })
    }

    /// Sends whatever is queued as one asynchronous request. Returns the
    /// request index, or `None` if there was nothing to send.
    pub fn flush(&self) -> Result<Option<u64>> {
        self.0.send_command(None, true, false)
    }

    pub fn flush_with(&self, force: bool, is_async: bool) -> Result<Option<u64>> {
        self.0.send_command(None, is_async, force)
    }

    /// Waits up to `timeout` for one response and applies it. Returns
    /// whether a response was received.
    pub fn pump(&self, timeout: Option<Duration>) -> Result<bool> {
        self.0.pump(timeout)
    }

    /// Pumps until nothing is in flight, buffered or scheduled.
    pub fn run_until_idle(&self, timeout: Option<Duration>) -> Result<()> {
        self.0.run_until_idle(timeout)
    }

    /// Runs scheduled flushes and the idle poll without waiting.
    pub fn tick(&self) -> Result<()> {
        self.0.tick()
    }

    /// Flushes what is queued and stops accepting new work. The promise
    /// settles once every request in flight has been applied.
    pub fn shutdown(&self) -> Promise {
        self.0.begin_shutdown()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.0.is_shutting_down()
    }

    pub fn subscribe(&self, kind: SessionEventKind, callback: impl Fn(&SessionEvent) + 'static) -> ListenerId {
        self.0.listeners.add(kind, callback)
    }

    pub fn unsubscribe(&self, kind: SessionEventKind, id: ListenerId) -> bool {
        self.0.listeners.remove(kind, id)
    }

    /// The last exception recorded by the session
    pub fn exception(&self) -> Option<Error> {
        self.0.exception.borrow().clone()
    }

    pub fn clear_exception(&self) -> Option<Error> {
        self.0.exception.borrow_mut().take()
    }

    pub fn set_poll_server(&self, poll: bool) {
        self.0.config.borrow_mut().poll_server = poll;
        self.0.last_activity.set(Instant::now());
    }

    pub fn set_poll_frequency(&self, frequency: Duration) {
        self.0.config.borrow_mut().poll_frequency_ms = frequency.as_millis() as u64;
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.0.config.borrow_mut().timeout_ms = timeout.map(|t| t.as_millis() as u64);
    }

    pub fn on_pre_request(&self, hook: impl Fn(&mut TransportRequest) + 'static) {
        *self.0.pre_request.borrow_mut() = Some(Box::new(hook));
    }

    pub fn encode(&self, value: &Value) -> Json {
        encode_value(&self.0, value)
    }

    pub fn decode(&self, wire: &Json) -> Result<Value> {
        decode_value(&self.0, wire)
    }

    pub fn in_flight_count(&self) -> usize {
        self.0.sequencer.borrow().in_flight_count()
    }

    pub fn queued_count(&self) -> usize {
        self.0.queue.borrow().len()
    }

    pub fn pending_call_count(&self) -> usize {
        self.0.calls.borrow().len()
    }

    pub fn is_idle(&self) -> bool {
        self.0.sequencer.borrow().is_idle()
    }
}

impl SessionInner {
    pub(crate) fn weak(&self) -> Weak<SessionInner> {
        self.this.clone()
    }

    pub(crate) fn is_building(&self) -> bool {
        self.building.get()
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.borrow().is_some()
    }

    fn encode(&self, value: &Value) -> Json {
        encode_value(self, value)
    }

    fn decode(&self, wire: &Json) -> Result<Value> {
        decode_value(self, wire)
    }

    fn decode_object(&self, wire: &Json) -> Result<ProxyObject> {
        match self.decode(wire)? {
            Value::Object(obj) => Ok(obj),
            other => Err(Error::Protocol(format!("Expected a server object, got {}", other.type_name()))),
        }
    }

    pub(crate) fn server_write(&self, obj: &ProxyObject, name: Option<&str>) -> ServerWriteGuard<'_> {
        self.server_writes
            .borrow_mut()
            .push((obj.addr(), name.map(str::to_string)));
        ServerWriteGuard {
            writes: &self.server_writes,
        }
    }

    pub(crate) fn is_server_write(&self, obj: &ProxyObject, name: &str) -> bool {
        let addr = obj.addr();
        self.server_writes
            .borrow()
            .iter()
            .any(|(a, n)| *a == addr && n.as_deref().map_or(true, |n| n == name))
    }

    pub(crate) fn queue_command(&self, command: OutboundCommand) {
        self.queue.borrow_mut().enqueue(command);
    }

    /// Queues the `new` command for a client-created object.
    pub(crate) fn announce(&self, obj: &ProxyObject) {
        obj.mark_sent();
        self.store.borrow_mut().mark_sent(obj.id());

        let mut properties = Map::new();
        for prop in obj.class().all_properties() {
            let Some(value) = obj.peek(&prop.name) else {
                continue;
            };
            match &value {
                Value::List(l) => self.queue.borrow_mut().clear_dirty(l.id()),
                Value::Map(m) => self.queue.borrow_mut().clear_dirty(m.id()),
                _ => {}
            }
            if prop.read_only || prop.on_demand {
                continue;
            }
            if !ProxyObject::is_default_value(prop, &value) {
                properties.insert(prop.name.clone(), self.encode(&value));
            }
        }
        debug!("Announcing {:?}", obj);
        self.queue_command(OutboundCommand::New {
            class_name: obj.class_name().to_string(),
            client_id: obj.id(),
            properties,
        });
    }

    pub(crate) fn sync_property(&self, obj: &ProxyObject, prop: &PropertyDescriptor, value: &Value) -> Result<()> {
        let wire = self.encode(value);
        match value {
            Value::List(l) => self.queue.borrow_mut().clear_dirty(l.id()),
            Value::Map(m) => self.queue.borrow_mut().clear_dirty(m.id()),
            _ => {}
        }
        let command = OutboundCommand::Set {
            server_id: obj.id(),
            property_name: prop.name.clone(),
            value: wire,
        };
        if prop.sync == SyncMode::Queued {
            self.queue_command(command);
            return Ok(());
        }
        if self.building.get() || self.processing.get() > 0 {
            self.queue_command(command);
            self.flush_scheduled.set(true);
            return Ok(());
        }
        let Some(request_index) = self.send_command(Some(command), false, false)? else {
            return Ok(());
        };
        self.wait_for_request(request_index)?;
        match self.sync_errors.borrow_mut().remove(&request_index) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub(crate) fn collection_changed(&self, obj: &ProxyObject, name: &str, change: CollectionChange<'_>) {
        if obj.is_disposed() || self.is_server_write(obj, name) {
            return;
        }
        // the `new` command will carry the whole container
        if obj.is_pending() && !obj.is_sent() {
            return;
        }
        let (Some(container), Some(prop)) = (obj.peek(name), obj.class().property(name).cloned()) else {
            return;
        };
        if prop.read_only {
            debug!("Ignoring local edit of read-only {} on {:?}", name, obj);
            return;
        }
        {
            let mut queue = self.queue.borrow_mut();
            match change {
                CollectionChange::List(c) => queue.record_list_change(obj, name, &container, c),
                CollectionChange::Map(c) => queue.record_map_change(obj, name, &container, c),
            }
        }
        if prop.sync == SyncMode::Immediate {
            self.flush_scheduled.set(true);
        }
    }

    pub(crate) fn dispose_object(&self, obj: &ProxyObject) {
        let id = obj.id();
        if obj.is_pending() && !obj.is_sent() {
            debug!("Discarding {:?} which never reached the server", obj);
            self.store.borrow_mut().retire(id);
            self.queue.borrow_mut().forget_object(id);
        } else {
            self.queue.borrow_mut().queue_dispose(obj);
        }
    }

    pub(crate) fn call(&self, spec: CallSpec) -> Result<Value> {
        if self.is_shutting_down() {
            return Err(Error::Shutdown);
        }
        let CallSpec {
            target,
            method_name,
            return_container,
            args,
            promise,
            on_result,
        } = spec;

        let mut notifies = Vec::new();
        let mut params = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                Value::Notify(n) => notifies.push(n),
                other => params.push(other),
            }
        }
        let is_async = promise.is_some() || !notifies.is_empty();

        let completion = Promise::new();
        if let Some(hook) = on_result {
            completion.then(hook);
        }
        for notify in notifies {
            completion.then(move |outcome| notify.deliver(outcome));
        }
        if let Some(promise) = promise {
            completion.then(move |outcome| {
                promise.settle(outcome.clone());
            });
        }

        let parameters: Vec<Json> = params.iter().map(|p| self.encode(p)).collect();
        let deferred = is_async
            && (self.building.get() || self.processing.get() > 0 || self.sequencer.borrow().has_in_flight());
        let async_id = {
            let mut calls = self.calls.borrow_mut();
            let async_id = calls.next_async_id();
            calls.register(PendingCall {
                async_id,
                target: target.clone(),
                method_name: method_name.clone(),
                return_container,
                request_index: None,
                queued: deferred,
                completion: completion.clone(),
            });
            async_id
        };
        let command = OutboundCommand::Call {
            server_id: target,
            method_name: method_name.clone(),
            async_id,
            parameters,
        };

        if deferred {
            debug!("Deferring call {} ({}) until requests in flight complete", async_id, method_name);
            self.queue.borrow_mut().defer_call(command);
            self.flush_scheduled.set(true);
            return Ok(Value::Null);
        }
        if !is_async && self.building.get() {
            warn!(
                "Synchronous call to {} while a request is being assembled; it is queued and returns null",
                method_name
            );
            self.queue_command(command);
            return Ok(Value::Null);
        }
        if !is_async && self.processing.get() > 0 {
            warn!("Synchronous call to {} while a response is being applied", method_name);
        }

        match self.send_command(Some(command), is_async, false) {
            Ok(Some(request_index)) if !is_async => self.wait_for(&completion, Some(request_index)),
            Ok(_) => Ok(Value::Null),
            Err(e) => {
                let call = self.calls.borrow_mut().take(async_id);
                if let Some(call) = call {
                    call.completion.settle(Err(e.clone()));
                }
                Err(e)
            }
        }
    }

    fn start_bootstrap(&self, is_async: bool) -> Result<(Promise, Option<u64>)> {
        let outstanding = self.bootstrap_call.borrow().clone();
        if let Some((_, promise)) = outstanding.filter(|(_, p)| !p.is_settled()) {
            return Ok((promise, None));
        }
        if self.is_shutting_down() {
            return Err(Error::Shutdown);
        }
        let completion = Promise::new();
        let async_id = {
            let mut calls = self.calls.borrow_mut();
            let async_id = calls.next_async_id();
            calls.register(PendingCall {
                async_id,
                target: CallTarget::Class("bootstrap".to_string()),
                method_name: "bootstrap".to_string(),
                return_container: ContainerKind::None,
                request_index: None,
                queued: false,
                completion: completion.clone(),
            });
            async_id
        };
        *self.bootstrap_call.borrow_mut() = Some((async_id, completion.clone()));
        let request_index = self.send_command(Some(OutboundCommand::Bootstrap { async_id }), is_async, true)?;
        Ok((completion, request_index))
    }

    /// Assembles and sends one request. While a request is already being
    /// assembled, `command` is queued for it instead.
    fn send_command(&self, command: Option<OutboundCommand>, is_async: bool, force: bool) -> Result<Option<u64>> {
        if self.is_shutting_down() {
            return Err(Error::Shutdown);
        }
        if self.building.get() {
            if let Some(command) = command {
                self.queue_command(command);
            }
            return Ok(None);
        }

        let commands = {
            let _building = FlagGuard::raise(&self.building);
            self.assemble(command)
        };
        if commands.is_empty() && !force {
            return Ok(None);
        }

        let body = encode_request_body(&commands)?;
        let async_ids: SmallVec<[u64; 4]> = commands.iter().filter_map(OutboundCommand::async_id).collect();
        let disposes: Vec<i64> = commands
            .iter()
            .filter_map(|c| match c {
                OutboundCommand::Dispose { server_ids } => Some(server_ids.iter().copied()),
                _ => None,
            })
            .flatten()
            .collect();

        let request_index = self
            .sequencer
            .borrow_mut()
            .begin(is_async, async_ids.clone(), disposes);
        {
            let mut calls = self.calls.borrow_mut();
            for async_id in &async_ids {
                calls.assign_request(*async_id, request_index);
            }
        }

        let (send_digest, timeout) = {
            let config = self.config.borrow();
            (config.send_digest, config.timeout())
        };
        let mut headers = Headers::new();
        headers.insert(HEADER_REQUEST_INDEX, request_index.to_string());
        if let Some(session_id) = self.session_id.borrow().as_ref() {
            headers.insert(HEADER_SESSION_ID, session_id.clone());
        }
        if send_digest {
            headers.insert(HEADER_DIGEST, digest(&body));
        }
        let mut request = TransportRequest {
            request_index,
            headers,
            body,
            is_async,
            timeout,
        };
        if let Some(hook) = self.pre_request.borrow().as_ref() {
            hook(&mut request);
        }

        {
            let mut stats = self.stats.borrow_mut();
            stats.requests_sent += 1;
            stats.commands_sent += commands.len() as u64;
            stats.bytes_sent += request.body.len() as u64;
        }
        debug!(
            "Sending request {} ({}, {} command(s))",
            request_index,
            if is_async { "async" } else { "sync" },
            commands.len()
        );
        self.last_activity.set(Instant::now());

        let sent = self.transport.borrow_mut().send(request);
        if let Err(e) = sent {
            error!("Failed to send request {}: {}", request_index, e);
            let failure = match e {
                Error::Transport { status, message } => TransportResponse::failed(request_index, status, message),
                other => TransportResponse::failed(request_index, 0, other.to_string()),
            };
            self.handle_response(failure)?;
        }
        Ok(Some(request_index))
    }

    /// Drains the queue into the command list of the next request.
    fn assemble(&self, command: Option<OutboundCommand>) -> Vec<OutboundCommand> {
        loop {
            let unsent = self.store.borrow().unsent();
            if unsent.is_empty() {
                break;
            }
            for obj in unsent.iter().filter(|o| !o.is_sent()) {
                self.announce(obj);
            }
        }

        let dirty = self.queue.borrow_mut().take_dirty();
        for collection in dirty.iter().filter(|d| !d.owner.is_disposed()) {
            let edit = self.encode_delta(collection);
            self.queue_command(edit);
        }

        let deferred = self.queue.borrow_mut().take_deferred_calls();
        for call in deferred {
            self.queue_command(call);
        }

        let disposed = self.queue.borrow_mut().take_disposed();
        let (ready, waiting): (Vec<ProxyObject>, Vec<ProxyObject>) = disposed.into_iter().partition(|o| !o.is_pending());
        if !waiting.is_empty() {
            // disposed after their `new` went out but before the server mapped them
            let mut queue = self.queue.borrow_mut();
            for obj in &waiting {
                queue.queue_dispose(obj);
            }
        }
        if !ready.is_empty() {
            self.queue_command(OutboundCommand::Dispose {
                server_ids: ready.iter().map(ProxyObject::id).collect(),
            });
        }

        self.listeners
            .fire(&SessionEvent::new(SessionEventKind::QueuePending, None, None));

        let mut commands = self.queue.borrow_mut().take_commands();
        commands.extend(command);
        commands
    }

    fn encode_delta(&self, collection: &DirtyCollection) -> OutboundCommand {
        let server_id = collection.owner.id();
        match &collection.delta {
            DirtyDelta::List { added, removed } => {
                let array = match &collection.container {
                    Value::List(list) => list.to_vec().iter().map(|v| self.encode(v)).collect(),
                    _ => Vec::new(),
                };
                OutboundCommand::edit_list(
                    server_id,
                    collection.property.clone(),
                    removed.iter().map(|v| self.encode(v)).collect(),
                    added.iter().map(|v| self.encode(v)).collect(),
                    array,
                )
            }
            DirtyDelta::Map { put, removed } => {
                let mut entries = Map::new();
                for (n, (key, value, _)) in put.iter().enumerate() {
                    let mut entry = Map::new();
                    entry.insert("key".to_string(), self.encode(key));
                    entry.insert("value".to_string(), self.encode(value));
                    entries.insert(n.to_string(), Json::Object(entry));
                }
                OutboundCommand::edit_map(
                    server_id,
                    collection.property.clone(),
                    removed.iter().map(|v| self.encode(v)).collect(),
                    entries,
                )
            }
        }
    }

    /// Pumps until `promise` settles. With a request index, also stops once
    /// that request has been applied; on timeout the request is abandoned.
    pub(crate) fn wait_for(&self, promise: &Promise, request_index: Option<u64>) -> CallResult {
        let (timeout, interval) = {
            let config = self.config.borrow();
            (config.timeout(), config.wait_interval())
        };
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(result) = promise.result() {
                if let Some(index) = request_index {
                    self.sync_errors.borrow_mut().remove(&index);
                }
                return result;
            }
            match request_index {
                Some(index) if !self.sequencer.borrow().is_in_flight(index) => {
                    return Err(Error::Protocol(format!("Request {} completed without a result", index)));
                }
                None if self.sequencer.borrow().is_idle() && !self.flush_scheduled.get() => {
                    return Err(Error::Protocol("Nothing in flight to wait for".to_string()));
                }
                _ => {}
            }
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(self.abandon(request_index));
                    }
                    interval.min(deadline - now)
                }
                None => interval,
            };
            self.pump_waiting(Some(wait))?;
        }
    }

    /// Blocks on an on-demand fetch. A fetch still sitting in the deferred
    /// queue goes out now in a synchronous request, since no flush runs while
    /// a response is being applied.
    pub(crate) fn wait_for_fetch(&self, fetch: &Promise) -> CallResult {
        if fetch.is_settled() || !self.queue.borrow().has_deferred_calls() {
            return self.wait_for(fetch, None);
        }
        if self.building.get() {
            warn!("Blocking read while a request is being assembled; it returns null");
            return Ok(Value::Null);
        }
        let request_index = self.send_command(None, false, false)?;
        self.wait_for(fetch, request_index)
    }

    fn wait_for_request(&self, request_index: u64) -> Result<()> {
        let (timeout, interval) = {
            let config = self.config.borrow();
            (config.timeout(), config.wait_interval())
        };
        let deadline = timeout.map(|t| Instant::now() + t);
        while self.sequencer.borrow().is_in_flight(request_index) {
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(self.abandon(Some(request_index)));
                    }
                    interval.min(deadline - now)
                }
                None => interval,
            };
            self.pump_waiting(Some(wait))?;
        }
        Ok(())
    }

    /// Gives up on a request: its calls fail now and a late response is dropped.
    fn abandon(&self, request_index: Option<u64>) -> Error {
        let Some(index) = request_index.filter(|i| self.sequencer.borrow().is_in_flight(*i)) else {
            return Error::Timeout(request_index.unwrap_or_default());
        };
        warn!("Request {} timed out; abandoning it", index);
        let failure = TransportResponse::failed(index, 0, format!("Request {} timed out", index));
        if let Err(e) = self.handle_response(failure) {
            error!("Failed to abandon request {}: {}", index, e);
        }
        self.sequencer.borrow_mut().abandon(index);
        self.sync_errors.borrow_mut().remove(&index);
        Error::Timeout(index)
    }

    fn pump(&self, timeout: Option<Duration>) -> Result<bool> {
        let (received, applied) = self.receive_one(timeout)?;
        applied?;
        Ok(received)
    }

    /// Pump for a caller blocked on its own request. A failure applying some
    /// other response is already recorded against that request, so only
    /// sequencing and transport errors end the wait.
    fn pump_waiting(&self, timeout: Option<Duration>) -> Result<bool> {
        let (received, applied) = self.receive_one(timeout)?;
        if let Err(e) = applied {
            debug!("Still waiting after a failed response: {}", e);
        }
        Ok(received)
    }

    fn receive_one(&self, timeout: Option<Duration>) -> Result<(bool, Result<()>)> {
        self.tick()?;
        if !self.sequencer.borrow().has_in_flight() {
            return Ok((false, Ok(())));
        }
        let response = self.transport.borrow_mut().receive(timeout)?;
        let outcome = match response {
            Some(response) => (true, self.place_response(response)?),
            None => (false, Ok(())),
        };
        self.tick()?;
        Ok(outcome)
    }

    fn run_until_idle(&self, timeout: Option<Duration>) -> Result<()> {
        let interval = self.config.borrow().wait_interval();
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            self.tick()?;
            if self.sequencer.borrow().is_idle() && !self.flush_scheduled.get() {
                return Ok(());
            }
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout(self.sequencer.borrow().expected_index()));
                    }
                    interval.min(deadline - now)
                }
                None => interval,
            };
            self.pump(Some(wait))?;
        }
    }

    fn tick(&self) -> Result<()> {
        if self.is_shutting_down() {
            self.flush_scheduled.set(false);
            return Ok(());
        }
        if self.building.get() || self.processing.get() > 0 {
            return Ok(());
        }
        let busy = self.sequencer.borrow().has_in_flight();
        if self.flush_scheduled.get() && !busy {
            self.flush_scheduled.set(false);
            self.send_command(None, true, false)?;
            return Ok(());
        }
        let (poll, frequency) = {
            let config = self.config.borrow();
            (config.poll_server, config.poll_frequency())
        };
        if poll && !busy && self.last_activity.get().elapsed() >= frequency {
            debug!("Polling server after {:?} idle", frequency);
            self.send_command(Some(OutboundCommand::Poll), true, true)?;
        }
        Ok(())
    }

    fn begin_shutdown(&self) -> Promise {
        let existing = self.shutdown.borrow().clone();
        if let Some(promise) = existing {
            return promise;
        }
        if let Err(e) = self.send_command(None, true, false) {
            warn!("Failed to flush queued commands at shutdown: {}", e);
        }
        let promise = Promise::new();
        *self.shutdown.borrow_mut() = Some(promise.clone());
        self.flush_scheduled.set(false);
        let in_flight = self.sequencer.borrow().in_flight_count();
        info!("Session shutting down with {} request(s) in flight", in_flight);
        if self.sequencer.borrow().is_idle() {
            self.finish_shutdown(&promise);
        }
        promise
    }

    fn finish_shutdown(&self, promise: &Promise) {
        if promise.settle(Ok(Value::Null)) {
            info!("Session shut down");
            self.listeners
                .fire(&SessionEvent::new(SessionEventKind::Shutdown, None, None));
        }
    }

    /// Entry point for every response, real or synthesized.
    fn handle_response(&self, response: TransportResponse) -> Result<()> {
        self.place_response(response)?
    }

    /// The outer error is a sequencing violation. The inner one comes from
    /// applying a response and has been recorded against its request.
    fn place_response(&self, response: TransportResponse) -> Result<Result<()>> {
        let request_index = response
            .headers
            .get(HEADER_REQUEST_INDEX)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(response.request_index);

        let placement = self.sequencer.borrow_mut().place(request_index);
        let placement = match placement {
            Ok(p) => p,
            Err(e) => {
                error!("Rejecting response {}: {}", request_index, e);
                self.raise(e.clone(), None);
                return Err(e);
            }
        };

        let result = match placement {
            Placement::Stale => {
                warn!("Dropping late response to abandoned request {}", request_index);
                Ok(())
            }
            Placement::Buffer => {
                debug!("Buffering response {} until earlier requests complete", request_index);
                self.sequencer.borrow_mut().buffer(response, request_index);
                self.stats.borrow_mut().responses_buffered += 1;
                return Ok(Ok(()));
            }
            Placement::OutOfBand => self.apply(request_index, response),
            Placement::Apply => {
                let mut result = self.apply(request_index, response);
                loop {
                    let ready = self.sequencer.borrow_mut().next_ready();
                    let Some((index, buffered)) = ready else {
                        break;
                    };
                    let applied = self.apply(index, buffered);
                    if result.is_ok() {
                        result = applied;
                    }
                }
                result
            }
        };
        self.after_responses();
        Ok(result)
    }

    fn apply(&self, request_index: u64, response: TransportResponse) -> Result<()> {
        let request = self.sequencer.borrow_mut().complete(request_index);
        let _processing = DepthGuard::enter(&self.processing);
        self.stats.borrow_mut().responses_applied += 1;

        let result = if response.is_success() {
            self.process(request_index, &response)
        } else {
            self.on_transport_failure(request_index, response.to_error());
            Ok(())
        };
        if let Err(e) = &result {
            error!("Failed to apply response {}: {}", request_index, e);
            self.record_exception(e.clone(), request_index);
        }

        let failure = self.request_errors.borrow_mut().remove(&request_index);
        let unresolved = self.calls.borrow_mut().take_for_request(request_index);
        for call in unresolved {
            let outcome = match &failure {
                Some(e) => Err(e.clone()),
                None => {
                    warn!(
                        "Response {} carried no result for call {} ({})",
                        request_index, call.async_id, call.method_name
                    );
                    Ok(Value::Null)
                }
            };
            call.completion.settle(outcome);
        }

        if let Some(request) = request {
            {
                let mut store = self.store.borrow_mut();
                for id in &request.disposes {
                    store.remove(*id);
                }
            }
            if !request.is_async {
                if let Some(e) = failure {
                    self.sync_errors.borrow_mut().insert(request_index, e);
                }
            }
        }
        result
    }

    fn process(&self, request_index: u64, response: &TransportResponse) -> Result<()> {
        let verify = self.config.borrow().verify_digest;
        if verify {
            if let Some(expected) = response.headers.get(HEADER_DIGEST) {
                if !verify_digest(&response.content, expected) {
                    return Err(Error::DigestMismatch(request_index));
                }
            }
        }
        if let Some(session_id) = response.headers.get(HEADER_SESSION_ID) {
            self.adopt_session_id(session_id);
        }
        self.stats.borrow_mut().bytes_received += response.content.len() as u64;

        let commands = decode_response_body(&response.content)?;
        debug!("Applying response {} ({} command(s))", request_index, commands.len());

        // ids are remapped before anything else in the response can refer to them
        for command in commands.iter().filter(|c| c.kind == InboundKind::MapClientId) {
            let data: MapClientIdData = command.data_as()?;
            self.promote(data.client_id, data.server_id)?;
        }

        for command in &commands {
            match self.apply_command(request_index, command) {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!("Failed to apply {:?} command: {}", command.kind, e);
                    self.record_exception(e, request_index);
                }
            }
        }
        Ok(())
    }

    fn apply_command(&self, request_index: u64, command: &InboundCommand) -> Result<()> {
        match command.kind {
            InboundKind::Bootstrap => {
                let data: BootstrapData = command.data_as()?;
                if let Some(session_id) = &data.session_id {
                    self.adopt_session_id(session_id);
                }
                let obj = self.decode_object(&data.bootstrap)?;
                *self.bootstrap.borrow_mut() = Some(obj.clone());
                let pending = self.bootstrap_call.borrow_mut().take();
                if let Some(async_id) = data.async_id.or(pending.map(|(id, _)| id)) {
                    self.resolve_call(async_id, Ok(Value::Object(obj)));
                }
            }
            InboundKind::Return => {
                let data: ReturnData = command.data_as()?;
                let container = self.calls.borrow().get(data.async_id).map(|c| c.return_container);
                let Some(container) = container else {
                    warn!("Return for unknown async id {}", data.async_id);
                    return Ok(());
                };
                let value = wrap_container(self.decode(&data.result)?, container)?;
                self.resolve_call(data.async_id, Ok(value));
            }
            InboundKind::Exception => {
                let data: ExceptionData = command.data_as()?;
                let error = Error::Server {
                    class: data.exception_class.unwrap_or_default(),
                    message: data.message,
                };
                warn!("Server exception in response {}: {}", request_index, error);
                if let Some(async_id) = data.async_id {
                    self.resolve_call(async_id, Err(error.clone()));
                }
                self.record_exception(error, request_index);
            }
            InboundKind::MapClientId => {
                if !command.object.is_null() {
                    self.decode(&command.object)?;
                }
            }
            InboundKind::Restore => {
                let obj = self.decode_object(&command.object)?;
                let name = command_name(command)?;
                let data: RestoreData = command.data_as()?;
                let old_value = self.decode(&data.old_value)?;
                obj.apply_server_value(name, old_value)?;
                let error = Error::PropertyRejected {
                    property: name.to_string(),
                    class: obj.class_name().to_string(),
                    message: data.message,
                };
                warn!("{}", error);
                self.record_exception(error, request_index);
            }
            InboundKind::Set => {
                let obj = self.decode_object(&command.object)?;
                let name = command_name(command)?;
                let value = self.decode(&command.data)?;
                obj.apply_server_value(name, value)?;
            }
            InboundKind::Expire => {
                let obj = self.decode_object(&command.object)?;
                obj.expire_cached(command_name(command)?);
            }
            InboundKind::EditArray => self.apply_edit_array(command)?,
            InboundKind::Define | InboundKind::LoadType => {
                let wire = if command.object.is_null() { &command.data } else { &command.object };
                let class_ref = ClassRef::deserialize(wire)?;
                self.registry.borrow_mut().resolve_or_create(&class_ref)?;
            }
            InboundKind::Fire => {
                let obj = self.decode_object(&command.object)?;
                let name = command_name(command)?;
                let data = self.decode(&command.data)?;
                obj.fire_event(&ProxyEvent::new(name, data));
            }
            InboundKind::Unknown => {
                warn!("Ignoring unrecognized command in response {}", request_index);
            }
        }
        Ok(())
    }

    fn apply_edit_array(&self, command: &InboundCommand) -> Result<()> {
        let owner = self.decode_object(&command.object)?;
        let container = match &command.name {
            Some(name) => owner
                .peek(name)
                .ok_or_else(|| Error::Protocol(format!("{:?} has no value for {}", owner, name)))?,
            None => owner
                .collection()
                .cloned()
                .ok_or_else(|| Error::Protocol(format!("{:?} is not a collection", owner)))?,
        };
        let edits = parse_edit_array_data(&command.data)?;

        let _guard = self.server_write(&owner, command.name.as_deref());
        for edit in edits {
            match &container {
                Value::List(list) => {
                    for removed in &edit.removed {
                        let value = self.decode(removed)?;
                        if !list.remove(&value) {
                            warn!("Server removed {:?} which is not in {:?}", value, owner);
                        }
                    }
                    for added in &edit.added {
                        list.push(self.decode(added)?);
                    }
                }
                Value::Map(map) => {
                    for removed in &edit.removed {
                        map.remove(&self.decode(removed)?);
                    }
                    for entry in &edit.put {
                        map.put(self.decode(&entry.key)?, self.decode(&entry.value)?);
                    }
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "Cannot apply collection edits to a {}",
                        other.type_name()
                    )))
                }
            }
        }
        Ok(())
    }

    fn resolve_call(&self, async_id: u64, outcome: CallResult) {
        let call = self.calls.borrow_mut().take(async_id);
        if let Some(call) = call {
            call.completion.settle(outcome);
        }
    }

    fn promote(&self, client_id: i64, server_id: i64) -> Result<()> {
        let obj = self.store.borrow_mut().promote(client_id, server_id)?;
        debug!("Client object {} is server object {}", client_id, server_id);
        obj.fire_event(&ProxyEvent::change(
            CHANGE_SERVER_ID_EVENT,
            Value::Int(server_id),
            Value::Int(client_id),
        ));
        if obj.is_disposed() {
            self.flush_scheduled.set(true);
        }
        Ok(())
    }

    fn adopt_session_id(&self, session_id: &str) {
        let mut current = self.session_id.borrow_mut();
        if current.as_deref() != Some(session_id) {
            debug!("Session id is now {}", session_id);
            *current = Some(session_id.to_string());
        }
    }

    fn on_transport_failure(&self, request_index: u64, error: Error) {
        warn!("Request {} failed: {}", request_index, error);
        self.request_errors.borrow_mut().insert(request_index, error.clone());
        let event = SessionEvent::new(SessionEventKind::IoError, Some(error.clone()), Some(request_index));
        self.listeners.fire(&event);
        if !event.is_default_prevented() {
            self.raise(error, Some(request_index));
        }
    }

    fn record_exception(&self, error: Error, request_index: u64) {
        self.request_errors
            .borrow_mut()
            .insert(request_index, error.clone());
        self.raise(error, Some(request_index));
    }

    /// Publishes on the session exception channel
    fn raise(&self, error: Error, request_index: Option<u64>) {
        *self.exception.borrow_mut() = Some(error.clone());
        self.listeners.fire(&SessionEvent::new(
            SessionEventKind::Exception,
            Some(error),
            request_index,
        ));
    }

    fn after_responses(&self) {
        self.last_activity.set(Instant::now());
        if self.queue.borrow().has_deferred_calls() {
            self.flush_scheduled.set(true);
        }
        if !self.sequencer.borrow().is_idle() {
            return;
        }
        self.listeners
            .fire(&SessionEvent::new(SessionEventKind::RequestsComplete, None, None));
        let shutdown = self.shutdown.borrow().clone();
        if let Some(promise) = shutdown {
            self.finish_shutdown(&promise);
        }
    }
}

fn command_name(command: &InboundCommand) -> Result<&str> {
    command
        .name
        .as_deref()
        .ok_or_else(|| Error::Protocol(format!("{:?} command without a property or event name", command.kind)))
}
