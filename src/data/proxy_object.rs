use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use ahash::AHashMap;
use log::{error, warn};

use crate::data::session::{CallSpec, CollectionChange, SessionInner};
use crate::data::{
    now, CallResult, ClassDescriptor, ContainerKind, EventListeners, ListenerId, Member, Notify,
    Promise, PropertyDescriptor, ProxyEvent, ProxyList, ProxyMap,
};
use crate::protocol::{CallTarget, OutboundCommand};
use crate::{Error, Result, Value};

/// Event fired when a client-created object receives its server id
pub const CHANGE_SERVER_ID_EVENT: &str = "changeServerId";

pub(crate) struct ProxyInstance {
    class: Rc<ClassDescriptor>,
    id: Cell<i64>,
    sent_to_server: Cell<bool>,
    disposed: Cell<bool>,
    values: RefCell<AHashMap<String, Value>>,
    on_demand: RefCell<AHashMap<String, Value>>,
    fetching: RefCell<AHashMap<String, Promise>>,
    cached_results: RefCell<AHashMap<String, Value>>,
    constructor_args: Vec<Value>,
    listeners: EventListeners,
    container_watches: RefCell<AHashMap<String, (Value, ListenerId)>>,
    collection: Option<Value>,
    session: Weak<SessionInner>,
}

/// Client-side stand-in for a server object.
///
/// Clones are handles to the same instance; equality is identity.
#[derive(Clone)]
pub struct ProxyObject(Rc<ProxyInstance>);

impl std::fmt::Debug for ProxyObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ProxyObject({}#{})", self.0.class.class_name, self.0.id.get())
    }
}

impl PartialEq for ProxyObject {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl ProxyObject {
    pub(crate) fn new(class: Rc<ClassDescriptor>, session: Weak<SessionInner>, constructor_args: Vec<Value>) -> Self {
        let collection = match class.collection_kind() {
            ContainerKind::WrappedList => Some(Value::List(ProxyList::new())),
            ContainerKind::WrappedMap => Some(Value::Map(ProxyMap::new())),
            _ => None,
        };
        ProxyObject(Rc::new(ProxyInstance {
            class,
            id: Cell::new(0),
            sent_to_server: Cell::new(false),
            disposed: Cell::new(false),
            values: RefCell::new(AHashMap::new()),
            on_demand: RefCell::new(AHashMap::new()),
            fetching: RefCell::new(AHashMap::new()),
            cached_results: RefCell::new(AHashMap::new()),
            constructor_args,
            listeners: EventListeners::default(),
            container_watches: RefCell::new(AHashMap::new()),
            collection,
            session,
        }))
    }

    pub fn ptr_eq(&self, other: &ProxyObject) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    /// Current id: positive once known to the server, negative while pending
    pub fn id(&self) -> i64 {
        self.0.id.get()
    }

    /// The server-assigned id, if the server has acknowledged this object
    pub fn server_id(&self) -> Option<i64> {
        let id = self.0.id.get();
        (id > 0).then_some(id)
    }

    pub fn is_pending(&self) -> bool {
        self.0.id.get() < 0
    }

    pub fn is_disposed(&self) -> bool {
        self.0.disposed.get()
    }

    pub(crate) fn is_sent(&self) -> bool {
        self.0.sent_to_server.get()
    }

    pub(crate) fn mark_sent(&self) {
        self.0.sent_to_server.set(true);
    }

    pub(crate) fn assign_id(&self, id: i64) {
        self.0.id.set(id);
    }

    pub fn class(&self) -> &Rc<ClassDescriptor> {
        &self.0.class
    }

    pub fn class_name(&self) -> &str {
        &self.0.class.class_name
    }

    pub fn constructor_args(&self) -> &[Value] {
        &self.0.constructor_args
    }

    /// The container of a collection-backed object
    pub fn collection(&self) -> Option<&Value> {
        self.0.collection.as_ref()
    }

    fn session(&self) -> Result<Rc<SessionInner>> {
        self.0.session.upgrade().ok_or(Error::SessionGone)
    }

    fn property(&self, name: &str) -> Result<Rc<PropertyDescriptor>> {
        self.0.class.property(name).cloned().ok_or_else(|| Error::UnknownProperty {
            class: self.class_name().to_string(),
            property: name.to_string(),
        })
    }

    /// Value currently held locally, without fetching anything
    pub fn peek(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.0.values.borrow().get(name) {
            return Some(v.clone());
        }
        self.0.on_demand.borrow().get(name).cloned()
    }

    pub fn cached_result(&self, method: &str) -> Option<Value> {
        self.0.cached_results.borrow().get(method).cloned()
    }

    pub(crate) fn cache_result(&self, method: &str, value: Value) {
        self.0.cached_results.borrow_mut().insert(method.to_string(), value);
    }

    /// Reads a property. On-demand properties are fetched from the server on
    /// first read, blocking until the value arrives.
    pub fn get(&self, name: &str) -> Result<Value> {
        let prop = self.property(name)?;
        if !prop.on_demand {
            return Ok(self.0.values.borrow().get(name).cloned().unwrap_or(Value::Null));
        }
        if let Some(v) = self.0.on_demand.borrow().get(name) {
            return Ok(v.clone());
        }
        let session = self.session()?;
        let outstanding = self.0.fetching.borrow().get(name).cloned();
        if let Some(fetch) = outstanding {
            return session.wait_for_fetch(&fetch);
        }
        let value = session.call(CallSpec {
            target: CallTarget::Object(self.id()),
            method_name: prop.server_getter(),
            return_container: prop.container,
            args: Vec::new(),
            promise: None,
            on_result: None,
        })?;
        self.apply_server_value(name, value)
    }

    /// Asynchronous read. Concurrent fetches of the same on-demand property
    /// share one request.
    pub fn get_async(&self, name: &str) -> Promise {
        let prop = match self.property(name) {
            Ok(p) => p,
            Err(e) => return Promise::rejected(e),
        };
        if !prop.on_demand {
            return Promise::resolved(self.peek(name).unwrap_or(Value::Null));
        }
        let cached = self.0.on_demand.borrow().get(name).cloned();
        if let Some(v) = cached {
            return Promise::resolved(v);
        }
        let outstanding = self.0.fetching.borrow().get(name).cloned();
        if let Some(fetch) = outstanding {
            return fetch;
        }
        let session = match self.session() {
            Ok(s) => s,
            Err(e) => return Promise::rejected(e),
        };

        let result = Promise::new();
        self.0.fetching.borrow_mut().insert(name.to_string(), result.clone());

        let fetch = Promise::new();
        let weak = Rc::downgrade(&self.0);
        let prop_name = name.to_string();
        let settle_to = result.clone();
        fetch.then(move |outcome| {
            let Some(inner) = weak.upgrade() else {
                settle_to.settle(outcome.clone());
                return;
            };
            let obj = ProxyObject(inner);
            obj.0.fetching.borrow_mut().remove(&prop_name);
            let stored = match outcome {
                Ok(v) => obj.apply_server_value(&prop_name, v.clone()),
                Err(e) => Err(e.clone()),
            };
            settle_to.settle(stored);
        });

        let issued = session.call(CallSpec {
            target: CallTarget::Object(self.id()),
            method_name: prop.server_getter(),
            return_container: prop.container,
            args: Vec::new(),
            promise: Some(fetch),
            on_result: None,
        });
        if let Err(e) = issued {
            self.0.fetching.borrow_mut().remove(name);
            result.settle(Err(e));
        }
        result
    }

    /// Writes a property locally and synchronises it with the server,
    /// immediately or with the next flush depending on the property.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        let prop = self.property(name)?;
        let session = self.session()?;
        let from_server = session.is_server_write(self, name);
        if prop.read_only && !from_server {
            return Err(Error::ReadOnlyProperty {
                class: self.class_name().to_string(),
                property: name.to_string(),
            });
        }
        let value = self.store_value(&prop, value.into(), from_server)?;
        if from_server || (self.is_pending() && !self.is_sent()) {
            return Ok(());
        }
        session.sync_property(self, &prop, &value)
    }

    /// Drops the cached value of an on-demand property, optionally telling
    /// the server to expire its copy too.
    pub fn expire(&self, name: &str, notify_server: bool) -> Result<()> {
        let prop = self.property(name)?;
        if !prop.on_demand {
            return Err(Error::UnknownProperty {
                class: self.class_name().to_string(),
                property: format!("{} (not on-demand)", name),
            });
        }
        self.expire_cached(name);
        if notify_server {
            self.session()?.queue_command(OutboundCommand::Expire {
                server_id: self.id(),
                property_name: name.to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn expire_cached(&self, name: &str) {
        let removed = self.0.on_demand.borrow_mut().remove(name);
        self.unwatch_container(name);
        if removed.is_none() && self.0.class.property(name).is_none() {
            warn!("Expire for unknown property {} on {}", name, self.class_name());
        }
    }

    /// Calls a server method and blocks for its result. If any argument is a
    /// `Notify`, the call goes out asynchronously instead and `Null` is
    /// returned straight away.
    pub fn invoke(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        self.invoke_with(name, args, None)
    }

    pub fn invoke_async(&self, name: &str, args: Vec<Value>) -> Promise {
        let promise = Promise::new();
        if let Err(e) = self.invoke_with(name, args, Some(promise.clone())) {
            promise.settle(Err(e));
        }
        promise
    }

    fn invoke_with(&self, name: &str, args: Vec<Value>, promise: Option<Promise>) -> Result<Value> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        let method = self.0.class.method(name).cloned().ok_or_else(|| Error::UnknownMethod {
            class: self.class_name().to_string(),
            method: name.to_string(),
        })?;

        if method.caches_result {
            if let Some(cached) = self.cached_result(name) {
                let outcome: CallResult = Ok(cached.clone());
                for arg in &args {
                    if let Value::Notify(n) = arg {
                        n.deliver(&outcome);
                    }
                }
                if let Some(p) = promise {
                    p.settle(outcome);
                }
                return Ok(cached);
            }
        }

        let on_result: Option<Box<dyn FnOnce(&CallResult)>> = if method.caches_result {
            let weak = Rc::downgrade(&self.0);
            let method_name = name.to_string();
            Some(Box::new(move |outcome: &CallResult| {
                if let (Some(inner), Ok(v)) = (weak.upgrade(), outcome) {
                    ProxyObject(inner).cache_result(&method_name, v.clone());
                }
            }))
        } else {
            None
        };

        let target = if method.is_static {
            CallTarget::Class(self.class_name().to_string())
        } else {
            CallTarget::Object(self.id())
        };
        self.session()?.call(CallSpec {
            target,
            method_name: method.name.clone(),
            return_container: method.return_container,
            args,
            promise,
            on_result,
        })
    }

    /// Routes a synthesized member name (`getX`, `setX`, `getXAsync`,
    /// `expireX` or a method name) through the class dispatch table.
    pub fn call(&self, member: &str, mut args: Vec<Value>) -> Result<Value> {
        let entry = self.0.class.member(member).cloned().ok_or_else(|| Error::UnknownMethod {
            class: self.class_name().to_string(),
            method: member.to_string(),
        })?;
        match entry {
            Member::Get(prop) => self.get(&prop.name),
            Member::GetAsync(prop) => {
                let promise = self.get_async(&prop.name);
                let notify = args.into_iter().find_map(|a| match a {
                    Value::Notify(n) => Some(n),
                    _ => None,
                });
                if let Some(n) = notify {
                    promise.then(move |r| n.deliver(r));
                }
                Ok(Value::Notify(Notify::Promise(promise)))
            }
            Member::Set(prop) => {
                let value = if args.is_empty() { Value::Null } else { args.swap_remove(0) };
                self.set(&prop.name, value).map(|_| Value::Null)
            }
            Member::Expire(prop) => {
                let notify_server = args.first().and_then(Value::as_bool).unwrap_or(false);
                self.expire(&prop.name, notify_server).map(|_| Value::Null)
            }
            Member::Invoke(method) => self.invoke(&method.name, args),
        }
    }

    /// Registers a listener. The first listener for a server-sourced event
    /// subscribes this object to it on the server.
    pub fn add_listener(&self, event: &str, callback: impl Fn(&ProxyEvent) + 'static) -> Result<ListenerId> {
        let server_sourced = self.check_event(event)?;
        let first = self.0.listeners.count(event) == 0;
        let id = self.0.listeners.add(event, callback);
        if first && server_sourced && !self.is_disposed() {
            self.session()?.queue_command(OutboundCommand::Listen {
                server_id: self.id(),
                event_name: event.to_string(),
            });
        }
        Ok(id)
    }

    pub fn remove_listener(&self, event: &str, id: ListenerId) -> Result<bool> {
        let server_sourced = self.check_event(event)?;
        let removed = self.0.listeners.remove(event, id);
        if removed && server_sourced && self.0.listeners.count(event) == 0 && !self.is_disposed() {
            self.session()?.queue_command(OutboundCommand::Unlisten {
                server_id: self.id(),
                event_name: event.to_string(),
            });
        }
        Ok(removed)
    }

    /// Ok(true) for events the server must be told about
    fn check_event(&self, event: &str) -> Result<bool> {
        let class = &self.0.class;
        let is_change_event = event == CHANGE_SERVER_ID_EVENT
            || class.all_properties().iter().any(|p| p.change_event == event);
        if is_change_event {
            return Ok(false);
        }
        match class.event(event) {
            Some(e) => Ok(!e.is_property),
            None => Err(Error::UnknownEvent {
                class: class.class_name.clone(),
                event: event.to_string(),
            }),
        }
    }

    pub(crate) fn fire_event(&self, event: &ProxyEvent) {
        self.0.listeners.fire(event);
    }

    /// Marks the object disposed and arranges for the server to forget it.
    pub fn dispose(&self) -> Result<()> {
        if self.0.disposed.replace(true) {
            return Ok(());
        }
        let names: Vec<String> = self.0.container_watches.borrow().keys().cloned().collect();
        for name in names {
            self.unwatch_container(&name);
        }
        self.session()?.dispose_object(self);
        Ok(())
    }

    /// Applies a value that came from the server: no outbound `set` is
    /// generated and read-only properties are writable.
    pub(crate) fn apply_server_value(&self, name: &str, value: Value) -> Result<Value> {
        let prop = self.property(name)?;
        let session = self.session()?;
        let _guard = session.server_write(self, Some(name));
        self.store_value(&prop, value, true)
    }

    /// Initial values for properties the server or application did not supply
    pub(crate) fn init_defaults(&self) {
        for prop in self.0.class.all_properties() {
            if prop.on_demand || self.0.values.borrow().contains_key(&prop.name) {
                continue;
            }
            let value = match prop.container {
                ContainerKind::WrappedList => Value::List(ProxyList::new()),
                ContainerKind::WrappedMap => Value::Map(ProxyMap::new()),
                ContainerKind::NativeArray if !prop.nullable => Value::Array(Vec::new()),
                ContainerKind::NativeArray => continue,
                ContainerKind::None if prop.nullable => continue,
                ContainerKind::None => match prop.check.as_deref() {
                    Some("Boolean") => Value::Bool(false),
                    Some("Integer") => Value::Int(0),
                    Some("Number") => Value::Float(0.0),
                    Some("String") => Value::from_string(""),
                    Some("Date") => Value::Date(now()),
                    _ => continue,
                },
            };
            self.watch_container(&prop.name, &value);
            self.0.values.borrow_mut().insert(prop.name.clone(), value);
        }
    }

    /// True if `value` is what `init_defaults` would have produced
    pub(crate) fn is_default_value(prop: &PropertyDescriptor, value: &Value) -> bool {
        match value {
            Value::Null => true,
            Value::List(l) => l.is_empty(),
            Value::Map(m) => m.is_empty(),
            Value::Array(a) => a.is_empty() && prop.container == ContainerKind::NativeArray,
            Value::Bool(false) => prop.check.as_deref() == Some("Boolean"),
            Value::Int(0) => matches!(prop.check.as_deref(), Some("Integer") | Some("Number")),
            Value::Float(f) => *f == 0.0 && matches!(prop.check.as_deref(), Some("Integer") | Some("Number")),
            Value::String(s) => s.as_str().is_empty() && prop.check.as_deref() == Some("String"),
            _ => false,
        }
    }

    fn store_value(&self, prop: &PropertyDescriptor, value: Value, from_server: bool) -> Result<Value> {
        let current = self.peek(&prop.name);
        let value = match prop.container {
            ContainerKind::WrappedList => match value {
                Value::Array(items) => match &current {
                    Some(Value::List(existing)) if from_server => {
                        existing.replace_all(items);
                        return Ok(Value::List(existing.clone()));
                    }
                    _ => Value::List(ProxyList::from_vec(items)),
                },
                v @ (Value::List(_) | Value::Null) => v,
                other => return Err(Error::BadValueCast(other.type_name().to_string(), "List".to_string())),
            },
            ContainerKind::WrappedMap => match value {
                v @ (Value::Map(_) | Value::Null) => v,
                other => {
                    let entries = match other {
                        Value::Record(fields) => fields
                            .into_iter()
                            .map(|(k, v)| (Value::from_string(k), v))
                            .collect::<Vec<_>>(),
                        Value::Array(items) => map_entries_from_array(items)?,
                        other => {
                            return Err(Error::BadValueCast(other.type_name().to_string(), "Map".to_string()))
                        }
                    };
                    match &current {
                        Some(Value::Map(existing)) if from_server => {
                            existing.replace(entries);
                            return Ok(Value::Map(existing.clone()));
                        }
                        _ => Value::Map(ProxyMap::from_entries(entries)),
                    }
                }
            },
            _ => value,
        };
        if value.is_notify() {
            return Err(Error::BadValueCast("Notify".to_string(), prop.name.clone()));
        }

        let old = {
            let mut target = if prop.on_demand {
                self.0.on_demand.borrow_mut()
            } else {
                self.0.values.borrow_mut()
            };
            target.insert(prop.name.clone(), value.clone())
        }
        .unwrap_or(Value::Null);

        if old != value {
            if prop.container.is_wrapped() {
                self.unwatch_container(&prop.name);
                self.watch_container(&prop.name, &value);
            }
            self.fire_event(&ProxyEvent::change(prop.change_event.clone(), value.clone(), old));
        }
        Ok(value)
    }

    fn watch_container(&self, name: &str, container: &Value) {
        let weak = Rc::downgrade(&self.0);
        let prop_name = name.to_string();
        let id = match container {
            Value::List(list) => list.watch(move |change| {
                if let Some(inner) = weak.upgrade() {
                    ProxyObject(inner).on_container_changed(&prop_name, CollectionChange::List(change));
                }
            }),
            Value::Map(map) => map.watch(move |change| {
                if let Some(inner) = weak.upgrade() {
                    ProxyObject(inner).on_container_changed(&prop_name, CollectionChange::Map(change));
                }
            }),
            _ => return,
        };
        self.0
            .container_watches
            .borrow_mut()
            .insert(name.to_string(), (container.clone(), id));
    }

    fn unwatch_container(&self, name: &str) {
        let watch = self.0.container_watches.borrow_mut().remove(name);
        match watch {
            Some((Value::List(list), id)) => {
                list.unwatch(id);
            }
            Some((Value::Map(map), id)) => {
                map.unwatch(id);
            }
            _ => {}
        }
    }

    fn on_container_changed(&self, name: &str, change: CollectionChange<'_>) {
        match self.session() {
            Ok(session) => session.collection_changed(self, name, change),
            Err(e) => error!("Collection change on {} dropped: {}", self.class_name(), e),
        }
    }
}

/// `[{key, value}, ...]` as sent for maps with non-string keys
fn map_entries_from_array(items: Vec<Value>) -> Result<Vec<(Value, Value)>> {
    items
        .into_iter()
        .map(|item| match item {
            Value::Record(mut fields) => {
                let key = fields.remove("key").unwrap_or(Value::Null);
                let value = fields.remove("value").unwrap_or(Value::Null);
                Ok((key, value))
            }
            other => Err(Error::BadValueCast(other.type_name().to_string(), "Map entry".to_string())),
        })
        .collect()
}
