use std::cell::{Cell, RefCell};
use std::rc::Rc;

use ahash::AHashMap;

use crate::{Error, Value};

pub type ListenerId = u64;

/// A list of callbacks for one kind of notification.
///
/// Callbacks are cloned out before being invoked so a callback may add or
/// remove listeners on the same registry without a borrow conflict.
pub struct Watchers<T> {
    next_id: Cell<ListenerId>,
    entries: RefCell<Vec<(ListenerId, Rc<dyn Fn(&T)>)>>,
}

impl<T> Default for Watchers<T> {
    fn default() -> Self {
        Watchers {
            next_id: Cell::new(1),
            entries: RefCell::new(Vec::new()),
        }
    }
}

impl<T> Watchers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, callback: impl Fn(&T) + 'static) -> ListenerId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.entries.borrow_mut().push((id, Rc::new(callback)));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub fn fire(&self, event: &T) {
        let callbacks: Vec<Rc<dyn Fn(&T)>> = self
            .entries
            .borrow()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }
}

/// An event raised on a proxy object, either locally (property change) or
/// by the server (`fire`).
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyEvent {
    pub name: String,
    pub data: Value,
    pub old_data: Value,
}

impl ProxyEvent {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        ProxyEvent {
            name: name.into(),
            data,
            old_data: Value::Null,
        }
    }

    pub fn change(name: impl Into<String>, data: Value, old_data: Value) -> Self {
        ProxyEvent {
            name: name.into(),
            data,
            old_data,
        }
    }
}

/// Per-object listener table keyed by event name
#[derive(Default)]
pub struct EventListeners {
    by_name: RefCell<AHashMap<String, Rc<Watchers<ProxyEvent>>>>,
}

impl EventListeners {
    pub fn add(&self, name: &str, callback: impl Fn(&ProxyEvent) + 'static) -> ListenerId {
        let watchers = self
            .by_name
            .borrow_mut()
            .entry(name.to_string())
            .or_default()
            .clone();
        watchers.add(callback)
    }

    pub fn remove(&self, name: &str, id: ListenerId) -> bool {
        let watchers = self.by_name.borrow().get(name).cloned();
        watchers.map_or(false, |w| w.remove(id))
    }

    pub fn count(&self, name: &str) -> usize {
        self.by_name.borrow().get(name).map_or(0, |w| w.len())
    }

    pub fn fire(&self, event: &ProxyEvent) {
        let watchers = self.by_name.borrow().get(&event.name).cloned();
        if let Some(watchers) = watchers {
            watchers.fire(event);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEventKind {
    /// A server exception or escalated transport failure was recorded
    Exception,
    /// A request failed at the transport level; preventable
    IoError,
    /// No requests are in flight and nothing is buffered
    RequestsComplete,
    /// An outbound request is being assembled
    QueuePending,
    /// Shutdown finished draining in-flight requests
    Shutdown,
}

/// Notification on the session-wide channel.
#[derive(Debug)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub error: Option<Error>,
    pub request_index: Option<u64>,
    default_prevented: Cell<bool>,
}

impl SessionEvent {
    pub fn new(kind: SessionEventKind, error: Option<Error>, request_index: Option<u64>) -> Self {
        SessionEvent {
            kind,
            error,
            request_index,
            default_prevented: Cell::new(false),
        }
    }

    /// Suppresses escalation of an `IoError` to the exception channel.
    pub fn prevent_default(&self) {
        self.default_prevented.set(true);
    }

    pub fn is_default_prevented(&self) -> bool {
        self.default_prevented.get()
    }
}

/// Session-wide listeners, keyed by event kind
#[derive(Default)]
pub struct SessionListeners {
    by_kind: RefCell<AHashMap<SessionEventKind, Rc<Watchers<SessionEvent>>>>,
}

impl SessionListeners {
    pub fn add(&self, kind: SessionEventKind, callback: impl Fn(&SessionEvent) + 'static) -> ListenerId {
        let watchers = self.by_kind.borrow_mut().entry(kind).or_default().clone();
        watchers.add(callback)
    }

    pub fn remove(&self, kind: SessionEventKind, id: ListenerId) -> bool {
        let watchers = self.by_kind.borrow().get(&kind).cloned();
        watchers.map_or(false, |w| w.remove(id))
    }

    pub fn fire(&self, event: &SessionEvent) {
        let watchers = self.by_kind.borrow().get(&event.kind).cloned();
        if let Some(watchers) = watchers {
            watchers.fire(event);
        }
    }
}
