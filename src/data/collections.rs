//! Observable containers used as the values of wrapped array and map
//! properties. Every mutation that changes content is reported to the
//! container's watchers after the change has been made.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::data::{ListenerId, Watchers};
use crate::Value;

static NEXT_CONTAINER_ID: AtomicU64 = AtomicU64::new(1);

fn next_container_id() -> u64 {
    NEXT_CONTAINER_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ListChange {
    pub added: Vec<Value>,
    pub removed: Vec<Value>,
}

impl ListChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

struct ListInner {
    id: u64,
    items: RefCell<Vec<Value>>,
    watchers: Watchers<ListChange>,
}

/// Observable list; clones share the same storage.
#[derive(Clone)]
pub struct ProxyList(Rc<ListInner>);

impl Default for ProxyList {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyList {
    pub fn new() -> Self {
        Self::from_vec(Vec::new())
    }

    pub fn from_vec(items: Vec<Value>) -> Self {
        ProxyList(Rc::new(ListInner {
            id: next_container_id(),
            items: RefCell::new(items),
            watchers: Watchers::new(),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn ptr_eq(&self, other: &ProxyList) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn len(&self) -> usize {
        self.0.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.items.borrow().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.0.items.borrow().get(index).cloned()
    }

    pub fn to_vec(&self) -> Vec<Value> {
        self.0.items.borrow().clone()
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.0.items.borrow().iter().any(|v| v == value)
    }

    pub fn index_of(&self, value: &Value) -> Option<usize> {
        self.0.items.borrow().iter().position(|v| v == value)
    }

    pub fn watch(&self, callback: impl Fn(&ListChange) + 'static) -> ListenerId {
        self.0.watchers.add(callback)
    }

    pub fn unwatch(&self, id: ListenerId) -> bool {
        self.0.watchers.remove(id)
    }

    pub fn push(&self, value: Value) {
        self.0.items.borrow_mut().push(value.clone());
        self.notify(ListChange {
            added: vec![value],
            removed: Vec::new(),
        });
    }

    pub fn insert(&self, index: usize, value: Value) {
        {
            let mut items = self.0.items.borrow_mut();
            let index = index.min(items.len());
            items.insert(index, value.clone());
        }
        self.notify(ListChange {
            added: vec![value],
            removed: Vec::new(),
        });
    }

    /// Removes the first occurrence of `value`.
    pub fn remove(&self, value: &Value) -> bool {
        let removed = {
            let mut items = self.0.items.borrow_mut();
            match items.iter().position(|v| v == value) {
                Some(pos) => Some(items.remove(pos)),
                None => None,
            }
        };
        match removed {
            Some(removed) => {
                self.notify(ListChange {
                    added: Vec::new(),
                    removed: vec![removed],
                });
                true
            }
            None => false,
        }
    }

    pub fn remove_at(&self, index: usize) -> Option<Value> {
        let removed = {
            let mut items = self.0.items.borrow_mut();
            if index < items.len() {
                Some(items.remove(index))
            } else {
                None
            }
        };
        if let Some(removed) = &removed {
            self.notify(ListChange {
                added: Vec::new(),
                removed: vec![removed.clone()],
            });
        }
        removed
    }

    /// Replaces the item at `index`, returning the previous item.
    pub fn set_item(&self, index: usize, value: Value) -> Option<Value> {
        let old = {
            let mut items = self.0.items.borrow_mut();
            match items.get_mut(index) {
                Some(slot) => Some(std::mem::replace(slot, value.clone())),
                None => None,
            }
        };
        if let Some(old) = &old {
            if *old != value {
                self.notify(ListChange {
                    added: vec![value],
                    removed: vec![old.clone()],
                });
            }
        }
        old
    }

    pub fn clear(&self) {
        let removed = std::mem::take(&mut *self.0.items.borrow_mut());
        self.notify(ListChange {
            added: Vec::new(),
            removed,
        });
    }

    /// Replaces the whole content, reporting only the items that actually
    /// came or went.
    pub fn replace_all(&self, items: Vec<Value>) {
        let old = std::mem::replace(&mut *self.0.items.borrow_mut(), items.clone());
        let mut unmatched_old = old;
        let mut added = Vec::new();
        for item in items {
            match unmatched_old.iter().position(|v| *v == item) {
                Some(pos) => {
                    unmatched_old.remove(pos);
                }
                None => added.push(item),
            }
        }
        self.notify(ListChange {
            added,
            removed: unmatched_old,
        });
    }

    fn notify(&self, change: ListChange) {
        if !change.is_empty() {
            self.0.watchers.fire(&change);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapChangeKind {
    Put,
    Remove,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapEntryChange {
    pub key: Value,
    pub value: Value,
    pub old_value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapChange {
    pub kind: MapChangeKind,
    pub entries: Vec<MapEntryChange>,
}

struct MapInner {
    id: u64,
    entries: RefCell<Vec<(Value, Value)>>,
    watchers: Watchers<MapChange>,
}

/// Observable map with arbitrary keys. Insertion order is kept.
#[derive(Clone)]
pub struct ProxyMap(Rc<MapInner>);

impl Default for ProxyMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyMap {
    pub fn new() -> Self {
        Self::from_entries(Vec::new())
    }

    pub fn from_entries(entries: Vec<(Value, Value)>) -> Self {
        let map = ProxyMap(Rc::new(MapInner {
            id: next_container_id(),
            entries: RefCell::new(Vec::with_capacity(entries.len())),
            watchers: Watchers::new(),
        }));
        {
            let mut slots = map.0.entries.borrow_mut();
            for (key, value) in entries {
                match slots.iter_mut().find(|(k, _)| *k == key) {
                    Some(slot) => slot.1 = value,
                    None => slots.push((key, value)),
                }
            }
        }
        map
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn ptr_eq(&self, other: &ProxyMap) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn len(&self) -> usize {
        self.0.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.entries.borrow().is_empty()
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        self.0
            .entries
            .borrow()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    pub fn contains_key(&self, key: &Value) -> bool {
        self.0.entries.borrow().iter().any(|(k, _)| k == key)
    }

    pub fn keys(&self) -> Vec<Value> {
        self.0.entries.borrow().iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.0.entries.borrow().iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn entries(&self) -> Vec<(Value, Value)> {
        self.0.entries.borrow().clone()
    }

    pub fn watch(&self, callback: impl Fn(&MapChange) + 'static) -> ListenerId {
        self.0.watchers.add(callback)
    }

    pub fn unwatch(&self, id: ListenerId) -> bool {
        self.0.watchers.remove(id)
    }

    /// Stores `value` under `key` and returns the previous value. Fires a
    /// single `Put` change, and nothing when the value is unchanged.
    pub fn put(&self, key: Value, value: Value) -> Option<Value> {
        let old = self.store(key.clone(), value.clone());
        if old.as_ref() != Some(&value) {
            self.notify(MapChange {
                kind: MapChangeKind::Put,
                entries: vec![MapEntryChange {
                    key,
                    value,
                    old_value: old.clone(),
                }],
            });
        }
        old
    }

    pub fn put_all(&self, entries: Vec<(Value, Value)>) {
        let mut changes = Vec::new();
        for (key, value) in entries {
            let old = self.store(key.clone(), value.clone());
            if old.as_ref() != Some(&value) {
                changes.push(MapEntryChange {
                    key,
                    value,
                    old_value: old,
                });
            }
        }
        self.notify(MapChange {
            kind: MapChangeKind::Put,
            entries: changes,
        });
    }

    pub fn remove(&self, key: &Value) -> Option<Value> {
        let removed = {
            let mut entries = self.0.entries.borrow_mut();
            match entries.iter().position(|(k, _)| k == key) {
                Some(pos) => Some(entries.remove(pos)),
                None => None,
            }
        };
        removed.map(|(key, value)| {
            self.notify(MapChange {
                kind: MapChangeKind::Remove,
                entries: vec![MapEntryChange {
                    key,
                    value: value.clone(),
                    old_value: None,
                }],
            });
            value
        })
    }

    pub fn clear(&self) {
        let removed = std::mem::take(&mut *self.0.entries.borrow_mut());
        self.notify(MapChange {
            kind: MapChangeKind::Remove,
            entries: removed
                .into_iter()
                .map(|(key, value)| MapEntryChange {
                    key,
                    value,
                    old_value: None,
                })
                .collect(),
        });
    }

    /// Replaces the whole content. Keys that vanish are reported in one
    /// `Remove` change, new or changed keys in one `Put` change; untouched
    /// entries produce nothing.
    pub fn replace(&self, entries: Vec<(Value, Value)>) {
        let incoming = ProxyMap::from_entries(entries).entries();
        let vanished: Vec<(Value, Value)> = {
            let mut current = self.0.entries.borrow_mut();
            let (kept, vanished): (Vec<_>, Vec<_>) = current
                .drain(..)
                .partition(|(k, _)| incoming.iter().any(|(ik, _)| ik == k));
            *current = kept;
            vanished
        };
        self.notify(MapChange {
            kind: MapChangeKind::Remove,
            entries: vanished
                .into_iter()
                .map(|(key, value)| MapEntryChange {
                    key,
                    value,
                    old_value: None,
                })
                .collect(),
        });
        self.put_all(incoming);
    }

    fn store(&self, key: Value, value: Value) -> Option<Value> {
        let mut entries = self.0.entries.borrow_mut();
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => Some(std::mem::replace(&mut slot.1, value)),
            None => {
                entries.push((key, value));
                None
            }
        }
    }

    fn notify(&self, change: MapChange) {
        if !change.entries.is_empty() {
            self.0.watchers.fire(&change);
        }
    }
}
