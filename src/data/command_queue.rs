use crate::data::{ListChange, MapChange, MapChangeKind, ProxyObject};
use crate::protocol::OutboundCommand;
use crate::Value;

/// Accumulated unflushed edits of one wrapped collection
#[derive(Debug, Clone, PartialEq)]
pub enum DirtyDelta {
    List {
        added: Vec<Value>,
        removed: Vec<Value>,
    },
    Map {
        /// `(key, value, key_was_new)`
        put: Vec<(Value, Value, bool)>,
        removed: Vec<Value>,
    },
}

impl DirtyDelta {
    pub fn is_empty(&self) -> bool {
        match self {
            DirtyDelta::List { added, removed } => added.is_empty() && removed.is_empty(),
            DirtyDelta::Map { put, removed } => put.is_empty() && removed.is_empty(),
        }
    }
}

pub struct DirtyCollection {
    pub owner: ProxyObject,
    pub property: String,
    /// The container itself (`Value::List` or `Value::Map`)
    pub container: Value,
    pub container_id: u64,
    pub delta: DirtyDelta,
}

/// Mutations waiting for the next flush.
///
/// Queued `set`s for the same object and property collapse to the last one,
/// and collection edits that undo each other cancel out before they are
/// ever encoded.
#[derive(Default)]
pub struct CommandQueue {
    commands: Vec<OutboundCommand>,
    deferred_calls: Vec<OutboundCommand>,
    dirty: Vec<DirtyCollection>,
    disposed: Vec<ProxyObject>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, command: OutboundCommand) {
        if let OutboundCommand::Set {
            server_id,
            property_name,
            ..
        } = &command
        {
            self.commands.retain(|queued| {
                !matches!(queued, OutboundCommand::Set { server_id: s, property_name: p, .. }
                    if s == server_id && p == property_name)
            });
        }
        self.commands.push(command);
    }

    /// Holds an asynchronous call until the requests in flight are done.
    pub fn defer_call(&mut self, command: OutboundCommand) {
        self.deferred_calls.push(command);
    }

    pub fn has_deferred_calls(&self) -> bool {
        !self.deferred_calls.is_empty()
    }

    pub fn take_deferred_calls(&mut self) -> Vec<OutboundCommand> {
        std::mem::take(&mut self.deferred_calls)
    }

    pub fn take_commands(&mut self) -> Vec<OutboundCommand> {
        std::mem::take(&mut self.commands)
    }

    /// The id is read at flush time, so an object promoted in the meantime
    /// is disposed under its server id.
    pub fn queue_dispose(&mut self, obj: &ProxyObject) {
        if !self.disposed.iter().any(|d| d.ptr_eq(obj)) {
            self.disposed.push(obj.clone());
        }
    }

    pub fn has_disposed(&self) -> bool {
        !self.disposed.is_empty()
    }

    pub fn take_disposed(&mut self) -> Vec<ProxyObject> {
        std::mem::take(&mut self.disposed)
    }

    /// Drops everything queued for an object that will never reach the server.
    pub fn forget_object(&mut self, id: i64) {
        self.commands.retain(|c| match c {
            OutboundCommand::Set { server_id, .. }
            | OutboundCommand::EditArray { server_id, .. }
            | OutboundCommand::Listen { server_id, .. }
            | OutboundCommand::Unlisten { server_id, .. }
            | OutboundCommand::Expire { server_id, .. } => *server_id != id,
            _ => true,
        });
        self.dirty.retain(|d| d.owner.id() != id);
        self.disposed.retain(|d| d.id() != id);
    }

    pub fn record_list_change(&mut self, owner: &ProxyObject, property: &str, container: &Value, change: &ListChange) {
        let entry = self.dirty_entry(owner, property, container, || DirtyDelta::List {
            added: Vec::new(),
            removed: Vec::new(),
        });
        if let DirtyDelta::List { added, removed } = &mut entry.delta {
            for item in &change.removed {
                match added.iter().position(|v| v == item) {
                    Some(pos) => {
                        added.remove(pos);
                    }
                    None => removed.push(item.clone()),
                }
            }
            for item in &change.added {
                match removed.iter().position(|v| v == item) {
                    Some(pos) => {
                        removed.remove(pos);
                    }
                    None => added.push(item.clone()),
                }
            }
        }
    }

    pub fn record_map_change(&mut self, owner: &ProxyObject, property: &str, container: &Value, change: &MapChange) {
        let entry = self.dirty_entry(owner, property, container, || DirtyDelta::Map {
            put: Vec::new(),
            removed: Vec::new(),
        });
        if let DirtyDelta::Map { put, removed } = &mut entry.delta {
            for e in &change.entries {
                match change.kind {
                    MapChangeKind::Put => {
                        let was_removed = match removed.iter().position(|k| *k == e.key) {
                            Some(pos) => {
                                removed.remove(pos);
                                true
                            }
                            None => false,
                        };
                        match put.iter_mut().find(|(k, _, _)| *k == e.key) {
                            Some(slot) => slot.1 = e.value.clone(),
                            None => put.push((e.key.clone(), e.value.clone(), e.old_value.is_none() && !was_removed)),
                        }
                    }
                    MapChangeKind::Remove => {
                        let was_new = match put.iter().position(|(k, _, _)| *k == e.key) {
                            Some(pos) => put.remove(pos).2,
                            None => false,
                        };
                        if !was_new && !removed.contains(&e.key) {
                            removed.push(e.key.clone());
                        }
                    }
                }
            }
        }
    }

    /// The whole container is about to be sent, so its delta is redundant.
    pub fn clear_dirty(&mut self, container_id: u64) {
        self.dirty.retain(|d| d.container_id != container_id);
    }

    pub fn is_dirty(&self, container_id: u64) -> bool {
        self.dirty
            .iter()
            .any(|d| d.container_id == container_id && !d.delta.is_empty())
    }

    /// Dirty collections with a non-empty delta
    pub fn take_dirty(&mut self) -> Vec<DirtyCollection> {
        std::mem::take(&mut self.dirty)
            .into_iter()
            .filter(|d| !d.delta.is_empty())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
            + self.deferred_calls.len()
            + self.dirty.iter().filter(|d| !d.delta.is_empty()).count()
            + usize::from(!self.disposed.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn dirty_entry(
        &mut self,
        owner: &ProxyObject,
        property: &str,
        container: &Value,
        empty: impl FnOnce() -> DirtyDelta,
    ) -> &mut DirtyCollection {
        let container_id = match container {
            Value::List(l) => l.id(),
            Value::Map(m) => m.id(),
            _ => 0,
        };
        let pos = match self.dirty.iter().position(|d| d.container_id == container_id) {
            Some(pos) => pos,
            None => {
                self.dirty.push(DirtyCollection {
                    owner: owner.clone(),
                    property: property.to_string(),
                    container: container.clone(),
                    container_id,
                    delta: empty(),
                });
                self.dirty.len() - 1
            }
        };
        &mut self.dirty[pos]
    }
}
