use ahash::{AHashMap, AHashSet};

use crate::data::ProxyObject;
use crate::{Error, Result};

/// Identity map from ids to live proxies.
///
/// Positive ids are assigned by the server. Negative ids are minted here for
/// objects created on the client, strictly decreasing and never reused;
/// once such an id is promoted or retired, looking it up is an error.
#[derive(Default)]
pub struct ObjectStore {
    by_server_id: AHashMap<i64, ProxyObject>,
    by_client_id: AHashMap<i64, ProxyObject>,
    retired: AHashSet<i64>,
    last_client_id: i64,
    unsent: Vec<i64>,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_server_id.len() + self.by_client_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_or_null(&self, id: i64) -> Result<Option<ProxyObject>> {
        if id < 0 {
            if self.retired.contains(&id) {
                return Err(Error::StaleClientId(id));
            }
            Ok(self.by_client_id.get(&id).cloned())
        } else {
            Ok(self.by_server_id.get(&id).cloned())
        }
    }

    pub fn register_server(&mut self, server_id: i64, obj: &ProxyObject) -> Result<()> {
        if server_id <= 0 {
            return Err(Error::Protocol(format!("Invalid server id {}", server_id)));
        }
        if self.by_server_id.contains_key(&server_id) {
            return Err(Error::Protocol(format!("Server id {} is already registered", server_id)));
        }
        self.by_server_id.insert(server_id, obj.clone());
        Ok(())
    }

    /// Mints the next negative id for `obj` and records it as awaiting its
    /// `new` announcement.
    pub fn register_pending(&mut self, obj: &ProxyObject) -> i64 {
        self.last_client_id -= 1;
        let id = self.last_client_id;
        obj.assign_id(id);
        self.by_client_id.insert(id, obj.clone());
        self.unsent.push(id);
        id
    }

    pub fn has_unsent(&self) -> bool {
        !self.unsent.is_empty()
    }

    /// Pending objects not yet announced, in creation order.
    pub fn unsent(&self) -> Vec<ProxyObject> {
        self.unsent
            .iter()
            .filter_map(|id| self.by_client_id.get(id).cloned())
            .collect()
    }

    pub fn mark_sent(&mut self, client_id: i64) {
        self.unsent.retain(|id| *id != client_id);
    }

    /// Rebinds a pending object to its server-assigned id and returns it.
    /// The caller fires the identity-change event once the store is released.
    pub fn promote(&mut self, client_id: i64, server_id: i64) -> Result<ProxyObject> {
        if self.retired.contains(&client_id) {
            return Err(Error::StaleClientId(client_id));
        }
        let obj = self
            .by_client_id
            .remove(&client_id)
            .ok_or_else(|| Error::Protocol(format!("Unknown client id {}", client_id)))?;
        self.unsent.retain(|id| *id != client_id);
        self.retired.insert(client_id);
        obj.assign_id(server_id);
        self.register_server(server_id, &obj)?;
        Ok(obj)
    }

    /// Drops a pending object that never reached the server. Its id stays
    /// retired for the rest of the session.
    pub fn retire(&mut self, client_id: i64) {
        self.by_client_id.remove(&client_id);
        self.unsent.retain(|id| *id != client_id);
        self.retired.insert(client_id);
    }

    /// Forgets a disposed object once its `dispose` notice has been applied.
    pub fn remove(&mut self, id: i64) -> Option<ProxyObject> {
        if id < 0 {
            let obj = self.by_client_id.remove(&id);
            if obj.is_some() {
                self.retired.insert(id);
            }
            obj
        } else {
            self.by_server_id.remove(&id)
        }
    }
}
