//! Registry of live connections
//!
//! Primary map by connection identity plus a derived index by user.
//! Both maps change together inside `add`/`remove`; the registry is owned
//! by the hub actor, so every mutation and snapshot is already serialized.

use std::collections::{HashMap, HashSet};

use crate::connection::{Connection, ConnectionInfo};
use crate::types::{ConnectionId, UserId};

#[derive(Debug, Default)]
pub struct Registry {
    /// All live connections: ConnectionId -> Connection
    connections: HashMap<ConnectionId, Connection>,
    /// Derived index: UserId -> ConnectionIds
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert into both maps
    ///
    /// Returns false (and leaves the registry untouched) if the identity is
    /// already present.
    pub fn add(&mut self, connection: Connection) -> bool {
        if self.connections.contains_key(&connection.id) {
            return false;
        }
        self.by_user
            .entry(connection.user_id)
            .or_default()
            .insert(connection.id);
        self.connections.insert(connection.id, connection);
        true
    }

    /// Remove from both maps
    ///
    /// Absent ids are a no-op, so every cleanup path may call this.
    pub fn remove(&mut self, id: &ConnectionId) -> Option<Connection> {
        let connection = self.connections.remove(id)?;
        if let Some(ids) = self.by_user.get_mut(&connection.user_id) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_user.remove(&connection.user_id);
            }
        }
        Some(connection)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    #[cfg(test)]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Snapshot of one user's connections
    pub fn lookup_by_user(&self, user_id: UserId) -> Vec<ConnectionInfo> {
        self.by_user
            .get(&user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.connections.get(id))
                    .map(Connection::info)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot of every connection id
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    /// Distinct users with at least one connection
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.by_user.keys().copied().collect();
        users.sort();
        users
    }

    pub fn is_user_online(&self, user_id: UserId) -> bool {
        self.by_user.contains_key(&user_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn user_count(&self) -> usize {
        self.by_user.len()
    }

    /// Whether the two maps agree
    ///
    /// Every indexed id exists with the indexed user, every connection is
    /// indexed, and no user maps to an empty set.
    pub fn is_consistent(&self) -> bool {
        let indexed: usize = self.by_user.values().map(HashSet::len).sum();
        if indexed != self.connections.len() {
            return false;
        }
        self.by_user.iter().all(|(user, ids)| {
            !ids.is_empty()
                && ids.iter().all(|id| {
                    self.connections
                        .get(id)
                        .is_some_and(|c| c.user_id == *user)
                })
        })
    }

    /// Remove everything, handing back the connections
    pub fn drain(&mut self) -> Vec<Connection> {
        self.by_user.clear();
        self.connections.drain().map(|(_, c)| c).collect()
    }
}
