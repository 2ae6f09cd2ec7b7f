//! Responder-side connection set: live, key-exchanged peers keyed by connection ID.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identity of one accepted transport stream.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        ConnectionId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Unordered set of live connection handles. A connection appears at most once.
pub struct ConnectionSet<H> {
    entries: HashMap<ConnectionId, H>,
}

impl<H: Clone> ConnectionSet<H> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register a connection. Returns false (and keeps the existing handle) if already present.
    pub fn insert(&mut self, id: ConnectionId, handle: H) -> bool {
        if self.entries.contains_key(&id) {
            return false;
        }
        self.entries.insert(id, handle);
        true
    }

    pub fn remove(&mut self, id: &ConnectionId) -> Option<H> {
        self.entries.remove(id)
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&H> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of the current members, safe to iterate after the lock is released.
    pub fn snapshot(&self) -> Vec<(ConnectionId, H)> {
        self.entries
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect()
    }
}

impl<H: Clone> Default for ConnectionSet<H> {
    fn default() -> Self {
        Self::new()
    }
}
