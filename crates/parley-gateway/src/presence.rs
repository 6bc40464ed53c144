//! In-memory per-user presence with multi-connection support.
//!
//! A user is online while at least one of their connections is registered.
//! Status changes are broadcast while the user's map entry is held, so a
//! racing reconnect cannot reorder one user's online/offline events.

use std::collections::HashSet;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use uuid::Uuid;

use parley_types::events::GatewayEvent;
use parley_types::models::UserStatus;

use crate::dispatcher::ConnId;

struct PresenceEntry {
    connections: HashSet<ConnId>,
    status: UserStatus,
}

pub struct PresenceRegistry {
    inner: DashMap<Uuid, PresenceEntry>,
    events: broadcast::Sender<GatewayEvent>,
}

impl PresenceRegistry {
    pub fn new(events: broadcast::Sender<GatewayEvent>) -> Self {
        Self {
            inner: DashMap::new(),
            events,
        }
    }

    /// Add a connection. Returns true if it is the user's first, in which case
    /// `online` has been broadcast.
    pub fn register(&self, user_id: Uuid, conn_id: ConnId) -> bool {
        let mut entry = self.inner.entry(user_id).or_insert_with(|| PresenceEntry {
            connections: HashSet::new(),
            status: UserStatus::Online,
        });

        let first = entry.connections.is_empty();
        entry.connections.insert(conn_id);

        if first {
            entry.status = UserStatus::Online;
            self.emit(user_id, UserStatus::Online);
        }
        first
    }

    /// Remove a connection. Returns true if it was the user's last, in which
    /// case the entry is gone and `offline` has been broadcast. Unknown
    /// connections are ignored.
    pub fn unregister(&self, user_id: Uuid, conn_id: ConnId) -> bool {
        match self.inner.entry(user_id) {
            Entry::Occupied(mut entry) => {
                if !entry.get_mut().connections.remove(&conn_id) {
                    return false;
                }
                if !entry.get().connections.is_empty() {
                    return false;
                }
                entry.remove();
                self.emit(user_id, UserStatus::Offline);
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    /// Switch an online user between `online` and `away`. Returns true if the
    /// status changed (and was broadcast).
    pub fn set_status(&self, user_id: Uuid, status: UserStatus) -> bool {
        if status == UserStatus::Offline {
            return false;
        }

        match self.inner.get_mut(&user_id) {
            Some(mut entry) if entry.status != status => {
                entry.status = status;
                self.emit(user_id, status);
                true
            }
            _ => false,
        }
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.inner.contains_key(&user_id)
    }

    pub fn connection_count(&self, user_id: Uuid) -> usize {
        self.inner
            .get(&user_id)
            .map_or(0, |entry| entry.connections.len())
    }

    /// Everyone currently online and their status.
    pub fn snapshot(&self) -> Vec<(Uuid, UserStatus)> {
        self.inner
            .iter()
            .map(|entry| (*entry.key(), entry.value().status))
            .collect()
    }

    fn emit(&self, user_id: Uuid, status: UserStatus) {
        // No receivers is fine: nobody is connected to hear it
        let _ = self.events.send(GatewayEvent::UserStatus { user_id, status });
    }
}
