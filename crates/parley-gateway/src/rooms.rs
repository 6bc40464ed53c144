use std::collections::HashSet;

use dashmap::DashMap;
use uuid::Uuid;

use crate::dispatcher::ConnId;

/// Chat room bindings, indexed both ways: chat -> connections for fan-out,
/// connection -> chats for teardown. Never holds a lock on both maps at once.
#[derive(Default)]
pub struct RoomTable {
    rooms: DashMap<Uuid, HashSet<ConnId>>,
    bindings: DashMap<ConnId, HashSet<Uuid>>,
}

impl RoomTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a connection to a room. Returns false if it was already bound.
    pub fn join(&self, chat_id: Uuid, conn_id: ConnId) -> bool {
        let added = self.rooms.entry(chat_id).or_default().insert(conn_id);
        self.bindings.entry(conn_id).or_default().insert(chat_id);
        added
    }

    /// Unbind a connection from a room. Returns false if it was not bound.
    pub fn leave(&self, chat_id: Uuid, conn_id: ConnId) -> bool {
        let removed = self.detach(chat_id, conn_id);
        if let Some(mut chats) = self.bindings.get_mut(&conn_id) {
            chats.remove(&chat_id);
        }
        self.bindings.remove_if(&conn_id, |_, chats| chats.is_empty());
        removed
    }

    /// Unbind a connection from every room it is in. Returns those rooms.
    pub fn leave_all(&self, conn_id: ConnId) -> Vec<Uuid> {
        let chats: Vec<Uuid> = self
            .bindings
            .remove(&conn_id)
            .map(|(_, chats)| chats.into_iter().collect())
            .unwrap_or_default();

        for chat_id in &chats {
            self.detach(*chat_id, conn_id);
        }
        chats
    }

    pub fn is_member(&self, chat_id: Uuid, conn_id: ConnId) -> bool {
        self.rooms
            .get(&chat_id)
            .is_some_and(|members| members.contains(&conn_id))
    }

    pub fn members(&self, chat_id: Uuid) -> Vec<ConnId> {
        self.rooms
            .get(&chat_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    fn detach(&self, chat_id: Uuid, conn_id: ConnId) -> bool {
        let removed = self
            .rooms
            .get_mut(&chat_id)
            .is_some_and(|mut members| members.remove(&conn_id));
        self.rooms.remove_if(&chat_id, |_, members| members.is_empty());
        removed
    }
}
