use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{trace, warn};
use uuid::Uuid;

use parley_types::events::GatewayEvent;

use crate::presence::PresenceRegistry;
use crate::rooms::RoomTable;

/// Identifies one live connection. A user may hold several.
pub type ConnId = Uuid;

/// Per-connection outbound queue depth. A connection that falls this far
/// behind starts losing room events instead of slowing everyone else down.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

const GLOBAL_BUFFER: usize = 1024;

struct ConnectionHandle {
    user_id: Uuid,
    tx: mpsc::Sender<GatewayEvent>,
}

/// Manages all connected clients: targeted queues, room fan-out and the
/// global presence broadcast.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Global events (presence). Every connection receives every event.
    broadcast_tx: broadcast::Sender<GatewayEvent>,

    /// Per-connection outbound queues: conn_id -> handle
    connections: DashMap<ConnId, ConnectionHandle>,

    presence: PresenceRegistry,
    rooms: RoomTable,
    outbound_buffer: usize,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_outbound_buffer(DEFAULT_OUTBOUND_BUFFER)
    }

    pub fn with_outbound_buffer(outbound_buffer: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(GLOBAL_BUFFER);
        Self {
            inner: Arc::new(DispatcherInner {
                presence: PresenceRegistry::new(broadcast_tx.clone()),
                broadcast_tx,
                connections: DashMap::new(),
                rooms: RoomTable::new(),
                outbound_buffer: outbound_buffer.max(1),
            }),
        }
    }

    /// Subscribe to global events.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.inner.presence
    }

    pub fn rooms(&self) -> &RoomTable {
        &self.inner.rooms
    }

    /// Open an outbound queue for a new connection. Returns (conn_id, receiver).
    pub fn register_connection(&self, user_id: Uuid) -> (ConnId, mpsc::Receiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.inner.outbound_buffer);
        self.inner
            .connections
            .insert(conn_id, ConnectionHandle { user_id, tx });
        (conn_id, rx)
    }

    /// Drop a connection's queue and room bindings. Returns false if the
    /// connection was already gone.
    pub fn unregister_connection(&self, conn_id: ConnId) -> bool {
        self.inner.rooms.leave_all(conn_id);
        self.inner.connections.remove(&conn_id).is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Queue an event for one connection. Returns false if it was not queued.
    pub fn send_to_connection(&self, conn_id: ConnId, event: GatewayEvent) -> bool {
        let Some(handle) = self.inner.connections.get(&conn_id) else {
            return false;
        };

        match handle.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Outbound queue full for connection {} (user {}), dropping event",
                    conn_id, handle.user_id
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("Connection {} closed before delivery", conn_id);
                false
            }
        }
    }

    /// Fan an event out to every connection bound to a room, optionally
    /// skipping one. Returns the number of connections it was queued for.
    pub fn send_to_room(&self, chat_id: Uuid, event: GatewayEvent, except: Option<ConnId>) -> usize {
        let mut delivered = 0;
        for conn_id in self.inner.rooms.members(chat_id) {
            if Some(conn_id) == except {
                continue;
            }
            if self.send_to_connection(conn_id, event.clone()) {
                delivered += 1;
            }
        }
        trace!("Room {} fan-out reached {} connections", chat_id, delivered);
        delivered
    }
}
