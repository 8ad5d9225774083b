//! Connection hub: maps room names to the connections currently in them and
//! owns each connection's outbound event channel. Rooms are the only
//! addressing mechanism; delivery to a room nobody occupies is a no-op.

use std::collections::HashSet;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use shared::{
    domain::{CallId, UserId},
    protocol::ServerEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

#[derive(Default)]
pub struct Hub {
    connections: DashMap<ConnectionId, EventSender>,
    rooms: DashMap<String, HashSet<ConnectionId>>,
    /// Reverse index: which rooms each connection joined.
    memberships: DashMap<ConnectionId, HashSet<String>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user_room(user_id: &UserId) -> String {
        format!("user:{user_id}")
    }

    pub fn call_room(call_id: &CallId) -> String {
        format!("call:{call_id}")
    }

    pub fn register(&self, conn_id: ConnectionId, tx: EventSender) {
        self.connections.insert(conn_id, tx);
    }

    /// Drops the connection and removes it from every room it joined.
    pub fn unregister(&self, conn_id: ConnectionId) {
        self.connections.remove(&conn_id);
        let rooms = self
            .memberships
            .remove(&conn_id)
            .map(|(_, rooms)| rooms)
            .unwrap_or_default();
        for room in &rooms {
            self.remove_from_room(room, conn_id);
        }
    }

    pub fn join(&self, room: &str, conn_id: ConnectionId) {
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(conn_id);
        self.memberships
            .entry(conn_id)
            .or_default()
            .insert(room.to_string());
    }

    pub fn leave(&self, room: &str, conn_id: ConnectionId) {
        self.remove_from_room(room, conn_id);
        if let Some(mut rooms) = self.memberships.get_mut(&conn_id) {
            rooms.remove(room);
        }
    }

    fn remove_from_room(&self, room: &str, conn_id: ConnectionId) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(&conn_id);
            if members.is_empty() {
                drop(members);
                self.rooms.remove(room);
            }
        }
    }

    pub fn send_to_connection(&self, conn_id: ConnectionId, event: ServerEvent) {
        if let Some(tx) = self.connections.get(&conn_id) {
            if tx.send(event).is_err() {
                trace!(conn_id = %conn_id, "dropping event for closed connection");
            }
        }
    }

    pub fn send_to_user(&self, user_id: &UserId, event: ServerEvent) {
        self.send_to_room(&Self::user_room(user_id), &event);
    }

    pub fn send_to_room(&self, room: &str, event: &ServerEvent) {
        for conn_id in self.room_members(room) {
            self.send_to_connection(conn_id, event.clone());
        }
    }

    pub fn send_to_room_except(&self, room: &str, except: ConnectionId, event: &ServerEvent) {
        for conn_id in self.room_members(room) {
            if conn_id != except {
                self.send_to_connection(conn_id, event.clone());
            }
        }
    }

    pub fn room_size(&self, room: &str) -> usize {
        self.rooms.get(room).map(|m| m.len()).unwrap_or(0)
    }

    fn room_members(&self, room: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[path = "tests/hub_tests.rs"]
mod tests;
