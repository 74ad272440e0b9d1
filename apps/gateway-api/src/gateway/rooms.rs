//! Per-session broadcast rooms. The viewer set of a room is the source of
//! truth for a session's viewer count.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;

#[derive(Debug, Default)]
struct Room {
    host: Option<String>,
    viewers: HashSet<String>,
}

/// Point-in-time view of a room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub host: Option<String>,
    pub viewers: HashSet<String>,
}

impl RoomSnapshot {
    pub fn viewer_count(&self) -> u64 {
        self.viewers.len() as u64
    }

    /// Host and viewers: everyone that receives room-scoped events.
    pub fn audience(&self) -> HashSet<String> {
        let mut members = self.viewers.clone();
        members.extend(self.host.iter().cloned());
        members
    }
}

pub struct RoomRegistry {
    rooms: DashMap<String, Room>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
        }
    }

    /// Open a room for a freshly started session.
    pub fn open(&self, session_id: &str, host_connection: &str) {
        self.rooms.insert(
            session_id.to_string(),
            Room {
                host: Some(host_connection.to_string()),
                viewers: HashSet::new(),
            },
        );
    }

    /// Close a room, returning who was in it.
    pub fn close(&self, session_id: &str) -> Option<RoomSnapshot> {
        self.rooms.remove(session_id).map(|(_, room)| RoomSnapshot {
            host: room.host,
            viewers: room.viewers,
        })
    }

    pub fn is_open(&self, session_id: &str) -> bool {
        self.rooms.contains_key(session_id)
    }

    /// Add a viewer. Returns the new viewer count, or `None` when the room
    /// is not open on this gateway.
    pub fn join(&self, session_id: &str, connection_id: &str) -> Option<u64> {
        let mut room = self.rooms.get_mut(session_id)?;
        room.viewers.insert(connection_id.to_string());
        Some(room.viewers.len() as u64)
    }

    /// Remove a viewer. Returns the new viewer count only if the connection
    /// was actually a viewer of an open room.
    pub fn leave(&self, session_id: &str, connection_id: &str) -> Option<u64> {
        let mut room = self.rooms.get_mut(session_id)?;
        if !room.viewers.remove(connection_id) {
            return None;
        }
        Some(room.viewers.len() as u64)
    }

    pub fn snapshot(&self, session_id: &str) -> RoomSnapshot {
        self.rooms
            .get(session_id)
            .map(|room| RoomSnapshot {
                host: room.host.clone(),
                viewers: room.viewers.clone(),
            })
            .unwrap_or_default()
    }

    /// Room audience as a shareable set, for scoped broadcasts.
    pub fn audience(&self, session_id: &str) -> Arc<HashSet<String>> {
        Arc::new(self.snapshot(session_id).audience())
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}
