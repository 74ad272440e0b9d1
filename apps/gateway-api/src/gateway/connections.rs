//! Live connection registry: per-connection identity and per-session roles.

use std::collections::HashMap;
use std::time::Instant;

use dashmap::DashMap;
use livecast_common::Role;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Membership state for one connected participant.
pub struct ConnectionEntry {
    pub connection_id: String,
    pub user_id: String,
    pub username: String,
    /// Sessions this connection is joined to, with the role held in each.
    pub roles: HashMap<String, Role>,
    /// Cancelled when the connection is superseded or the gateway shuts down.
    pub cancel: CancellationToken,
    pub connected_at: Instant,
}

impl ConnectionEntry {
    pub fn new(connection_id: String, user_id: String, username: String, cancel: CancellationToken) -> Self {
        Self {
            connection_id,
            user_id,
            username,
            roles: HashMap::new(),
            cancel,
            connected_at: Instant::now(),
        }
    }
}

/// Shared registry of all live connections.
///
/// Uses `DashMap` for shard-level concurrency and `parking_lot::Mutex` per
/// entry for non-poisoning, fast locking. A user id maps to at most one
/// connection at a time.
pub struct ConnectionRegistry {
    connections: DashMap<String, Mutex<ConnectionEntry>>,
    by_user: DashMap<String, String>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            by_user: DashMap::new(),
        }
    }

    /// Register a connection and point its user at it. Returns the id of the
    /// connection it replaces for that user, if any.
    pub fn register(&self, entry: ConnectionEntry) -> Option<String> {
        let connection_id = entry.connection_id.clone();
        let previous = self.by_user.insert(entry.user_id.clone(), connection_id.clone());
        self.connections.insert(connection_id, Mutex::new(entry));
        previous
    }

    /// Remove a connection, returning its final state. Only the first caller
    /// gets `Some`, which makes disconnect handling run once.
    pub fn remove(&self, connection_id: &str) -> Option<ConnectionEntry> {
        let (_, entry) = self.connections.remove(connection_id)?;
        let entry = entry.into_inner();
        self.by_user
            .remove_if(&entry.user_id, |_, current| current == connection_id);
        Some(entry)
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// `(user_id, username)` of a live connection.
    pub fn identity(&self, connection_id: &str) -> Option<(String, String)> {
        let entry = self.connections.get(connection_id)?;
        let e = entry.lock();
        Some((e.user_id.clone(), e.username.clone()))
    }

    pub fn connection_for_user(&self, user_id: &str) -> Option<String> {
        self.by_user.get(user_id).map(|id| id.value().clone())
    }

    pub fn cancel_token(&self, connection_id: &str) -> Option<CancellationToken> {
        let entry = self.connections.get(connection_id)?;
        let token = entry.lock().cancel.clone();
        Some(token)
    }

    pub fn role(&self, connection_id: &str, session_id: &str) -> Option<Role> {
        let entry = self.connections.get(connection_id)?;
        let role = entry.lock().roles.get(session_id).copied();
        role
    }

    /// Set or clear the role held in a session. Returns `false` if the
    /// connection is gone.
    pub fn set_role(&self, connection_id: &str, session_id: &str, role: Option<Role>) -> bool {
        let Some(entry) = self.connections.get(connection_id) else {
            return false;
        };
        let mut e = entry.lock();
        match role {
            Some(role) => {
                e.roles.insert(session_id.to_string(), role);
            }
            None => {
                e.roles.remove(session_id);
            }
        }
        true
    }

    /// The session this connection is hosting, if any.
    pub fn hosted_session(&self, connection_id: &str) -> Option<String> {
        let entry = self.connections.get(connection_id)?;
        let e = entry.lock();
        let hosted = e
            .roles
            .iter()
            .find(|(_, role)| **role == Role::Host)
            .map(|(id, _)| id.clone());
        hosted
    }

    pub fn ids(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(conn: &str, user: &str) -> ConnectionEntry {
        ConnectionEntry::new(conn.into(), user.into(), user.into(), CancellationToken::new())
    }

    #[test]
    fn register_reports_superseded_connection() {
        let registry = ConnectionRegistry::new();
        assert!(registry.register(entry("c1", "u1")).is_none());
        assert_eq!(registry.register(entry("c2", "u1")).as_deref(), Some("c1"));
        assert_eq!(registry.connection_for_user("u1").as_deref(), Some("c2"));
    }

    #[test]
    fn removing_old_connection_keeps_newer_user_mapping() {
        let registry = ConnectionRegistry::new();
        registry.register(entry("c1", "u1"));
        registry.register(entry("c2", "u1"));

        assert!(registry.remove("c1").is_some());
        assert_eq!(registry.connection_for_user("u1").as_deref(), Some("c2"));

        assert!(registry.remove("c2").is_some());
        assert!(registry.connection_for_user("u1").is_none());
    }

    #[test]
    fn remove_is_only_observed_once() {
        let registry = ConnectionRegistry::new();
        registry.register(entry("c1", "u1"));
        registry.set_role("c1", "s1", Some(Role::Viewer));

        let removed = registry.remove("c1").unwrap();
        assert_eq!(removed.roles.get("s1"), Some(&Role::Viewer));
        assert!(registry.remove("c1").is_none());
        assert!(!registry.set_role("c1", "s1", Some(Role::Viewer)));
    }

    #[test]
    fn hosted_session_finds_host_role() {
        let registry = ConnectionRegistry::new();
        registry.register(entry("c1", "u1"));
        registry.set_role("c1", "watching", Some(Role::Viewer));
        assert!(registry.hosted_session("c1").is_none());

        registry.set_role("c1", "mine", Some(Role::Host));
        assert_eq!(registry.hosted_session("c1").as_deref(), Some("mine"));

        registry.set_role("c1", "mine", None);
        assert!(registry.hosted_session("c1").is_none());
        assert_eq!(registry.role("c1", "watching"), Some(Role::Viewer));
    }
}
