//! Broadcast hub for dispatching Gateway events to connected sessions.
//!
//! Uses a single `tokio::sync::broadcast` channel. Recipients are resolved
//! when an event is dispatched and carried in the payload's `Audience`; each
//! connection filters locally by its own id.

use std::collections::HashSet;
use std::sync::Arc;

use livecast_common::ServerEvent;
use tokio::sync::broadcast;

/// Capacity of the broadcast channel. Slow receivers that fall behind will
/// skip messages (RecvError::Lagged).
const BROADCAST_CAPACITY: usize = 4096;

/// Who receives a dispatched event.
#[derive(Debug, Clone)]
pub enum Audience {
    /// Every connected participant.
    All,
    /// A session room, snapshotted at dispatch time.
    Room(Arc<HashSet<String>>),
    /// One connection.
    Connection(String),
}

impl Audience {
    pub fn includes(&self, connection_id: &str) -> bool {
        match self {
            Audience::All => true,
            Audience::Room(members) => members.contains(connection_id),
            Audience::Connection(id) => id == connection_id,
        }
    }
}

/// A payload broadcast to all connected gateway sessions.
#[derive(Debug, Clone)]
pub struct BroadcastPayload {
    pub audience: Audience,
    pub event: ServerEvent,
}

/// The global broadcast hub. Cloneable.
#[derive(Clone)]
pub struct GatewayBroadcast {
    sender: broadcast::Sender<Arc<BroadcastPayload>>,
}

impl GatewayBroadcast {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { sender }
    }

    /// Subscribe to the broadcast channel. Each gateway connection should call
    /// this once to get its own receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<BroadcastPayload>> {
        self.sender.subscribe()
    }

    /// Dispatch an event to its audience.
    pub fn dispatch(&self, audience: Audience, event: ServerEvent) {
        // Err only means nobody is connected.
        let _ = self.sender.send(Arc::new(BroadcastPayload { audience, event }));
    }
}

impl Default for GatewayBroadcast {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_audience_matches_members_only() {
        let members: HashSet<String> = ["c1".to_string(), "c2".to_string()].into();
        let audience = Audience::Room(Arc::new(members));
        assert!(audience.includes("c1"));
        assert!(!audience.includes("c3"));
        assert!(Audience::All.includes("c3"));
        assert!(Audience::Connection("c3".into()).includes("c3"));
        assert!(!Audience::Connection("c3".into()).includes("c1"));
    }

    #[tokio::test]
    async fn subscribers_receive_dispatched_events() {
        let hub = GatewayBroadcast::new();
        let mut rx = hub.subscribe();
        hub.dispatch(Audience::All, ServerEvent::error("x", 500));
        let payload = rx.recv().await.unwrap();
        assert!(matches!(payload.audience, Audience::All));
    }
}
