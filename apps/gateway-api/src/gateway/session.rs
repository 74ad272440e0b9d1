//! Per-connection gateway session state.

use std::sync::atomic::{AtomicU64, Ordering};

use super::fanout::Audience;

/// State for a single WebSocket connection.
pub struct GatewaySession {
    /// Unique connection identifier (`conn_` prefixed ULID).
    pub connection_id: String,
    /// User id presented at connect time.
    pub user_id: String,
    /// Monotonically increasing sequence number for dispatch events.
    seq: AtomicU64,
}

impl GatewaySession {
    pub fn new(connection_id: String, user_id: String) -> Self {
        Self {
            connection_id,
            user_id,
            seq: AtomicU64::new(0),
        }
    }

    /// Get the next sequence number for a dispatch event.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Check whether this connection should receive an event.
    pub fn is_recipient(&self, audience: &Audience) -> bool {
        audience.includes(&self.connection_id)
    }
}
