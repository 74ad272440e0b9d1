//! Per-session action queues.
//!
//! Every mutation of a session's membership runs while holding that
//! session's queue. `tokio::sync::Mutex` hands the lock out in FIFO order, so
//! actions against one session apply in arrival order while different
//! sessions proceed concurrently. A queue is dropped with the last turn
//! that used it, so actions against unknown ids leave nothing behind.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub struct SessionQueues {
    queues: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionQueues {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
        }
    }

    /// Wait for this session's turn.
    pub async fn acquire(&self, session_id: &str) -> SessionTurn<'_> {
        let queue = self
            .queues
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = queue.lock_owned().await;
        SessionTurn {
            queues: self,
            session_id: session_id.to_string(),
            guard: Some(guard),
        }
    }

    /// Drop the queue for a session if nobody holds or waits on it.
    fn forget(&self, session_id: &str) {
        self.queues
            .remove_if(session_id, |_, queue| Arc::strong_count(queue) == 1);
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

/// Exclusive turn on one session's queue, released on drop.
pub struct SessionTurn<'a> {
    queues: &'a SessionQueues,
    session_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionTurn<'_> {
    fn drop(&mut self) {
        // Release first so the map holds the only remaining reference.
        self.guard.take();
        self.queues.forget(&self.session_id);
    }
}

impl Default for SessionQueues {
    fn default() -> Self {
        Self::new()
    }
}
