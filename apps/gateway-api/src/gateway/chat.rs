//! In-memory, bounded chat log per session.

use std::collections::VecDeque;

use dashmap::DashMap;
use livecast_common::ChatMessage;
use parking_lot::Mutex;

pub struct ChatLog {
    logs: DashMap<String, Mutex<VecDeque<ChatMessage>>>,
    capacity: usize,
}

impl ChatLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            logs: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append a message, evicting the oldest entry when over capacity.
    pub fn append(&self, session_id: &str, message: ChatMessage) {
        let log = self
            .logs
            .entry(session_id.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut l = log.lock();
        l.push_back(message);
        while l.len() > self.capacity {
            l.pop_front();
        }
    }

    /// Ordered copy of the retained history.
    pub fn snapshot(&self, session_id: &str) -> Vec<ChatMessage> {
        self.logs
            .get(session_id)
            .map(|log| log.lock().iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self, session_id: &str) {
        self.logs.remove(session_id);
    }
}
