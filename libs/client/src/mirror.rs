//! Local mirror of the session registry, fed by gateway events.
//!
//! State changes only when the gateway says so. The one exception is
//! session creation: `begin_start` hands out a client-generated id that is
//! tracked as pending until the gateway echoes the same id back.

use std::collections::HashMap;
use std::time::Duration;

use livecast_common::id::{prefix, prefixed_ulid};
use livecast_common::{ChatMessage, Role, ServerEvent, Session, SessionMetadata};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time;

use crate::error::ClientError;

const CHAT_RETAINED: usize = 200;

#[derive(Debug, Default)]
struct MirrorState {
    sessions: HashMap<String, Session>,
    roles: HashMap<String, Role>,
    pending: HashMap<String, Session>,
    chat: HashMap<String, Vec<ChatMessage>>,
}

pub struct MirrorStore {
    user_id: String,
    state: RwLock<MirrorState>,
    /// Bumped on every change so waiters can re-check.
    version: watch::Sender<u64>,
}

impl MirrorStore {
    pub fn new(user_id: impl Into<String>) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            user_id: user_id.into(),
            state: RwLock::new(MirrorState::default()),
            version,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Replace the known sessions with a bulk snapshot. Roles and chat are
    /// only ever learned from events and are left alone.
    pub fn seed(&self, sessions: Vec<Session>) {
        {
            let mut state = self.state.write();
            state.sessions = sessions.into_iter().map(|s| (s.id.clone(), s)).collect();
            let MirrorState {
                sessions, roles, ..
            } = &mut *state;
            roles.retain(|id, _| sessions.contains_key(id));
        }
        self.bump();
    }

    /// Forget everything tied to the previous gateway connection. Roles
    /// belong to a connection, and starts queued on it were never sent.
    pub fn reset_connection(&self) {
        {
            let mut state = self.state.write();
            state.roles.clear();
            state.pending.clear();
        }
        self.bump();
    }

    /// Seed from the gateway's bulk read endpoint.
    pub async fn seed_from(&self, http: &reqwest::Client, sessions_url: &str) -> Result<usize, ClientError> {
        let sessions: Vec<Session> = http
            .get(sessions_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let count = sessions.len();
        self.seed(sessions);
        tracing::debug!(count, "mirror seeded");
        Ok(count)
    }

    /// Build a session owned by this user with a fresh client-generated id,
    /// and remember it until the gateway confirms it.
    pub fn begin_start(&self, title: &str, metadata: SessionMetadata) -> Session {
        let mut session = Session::new(prefixed_ulid(prefix::SESSION), title, self.user_id.clone());
        session.metadata = SessionMetadata {
            title: title.to_string(),
            ..metadata
        };
        self.expect_start(&session);
        session
    }

    pub fn expect_start(&self, session: &Session) {
        self.state
            .write()
            .pending
            .entry(session.id.clone())
            .or_insert_with(|| session.clone());
    }

    /// Forget a pending start the gateway rejected.
    pub fn abandon_start(&self, session_id: &str) {
        if self.state.write().pending.remove(session_id).is_some() {
            self.bump();
        }
    }

    pub fn is_pending(&self, session_id: &str) -> bool {
        self.state.read().pending.contains_key(session_id)
    }

    pub fn apply(&self, event: &ServerEvent) {
        {
            let mut state = self.state.write();
            match event {
                ServerEvent::SessionStarted(session) => {
                    if state.pending.remove(&session.id).is_some() {
                        tracing::debug!(session_id = %session.id, "pending start confirmed");
                    }
                    state.sessions.insert(session.id.clone(), session.clone());
                }
                ServerEvent::SessionEnded(r) => {
                    state.sessions.remove(&r.id);
                    state.roles.remove(&r.id);
                    state.chat.remove(&r.id);
                    state.pending.remove(&r.id);
                }
                ServerEvent::ViewerJoined(v) | ServerEvent::ViewerLeft(v) => {
                    if let Some(session) = state.sessions.get_mut(&v.id) {
                        session.viewer_count = v.count;
                    }
                }
                ServerEvent::PreviewUpdated(p) => {
                    if let Some(session) = state.sessions.get_mut(&p.id) {
                        session.metadata.preview_ref = Some(p.preview_ref.clone());
                    }
                }
                ServerEvent::ChatMessage(chat) => {
                    let log = state.chat.entry(chat.id.clone()).or_default();
                    log.push(chat.message.clone());
                    if log.len() > CHAT_RETAINED {
                        let excess = log.len() - CHAT_RETAINED;
                        log.drain(..excess);
                    }
                }
                ServerEvent::ChatHistory(history) => {
                    state.chat.insert(history.id.clone(), history.messages.clone());
                }
                ServerEvent::RoleChanged(change) => match change.role {
                    Some(role) => {
                        state.roles.insert(change.id.clone(), role);
                    }
                    None => {
                        state.roles.remove(&change.id);
                    }
                },
                ServerEvent::Ready(_) | ServerEvent::Error(_) => return,
            }
        }
        self.bump();
    }

    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.state.read().sessions.get(session_id).cloned()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.state.read().sessions.values().cloned().collect()
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.state.read().sessions.contains_key(session_id)
    }

    pub fn am_host(&self, session_id: &str) -> bool {
        self.role(session_id) == Some(Role::Host)
    }

    pub fn viewer_count(&self, session_id: &str) -> Option<u64> {
        self.state
            .read()
            .sessions
            .get(session_id)
            .map(|s| s.viewer_count)
    }

    pub fn role(&self, session_id: &str) -> Option<Role> {
        self.state.read().roles.get(session_id).copied()
    }

    pub fn chat(&self, session_id: &str) -> Vec<ChatMessage> {
        self.state
            .read()
            .chat
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Wait until `session_id` is known to be active.
    pub async fn wait_active(&self, session_id: &str, timeout: Duration) -> bool {
        let mut changes = self.subscribe();
        let wait = async {
            loop {
                if self.is_active(session_id) {
                    return true;
                }
                if changes.changed().await.is_err() {
                    return false;
                }
            }
        };
        time::timeout(timeout, wait).await.unwrap_or(false)
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use livecast_common::events::{ChatEvent, RoleChange, SessionRef, ViewerCount};

    use super::*;

    #[test]
    fn start_is_pending_until_echoed() {
        let mirror = MirrorStore::new("alice");
        let session = mirror.begin_start("Launch", SessionMetadata::default());
        assert!(session.id.starts_with("live_"));
        assert!(mirror.is_pending(&session.id));
        assert!(!mirror.is_active(&session.id));

        mirror.apply(&ServerEvent::SessionStarted(session.clone()));
        assert!(!mirror.is_pending(&session.id));
        assert!(mirror.is_active(&session.id));
    }

    #[test]
    fn events_drive_views() {
        let mirror = MirrorStore::new("bob");
        mirror.apply(&ServerEvent::SessionStarted(Session::new("s1", "t", "alice")));
        mirror.apply(&ServerEvent::RoleChanged(RoleChange {
            id: "s1".into(),
            role: Some(Role::Viewer),
        }));
        mirror.apply(&ServerEvent::ViewerJoined(ViewerCount {
            id: "s1".into(),
            count: 3,
        }));
        assert_eq!(mirror.viewer_count("s1"), Some(3));
        assert_eq!(mirror.role("s1"), Some(Role::Viewer));
        assert!(!mirror.am_host("s1"));

        mirror.apply(&ServerEvent::SessionEnded(SessionRef { id: "s1".into() }));
        assert!(!mirror.is_active("s1"));
        assert_eq!(mirror.role("s1"), None);
        assert_eq!(mirror.viewer_count("s1"), None);
    }

    #[test]
    fn chat_appends_and_history_replaces() {
        let mirror = MirrorStore::new("bob");
        let message = ChatMessage {
            timestamp: chrono::Utc::now(),
            username: "alice".into(),
            content: "hi".into(),
        };
        mirror.apply(&ServerEvent::ChatMessage(ChatEvent {
            id: "s1".into(),
            message: message.clone(),
        }));
        assert_eq!(mirror.chat("s1").len(), 1);

        mirror.apply(&ServerEvent::ChatHistory(livecast_common::events::ChatHistory {
            id: "s1".into(),
            messages: vec![message.clone(), message],
        }));
        assert_eq!(mirror.chat("s1").len(), 2);
    }

    #[test]
    fn seed_replaces_sessions() {
        let mirror = MirrorStore::new("bob");
        mirror.apply(&ServerEvent::SessionStarted(Session::new("stale", "t", "x")));
        mirror.seed(vec![Session::new("s1", "t", "alice")]);
        assert!(!mirror.is_active("stale"));
        assert!(mirror.is_active("s1"));
    }

    #[test]
    fn reset_connection_drops_roles_and_pending() {
        let mirror = MirrorStore::new("bob");
        mirror.apply(&ServerEvent::SessionStarted(Session::new("s1", "t", "alice")));
        mirror.apply(&ServerEvent::RoleChanged(RoleChange {
            id: "s1".to_string(),
            role: Some(Role::Viewer),
        }));
        let pending = mirror.begin_start("mine", SessionMetadata::default());

        mirror.reset_connection();
        assert_eq!(mirror.role("s1"), None);
        assert!(!mirror.is_pending(&pending.id));

        // A reseed that still lists the session does not bring the role back.
        mirror.seed(vec![Session::new("s1", "t", "alice")]);
        assert!(mirror.is_active("s1"));
        assert_eq!(mirror.role("s1"), None);
    }

    #[tokio::test]
    async fn wait_active_wakes_on_event() {
        let mirror = Arc::new(MirrorStore::new("bob"));
        let m = mirror.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(10)).await;
            m.apply(&ServerEvent::SessionStarted(Session::new("s1", "t", "alice")));
        });
        assert!(mirror.wait_active("s1", Duration::from_secs(1)).await);
        assert!(!mirror.wait_active("s2", Duration::from_millis(20)).await);
    }
}
