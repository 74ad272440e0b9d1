//! The realtime gateway: owns live connections, is the single writer of room
//! membership, and is the only component that broadcasts to participants.
//!
//! Every action is validated, then applied to the registry, then broadcast.
//! Mutations of one session run one at a time through its action queue.

use std::sync::Arc;

use chrono::Utc;
use livecast_common::events::{
    ChatEvent, ChatHistory, PreviewUpdate, RoleChange, SessionRef, ViewerCount,
};
use livecast_common::id::{prefix, prefixed_ulid};
use livecast_common::{ChatMessage, ClientAction, Role, ServerEvent, Session};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::GatewayError;
use crate::registry::{RegistryError, SessionRegistry};

use super::chat::ChatLog;
use super::connections::{ConnectionEntry, ConnectionRegistry};
use super::fanout::{Audience, BroadcastPayload, GatewayBroadcast};
use super::queue::SessionQueues;
use super::rooms::{RoomRegistry, RoomSnapshot};

/// Handle returned to the transport layer for an accepted connection.
#[derive(Debug, Clone)]
pub struct Connection {
    pub connection_id: String,
    pub user_id: String,
    /// Cancelled when this connection is superseded or the gateway shuts down.
    pub cancel: CancellationToken,
}

pub struct Gateway {
    registry: SessionRegistry,
    connections: ConnectionRegistry,
    rooms: RoomRegistry,
    chat: ChatLog,
    queues: SessionQueues,
    broadcast: GatewayBroadcast,
    shutdown: CancellationToken,
    max_chat_length: usize,
}

impl Gateway {
    pub fn new(registry: SessionRegistry, config: &Config) -> Self {
        Self {
            registry,
            connections: ConnectionRegistry::new(),
            rooms: RoomRegistry::new(),
            chat: ChatLog::new(config.chat_history_limit),
            queues: SessionQueues::new(),
            broadcast: GatewayBroadcast::new(),
            shutdown: CancellationToken::new(),
            max_chat_length: config.max_chat_length,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Receiver for every dispatched event; callers filter by `Audience`.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<BroadcastPayload>> {
        self.broadcast.subscribe()
    }

    pub fn room(&self, session_id: &str) -> RoomSnapshot {
        self.rooms.snapshot(session_id)
    }

    pub fn role_of(&self, connection_id: &str, session_id: &str) -> Option<Role> {
        self.connections.role(connection_id, session_id)
    }

    /// Current connection id for `user_id`, if connected.
    pub fn connection_for_user(&self, user_id: &str) -> Option<String> {
        self.connections.connection_for_user(user_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Accept a connection for `user_id`. A later connection from the same
    /// user supersedes the earlier one, whose state is cleaned up as if it
    /// had disconnected.
    pub async fn connect(&self, user_id: &str, username: Option<&str>) -> Result<Connection, GatewayError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(GatewayError::unauthorized("identity required"));
        }
        if self.is_shutting_down() {
            return Err(GatewayError::StoreUnavailable);
        }

        if let Some(previous) = self.connections.connection_for_user(user_id) {
            tracing::info!(user_id, connection_id = %previous, "superseding earlier connection");
            self.disconnect(&previous).await;
        }

        let connection_id = prefixed_ulid(prefix::CONNECTION);
        let cancel = self.shutdown.child_token();
        let username = username
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(user_id);

        self.connections.register(ConnectionEntry::new(
            connection_id.clone(),
            user_id.to_string(),
            username.to_string(),
            cancel.clone(),
        ));

        tracing::info!(connection_id = %connection_id, user_id, "connection accepted");

        Ok(Connection {
            connection_id,
            user_id: user_id.to_string(),
            cancel,
        })
    }

    /// Run disconnect handling: hosted sessions are ended, watched sessions
    /// are left. Safe to call more than once; only the first call acts.
    pub async fn disconnect(&self, connection_id: &str) {
        let Some(entry) = self.connections.remove(connection_id) else {
            return;
        };
        entry.cancel.cancel();

        for (session_id, role) in entry.roles {
            let turn = self.queues.acquire(&session_id).await;
            let result = match role {
                Role::Host => self.end_sequence(&session_id).await,
                Role::Viewer => {
                    self.leave_sequence(connection_id, &entry.user_id, &session_id)
                        .await
                }
            };
            drop(turn);
            if let Err(err) = result {
                tracing::warn!(
                    connection_id,
                    session_id = %session_id,
                    %role,
                    %err,
                    "disconnect cleanup incomplete"
                );
            }
        }

        tracing::info!(connection_id, user_id = %entry.user_id, "connection closed");
    }

    /// Disconnect every connection through the normal cleanup path. Actions
    /// already queued for a session complete before its cleanup runs.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let ids = self.connections.ids();
        tracing::info!(connections = ids.len(), "gateway shutting down");
        for id in ids {
            self.disconnect(&id).await;
        }
    }

    // -----------------------------------------------------------------------
    // Actions
    // -----------------------------------------------------------------------

    pub async fn handle_action(&self, connection_id: &str, action: ClientAction) -> Result<(), GatewayError> {
        match action {
            ClientAction::StartSession(session) => {
                self.start_session(connection_id, session).await.map(|_| ())
            }
            ClientAction::EndSession(r) => self.end_session(connection_id, &r.id).await,
            ClientAction::JoinSession(r) => self.join_session(connection_id, &r.id).await.map(|_| ()),
            ClientAction::LeaveSession(r) => self.leave_session(connection_id, &r.id).await,
            ClientAction::UpdatePreview(p) => {
                self.update_preview(connection_id, &p.id, &p.preview_ref)
                    .await
            }
            ClientAction::SendChatMessage(c) => self
                .send_chat_message(connection_id, &c.id, &c.content)
                .await
                .map(|_| ()),
        }
    }

    pub async fn start_session(&self, connection_id: &str, mut session: Session) -> Result<Session, GatewayError> {
        let (user_id, _) = self.identity(connection_id)?;
        if !session.is_creator(&user_id) {
            return Err(GatewayError::unauthorized(
                "Cannot start a session for another user",
            ));
        }
        if session.id.trim().is_empty() {
            return Err(GatewayError::InvalidPayload("Session id is required".to_string()));
        }

        let _turn = self.queues.acquire(&session.id).await;

        if self.registry.get_session(&session.id).await?.is_some() {
            return Err(GatewayError::AlreadyExists(
                "Session already exists".to_string(),
            ));
        }
        if let Some(hosting) = self.connections.hosted_session(connection_id) {
            tracing::debug!(connection_id, hosting = %hosting, "rejecting second hosted session");
            return Err(GatewayError::unauthorized("Already hosting a session"));
        }

        // Client-reported counts are advisory; the room decides.
        session.viewer_count = 0;
        session.created_at = Utc::now();

        self.registry.create_session(&session).await?;
        if let Err(err) = self.claim_host(connection_id, &user_id, &session.id).await {
            if let Err(cleanup) = self.registry.delete_session(&session.id).await {
                tracing::warn!(session_id = %session.id, %cleanup, "failed to roll back session create");
            }
            return Err(err);
        }
        self.rooms.open(&session.id, connection_id);

        tracing::info!(session_id = %session.id, user_id = %user_id, "session started");

        self.emit(Audience::All, ServerEvent::SessionStarted(session.clone()));
        self.emit(
            Audience::Connection(connection_id.to_string()),
            role_changed(&session.id, Some(Role::Host)),
        );
        Ok(session)
    }

    pub async fn end_session(&self, connection_id: &str, session_id: &str) -> Result<(), GatewayError> {
        let (user_id, _) = self.identity(connection_id)?;
        let turn = self.queues.acquire(session_id).await;

        let session = self
            .registry
            .get_session(session_id)
            .await?
            .ok_or_else(GatewayError::not_found)?;
        if !session.is_creator(&user_id) {
            return Err(GatewayError::unauthorized("Only the host can end a session"));
        }

        let result = self.end_sequence(session_id).await;
        drop(turn);

        tracing::info!(session_id, user_id = %user_id, "session ended");
        result
    }

    /// Join as a viewer. Returns the new viewer count.
    pub async fn join_session(&self, connection_id: &str, session_id: &str) -> Result<u64, GatewayError> {
        let (user_id, _) = self.identity(connection_id)?;
        let _turn = self.queues.acquire(session_id).await;

        let session = self
            .registry
            .get_session(session_id)
            .await?
            .ok_or_else(GatewayError::not_found)?;
        if session.is_creator(&user_id) {
            return Err(GatewayError::unauthorized("Cannot view own session"));
        }

        if self.connections.role(connection_id, session_id) == Some(Role::Viewer) {
            // Duplicate join: resync the caller without touching the count.
            self.send_membership(connection_id, session_id, Some(Role::Viewer));
            return Ok(self.rooms.snapshot(session_id).viewer_count());
        }

        if !self
            .connections
            .set_role(connection_id, session_id, Some(Role::Viewer))
        {
            return Err(GatewayError::unauthorized("identity required"));
        }
        let Some(count) = self.rooms.join(session_id, connection_id) else {
            self.connections.set_role(connection_id, session_id, None);
            return Err(GatewayError::not_found());
        };

        if let Err(err) = self.persist_join(session_id, &user_id, count).await {
            self.connections.set_role(connection_id, session_id, None);
            self.rooms.leave(session_id, connection_id);
            if let Err(cleanup) = self.registry.set_role(session_id, &user_id, None).await {
                tracing::warn!(session_id, user_id = %user_id, %cleanup, "failed to roll back viewer role");
            }
            return Err(err.into());
        }

        tracing::info!(session_id, user_id = %user_id, count, "viewer joined");

        self.emit(
            Audience::Room(self.rooms.audience(session_id)),
            ServerEvent::ViewerJoined(ViewerCount {
                id: session_id.to_string(),
                count,
            }),
        );
        self.send_membership(connection_id, session_id, Some(Role::Viewer));
        Ok(count)
    }

    /// Leave a watched session. Idempotent: leaving a session the caller is
    /// not watching does nothing.
    pub async fn leave_session(&self, connection_id: &str, session_id: &str) -> Result<(), GatewayError> {
        let (user_id, _) = self.identity(connection_id)?;
        let _turn = self.queues.acquire(session_id).await;
        self.leave_sequence(connection_id, &user_id, session_id)
            .await
    }

    pub async fn update_preview(
        &self,
        connection_id: &str,
        session_id: &str,
        preview_ref: &str,
    ) -> Result<(), GatewayError> {
        let (user_id, _) = self.identity(connection_id)?;
        let _turn = self.queues.acquire(session_id).await;

        let session = self
            .registry
            .get_session(session_id)
            .await?
            .ok_or_else(GatewayError::not_found)?;
        if !session.is_creator(&user_id) {
            return Err(GatewayError::unauthorized(
                "Only the host can update the preview",
            ));
        }

        self.registry
            .set_preview_reference(session_id, preview_ref)
            .await?;

        self.emit(
            Audience::All,
            ServerEvent::PreviewUpdated(PreviewUpdate {
                id: session_id.to_string(),
                preview_ref: preview_ref.to_string(),
            }),
        );
        Ok(())
    }

    pub async fn send_chat_message(
        &self,
        connection_id: &str,
        session_id: &str,
        content: &str,
    ) -> Result<ChatMessage, GatewayError> {
        let (_, username) = self.identity(connection_id)?;
        let content = content.trim();
        if content.is_empty() {
            return Err(GatewayError::InvalidPayload(
                "Message content is required".to_string(),
            ));
        }
        if content.chars().count() > self.max_chat_length {
            return Err(GatewayError::InvalidPayload(format!(
                "Message must be {} characters or fewer",
                self.max_chat_length
            )));
        }

        let _turn = self.queues.acquire(session_id).await;
        if self.connections.role(connection_id, session_id).is_none() {
            return Err(GatewayError::unauthorized("Join the session before chatting"));
        }

        let message = ChatMessage {
            timestamp: Utc::now(),
            username,
            content: content.to_string(),
        };
        self.chat.append(session_id, message.clone());

        self.emit(
            Audience::Room(self.rooms.audience(session_id)),
            ServerEvent::ChatMessage(ChatEvent {
                id: session_id.to_string(),
                message: message.clone(),
            }),
        );
        Ok(message)
    }

    // -----------------------------------------------------------------------
    // Compensating sequences (caller holds the session's queue)
    // -----------------------------------------------------------------------

    /// Tear down a session: clear every member's role, delete the registry
    /// entry, and announce the end. Registry deletion is attempted no matter
    /// how member cleanup went; member failures are only logged.
    async fn end_sequence(&self, session_id: &str) -> Result<(), GatewayError> {
        let room = self.rooms.close(session_id).unwrap_or_default();

        for viewer in &room.viewers {
            let identity = self.connections.identity(viewer);
            self.connections.set_role(viewer, session_id, None);
            if let Some((user_id, _)) = identity {
                if let Err(err) = self.registry.set_role(session_id, &user_id, None).await {
                    tracing::warn!(session_id, user_id = %user_id, %err, "failed to clear viewer role");
                }
            }
            self.emit(
                Audience::Connection(viewer.clone()),
                role_changed(session_id, None),
            );
        }
        if let Some(host) = &room.host {
            self.connections.set_role(host, session_id, None);
            self.emit(
                Audience::Connection(host.clone()),
                role_changed(session_id, None),
            );
        }
        self.chat.clear(session_id);

        let deleted = self.registry.delete_session(session_id).await;
        if let Err(err) = &deleted {
            tracing::error!(session_id, %err, "failed to delete ended session");
        }

        self.emit(
            Audience::All,
            ServerEvent::SessionEnded(SessionRef {
                id: session_id.to_string(),
            }),
        );
        deleted.map_err(GatewayError::from)
    }

    /// Remove a viewer from a room, persist the recomputed count, and tell
    /// the remaining room. Nothing is broadcast if the connection was not a
    /// viewer.
    async fn leave_sequence(&self, connection_id: &str, user_id: &str, session_id: &str) -> Result<(), GatewayError> {
        let had_role = self.connections.role(connection_id, session_id) == Some(Role::Viewer);
        if had_role {
            self.connections.set_role(connection_id, session_id, None);
            self.emit(
                Audience::Connection(connection_id.to_string()),
                role_changed(session_id, None),
            );
        }

        let Some(count) = self.rooms.leave(session_id, connection_id) else {
            return Ok(());
        };

        let cleared = self.registry.set_role(session_id, user_id, None).await;
        let persisted = self.registry.set_viewer_count(session_id, count).await;

        tracing::info!(session_id, user_id, count, "viewer left");

        self.emit(
            Audience::Room(self.rooms.audience(session_id)),
            ServerEvent::ViewerLeft(ViewerCount {
                id: session_id.to_string(),
                count,
            }),
        );
        cleared.and(persisted).map_err(GatewayError::from)
    }

    async fn claim_host(&self, connection_id: &str, user_id: &str, session_id: &str) -> Result<(), GatewayError> {
        self.registry
            .set_role(session_id, user_id, Some(Role::Host))
            .await?;
        if !self
            .connections
            .set_role(connection_id, session_id, Some(Role::Host))
        {
            return Err(GatewayError::unauthorized("identity required"));
        }
        Ok(())
    }

    async fn persist_join(&self, session_id: &str, user_id: &str, count: u64) -> Result<(), RegistryError> {
        self.registry
            .set_role(session_id, user_id, Some(Role::Viewer))
            .await?;
        self.registry.set_viewer_count(session_id, count).await
    }

    /// Tell one connection its role plus the chat snapshot for the session.
    fn send_membership(&self, connection_id: &str, session_id: &str, role: Option<Role>) {
        let target = Audience::Connection(connection_id.to_string());
        self.emit(target.clone(), role_changed(session_id, role));
        self.emit(
            target,
            ServerEvent::ChatHistory(ChatHistory {
                id: session_id.to_string(),
                messages: self.chat.snapshot(session_id),
            }),
        );
    }

    fn identity(&self, connection_id: &str) -> Result<(String, String), GatewayError> {
        self.connections
            .identity(connection_id)
            .ok_or_else(|| GatewayError::unauthorized("identity required"))
    }

    fn emit(&self, audience: Audience, event: ServerEvent) {
        self.broadcast.dispatch(audience, event);
    }
}

fn role_changed(session_id: &str, role: Option<Role>) -> ServerEvent {
    ServerEvent::RoleChanged(RoleChange {
        id: session_id.to_string(),
        role,
    })
}
