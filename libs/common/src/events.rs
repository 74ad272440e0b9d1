//! Gateway opcodes, event types, and wire-format messages.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::{ChatMessage, Role, Session};

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

pub const OP_DISPATCH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_ACTION: u8 = 4;
pub const OP_HEARTBEAT_ACK: u8 = 6;
pub const OP_RECONNECT: u8 = 7;

// ---------------------------------------------------------------------------
// Server → Client message
// ---------------------------------------------------------------------------

/// A message sent from the server to the client over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default)]
    pub d: Value,
}

impl GatewayMessage {
    /// Build a DISPATCH message (op=0) carrying a typed event.
    pub fn dispatch(event: &ServerEvent, seq: u64) -> Self {
        let (t, d) = split_tagged(event);
        Self {
            op: OP_DISPATCH,
            t,
            s: Some(seq),
            d,
        }
    }

    /// Build a RECONNECT message (op=7) telling the client to open a new connection.
    pub fn reconnect(reason: &str) -> Self {
        Self {
            op: OP_RECONNECT,
            t: None,
            s: None,
            d: serde_json::json!({ "reason": reason }),
        }
    }

    /// Build a HEARTBEAT_ACK message (op=6).
    pub fn heartbeat_ack(seq: u64) -> Self {
        Self {
            op: OP_HEARTBEAT_ACK,
            t: None,
            s: None,
            d: serde_json::json!({ "ack": seq }),
        }
    }

    /// Decode the typed event of a DISPATCH message. Returns `None` for
    /// every other opcode.
    pub fn event(&self) -> Option<Result<ServerEvent, serde_json::Error>> {
        if self.op != OP_DISPATCH {
            return None;
        }
        let t = self.t.as_deref()?;
        Some(join_tagged(t, self.d.clone()))
    }
}

// ---------------------------------------------------------------------------
// Client → Server message
// ---------------------------------------------------------------------------

/// A message received from the client over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub op: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    #[serde(default)]
    pub d: Value,
}

impl ClientMessage {
    /// Wrap an action (op=4).
    pub fn action(action: &ClientAction) -> Self {
        let (t, d) = split_tagged(action);
        Self {
            op: OP_ACTION,
            t,
            d,
        }
    }

    /// Build a HEARTBEAT (op=1) acknowledging the last seen sequence number.
    pub fn heartbeat(seq: u64) -> Self {
        Self {
            op: OP_HEARTBEAT,
            t: None,
            d: serde_json::json!({ "seq": seq }),
        }
    }

    /// Decode the typed action carried by an ACTION message.
    pub fn to_action(&self) -> Result<ClientAction, serde_json::Error> {
        let t = self.t.as_deref().unwrap_or_default();
        join_tagged(t, self.d.clone())
    }
}

// ---------------------------------------------------------------------------
// HEARTBEAT payload
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default)]
    pub seq: u64,
}

// ---------------------------------------------------------------------------
// Event and action payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyPayload {
    pub connection_id: String,
    pub user_id: String,
    pub heartbeat_interval: u64,
}

/// Payload that only names a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRef {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewerCount {
    pub id: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewUpdate {
    pub id: String,
    #[serde(rename = "ref")]
    pub preview_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEvent {
    pub id: String,
    pub message: ChatMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatHistory {
    pub id: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSend {
    pub id: String,
    pub content: String,
}

/// `role: null` means the role for that session was cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleChange {
    pub id: String,
    pub role: Option<Role>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub message: String,
    pub status_code: u16,
}

// ---------------------------------------------------------------------------
// Dispatch event types
// ---------------------------------------------------------------------------

/// Events dispatched to clients. The serde tag doubles as the `t` field of
/// the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "t", content = "d", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerEvent {
    Ready(ReadyPayload),
    SessionStarted(Session),
    SessionEnded(SessionRef),
    ViewerJoined(ViewerCount),
    ViewerLeft(ViewerCount),
    PreviewUpdated(PreviewUpdate),
    ChatMessage(ChatEvent),
    ChatHistory(ChatHistory),
    RoleChanged(RoleChange),
    Error(ErrorPayload),
}

impl ServerEvent {
    pub fn error(message: impl Into<String>, status_code: u16) -> Self {
        ServerEvent::Error(ErrorPayload {
            message: message.into(),
            status_code,
        })
    }

    /// The session this event is about, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ServerEvent::Ready(_) | ServerEvent::Error(_) => None,
            ServerEvent::SessionStarted(s) => Some(&s.id),
            ServerEvent::SessionEnded(r) => Some(&r.id),
            ServerEvent::ViewerJoined(c) | ServerEvent::ViewerLeft(c) => Some(&c.id),
            ServerEvent::PreviewUpdated(p) => Some(&p.id),
            ServerEvent::ChatMessage(c) => Some(&c.id),
            ServerEvent::ChatHistory(h) => Some(&h.id),
            ServerEvent::RoleChanged(r) => Some(&r.id),
        }
    }
}

/// Actions a client may ask the gateway to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "t", content = "d", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientAction {
    StartSession(Session),
    EndSession(SessionRef),
    JoinSession(SessionRef),
    LeaveSession(SessionRef),
    UpdatePreview(PreviewUpdate),
    SendChatMessage(ChatSend),
}

impl ClientAction {
    pub fn session_id(&self) -> &str {
        match self {
            ClientAction::StartSession(s) => &s.id,
            ClientAction::EndSession(r)
            | ClientAction::JoinSession(r)
            | ClientAction::LeaveSession(r) => &r.id,
            ClientAction::UpdatePreview(p) => &p.id,
            ClientAction::SendChatMessage(c) => &c.id,
        }
    }
}

/// Split an adjacently tagged value into its `(t, d)` parts.
fn split_tagged<T: Serialize>(value: &T) -> (Option<String>, Value) {
    match serde_json::to_value(value) {
        Ok(Value::Object(mut map)) => {
            let t = map
                .remove("t")
                .and_then(|t| t.as_str().map(str::to_string));
            (t, map.remove("d").unwrap_or(Value::Null))
        }
        _ => (None, Value::Null),
    }
}

fn join_tagged<T: DeserializeOwned>(t: &str, d: Value) -> Result<T, serde_json::Error> {
    serde_json::from_value(serde_json::json!({ "t": t, "d": d }))
}
