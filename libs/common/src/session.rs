//! Session, role, and chat records shared by the gateway and its clients.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A participant's relationship to a session. "None" is modelled as the
/// absence of a role (`Option<Role>`), which serializes as `null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Viewer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host => f.write_str("host"),
            Role::Viewer => f.write_str("viewer"),
        }
    }
}

/// Descriptive metadata attached to a session at start time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Reference to the latest preview image (opaque to the gateway).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_ref: Option<String>,
}

/// One broadcast unit: exactly one host and zero or more viewers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub title: String,
    pub creator_id: String,
    pub created_at: DateTime<Utc>,
    /// Authoritative only when written by the gateway; client-supplied
    /// values are ignored.
    #[serde(default)]
    pub viewer_count: u64,
    #[serde(default)]
    pub metadata: SessionMetadata,
}

impl Session {
    /// Build a fresh session owned by `creator_id`.
    pub fn new(id: impl Into<String>, title: impl Into<String>, creator_id: impl Into<String>) -> Self {
        let title = title.into();
        Self {
            id: id.into(),
            metadata: SessionMetadata {
                title: title.clone(),
                ..SessionMetadata::default()
            },
            title,
            creator_id: creator_id.into(),
            created_at: Utc::now(),
            viewer_count: 0,
        }
    }

    pub fn is_creator(&self, user_id: &str) -> bool {
        self.creator_id == user_id
    }
}

/// A single chat line in a session's in-memory log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub timestamp: DateTime<Utc>,
    pub username: String,
    pub content: String,
}
