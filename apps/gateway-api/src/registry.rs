//! Session registry: the authoritative record of live sessions, persisted as
//! full JSON records in a shared hash keyed by session id.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use livecast_common::{Role, Session};
use serde::{Deserialize, Serialize};

use crate::db::kv::{KeyValueStore, StoreError};

/// Hash holding one field per session id.
const SESSIONS_KEY: &str = "livecast:sessions";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session already exists: {0}")]
    AlreadyExists(String),
    #[error("session store unavailable")]
    StoreUnavailable,
    #[error("corrupt record for session {id}")]
    Corrupt {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// The persisted value for one session: the public record plus the role
/// held by each participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionRecord {
    session: Session,
    #[serde(default)]
    roles: BTreeMap<String, Role>,
}

/// Registry client. Cheap to clone; every clone shares the same store.
#[derive(Clone)]
pub struct SessionRegistry {
    store: Arc<dyn KeyValueStore>,
    timeout: Duration,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Persist a new session. Fails with `AlreadyExists` if the id is taken.
    pub async fn create_session(&self, session: &Session) -> Result<(), RegistryError> {
        let record = SessionRecord {
            session: session.clone(),
            roles: BTreeMap::new(),
        };
        let value = encode(&record)?;
        let created = self
            .call("create", self.store.hset_nx(SESSIONS_KEY, &session.id, &value))
            .await?;
        if !created {
            return Err(RegistryError::AlreadyExists(session.id.clone()));
        }
        Ok(())
    }

    pub async fn delete_session(&self, id: &str) -> Result<(), RegistryError> {
        self.call("delete", self.store.hdel(SESSIONS_KEY, id)).await
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>, RegistryError> {
        Ok(self.load(id).await?.map(|record| record.session))
    }

    /// All registered sessions, in no particular order. Unreadable records
    /// are skipped.
    pub async fn list_sessions(&self) -> Result<Vec<Session>, RegistryError> {
        let entries = self.call("list", self.store.hgetall(SESSIONS_KEY)).await?;
        let mut sessions = Vec::with_capacity(entries.len());
        for (id, raw) in entries {
            match decode(&id, &raw) {
                Ok(record) => sessions.push(record.session),
                Err(err) => tracing::warn!(session_id = %id, ?err, "skipping unreadable session record"),
            }
        }
        Ok(sessions)
    }

    pub async fn set_viewer_count(&self, id: &str, count: u64) -> Result<(), RegistryError> {
        self.update(id, |record| record.session.viewer_count = count)
            .await
    }

    /// Record `role` for `user_id`, or clear it when `role` is `None`.
    pub async fn set_role(
        &self,
        id: &str,
        user_id: &str,
        role: Option<Role>,
    ) -> Result<(), RegistryError> {
        self.update(id, |record| match role {
            Some(role) => {
                record.roles.insert(user_id.to_string(), role);
            }
            None => {
                record.roles.remove(user_id);
            }
        })
        .await
    }

    pub async fn set_preview_reference(&self, id: &str, preview_ref: &str) -> Result<(), RegistryError> {
        self.update(id, |record| {
            record.session.metadata.preview_ref = Some(preview_ref.to_string())
        })
        .await
    }

    /// Roles recorded for a session; empty when the session is absent.
    pub async fn roles(&self, id: &str) -> Result<BTreeMap<String, Role>, RegistryError> {
        Ok(self
            .load(id)
            .await?
            .map(|record| record.roles)
            .unwrap_or_default())
    }

    async fn load(&self, id: &str) -> Result<Option<SessionRecord>, RegistryError> {
        let raw = self.call("get", self.store.hget(SESSIONS_KEY, id)).await?;
        raw.map(|raw| decode(id, &raw)).transpose()
    }

    /// Read-modify-write of a whole record. Missing ids are a no-op.
    async fn update<F>(&self, id: &str, apply: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut SessionRecord),
    {
        let Some(mut record) = self.load(id).await? else {
            return Ok(());
        };
        apply(&mut record);
        let value = encode(&record)?;
        self.call("update", self.store.hset(SESSIONS_KEY, id, &value))
            .await
    }

    /// Run a store call under the configured timeout, collapsing every
    /// backend failure into `StoreUnavailable`.
    async fn call<T, F>(&self, op: &'static str, fut: F) -> Result<T, RegistryError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                tracing::error!(op, %err, "session store error");
                Err(RegistryError::StoreUnavailable)
            }
            Err(_) => {
                tracing::error!(op, timeout_ms = self.timeout.as_millis() as u64, "session store timed out");
                Err(RegistryError::StoreUnavailable)
            }
        }
    }
}

fn encode(record: &SessionRecord) -> Result<String, RegistryError> {
    serde_json::to_string(record).map_err(|source| RegistryError::Corrupt {
        id: record.session.id.clone(),
        source,
    })
}

fn decode(id: &str, raw: &str) -> Result<SessionRecord, RegistryError> {
    serde_json::from_str(raw).map_err(|source| RegistryError::Corrupt {
        id: id.to_string(),
        source,
    })
}
