//! Seams to the external media collaborators: the real-time transport, the
//! token issuer, and the render target.

use std::sync::Arc;

use async_trait::async_trait;
use livecast_common::Role;
use tokio::sync::{broadcast, watch};

use crate::error::ClientError;
use crate::status::ConnectionStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A local capture track owned by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Credentials for one channel join. Kept so a restore can rejoin with the
/// same values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinParams {
    pub app_id: String,
    pub channel: String,
    pub token: String,
    pub uid: String,
}

/// A remote participant published a track on the joined channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub uid: String,
    pub kind: TrackKind,
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn join(&self, params: &JoinParams) -> Result<(), ClientError>;
    async fn publish(&self, tracks: &[LocalTrack]) -> Result<(), ClientError>;
    async fn unpublish(&self, tracks: &[LocalTrack]) -> Result<(), ClientError>;
    async fn leave(&self) -> Result<(), ClientError>;
    async fn create_local_track(&self, kind: TrackKind, device_id: Option<&str>) -> Result<LocalTrack, ClientError>;
    /// Stop capture and free the device.
    async fn release_track(&self, track: &LocalTrack);
    /// Transport connection state, in the same vocabulary as signaling.
    fn status(&self) -> watch::Receiver<ConnectionStatus>;
    fn remote_published(&self) -> broadcast::Receiver<RemoteTrack>;
}

/// Builds the transport for one session channel. Every stream context gets
/// its own.
pub trait TransportFactory: Send + Sync {
    fn create(&self, channel: &str) -> Arc<dyn MediaTransport>;
}

impl<F> TransportFactory for F
where
    F: Fn(&str) -> Arc<dyn MediaTransport> + Send + Sync,
{
    fn create(&self, channel: &str) -> Arc<dyn MediaTransport> {
        self(channel)
    }
}

/// Issues a time-boxed credential for a channel; called before every join.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self, channel: &str, uid: &str, role: Role) -> Result<String, ClientError>;
}

pub trait Renderer: Send + Sync {
    fn render_local(&self, session_id: &str, track: &LocalTrack);
    fn render_remote(&self, session_id: &str, track: &RemoteTrack);
    fn detach(&self, session_id: &str, track: &LocalTrack);
    /// Drop everything rendered for the session.
    fn clear(&self, session_id: &str);
}
