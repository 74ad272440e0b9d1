#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use livecast_client::media::{JoinParams, LocalTrack, MediaTransport, RemoteTrack, Renderer, TokenProvider, TrackKind};
use livecast_client::{ClientConfig, ClientError, ConnectionStatus, Signaling, StreamController};
use livecast_common::{Role, Session};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::time;

pub const WAIT: Duration = Duration::from_secs(5);

/// Short timings so failure paths finish quickly.
pub fn test_config() -> ClientConfig {
    ClientConfig {
        track_backoff: Duration::from_millis(10),
        track_attempts: 3,
        host_wait: Duration::from_millis(100),
        confirm_timeout: Duration::from_millis(500),
        ..ClientConfig::new("ws://127.0.0.1:1/gateway", "test-app")
    }
}

pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    let wait = async {
        while !check() {
            time::sleep(Duration::from_millis(10)).await;
        }
    };
    time::timeout(WAIT, wait)
        .await
        .expect("condition not reached in time");
}

pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    time::timeout(WAIT, fut).await.expect("timed out")
}

// ---------------------------------------------------------------------------
// Signaling
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct SignalingLog {
    pub started: Vec<String>,
    pub joined: Vec<String>,
    pub left: Vec<String>,
    pub ended: Vec<String>,
    pub reconnects: u32,
}

pub struct FakeSignaling {
    user_id: String,
    status: watch::Sender<ConnectionStatus>,
    roles: Mutex<HashMap<String, Role>>,
    live_hosts: Mutex<HashMap<String, Session>>,
    /// Fail the next N start/join announcements.
    pub announce_failures: AtomicU32,
    /// Confirm actions without recording a role, so viewer guards fail.
    pub withhold_roles: Mutex<bool>,
    pub log: Mutex<SignalingLog>,
}

impl FakeSignaling {
    pub fn new(user_id: &str) -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus::Connected);
        Arc::new(Self {
            user_id: user_id.to_string(),
            status,
            roles: Mutex::new(HashMap::new()),
            live_hosts: Mutex::new(HashMap::new()),
            announce_failures: AtomicU32::new(0),
            withhold_roles: Mutex::new(false),
            log: Mutex::new(SignalingLog::default()),
        })
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }

    pub fn host_is_live(&self, session: Session) {
        self.live_hosts.lock().insert(session.id.clone(), session);
    }

    /// The gateway dropped every role, as it does when a connection goes away.
    pub fn drop_roles(&self) {
        self.roles.lock().clear();
    }

    fn announce(&self, session_id: &str, role: Role) -> Result<(), ClientError> {
        if self
            .announce_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ClientError::Signaling("announce failed".to_string()));
        }
        if !*self.withhold_roles.lock() {
            self.roles.lock().insert(session_id.to_string(), role);
        }
        Ok(())
    }
}

#[async_trait]
impl Signaling for FakeSignaling {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    fn role(&self, session_id: &str) -> Option<Role> {
        self.roles.lock().get(session_id).copied()
    }

    async fn reconnect(&self) -> Result<(), ClientError> {
        self.log.lock().reconnects += 1;
        self.status.send_replace(ConnectionStatus::Connected);
        Ok(())
    }

    async fn wait_for_host(&self, session_id: &str, wait: Duration) -> Result<Session, ClientError> {
        let found = self.live_hosts.lock().get(session_id).cloned();
        match found {
            Some(session) => Ok(session),
            None => {
                time::sleep(wait).await;
                Err(ClientError::HostNotActive(session_id.to_string()))
            }
        }
    }

    async fn start_session(&self, session: Session, _timeout: Duration) -> Result<Session, ClientError> {
        self.announce(&session.id, Role::Host)?;
        self.log.lock().started.push(session.id.clone());
        self.live_hosts.lock().insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn join_session(&self, session_id: &str, _timeout: Duration) -> Result<(), ClientError> {
        self.announce(session_id, Role::Viewer)?;
        self.log.lock().joined.push(session_id.to_string());
        Ok(())
    }

    async fn leave_session(&self, session_id: &str) -> Result<(), ClientError> {
        self.roles.lock().remove(session_id);
        self.log.lock().left.push(session_id.to_string());
        Ok(())
    }

    async fn end_session(&self, session_id: &str) -> Result<(), ClientError> {
        self.roles.lock().remove(session_id);
        self.live_hosts.lock().remove(session_id);
        self.log.lock().ended.push(session_id.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Media transport
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct TransportLog {
    pub joins: Vec<JoinParams>,
    pub leaves: u32,
    pub created: Vec<LocalTrack>,
    pub released: Vec<LocalTrack>,
    pub published: Vec<LocalTrack>,
    pub unpublished: Vec<LocalTrack>,
    pub publish_calls: u32,
}

pub struct FakeTransport {
    status: watch::Sender<ConnectionStatus>,
    remote: broadcast::Sender<RemoteTrack>,
    next_id: AtomicU32,
    /// Fail the next N video track creations.
    pub video_failures: AtomicU32,
    /// Fail the next N audio track creations.
    pub audio_failures: AtomicU32,
    /// Fail the next N publish calls.
    pub publish_failures: AtomicU32,
    /// Hold track creation until released, to test cancellation.
    pub stall_tracks: Mutex<bool>,
    pub log: Mutex<TransportLog>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (remote, _) = broadcast::channel(16);
        Arc::new(Self {
            status,
            remote,
            next_id: AtomicU32::new(1),
            video_failures: AtomicU32::new(0),
            audio_failures: AtomicU32::new(0),
            publish_failures: AtomicU32::new(0),
            stall_tracks: Mutex::new(false),
            log: Mutex::new(TransportLog::default()),
        })
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }

    pub fn announce_remote(&self, track: RemoteTrack) {
        let _ = self.remote.send(track);
    }

    /// Tracks created and not yet released.
    pub fn live_tracks(&self) -> usize {
        let log = self.log.lock();
        log.created.len() - log.released.len()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    async fn join(&self, params: &JoinParams) -> Result<(), ClientError> {
        self.log.lock().joins.push(params.clone());
        self.status.send_replace(ConnectionStatus::Connected);
        Ok(())
    }

    async fn publish(&self, tracks: &[LocalTrack]) -> Result<(), ClientError> {
        self.log.lock().publish_calls += 1;
        if Self::take_failure(&self.publish_failures) {
            // Half-published: the first track made it.
            if let Some(first) = tracks.first() {
                self.log.lock().published.push(first.clone());
            }
            return Err(ClientError::Transport("publish failed".to_string()));
        }
        let mut log = self.log.lock();
        for track in tracks {
            if !log.published.contains(track) {
                log.published.push(track.clone());
            }
        }
        Ok(())
    }

    async fn unpublish(&self, tracks: &[LocalTrack]) -> Result<(), ClientError> {
        let mut log = self.log.lock();
        log.published.retain(|t| !tracks.contains(t));
        log.unpublished.extend(tracks.iter().cloned());
        Ok(())
    }

    async fn leave(&self) -> Result<(), ClientError> {
        self.log.lock().leaves += 1;
        self.status.send_replace(ConnectionStatus::Disconnected);
        Ok(())
    }

    async fn create_local_track(&self, kind: TrackKind, _device_id: Option<&str>) -> Result<LocalTrack, ClientError> {
        while *self.stall_tracks.lock() {
            time::sleep(Duration::from_millis(5)).await;
        }
        let failures = match kind {
            TrackKind::Video => &self.video_failures,
            TrackKind::Audio => &self.audio_failures,
        };
        if Self::take_failure(failures) {
            return Err(ClientError::MediaInitFailed(format!("{kind:?} device busy")));
        }
        let track = LocalTrack {
            id: format!("track-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
            kind,
        };
        self.log.lock().created.push(track.clone());
        Ok(track)
    }

    async fn release_track(&self, track: &LocalTrack) {
        self.log.lock().released.push(track.clone());
    }

    fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    fn remote_published(&self) -> broadcast::Receiver<RemoteTrack> {
        self.remote.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Tokens and rendering
// ---------------------------------------------------------------------------

pub struct FakeTokens;

#[async_trait]
impl TokenProvider for FakeTokens {
    async fn token(&self, channel: &str, uid: &str, role: Role) -> Result<String, ClientError> {
        Ok(format!("{channel}:{uid}:{role}"))
    }
}

#[derive(Default)]
pub struct RecordingRenderer {
    pub local: Mutex<Vec<(String, LocalTrack)>>,
    pub remote: Mutex<Vec<(String, RemoteTrack)>>,
    pub cleared: Mutex<Vec<String>>,
}

impl RecordingRenderer {
    pub fn attached(&self, session_id: &str) -> usize {
        self.local
            .lock()
            .iter()
            .filter(|(s, _)| s == session_id)
            .count()
    }
}

impl Renderer for RecordingRenderer {
    fn render_local(&self, session_id: &str, track: &LocalTrack) {
        self.local.lock().push((session_id.to_string(), track.clone()));
    }

    fn render_remote(&self, session_id: &str, track: &RemoteTrack) {
        self.remote.lock().push((session_id.to_string(), track.clone()));
    }

    fn detach(&self, session_id: &str, track: &LocalTrack) {
        self.local
            .lock()
            .retain(|(s, t)| !(s == session_id && t == track));
    }

    fn clear(&self, session_id: &str) {
        self.local.lock().retain(|(s, _)| s != session_id);
        self.remote.lock().retain(|(s, _)| s != session_id);
        self.cleared.lock().push(session_id.to_string());
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub controller: StreamController,
    pub signaling: Arc<FakeSignaling>,
    /// Transport of the `live_1` channel, which most tests drive.
    pub transport: Arc<FakeTransport>,
    pub transports: Arc<Mutex<HashMap<String, Arc<FakeTransport>>>>,
    pub renderer: Arc<RecordingRenderer>,
}

impl Harness {
    /// The transport the controller was handed for `channel`.
    pub fn transport_for(&self, channel: &str) -> Arc<FakeTransport> {
        fake_transport(&self.transports, channel)
    }
}

fn fake_transport(transports: &Mutex<HashMap<String, Arc<FakeTransport>>>, channel: &str) -> Arc<FakeTransport> {
    transports
        .lock()
        .entry(channel.to_string())
        .or_insert_with(FakeTransport::new)
        .clone()
}

pub fn harness(user_id: &str) -> Harness {
    harness_with(user_id, test_config())
}

/// One fake transport per channel, reused across resets of that channel.
pub fn harness_with(user_id: &str, config: ClientConfig) -> Harness {
    let signaling = FakeSignaling::new(user_id);
    let transports: Arc<Mutex<HashMap<String, Arc<FakeTransport>>>> = Arc::default();
    let transport = fake_transport(&transports, "live_1");
    let renderer = Arc::new(RecordingRenderer::default());

    let factory = {
        let transports = transports.clone();
        move |channel: &str| -> Arc<dyn MediaTransport> { fake_transport(&transports, channel) }
    };
    let controller = StreamController::new(
        config,
        signaling.clone(),
        Arc::new(factory),
        Arc::new(FakeTokens),
        renderer.clone(),
    );
    Harness {
        controller,
        signaling,
        transport,
        transports,
        renderer,
    }
}
