//! Stream controller: one state machine context per session id, sequencing
//! local media setup against gateway confirmation.
//!
//! Operations on one session id run one at a time. Cleanup cancels whatever
//! is in flight for that id first, then waits its turn; a second cleanup
//! queued behind the first finds nothing left to do.
//!
//! Each context owns its own media transport, so sessions never share a
//! channel or its connection status.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use livecast_common::{Role, Session};
use parking_lot::Mutex;
use tokio::sync::{broadcast, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::machine::{GuardContext, StateMachine, StreamState, TransitionRecord};
use crate::media::{JoinParams, LocalTrack, MediaTransport, Renderer, TokenProvider, TrackKind, TransportFactory};
use crate::retry::{RetryError, RetryPolicy};
use crate::signaling::Signaling;
use crate::status::{self, ConnectionStatus};

/// What to bring up for a session.
#[derive(Debug, Clone)]
pub enum StreamRequest {
    /// Publish local media and announce `Session` once it is flowing.
    Host(Session),
    /// Watch an existing session.
    Viewer(String),
}

impl StreamRequest {
    pub fn session_id(&self) -> &str {
        match self {
            StreamRequest::Host(session) => &session.id,
            StreamRequest::Viewer(id) => id,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            StreamRequest::Host(_) => Role::Host,
            StreamRequest::Viewer(_) => Role::Viewer,
        }
    }
}

/// Component-level recovery: throw the session's context away and start over.
#[async_trait]
pub trait Recover {
    async fn reset(&self, session_id: &str) -> Result<StreamState, ClientError>;
}

struct StreamContext {
    request: StreamRequest,
    transport: Arc<dyn MediaTransport>,
    machine: Mutex<StateMachine>,
    tracks: Mutex<Vec<LocalTrack>>,
    published: Mutex<Vec<LocalTrack>>,
    join_params: Mutex<Option<JoinParams>>,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl StreamContext {
    fn new(request: StreamRequest, transport: Arc<dyn MediaTransport>, history_capacity: usize) -> Self {
        Self {
            machine: Mutex::new(StateMachine::new(request.role(), history_capacity)),
            request,
            transport,
            tracks: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            join_params: Mutex::new(None),
            cancel: CancellationToken::new(),
            supervisor: Mutex::new(None),
        }
    }

    fn session_id(&self) -> &str {
        self.request.session_id()
    }

    fn role(&self) -> Role {
        self.request.role()
    }

    fn state(&self) -> StreamState {
        self.machine.lock().state()
    }

    /// Move to `to` regardless of the adjacency table.
    fn force(&self, to: StreamState) {
        if let Err(err) = self.machine.lock().force(to) {
            tracing::debug!(session_id = %self.session_id(), %to, %err, "forced transition refused");
        }
    }
}

/// Exclusive turn on one session id, released on drop. The lock is pruned
/// once nobody else holds or waits on it.
struct Turn {
    inner: Arc<ControllerInner>,
    session_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for Turn {
    fn drop(&mut self) {
        self.guard.take();
        self.inner
            .turns
            .remove_if(&self.session_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

struct ControllerInner {
    config: ClientConfig,
    signaling: Arc<dyn Signaling>,
    transports: Arc<dyn TransportFactory>,
    tokens: Arc<dyn TokenProvider>,
    renderer: Arc<dyn Renderer>,
    contexts: DashMap<String, Arc<StreamContext>>,
    turns: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

#[derive(Clone)]
pub struct StreamController {
    inner: Arc<ControllerInner>,
}

impl StreamController {
    pub fn new(
        config: ClientConfig,
        signaling: Arc<dyn Signaling>,
        transports: Arc<dyn TransportFactory>,
        tokens: Arc<dyn TokenProvider>,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                config,
                signaling,
                transports,
                tokens,
                renderer,
                contexts: DashMap::new(),
                turns: DashMap::new(),
            }),
        }
    }

    pub fn state(&self, session_id: &str) -> Option<StreamState> {
        self.inner.contexts.get(session_id).map(|ctx| ctx.state())
    }

    pub fn history(&self, session_id: &str) -> Vec<TransitionRecord> {
        self.inner
            .contexts
            .get(session_id)
            .map(|ctx| ctx.machine.lock().history())
            .unwrap_or_default()
    }

    pub fn active_sessions(&self) -> Vec<String> {
        self.inner.contexts.iter().map(|e| e.key().clone()).collect()
    }

    // -----------------------------------------------------------------------
    // Public lifecycle
    // -----------------------------------------------------------------------

    /// Bring a session to `READY`. A failure cleans up and retries once from
    /// scratch; a second failure leaves no context behind.
    pub async fn initialize(&self, request: StreamRequest) -> Result<StreamState, ClientError> {
        let session_id = request.session_id().to_string();
        match self.try_initialize(&request).await {
            Ok(state) => Ok(state),
            Err(ClientError::Cancelled) => Err(ClientError::Cancelled),
            Err(err) if matches!(err, ClientError::InvalidTransition { .. }) && self.state(&session_id).is_some() => {
                // Already running; leave the existing context alone.
                Err(err)
            }
            Err(err) => {
                tracing::warn!(session_id = %session_id, %err, "initialize failed, retrying from scratch");
                self.cleanup(&session_id).await;
                let retried = self.try_initialize(&request).await;
                if let Err(err) = &retried {
                    tracing::error!(session_id = %session_id, %err, "initialize failed twice");
                    self.cleanup(&session_id).await;
                }
                retried
            }
        }
    }

    /// `READY -> LAUNCHING -> LIVE`. Guard failures leave the state where it
    /// was; runtime failures go through the recovery policy.
    pub async fn launch(&self, session_id: &str) -> Result<StreamState, ClientError> {
        let ctx = self.context(session_id)?;
        let _turn = self.turn(session_id).await;
        if ctx.cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }

        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => Err(ClientError::Cancelled),
            result = self.run_launch(&ctx) => result,
        };

        match result {
            Ok(()) => {
                self.spawn_supervisor(&ctx);
                Ok(ctx.state())
            }
            Err(err) if err.is_state_error() || matches!(err, ClientError::Cancelled) => Err(err),
            Err(err) => self.recover(&ctx, err).await.map(|_| ctx.state()),
        }
    }

    /// Leave the session the way its role requires, then clean up.
    pub async fn end(&self, session_id: &str) -> Result<(), ClientError> {
        let ctx = self.context(session_id)?;
        let announced = match ctx.role() {
            Role::Host => self.inner.signaling.end_session(session_id).await,
            Role::Viewer => self.inner.signaling.leave_session(session_id).await,
        };
        if let Err(err) = &announced {
            tracing::warn!(session_id, %err, "could not announce end; cleaning up anyway");
        }
        self.cleanup(session_id).await;
        announced
    }

    /// Cancel anything in flight for `session_id` and release every resource
    /// it holds. Idempotent.
    pub async fn cleanup(&self, session_id: &str) {
        if let Some(ctx) = self.inner.contexts.get(session_id).map(|c| c.clone()) {
            ctx.cancel.cancel();
        }
        let _turn = self.turn(session_id).await;
        let Some(ctx) = self.inner.contexts.get(session_id).map(|c| c.clone()) else {
            return;
        };
        self.teardown(&ctx).await;
    }

    // -----------------------------------------------------------------------
    // Sequences
    // -----------------------------------------------------------------------

    async fn try_initialize(&self, request: &StreamRequest) -> Result<StreamState, ClientError> {
        let session_id = request.session_id();
        let _turn = self.turn(session_id).await;

        if let Some(existing) = self.inner.contexts.get(session_id).map(|c| c.clone()) {
            return Err(ClientError::InvalidTransition {
                from: existing.state(),
                to: StreamState::Initializing,
            });
        }

        let transport = self.inner.transports.create(session_id);
        let ctx = Arc::new(StreamContext::new(
            request.clone(),
            transport,
            self.inner.config.history_capacity,
        ));
        self.inner
            .contexts
            .insert(session_id.to_string(), ctx.clone());
        tracing::info!(session_id, role = %ctx.role(), "initializing stream");

        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => Err(ClientError::Cancelled),
            result = self.run_initialize(&ctx) => result,
        };

        match result {
            Ok(()) => Ok(ctx.state()),
            Err(err) => {
                if !matches!(err, ClientError::Cancelled) {
                    ctx.force(StreamState::Error);
                }
                self.teardown(&ctx).await;
                Err(err)
            }
        }
    }

    async fn run_initialize(&self, ctx: &Arc<StreamContext>) -> Result<(), ClientError> {
        let session_id = ctx.session_id();
        self.ensure_signaling().await?;

        match &ctx.request {
            StreamRequest::Host(_) => {
                let tracks = self.acquire_tracks(ctx).await?;
                *ctx.tracks.lock() = tracks;
            }
            StreamRequest::Viewer(_) => {
                self.inner
                    .signaling
                    .wait_for_host(session_id, self.inner.config.host_wait)
                    .await?;
            }
        }

        let uid = self.inner.signaling.user_id().to_string();
        let token = self.inner.tokens.token(session_id, &uid, ctx.role()).await?;
        let params = JoinParams {
            app_id: self.inner.config.app_id.clone(),
            channel: session_id.to_string(),
            token,
            uid,
        };
        ctx.transport.join(&params).await?;
        *ctx.join_params.lock() = Some(params);

        let mut transport_status = ctx.transport.status();
        status::wait_connected(&mut transport_status, self.inner.config.confirm_timeout).await;

        let guards = self.guards(ctx);
        ctx.machine.lock().transition(StreamState::Ready, &guards)
    }

    async fn run_launch(&self, ctx: &Arc<StreamContext>) -> Result<(), ClientError> {
        let guards = self.guards(ctx);
        if ctx.state() != StreamState::Launching {
            ctx.machine.lock().transition(StreamState::Launching, &guards)?;
        }

        match &ctx.request {
            StreamRequest::Host(session) => {
                self.publish(ctx).await?;
                self.inner
                    .signaling
                    .start_session(session.clone(), self.inner.config.confirm_timeout)
                    .await?;
            }
            StreamRequest::Viewer(id) => {
                self.inner
                    .signaling
                    .join_session(id, self.inner.config.confirm_timeout)
                    .await?;
            }
        }

        let guards = self.guards(ctx);
        let live = ctx.machine.lock().transition(StreamState::Live, &guards);
        if live.is_ok() {
            tracing::info!(session_id = %ctx.session_id(), role = %ctx.role(), "stream live");
        }
        live
    }

    /// Publish all local tracks. A failed publish unpublishes whatever made it.
    async fn publish(&self, ctx: &Arc<StreamContext>) -> Result<(), ClientError> {
        let tracks = ctx.tracks.lock().clone();
        if let Err(err) = ctx.transport.publish(&tracks).await {
            if let Err(rollback) = ctx.transport.unpublish(&tracks).await {
                tracing::warn!(session_id = %ctx.session_id(), %rollback, "unpublish after failed publish");
            }
            ctx.published.lock().clear();
            return Err(err);
        }
        *ctx.published.lock() = tracks;
        Ok(())
    }

    async fn acquire_tracks(&self, ctx: &Arc<StreamContext>) -> Result<Vec<LocalTrack>, ClientError> {
        let policy = RetryPolicy::new(self.inner.config.track_backoff, self.inner.config.track_attempts);
        policy
            .run(&ctx.cancel, |attempt| {
                let this = self.clone();
                let ctx = ctx.clone();
                async move {
                    tracing::debug!(session_id = %ctx.session_id(), attempt, "acquiring local tracks");
                    this.create_tracks(&ctx).await
                }
            })
            .await
            .map_err(|err| match err {
                RetryError::Cancelled => ClientError::Cancelled,
                RetryError::Exhausted { last, .. } => ClientError::MediaInitFailed(last.to_string()),
            })
    }

    /// Video first so the preview can render while audio is still starting.
    async fn create_tracks(&self, ctx: &StreamContext) -> Result<Vec<LocalTrack>, ClientError> {
        let config = &self.inner.config;
        let video = ctx
            .transport
            .create_local_track(TrackKind::Video, config.video_device.as_deref())
            .await?;
        self.inner.renderer.render_local(ctx.session_id(), &video);

        match ctx
            .transport
            .create_local_track(TrackKind::Audio, config.audio_device.as_deref())
            .await
        {
            Ok(audio) => Ok(vec![video, audio]),
            Err(err) => {
                self.inner.renderer.detach(ctx.session_id(), &video);
                ctx.transport.release_track(&video).await;
                Err(err)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Runtime error policy. While launching or live, try to restore the
    /// connection; otherwise, or if that fails, mark the error and clean up.
    /// Caller holds the session's turn.
    async fn recover(&self, ctx: &Arc<StreamContext>, err: ClientError) -> Result<(), ClientError> {
        let session_id = ctx.session_id().to_string();
        let state = ctx.state();

        if matches!(state, StreamState::Launching | StreamState::Live) {
            tracing::warn!(session_id = %session_id, %state, %err, "runtime error, restoring connection");
            let restored = tokio::select! {
                _ = ctx.cancel.cancelled() => Err(ClientError::Cancelled),
                result = self.restore_connection(ctx) => result,
            };
            match restored {
                Ok(()) => {
                    tracing::info!(session_id = %session_id, "connection restored");
                    if ctx.supervisor.lock().is_none() && ctx.state() == StreamState::Live {
                        self.spawn_supervisor(ctx);
                    }
                    return Ok(());
                }
                Err(restore_err) => {
                    tracing::error!(session_id = %session_id, %restore_err, "restore failed, cleaning up");
                }
            }
        } else {
            tracing::error!(session_id = %session_id, %state, %err, "runtime error, cleaning up");
        }

        ctx.force(StreamState::Error);
        self.teardown(ctx).await;
        Err(err)
    }

    /// Re-establish signaling, rejoin the transport with the same
    /// credentials, republish (host), and re-announce the role.
    async fn restore_connection(&self, ctx: &Arc<StreamContext>) -> Result<(), ClientError> {
        self.ensure_signaling().await?;

        let transport_up = ctx.transport.status().borrow().is_connected();
        let unpublished = ctx.role() == Role::Host && ctx.published.lock().is_empty();
        if !transport_up || unpublished {
            let params = ctx
                .join_params
                .lock()
                .clone()
                .ok_or_else(|| ClientError::Transport("no join parameters to restore".to_string()))?;
            if let Err(err) = ctx.transport.leave().await {
                tracing::debug!(session_id = %ctx.session_id(), %err, "leave before rejoin");
            }
            ctx.transport.join(&params).await?;
            if ctx.role() == Role::Host {
                self.publish(ctx).await?;
            }
        }

        let timeout = self.inner.config.confirm_timeout;
        match &ctx.request {
            StreamRequest::Host(session) if self.inner.signaling.role(&session.id) != Some(Role::Host) => {
                self.inner
                    .signaling
                    .start_session(session.clone(), timeout)
                    .await?;
            }
            StreamRequest::Viewer(id) if self.inner.signaling.role(id) != Some(Role::Viewer) => {
                self.inner.signaling.join_session(id, timeout).await?;
            }
            _ => {}
        }

        if ctx.state() == StreamState::Launching {
            let guards = self.guards(ctx);
            ctx.machine.lock().transition(StreamState::Live, &guards)?;
        }
        Ok(())
    }

    /// Watch both connection streams while the session is live and route
    /// failures into the recovery policy.
    fn spawn_supervisor(&self, ctx: &Arc<StreamContext>) {
        let this = self.clone();
        let ctx_task = ctx.clone();
        let handle = tokio::spawn(async move {
            let ctx = ctx_task;
            let mut signaling = this.inner.signaling.status();
            let mut transport = ctx.transport.status();
            let mut remote = ctx.transport.remote_published();
            let mut signaling_dropped = false;
            let mut remote_open = true;

            loop {
                let failure = tokio::select! {
                    _ = ctx.cancel.cancelled() => break,
                    changed = signaling.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let status = *signaling.borrow_and_update();
                        match status {
                            ConnectionStatus::Connected if signaling_dropped => {
                                signaling_dropped = false;
                                // The gateway dropped our roles with the old connection.
                                Some(ClientError::Signaling("reconnected".to_string()))
                            }
                            ConnectionStatus::Connecting => {
                                signaling_dropped = true;
                                None
                            }
                            s if s.is_failed() => Some(ClientError::Signaling(format!("signaling {s}"))),
                            _ => None,
                        }
                    }
                    changed = transport.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let status = *transport.borrow_and_update();
                        status
                            .is_failed()
                            .then(|| ClientError::Transport(format!("transport {status}")))
                    }
                    published = remote.recv(), if remote_open => {
                        match published {
                            Ok(track) if ctx.role() == Role::Viewer => {
                                this.inner.renderer.render_remote(ctx.session_id(), &track);
                            }
                            Err(broadcast::error::RecvError::Closed) => remote_open = false,
                            _ => {}
                        }
                        None
                    }
                };

                if let Some(err) = failure {
                    let _turn = this.turn(ctx.session_id()).await;
                    if ctx.cancel.is_cancelled() {
                        break;
                    }
                    if this.recover(&ctx, err).await.is_err() {
                        break;
                    }
                }
            }
        });
        *ctx.supervisor.lock() = Some(handle);
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Release everything held by `ctx` and forget it. Caller holds the turn.
    async fn teardown(&self, ctx: &Arc<StreamContext>) {
        let session_id = ctx.session_id().to_string();
        ctx.cancel.cancel();
        // The supervisor exits on cancel; it may be the caller, so never abort it.
        drop(ctx.supervisor.lock().take());
        ctx.force(StreamState::Cleanup);

        let published = std::mem::take(&mut *ctx.published.lock());
        if !published.is_empty() {
            if let Err(err) = ctx.transport.unpublish(&published).await {
                tracing::warn!(session_id = %session_id, %err, "unpublish during cleanup");
            }
        }

        let tracks = std::mem::take(&mut *ctx.tracks.lock());
        for track in &tracks {
            ctx.transport.release_track(track).await;
            self.inner.renderer.detach(&session_id, track);
        }
        self.inner.renderer.clear(&session_id);

        let joined = ctx.join_params.lock().take().is_some();
        if joined {
            if let Err(err) = ctx.transport.leave().await {
                tracing::warn!(session_id = %session_id, %err, "leave during cleanup");
            }
        }

        self.inner
            .contexts
            .remove_if(&session_id, |_, existing| Arc::ptr_eq(existing, ctx));
        tracing::info!(session_id = %session_id, "stream cleaned up");
    }

    async fn ensure_signaling(&self) -> Result<(), ClientError> {
        let mut status = self.inner.signaling.status();
        let current = *status.borrow();
        if current.is_connected() {
            return Ok(());
        }
        if current == ConnectionStatus::Disconnected {
            self.inner.signaling.reconnect().await?;
        }
        if status::wait_connected(&mut status, self.inner.config.confirm_timeout).await {
            Ok(())
        } else {
            Err(ClientError::Signaling("not connected".to_string()))
        }
    }

    fn guards(&self, ctx: &StreamContext) -> GuardContext {
        GuardContext {
            signaling_connected: self.inner.signaling.status().borrow().is_connected(),
            transport_connected: ctx.transport.status().borrow().is_connected(),
            local_tracks: ctx.tracks.lock().len(),
            published_tracks: ctx.published.lock().len(),
            role_confirmed: self.inner.signaling.role(ctx.session_id()) == Some(ctx.role()),
        }
    }

    fn context(&self, session_id: &str) -> Result<Arc<StreamContext>, ClientError> {
        self.inner
            .contexts
            .get(session_id)
            .map(|c| c.clone())
            .ok_or_else(|| ClientError::UnknownStream(session_id.to_string()))
    }

    async fn turn(&self, session_id: &str) -> Turn {
        let lock = self
            .inner
            .turns
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        Turn {
            inner: self.inner.clone(),
            session_id: session_id.to_string(),
            guard: Some(guard),
        }
    }

    /// Session ids with a turn lock still allocated.
    pub fn pending_turns(&self) -> usize {
        self.inner.turns.len()
    }
}

#[async_trait]
impl Recover for StreamController {
    async fn reset(&self, session_id: &str) -> Result<StreamState, ClientError> {
        let request = self.context(session_id)?.request.clone();
        tracing::info!(session_id, "resetting stream");
        self.cleanup(session_id).await;
        self.initialize(request).await
    }
}
