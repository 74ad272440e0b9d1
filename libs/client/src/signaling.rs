//! Signaling channel to the gateway.
//!
//! `SignalingClient` keeps one WebSocket open per user, reconnecting through
//! the shared [`RetryPolicy`]. Every dispatched event is applied to the
//! [`MirrorStore`] and re-published on a broadcast channel; pending actions
//! subscribe to that channel and wait for their confirmation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use livecast_common::events::{
    ChatSend, ClientMessage, GatewayMessage, PreviewUpdate, ReadyPayload, SessionRef, OP_DISPATCH,
    OP_RECONNECT,
};
use livecast_common::{ClientAction, Role, ServerEvent, Session};
use reqwest::StatusCode;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::mirror::MirrorStore;
use crate::retry::{RetryError, RetryPolicy};
use crate::status::ConnectionStatus;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the stream controller needs from the signaling channel.
#[async_trait]
pub trait Signaling: Send + Sync {
    fn user_id(&self) -> &str;
    fn status(&self) -> watch::Receiver<ConnectionStatus>;
    /// Role the gateway has confirmed for this user in `session_id`.
    fn role(&self, session_id: &str) -> Option<Role>;
    /// Ask for a fresh connection after the retry cap was exhausted.
    async fn reconnect(&self) -> Result<(), ClientError>;
    /// Resolve once the host of `session_id` is live, or fail `HostNotActive`.
    async fn wait_for_host(&self, session_id: &str, wait: Duration) -> Result<Session, ClientError>;
    /// Announce a session and wait for the gateway's echo.
    async fn start_session(&self, session: Session, timeout: Duration) -> Result<Session, ClientError>;
    /// Join as a viewer and wait for the role confirmation.
    async fn join_session(&self, session_id: &str, timeout: Duration) -> Result<(), ClientError>;
    async fn leave_session(&self, session_id: &str) -> Result<(), ClientError>;
    async fn end_session(&self, session_id: &str) -> Result<(), ClientError>;
}

struct Inner {
    config: ClientConfig,
    user_id: String,
    username: Option<String>,
    http: reqwest::Client,
    mirror: Arc<MirrorStore>,
    outbound: mpsc::UnboundedSender<String>,
    events: broadcast::Sender<ServerEvent>,
    status: watch::Sender<ConnectionStatus>,
    manual: Notify,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct SignalingClient {
    inner: Arc<Inner>,
}

impl SignalingClient {
    /// Spawn the connection task and return immediately. Watch `status()`
    /// for progress.
    pub fn connect(config: ClientConfig, user_id: impl Into<String>, username: Option<String>) -> Self {
        let user_id = user_id.into();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let (status, _) = watch::channel(ConnectionStatus::Connecting);

        let inner = Arc::new(Inner {
            mirror: Arc::new(MirrorStore::new(user_id.clone())),
            config,
            user_id,
            username,
            http: reqwest::Client::new(),
            outbound,
            events,
            status,
            manual: Notify::new(),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(run(inner.clone(), outbound_rx));
        Self { inner }
    }

    pub fn mirror(&self) -> &Arc<MirrorStore> {
        &self.inner.mirror
    }

    /// Every event the gateway dispatches, after it was applied to the mirror.
    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    pub fn send_chat(&self, session_id: &str, content: &str) -> Result<(), ClientError> {
        self.send(&ClientAction::SendChatMessage(ChatSend {
            id: session_id.to_string(),
            content: content.to_string(),
        }))
    }

    pub fn update_preview(&self, session_id: &str, preview_ref: &str) -> Result<(), ClientError> {
        self.send(&ClientAction::UpdatePreview(PreviewUpdate {
            id: session_id.to_string(),
            preview_ref: preview_ref.to_string(),
        }))
    }

    /// Fetch one session straight from the gateway.
    pub async fn fetch_session(&self, session_id: &str) -> Result<Option<Session>, ClientError> {
        let url = format!("{}/{}", self.inner.config.sessions_url(), session_id);
        let resp = self.inner.http.get(url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(resp.error_for_status()?.json().await?))
    }

    /// Stop the connection task and close the socket.
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    fn send(&self, action: &ClientAction) -> Result<(), ClientError> {
        if !self.inner.status.borrow().is_connected() {
            return Err(ClientError::Signaling("not connected".to_string()));
        }
        let text = serde_json::to_string(&ClientMessage::action(action))
            .map_err(|err| ClientError::Signaling(err.to_string()))?;
        self.inner
            .outbound
            .send(text)
            .map_err(|_| ClientError::Signaling("connection task stopped".to_string()))
    }

    /// Send `action` and wait for the first event accepted by `confirms`. An
    /// `ERROR` event arriving first fails the request.
    async fn request<F>(&self, action: ClientAction, timeout: Duration, confirms: F) -> Result<ServerEvent, ClientError>
    where
        F: Fn(&ServerEvent) -> bool + Send,
    {
        let mut events = self.inner.events.subscribe();
        self.send(&action)?;

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(ServerEvent::Error(err)) => {
                        return Err(ClientError::Gateway {
                            status: err.status_code,
                            message: err.message,
                        });
                    }
                    Ok(event) if confirms(&event) => return Ok(event),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(ClientError::Signaling("connection task stopped".to_string()));
                    }
                }
            }
        };

        time::timeout(timeout, wait)
            .await
            .map_err(|_| ClientError::Timeout("gateway confirmation"))?
    }
}

#[async_trait]
impl Signaling for SignalingClient {
    fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    fn role(&self, session_id: &str) -> Option<Role> {
        self.inner.mirror.role(session_id)
    }

    async fn reconnect(&self) -> Result<(), ClientError> {
        if self.inner.cancel.is_cancelled() {
            return Err(ClientError::Signaling("client closed".to_string()));
        }
        if *self.inner.status.borrow() == ConnectionStatus::Disconnected {
            tracing::info!(user_id = %self.inner.user_id, "manual reconnect requested");
            self.inner.manual.notify_one();
        }
        Ok(())
    }

    async fn wait_for_host(&self, session_id: &str, wait: Duration) -> Result<Session, ClientError> {
        if let Some(session) = self.inner.mirror.session(session_id) {
            return Ok(session);
        }
        match self.fetch_session(session_id).await {
            Ok(Some(session)) => return Ok(session),
            Ok(None) => {}
            Err(err) => tracing::debug!(session_id, %err, "session lookup failed, waiting on events"),
        }
        if self.inner.mirror.wait_active(session_id, wait).await {
            if let Some(session) = self.inner.mirror.session(session_id) {
                return Ok(session);
            }
        }
        Err(ClientError::HostNotActive(session_id.to_string()))
    }

    async fn start_session(&self, session: Session, timeout: Duration) -> Result<Session, ClientError> {
        let id = session.id.clone();
        self.inner.mirror.expect_start(&session);
        let confirmed = self
            .request(ClientAction::StartSession(session), timeout, |event| {
                matches!(event, ServerEvent::RoleChanged(r) if r.id == id && r.role == Some(Role::Host))
            })
            .await;

        match confirmed {
            Ok(_) => self
                .inner
                .mirror
                .session(&id)
                .ok_or(ClientError::Timeout("session echo")),
            Err(err) => {
                self.inner.mirror.abandon_start(&id);
                Err(err)
            }
        }
    }

    async fn join_session(&self, session_id: &str, timeout: Duration) -> Result<(), ClientError> {
        self.request(
            ClientAction::JoinSession(SessionRef {
                id: session_id.to_string(),
            }),
            timeout,
            |event| {
                matches!(event, ServerEvent::RoleChanged(r) if r.id == session_id && r.role == Some(Role::Viewer))
            },
        )
        .await
        .map(|_| ())
    }

    async fn leave_session(&self, session_id: &str) -> Result<(), ClientError> {
        self.send(&ClientAction::LeaveSession(SessionRef {
            id: session_id.to_string(),
        }))
    }

    async fn end_session(&self, session_id: &str) -> Result<(), ClientError> {
        self.send(&ClientAction::EndSession(SessionRef {
            id: session_id.to_string(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

async fn run(inner: Arc<Inner>, mut outbound: mpsc::UnboundedReceiver<String>) {
    let policy = RetryPolicy::new(inner.config.reconnect_interval, inner.config.reconnect_attempts);

    loop {
        inner.status.send_replace(ConnectionStatus::Connecting);
        let opened = policy
            .run(&inner.cancel, |attempt| {
                let inner = inner.clone();
                async move { inner.open(attempt).await }
            })
            .await;

        match opened {
            Ok((socket, ready)) => {
                inner.mirror.reset_connection();
                // Seed before the live stream is relied on.
                if let Err(err) = inner.mirror.seed_from(&inner.http, &inner.config.sessions_url()).await {
                    tracing::warn!(%err, "mirror seed failed; relying on live events");
                }
                // Drop actions queued for the previous connection.
                while outbound.try_recv().is_ok() {}

                inner.status.send_replace(ConnectionStatus::Connected);
                tracing::info!(
                    user_id = %inner.user_id,
                    connection_id = %ready.connection_id,
                    "signaling connected"
                );

                inner.serve(socket, &mut outbound, ready.heartbeat_interval).await;
                if inner.cancel.is_cancelled() {
                    break;
                }
                tracing::info!(user_id = %inner.user_id, "signaling connection lost");
            }
            Err(RetryError::Cancelled) => break,
            Err(RetryError::Exhausted { attempts, last }) => {
                tracing::warn!(user_id = %inner.user_id, attempts, %last, "signaling gave up; waiting for manual reconnect");
                inner.status.send_replace(ConnectionStatus::Disconnected);
                tokio::select! {
                    _ = inner.manual.notified() => continue,
                    _ = inner.cancel.cancelled() => break,
                }
            }
        }
    }

    inner.status.send_replace(ConnectionStatus::Disconnected);
}

impl Inner {
    /// Open the socket and consume READY.
    async fn open(&self, attempt: u32) -> Result<(Socket, ReadyPayload), ClientError> {
        let mut url = reqwest::Url::parse(&self.config.gateway_url)
            .map_err(|err| ClientError::Signaling(err.to_string()))?;
        url.query_pairs_mut().append_pair("userId", &self.user_id);
        if let Some(username) = &self.username {
            url.query_pairs_mut().append_pair("username", username);
        }

        tracing::debug!(attempt, user_id = %self.user_id, "opening signaling connection");
        let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;

        let first = time::timeout(self.config.confirm_timeout, next_gateway_message(&mut socket))
            .await
            .map_err(|_| ClientError::Timeout("READY"))??;
        match first.event() {
            Some(Ok(ServerEvent::Ready(ready))) => Ok((socket, ready)),
            Some(Ok(ServerEvent::Error(err))) => Err(ClientError::Gateway {
                status: err.status_code,
                message: err.message,
            }),
            _ => Err(ClientError::Signaling("expected READY".to_string())),
        }
    }

    async fn serve(&self, socket: Socket, outbound: &mut mpsc::UnboundedReceiver<String>, heartbeat_interval_ms: u64) {
        let (mut tx, mut rx) = socket.split();
        let mut heartbeat = time::interval(Duration::from_millis(heartbeat_interval_ms.max(1)));
        heartbeat.tick().await;
        let mut last_seq = 0;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = tx.send(Message::Close(None)).await;
                    return;
                }
                _ = heartbeat.tick() => {
                    let Ok(text) = serde_json::to_string(&ClientMessage::heartbeat(last_seq)) else {
                        continue;
                    };
                    if tx.send(Message::Text(text.into())).await.is_err() {
                        return;
                    }
                }
                out = outbound.recv() => {
                    let Some(text) = out else { return };
                    if tx.send(Message::Text(text.into())).await.is_err() {
                        return;
                    }
                }
                msg = rx.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let msg: GatewayMessage = match serde_json::from_str(&text) {
                                Ok(m) => m,
                                Err(err) => {
                                    tracing::warn!(%err, "unparseable gateway message");
                                    continue;
                                }
                            };
                            if let Some(seq) = msg.s {
                                last_seq = seq;
                            }
                            match msg.op {
                                OP_DISPATCH => self.dispatch(&msg),
                                OP_RECONNECT => {
                                    tracing::info!(reason = %msg.d["reason"], "gateway asked us to reconnect");
                                    return;
                                }
                                _ => {}
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::debug!(?frame, "gateway closed the connection");
                            return;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => {
                            tracing::warn!(%err, "signaling read error");
                            return;
                        }
                        None => return,
                    }
                }
            }
        }
    }

    fn dispatch(&self, msg: &GatewayMessage) {
        let event = match msg.event() {
            Some(Ok(event)) => event,
            Some(Err(err)) => {
                tracing::warn!(t = ?msg.t, %err, "undecodable gateway event");
                return;
            }
            None => return,
        };
        if let ServerEvent::Error(err) = &event {
            tracing::warn!(status = err.status_code, message = %err.message, "gateway reported an error");
        }
        self.mirror.apply(&event);
        let _ = self.events.send(event);
    }
}

async fn next_gateway_message(socket: &mut Socket) -> Result<GatewayMessage, ClientError> {
    while let Some(msg) = socket.next().await {
        match msg? {
            Message::Text(text) => {
                return serde_json::from_str(&text).map_err(|err| ClientError::Signaling(err.to_string()));
            }
            Message::Close(_) => break,
            _ => continue,
        }
    }
    Err(ClientError::Signaling("connection closed".to_string()))
}
