//! WebSocket upgrade handler and per-connection event loop.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use livecast_common::events::{
    ClientMessage, GatewayMessage, HeartbeatPayload, ReadyPayload, OP_ACTION, OP_HEARTBEAT,
};
use livecast_common::ServerEvent;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::time;

use crate::AppState;

use super::fanout::BroadcastPayload;
use super::service::{Connection, Gateway};
use super::session::GatewaySession;

/// Close codes (4000-range for application-level).
pub const CLOSE_INVALID_JSON: u16 = 4000;
pub const CLOSE_UNKNOWN_OPCODE: u16 = 4001;
pub const CLOSE_IDENTITY_REQUIRED: u16 = 4003;
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4009;
pub const CLOSE_SUPERSEDED: u16 = 4010;

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    #[serde(default)]
    pub user_id: String,
    pub username: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state, params))
}

async fn handle_connection(socket: WebSocket, state: AppState, params: ConnectParams) {
    let (mut ws_tx, ws_rx) = socket.split();
    let gateway = state.gateway.clone();

    // Subscribe before connecting so nothing dispatched in between is missed.
    let broadcast_rx = gateway.subscribe();

    let connection = match gateway
        .connect(&params.user_id, params.username.as_deref())
        .await
    {
        Ok(connection) => connection,
        Err(err) => {
            tracing::debug!(%err, "connection rejected");
            let _ = send_message(&mut ws_tx, &GatewayMessage::dispatch(&err.to_event(), 1)).await;
            let _ = send_close(&mut ws_tx, CLOSE_IDENTITY_REQUIRED, &err.to_string()).await;
            return;
        }
    };

    let session = Arc::new(GatewaySession::new(
        connection.connection_id.clone(),
        connection.user_id.clone(),
    ));

    let ready = ServerEvent::Ready(ReadyPayload {
        connection_id: connection.connection_id.clone(),
        user_id: connection.user_id.clone(),
        heartbeat_interval: state.config.heartbeat_interval_ms,
    });
    if send_message(&mut ws_tx, &GatewayMessage::dispatch(&ready, session.next_seq()))
        .await
        .is_err()
    {
        gateway.disconnect(&connection.connection_id).await;
        return;
    }

    let heartbeat_interval = Duration::from_millis(state.config.heartbeat_interval_ms);
    let outcome = AssertUnwindSafe(run_session(
        &gateway,
        session.clone(),
        &connection,
        heartbeat_interval,
        ws_tx,
        ws_rx,
        broadcast_rx,
    ))
    .catch_unwind()
    .await;

    if outcome.is_err() {
        tracing::error!(
            connection_id = %connection.connection_id,
            "connection task panicked; running disconnect cleanup"
        );
    }

    // Runs on every exit path: client close, heartbeat timeout, supersede, shutdown.
    gateway.disconnect(&connection.connection_id).await;
}

/// Main connection event loop: read client messages, forward broadcasts,
/// enforce heartbeat.
async fn run_session(
    gateway: &Gateway,
    session: Arc<GatewaySession>,
    connection: &Connection,
    heartbeat_interval: Duration,
    mut ws_tx: WsSink,
    mut ws_rx: WsStream,
    mut broadcast_rx: broadcast::Receiver<Arc<BroadcastPayload>>,
) {
    // Client must heartbeat within 1.5x the interval.
    let heartbeat_deadline = heartbeat_interval * 3 / 2;
    let mut heartbeat_timer = time::interval(heartbeat_deadline);
    heartbeat_timer.tick().await; // First tick fires immediately; skip it.
    let mut got_heartbeat = true;

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let client_msg: ClientMessage = match serde_json::from_str(&text) {
                            Ok(m) => m,
                            Err(_) => {
                                let _ = send_close(&mut ws_tx, CLOSE_INVALID_JSON, "Invalid JSON").await;
                                break;
                            }
                        };

                        match client_msg.op {
                            OP_HEARTBEAT => {
                                got_heartbeat = true;
                                let payload: HeartbeatPayload =
                                    serde_json::from_value(client_msg.d).unwrap_or(HeartbeatPayload { seq: 0 });
                                if send_message(&mut ws_tx, &GatewayMessage::heartbeat_ack(payload.seq)).await.is_err() {
                                    break;
                                }
                            }
                            OP_ACTION => {
                                let reply = match client_msg.to_action() {
                                    Ok(action) => {
                                        tracing::debug!(
                                            connection_id = %session.connection_id,
                                            session_id = action.session_id(),
                                            action = client_msg.t.as_deref().unwrap_or_default(),
                                            "action received"
                                        );
                                        gateway
                                            .handle_action(&connection.connection_id, action)
                                            .await
                                            .err()
                                            .map(|err| err.to_event())
                                    }
                                    Err(err) => {
                                        tracing::debug!(connection_id = %session.connection_id, %err, "malformed action");
                                        Some(ServerEvent::error(format!("Invalid payload: {err}"), 400))
                                    }
                                };
                                if let Some(event) = reply {
                                    let msg = GatewayMessage::dispatch(&event, session.next_seq());
                                    if send_message(&mut ws_tx, &msg).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            _ => {
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_OPCODE, "Unknown opcode").await;
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(?e, connection_id = %session.connection_id, "ws read error");
                        break;
                    }
                    _ => continue,
                }
            }

            // Event from the fanout hub.
            result = broadcast_rx.recv() => {
                match result {
                    Ok(payload) => {
                        if !session.is_recipient(&payload.audience) {
                            continue;
                        }
                        let msg = GatewayMessage::dispatch(&payload.event, session.next_seq());
                        if send_message(&mut ws_tx, &msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(
                            connection_id = %session.connection_id,
                            skipped = n,
                            "gateway connection lagged behind broadcast"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = heartbeat_timer.tick() => {
                if !got_heartbeat {
                    tracing::debug!(
                        connection_id = %session.connection_id,
                        "heartbeat timeout, closing connection"
                    );
                    let _ = send_close(&mut ws_tx, CLOSE_HEARTBEAT_TIMEOUT, "Heartbeat timeout").await;
                    break;
                }
                got_heartbeat = false;
            }

            _ = connection.cancel.cancelled() => {
                let reason = if gateway.is_shutting_down() { "shutting down" } else { "superseded" };
                tracing::debug!(connection_id = %session.connection_id, reason, "connection cancelled");
                let _ = send_message(&mut ws_tx, &GatewayMessage::reconnect(reason)).await;
                let _ = send_close(&mut ws_tx, CLOSE_SUPERSEDED, reason).await;
                break;
            }
        }
    }
}

async fn send_message(ws_tx: &mut WsSink, msg: &GatewayMessage) -> Result<(), axum::Error> {
    let json = serde_json::to_string(msg).map_err(axum::Error::new)?;
    ws_tx.send(Message::Text(json.into())).await
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(ws_tx: &mut WsSink, code: u16, reason: &str) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
