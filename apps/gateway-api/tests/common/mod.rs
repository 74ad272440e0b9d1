#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures_util::{SinkExt, StreamExt};
use livecast_common::events::{ClientMessage, GatewayMessage, OP_DISPATCH};
use livecast_common::{ClientAction, ServerEvent};
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use gateway_api::config::Config;
use gateway_api::db::kv::{KeyValueStore, MemoryStore};
use gateway_api::AppState;

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default wait for an expected message.
pub const WAIT: Duration = Duration::from_secs(5);

/// Test configuration: long heartbeat so idle tests are not timed out.
pub fn test_config() -> Config {
    Config {
        heartbeat_interval_ms: 60_000,
        store_timeout_ms: 500,
        ..Config::default()
    }
}

/// Build a test AppState over a fresh in-memory store. The store handle is
/// returned so tests can take it offline.
pub fn test_state_with(config: Config) -> (AppState, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let kv: Arc<dyn KeyValueStore> = store.clone();
    (AppState::new(kv, config), store)
}

pub fn test_state() -> (AppState, Arc<MemoryStore>) {
    test_state_with(test_config())
}

/// Build the full application router wired to the test state.
pub fn test_app() -> (Router, AppState, Arc<MemoryStore>) {
    let (state, store) = test_state();
    let app = gateway_api::routes::router().with_state(state.clone());
    (app, state, store)
}

/// Start an actual TCP server for WebSocket testing. The server runs in the
/// background for the rest of the test.
pub async fn start_ws_server_with(config: Config) -> (SocketAddr, AppState, Arc<MemoryStore>) {
    let (state, store) = test_state_with(config);
    let app = gateway_api::routes::router().with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state, store)
}

pub async fn start_ws_server() -> (SocketAddr, AppState, Arc<MemoryStore>) {
    start_ws_server_with(test_config()).await
}

/// Open a raw socket without reading anything.
pub async fn open(addr: SocketAddr, query: &str) -> WsClient {
    let url = format!("ws://{addr}/gateway{query}");
    let (ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");
    ws
}

/// Connect as `user_id` and consume READY.
pub async fn connect(addr: SocketAddr, user_id: &str) -> WsClient {
    let mut ws = open(addr, &format!("?userId={user_id}&username={user_id}")).await;
    match next_event(&mut ws).await {
        ServerEvent::Ready(ready) => assert_eq!(ready.user_id, user_id),
        other => panic!("expected READY, got {other:?}"),
    }
    ws
}

pub async fn send_action(ws: &mut WsClient, action: &ClientAction) {
    send_raw(ws, serde_json::to_value(ClientMessage::action(action)).unwrap()).await;
}

pub async fn send_raw(ws: &mut WsClient, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("ws send");
}

/// Next gateway message of any opcode.
pub async fn next_message(ws: &mut WsClient) -> GatewayMessage {
    loop {
        let msg = time::timeout(WAIT, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended")
            .expect("ws read error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).expect("parse message"),
            Message::Close(frame) => panic!("connection closed: {frame:?}"),
            _ => continue,
        }
    }
}

/// Next DISPATCH event, skipping acks.
pub async fn next_event(ws: &mut WsClient) -> ServerEvent {
    loop {
        let msg = next_message(ws).await;
        if msg.op == OP_DISPATCH {
            return msg.event().expect("dispatch").expect("decode event");
        }
    }
}

/// Read events until one matches `pred`.
pub async fn expect_event<F>(ws: &mut WsClient, mut pred: F) -> ServerEvent
where
    F: FnMut(&ServerEvent) -> bool,
{
    loop {
        let event = next_event(ws).await;
        if pred(&event) {
            return event;
        }
    }
}

/// Assert no dispatch event arrives within `window`.
pub async fn expect_silence(ws: &mut WsClient, window: Duration) {
    if let Ok(Some(Ok(Message::Text(text)))) = time::timeout(window, ws.next()).await {
        panic!("unexpected message: {text}");
    }
}

/// Read until the server closes the socket; returns the close code.
pub async fn expect_close(ws: &mut WsClient) -> u16 {
    loop {
        let msg = time::timeout(WAIT, ws.next())
            .await
            .expect("timeout waiting for close")
            .expect("stream ended")
            .expect("ws read error");
        if let Message::Close(frame) = msg {
            return frame.map(|f| u16::from(f.code)).unwrap_or(u16::from(CloseCode::Normal));
        }
    }
}

/// Poll until `check` holds or the wait elapses.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = time::Instant::now() + WAIT;
    while time::Instant::now() < deadline {
        if check().await {
            return;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
