use std::future::IntoFuture;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use futures_util::FutureExt;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gateway_api::config::Config;
use gateway_api::db::kv::{KeyValueStore, MemoryStore};
use gateway_api::AppState;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Load .env file (silently skip if missing; env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    install_panic_hook();

    let config = Config::from_env();
    let port = config.port;

    tracing::info!(
        heartbeat_interval_ms = config.heartbeat_interval_ms,
        chat_history_limit = config.chat_history_limit,
        store_timeout_ms = config.store_timeout_ms,
        "gateway-api configured"
    );

    // In-memory store for a single node. Swap for a shared store to run several gateways.
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let state = AppState::new(store, config);
    let gateway = state.gateway.clone();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(gateway_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "gateway-api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    let outcome = AssertUnwindSafe(server.into_future()).catch_unwind().await;

    // Every exit path disconnects remaining participants so hosted sessions
    // are ended and viewer counts settle before the process goes away.
    gateway.shutdown().await;

    match outcome {
        Ok(result) => result,
        Err(_) => {
            tracing::error!("server task panicked; connections were cleaned up");
            Err(std::io::Error::other("server panicked"))
        }
    }
}

/// Log panics through tracing before the default hook prints them.
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        tracing::error!(panic = %panic_info, "panic");
        default_hook(panic_info);
    }));
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(%err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
