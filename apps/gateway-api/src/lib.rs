pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod registry;
pub mod routes;

use std::sync::Arc;

use config::Config;
use db::kv::KeyValueStore;
use gateway::Gateway;
use registry::SessionRegistry;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub registry: SessionRegistry,
    pub config: Arc<Config>,
}

impl AppState {
    /// Wire the registry and gateway on top of a session store.
    pub fn new(store: Arc<dyn KeyValueStore>, config: Config) -> Self {
        let registry = SessionRegistry::new(store, config.store_timeout());
        let gateway = Arc::new(Gateway::new(registry.clone(), &config));
        Self {
            gateway,
            registry,
            config: Arc::new(config),
        }
    }
}
