use std::str::FromStr;
use std::time::Duration;

/// Gateway configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Heartbeat interval advertised to clients in READY (ms).
    pub heartbeat_interval_ms: u64,
    /// Chat messages retained per session.
    pub chat_history_limit: usize,
    /// Upper bound on a single session store call before it is reported as unavailable.
    pub store_timeout_ms: u64,
    /// Longest accepted chat message, in characters.
    pub max_chat_length: usize,
}

impl Config {
    /// Load configuration from environment variables, falling back to defaults
    /// for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: var_or("PORT", defaults.port),
            heartbeat_interval_ms: var_or("HEARTBEAT_INTERVAL_MS", defaults.heartbeat_interval_ms),
            chat_history_limit: var_or("CHAT_HISTORY_LIMIT", defaults.chat_history_limit),
            store_timeout_ms: var_or("STORE_TIMEOUT_MS", defaults.store_timeout_ms),
            max_chat_length: var_or("MAX_CHAT_LENGTH", defaults.max_chat_length),
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4002,
            heartbeat_interval_ms: 41250,
            chat_history_limit: 100,
            store_timeout_ms: 2000,
            max_chat_length: 500,
        }
    }
}

fn var_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
