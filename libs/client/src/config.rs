use std::time::Duration;

/// Client configuration. Everything but the gateway URL and app id is a
/// tuning knob with a sensible default.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the gateway, e.g. `ws://localhost:4002/gateway`.
    pub gateway_url: String,
    /// Media transport application id passed on every join.
    pub app_id: String,
    /// Fixed wait between signaling reconnect attempts.
    pub reconnect_interval: Duration,
    pub reconnect_attempts: u32,
    /// Local track acquisition retry (host only).
    pub track_attempts: u32,
    pub track_backoff: Duration,
    /// How long a viewer waits for the host to be live.
    pub host_wait: Duration,
    /// How long to wait for the gateway to confirm an action.
    pub confirm_timeout: Duration,
    pub history_capacity: usize,
    pub video_device: Option<String>,
    pub audio_device: Option<String>,
}

impl ClientConfig {
    pub fn new(gateway_url: impl Into<String>, app_id: impl Into<String>) -> Self {
        Self {
            gateway_url: gateway_url.into(),
            app_id: app_id.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `LIVECAST_GATEWAY_URL` and `LIVECAST_APP_ID`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            gateway_url: std::env::var("LIVECAST_GATEWAY_URL").unwrap_or(defaults.gateway_url.clone()),
            app_id: std::env::var("LIVECAST_APP_ID").unwrap_or(defaults.app_id.clone()),
            ..defaults
        }
    }

    /// HTTP origin of the gateway, derived from the socket URL.
    pub fn http_base(&self) -> String {
        let url = self.gateway_url.trim_end_matches('/');
        let url = url.strip_suffix("/gateway").unwrap_or(url);
        if let Some(rest) = url.strip_prefix("wss://") {
            format!("https://{rest}")
        } else if let Some(rest) = url.strip_prefix("ws://") {
            format!("http://{rest}")
        } else {
            url.to_string()
        }
    }

    pub fn sessions_url(&self) -> String {
        format!("{}/api/v1/sessions", self.http_base())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            gateway_url: "ws://localhost:4002/gateway".to_string(),
            app_id: String::new(),
            reconnect_interval: Duration::from_secs(5),
            reconnect_attempts: 5,
            track_attempts: 3,
            track_backoff: Duration::from_secs(1),
            host_wait: Duration::from_secs(5),
            confirm_timeout: Duration::from_secs(10),
            history_capacity: 64,
            video_device: None,
            audio_device: None,
        }
    }
}
