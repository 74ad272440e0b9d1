//! Connection status shared by the signaling channel and the media
//! transport, so recovery can treat both the same way.

use std::fmt;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    Disconnected,
    Error,
}

impl ConnectionStatus {
    pub fn is_connected(self) -> bool {
        self == ConnectionStatus::Connected
    }

    /// Terminal for the current attempt; recovery has to step in.
    pub fn is_failed(self) -> bool {
        matches!(self, ConnectionStatus::Disconnected | ConnectionStatus::Error)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Wait until `status` reports connected. Returns `false` on timeout or when
/// the sender is gone.
pub async fn wait_connected(status: &mut watch::Receiver<ConnectionStatus>, timeout: Duration) -> bool {
    time::timeout(timeout, status.wait_for(|s| s.is_connected()))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}
