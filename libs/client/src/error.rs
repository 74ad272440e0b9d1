use crate::machine::StreamState;

/// Client-side failures. `Display` is always safe to show to the user.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("cannot move from {from} to {to}")]
    InvalidTransition { from: StreamState, to: StreamState },
    #[error("cannot move from {from} to {to}: {reason}")]
    GuardFailed {
        from: StreamState,
        to: StreamState,
        reason: &'static str,
    },
    #[error("no active stream for session {0}")]
    UnknownStream(String),
    #[error("host of session {0} is not live")]
    HostNotActive(String),
    #[error("could not start camera or microphone: {0}")]
    MediaInitFailed(String),
    #[error("signaling unavailable: {0}")]
    Signaling(String),
    #[error("media transport unavailable: {0}")]
    Transport(String),
    #[error("{message}")]
    Gateway { status: u16, message: String },
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("operation cancelled")]
    Cancelled,
}

impl ClientError {
    /// Coarse classification shown next to the message.
    pub fn status_code(&self) -> u16 {
        match self {
            ClientError::InvalidTransition { .. } | ClientError::GuardFailed { .. } => 409,
            ClientError::UnknownStream(_) | ClientError::HostNotActive(_) => 404,
            ClientError::MediaInitFailed(_) => 500,
            ClientError::Signaling(_) | ClientError::Transport(_) => 503,
            ClientError::Gateway { status, .. } => *status,
            ClientError::Timeout(_) => 504,
            ClientError::Cancelled => 499,
        }
    }

    /// Errors raised by the state machine itself rather than a collaborator.
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            ClientError::InvalidTransition { .. } | ClientError::GuardFailed { .. }
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Signaling(err.to_string())
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Signaling(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_errors_keep_their_status() {
        let err = ClientError::Gateway {
            status: 403,
            message: "Cannot view own session".into(),
        };
        assert_eq!(err.status_code(), 403);
        assert_eq!(err.to_string(), "Cannot view own session");
    }

    #[test]
    fn state_errors_are_classified() {
        let err = ClientError::InvalidTransition {
            from: StreamState::Live,
            to: StreamState::Ready,
        };
        assert!(err.is_state_error());
        assert_eq!(err.to_string(), "cannot move from LIVE to READY");
        assert!(!ClientError::Cancelled.is_state_error());
    }
}
