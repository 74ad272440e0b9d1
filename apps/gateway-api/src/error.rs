use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use livecast_common::ServerEvent;
use serde::Serialize;
use utoipa::ToSchema;

use crate::registry::RegistryError;

/// Structured API error returned to clients.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

/// Application-level error type that converts into an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "CONFLICT", message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: ApiErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Gateway action errors
// ---------------------------------------------------------------------------

/// Failure of a gateway action. Every variant carries a message that is safe
/// to show to the remote participant.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    AlreadyExists(String),
    #[error("service temporarily unavailable")]
    StoreUnavailable,
    #[error("{0}")]
    InvalidPayload(String),
    #[error("An internal error occurred")]
    Internal,
}

impl GatewayError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound("Session not found".to_string())
    }

    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Unauthorized(_) => 403,
            GatewayError::NotFound(_) => 404,
            GatewayError::AlreadyExists(_) => 409,
            GatewayError::StoreUnavailable => 503,
            GatewayError::InvalidPayload(_) => 400,
            GatewayError::Internal => 500,
        }
    }

    /// The single `ERROR` event sent back to the originating connection.
    pub fn to_event(&self) -> ServerEvent {
        ServerEvent::error(self.to_string(), self.status_code())
    }
}

impl From<RegistryError> for GatewayError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::AlreadyExists(_) => {
                GatewayError::AlreadyExists("Session already exists".to_string())
            }
            RegistryError::StoreUnavailable => GatewayError::StoreUnavailable,
            RegistryError::Corrupt { id, source } => {
                tracing::error!(session_id = %id, ?source, "corrupt session record");
                GatewayError::Internal
            }
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        let message = err.to_string();
        match err {
            GatewayError::Unauthorized(_) => ApiError::forbidden(message),
            GatewayError::NotFound(_) => ApiError::not_found(message),
            GatewayError::AlreadyExists(_) => ApiError::conflict(message),
            GatewayError::StoreUnavailable => ApiError::service_unavailable(message),
            GatewayError::InvalidPayload(_) => ApiError::bad_request(message),
            GatewayError::Internal => ApiError::internal(message),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        GatewayError::from(err).into()
    }
}
