//! Read-only session listing for discovery UIs. All writes go through the
//! gateway socket.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use livecast_common::Session;

use crate::error::{ApiError, ApiErrorBody};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/{session_id}", get(get_session))
}

// ---------------------------------------------------------------------------
// GET /api/v1/sessions
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/sessions",
    tag = "Sessions",
    responses(
        (status = 200, description = "Active sessions", body = Vec<Session>),
        (status = 503, description = "Session store unavailable", body = ApiErrorBody),
    ),
)]
pub async fn list_sessions(State(state): State<AppState>) -> Result<Json<Vec<Session>>, ApiError> {
    let mut sessions = state.registry.list_sessions().await?;
    sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(Json(sessions))
}

// ---------------------------------------------------------------------------
// GET /api/v1/sessions/:session_id
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/sessions/{session_id}",
    tag = "Sessions",
    params(
        ("session_id" = String, Path, description = "Session ID"),
    ),
    responses(
        (status = 200, description = "Session", body = Session),
        (status = 404, description = "Session not found", body = ApiErrorBody),
        (status = 503, description = "Session store unavailable", body = ApiErrorBody),
    ),
)]
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    state
        .registry
        .get_session(&session_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Session not found"))
}
