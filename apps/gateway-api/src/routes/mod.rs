pub mod health;
pub mod sessions;

use axum::Router;
use utoipa::OpenApi;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(crate::gateway::server::router())
        .nest("/api/v1", sessions::router())
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        sessions::list_sessions,
        sessions::get_session,
    ),
    components(
        schemas(
            crate::error::ApiErrorBody,
            crate::error::ApiErrorDetail,
            livecast_common::Session,
            livecast_common::SessionMetadata,
            livecast_common::Role,
            health::HealthResponse,
        )
    ),
    tags(
        (name = "Health", description = "Liveness"),
        (name = "Sessions", description = "Session discovery"),
    ),
)]
pub struct ApiDoc;
