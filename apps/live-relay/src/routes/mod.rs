mod auth;
mod games;
mod notifications;
mod stream;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use live_proto::ConflictBody;
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

use crate::registry::RegistryError;
use crate::state::AppState;
use crate::store::StoreError;

pub use auth::{CurrentUser, MaybeUser};
pub use games::*;
pub use notifications::*;
pub use stream::*;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/stats", get(stats))
        .route("/games", post(create_game))
        .route(
            "/games/:game_id/stream",
            get(game_stream).head(stream_head),
        )
        .route("/games/:game_id/moves", post(submit_move))
        .route("/games/:game_id/tabs/:tab_id/heartbeat", post(tab_heartbeat))
        .route("/games/:game_id/tabs/:tab_id/activate", post(activate_tab))
        .route(
            "/notifications/stream",
            get(notifications_stream).head(stream_head),
        )
        .route("/notifications", post(create_notifications))
        .route("/friends/requests/accept", post(accept_friend_request))
        .route("/messages/stream", get(messages_stream).head(stream_head))
        .route("/messages", post(send_message))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub sessions: usize,
    pub connections: usize,
    pub timers_running: bool,
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        sessions: state.registry.session_count(),
        connections: state.registry.connection_count(),
        timers_running: state.registry.is_running(),
    })
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Forbidden(&'static str),
    NotFound(String),
    Conflict(String),
    VersionConflict(Box<ConflictBody>),
    BadRequest(String),
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", None),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", Some(msg.to_string())),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", Some(msg)),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", Some(msg)),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", Some(msg)),
            ApiError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", Some(msg))
            }
            ApiError::VersionConflict(body) => {
                return (StatusCode::CONFLICT, Json(*body)).into_response();
            }
        };
        (status, Json(ApiErrorBody { error, message })).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            StoreError::AlreadyExists(_) => ApiError::Conflict(err.to_string()),
            StoreError::Encode(_) => {
                warn!(target = "live.routes", error = %err, "store encoding failed");
                ApiError::Internal(err.to_string())
            }
            StoreError::Conflict { expected, current } => {
                warn!(
                    target = "live.routes",
                    entity_id = %current.entity_id,
                    expected,
                    current = current.version,
                    "version conflict"
                );
                // Move id is filled in by the caller that knows it.
                ApiError::VersionConflict(Box::new(ConflictBody::new("", expected, current)))
            }
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        ApiError::NotFound(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{self, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    async fn json_body(response: Response) -> Value {
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_and_stats_respond() {
        let app = build_router(AppState::in_memory());
        let response = app
            .clone()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let stats = json_body(response).await;
        assert_eq!(stats["sessions"], 0);
        assert_eq!(stats["connections"], 0);
        assert_eq!(stats["timersRunning"], false);
    }

    #[tokio::test]
    async fn version_conflict_renders_the_authoritative_snapshot() {
        let current = live_proto::EntitySnapshot {
            entity_id: "g-1".into(),
            version: 4,
            state: json!({ "moves": [] }),
        };
        let response = ApiError::VersionConflict(Box::new(ConflictBody::new("m-9", 2, current)))
            .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = json_body(response).await;
        assert_eq!(body["error"], "version_conflict");
        assert_eq!(body["moveId"], "m-9");
        assert_eq!(body["current"]["version"], 4);
    }

    #[tokio::test]
    async fn store_encoding_failures_are_server_errors() {
        let err = serde_json::from_str::<Value>("{").unwrap_err();
        let response = ApiError::from(StoreError::Encode(err)).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["error"], "internal");
    }
}
