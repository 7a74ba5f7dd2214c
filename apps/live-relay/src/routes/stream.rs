use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
};
use live_proto::SessionKey;
use serde::Deserialize;
use tokio_stream::StreamExt;
use tracing::info;

use super::{ApiError, CurrentUser, MaybeUser};
use crate::session::ConnectionMetadata;
use crate::state::AppState;
use crate::stream::open_stream;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    #[serde(default)]
    pub tab_id: Option<String>,
}

impl StreamQuery {
    fn tab_id(self) -> Result<String, ApiError> {
        self.tab_id
            .map(|tab| tab.trim().to_string())
            .filter(|tab| !tab.is_empty())
            .ok_or_else(|| ApiError::BadRequest("tabId query parameter is required".into()))
    }
}

pub async fn game_stream(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
    user: MaybeUser,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let tab_id = query.tab_id()?;
    let key = SessionKey::game(game_id);
    let metadata = metadata(user.id(), &headers);
    serve(state, key, tab_id, metadata).await
}

pub async fn notifications_stream(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let tab_id = query.tab_id()?;
    let key = SessionKey::notifications(user.id());
    let metadata = metadata(Some(user.id()), &headers);
    serve(state, key, tab_id, metadata).await
}

pub async fn messages_stream(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let tab_id = query.tab_id()?;
    let key = SessionKey::messages(user.id());
    let metadata = metadata(Some(user.id()), &headers);
    serve(state, key, tab_id, metadata).await
}

/// HEAD on a stream route: answers with stream headers and registers nothing.
pub async fn stream_head() -> Response {
    let mut response = StatusCode::OK.into_response();
    apply_stream_headers(response.headers_mut());
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    response
}

async fn serve(
    state: AppState,
    key: SessionKey,
    tab_id: String,
    metadata: ConnectionMetadata,
) -> Result<Response, ApiError> {
    let live = open_stream(&state.registry, state.store.as_ref(), key.clone(), tab_id, metadata)
        .await?;
    info!(
        target = "live.routes",
        session = %key,
        connection_id = live.registration().connection_id,
        active = live.registration().admission.is_active(),
        "stream opened"
    );

    let events = live.map(|payload| Ok::<_, Infallible>(Event::default().data(&*payload)));
    let mut response = Sse::new(events).into_response();
    apply_stream_headers(response.headers_mut());
    Ok(response)
}

fn apply_stream_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
}

fn metadata(user_id: Option<&str>, headers: &HeaderMap) -> ConnectionMetadata {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    ConnectionMetadata::new(user_id.map(str::to_owned), user_agent)
}
