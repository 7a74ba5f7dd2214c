use axum::{
    extract::{Path, State},
    Json,
};
use live_proto::{
    EntitySnapshot, MoveAccepted, MoveApplied, MoveSubmission, SessionKey, TabStatus,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ApiError, ApiResult, CurrentUser};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGameRequest {
    #[serde(default)]
    pub game_id: Option<String>,
    #[serde(default)]
    pub state: Value,
}

pub async fn create_game(
    State(state): State<AppState>,
    Json(body): Json<CreateGameRequest>,
) -> ApiResult<EntitySnapshot> {
    let game_id = body
        .game_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let snapshot = state.store.create_game(&game_id, body.state).await?;
    info!(target = "live.routes", game_id = %game_id, "game created");
    Ok(Json(snapshot))
}

/// Applies a move from the active tab and fans `MOVE_APPLIED` out to every tab of the game.
pub async fn submit_move(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
    user: CurrentUser,
    Json(submission): Json<MoveSubmission>,
) -> ApiResult<MoveAccepted> {
    if submission.move_id.trim().is_empty() || submission.tab_id.trim().is_empty() {
        return Err(ApiError::BadRequest("moveId and tabId are required".into()));
    }
    let key = SessionKey::game(game_id.as_str());
    if !state.registry.may_mutate(&key, &submission.tab_id) {
        debug!(
            target = "live.routes",
            session = %key,
            tab_id = %submission.tab_id,
            "move rejected from passive tab"
        );
        return Err(ApiError::Forbidden("tab is not the active tab for this game"));
    }

    let applied = state
        .store
        .apply_move(&game_id, &submission)
        .await
        .map_err(|err| match ApiError::from(err) {
            ApiError::VersionConflict(mut body) => {
                body.move_id = submission.move_id.clone();
                ApiError::VersionConflict(body)
            }
            other => other,
        })?;

    if !applied.duplicate {
        state.fanout.move_applied(MoveApplied {
            move_id: submission.move_id.clone(),
            entity_id: game_id.clone(),
            version: applied.version,
            action: submission.action.clone(),
            origin_tab_id: Some(submission.tab_id.clone()),
            user_id: Some(user.id().to_string()),
        });
    }

    Ok(Json(MoveAccepted {
        move_id: submission.move_id,
        version: applied.version,
        duplicate: applied.duplicate,
    }))
}

pub async fn tab_heartbeat(
    State(state): State<AppState>,
    Path((game_id, tab_id)): Path<(String, String)>,
) -> ApiResult<TabStatus> {
    let status = state.registry.touch(&SessionKey::game(game_id), &tab_id)?;
    Ok(Json(status))
}

pub async fn activate_tab(
    State(state): State<AppState>,
    Path((game_id, tab_id)): Path<(String, String)>,
) -> ApiResult<TabStatus> {
    let status = state
        .registry
        .request_activation(&SessionKey::game(game_id), &tab_id)?;
    Ok(Json(status))
}
