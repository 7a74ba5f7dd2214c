use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::EntitySnapshot;

/// Body of `POST /games/:game_id/moves`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveSubmission {
    /// Client-generated id; echoed back in `MOVE_APPLIED` so the originating tab can match it.
    pub move_id: String,
    pub tab_id: String,
    /// Version the move was computed against.
    pub expected_version: u64,
    pub action: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveAccepted {
    pub move_id: String,
    pub version: u64,
    /// The move id had already been applied; nothing changed.
    #[serde(default)]
    pub duplicate: bool,
}

/// Payload of `MOVE_APPLIED`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveApplied {
    pub move_id: String,
    pub entity_id: String,
    pub version: u64,
    pub action: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_tab_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// 409 body returned when `expected_version` is behind the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictBody {
    pub error: String,
    pub move_id: String,
    pub expected_version: u64,
    pub current: EntitySnapshot,
}

impl ConflictBody {
    pub const ERROR: &'static str = "version_conflict";

    pub fn new(move_id: impl Into<String>, expected_version: u64, current: EntitySnapshot) -> Self {
        Self {
            error: Self::ERROR.to_string(),
            move_id: move_id.into(),
            expected_version,
            current,
        }
    }
}

/// Payload of `NOTIFICATION_CREATED`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: String,
    pub recipient_id: String,
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Fresh id for an optimistic move.
pub fn generate_move_id() -> String {
    format!("opt-{}", Uuid::new_v4())
}
