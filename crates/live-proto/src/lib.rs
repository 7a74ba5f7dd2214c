//! Wire definitions shared by the live relay and its clients.
//! Kept free of runtime dependencies so bindings for the web client
//! can be regenerated from it without pulling in the server.

mod event;
mod moves;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use event::{
    ActiveTabChange, ConnectionRole, Envelope, EntitySnapshot, SyncEvent, TabStatus,
};
pub use moves::{
    generate_move_id, ConflictBody, MoveAccepted, MoveApplied, MoveSubmission, NotificationRecord,
};

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("unknown scope: {0}")]
    UnknownScope(String),
    #[error("sse frame is missing a data line")]
    MissingData,
    #[error("invalid envelope: {0}")]
    Json(#[from] serde_json::Error),
}

/// Namespace a stream belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Game,
    Notifications,
    Messages,
}

impl Scope {
    pub const ALL: [Scope; 3] = [Scope::Game, Scope::Notifications, Scope::Messages];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Game => "game",
            Scope::Notifications => "notifications",
            Scope::Messages => "messages",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = ProtoError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "game" => Ok(Scope::Game),
            "notifications" => Ok(Scope::Notifications),
            "messages" => Ok(Scope::Messages),
            other => Err(ProtoError::UnknownScope(other.to_string())),
        }
    }
}

/// `(scope, entityId)`: a game id for [`Scope::Game`], a user id otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKey {
    pub scope: Scope,
    pub entity_id: String,
}

impl SessionKey {
    pub fn new(scope: Scope, entity_id: impl Into<String>) -> Self {
        Self {
            scope,
            entity_id: entity_id.into(),
        }
    }

    pub fn game(game_id: impl Into<String>) -> Self {
        Self::new(Scope::Game, game_id)
    }

    pub fn notifications(user_id: impl Into<String>) -> Self {
        Self::new(Scope::Notifications, user_id)
    }

    pub fn messages(user_id: impl Into<String>) -> Self {
        Self::new(Scope::Messages, user_id)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.entity_id)
    }
}
