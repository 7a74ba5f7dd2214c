use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use live_proto::{EntitySnapshot, MoveSubmission, NotificationRecord, Scope, SessionKey};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{scope} entity {entity_id} not found")]
    NotFound { scope: Scope, entity_id: String },
    #[error("game {0} already exists")]
    AlreadyExists(String),
    #[error("version conflict on {}: expected {expected}, current {}", current.entity_id, current.version)]
    Conflict {
        expected: u64,
        current: EntitySnapshot,
    },
    #[error("record could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq)]
pub struct AppliedMove {
    pub version: u64,
    /// The move id had been applied before; the store did not change.
    pub duplicate: bool,
    pub snapshot: EntitySnapshot,
}

/// Authoritative game and notification records. Domain validation of moves happens
/// upstream; the store only sequences them.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn read_entity_state(&self, scope: Scope, entity_id: &str)
        -> StoreResult<EntitySnapshot>;

    async fn create_game(&self, game_id: &str, state: Value) -> StoreResult<EntitySnapshot>;

    /// Applies `submission` when `expected_version` matches. Re-submitting an applied move id
    /// succeeds without effect.
    async fn apply_move(
        &self,
        game_id: &str,
        submission: &MoveSubmission,
    ) -> StoreResult<AppliedMove>;

    /// Appends a record to a user-scoped entity (`notifications` or `messages`).
    async fn create_notification(
        &self,
        scope: Scope,
        recipient_id: &str,
        kind: &str,
        data: Value,
    ) -> StoreResult<NotificationRecord>;
}

#[derive(Debug)]
struct EntityRecord {
    version: u64,
    state: Value,
    applied_moves: HashMap<String, u64>,
}

impl EntityRecord {
    fn new(state: Value) -> Self {
        Self {
            version: 0,
            state,
            applied_moves: HashMap::new(),
        }
    }

    fn snapshot(&self, entity_id: &str) -> EntitySnapshot {
        EntitySnapshot {
            entity_id: entity_id.to_string(),
            version: self.version,
            state: self.state.clone(),
        }
    }

    fn push(&mut self, field: &str, item: Value) {
        if !self.state.is_object() {
            self.state = json!({});
        }
        let list = self
            .state
            .as_object_mut()
            .map(|map| map.entry(field.to_string()).or_insert_with(|| json!([])));
        match list {
            Some(Value::Array(items)) => items.push(item),
            Some(other) => *other = json!([item]),
            None => {}
        }
        self.version += 1;
    }
}

/// In-process store used by the binary and by tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entities: RwLock<HashMap<SessionKey, EntityRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn list_field(scope: Scope) -> &'static str {
    match scope {
        Scope::Game => "moves",
        Scope::Notifications => "notifications",
        Scope::Messages => "messages",
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn read_entity_state(
        &self,
        scope: Scope,
        entity_id: &str,
    ) -> StoreResult<EntitySnapshot> {
        let key = SessionKey::new(scope, entity_id);
        let guard = self.entities.read().await;
        match (guard.get(&key), scope) {
            (Some(record), _) => Ok(record.snapshot(entity_id)),
            (None, Scope::Game) => Err(StoreError::NotFound {
                scope,
                entity_id: entity_id.to_string(),
            }),
            // Users without records simply have nothing yet.
            (None, _) => Ok(EntitySnapshot {
                entity_id: entity_id.to_string(),
                version: 0,
                state: json!({ list_field(scope): [] }),
            }),
        }
    }

    async fn create_game(&self, game_id: &str, state: Value) -> StoreResult<EntitySnapshot> {
        let key = SessionKey::game(game_id);
        let mut guard = self.entities.write().await;
        if guard.contains_key(&key) {
            return Err(StoreError::AlreadyExists(game_id.to_string()));
        }
        let mut state = if state.is_object() { state } else { json!({}) };
        if let Some(map) = state.as_object_mut() {
            map.entry("moves".to_string()).or_insert_with(|| json!([]));
        }
        let record = EntityRecord::new(state);
        let snapshot = record.snapshot(game_id);
        guard.insert(key, record);
        Ok(snapshot)
    }

    async fn apply_move(
        &self,
        game_id: &str,
        submission: &MoveSubmission,
    ) -> StoreResult<AppliedMove> {
        let key = SessionKey::game(game_id);
        let mut guard = self.entities.write().await;
        let record = guard.get_mut(&key).ok_or_else(|| StoreError::NotFound {
            scope: Scope::Game,
            entity_id: game_id.to_string(),
        })?;

        if let Some(version) = record.applied_moves.get(&submission.move_id).copied() {
            return Ok(AppliedMove {
                version,
                duplicate: true,
                snapshot: record.snapshot(game_id),
            });
        }
        if submission.expected_version != record.version {
            return Err(StoreError::Conflict {
                expected: submission.expected_version,
                current: record.snapshot(game_id),
            });
        }

        record.push(
            "moves",
            json!({
                "moveId": submission.move_id,
                "action": submission.action,
            }),
        );
        let version = record.version;
        record
            .applied_moves
            .insert(submission.move_id.clone(), version);
        Ok(AppliedMove {
            version,
            duplicate: false,
            snapshot: record.snapshot(game_id),
        })
    }

    async fn create_notification(
        &self,
        scope: Scope,
        recipient_id: &str,
        kind: &str,
        data: Value,
    ) -> StoreResult<NotificationRecord> {
        let notification = NotificationRecord {
            id: Uuid::new_v4().to_string(),
            recipient_id: recipient_id.to_string(),
            kind: kind.to_string(),
            data,
            created_at: Utc::now(),
        };
        let item = serde_json::to_value(&notification)?;
        let key = SessionKey::new(scope, recipient_id);
        let mut guard = self.entities.write().await;
        guard
            .entry(key)
            .or_insert_with(|| EntityRecord::new(json!({ list_field(scope): [] })))
            .push(list_field(scope), item);
        Ok(notification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission(move_id: &str, expected_version: u64) -> MoveSubmission {
        MoveSubmission {
            move_id: move_id.to_string(),
            tab_id: "A1".to_string(),
            expected_version,
            action: json!({ "from": 9, "to": 13 }),
        }
    }

    #[tokio::test]
    async fn moves_advance_the_version() {
        let store = MemoryStore::new();
        store.create_game("g-1", json!({})).await.unwrap();

        let applied = store.apply_move("g-1", &submission("m-1", 0)).await.unwrap();
        assert_eq!(applied.version, 1);
        assert!(!applied.duplicate);

        let snapshot = store.read_entity_state(Scope::Game, "g-1").await.unwrap();
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.state["moves"][0]["moveId"], "m-1");
    }

    #[tokio::test]
    async fn stale_version_is_a_conflict_with_current_state() {
        let store = MemoryStore::new();
        store.create_game("g-1", json!({})).await.unwrap();
        store.apply_move("g-1", &submission("m-1", 0)).await.unwrap();

        match store.apply_move("g-1", &submission("m-2", 0)).await {
            Err(StoreError::Conflict { expected, current }) => {
                assert_eq!(expected, 0);
                assert_eq!(current.version, 1);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resubmitted_move_is_idempotent() {
        let store = MemoryStore::new();
        store.create_game("g-1", json!({})).await.unwrap();
        store.apply_move("g-1", &submission("m-1", 0)).await.unwrap();

        let again = store.apply_move("g-1", &submission("m-1", 0)).await.unwrap();
        assert!(again.duplicate);
        assert_eq!(again.version, 1);
        assert_eq!(again.snapshot.state["moves"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_game_is_not_found_but_users_start_empty() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.read_entity_state(Scope::Game, "missing").await,
            Err(StoreError::NotFound { .. })
        ));
        let inbox = store
            .read_entity_state(Scope::Notifications, "alice")
            .await
            .unwrap();
        assert_eq!(inbox.version, 0);
        assert_eq!(inbox.state["notifications"], json!([]));
    }

    #[tokio::test]
    async fn notifications_accumulate_per_recipient() {
        let store = MemoryStore::new();
        store
            .create_notification(Scope::Notifications, "bob", "friend_request", json!({"from": "alice"}))
            .await
            .unwrap();
        let inbox = store
            .read_entity_state(Scope::Notifications, "bob")
            .await
            .unwrap();
        assert_eq!(inbox.version, 1);
        assert_eq!(inbox.state["notifications"][0]["kind"], "friend_request");
    }

    #[tokio::test]
    async fn duplicate_game_is_rejected() {
        let store = MemoryStore::new();
        store.create_game("g-1", json!({})).await.unwrap();
        assert!(matches!(
            store.create_game("g-1", json!({})).await,
            Err(StoreError::AlreadyExists(id)) if id == "g-1"
        ));
    }
}
