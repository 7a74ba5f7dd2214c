//! Client side of the live relay: optimistic moves, the offline queue, the reconnecting
//! stream and the glue that keeps one tab's view of a game in step with the server.

pub mod connection;
pub mod http;
pub mod offline;
pub mod reconciler;
pub mod stream;
pub mod sync;

use std::fmt::Debug;

use live_proto::ConflictBody;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub use connection::{Backoff, ConnectionMachine, ConnectionState};
pub use http::{HttpTransport, MoveTransport};
pub use offline::{DrainOutcome, DrainReport, Halt, OfflineQueue, QueuedMove};
pub use reconciler::{Reconciler, RemoteOutcome, Resolution, Settled};
pub use stream::{
    subscribe, HeartbeatConfig, LiveSubscription, StreamConfig, DEFAULT_HEARTBEAT_INTERVAL,
};
pub use sync::{GameSync, PlayOutcome};

/// Game state as the client holds it. Snapshots from the relay deserialize into it and
/// actions are replayed onto it.
pub trait LocalState: Clone + Debug + DeserializeOwned + Send + Sync + 'static {
    type Action: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    fn apply(&mut self, action: &Self::Action);
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("version conflict: server is at version {}", .0.current.version)]
    Conflict(Box<ConflictBody>),
    #[error("not signed in")]
    Unauthorized,
    #[error("move rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("transport failure: {0}")]
    Transport(String),
}

impl SubmitError {
    pub(crate) fn timed_out(after: std::time::Duration) -> Self {
        SubmitError::Transport(format!("no answer within {after:?}"))
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("tab {0} is not the active tab for this game")]
    PassiveTab(String),
    #[error("offline queue is halted; discard or rebase it first")]
    QueueHalted,
    #[error("not connected")]
    Offline,
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error("invalid payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use live_proto::{ConflictBody, EntitySnapshot, MoveAccepted, MoveSubmission};
    use serde::Deserialize;
    use serde_json::json;

    use crate::http::MoveTransport;
    use crate::{LocalState, SubmitError};

    /// Records every action in order.
    #[derive(Debug, Clone, Default, PartialEq, Deserialize)]
    pub struct Trail {
        #[serde(default)]
        pub steps: Vec<String>,
    }

    impl LocalState for Trail {
        type Action = String;

        fn apply(&mut self, action: &String) {
            self.steps.push(action.clone());
        }
    }

    /// Answers submissions from a script and records what was sent.
    pub struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<MoveAccepted, SubmitError>>>,
        submitted: Mutex<Vec<MoveSubmission>>,
    }

    impl ScriptedTransport {
        pub fn new(responses: Vec<Result<MoveAccepted, SubmitError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                submitted: Mutex::new(Vec::new()),
            }
        }

        pub fn submitted(&self) -> Vec<MoveSubmission> {
            self.submitted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MoveTransport for ScriptedTransport {
        async fn submit_move(
            &self,
            _game_id: &str,
            submission: &MoveSubmission,
        ) -> Result<MoveAccepted, SubmitError> {
            self.submitted.lock().unwrap().push(submission.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(SubmitError::Transport("no scripted response".into())))
        }
    }

    /// Conflict whose snapshot holds `s1..=s{version}`.
    pub fn conflict(move_id: &str, expected: u64, version: u64) -> ConflictBody {
        let steps: Vec<String> = (1..=version).map(|n| format!("s{n}")).collect();
        ConflictBody::new(
            move_id,
            expected,
            EntitySnapshot {
                entity_id: "G1".into(),
                version,
                state: json!({ "steps": steps }),
            },
        )
    }
}
