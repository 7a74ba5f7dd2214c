use serde::{Deserialize, Serialize};

use crate::moves::{MoveApplied, NotificationRecord};
use crate::ProtoError;

/// Authoritative state of one entity as the store last committed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySnapshot {
    pub entity_id: String,
    pub version: u64,
    pub state: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabStatus {
    pub active_tab_id: Option<String>,
    pub total_tabs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTabChange {
    pub active_tab_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_tab_id: Option<String>,
    pub total_tabs: usize,
}

/// Sent to a single tab to tell it whether it may mutate the entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRole {
    pub tab_id: String,
    pub is_active: bool,
    pub active_tab_id: Option<String>,
}

/// Every event the relay pushes over a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum SyncEvent {
    #[serde(rename = "INITIAL_STATE")]
    InitialState(EntitySnapshot),
    #[serde(rename = "TAB_STATUS_UPDATE")]
    TabStatusUpdate(TabStatus),
    #[serde(rename = "MOVE_APPLIED")]
    MoveApplied(MoveApplied),
    #[serde(rename = "ACTIVE_TAB_CHANGED")]
    ActiveTabChanged(ActiveTabChange),
    #[serde(rename = "CONNECTION_STATUS")]
    ConnectionStatus(ConnectionRole),
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
    #[serde(rename = "NOTIFICATION_CREATED")]
    NotificationCreated(NotificationRecord),
    #[serde(rename = "connection_established")]
    ConnectionEstablished {
        #[serde(rename = "tabId")]
        tab_id: String,
    },
    #[serde(rename = "connection_closed")]
    ConnectionClosed { reason: String },
    #[serde(rename = "error")]
    Error { message: String },
}

impl SyncEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::InitialState(_) => "INITIAL_STATE",
            SyncEvent::TabStatusUpdate(_) => "TAB_STATUS_UPDATE",
            SyncEvent::MoveApplied(_) => "MOVE_APPLIED",
            SyncEvent::ActiveTabChanged(_) => "ACTIVE_TAB_CHANGED",
            SyncEvent::ConnectionStatus(_) => "CONNECTION_STATUS",
            SyncEvent::Heartbeat => "HEARTBEAT",
            SyncEvent::NotificationCreated(_) => "NOTIFICATION_CREATED",
            SyncEvent::ConnectionEstablished { .. } => "connection_established",
            SyncEvent::ConnectionClosed { .. } => "connection_closed",
            SyncEvent::Error { .. } => "error",
        }
    }

    /// Close reason sent to a stream that another connection took over.
    pub const REPLACED: &'static str = "replaced";

    pub fn connection_closed(reason: impl Into<String>) -> Self {
        SyncEvent::ConnectionClosed {
            reason: reason.into(),
        }
    }

    /// True for the `connection_closed` of a stream that was taken over. Reconnecting would
    /// only take it back.
    pub fn is_replacement(&self) -> bool {
        matches!(self, SyncEvent::ConnectionClosed { reason } if reason == Self::REPLACED)
    }
}

/// `{ "type", "payload"?, "timestamp" }` as written on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub event: SyncEvent,
    /// Milliseconds since the unix epoch.
    pub timestamp: i64,
}

impl Envelope {
    pub fn new(event: SyncEvent) -> Self {
        Self {
            event,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn to_json(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serializes as a single `data: <json>\n\n` SSE frame.
    pub fn to_sse_frame(&self) -> Result<String, ProtoError> {
        Ok(format!("data: {}\n\n", self.to_json()?))
    }

    /// Parses one SSE frame. Multiple `data:` lines are joined with `\n`;
    /// comment and field lines other than `data` are ignored.
    pub fn from_sse_frame(frame: &str) -> Result<Self, ProtoError> {
        let mut data: Option<String> = None;
        for line in frame.lines() {
            let Some(rest) = line.strip_prefix("data:") else {
                continue;
            };
            let rest = rest.strip_prefix(' ').unwrap_or(rest);
            match data.as_mut() {
                Some(buf) => {
                    buf.push('\n');
                    buf.push_str(rest);
                }
                None => data = Some(rest.to_string()),
            }
        }
        let data = data.ok_or(ProtoError::MissingData)?;
        Self::from_json(&data)
    }
}

impl From<SyncEvent> for Envelope {
    fn from(event: SyncEvent) -> Self {
        Envelope::new(event)
    }
}
