//! Per-entity connection sets.
//!
//! A [`Session`] owns every [`Connection`] that shares a `(scope, entityId)`. It knows how to
//! write a payload to its connections and which tab is active; the decisions about *who*
//! becomes active live in [`crate::arbiter`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use live_proto::{Envelope, SyncEvent, TabStatus};
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::sink::{EventSink, SinkError};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetadata {
    pub user_id: Option<String>,
    pub user_agent: Option<String>,
    pub connected_at: DateTime<Utc>,
}

impl ConnectionMetadata {
    pub fn new(user_id: Option<String>, user_agent: Option<String>) -> Self {
        Self {
            user_id,
            user_agent,
            connected_at: Utc::now(),
        }
    }
}

impl Default for ConnectionMetadata {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// One live output stream to one tab.
pub struct Connection {
    pub(crate) id: u64,
    pub(crate) tab_id: String,
    sink: Box<dyn EventSink>,
    pub(crate) last_seen: Instant,
    pub(crate) is_active: bool,
    pub(crate) metadata: ConnectionMetadata,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        tab_id: String,
        sink: Box<dyn EventSink>,
        metadata: ConnectionMetadata,
        now: Instant,
    ) -> Self {
        Self {
            id,
            tab_id,
            sink,
            last_seen: now,
            is_active: false,
            metadata,
        }
    }

    pub(crate) fn write(&mut self, payload: &Arc<str>, now: Instant) -> Result<(), SinkError> {
        self.sink.send(Arc::clone(payload))?;
        self.last_seen = now;
        Ok(())
    }

    /// Best-effort `connection_closed`, then the sink is dropped with `self`.
    pub(crate) fn close(self, reason: &str) {
        let event = Envelope::new(SyncEvent::connection_closed(reason));
        if let Ok(json) = event.to_json() {
            if let Err(err) = self.sink.send(Arc::from(json)) {
                debug!(
                    target = "live.registry",
                    tab_id = %self.tab_id,
                    error = %err,
                    "close notice not delivered"
                );
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TabView {
    pub tab_id: String,
    pub connection_id: u64,
    pub is_active: bool,
    pub user_id: Option<String>,
}

/// Read-only copy of a session, sorted by tab id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub active_tab_id: Option<String>,
    pub tabs: Vec<TabView>,
}

impl SessionView {
    pub fn active_count(&self) -> usize {
        self.tabs.iter().filter(|tab| tab.is_active).count()
    }
}

pub struct Session {
    pub(crate) connections: HashMap<String, Connection>,
    pub(crate) active_tab: Option<String>,
    pub(crate) single_active: bool,
}

impl Session {
    pub(crate) fn new(single_active: bool) -> Self {
        Self {
            connections: HashMap::new(),
            active_tab: None,
            single_active,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn contains(&self, tab_id: &str) -> bool {
        self.connections.contains_key(tab_id)
    }

    pub fn status(&self) -> TabStatus {
        TabStatus {
            active_tab_id: self.active_tab.clone(),
            total_tabs: self.connections.len(),
        }
    }

    pub fn view(&self) -> SessionView {
        let mut tabs: Vec<TabView> = self
            .connections
            .values()
            .map(|conn| TabView {
                tab_id: conn.tab_id.clone(),
                connection_id: conn.id,
                is_active: conn.is_active,
                user_id: conn.metadata.user_id.clone(),
            })
            .collect();
        tabs.sort_by(|a, b| a.tab_id.cmp(&b.tab_id));
        SessionView {
            active_tab_id: self.active_tab.clone(),
            tabs,
        }
    }

    /// Writes to every connection; returns the tabs whose write failed.
    /// Failed connections stay in place so the caller can run arbitration on removal.
    pub(crate) fn deliver(&mut self, payload: &Arc<str>, now: Instant) -> Vec<(String, SinkError)> {
        self.connections
            .values_mut()
            .filter_map(|conn| {
                conn.write(payload, now)
                    .err()
                    .map(|err| (conn.tab_id.clone(), err))
            })
            .collect()
    }

    pub(crate) fn deliver_to(
        &mut self,
        tab_id: &str,
        payload: &Arc<str>,
        now: Instant,
    ) -> Option<Result<(), SinkError>> {
        self.connections
            .get_mut(tab_id)
            .map(|conn| conn.write(payload, now))
    }

    pub(crate) fn touch(&mut self, tab_id: &str, now: Instant) -> bool {
        match self.connections.get_mut(tab_id) {
            Some(conn) => {
                conn.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Detaches a connection without arbitration. Returns it with its former active flag.
    pub(crate) fn take(&mut self, tab_id: &str) -> Option<(Connection, bool)> {
        let conn = self.connections.remove(tab_id)?;
        let was_active = self.active_tab.as_deref() == Some(tab_id);
        if was_active {
            self.active_tab = None;
        }
        Some((conn, was_active))
    }

    pub(crate) fn take_all(&mut self) -> Vec<Connection> {
        self.active_tab = None;
        self.connections.drain().map(|(_, conn)| conn).collect()
    }

    pub(crate) fn stale_tabs(&self, now: Instant, prune_after: std::time::Duration) -> Vec<String> {
        self.connections
            .values()
            .filter(|conn| now.saturating_duration_since(conn.last_seen) > prune_after)
            .map(|conn| conn.tab_id.clone())
            .collect()
    }
}
