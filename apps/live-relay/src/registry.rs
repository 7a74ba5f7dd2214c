//! Connection registry: every live stream, keyed by `(scope, entityId, tabId)`.
//!
//! Sessions live in a [`DashMap`]; each mutation happens under the session's shard guard and
//! never across an `.await`, so writes to sinks are `try_send`s only. Empty sessions are
//! discarded right after the operation that emptied them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use live_proto::{
    ActiveTabChange, ConnectionRole, Envelope, Scope, SessionKey, SyncEvent, TabStatus,
};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::arbiter::{ActivationError, Admission};
use crate::config::RegistrySettings;
use crate::session::{Connection, ConnectionMetadata, Session, SessionView};
use crate::sink::{EventSink, SinkError};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no live session for {0}")]
    UnknownSession(SessionKey),
    #[error("tab {tab_id} is not connected to {key}")]
    UnknownTab { key: SessionKey, tab_id: String },
}

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectOptions {
    /// Close every other connection of the entity before registering this one.
    pub enforce_single_client: bool,
}

impl ConnectOptions {
    pub fn for_scope(settings: &RegistrySettings, scope: Scope) -> Self {
        Self {
            enforce_single_client: settings.policy(scope).enforce_single_client,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub connection_id: u64,
    pub admission: Admission,
    pub status: TabStatus,
    pub replaced: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub pruned: usize,
    pub reassigned: usize,
}

pub struct Registry {
    sessions: DashMap<SessionKey, Session>,
    settings: RegistrySettings,
    next_connection_id: AtomicU64,
    pub(crate) timers: Mutex<Vec<JoinHandle<()>>>,
}

impl Registry {
    pub fn new(settings: RegistrySettings) -> Self {
        Self {
            sessions: DashMap::new(),
            settings,
            next_connection_id: AtomicU64::new(1),
            timers: Mutex::new(Vec::new()),
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Registers a stream for `tab_id`. A previous connection of the same tab (or, with
    /// `enforce_single_client`, of any tab) is sent `connection_closed` and dropped first.
    /// Every tab then receives `TAB_STATUS_UPDATE`; the new tab also gets `CONNECTION_STATUS`.
    pub fn add_connection(
        &self,
        key: &SessionKey,
        tab_id: &str,
        sink: Box<dyn EventSink>,
        metadata: ConnectionMetadata,
        options: ConnectOptions,
    ) -> Registration {
        let now = Instant::now();
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let single_active = self.settings.policy(key.scope).single_active_tab;

        let registration = {
            let mut session = self
                .sessions
                .entry(key.clone())
                .or_insert_with(|| Session::new(single_active));

            let replaced = if options.enforce_single_client {
                session.take_all()
            } else {
                session
                    .take(tab_id)
                    .map(|(conn, _)| vec![conn])
                    .unwrap_or_default()
            };
            let replaced_count = replaced.len();
            for old in replaced {
                debug!(
                    target = "live.registry",
                    session = %key,
                    tab_id = %old.tab_id,
                    connection_id = old.id,
                    "closing replaced connection"
                );
                old.close(SyncEvent::REPLACED);
            }

            let conn = Connection::new(connection_id, tab_id.to_string(), sink, metadata, now);
            let admission = session.admit(conn, now, self.settings.active_stale_after);
            let status = session.status();

            let mut failed = Vec::new();
            if let Some(payload) = encode(SyncEvent::TabStatusUpdate(status.clone())) {
                failed = session.deliver(&payload, now);
            }
            let role = SyncEvent::ConnectionStatus(ConnectionRole {
                tab_id: tab_id.to_string(),
                is_active: admission.is_active(),
                active_tab_id: status.active_tab_id.clone(),
            });
            if let Some(payload) = encode(role) {
                if let Some(Err(err)) = session.deliver_to(tab_id, &payload, now) {
                    if !failed.iter().any(|(tab, _)| tab == tab_id) {
                        failed.push((tab_id.to_string(), err));
                    }
                }
            }
            settle_failures(key, &mut session, failed, now);

            info!(
                target = "live.registry",
                session = %key,
                tab_id,
                connection_id,
                admission = ?admission,
                total_tabs = status.total_tabs,
                "connection registered"
            );

            Registration {
                connection_id,
                admission,
                status,
                replaced: replaced_count,
            }
        };

        self.discard_if_empty(key);
        registration
    }

    /// Removes and closes the tab's connection. Removing an absent tab is a no-op.
    pub fn remove_connection(&self, key: &SessionKey, tab_id: &str) -> bool {
        self.detach(key, tab_id, None, Some("removed"))
    }

    /// Cancellation path of a stream: removes the connection only if it is still the one
    /// identified by `connection_id` (a replacement under the same tab id is left alone).
    pub fn release(&self, key: &SessionKey, tab_id: &str, connection_id: u64) -> bool {
        self.detach(key, tab_id, Some(connection_id), None)
    }

    fn detach(
        &self,
        key: &SessionKey,
        tab_id: &str,
        expected_id: Option<u64>,
        close_reason: Option<&str>,
    ) -> bool {
        let now = Instant::now();
        let removed = match self.sessions.get_mut(key) {
            None => false,
            Some(mut session) => {
                let matches = session
                    .connections
                    .get(tab_id)
                    .is_some_and(|conn| expected_id.map_or(true, |id| conn.id == id));
                match matches.then(|| session.take(tab_id)).flatten() {
                    None => false,
                    Some((conn, was_active)) => {
                        info!(
                            target = "live.registry",
                            session = %key,
                            tab_id,
                            connection_id = conn.id,
                            was_active,
                            "connection removed"
                        );
                        match close_reason {
                            Some(reason) => conn.close(reason),
                            None => drop(conn),
                        }
                        let change = session.handle_departure(tab_id, was_active);
                        announce(key, &mut session, change, now);
                        true
                    }
                }
            }
        };
        self.discard_if_empty(key);
        removed
    }

    /// Writes `event` to every connection of the session. A failed write removes that
    /// connection and never stops delivery to the others. Returns the number delivered.
    pub fn broadcast(&self, key: &SessionKey, event: SyncEvent) -> usize {
        let kind = event.kind();
        let Some(payload) = encode(event) else {
            return 0;
        };
        let now = Instant::now();
        let delivered = match self.sessions.get_mut(key) {
            None => 0,
            Some(mut session) => {
                let failed = session.deliver(&payload, now);
                let delivered = session.len() - failed.len();
                settle_failures(key, &mut session, failed, now);
                delivered
            }
        };
        debug!(
            target = "live.registry",
            session = %key,
            kind,
            delivered,
            "broadcast"
        );
        self.discard_if_empty(key);
        delivered
    }

    /// Writes `event` to one tab. A failed write removes that connection.
    pub fn send_to(&self, key: &SessionKey, tab_id: &str, event: SyncEvent) -> bool {
        let Some(payload) = encode(event) else {
            return false;
        };
        let now = Instant::now();
        let sent = match self.sessions.get_mut(key) {
            None => false,
            Some(mut session) => match session.deliver_to(tab_id, &payload, now) {
                None => false,
                Some(Ok(())) => true,
                Some(Err(err)) => {
                    settle_failures(key, &mut session, vec![(tab_id.to_string(), err)], now);
                    false
                }
            },
        };
        self.discard_if_empty(key);
        sent
    }

    /// Client heartbeat: refreshes `lastSeen` without contesting activity.
    pub fn touch(&self, key: &SessionKey, tab_id: &str) -> RegistryResult<TabStatus> {
        let now = Instant::now();
        let mut session = self
            .sessions
            .get_mut(key)
            .ok_or_else(|| RegistryError::UnknownSession(key.clone()))?;
        if !session.touch(tab_id, now) {
            return Err(RegistryError::UnknownTab {
                key: key.clone(),
                tab_id: tab_id.to_string(),
            });
        }
        Ok(session.status())
    }

    /// A passive tab asks to become the active one. All tabs learn the outcome.
    pub fn request_activation(&self, key: &SessionKey, tab_id: &str) -> RegistryResult<TabStatus> {
        let now = Instant::now();
        let status = {
            let mut session = self
                .sessions
                .get_mut(key)
                .ok_or_else(|| RegistryError::UnknownSession(key.clone()))?;
            session.touch(tab_id, now);
            let change = session.activate(tab_id).map_err(|err| match err {
                ActivationError::UnknownTab => RegistryError::UnknownTab {
                    key: key.clone(),
                    tab_id: tab_id.to_string(),
                },
            })?;
            if let Some(change) = change {
                info!(
                    target = "live.arbiter",
                    session = %key,
                    active_tab = ?change.active_tab_id,
                    previous_tab = ?change.previous_tab_id,
                    "activation requested"
                );
                announce(key, &mut session, Some(change), now);
            }
            session.status()
        };
        self.discard_if_empty(key);
        Ok(status)
    }

    /// Whether `tab_id` may mutate the entity: true unless another tab holds activity.
    pub fn may_mutate(&self, key: &SessionKey, tab_id: &str) -> bool {
        self.sessions
            .get(key)
            .map_or(true, |session| session.may_mutate(tab_id))
    }

    pub fn status(&self, key: &SessionKey) -> Option<TabStatus> {
        self.sessions.get(key).map(|session| session.status())
    }

    pub fn view(&self, key: &SessionKey) -> Option<SessionView> {
        self.sessions.get(key).map(|session| session.view())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.iter().map(|entry| entry.len()).sum()
    }

    /// Sends `HEARTBEAT` to every connection of `scope`. Returns the number delivered.
    pub fn heartbeat(&self, scope: Scope) -> usize {
        let Some(payload) = encode(SyncEvent::Heartbeat) else {
            return 0;
        };
        let now = Instant::now();
        let mut delivered = 0;
        for mut entry in self.sessions.iter_mut() {
            if entry.key().scope != scope {
                continue;
            }
            let key = entry.key().clone();
            let session = entry.value_mut();
            let failed = session.deliver(&payload, now);
            delivered += session.len() - failed.len();
            settle_failures(&key, session, failed, now);
        }
        self.sessions.retain(|_, session| !session.is_empty());
        delivered
    }

    /// Prunes connections silent for longer than `prune_after` and hands activity away from
    /// stale active tabs.
    pub fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let prune_after = self.settings.prune_after;
        let stale_after = self.settings.active_stale_after;
        let mut report = SweepReport::default();

        for mut entry in self.sessions.iter_mut() {
            let key = entry.key().clone();
            let session = entry.value_mut();

            let mut change = None;
            let mut pruned_here = 0;
            for tab_id in session.stale_tabs(now, prune_after) {
                if let Some((conn, was_active)) = session.take(&tab_id) {
                    warn!(
                        target = "live.registry",
                        session = %key,
                        tab_id = %tab_id,
                        connection_id = conn.id,
                        "pruning silent connection"
                    );
                    conn.close("heartbeat timeout");
                    pruned_here += 1;
                    if let Some(departure) = session.handle_departure(&tab_id, was_active) {
                        change = Some(departure);
                    }
                }
            }
            report.pruned += pruned_here;
            if session.is_empty() {
                continue;
            }
            if let Some(reassigned) = session.reassign_if_stale(now, stale_after) {
                info!(
                    target = "live.arbiter",
                    session = %key,
                    active_tab = ?reassigned.active_tab_id,
                    previous_tab = ?reassigned.previous_tab_id,
                    "stale active tab replaced"
                );
                report.reassigned += 1;
                change = Some(reassigned);
            }
            if change.is_some() || pruned_here > 0 {
                announce(&key, session, change, now);
            }
        }

        self.sessions.retain(|_, session| !session.is_empty());
        if report.pruned > 0 || report.reassigned > 0 {
            debug!(
                target = "live.registry",
                pruned = report.pruned,
                reassigned = report.reassigned,
                "sweep finished"
            );
        }
        report
    }

    /// Closes every connection with `reason` and forgets all sessions.
    pub(crate) fn close_all(&self, reason: &str) -> usize {
        let mut closed = 0;
        for mut entry in self.sessions.iter_mut() {
            for conn in entry.value_mut().take_all() {
                conn.close(reason);
                closed += 1;
            }
        }
        self.sessions.clear();
        closed
    }

    fn discard_if_empty(&self, key: &SessionKey) {
        if self
            .sessions
            .remove_if(key, |_, session| session.is_empty())
            .is_some()
        {
            debug!(target = "live.registry", session = %key, "session discarded");
        }
    }
}

pub(crate) fn encode(event: SyncEvent) -> Option<Arc<str>> {
    let kind = event.kind();
    match Envelope::new(event).to_json() {
        Ok(json) => Some(Arc::from(json)),
        Err(err) => {
            warn!(target = "live.registry", kind, error = %err, "failed to encode event");
            None
        }
    }
}

/// Tells the session about a departure or handoff: `ACTIVE_TAB_CHANGED` when activity moved,
/// `TAB_STATUS_UPDATE` otherwise.
fn announce(
    key: &SessionKey,
    session: &mut Session,
    change: Option<ActiveTabChange>,
    now: Instant,
) {
    if session.is_empty() {
        return;
    }
    let event = match change {
        Some(change) => SyncEvent::ActiveTabChanged(change),
        None => SyncEvent::TabStatusUpdate(session.status()),
    };
    if let Some(payload) = encode(event) {
        let failed = session.deliver(&payload, now);
        settle_failures(key, session, failed, now);
    }
}

/// Removes connections whose write failed, re-running arbitration and re-announcing until a
/// round of announcements succeeds everywhere.
fn settle_failures(
    key: &SessionKey,
    session: &mut Session,
    mut failed: Vec<(String, SinkError)>,
    now: Instant,
) {
    while !failed.is_empty() {
        let mut change: Option<ActiveTabChange> = None;
        for (tab_id, err) in failed.drain(..) {
            let Some((conn, was_active)) = session.take(&tab_id) else {
                continue;
            };
            warn!(
                target = "live.registry",
                session = %key,
                tab_id = %tab_id,
                connection_id = conn.id,
                error = %err,
                "dropping connection after failed write"
            );
            drop(conn);
            if let Some(departure) = session.handle_departure(&tab_id, was_active) {
                change = Some(departure);
            }
        }
        if session.is_empty() {
            return;
        }
        let event = match change {
            Some(change) => SyncEvent::ActiveTabChanged(change),
            None => SyncEvent::TabStatusUpdate(session.status()),
        };
        if let Some(payload) = encode(event) {
            failed = session.deliver(&payload, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::ChannelSink;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Channel-backed sink that can be told to start failing.
    struct FlakySink {
        inner: ChannelSink,
        failing: Arc<AtomicBool>,
    }

    impl EventSink for FlakySink {
        fn send(&self, payload: Arc<str>) -> Result<(), SinkError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(SinkError::Closed);
            }
            self.inner.send(payload)
        }
    }

    struct Tab {
        rx: mpsc::Receiver<Arc<str>>,
        registration: Registration,
    }

    impl Tab {
        fn events(&mut self) -> Vec<SyncEvent> {
            let mut events = Vec::new();
            while let Ok(payload) = self.rx.try_recv() {
                events.push(Envelope::from_json(&payload).unwrap().event);
            }
            events
        }
    }

    fn registry() -> Registry {
        Registry::new(RegistrySettings::default())
    }

    fn connect(registry: &Registry, key: &SessionKey, tab: &str) -> Tab {
        connect_with(registry, key, tab, ConnectOptions::default())
    }

    fn connect_with(
        registry: &Registry,
        key: &SessionKey,
        tab: &str,
        options: ConnectOptions,
    ) -> Tab {
        let (sink, rx) = ChannelSink::channel(32);
        let registration = registry.add_connection(
            key,
            tab,
            Box::new(sink),
            ConnectionMetadata::default(),
            options,
        );
        Tab { rx, registration }
    }

    fn status(active: &str, total: usize) -> SyncEvent {
        SyncEvent::TabStatusUpdate(TabStatus {
            active_tab_id: Some(active.to_string()),
            total_tabs: total,
        })
    }

    fn assert_single_active(registry: &Registry, key: &SessionKey) {
        if let Some(view) = registry.view(key) {
            assert!(view.active_count() <= 1, "{view:?}");
            assert_eq!(view.active_count(), usize::from(view.active_tab_id.is_some()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn second_tab_joins_passive_and_everyone_sees_status() {
        let registry = registry();
        let game = SessionKey::game("G1");

        let mut a = connect(&registry, &game, "A1");
        assert_eq!(
            a.registration.admission,
            Admission::Active { preempted: None }
        );
        assert_eq!(a.events()[0], status("A1", 1));

        let mut b = connect(&registry, &game, "B1");
        assert_eq!(
            b.registration.admission,
            Admission::Passive {
                active_tab: "A1".into()
            }
        );
        assert_eq!(a.events(), vec![status("A1", 2)]);
        assert_eq!(
            b.events(),
            vec![
                status("A1", 2),
                SyncEvent::ConnectionStatus(ConnectionRole {
                    tab_id: "B1".into(),
                    is_active: false,
                    active_tab_id: Some("A1".into()),
                }),
            ]
        );
        assert!(registry.may_mutate(&game, "A1"));
        assert!(!registry.may_mutate(&game, "B1"));
        assert_single_active(&registry, &game);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_active_tab_hands_over_to_the_remaining_tab() {
        let registry = registry();
        let game = SessionKey::game("G1");
        let a = connect(&registry, &game, "A1");
        let mut b = connect(&registry, &game, "B1");
        b.events();

        assert!(registry.release(&game, "A1", a.registration.connection_id));
        assert_eq!(
            b.events(),
            vec![SyncEvent::ActiveTabChanged(ActiveTabChange {
                active_tab_id: Some("B1".into()),
                previous_tab_id: Some("A1".into()),
                total_tabs: 1,
            })]
        );
        assert!(registry.may_mutate(&game, "B1"));
        assert_single_active(&registry, &game);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_removes_only_the_broken_connection() {
        let registry = registry();
        let game = SessionKey::game("G1");
        let mut a = connect(&registry, &game, "A1");
        let mut b = connect(&registry, &game, "B1");

        let failing = Arc::new(AtomicBool::new(false));
        let (inner, _c_rx) = ChannelSink::channel(32);
        registry.add_connection(
            &game,
            "C1",
            Box::new(FlakySink {
                inner,
                failing: Arc::clone(&failing),
            }),
            ConnectionMetadata::default(),
            ConnectOptions::default(),
        );
        a.events();
        b.events();

        failing.store(true, Ordering::SeqCst);
        let applied = SyncEvent::MoveApplied(live_proto::MoveApplied {
            move_id: "m-1".into(),
            entity_id: "G1".into(),
            version: 1,
            action: serde_json::json!({ "from": 9, "to": 13 }),
            origin_tab_id: Some("A1".into()),
            user_id: None,
        });
        assert_eq!(registry.broadcast(&game, applied.clone()), 2);

        for tab in [&mut a, &mut b] {
            let events = tab.events();
            assert_eq!(events[0], applied);
            // C1 was passive, so the survivors only learn the new count.
            assert_eq!(events[1], status("A1", 2));
        }
        let view = registry.view(&game).unwrap();
        assert_eq!(view.tabs.len(), 2);
        assert!(view.tabs.iter().all(|tab| tab.tab_id != "C1"));
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_disappear_with_their_last_connection() {
        let registry = registry();
        let game = SessionKey::game("G1");
        connect(&registry, &game, "A1");
        connect(&registry, &game, "B1");
        assert_eq!(registry.session_count(), 1);

        assert!(registry.remove_connection(&game, "A1"));
        assert!(registry.remove_connection(&game, "B1"));
        assert_eq!(registry.session_count(), 0);
        assert!(registry.status(&game).is_none());

        // Removing twice, or removing something never added, changes nothing.
        assert!(!registry.remove_connection(&game, "B1"));
        assert!(!registry.remove_connection(&SessionKey::game("nope"), "X"));
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_removal_sends_connection_closed() {
        let registry = registry();
        let game = SessionKey::game("G1");
        let mut a = connect(&registry, &game, "A1");
        a.events();

        registry.remove_connection(&game, "A1");
        assert_eq!(a.events(), vec![SyncEvent::connection_closed("removed")]);
        assert!(a.rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn broadcasts_stay_inside_their_session() {
        let registry = registry();
        let g1 = SessionKey::game("G1");
        let g2 = SessionKey::game("G2");
        let inbox = SessionKey::notifications("G1");
        let mut in_g1 = connect(&registry, &g1, "A1");
        let mut in_g2 = connect(&registry, &g2, "A1");
        let mut in_inbox = connect(&registry, &inbox, "A1");
        in_g1.events();
        in_g2.events();
        in_inbox.events();

        assert_eq!(registry.broadcast(&g1, SyncEvent::Heartbeat), 1);
        assert_eq!(in_g1.events(), vec![SyncEvent::Heartbeat]);
        assert!(in_g2.events().is_empty());
        assert!(in_inbox.events().is_empty());
        assert_eq!(registry.broadcast(&SessionKey::game("G3"), SyncEvent::Heartbeat), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_active_tab_is_preempted_by_a_new_tab() {
        let registry = registry();
        let game = SessionKey::game("G1");
        let mut a = connect(&registry, &game, "A1");
        a.events();

        tokio::time::advance(Duration::from_secs(6)).await;
        let b = connect(&registry, &game, "B1");
        assert_eq!(
            b.registration.admission,
            Admission::Active {
                preempted: Some("A1".into())
            }
        );
        assert_eq!(a.events(), vec![status("B1", 2)]);
        assert!(!registry.may_mutate(&game, "A1"));
        assert_single_active(&registry, &game);
    }

    #[tokio::test(start_paused = true)]
    async fn same_tab_reconnect_replaces_the_old_stream() {
        let registry = registry();
        let game = SessionKey::game("G1");
        let mut first = connect(&registry, &game, "A1");
        first.events();

        let second = connect(&registry, &game, "A1");
        assert_eq!(second.registration.replaced, 1);
        assert_eq!(
            first.events(),
            vec![SyncEvent::connection_closed("replaced")]
        );

        // The old stream's cancellation must not remove its replacement.
        assert!(!registry.release(&game, "A1", first.registration.connection_id));
        assert_eq!(registry.status(&game).unwrap().total_tabs, 1);
        assert!(registry.release(&game, "A1", second.registration.connection_id));
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn single_client_mode_closes_every_other_tab() {
        let registry = registry();
        let inbox = SessionKey::notifications("alice");
        let single = ConnectOptions {
            enforce_single_client: true,
        };
        let mut old = connect_with(&registry, &inbox, "T1", single);
        old.events();

        let new = connect_with(&registry, &inbox, "T2", single);
        assert_eq!(new.registration.admission, Admission::Shared);
        assert_eq!(new.registration.replaced, 1);
        assert_eq!(old.events(), vec![SyncEvent::connection_closed("replaced")]);
        assert_eq!(registry.status(&inbox).unwrap().total_tabs, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_scopes_mark_every_tab_active() {
        let registry = registry();
        let inbox = SessionKey::notifications("alice");
        connect(&registry, &inbox, "T1");
        connect(&registry, &inbox, "T2");

        let view = registry.view(&inbox).unwrap();
        assert_eq!(view.active_tab_id, None);
        assert_eq!(view.active_count(), 2);
        assert!(registry.may_mutate(&inbox, "T1"));
        assert!(registry.may_mutate(&inbox, "T2"));
    }

    #[tokio::test(start_paused = true)]
    async fn activation_request_moves_activity_and_tells_everyone() {
        let registry = registry();
        let game = SessionKey::game("G1");
        let mut a = connect(&registry, &game, "A1");
        let mut b = connect(&registry, &game, "B1");
        a.events();
        b.events();

        let status = registry.request_activation(&game, "B1").unwrap();
        assert_eq!(status.active_tab_id.as_deref(), Some("B1"));
        let change = SyncEvent::ActiveTabChanged(ActiveTabChange {
            active_tab_id: Some("B1".into()),
            previous_tab_id: Some("A1".into()),
            total_tabs: 2,
        });
        assert_eq!(a.events(), vec![change.clone()]);
        assert_eq!(b.events(), vec![change]);

        // Already active: nothing to announce.
        registry.request_activation(&game, "B1").unwrap();
        assert!(a.events().is_empty());

        assert_eq!(
            registry.request_activation(&game, "Z9"),
            Err(RegistryError::UnknownTab {
                key: game.clone(),
                tab_id: "Z9".into()
            })
        );
        assert_eq!(
            registry.touch(&SessionKey::game("nope"), "A1"),
            Err(RegistryError::UnknownSession(SessionKey::game("nope")))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_prunes_silent_tabs_and_reassigns_activity() {
        let registry = registry();
        let game = SessionKey::game("G1");
        let mut a = connect(&registry, &game, "A1");
        let mut b = connect(&registry, &game, "B1");
        a.events();
        b.events();

        // B1 keeps heartbeating, A1 goes quiet.
        tokio::time::advance(Duration::from_secs(6)).await;
        registry.touch(&game, "B1").unwrap();
        let report = registry.sweep();
        assert_eq!(report, SweepReport { pruned: 0, reassigned: 1 });
        let handover = SyncEvent::ActiveTabChanged(ActiveTabChange {
            active_tab_id: Some("B1".into()),
            previous_tab_id: Some("A1".into()),
            total_tabs: 2,
        });
        assert_eq!(b.events(), vec![handover]);
        a.events();

        let prune_after = registry.settings().prune_after;
        tokio::time::advance(prune_after + Duration::from_secs(1)).await;
        registry.touch(&game, "B1").unwrap();
        let report = registry.sweep();
        assert_eq!(report.pruned, 1);
        assert_eq!(
            a.events(),
            vec![SyncEvent::connection_closed("heartbeat timeout")]
        );
        assert_eq!(b.events(), vec![status("B1", 1)]);
        assert_single_active(&registry, &game);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_keeps_a_stale_active_tab_without_a_fresh_candidate() {
        let registry = registry();
        let game = SessionKey::game("G1");
        connect(&registry, &game, "A1");
        connect(&registry, &game, "B1");

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(registry.sweep(), SweepReport::default());
        assert_eq!(registry.status(&game).unwrap().active_tab_id.as_deref(), Some("A1"));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_reaches_only_its_scope() {
        let registry = registry();
        let mut game_tab = connect(&registry, &SessionKey::game("G1"), "A1");
        let mut inbox_tab = connect(&registry, &SessionKey::notifications("alice"), "A1");
        game_tab.events();
        inbox_tab.events();

        assert_eq!(registry.heartbeat(Scope::Notifications), 1);
        assert!(game_tab.events().is_empty());
        assert_eq!(inbox_tab.events(), vec![SyncEvent::Heartbeat]);
    }

    #[tokio::test(start_paused = true)]
    async fn random_churn_keeps_one_active_tab_and_leaves_nothing_behind() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};
        use std::collections::HashMap;

        const TABS: [&str; 5] = ["A1", "B1", "C1", "D1", "E1"];

        for seed in 0..20u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let registry = registry();
            let game = SessionKey::game("G1");
            let mut open: HashMap<&str, Tab> = HashMap::new();

            for _ in 0..200 {
                let tab = TABS[rng.gen_range(0..TABS.len())];
                match rng.gen_range(0..6) {
                    0 | 1 => {
                        open.insert(tab, connect(&registry, &game, tab));
                    }
                    2 => {
                        if let Some(closed) = open.remove(tab) {
                            registry.release(&game, tab, closed.registration.connection_id);
                        }
                    }
                    3 => {
                        registry.remove_connection(&game, tab);
                        open.remove(tab);
                    }
                    4 => {
                        let _ = registry.touch(&game, tab);
                        let _ = registry.request_activation(&game, tab);
                    }
                    _ => {
                        let idle = Duration::from_millis(rng.gen_range(0..8_000));
                        tokio::time::advance(idle).await;
                        registry.sweep();
                    }
                }
                assert_single_active(&registry, &game);
                if let Some(view) = registry.view(&game) {
                    assert!(!view.tabs.is_empty(), "seed {seed}: empty session kept");
                }
                for tab in open.values_mut() {
                    tab.events();
                }
            }

            for (tab_id, tab) in open.drain() {
                registry.release(&game, tab_id, tab.registration.connection_id);
            }
            assert_eq!(registry.session_count(), 0, "seed {seed}");
            assert_eq!(registry.connection_count(), 0, "seed {seed}");
        }
    }
}
