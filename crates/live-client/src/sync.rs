use std::time::Duration;

use live_proto::{
    generate_move_id, ConflictBody, EntitySnapshot, Envelope, MoveSubmission, SyncEvent,
};
use tracing::{debug, info, warn};

use crate::http::MoveTransport;
use crate::offline::{DrainOutcome, DrainReport, Halt, OfflineQueue, QueuedMove};
use crate::reconciler::{Reconciler, RemoteOutcome, DEFAULT_UPDATE_TIMEOUT};
use crate::{LocalState, SubmitError, SyncError};

/// What happened to a move passed to [`GameSync::play`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayOutcome {
    Confirmed { move_id: String, version: u64 },
    /// Held in the offline queue; the UI shows it as pending sync.
    Queued { move_id: String, position: usize },
}

/// One tab's view of one game: optimistic state, the offline queue and tab activity.
pub struct GameSync<S: LocalState, T: MoveTransport> {
    game_id: String,
    tab_id: String,
    transport: T,
    reconciler: Reconciler<S>,
    queue: OfflineQueue<S::Action>,
    version: u64,
    online: bool,
    active_tab: Option<String>,
    total_tabs: usize,
    submit_timeout: Duration,
}

impl<S: LocalState, T: MoveTransport> GameSync<S, T> {
    pub fn new(game_id: impl Into<String>, tab_id: impl Into<String>, state: S, transport: T) -> Self {
        Self {
            game_id: game_id.into(),
            tab_id: tab_id.into(),
            transport,
            reconciler: Reconciler::new(state),
            queue: OfflineQueue::new(),
            version: 0,
            online: false,
            active_tab: None,
            total_tabs: 0,
            submit_timeout: DEFAULT_UPDATE_TIMEOUT,
        }
    }

    /// How long a submission may go unanswered before the move is queued and the client
    /// treats itself as offline. Applies to queue replay too.
    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = timeout;
        self.queue = std::mem::take(&mut self.queue).with_submit_timeout(timeout);
        self
    }

    pub fn with_reconciler(mut self, reconciler: Reconciler<S>) -> Self {
        self.reconciler = reconciler;
        self
    }

    pub fn game_id(&self) -> &str {
        &self.game_id
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    pub fn state(&self) -> &S {
        self.reconciler.state()
    }

    /// Latest authoritative version seen.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn total_tabs(&self) -> usize {
        self.total_tabs
    }

    /// True unless the relay named another tab as active.
    pub fn is_active_tab(&self) -> bool {
        self.active_tab
            .as_deref()
            .map_or(true, |active| active == self.tab_id)
    }

    pub fn reconciler(&self) -> &Reconciler<S> {
        &self.reconciler
    }

    pub fn reconciler_mut(&mut self) -> &mut Reconciler<S> {
        &mut self.reconciler
    }

    pub fn queue(&self) -> &OfflineQueue<S::Action> {
        &self.queue
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Applies `action` optimistically, then submits it or, while offline, queues it.
    /// A transport failure flips the client offline and queues the move instead of failing.
    pub async fn play(&mut self, action: S::Action) -> Result<PlayOutcome, SyncError> {
        if !self.is_active_tab() {
            return Err(SyncError::PassiveTab(self.tab_id.clone()));
        }
        if self.queue.halt().is_some() {
            return Err(SyncError::QueueHalted);
        }
        let move_id = generate_move_id();
        let payload = serde_json::to_value(&action)?;
        self.reconciler
            .create_update_with_id(move_id.clone(), action.clone());

        if !self.online || !self.queue.is_empty() {
            return Ok(self.enqueue(move_id, action));
        }

        let submission = MoveSubmission {
            move_id: move_id.clone(),
            tab_id: self.tab_id.clone(),
            expected_version: self.version,
            action: payload,
        };
        let answer = tokio::time::timeout(
            self.submit_timeout,
            self.transport.submit_move(&self.game_id, &submission),
        )
        .await
        .unwrap_or_else(|_| Err(SubmitError::timed_out(self.submit_timeout)));
        match answer {
            Ok(accepted) => {
                self.settle_accepted(&move_id, accepted.version, accepted.duplicate);
                Ok(PlayOutcome::Confirmed {
                    move_id,
                    version: accepted.version,
                })
            }
            Err(SubmitError::Transport(error)) => {
                warn!(target = "live.sync", move_id = %move_id, error = %error, "submit failed, going offline");
                self.online = false;
                Ok(self.enqueue(move_id, action))
            }
            Err(SubmitError::Conflict(body)) => {
                self.reconciler.reject_update(&move_id, "version conflict");
                self.adopt(&body.current)?;
                Err(SyncError::Submit(SubmitError::Conflict(body)))
            }
            Err(err) => {
                self.reconciler.reject_update(&move_id, &err.to_string());
                Err(SyncError::Submit(err))
            }
        }
    }

    /// Folds one relay event into local state.
    pub fn handle_event(&mut self, envelope: &Envelope) -> Result<(), SyncError> {
        match &envelope.event {
            SyncEvent::InitialState(snapshot) => {
                if snapshot.entity_id != self.game_id {
                    return Ok(());
                }
                let state: S = serde_json::from_value(snapshot.state.clone())?;
                self.version = snapshot.version;
                self.reconciler.replace_base(state);
                debug!(target = "live.sync", version = self.version, "initial state adopted");
            }
            SyncEvent::TabStatusUpdate(status) => {
                self.active_tab = status.active_tab_id.clone();
                self.total_tabs = status.total_tabs;
            }
            SyncEvent::ActiveTabChanged(change) => {
                self.active_tab = change.active_tab_id.clone();
                self.total_tabs = change.total_tabs;
            }
            SyncEvent::ConnectionStatus(role) => {
                self.active_tab = role.active_tab_id.clone();
            }
            SyncEvent::MoveApplied(applied) => {
                if applied.entity_id != self.game_id {
                    return Ok(());
                }
                if applied.version <= self.version {
                    // Already part of an adopted snapshot.
                    if self.reconciler.is_pending(&applied.move_id) {
                        self.reconciler.confirm_included(&applied.move_id);
                    } else {
                        debug!(
                            target = "live.sync",
                            move_id = %applied.move_id,
                            version = applied.version,
                            "move already included"
                        );
                    }
                    return Ok(());
                }
                let action: S::Action = serde_json::from_value(applied.action.clone())?;
                let outcome = self
                    .reconciler
                    .apply_remote(Some(&applied.move_id), &action);
                if outcome == RemoteOutcome::Applied && applied.version > self.version + 1 {
                    warn!(
                        target = "live.sync",
                        seen = self.version,
                        applied = applied.version,
                        "missed moves; state may be behind until the next snapshot"
                    );
                }
                self.version = self.version.max(applied.version);
            }
            SyncEvent::ConnectionClosed { reason } => {
                debug!(target = "live.sync", reason = %reason, "stream closed by relay");
                self.online = false;
            }
            SyncEvent::Error { message } => {
                warn!(target = "live.sync", message = %message, "relay reported an error");
            }
            SyncEvent::Heartbeat
            | SyncEvent::NotificationCreated(_)
            | SyncEvent::ConnectionEstablished { .. } => {}
        }
        Ok(())
    }

    /// Explicit connectivity signal. Going online does not drain the queue; call [`resync`].
    ///
    /// [`resync`]: GameSync::resync
    pub fn set_online(&mut self, online: bool) {
        if self.online != online {
            info!(target = "live.sync", online, queued = self.queue.len(), "connectivity changed");
        }
        self.online = online;
    }

    /// Replays the offline queue in order. Accepted moves are confirmed; on a conflict the
    /// authoritative state is adopted, the queued moves' optimistic effects are rolled back and
    /// the moves stay queued until [`discard_queue`] or [`rebase_queue`].
    ///
    /// [`discard_queue`]: GameSync::discard_queue
    /// [`rebase_queue`]: GameSync::rebase_queue
    pub async fn resync(&mut self) -> Result<DrainReport<S::Action>, SyncError> {
        if !self.online {
            return Err(SyncError::Offline);
        }
        let report = self
            .queue
            .drain(&self.transport, &self.game_id, &self.tab_id)
            .await;

        for (entry, accepted) in &report.accepted {
            self.settle_accepted(&entry.move_id, accepted.version, accepted.duplicate);
        }
        match &report.outcome {
            DrainOutcome::Completed => {}
            DrainOutcome::Interrupted { .. } => self.online = false,
            DrainOutcome::Halted { halt, remaining } => {
                for entry in remaining {
                    self.reconciler
                        .reject_update(&entry.move_id, "held for review after a conflict");
                }
                if let Halt::Conflict(body) = halt {
                    self.adopt(&body.current)?;
                }
            }
            DrainOutcome::Blocked(_) => return Err(SyncError::QueueHalted),
        }
        Ok(report)
    }

    /// Drops every queued move.
    pub fn discard_queue(&mut self) -> Vec<QueuedMove<S::Action>> {
        let dropped = self.queue.discard();
        for entry in &dropped {
            self.reconciler.reject_update(&entry.move_id, "discarded");
        }
        dropped
    }

    /// Keeps the queued moves, re-targets them at the current authoritative version and shows
    /// them optimistically again. The next [`resync`](GameSync::resync) submits them.
    pub fn rebase_queue(&mut self) {
        self.queue.rebase(self.version);
        let entries: Vec<(String, S::Action)> = self
            .queue
            .entries()
            .map(|entry| (entry.move_id.clone(), entry.action.clone()))
            .collect();
        for (move_id, action) in entries {
            if !self.reconciler.is_pending(&move_id) {
                self.reconciler.create_update_with_id(move_id, action);
            }
        }
    }

    /// Conflict bodies and halts carry the authoritative snapshot; this adopts it.
    pub fn adopt_conflict(&mut self, conflict: &ConflictBody) -> Result<(), SyncError> {
        self.adopt(&conflict.current)
    }

    fn adopt(&mut self, snapshot: &EntitySnapshot) -> Result<(), SyncError> {
        let state: S = serde_json::from_value(snapshot.state.clone())?;
        self.version = snapshot.version;
        self.reconciler.replace_base(state);
        info!(target = "live.sync", version = self.version, "authoritative state adopted");
        Ok(())
    }

    fn enqueue(&mut self, move_id: String, action: S::Action) -> PlayOutcome {
        let expected = self.version + self.queue.len() as u64;
        self.queue.enqueue(move_id.clone(), expected, action);
        PlayOutcome::Queued {
            move_id,
            position: self.queue.len(),
        }
    }

    fn settle_accepted(&mut self, move_id: &str, version: u64, duplicate: bool) {
        // A duplicate at or below the adopted version is already part of the base state.
        if duplicate && version <= self.version {
            self.reconciler.confirm_included(move_id);
        } else {
            self.reconciler.confirm_update(move_id);
        }
        self.version = self.version.max(version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{conflict, ScriptedTransport, Trail};
    use live_proto::{ActiveTabChange, MoveAccepted, MoveApplied, TabStatus};
    use serde_json::json;

    fn accepted(move_id: &str, version: u64) -> Result<MoveAccepted, SubmitError> {
        Ok(MoveAccepted {
            move_id: move_id.into(),
            version,
            duplicate: false,
        })
    }

    fn game(responses: Vec<Result<MoveAccepted, SubmitError>>) -> GameSync<Trail, ScriptedTransport> {
        let mut sync = GameSync::new("G1", "A1", Trail::default(), ScriptedTransport::new(responses));
        sync.set_online(true);
        sync
    }

    fn envelope(event: SyncEvent) -> Envelope {
        Envelope::new(event)
    }

    #[tokio::test]
    async fn online_move_is_confirmed_and_echo_is_not_reapplied() {
        let mut sync = game(vec![accepted("ignored", 1)]);
        let outcome = sync.play("a".into()).await.unwrap();
        let PlayOutcome::Confirmed { move_id, version } = outcome else {
            panic!("expected confirmation, got {outcome:?}");
        };
        assert_eq!(version, 1);
        assert_eq!(sync.state().steps, vec!["a"]);

        sync.handle_event(&envelope(SyncEvent::MoveApplied(MoveApplied {
            move_id,
            entity_id: "G1".into(),
            version: 1,
            action: json!("a"),
            origin_tab_id: Some("A1".into()),
            user_id: None,
        })))
        .unwrap();
        assert_eq!(sync.state().steps, vec!["a"]);
        assert_eq!(sync.version(), 1);
        assert_eq!(sync.reconciler().pending_count(), 0);
    }

    #[tokio::test]
    async fn remote_moves_from_other_tabs_apply_directly() {
        let mut sync = game(vec![]);
        sync.handle_event(&envelope(SyncEvent::MoveApplied(MoveApplied {
            move_id: "opt-elsewhere".into(),
            entity_id: "G1".into(),
            version: 1,
            action: json!("theirs"),
            origin_tab_id: Some("B1".into()),
            user_id: None,
        })))
        .unwrap();
        assert_eq!(sync.state().steps, vec!["theirs"]);
        assert_eq!(sync.version(), 1);
    }

    #[tokio::test]
    async fn conflict_rolls_back_and_adopts_the_server_state() {
        let mut sync = game(vec![Err(SubmitError::Conflict(Box::new(conflict("x", 0, 3))))]);
        let err = sync.play("a".into()).await.unwrap_err();
        assert!(matches!(err, SyncError::Submit(SubmitError::Conflict(_))));
        assert_eq!(sync.version(), 3);
        assert_eq!(sync.state().steps, vec!["s1", "s2", "s3"]);
        assert_eq!(sync.reconciler().pending_count(), 0);
    }

    #[tokio::test]
    async fn passive_tab_cannot_play() {
        let mut sync = game(vec![]);
        sync.handle_event(&envelope(SyncEvent::TabStatusUpdate(TabStatus {
            active_tab_id: Some("B1".into()),
            total_tabs: 2,
        })))
        .unwrap();
        assert!(!sync.is_active_tab());
        assert!(matches!(
            sync.play("a".into()).await,
            Err(SyncError::PassiveTab(tab)) if tab == "A1"
        ));

        sync.handle_event(&envelope(SyncEvent::ActiveTabChanged(ActiveTabChange {
            active_tab_id: Some("A1".into()),
            previous_tab_id: Some("B1".into()),
            total_tabs: 1,
        })))
        .unwrap();
        assert!(sync.is_active_tab());
        assert_eq!(sync.total_tabs(), 1);
    }

    #[tokio::test]
    async fn offline_moves_replay_in_order_and_a_conflict_keeps_the_rest() {
        // M1 is accepted, M2 hits a version conflict.
        let mut sync = game(vec![
            Err(SubmitError::Transport("network down".into())),
            accepted("m1", 1),
            Err(SubmitError::Conflict(Box::new(conflict("m2", 1, 2)))),
        ]);

        let first = sync.play("m1".into()).await.unwrap();
        assert!(matches!(first, PlayOutcome::Queued { position: 1, .. }));
        assert!(!sync.is_online());
        let second = sync.play("m2".into()).await.unwrap();
        assert!(matches!(second, PlayOutcome::Queued { position: 2, .. }));
        assert_eq!(sync.state().steps, vec!["m1", "m2"]);

        sync.set_online(true);
        let report = sync.resync().await.unwrap();
        assert_eq!(report.accepted.len(), 1);
        let DrainOutcome::Halted { remaining, .. } = &report.outcome else {
            panic!("expected a halt, got {:?}", report.outcome);
        };
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].action, "m2");

        // M1 went first, with the version it was queued against; M2 was submitted after it.
        let sent = sync.transport().submitted();
        let order: Vec<(String, u64)> = sent
            .iter()
            .skip(1)
            .map(|s| (s.action.as_str().unwrap_or_default().to_string(), s.expected_version))
            .collect();
        assert_eq!(order, vec![("m1".to_string(), 0), ("m2".to_string(), 1)]);

        // M2 is still there for the user to decide on, not dropped.
        assert_eq!(sync.queue().len(), 1);
        assert!(sync.queue().halt().is_some());
        assert_eq!(sync.state().steps, vec!["s1", "s2"]);
        assert!(matches!(sync.play("m3".into()).await, Err(SyncError::QueueHalted)));
    }

    #[tokio::test]
    async fn rebased_queue_is_shown_again_and_resubmitted() {
        let mut sync = game(vec![
            Err(SubmitError::Conflict(Box::new(conflict("m2", 0, 2)))),
            accepted("m2", 3),
        ]);
        sync.set_online(false);
        sync.play("m2".into()).await.unwrap();
        sync.set_online(true);
        sync.resync().await.unwrap();
        assert_eq!(sync.state().steps, vec!["s1", "s2"]);

        sync.rebase_queue();
        assert_eq!(sync.state().steps, vec!["s1", "s2", "m2"]);
        assert_eq!(sync.queue().entries().next().unwrap().expected_version, 2);

        let report = sync.resync().await.unwrap();
        assert_eq!(report.outcome, DrainOutcome::Completed);
        assert_eq!(sync.version(), 3);
        assert_eq!(sync.state().steps, vec!["s1", "s2", "m2"]);
        assert!(sync.queue().last_sync_time().is_some());
    }

    #[tokio::test]
    async fn discarding_the_queue_drops_the_optimistic_moves() {
        let mut sync = game(vec![]);
        sync.set_online(false);
        sync.play("a".into()).await.unwrap();
        sync.play("b".into()).await.unwrap();

        let dropped = sync.discard_queue();
        assert_eq!(dropped.len(), 2);
        assert!(sync.state().steps.is_empty());
        assert!(matches!(sync.resync().await, Err(SyncError::Offline)));
    }

    #[tokio::test]
    async fn initial_state_keeps_queued_moves_on_top() {
        let mut sync = game(vec![]);
        sync.set_online(false);
        sync.play("mine".into()).await.unwrap();

        sync.handle_event(&envelope(SyncEvent::InitialState(EntitySnapshot {
            entity_id: "G1".into(),
            version: 4,
            state: json!({ "steps": ["server"] }),
        })))
        .unwrap();
        assert_eq!(sync.version(), 4);
        assert_eq!(sync.state().steps, vec!["server", "mine"]);
    }

    fn remote(move_id: &str, version: u64, step: &str) -> Envelope {
        envelope(SyncEvent::MoveApplied(MoveApplied {
            move_id: move_id.into(),
            entity_id: "G1".into(),
            version,
            action: json!(step),
            origin_tab_id: Some("B1".into()),
            user_id: None,
        }))
    }

    #[tokio::test]
    async fn moves_already_in_an_adopted_snapshot_are_not_applied_again() {
        let mut sync = game(vec![Err(SubmitError::Conflict(Box::new(conflict("x", 0, 2))))]);
        assert!(sync.play("a".into()).await.is_err());
        assert_eq!(sync.state().steps, vec!["s1", "s2"]);

        // Stream events for the moves the snapshot already holds arrive late.
        sync.handle_event(&remote("opt-s1", 1, "s1")).unwrap();
        sync.handle_event(&remote("opt-s2", 2, "s2")).unwrap();
        assert_eq!(sync.state().steps, vec!["s1", "s2"]);
        assert_eq!(sync.version(), 2);

        sync.handle_event(&remote("opt-s3", 3, "s3")).unwrap();
        assert_eq!(sync.state().steps, vec!["s1", "s2", "s3"]);
        assert_eq!(sync.version(), 3);
    }

    #[tokio::test]
    async fn echo_after_initial_state_settles_a_queued_move_without_duplicating_it() {
        let mut sync = game(vec![]);
        sync.set_online(false);
        let PlayOutcome::Queued { move_id, .. } = sync.play("mine".into()).await.unwrap() else {
            panic!("expected the move to be queued");
        };

        // The server had the move after all; the snapshot includes it.
        sync.handle_event(&envelope(SyncEvent::InitialState(EntitySnapshot {
            entity_id: "G1".into(),
            version: 1,
            state: json!({ "steps": ["mine"] }),
        })))
        .unwrap();
        sync.handle_event(&remote(&move_id, 1, "mine")).unwrap();
        assert_eq!(sync.state().steps, vec!["mine"]);
        assert!(!sync.reconciler().is_pending(&move_id));
    }

    /// Accepts submissions and never answers.
    struct Stalled;

    #[async_trait::async_trait]
    impl MoveTransport for Stalled {
        async fn submit_move(
            &self,
            _game_id: &str,
            _submission: &MoveSubmission,
        ) -> Result<MoveAccepted, SubmitError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_submissions_fall_back_to_the_queue() {
        let mut sync = GameSync::new("G1", "A1", Trail::default(), Stalled)
            .with_submit_timeout(Duration::from_secs(3));
        sync.set_online(true);

        let outcome = sync.play("a".into()).await.unwrap();
        assert!(matches!(outcome, PlayOutcome::Queued { position: 1, .. }));
        assert!(!sync.is_online());
        assert_eq!(sync.state().steps, vec!["a"]);

        sync.set_online(true);
        let report = sync.resync().await.unwrap();
        assert!(matches!(
            report.outcome,
            DrainOutcome::Interrupted { remaining: 1, .. }
        ));
        assert!(!sync.is_online());
        assert_eq!(sync.queue().len(), 1);
    }
}
