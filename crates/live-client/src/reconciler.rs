//! Optimistic updates.
//!
//! The reconciler keeps the last state it believes the server holds (`base`) and the actions
//! this client applied locally but the server has not confirmed yet. The visible state is
//! always `base` with every pending action replayed on top, so a rejection removes exactly the
//! rejected action and keeps the effect of later pending ones.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use live_proto::generate_move_id;
use tokio::time::Instant;
use tracing::debug;

use crate::LocalState;

/// Resolved ids remembered so a late confirmation or echo is recognised.
pub const RESOLVED_RETENTION: usize = 256;
pub const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct PendingUpdate<S: LocalState> {
    pub id: String,
    pub action: S::Action,
    /// Visible state just before this action was applied.
    pub snapshot: S,
    pub created_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Confirmed,
    Rejected,
}

/// Result of confirming or rejecting an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled {
    /// The id was pending and is now resolved.
    Resolved,
    /// Already resolved earlier; nothing changed.
    AlreadyResolved(Resolution),
    Unknown,
}

#[derive(Debug, Clone)]
pub struct Rejection<S> {
    pub id: String,
    pub reason: String,
    /// Visible state after the rollback.
    pub state: S,
}

/// How an authoritative move was taken in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// It was one of ours and is now confirmed.
    Confirmed,
    /// It was ours and had already been confirmed.
    Duplicate,
    /// Another tab or player made it.
    Applied,
}

pub struct Reconciler<S: LocalState> {
    base: S,
    visible: S,
    pending: VecDeque<PendingUpdate<S>>,
    resolved: HashMap<String, Resolution>,
    resolved_order: VecDeque<String>,
    timeout: Duration,
}

impl<S: LocalState> Reconciler<S> {
    pub fn new(state: S) -> Self {
        Self::with_timeout(state, DEFAULT_UPDATE_TIMEOUT)
    }

    pub fn with_timeout(state: S, timeout: Duration) -> Self {
        Self {
            base: state.clone(),
            visible: state,
            pending: VecDeque::new(),
            resolved: HashMap::new(),
            resolved_order: VecDeque::new(),
            timeout,
        }
    }

    pub fn state(&self) -> &S {
        &self.visible
    }

    /// Last state known to be authoritative, without pending actions.
    pub fn base(&self) -> &S {
        &self.base
    }

    /// Unresolved updates, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = &PendingUpdate<S>> {
        self.pending.iter()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.iter().any(|update| update.id == id)
    }

    pub fn resolution(&self, id: &str) -> Option<Resolution> {
        self.resolved.get(id).copied()
    }

    /// Applies `action` locally under a fresh id and returns the id with the new state.
    pub fn create_update(&mut self, action: S::Action) -> (String, S) {
        let id = generate_move_id();
        let state = self.create_update_with_id(id.clone(), action);
        (id, state)
    }

    pub fn create_update_with_id(&mut self, id: String, action: S::Action) -> S {
        let snapshot = self.visible.clone();
        self.visible.apply(&action);
        debug!(target = "live.reconciler", id = %id, pending = self.pending.len() + 1, "optimistic update");
        self.pending.push_back(PendingUpdate {
            id,
            action,
            snapshot,
            created_at: Instant::now(),
        });
        self.visible.clone()
    }

    /// The server accepted `id`: its action becomes part of the base state.
    pub fn confirm_update(&mut self, id: &str) -> Settled {
        self.settle_confirmed(id, true)
    }

    /// The server accepted `id` and the base state already includes it (a snapshot newer than
    /// the move was adopted meanwhile).
    pub fn confirm_included(&mut self, id: &str) -> Settled {
        self.settle_confirmed(id, false)
    }

    fn settle_confirmed(&mut self, id: &str, fold: bool) -> Settled {
        let Some(index) = self.pending.iter().position(|update| update.id == id) else {
            return self.already(id);
        };
        let Some(update) = self.pending.remove(index) else {
            return Settled::Unknown;
        };
        if fold {
            self.base.apply(&update.action);
        }
        self.remember(update.id, Resolution::Confirmed);
        self.rebuild();
        Settled::Resolved
    }

    /// Rolls back `id` and re-applies every other pending action on top of the base.
    pub fn reject_update(&mut self, id: &str, reason: &str) -> Option<Rejection<S>> {
        let index = self.pending.iter().position(|update| update.id == id)?;
        let update = self.pending.remove(index)?;
        debug!(target = "live.reconciler", id = %id, reason, "optimistic update rolled back");
        self.remember(update.id.clone(), Resolution::Rejected);
        self.rebuild();
        Some(Rejection {
            id: update.id,
            reason: reason.to_string(),
            state: self.visible.clone(),
        })
    }

    /// Rejects every update older than the timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<Rejection<S>> {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|update| now.saturating_duration_since(update.created_at) >= self.timeout)
            .map(|update| update.id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|id| self.reject_update(id, "timed out waiting for confirmation"))
            .collect()
    }

    /// Takes in an authoritative move. Ours are confirmed; anything else is applied to the base.
    pub fn apply_remote(&mut self, id: Option<&str>, action: &S::Action) -> RemoteOutcome {
        if let Some(id) = id {
            if self.is_pending(id) {
                self.confirm_update(id);
                return RemoteOutcome::Confirmed;
            }
            if self.resolved.get(id) == Some(&Resolution::Confirmed) {
                return RemoteOutcome::Duplicate;
            }
        }
        self.base.apply(action);
        self.rebuild();
        RemoteOutcome::Applied
    }

    /// Adopts an authoritative state and keeps pending actions on top of it.
    pub fn replace_base(&mut self, state: S) {
        self.base = state;
        self.rebuild();
    }

    /// Adopts an authoritative state and drops every pending action.
    pub fn reset(&mut self, state: S) -> Vec<PendingUpdate<S>> {
        let dropped: Vec<PendingUpdate<S>> = self.pending.drain(..).collect();
        for update in &dropped {
            self.remember(update.id.clone(), Resolution::Rejected);
        }
        self.base = state.clone();
        self.visible = state;
        dropped
    }

    fn rebuild(&mut self) {
        let mut state = self.base.clone();
        for update in self.pending.iter_mut() {
            update.snapshot = state.clone();
            state.apply(&update.action);
        }
        self.visible = state;
    }

    fn already(&self, id: &str) -> Settled {
        match self.resolved.get(id) {
            Some(resolution) => Settled::AlreadyResolved(*resolution),
            None => Settled::Unknown,
        }
    }

    fn remember(&mut self, id: String, resolution: Resolution) {
        if self.resolved.insert(id.clone(), resolution).is_none() {
            self.resolved_order.push_back(id);
        }
        while self.resolved_order.len() > RESOLVED_RETENTION {
            if let Some(oldest) = self.resolved_order.pop_front() {
                self.resolved.remove(&oldest);
            }
        }
    }
}
