//! Single-active-tab arbitration.
//!
//! For scopes that enforce it, a session is either in `NO_ACTIVE_TAB` (`active_tab == None`)
//! or `ONE_ACTIVE_TAB(tab)`. Every transition goes through the methods below so that
//! `active_tab` and the per-connection `is_active` flags never disagree. Broadcast scopes
//! mark every tab active and never set `active_tab`.

use std::time::Duration;

use live_proto::ActiveTabChange;
use tokio::time::Instant;

use crate::session::{Connection, Session};

/// Outcome of admitting a new connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The new tab is active. `preempted` names the stale tab it displaced.
    Active { preempted: Option<String> },
    /// Another tab holds activity and is still fresh.
    Passive { active_tab: String },
    /// Broadcast scope: every tab is equal.
    Shared,
}

impl Admission {
    pub fn is_active(&self) -> bool {
        !matches!(self, Admission::Passive { .. })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ActivationError {
    UnknownTab,
}

impl Session {
    pub(crate) fn admit(
        &mut self,
        mut conn: Connection,
        now: Instant,
        stale_after: Duration,
    ) -> Admission {
        let tab_id = conn.tab_id.clone();
        if !self.single_active {
            conn.is_active = true;
            self.connections.insert(tab_id, conn);
            return Admission::Shared;
        }

        let admission = match self.active_tab.clone() {
            None => Admission::Active { preempted: None },
            Some(active) => {
                let stale = self
                    .connections
                    .get(&active)
                    .map_or(true, |current| {
                        now.saturating_duration_since(current.last_seen) > stale_after
                    });
                if stale {
                    Admission::Active {
                        preempted: Some(active),
                    }
                } else {
                    Admission::Passive { active_tab: active }
                }
            }
        };

        self.connections.insert(tab_id.clone(), conn);
        if admission.is_active() {
            self.promote(&tab_id);
        }
        admission
    }

    /// Runs after `tab_id` left the session. Picks a successor when the active tab left.
    pub(crate) fn handle_departure(
        &mut self,
        tab_id: &str,
        was_active: bool,
    ) -> Option<ActiveTabChange> {
        if !self.single_active || !was_active {
            return None;
        }
        let next = self.next_candidate();
        if let Some(next) = next.as_deref() {
            self.promote(next);
        }
        Some(ActiveTabChange {
            active_tab_id: next,
            previous_tab_id: Some(tab_id.to_string()),
            total_tabs: self.connections.len(),
        })
    }

    /// Explicit takeover by a passive tab. `Ok(None)` when nothing changes.
    pub(crate) fn activate(
        &mut self,
        tab_id: &str,
    ) -> Result<Option<ActiveTabChange>, ActivationError> {
        if !self.connections.contains_key(tab_id) {
            return Err(ActivationError::UnknownTab);
        }
        if !self.single_active || self.active_tab.as_deref() == Some(tab_id) {
            return Ok(None);
        }
        let previous = self.active_tab.clone();
        self.promote(tab_id);
        Ok(Some(ActiveTabChange {
            active_tab_id: Some(tab_id.to_string()),
            previous_tab_id: previous,
            total_tabs: self.connections.len(),
        }))
    }

    /// Hands activity to the freshest other tab when the active one stopped heartbeating.
    /// Without a fresh candidate the stale tab keeps activity.
    pub(crate) fn reassign_if_stale(
        &mut self,
        now: Instant,
        stale_after: Duration,
    ) -> Option<ActiveTabChange> {
        if !self.single_active {
            return None;
        }
        let active = self.active_tab.clone()?;
        let active_age = self
            .connections
            .get(&active)
            .map(|conn| now.saturating_duration_since(conn.last_seen))?;
        if active_age <= stale_after {
            return None;
        }
        let candidate = self
            .connections
            .values()
            .filter(|conn| conn.tab_id != active)
            .filter(|conn| now.saturating_duration_since(conn.last_seen) <= stale_after)
            .max_by(|a, b| {
                a.last_seen
                    .cmp(&b.last_seen)
                    .then_with(|| b.tab_id.cmp(&a.tab_id))
            })
            .map(|conn| conn.tab_id.clone())?;
        self.promote(&candidate);
        Some(ActiveTabChange {
            active_tab_id: Some(candidate),
            previous_tab_id: Some(active),
            total_tabs: self.connections.len(),
        })
    }

    /// Whether `tab_id` may issue mutations for this entity.
    pub(crate) fn may_mutate(&self, tab_id: &str) -> bool {
        if !self.single_active {
            return true;
        }
        match self.active_tab.as_deref() {
            None => true,
            Some(active) => active == tab_id,
        }
    }

    fn next_candidate(&self) -> Option<String> {
        self.connections
            .values()
            .max_by(|a, b| {
                a.last_seen
                    .cmp(&b.last_seen)
                    .then_with(|| b.tab_id.cmp(&a.tab_id))
            })
            .map(|conn| conn.tab_id.clone())
    }

    fn promote(&mut self, tab_id: &str) {
        for conn in self.connections.values_mut() {
            conn.is_active = conn.tab_id == tab_id;
        }
        self.active_tab = Some(tab_id.to_string());
    }
}
