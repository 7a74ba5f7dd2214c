use std::sync::Arc;

use live_proto::{MoveApplied, NotificationRecord, Scope, SessionKey, SyncEvent};
use tracing::debug;

use crate::registry::Registry;

/// Pushes domain events to every session they concern. Callers publish only after the
/// mutation that produced the event has committed.
#[derive(Clone)]
pub struct Fanout {
    registry: Arc<Registry>,
}

impl Fanout {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Sends one event to several sessions. Returns the total number of tabs reached.
    pub fn publish(&self, targets: &[SessionKey], event: &SyncEvent) -> usize {
        let delivered = targets
            .iter()
            .map(|key| self.registry.broadcast(key, event.clone()))
            .sum();
        debug!(
            target = "live.fanout",
            kind = event.kind(),
            sessions = targets.len(),
            delivered,
            "published"
        );
        delivered
    }

    pub fn move_applied(&self, applied: MoveApplied) -> usize {
        let key = SessionKey::game(applied.entity_id.clone());
        self.publish(&[key], &SyncEvent::MoveApplied(applied))
    }

    /// Delivers to the recipient's session in `scope` (`notifications` or `messages`).
    pub fn notification_created(&self, scope: Scope, record: NotificationRecord) -> usize {
        let key = SessionKey::new(scope, record.recipient_id.clone());
        self.publish(&[key], &SyncEvent::NotificationCreated(record))
    }

    /// One domain action, several recipients: each record goes to its own recipient.
    pub fn notify_all(&self, scope: Scope, records: Vec<NotificationRecord>) -> usize {
        records
            .into_iter()
            .map(|record| self.notification_created(scope, record))
            .sum()
    }
}
