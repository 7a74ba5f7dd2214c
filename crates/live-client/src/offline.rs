//! Moves made while the stream is down, replayed in order on reconnect.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use live_proto::{ConflictBody, MoveAccepted, MoveSubmission};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::http::MoveTransport;
use crate::reconciler::DEFAULT_UPDATE_TIMEOUT;
use crate::SubmitError;

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMove<A> {
    /// Local, strictly increasing.
    pub seq: u64,
    pub move_id: String,
    /// Version the move was computed against.
    pub expected_version: u64,
    pub action: A,
    pub enqueued_at: DateTime<Utc>,
}

/// Why replay stopped and will not resume on its own.
#[derive(Debug, Clone, PartialEq)]
pub enum Halt {
    /// The server moved on; entries from `move_id` onwards were computed for an older state.
    Conflict(Box<ConflictBody>),
    Rejected {
        move_id: String,
        status: u16,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DrainOutcome<A> {
    /// Every entry was accepted; the queue is empty.
    Completed,
    /// An entry was refused. It and every later entry stay queued.
    Halted { halt: Halt, remaining: Vec<QueuedMove<A>> },
    /// The network dropped mid-drain; the rest stays queued for the next reconnect.
    Interrupted { error: String, remaining: usize },
    /// A previous halt has not been resolved with `discard` or `rebase`.
    Blocked(Halt),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DrainReport<A> {
    /// Accepted entries, in submission order.
    pub accepted: Vec<(QueuedMove<A>, MoveAccepted)>,
    pub outcome: DrainOutcome<A>,
}

#[derive(Debug)]
pub struct OfflineQueue<A> {
    entries: VecDeque<QueuedMove<A>>,
    next_seq: u64,
    halt: Option<Halt>,
    last_sync_time: Option<DateTime<Utc>>,
    submit_timeout: Duration,
}

impl<A> Default for OfflineQueue<A> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
            next_seq: 1,
            halt: None,
            last_sync_time: None,
            submit_timeout: DEFAULT_UPDATE_TIMEOUT,
        }
    }
}

impl<A: Clone + Serialize> OfflineQueue<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A submission without an answer after `timeout` interrupts the drain.
    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = timeout;
        self
    }

    pub fn enqueue(&mut self, move_id: String, expected_version: u64, action: A) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        debug!(target = "live.offline", seq, move_id = %move_id, expected_version, "move queued");
        self.entries.push_back(QueuedMove {
            seq,
            move_id,
            expected_version,
            action,
            enqueued_at: Utc::now(),
        });
        seq
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &QueuedMove<A>> {
        self.entries.iter()
    }

    pub fn halt(&self) -> Option<&Halt> {
        self.halt.as_ref()
    }

    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        self.last_sync_time
    }

    /// Drops every entry and clears a halt.
    pub fn discard(&mut self) -> Vec<QueuedMove<A>> {
        self.halt = None;
        let dropped: Vec<QueuedMove<A>> = self.entries.drain(..).collect();
        info!(target = "live.offline", dropped = dropped.len(), "offline queue discarded");
        dropped
    }

    /// Re-targets the entries onto `version` (the first at `version`, the next at `version + 1`,
    /// ...) and clears a halt. The caller decides the entries still make sense.
    pub fn rebase(&mut self, version: u64) {
        for (offset, entry) in self.entries.iter_mut().enumerate() {
            entry.expected_version = version + offset as u64;
        }
        self.halt = None;
        info!(target = "live.offline", version, entries = self.entries.len(), "offline queue rebased");
    }

    /// Submits the entries front to back, stopping at the first refusal or transport failure.
    pub async fn drain<T>(&mut self, transport: &T, game_id: &str, tab_id: &str) -> DrainReport<A>
    where
        T: MoveTransport + ?Sized,
    {
        let mut accepted = Vec::new();
        if let Some(halt) = &self.halt {
            return DrainReport {
                accepted,
                outcome: DrainOutcome::Blocked(halt.clone()),
            };
        }

        while let Some(entry) = self.entries.front().cloned() {
            let action = match serde_json::to_value(&entry.action) {
                Ok(action) => action,
                Err(err) => {
                    let halt = Halt::Rejected {
                        move_id: entry.move_id.clone(),
                        status: 0,
                        message: format!("action could not be encoded: {err}"),
                    };
                    return self.halted(accepted, halt);
                }
            };
            let submission = MoveSubmission {
                move_id: entry.move_id.clone(),
                tab_id: tab_id.to_string(),
                expected_version: entry.expected_version,
                action,
            };
            let answer = tokio::time::timeout(
                self.submit_timeout,
                transport.submit_move(game_id, &submission),
            )
            .await
            .unwrap_or_else(|_| Err(SubmitError::timed_out(self.submit_timeout)));
            match answer {
                Ok(ack) => {
                    debug!(target = "live.offline", seq = entry.seq, version = ack.version, "queued move accepted");
                    self.entries.pop_front();
                    accepted.push((entry, ack));
                }
                Err(SubmitError::Conflict(body)) => {
                    return self.halted(accepted, Halt::Conflict(body));
                }
                Err(SubmitError::Rejected { status, message }) => {
                    let halt = Halt::Rejected {
                        move_id: entry.move_id,
                        status,
                        message,
                    };
                    return self.halted(accepted, halt);
                }
                Err(SubmitError::Unauthorized) => {
                    let halt = Halt::Rejected {
                        move_id: entry.move_id,
                        status: 401,
                        message: "not signed in".into(),
                    };
                    return self.halted(accepted, halt);
                }
                Err(SubmitError::Transport(error)) => {
                    warn!(target = "live.offline", error = %error, remaining = self.entries.len(), "drain interrupted");
                    return DrainReport {
                        accepted,
                        outcome: DrainOutcome::Interrupted {
                            error,
                            remaining: self.entries.len(),
                        },
                    };
                }
            }
        }

        self.last_sync_time = Some(Utc::now());
        info!(target = "live.offline", submitted = accepted.len(), "offline queue drained");
        DrainReport {
            accepted,
            outcome: DrainOutcome::Completed,
        }
    }

    fn halted(
        &mut self,
        accepted: Vec<(QueuedMove<A>, MoveAccepted)>,
        halt: Halt,
    ) -> DrainReport<A> {
        warn!(target = "live.offline", halt = ?halt, remaining = self.entries.len(), "drain halted");
        self.halt = Some(halt.clone());
        DrainReport {
            accepted,
            outcome: DrainOutcome::Halted {
                halt,
                remaining: self.entries.iter().cloned().collect(),
            },
        }
    }
}
