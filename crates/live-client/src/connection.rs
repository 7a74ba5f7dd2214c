use std::fmt;
use std::time::Duration;

use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting { attempt: u32 },
    Connected,
    Reconnecting { attempt: u32, delay: Duration },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting { attempt } => write!(f, "connecting (attempt {attempt})"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Reconnecting { attempt, delay } => {
                write!(f, "reconnecting (attempt {attempt} in {delay:?})")
            }
        }
    }
}

/// Exponential reconnect delays.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: u32,
    pub max: Duration,
    /// Give up after this many consecutive failures.
    pub max_attempts: Option<u32>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            factor: 2,
            max: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl Backoff {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.factor
            .checked_pow(exponent)
            .and_then(|multiplier| self.initial.checked_mul(multiplier))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// Client-side stream lifecycle:
/// `Disconnected -> Connecting -> Connected -> Reconnecting -> Connecting ...`.
/// Transitions that do not apply to the current state leave it unchanged.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    backoff: Backoff,
    failures: u32,
}

impl ConnectionMachine {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            backoff,
            failures: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connect(&mut self) -> ConnectionState {
        if self.state == ConnectionState::Disconnected {
            self.failures = 0;
            self.set(ConnectionState::Connecting { attempt: 1 });
        }
        self.state
    }

    pub fn opened(&mut self) -> ConnectionState {
        if matches!(self.state, ConnectionState::Connecting { .. }) {
            self.failures = 0;
            self.set(ConnectionState::Connected);
        }
        self.state
    }

    /// The stream errored or ended. Schedules a reconnect unless attempts are exhausted.
    pub fn failed(&mut self) -> ConnectionState {
        if !matches!(
            self.state,
            ConnectionState::Connecting { .. } | ConnectionState::Connected
        ) {
            return self.state;
        }
        self.failures += 1;
        let next = match self.backoff.max_attempts {
            Some(max) if self.failures > max => ConnectionState::Disconnected,
            _ => ConnectionState::Reconnecting {
                attempt: self.failures,
                delay: self.backoff.delay(self.failures),
            },
        };
        self.set(next);
        self.state
    }

    /// The reconnect delay elapsed.
    pub fn retry(&mut self) -> ConnectionState {
        if let ConnectionState::Reconnecting { attempt, .. } = self.state {
            self.set(ConnectionState::Connecting {
                attempt: attempt + 1,
            });
        }
        self.state
    }

    pub fn close(&mut self) -> ConnectionState {
        self.failures = 0;
        self.set(ConnectionState::Disconnected);
        self.state
    }

    fn set(&mut self, next: ConnectionState) {
        if next == self.state {
            return;
        }
        match next {
            ConnectionState::Connected | ConnectionState::Disconnected => {
                info!(target = "live.connection", from = %self.state, to = %next, "connection state")
            }
            _ => debug!(target = "live.connection", from = %self.state, to = %next, "connection state"),
        }
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let backoff = Backoff::default();
        let delays: Vec<u64> = (1..=8).map(|n| backoff.delay(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![500, 1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
        assert_eq!(backoff.delay(200), Duration::from_secs(30));
    }

    #[test]
    fn full_cycle_resets_the_backoff_after_success() {
        let mut machine = ConnectionMachine::new(Backoff::default());
        assert_eq!(machine.connect(), ConnectionState::Connecting { attempt: 1 });
        assert_eq!(machine.opened(), ConnectionState::Connected);
        assert_eq!(
            machine.failed(),
            ConnectionState::Reconnecting {
                attempt: 1,
                delay: Duration::from_millis(500)
            }
        );
        assert_eq!(machine.retry(), ConnectionState::Connecting { attempt: 2 });
        assert_eq!(
            machine.failed(),
            ConnectionState::Reconnecting {
                attempt: 2,
                delay: Duration::from_secs(1)
            }
        );
        machine.retry();
        machine.opened();
        assert_eq!(
            machine.failed(),
            ConnectionState::Reconnecting {
                attempt: 1,
                delay: Duration::from_millis(500)
            }
        );
    }

    #[test]
    fn gives_up_after_the_attempt_limit() {
        let mut machine = ConnectionMachine::new(Backoff {
            max_attempts: Some(2),
            ..Backoff::default()
        });
        machine.connect();
        assert!(matches!(machine.failed(), ConnectionState::Reconnecting { .. }));
        machine.retry();
        assert!(matches!(machine.failed(), ConnectionState::Reconnecting { .. }));
        machine.retry();
        assert_eq!(machine.failed(), ConnectionState::Disconnected);
    }

    #[test]
    fn inapplicable_transitions_are_ignored() {
        let mut machine = ConnectionMachine::new(Backoff::default());
        assert_eq!(machine.opened(), ConnectionState::Disconnected);
        assert_eq!(machine.retry(), ConnectionState::Disconnected);
        assert_eq!(machine.failed(), ConnectionState::Disconnected);
        machine.connect();
        assert_eq!(machine.connect(), ConnectionState::Connecting { attempt: 1 });
    }
}
