//! Timers owned by the registry: one heartbeat loop per scope and a cleanup sweep.

use std::sync::{Arc, Weak};
use std::time::Duration;

use live_proto::Scope;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::registry::Registry;

impl Registry {
    /// Spawns the heartbeat and cleanup timers. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut timers = self.timers.lock();
        if !timers.is_empty() {
            debug!(target = "live.scheduler", "timers already running");
            return;
        }
        for scope in Scope::ALL {
            let period = self.settings().policy(scope).heartbeat_interval;
            timers.push(spawn_heartbeat(Arc::downgrade(self), scope, period));
        }
        timers.push(spawn_cleanup(
            Arc::downgrade(self),
            self.settings().cleanup_interval,
        ));
        info!(
            target = "live.scheduler",
            timers = timers.len(),
            "registry timers started"
        );
    }

    /// Stops the timers and closes every connection with `connection_closed`.
    pub fn destroy(&self) {
        let timers: Vec<JoinHandle<()>> = self.timers.lock().drain(..).collect();
        for timer in &timers {
            timer.abort();
        }
        let closed = self.close_all("server shutting down");
        info!(
            target = "live.scheduler",
            timers = timers.len(),
            closed,
            "registry destroyed"
        );
    }

    pub fn is_running(&self) -> bool {
        self.timers.lock().iter().any(|timer| !timer.is_finished())
    }
}

fn spawn_heartbeat(registry: Weak<Registry>, scope: Scope, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(registry) = registry.upgrade() else {
                break;
            };
            let delivered = registry.heartbeat(scope);
            trace!(
                target = "live.scheduler",
                scope = %scope,
                delivered,
                "heartbeat sent"
            );
        }
    })
}

fn spawn_cleanup(registry: Weak<Registry>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(registry) = registry.upgrade() else {
                break;
            };
            registry.sweep();
        }
    })
}
