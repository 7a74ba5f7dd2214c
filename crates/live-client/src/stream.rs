//! Reconnecting SSE subscription.
//!
//! One background task owns the `EventSource`. It reopens the stream with the same tab id after
//! every failure, following [`ConnectionMachine`] backoff, and forwards decoded envelopes and
//! state changes over channels. While connected it can also keep the tab's `lastSeen` fresh on
//! the relay so an idle active tab is not taken for a stale one.

use std::time::Duration;

use futures::StreamExt;
use live_proto::Envelope;
use reqwest::Client;
use reqwest_eventsource::{retry, Event, EventSource};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

use crate::connection::{Backoff, ConnectionMachine, ConnectionState};

const EVENT_BUFFER: usize = 64;

/// Well under the relay's default five second staleness threshold.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// `POST` target, e.g. `http://relay/games/G1/tabs/A1/heartbeat`.
    pub url: Url,
    pub every: Duration,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Full stream url without the tab id, e.g. `http://relay/games/G1/stream`.
    pub url: Url,
    pub tab_id: String,
    pub token: Option<String>,
    pub backoff: Backoff,
    pub heartbeat: Option<HeartbeatConfig>,
}

impl StreamConfig {
    pub fn new(url: Url, tab_id: impl Into<String>) -> Self {
        Self {
            url,
            tab_id: tab_id.into(),
            token: None,
            backoff: Backoff::default(),
            heartbeat: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_heartbeat(mut self, url: Url, every: Duration) -> Self {
        self.heartbeat = Some(HeartbeatConfig { url, every });
        self
    }

    fn request_url(&self) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("tabId", &self.tab_id);
        url
    }
}

/// Receiving side of a live subscription. Dropping it stops the background task.
pub struct LiveSubscription {
    pub events: mpsc::Receiver<Envelope>,
    pub state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl LiveSubscription {
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub async fn next_event(&mut self) -> Option<Envelope> {
        self.events.recv().await
    }

    pub fn close(self) {
        self.task.abort();
    }
}

impl Drop for LiveSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn subscribe(http: Client, config: StreamConfig) -> LiveSubscription {
    let (events_tx, events) = mpsc::channel(EVENT_BUFFER);
    let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
    let task = tokio::spawn(run(http, config, events_tx, state_tx));
    LiveSubscription {
        events,
        state,
        task,
    }
}

/// How one connection attempt ended.
enum Ended {
    /// Errored or ran out; reconnect with backoff.
    Dropped,
    /// The relay handed this tab's stream to another connection.
    Replaced,
    /// Nobody is listening any more.
    Abandoned,
}

async fn run(
    http: Client,
    config: StreamConfig,
    events: mpsc::Sender<Envelope>,
    state: watch::Sender<ConnectionState>,
) {
    let mut machine = ConnectionMachine::new(config.backoff.clone());
    let url = config.request_url();
    state.send_replace(machine.connect());

    loop {
        let mut request = http.get(url.clone());
        if let Some(token) = &config.token {
            request = request.bearer_auth(token);
        }
        let mut source = match EventSource::new(request) {
            Ok(source) => source,
            Err(err) => {
                warn!(target = "live.stream", error = %err, "cannot build stream request");
                state.send_replace(machine.close());
                return;
            }
        };
        // Reconnects are driven by the machine, not by the event source.
        source.set_retry_policy(Box::new(retry::Never));

        let ended = pump(&http, &config, &mut source, &mut machine, &events, &state).await;
        source.close();
        match ended {
            Ended::Dropped => {}
            Ended::Replaced => {
                info!(target = "live.stream", tab_id = %config.tab_id, "stream taken over; not reconnecting");
                state.send_replace(machine.close());
                return;
            }
            Ended::Abandoned => return,
        }

        let next = machine.failed();
        state.send_replace(next);
        match next {
            ConnectionState::Reconnecting { delay, .. } => {
                tokio::time::sleep(delay).await;
                if events.is_closed() {
                    return;
                }
                state.send_replace(machine.retry());
            }
            _ => return,
        }
    }
}

async fn pump(
    http: &Client,
    config: &StreamConfig,
    source: &mut EventSource,
    machine: &mut ConnectionMachine,
    events: &mpsc::Sender<Envelope>,
    state: &watch::Sender<ConnectionState>,
) -> Ended {
    let mut heartbeat = config.heartbeat.as_ref().map(|hb| {
        let mut interval = tokio::time::interval(hb.every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        let item = tokio::select! {
            item = source.next() => item,
            _ = tick(&mut heartbeat) => {
                if machine.state().is_connected() {
                    send_heartbeat(http, config).await;
                }
                continue;
            }
        };
        let Some(item) = item else {
            return Ended::Dropped;
        };
        match item {
            Ok(Event::Open) => {
                state.send_replace(machine.opened());
            }
            Ok(Event::Message(message)) => match Envelope::from_json(&message.data) {
                Ok(envelope) => {
                    let replaced = envelope.event.is_replacement();
                    if events.send(envelope).await.is_err() {
                        return Ended::Abandoned;
                    }
                    if replaced {
                        return Ended::Replaced;
                    }
                }
                Err(err) => {
                    warn!(target = "live.stream", error = %err, "dropping undecodable event");
                }
            },
            Err(err) => {
                debug!(target = "live.stream", error = %err, "stream failed");
                return Ended::Dropped;
            }
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn send_heartbeat(http: &Client, config: &StreamConfig) {
    let Some(heartbeat) = &config.heartbeat else {
        return;
    };
    let mut request = http.post(heartbeat.url.clone()).timeout(heartbeat.every);
    if let Some(token) = &config.token {
        request = request.bearer_auth(token);
    }
    match request.send().await {
        Ok(res) if res.status().is_success() => {}
        Ok(res) => {
            debug!(target = "live.stream", tab_id = %config.tab_id, status = %res.status(), "heartbeat refused");
        }
        Err(err) => {
            debug!(target = "live.stream", tab_id = %config.tab_id, error = %err, "heartbeat failed");
        }
    }
}
