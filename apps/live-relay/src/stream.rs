//! Opening a live stream: the only step that awaits (the initial store read).
//! Everything after that is pushed by the registry.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::Stream;
use live_proto::{Scope, SessionKey, SyncEvent};
use tokio::sync::mpsc;
use tracing::debug;

use crate::registry::{encode, ConnectOptions, Registration, Registry};
use crate::session::ConnectionMetadata;
use crate::sink::HeldSink;
use crate::store::{EntityStore, StoreResult};

/// Removes its connection from the registry when the response body is dropped.
pub struct ConnectionGuard {
    registry: Arc<Registry>,
    key: SessionKey,
    tab_id: String,
    connection_id: u64,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let removed = self
            .registry
            .release(&self.key, &self.tab_id, self.connection_id);
        debug!(
            target = "live.stream",
            session = %self.key,
            tab_id = %self.tab_id,
            connection_id = self.connection_id,
            removed,
            "stream cancelled"
        );
    }
}

/// Serialized envelopes for one tab, in send order.
pub struct LiveStream {
    rx: mpsc::Receiver<Arc<str>>,
    registration: Registration,
    _guard: ConnectionGuard,
}

impl LiveStream {
    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<str>> {
        self.rx.try_recv().ok()
    }
}

impl Stream for LiveStream {
    type Item = Arc<str>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// `connection_established` (outside the game scope) and `INITIAL_STATE`.
const OPENING_EVENTS: usize = 2;

/// Registers the tab, then reads the entity. Anything broadcast to the new tab meanwhile is
/// held and delivered after `INITIAL_STATE` (preceded by `connection_established` outside the
/// game scope), so a move committed during the read is never lost; its `MOVE_APPLIED` may
/// repeat a version already in the snapshot.
pub async fn open_stream(
    registry: &Arc<Registry>,
    store: &dyn EntityStore,
    key: SessionKey,
    tab_id: String,
    metadata: ConnectionMetadata,
) -> StoreResult<LiveStream> {
    let (sink, rx) = HeldSink::channel(registry.settings().channel_capacity, OPENING_EVENTS);
    let options = ConnectOptions::for_scope(registry.settings(), key.scope);
    let registration = registry.add_connection(
        &key,
        &tab_id,
        Box::new(Arc::clone(&sink)),
        metadata,
        options,
    );
    // Dropping the guard on a failed read unregisters the tab again.
    let guard = ConnectionGuard {
        registry: Arc::clone(registry),
        key,
        tab_id,
        connection_id: registration.connection_id,
    };

    let snapshot = store
        .read_entity_state(guard.key.scope, &guard.key.entity_id)
        .await?;

    let mut opening = Vec::with_capacity(OPENING_EVENTS);
    if guard.key.scope != Scope::Game {
        opening.push(SyncEvent::ConnectionEstablished {
            tab_id: guard.tab_id.clone(),
        });
    }
    opening.push(SyncEvent::InitialState(snapshot));
    let opening = opening.into_iter().filter_map(encode).collect();
    if let Err(err) = sink.release(opening) {
        debug!(
            target = "live.stream",
            session = %guard.key,
            tab_id = %guard.tab_id,
            error = %err,
            "opening events not delivered"
        );
    }

    Ok(LiveStream {
        rx,
        registration,
        _guard: guard,
    })
}
