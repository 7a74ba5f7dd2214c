use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("stream closed")]
    Closed,
    #[error("stream buffer full")]
    Full,
}

/// Output side of one live stream. Writes never block; a connection whose
/// sink errors is treated as gone.
pub trait EventSink: Send + Sync {
    fn send(&self, payload: Arc<str>) -> Result<(), SinkError>;
}

/// Bounded channel feeding an SSE response body.
pub struct ChannelSink {
    tx: mpsc::Sender<Arc<str>>,
}

impl ChannelSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn send(&self, payload: Arc<str>) -> Result<(), SinkError> {
        self.tx.try_send(payload).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn send(&self, payload: Arc<str>) -> Result<(), SinkError> {
        (**self).send(payload)
    }
}

/// Channel sink that holds writes until [`HeldSink::release`] puts the opening events in
/// front of them. Lets a stream join its session before the snapshot is read without
/// losing anything broadcast in between.
pub struct HeldSink {
    inner: ChannelSink,
    held: Mutex<Option<Vec<Arc<str>>>>,
    limit: usize,
}

impl HeldSink {
    /// `opening` extra slots are reserved for the events passed to `release`.
    pub fn channel(capacity: usize, opening: usize) -> (Arc<Self>, mpsc::Receiver<Arc<str>>) {
        let limit = capacity.max(1);
        let (inner, rx) = ChannelSink::channel(limit + opening);
        let sink = Self {
            inner,
            held: Mutex::new(Some(Vec::new())),
            limit,
        };
        (Arc::new(sink), rx)
    }

    /// Writes `opening`, then everything held so far; later writes go straight through.
    pub fn release(&self, opening: Vec<Arc<str>>) -> Result<(), SinkError> {
        let mut held = self.held.lock();
        let queued = held.take().unwrap_or_default();
        for payload in opening.into_iter().chain(queued) {
            self.inner.send(payload)?;
        }
        Ok(())
    }
}

impl EventSink for HeldSink {
    fn send(&self, payload: Arc<str>) -> Result<(), SinkError> {
        let mut held = self.held.lock();
        match held.as_mut() {
            Some(queue) if queue.len() >= self.limit => Err(SinkError::Full),
            Some(queue) => {
                queue.push(payload);
                Ok(())
            }
            None => self.inner.send(payload),
        }
    }
}
