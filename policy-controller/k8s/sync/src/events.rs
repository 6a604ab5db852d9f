//! The bounded queue carrying watch events from the registrar to the sync
//! handler.
//!
//! Producers block while the queue is full, but only for a bounded time: a
//! send that times out hands the event back in [`SendError::Timeout`] rather
//! than dropping it. [`EventSender::deliver`] retries such sends until the
//! event is accepted or the producer is stopped.

use gatekeeper_policy_controller_core::{CancellationToken, Gvk};
use gatekeeper_policy_controller_k8s_api::DynamicObject;
use prometheus_client::metrics::counter::Counter;
use std::time::Duration;
use tokio::sync::mpsc;

pub const EVENT_QUEUE_CAPACITY: usize = 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    Apply,
    Delete,
}

#[derive(Clone, Debug)]
pub struct SyncEvent {
    pub gvk: Gvk,
    pub kind: EventKind,
    pub object: DynamicObject,
}

#[derive(Clone, Debug)]
pub struct EventSender {
    tx: mpsc::Sender<SyncEvent>,
    timeout: Duration,
    timeouts: Counter,
}

#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<SyncEvent>,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("event queue stayed full for {timeout:?}")]
    Timeout {
        event: Box<SyncEvent>,
        timeout: Duration,
    },

    #[error("event queue closed")]
    Closed(Box<SyncEvent>),

    #[error("producer stopped before the event was queued")]
    Stopped(Box<SyncEvent>),
}

pub fn channel(capacity: usize, timeout: Duration) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    let tx = EventSender {
        tx,
        timeout,
        timeouts: Counter::default(),
    };
    (tx, EventReceiver { rx })
}

// === impl SyncEvent ===

impl SyncEvent {
    pub fn apply(gvk: Gvk, object: DynamicObject) -> Self {
        Self {
            gvk,
            kind: EventKind::Apply,
            object,
        }
    }

    pub fn delete(gvk: Gvk, object: DynamicObject) -> Self {
        Self {
            gvk,
            kind: EventKind::Delete,
            object,
        }
    }
}

// === impl EventSender ===

impl EventSender {
    /// Counts send timeouts in the given counter.
    pub fn with_timeout_counter(mut self, timeouts: Counter) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Queues the event, waiting at most the configured timeout for capacity.
    pub async fn send(&self, event: SyncEvent) -> Result<(), SendError> {
        match self.tx.send_timeout(event, self.timeout).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(event)) => {
                self.timeouts.inc();
                Err(SendError::Timeout {
                    event: Box::new(event),
                    timeout: self.timeout,
                })
            }
            Err(mpsc::error::SendTimeoutError::Closed(event)) => {
                Err(SendError::Closed(Box::new(event)))
            }
        }
    }

    /// Queues the event, retrying after each timeout until it is accepted, the
    /// queue closes, or `stop` fires.
    pub async fn deliver(&self, event: SyncEvent, stop: &CancellationToken) -> Result<(), SendError> {
        let mut event = event;
        loop {
            let res = tokio::select! {
                biased;
                _ = stop.cancelled() => return Err(SendError::Stopped(Box::new(event))),
                res = self.send(event.clone()) => res,
            };
            match res {
                Err(SendError::Timeout { event: retry, timeout }) => {
                    tracing::warn!(
                        gvk = %retry.gvk,
                        ?timeout,
                        "Event queue is full; retrying"
                    );
                    event = *retry;
                }
                res => return res,
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// === impl EventReceiver ===

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SyncEvent> {
        self.rx.try_recv().ok()
    }
}
