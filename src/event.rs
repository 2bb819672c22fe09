//! Structured notifications emitted by producers.
//!
//! Every producer owns an [`EventBus`]; consumers `subscribe()` to build
//! progress output or audit logs. Events carry a monotonic sequence number
//! so consumers can detect gaps after lagging behind the broadcast buffer.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events buffered per subscriber before it starts lagging.
const EVENT_CAPACITY: usize = 1024;

/// A structured event emitted by a producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event<T> {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind<T>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind<T> {
    ItemSucceeded { item: T },
    ItemFailed { item: T },
    Error { message: String },
    /// Fired exactly once per run.
    Done,
}

/// Broadcast fan-out with sequence numbering.
pub struct EventBus<T> {
    tx: broadcast::Sender<Event<T>>,
    seq: AtomicU64,
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tx,
            seq: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event<T>> {
        self.tx.subscribe()
    }

    /// Emit an event. Having no subscribers is not an error.
    pub fn emit(&self, kind: EventKind<T>) {
        let event = Event {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            kind,
        };
        let _ = self.tx.send(event);
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}
