//! In-process event fan-out
//!
//! The hub sits on the event store's commit path: every committed event is
//! published once, in order, to all matching consumers. Each consumer owns a
//! bounded channel; a consumer that falls behind is dropped (its channel is
//! closed) rather than blocking the publisher.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;

use super::types::{AggregateId, Event};

/// Per-consumer buffer size; overflow drops the consumer
pub const CONSUMER_BUFFER: usize = 16;

// =============================================================================
// Filters
// =============================================================================

/// What a consumer wants to see
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerFilter {
    /// Receives nothing; the placeholder for a connected-but-unsubscribed
    /// client
    Nothing,

    /// Events whose type is in the set, on any aggregate
    Types(BTreeSet<String>),

    /// Events on aggregates under the prefix, optionally narrowed by type
    Aggregate {
        prefix: AggregateId,
        types: Option<BTreeSet<String>>,
    },
}

impl ConsumerFilter {
    fn matches(&self, event: &Event) -> bool {
        match self {
            Self::Nothing => false,
            Self::Types(types) => types.contains(&event.event_type),
            Self::Aggregate { prefix, types } => {
                event.aggregate_id.starts_with(prefix)
                    && types
                        .as_ref()
                        .is_none_or(|set| set.contains(&event.event_type))
            }
        }
    }
}

// =============================================================================
// Hub
// =============================================================================

struct Slot {
    id: u64,
    filter: ConsumerFilter,
    tx: mpsc::Sender<Event>,
}

struct Inner {
    next_id: u64,
    slots: Vec<Slot>,
    closed: bool,
}

/// Process-wide pub/sub of committed events
pub struct EventHub {
    inner: Mutex<Inner>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    /// Create an open hub
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 0,
                slots: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Register a consumer with the given filter.
    ///
    /// On a closed hub the consumer is created already-drained: `recv`
    /// returns `None` immediately.
    pub fn subscribe(self: &Arc<Self>, filter: ConsumerFilter) -> Consumer {
        let (tx, rx) = mpsc::channel(CONSUMER_BUFFER);

        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let id = inner.next_id;
        inner.next_id += 1;
        if !inner.closed {
            inner.slots.push(Slot { id, filter, tx });
        }
        drop(inner);

        Consumer {
            id,
            rx,
            hub: Arc::downgrade(self),
            closed: false,
        }
    }

    /// Consumer for a set of event types
    pub fn subscribe_types(self: &Arc<Self>, types: BTreeSet<String>) -> Consumer {
        self.subscribe(ConsumerFilter::Types(types))
    }

    /// Consumer for an aggregate prefix, optionally narrowed by type
    pub fn subscribe_aggregate(
        self: &Arc<Self>,
        prefix: AggregateId,
        types: Option<BTreeSet<String>>,
    ) -> Consumer {
        self.subscribe(ConsumerFilter::Aggregate { prefix, types })
    }

    /// Publish one committed event to every matching consumer.
    ///
    /// Called by the store's commit path while it still holds the stream
    /// lock, so consumers observe each aggregate's events in sequence order.
    /// A full or disconnected consumer channel drops that consumer.
    pub fn publish(&self, event: &Event) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if inner.closed {
            return;
        }

        inner.slots.retain(|slot| {
            if !slot.filter.matches(event) {
                return true;
            }
            match slot.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(consumer = slot.id, "dropping slow event consumer");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Number of live consumers
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .slots
            .len()
    }

    /// Tear down the hub, closing every consumer channel. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.closed = true;
        inner.slots.clear();
    }

    fn remove(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.slots.retain(|slot| slot.id != id);
    }
}

// =============================================================================
// Consumer
// =============================================================================

/// A registered subscriber; dropping it releases the hub slot
pub struct Consumer {
    id: u64,
    rx: mpsc::Receiver<Event>,
    hub: Weak<EventHub>,
    closed: bool,
}

impl Consumer {
    /// Receive the next matching event.
    ///
    /// Returns `None` once the consumer is closed - by `close`, by hub
    /// teardown, or by being dropped for falling behind - and the buffered
    /// backlog is drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Release the hub slot. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id);
        }
        self.rx.close();
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// Tests
// =============================================================================
