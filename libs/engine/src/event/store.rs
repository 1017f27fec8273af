//! Append-only event store
//!
//! Provides per-aggregate sequenced storage with optimistic-concurrency
//! appends. The shipped implementation is in-memory; persistent KV backends
//! plug in behind the same trait.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use super::hub::EventHub;
use super::types::{AggregateId, Event, NewEvent};

// =============================================================================
// Errors
// =============================================================================

/// Event store errors
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// Another writer advanced the aggregate past the expected sequence
    #[error("sequence conflict on {aggregate_id}: expected {expected}, actual {actual}")]
    SequenceConflict {
        aggregate_id: String,
        expected: i64,
        actual: i64,
    },

    /// Payload could not be serialized or parsed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backing storage failed
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

// =============================================================================
// Event Store Trait
// =============================================================================

/// Append-only sequenced storage per aggregate.
///
/// `append` is atomic per aggregate and publishes every committed event to
/// the hub exactly once, in order, before returning. Sequences are dense
/// from 0; `current_sequence` is the next position to be written.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append events at positions `expected_sequence..expected_sequence + len`.
    ///
    /// Fails with [`EventStoreError::SequenceConflict`] if the aggregate has
    /// advanced past `expected_sequence`. Returns the committed envelopes.
    async fn append(
        &self,
        aggregate_id: &AggregateId,
        expected_sequence: i64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<Event>, EventStoreError>;

    /// Events of the aggregate with `sequence >= from_sequence`, in order
    async fn events(
        &self,
        aggregate_id: &AggregateId,
        from_sequence: i64,
    ) -> Result<Vec<Event>, EventStoreError>;

    /// The next sequence to be written; 0 for an empty aggregate
    async fn current_sequence(&self, aggregate_id: &AggregateId) -> Result<i64, EventStoreError>;
}

// =============================================================================
// In-Memory Event Store
// =============================================================================

/// Memory-backed store; the default for a single-process engine
pub struct MemoryEventStore {
    hub: Arc<EventHub>,
    streams: Mutex<HashMap<AggregateId, Vec<Event>>>,
}

impl MemoryEventStore {
    /// Create a store publishing commits to the given hub
    #[must_use]
    pub fn new(hub: Arc<EventHub>) -> Self {
        Self {
            hub,
            streams: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(
        &self,
        aggregate_id: &AggregateId,
        expected_sequence: i64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<Event>, EventStoreError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        // The stream lock is held through hub publication so that a
        // concurrent append cannot interleave its events into the fan-out.
        let mut streams = self
            .streams
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let stream = streams.entry(aggregate_id.clone()).or_default();

        let actual = stream.len() as i64;
        if actual != expected_sequence {
            return Err(EventStoreError::SequenceConflict {
                aggregate_id: aggregate_id.to_string(),
                expected: expected_sequence,
                actual,
            });
        }

        let timestamp = Utc::now();
        let mut committed = Vec::with_capacity(events.len());
        for (offset, event) in events.into_iter().enumerate() {
            let envelope = Event {
                aggregate_id: aggregate_id.clone(),
                sequence: expected_sequence + offset as i64,
                event_type: event.event_type,
                timestamp,
                data: event.data,
            };
            stream.push(envelope.clone());
            committed.push(envelope);
        }

        for envelope in &committed {
            self.hub.publish(envelope);
        }

        Ok(committed)
    }

    async fn events(
        &self,
        aggregate_id: &AggregateId,
        from_sequence: i64,
    ) -> Result<Vec<Event>, EventStoreError> {
        let streams = self
            .streams
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let from = from_sequence.max(0) as usize;
        Ok(streams
            .get(aggregate_id)
            .map(|stream| stream.get(from..).unwrap_or_default().to_vec())
            .unwrap_or_default())
    }

    async fn current_sequence(&self, aggregate_id: &AggregateId) -> Result<i64, EventStoreError> {
        let streams = self
            .streams
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(streams.get(aggregate_id).map_or(0, |s| s.len() as i64))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn new_event(event_type: &str) -> NewEvent {
        NewEvent {
            event_type: event_type.to_string(),
            data: serde_json::json!({"k": event_type}),
        }
    }

    fn store() -> MemoryEventStore {
        MemoryEventStore::new(Arc::new(EventHub::new()))
    }

    #[tokio::test]
    async fn test_append_assigns_dense_sequences() {
        let store = store();
        let id = AggregateId::flow("f1");

        let first = store
            .append(&id, 0, vec![new_event("a"), new_event("b")])
            .await
            .unwrap();
        assert_eq!(first[0].sequence, 0);
        assert_eq!(first[1].sequence, 1);

        let second = store.append(&id, 2, vec![new_event("c")]).await.unwrap();
        assert_eq!(second[0].sequence, 2);

        let all = store.events(&id, 0).await.unwrap();
        let sequences: Vec<i64> = all.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert_eq!(store.current_sequence(&id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_append_detects_sequence_conflict() {
        let store = store();
        let id = AggregateId::flow("f1");

        store.append(&id, 0, vec![new_event("a")]).await.unwrap();

        let err = store
            .append(&id, 0, vec![new_event("b")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EventStoreError::SequenceConflict {
                expected: 0,
                actual: 1,
                ..
            }
        ));

        // The failed append wrote nothing.
        assert_eq!(store.current_sequence(&id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_events_from_sequence() {
        let store = store();
        let id = AggregateId::engine();

        store
            .append(&id, 0, vec![new_event("a"), new_event("b"), new_event("c")])
            .await
            .unwrap();

        let tail = store.events(&id, 1).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].sequence, 1);

        assert!(store.events(&id, 99).await.unwrap().is_empty());
        assert!(store
            .events(&AggregateId::flow("missing"), 0)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_commits_publish_to_hub_in_order() {
        let hub = Arc::new(EventHub::new());
        let store = MemoryEventStore::new(Arc::clone(&hub));
        let id = AggregateId::flow("f1");
        let mut consumer = hub.subscribe_aggregate(id.clone(), None);

        store
            .append(&id, 0, vec![new_event("a"), new_event("b")])
            .await
            .unwrap();

        assert_eq!(consumer.recv().await.unwrap().sequence, 0);
        assert_eq!(consumer.recv().await.unwrap().sequence, 1);
    }
}
