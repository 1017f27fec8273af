//! Aggregator: the event-sourcing seam
//!
//! Hides load/fold/append mechanics behind `transact`: commands observe the
//! current projection, return new events, and the aggregator appends them
//! with an optimistic sequence check, retrying on conflict up to a bound.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;

use crate::event::{AggregateId, DomainEvent, Event, EventStore, EventStoreError};

/// Optimistic retry bound for one `transact` call
pub const MAX_TRANSACT_ATTEMPTS: u32 = 10;

// =============================================================================
// Projection
// =============================================================================

/// State rebuilt by folding one aggregate's event history.
///
/// `apply` is total: events were validated by the command that raised them,
/// so the fold never rejects.
pub trait Projection: Default + Clone + Send + Sync + 'static {
    /// Typed payload for this aggregate's events
    type Event: DomainEvent;

    /// Fold one committed event into the state
    fn apply(&mut self, envelope: &Event, payload: &Self::Event);
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from a `transact` call
#[derive(Debug, Error)]
pub enum AggregateError<E: std::error::Error> {
    /// Backing store failed
    #[error(transparent)]
    Store(EventStoreError),

    /// Conflict retries exhausted
    #[error("write contention exceeded after {0} attempts")]
    ContentionExceeded(u32),

    /// The command rejected the transition
    #[error(transparent)]
    Command(E),
}

// =============================================================================
// Aggregator
// =============================================================================

struct Cached<P> {
    state: P,
    /// Next sequence expected from the store
    next_sequence: i64,
}

/// Binds a projection to an aggregate
pub struct Aggregator<P: Projection> {
    store: Arc<dyn EventStore>,
    aggregate_id: AggregateId,
    cache: Mutex<Cached<P>>,
}

impl<P: Projection> Aggregator<P> {
    /// Create an aggregator over an aggregate, starting from an empty fold
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>, aggregate_id: AggregateId) -> Self {
        Self {
            store,
            aggregate_id,
            cache: Mutex::new(Cached {
                state: P::default(),
                next_sequence: 0,
            }),
        }
    }

    /// The aggregate this instance manages
    #[must_use]
    pub fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    /// Fold any events committed since the cached high-water mark
    async fn refresh(&self, cached: &mut Cached<P>) -> Result<(), EventStoreError> {
        let events = self
            .store
            .events(&self.aggregate_id, cached.next_sequence)
            .await?;

        for envelope in &events {
            match P::Event::from_event(envelope) {
                Ok(payload) => cached.state.apply(envelope, &payload),
                Err(error) => {
                    // Foreign event types on this aggregate are a bug
                    // upstream; skip rather than wedge the projection.
                    tracing::warn!(
                        aggregate = %self.aggregate_id,
                        sequence = envelope.sequence,
                        event_type = %envelope.event_type,
                        %error,
                        "skipping undecodable event during fold"
                    );
                }
            }
            cached.next_sequence = envelope.sequence + 1;
        }

        Ok(())
    }

    /// Current projection and next sequence
    pub async fn state(&self) -> Result<(P, i64), EventStoreError> {
        let mut cached = self.cache.lock().await;
        self.refresh(&mut cached).await?;
        Ok((cached.state.clone(), cached.next_sequence))
    }

    /// Run a command against the current state and append its events.
    ///
    /// The command must be pure with respect to the state it is given: on a
    /// sequence conflict it is re-run against fresh state, up to
    /// [`MAX_TRANSACT_ATTEMPTS`] times.
    pub async fn transact<T, E, F>(&self, command: F) -> Result<T, AggregateError<E>>
    where
        E: std::error::Error,
        F: Fn(&P) -> Result<(Vec<P::Event>, T), E>,
    {
        let mut cached = self.cache.lock().await;

        for _ in 0..MAX_TRANSACT_ATTEMPTS {
            self.refresh(&mut cached).await.map_err(AggregateError::Store)?;

            let (events, result) =
                command(&cached.state).map_err(AggregateError::Command)?;
            if events.is_empty() {
                return Ok(result);
            }

            let mut proposed = Vec::with_capacity(events.len());
            for event in &events {
                proposed.push(
                    event
                        .to_new_event()
                        .map_err(|e| AggregateError::Store(EventStoreError::Serialization(e)))?,
                );
            }

            match self
                .store
                .append(&self.aggregate_id, cached.next_sequence, proposed)
                .await
            {
                Ok(committed) => {
                    for (envelope, payload) in committed.iter().zip(events.iter()) {
                        cached.state.apply(envelope, payload);
                        cached.next_sequence = envelope.sequence + 1;
                    }
                    return Ok(result);
                }
                Err(EventStoreError::SequenceConflict { .. }) => {
                    // Another writer got in first; refold and retry.
                    continue;
                }
                Err(error @ EventStoreError::Unavailable(_)) => {
                    tracing::warn!(aggregate = %self.aggregate_id, %error, "append failed, retrying");
                    continue;
                }
                Err(error) => return Err(AggregateError::Store(error)),
            }
        }

        Err(AggregateError::ContentionExceeded(MAX_TRANSACT_ATTEMPTS))
    }
}

// =============================================================================
// Tests
// =============================================================================
