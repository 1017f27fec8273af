//! Step catalog
//!
//! Registry of step definitions, kept as the projection of the `engine`
//! aggregate alongside per-step observed health. Definitions are immutable
//! once stored; update is replace.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use strand_domain::{Step, StepError};

use crate::aggregate::{AggregateError, Aggregator, Projection};
use crate::event::{AggregateId, EngineEvent, Event, EventStore, EventStoreError};
use crate::invoke::compile_script;

// =============================================================================
// Errors
// =============================================================================

/// Catalog command failures
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Register with an id already present
    #[error("step already exists: '{0}'")]
    Exists(String),

    /// Update or unregister of an absent id
    #[error("step not found: '{0}'")]
    NotFound(String),

    /// Definition failed structural validation
    #[error("invalid step: {0}")]
    Invalid(#[from] StepError),

    /// Script source failed to compile
    #[error("invalid step: script for '{step_id}' failed to compile: {message}")]
    ScriptCompile { step_id: String, message: String },

    /// Unregister while an active flow references the step
    #[error("step '{0}' is referenced by an active flow")]
    StepInUse(String),

    /// Backing store failed
    #[error(transparent)]
    Store(EventStoreError),

    /// Optimistic retries exhausted
    #[error("catalog write contention exceeded after {0} attempts")]
    Contention(u32),
}

impl From<AggregateError<CatalogError>> for CatalogError {
    fn from(error: AggregateError<CatalogError>) -> Self {
        match error {
            AggregateError::Store(e) => Self::Store(e),
            AggregateError::ContentionExceeded(n) => Self::Contention(n),
            AggregateError::Command(e) => e,
        }
    }
}

// =============================================================================
// Projection
// =============================================================================

/// Last observed health of a step endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepHealth {
    pub healthy: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub checked_at: DateTime<Utc>,
}

/// Projection of the `engine` aggregate
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineState {
    /// Registered step definitions, keyed by id
    pub steps: BTreeMap<String, Step>,

    /// Observed health per step, present once a probe has run
    pub health: BTreeMap<String, StepHealth>,
}

impl Projection for EngineState {
    type Event = EngineEvent;

    fn apply(&mut self, envelope: &Event, payload: &Self::Event) {
        match payload {
            EngineEvent::StepRegistered { step } | EngineEvent::StepUpdated { step } => {
                self.steps.insert(step.id.clone(), step.clone());
            }
            EngineEvent::StepUnregistered { step_id } => {
                self.steps.remove(step_id);
                self.health.remove(step_id);
            }
            EngineEvent::StepHealthChanged {
                step_id,
                healthy,
                error,
            } => {
                self.health.insert(
                    step_id.clone(),
                    StepHealth {
                        healthy: *healthy,
                        error: error.clone(),
                        checked_at: envelope.timestamp,
                    },
                );
            }
        }
    }
}

// =============================================================================
// Catalog
// =============================================================================

/// Commands over the `engine` aggregate
pub struct Catalog {
    aggregator: Aggregator<EngineState>,
}

impl Catalog {
    /// Create a catalog over the given store
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            aggregator: Aggregator::new(store, AggregateId::engine()),
        }
    }

    /// Validate a definition, including script compilation
    fn validate(step: &Step) -> Result<(), CatalogError> {
        step.validate()?;
        if let Some(script) = step.kind.script() {
            compile_script(script).map_err(|message| CatalogError::ScriptCompile {
                step_id: step.id.clone(),
                message,
            })?;
        }
        Ok(())
    }

    /// Register a new step definition
    pub async fn register(&self, step: Step) -> Result<(), CatalogError> {
        Self::validate(&step)?;
        self.aggregator
            .transact(|state: &EngineState| {
                if state.steps.contains_key(&step.id) {
                    return Err(CatalogError::Exists(step.id.clone()));
                }
                Ok((vec![EngineEvent::StepRegistered { step: step.clone() }], ()))
            })
            .await
            .map_err(CatalogError::from)
    }

    /// Replace an existing step definition
    pub async fn update(&self, step: Step) -> Result<(), CatalogError> {
        Self::validate(&step)?;
        self.aggregator
            .transact(|state: &EngineState| {
                if !state.steps.contains_key(&step.id) {
                    return Err(CatalogError::NotFound(step.id.clone()));
                }
                Ok((vec![EngineEvent::StepUpdated { step: step.clone() }], ()))
            })
            .await
            .map_err(CatalogError::from)
    }

    /// Remove a step definition.
    ///
    /// The caller is responsible for the active-flow reference check; see
    /// `Engine::unregister_step`.
    pub async fn unregister(&self, step_id: &str) -> Result<(), CatalogError> {
        self.aggregator
            .transact(|state: &EngineState| {
                if !state.steps.contains_key(step_id) {
                    return Err(CatalogError::NotFound(step_id.to_string()));
                }
                Ok((
                    vec![EngineEvent::StepUnregistered {
                        step_id: step_id.to_string(),
                    }],
                    (),
                ))
            })
            .await
            .map_err(CatalogError::from)
    }

    /// Record an observed health status.
    ///
    /// Raises `step_health_changed` only when the status differs from the
    /// last recorded one. A probe racing an unregister is a no-op. Returns
    /// whether an event was raised.
    pub async fn set_health(
        &self,
        step_id: &str,
        healthy: bool,
        error: Option<String>,
    ) -> Result<bool, CatalogError> {
        self.aggregator
            .transact(|state: &EngineState| {
                if !state.steps.contains_key(step_id) {
                    return Ok((vec![], false));
                }
                let unchanged = state
                    .health
                    .get(step_id)
                    .is_some_and(|h| h.healthy == healthy && h.error == error);
                if unchanged {
                    return Ok::<_, CatalogError>((vec![], false));
                }
                Ok((
                    vec![EngineEvent::StepHealthChanged {
                        step_id: step_id.to_string(),
                        healthy,
                        error: error.clone(),
                    }],
                    true,
                ))
            })
            .await
            .map_err(CatalogError::from)
    }

    /// Current projection and next sequence
    pub async fn state(&self) -> Result<(EngineState, i64), EventStoreError> {
        self.aggregator.state().await
    }
}

// =============================================================================
// Tests
// =============================================================================
