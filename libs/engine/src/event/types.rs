//! Event envelope and payload types
//!
//! Every state change is an appended, sequenced event. The envelope carries
//! the aggregate path, the dense per-aggregate sequence, the event type, and
//! a JSON payload; payload enums are serde-tagged and the tag is stripped
//! into the envelope's `type` field on storage.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use strand_domain::{ExecutionPlan, Step};

// =============================================================================
// Aggregate Id
// =============================================================================

/// A consistency boundary, addressed by path segments.
///
/// The engine uses `["engine"]` for the catalog/health aggregate and
/// `["flow", <id>]` for each flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateId(Vec<String>);

impl AggregateId {
    /// The catalog/health aggregate
    #[must_use]
    pub fn engine() -> Self {
        Self(vec!["engine".to_string()])
    }

    /// The aggregate of one flow
    #[must_use]
    pub fn flow(flow_id: &str) -> Self {
        Self(vec!["flow".to_string(), flow_id.to_string()])
    }

    /// Build from raw path segments
    #[must_use]
    pub fn from_segments(segments: Vec<String>) -> Self {
        Self(segments)
    }

    /// Path segments
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Whether this id starts with the given prefix segments
    #[must_use]
    pub fn starts_with(&self, prefix: &AggregateId) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }
}

impl std::fmt::Display for AggregateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// A committed event as stored and fanned out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub aggregate_id: AggregateId,

    /// Dense position within the aggregate, starting at 0
    pub sequence: i64,

    /// Payload discriminator, e.g. `step_completed`
    #[serde(rename = "type")]
    pub event_type: String,

    /// Commit time, serialized as epoch milliseconds
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    /// Payload with the discriminator stripped
    pub data: serde_json::Value,
}

/// An event proposed for append; the store assigns sequence and timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub event_type: String,
    pub data: serde_json::Value,
}

// =============================================================================
// Domain Event
// =============================================================================

/// Typed payload enums that round-trip through the envelope.
///
/// The serde tag (`type`) must match [`DomainEvent::event_type`]; the
/// provided conversions strip it on the way out and reinsert it on the way
/// back so envelope payloads never duplicate the discriminator.
pub trait DomainEvent: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Discriminator string, identical to the serde tag
    fn event_type(&self) -> &'static str;

    /// Convert into a proposed event with the tag stripped from the payload
    fn to_new_event(&self) -> Result<NewEvent, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Some(object) = value.as_object_mut() {
            object.remove("type");
        }
        Ok(NewEvent {
            event_type: self.event_type().to_string(),
            data: value,
        })
    }

    /// Parse a stored envelope back into the typed payload
    fn from_event(event: &Event) -> Result<Self, serde_json::Error> {
        let mut value = event.data.clone();
        if let Some(object) = value.as_object_mut() {
            object.insert(
                "type".to_string(),
                serde_json::Value::String(event.event_type.clone()),
            );
        }
        serde_json::from_value(value)
    }
}

// =============================================================================
// Flow Events
// =============================================================================

/// Events on a `flow:<id>` aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    /// Flow created with its derived plan and initial state
    FlowStarted {
        flow_id: String,
        plan: ExecutionPlan,
        init: BTreeMap<String, serde_json::Value>,
        labels: BTreeMap<String, String>,
    },

    /// Step execution dispatched with projected inputs
    StepStarted {
        step_id: String,
        inputs: BTreeMap<String, serde_json::Value>,
    },

    /// One async work item dispatched under a fresh token
    WorkItemStarted {
        step_id: String,
        token: String,
        inputs: BTreeMap<String, serde_json::Value>,
    },

    /// Attribute published into flow state
    AttributeSet {
        name: String,
        value: serde_json::Value,
        step_id: Option<String>,
    },

    /// Async work item finished successfully
    WorkItemCompleted {
        step_id: String,
        token: String,
        outputs: BTreeMap<String, serde_json::Value>,
    },

    /// Async work item failed
    WorkItemFailed {
        step_id: String,
        token: String,
        error: String,
    },

    /// Execution completed with its merged outputs
    StepCompleted {
        step_id: String,
        outputs: BTreeMap<String, serde_json::Value>,
    },

    /// Execution failed terminally
    StepFailed { step_id: String, error: String },

    /// Execution will never run
    StepSkipped { step_id: String, reason: String },

    /// Every goal execution completed
    FlowCompleted,

    /// A goal became unreachable
    FlowFailed { error: String },
}

impl DomainEvent for FlowEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::FlowStarted { .. } => "flow_started",
            Self::StepStarted { .. } => "step_started",
            Self::WorkItemStarted { .. } => "work_item_started",
            Self::AttributeSet { .. } => "attribute_set",
            Self::WorkItemCompleted { .. } => "work_item_completed",
            Self::WorkItemFailed { .. } => "work_item_failed",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::StepSkipped { .. } => "step_skipped",
            Self::FlowCompleted => "flow_completed",
            Self::FlowFailed { .. } => "flow_failed",
        }
    }
}

// =============================================================================
// Engine Events
// =============================================================================

/// Events on the `engine` aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Step definition added to the catalog
    StepRegistered { step: Step },

    /// Step definition replaced
    StepUpdated { step: Step },

    /// Step definition removed
    StepUnregistered { step_id: String },

    /// Observed health flipped for a step
    StepHealthChanged {
        step_id: String,
        healthy: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl DomainEvent for EngineEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::StepRegistered { .. } => "step_registered",
            Self::StepUpdated { .. } => "step_updated",
            Self::StepUnregistered { .. } => "step_unregistered",
            Self::StepHealthChanged { .. } => "step_health_changed",
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
