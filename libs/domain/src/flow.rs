//! Flow, execution, and work item records
//!
//! A flow is one run of a plan. It owns one execution per plan step, and an
//! async execution owns one work item per dispatch. All three are mutated
//! only by folding events; the status enums carry transition guards so the
//! fold can reject illegal moves at command time.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::plan::ExecutionPlan;
use crate::step::StepKind;

// =============================================================================
// Errors
// =============================================================================

/// Illegal lifecycle transitions
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    /// Execution moved out of a terminal status
    #[error("invalid execution transition from {from} to {to}")]
    Execution { from: &'static str, to: &'static str },

    /// Work item moved out of a terminal status
    #[error("work item already {0}")]
    WorkItemTerminal(&'static str),
}

// =============================================================================
// Statuses
// =============================================================================

/// Lifecycle of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    #[default]
    Active,
    Completed,
    Failed,
}

impl FlowStatus {
    /// Whether the flow accepts further work
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }

    /// Status name as serialized
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Lifecycle of one step execution within a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Active,
    Completed,
    Failed,
    Skipped,
}

impl ExecutionStatus {
    /// Terminal statuses are absorbing
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Whether the target status is reachable from here
    #[must_use]
    pub fn can_transition_to(self, target: Self) -> bool {
        use ExecutionStatus::{Active, Completed, Failed, Pending, Skipped};
        matches!(
            (self, target),
            (Pending, Active) | (Pending, Skipped) | (Active, Completed) | (Active, Failed)
        )
    }

    /// Status name as serialized
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Lifecycle of one async work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    #[default]
    Active,
    Completed,
    Failed,
}

impl WorkItemStatus {
    /// A transition out of `Active` is legal at most once
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }

    /// Status name as serialized
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

// =============================================================================
// Work Item
// =============================================================================

/// One concrete dispatch of an async step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unguessable token minted at dispatch; the webhook authenticator
    pub token: String,

    pub status: WorkItemStatus,

    /// Inputs bound for this item (fan-out binds the scalar element)
    pub inputs: BTreeMap<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<BTreeMap<String, serde_json::Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// Guard a completion or failure of this item.
    pub fn guard_transition(&self) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::WorkItemTerminal(self.status.name()));
        }
        Ok(())
    }
}

// =============================================================================
// Execution
// =============================================================================

/// Per-flow, per-step record of work
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub status: ExecutionStatus,

    /// Inputs projected from flow state at dispatch
    #[serde(default)]
    pub inputs: BTreeMap<String, serde_json::Value>,

    /// Present iff `status == Completed`
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Token to work item; populated only for async steps
    #[serde(default)]
    pub work_items: BTreeMap<String, WorkItem>,
}

impl Execution {
    /// Guard a status change, rejecting moves out of terminal states.
    pub fn guard_transition(&self, target: ExecutionStatus) -> Result<(), TransitionError> {
        if self.status.can_transition_to(target) {
            Ok(())
        } else {
            Err(TransitionError::Execution {
                from: self.status.name(),
                to: target.name(),
            })
        }
    }

    /// Whether every work item has left `Active`
    #[must_use]
    pub fn all_work_items_terminal(&self) -> bool {
        self.work_items.values().all(|w| w.status.is_terminal())
    }

    /// Whether any work item failed
    #[must_use]
    pub fn any_work_item_failed(&self) -> bool {
        self.work_items
            .values()
            .any(|w| w.status == WorkItemStatus::Failed)
    }
}

// =============================================================================
// Flow
// =============================================================================

/// A value published into flow state, with its producing step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeValue {
    pub value: serde_json::Value,

    /// Step that produced the value; `None` for initial state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producing_step_id: Option<String>,
}

/// One run of a plan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flow {
    /// Sanitized flow id
    pub id: String,

    pub status: FlowStatus,

    /// The immutable plan this run executes
    pub plan: ExecutionPlan,

    /// Shared attribute state; keys are write-once
    #[serde(default)]
    pub state: BTreeMap<String, AttributeValue>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Step id to execution mapping, one per plan step
    #[serde(default)]
    pub executions: BTreeMap<String, Execution>,
}

impl Flow {
    /// Whether the flow has been started (folded a start event)
    #[must_use]
    pub fn started(&self) -> bool {
        !self.id.is_empty()
    }

    /// Whether every goal's execution is completed
    #[must_use]
    pub fn all_goals_completed(&self) -> bool {
        self.plan.goals.iter().all(|goal| {
            self.executions
                .get(goal)
                .is_some_and(|e| e.status == ExecutionStatus::Completed)
        })
    }

    /// The step kind for an execution, looked up in the embedded plan
    #[must_use]
    pub fn step_kind(&self, step_id: &str) -> Option<&StepKind> {
        self.plan.steps.get(step_id).map(|s| &s.kind)
    }

    /// Pending steps whose required inputs are all in state, sorted by id
    #[must_use]
    pub fn ready_steps(&self) -> Vec<String> {
        self.executions
            .iter()
            .filter(|(step_id, execution)| {
                execution.status == ExecutionStatus::Pending
                    && self.plan.steps.get(*step_id).is_some_and(|step| {
                        step.required_input_names()
                            .all(|name| self.state.contains_key(name))
                    })
            })
            .map(|(step_id, _)| step_id.clone())
            .collect()
    }
}
