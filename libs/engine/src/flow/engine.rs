//! Flow engine
//!
//! Drives flows to completion: starts them from a derived plan, dispatches
//! ready steps, applies work completions and failures, and terminates when
//! every goal is settled. All state changes go through the flow aggregator;
//! this module never mutates a [`Flow`] directly.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use strand_domain::{
    ExecutionStatus, Flow, FlowStatus, IdError, Step, StepKind, WorkItemStatus,
};

use crate::aggregate::{AggregateError, Aggregator};
use crate::event::{AggregateId, EventStore, EventStoreError, FlowEvent};
use crate::invoke::{Disposition, InvokeContext, StepInvoker};
use crate::planner::{self, PlanError};

// =============================================================================
// Errors
// =============================================================================

/// Flow command failures
#[derive(Debug, Error)]
pub enum FlowError {
    /// Flow id rejected by sanitization
    #[error(transparent)]
    InvalidId(#[from] IdError),

    /// Planner rejected the request
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// Start of an id that is already running
    #[error("flow already exists: '{0}'")]
    Exists(String),

    /// Unknown flow id
    #[error("flow not found: '{0}'")]
    NotFound(String),

    /// The caller must supply these inputs
    #[error("missing required inputs: {}", missing.join(", "))]
    MissingRequired { missing: Vec<String> },

    /// Step is not part of the flow's plan
    #[error("step not found in flow: '{0}'")]
    StepNotFound(String),

    /// Completion for an execution that is not active
    #[error("execution for step '{0}' is not active")]
    ExecutionNotActive(String),

    /// Token does not match a work item of the execution
    #[error("invalid work item token")]
    InvalidToken,

    /// Work item already left its active state
    #[error("work item already {0}")]
    WorkItemTerminal(String),

    /// Command against a completed or failed flow
    #[error("flow already {0}")]
    FlowTerminal(&'static str),

    /// Backing store failed
    #[error(transparent)]
    Store(EventStoreError),

    /// Optimistic retries exhausted
    #[error("flow write contention exceeded after {0} attempts")]
    Contention(u32),
}

impl From<AggregateError<FlowError>> for FlowError {
    fn from(error: AggregateError<FlowError>) -> Self {
        match error {
            AggregateError::Store(e) => Self::Store(e),
            AggregateError::ContentionExceeded(n) => Self::Contention(n),
            AggregateError::Command(e) => e,
        }
    }
}

// =============================================================================
// Requests and Queries
// =============================================================================

/// Request to start a flow
#[derive(Debug, Clone, Deserialize)]
pub struct StartFlow {
    /// Raw flow id; sanitized before use
    pub id: String,

    /// Goal step ids
    pub goals: Vec<String>,

    /// Initial attribute state
    #[serde(default)]
    pub init: BTreeMap<String, serde_json::Value>,

    /// Free-form labels for querying
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Sort order for flow queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowSort {
    /// Most recently started first
    #[default]
    StartedAt,
    /// Flow id, ascending
    Id,
}

/// Filters for listing flows
#[derive(Debug, Clone, Default)]
pub struct FlowQuery {
    /// Every given label pair must match
    pub labels: BTreeMap<String, String>,

    /// Statuses to include; empty means all
    pub statuses: Vec<FlowStatus>,

    /// Literal prefix on the sanitized id
    pub id_prefix: Option<String>,

    pub sort: FlowSort,

    pub limit: Option<usize>,
}

// =============================================================================
// Dispatch planning (pure command helpers)
// =============================================================================

/// One work item to dispatch
struct WorkDispatch {
    token: String,
    inputs: BTreeMap<String, serde_json::Value>,
}

/// One step invocation decided by a dispatch transaction
struct Dispatch {
    step: Step,
    inputs: BTreeMap<String, serde_json::Value>,
    /// Work items for async steps; empty for sync and script
    items: Vec<WorkDispatch>,
}

fn mint_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Work items for an async dispatch, fanning out over a list input
fn work_items_for(
    step: &Step,
    inputs: &BTreeMap<String, serde_json::Value>,
) -> Result<Vec<WorkDispatch>, String> {
    let Some(fanout) = step.fanout_input() else {
        return Ok(vec![WorkDispatch {
            token: mint_token(),
            inputs: inputs.clone(),
        }]);
    };

    match inputs.get(fanout) {
        Some(serde_json::Value::Array(elements)) if !elements.is_empty() => Ok(elements
            .iter()
            .map(|element| {
                let mut item_inputs = inputs.clone();
                item_inputs.insert(fanout.to_string(), element.clone());
                WorkDispatch {
                    token: mint_token(),
                    inputs: item_inputs,
                }
            })
            .collect()),
        Some(serde_json::Value::Array(_)) => {
            Err(format!("fan-out input '{fanout}' produced no elements"))
        }
        Some(_) => Err(format!("fan-out input '{fanout}' is not a list")),
        // An absent optional fan-out input degrades to a single item.
        None => Ok(vec![WorkDispatch {
            token: mint_token(),
            inputs: inputs.clone(),
        }]),
    }
}

/// Decide which pending steps to start.
///
/// A pending step is ready when every required input is in flow state.
/// Inputs are projected by copying present input-role values.
fn plan_dispatches(flow: &Flow) -> (Vec<FlowEvent>, Vec<Dispatch>) {
    if flow.status != FlowStatus::Active {
        return (Vec::new(), Vec::new());
    }

    let mut events = Vec::new();
    let mut dispatches = Vec::new();

    for step_id in flow.ready_steps() {
        let Some(step) = flow.plan.steps.get(&step_id) else {
            continue;
        };
        let inputs: BTreeMap<String, serde_json::Value> = step
            .input_names()
            .filter_map(|name| {
                flow.state
                    .get(name)
                    .map(|attribute| (name.to_string(), attribute.value.clone()))
            })
            .collect();

        events.push(FlowEvent::StepStarted {
            step_id: step_id.clone(),
            inputs: inputs.clone(),
        });

        if step.kind.is_async() {
            match work_items_for(step, &inputs) {
                Ok(items) => {
                    for item in &items {
                        events.push(FlowEvent::WorkItemStarted {
                            step_id: step_id.clone(),
                            token: item.token.clone(),
                            inputs: item.inputs.clone(),
                        });
                    }
                    dispatches.push(Dispatch {
                        step: step.clone(),
                        inputs,
                        items,
                    });
                }
                Err(error) => {
                    events.push(FlowEvent::StepFailed {
                        step_id: step_id.clone(),
                        error,
                    });
                }
            }
        } else {
            dispatches.push(Dispatch {
                step: step.clone(),
                inputs,
                items: Vec::new(),
            });
        }
    }

    (events, dispatches)
}

/// Whether a step's execution can still reach `completed`
fn can_complete(flow: &Flow, step_id: &str, memo: &mut HashMap<String, bool>) -> bool {
    if let Some(&known) = memo.get(step_id) {
        return known;
    }

    let result = match flow.executions.get(step_id).map(|e| e.status) {
        Some(ExecutionStatus::Completed | ExecutionStatus::Active) => true,
        Some(ExecutionStatus::Failed | ExecutionStatus::Skipped) | None => false,
        Some(ExecutionStatus::Pending) => flow.plan.steps.get(step_id).is_some_and(|step| {
            step.required_input_names().all(|name| {
                flow.state.contains_key(name)
                    || flow
                        .plan
                        .providers_of(name)
                        .iter()
                        .any(|provider| can_complete(flow, provider, memo))
            })
        }),
    };

    memo.insert(step_id.to_string(), result);
    result
}

/// Decide whether the flow terminates, and how.
fn plan_termination(flow: &Flow) -> Vec<FlowEvent> {
    if !flow.started() || flow.status != FlowStatus::Active {
        return Vec::new();
    }

    if flow.all_goals_completed() {
        return vec![FlowEvent::FlowCompleted];
    }

    let mut memo = HashMap::new();
    let unreachable: Vec<&String> = flow
        .plan
        .goals
        .iter()
        .filter(|goal| !can_complete(flow, goal, &mut memo))
        .collect();
    if unreachable.is_empty() {
        return Vec::new();
    }

    let error = flow
        .executions
        .iter()
        .find(|(_, execution)| execution.status == ExecutionStatus::Failed)
        .map(|(step_id, execution)| {
            format!(
                "step '{step_id}' failed: {}",
                execution.error.as_deref().unwrap_or("unknown error")
            )
        })
        .unwrap_or_else(|| format!("goal '{}' became unreachable", unreachable[0]));

    let mut events: Vec<FlowEvent> = flow
        .executions
        .iter()
        .filter(|(_, execution)| execution.status == ExecutionStatus::Pending)
        .map(|(step_id, _)| FlowEvent::StepSkipped {
            step_id: step_id.clone(),
            reason: "goal unreachable after failure".to_string(),
        })
        .collect();
    events.push(FlowEvent::FlowFailed { error });
    events
}

/// Validate a completion or failure target and return the async token, if
/// this step uses work items.
fn guard_work<'a>(
    flow: &Flow,
    step_id: &str,
    token: Option<&'a str>,
) -> Result<Option<&'a str>, FlowError> {
    if !flow.started() {
        return Err(FlowError::NotFound(flow.id.clone()));
    }
    if flow.status != FlowStatus::Active {
        return Err(FlowError::FlowTerminal(flow.status.name()));
    }

    let execution = flow
        .executions
        .get(step_id)
        .ok_or_else(|| FlowError::StepNotFound(step_id.to_string()))?;
    let step = flow
        .plan
        .steps
        .get(step_id)
        .ok_or_else(|| FlowError::StepNotFound(step_id.to_string()))?;

    if step.kind.is_async() {
        let token = token.ok_or(FlowError::InvalidToken)?;
        let item = execution
            .work_items
            .get(token)
            .ok_or(FlowError::InvalidToken)?;
        item.guard_transition()
            .map_err(|_| FlowError::WorkItemTerminal(item.status.name().to_string()))?;
        if execution.status != ExecutionStatus::Active {
            return Err(FlowError::ExecutionNotActive(step_id.to_string()));
        }
        Ok(Some(token))
    } else {
        execution
            .guard_transition(ExecutionStatus::Completed)
            .map_err(|_| FlowError::ExecutionNotActive(step_id.to_string()))?;
        Ok(None)
    }
}

/// Events for a successful completion of a work item or execution
fn plan_completion(
    flow: &Flow,
    step_id: &str,
    token: Option<&str>,
    outputs: &BTreeMap<String, serde_json::Value>,
) -> Result<Vec<FlowEvent>, FlowError> {
    let token = guard_work(flow, step_id, token)?;

    // Attribute write-once scan: equal values are skipped, a differing
    // value fails the flow.
    let mut writes = Vec::new();
    for (name, value) in outputs {
        match flow.state.get(name) {
            None => writes.push(FlowEvent::AttributeSet {
                name: name.clone(),
                value: value.clone(),
                step_id: Some(step_id.to_string()),
            }),
            Some(existing) if existing.value == *value => {}
            Some(_) => {
                let error = format!("conflicting attribute '{name}' from step '{step_id}'");
                // Write-once is a per-attribute rule: keys already accepted
                // from this completion stay written; only the conflicting
                // key and everything after it are abandoned.
                let mut events = std::mem::take(&mut writes);
                if let Some(token) = token {
                    events.push(FlowEvent::WorkItemFailed {
                        step_id: step_id.to_string(),
                        token: token.to_string(),
                        error: error.clone(),
                    });
                }
                events.push(FlowEvent::StepFailed {
                    step_id: step_id.to_string(),
                    error: error.clone(),
                });
                events.extend(
                    flow.executions
                        .iter()
                        .filter(|(_, e)| e.status == ExecutionStatus::Pending)
                        .map(|(id, _)| FlowEvent::StepSkipped {
                            step_id: id.clone(),
                            reason: "flow failed".to_string(),
                        }),
                );
                events.push(FlowEvent::FlowFailed { error });
                return Ok(events);
            }
        }
    }

    let mut events = writes;
    if let Some(token) = token {
        events.push(FlowEvent::WorkItemCompleted {
            step_id: step_id.to_string(),
            token: token.to_string(),
            outputs: outputs.clone(),
        });

        // The execution completes once every work item is terminal and
        // none failed, counting this completion.
        let execution = &flow.executions[step_id];
        let others_terminal = execution
            .work_items
            .iter()
            .filter(|(t, _)| t.as_str() != token)
            .all(|(_, item)| item.status.is_terminal());
        if others_terminal && !execution.any_work_item_failed() {
            let mut merged = BTreeMap::new();
            for item in execution.work_items.values() {
                if item.status == WorkItemStatus::Completed {
                    if let Some(item_outputs) = &item.outputs {
                        merged.extend(item_outputs.clone());
                    }
                }
            }
            merged.extend(outputs.clone());
            events.push(FlowEvent::StepCompleted {
                step_id: step_id.to_string(),
                outputs: merged,
            });
        }
    } else {
        events.push(FlowEvent::StepCompleted {
            step_id: step_id.to_string(),
            outputs: outputs.clone(),
        });
    }

    Ok(events)
}

/// Events for a failed work item or execution.
///
/// The retry hook sits here: with a retry policy the item would be
/// redispatched instead; the default policy is zero retries.
fn plan_failure(
    flow: &Flow,
    step_id: &str,
    token: Option<&str>,
    error: &str,
) -> Result<Vec<FlowEvent>, FlowError> {
    let token = guard_work(flow, step_id, token)?;

    let mut events = Vec::new();
    if let Some(token) = token {
        events.push(FlowEvent::WorkItemFailed {
            step_id: step_id.to_string(),
            token: token.to_string(),
            error: error.to_string(),
        });
    }
    events.push(FlowEvent::StepFailed {
        step_id: step_id.to_string(),
        error: error.to_string(),
    });
    Ok(events)
}

// =============================================================================
// Flow Engine
// =============================================================================

/// Drives flow aggregates; one instance per process
pub struct FlowEngine {
    store: Arc<dyn EventStore>,
    invoker: Arc<dyn StepInvoker>,
    /// Public base URL for webhook callbacks, e.g. `http://host:3000`
    callback_base: String,
    flows: RwLock<BTreeMap<String, Arc<Aggregator<Flow>>>>,
}

impl FlowEngine {
    /// Create a flow engine over the given store and invoker
    #[must_use]
    pub fn new(
        store: Arc<dyn EventStore>,
        invoker: Arc<dyn StepInvoker>,
        callback_base: String,
    ) -> Self {
        Self {
            store,
            invoker,
            callback_base: callback_base.trim_end_matches('/').to_string(),
            flows: RwLock::new(BTreeMap::new()),
        }
    }

    async fn aggregator_for(&self, flow_id: &str) -> Arc<Aggregator<Flow>> {
        let mut flows = self.flows.write().await;
        Arc::clone(flows.entry(flow_id.to_string()).or_insert_with(|| {
            Arc::new(Aggregator::new(
                Arc::clone(&self.store),
                AggregateId::flow(flow_id),
            ))
        }))
    }

    async fn existing(&self, flow_id: &str) -> Option<Arc<Aggregator<Flow>>> {
        self.flows.read().await.get(flow_id).cloned()
    }

    /// Start a flow against the given catalog steps.
    ///
    /// Fails before writing any event if the id is invalid, the plan cannot
    /// be derived, or required inputs are missing.
    pub async fn start(
        self: &Arc<Self>,
        catalog: &BTreeMap<String, Step>,
        request: StartFlow,
    ) -> Result<Flow, FlowError> {
        let id = strand_domain::flow_id(&request.id)?;
        let plan = planner::plan(catalog, &request.goals, &request.init)?;
        if !plan.required.is_empty() {
            return Err(FlowError::MissingRequired {
                missing: plan.required.iter().cloned().collect(),
            });
        }

        let aggregator = self.aggregator_for(&id).await;
        aggregator
            .transact(|flow: &Flow| {
                if flow.started() {
                    return Err(FlowError::Exists(id.clone()));
                }
                Ok((
                    vec![FlowEvent::FlowStarted {
                        flow_id: id.clone(),
                        plan: plan.clone(),
                        init: request.init.clone(),
                        labels: request.labels.clone(),
                    }],
                    (),
                ))
            })
            .await
            .map_err(FlowError::from)?;

        self.pump(&id).await?;
        self.get(&id).await
    }

    /// Record a successful completion for a work item (async, with token)
    /// or an execution (sync/script, token `None`), then advance the flow.
    pub async fn complete_work(
        self: &Arc<Self>,
        flow_id: &str,
        step_id: &str,
        token: Option<&str>,
        outputs: BTreeMap<String, serde_json::Value>,
    ) -> Result<(), FlowError> {
        self.complete_inner(flow_id, step_id, token, &outputs).await?;
        self.pump(flow_id).await
    }

    /// Record a failure, then advance the flow (skips and termination).
    pub async fn fail_work(
        self: &Arc<Self>,
        flow_id: &str,
        step_id: &str,
        token: Option<&str>,
        error: String,
    ) -> Result<(), FlowError> {
        self.fail_inner(flow_id, step_id, token, &error).await?;
        self.pump(flow_id).await
    }

    async fn complete_inner(
        &self,
        flow_id: &str,
        step_id: &str,
        token: Option<&str>,
        outputs: &BTreeMap<String, serde_json::Value>,
    ) -> Result<(), FlowError> {
        let aggregator = self
            .existing(flow_id)
            .await
            .ok_or_else(|| FlowError::NotFound(flow_id.to_string()))?;
        aggregator
            .transact(|flow: &Flow| {
                plan_completion(flow, step_id, token, outputs).map(|events| (events, ()))
            })
            .await
            .map_err(FlowError::from)
    }

    async fn fail_inner(
        &self,
        flow_id: &str,
        step_id: &str,
        token: Option<&str>,
        error: &str,
    ) -> Result<(), FlowError> {
        let aggregator = self
            .existing(flow_id)
            .await
            .ok_or_else(|| FlowError::NotFound(flow_id.to_string()))?;
        aggregator
            .transact(|flow: &Flow| {
                plan_failure(flow, step_id, token, error).map(|events| (events, ()))
            })
            .await
            .map_err(FlowError::from)
    }

    /// Advance the flow until no more steps can be dispatched, invoking
    /// sync and script steps inline and spawning async dispatches.
    async fn pump(self: &Arc<Self>, flow_id: &str) -> Result<(), FlowError> {
        let Some(aggregator) = self.existing(flow_id).await else {
            return Ok(());
        };

        loop {
            let dispatches = aggregator
                .transact(|flow: &Flow| Ok::<_, FlowError>(plan_dispatches(flow)))
                .await
                .map_err(FlowError::from)?;

            if dispatches.is_empty() {
                aggregator
                    .transact(|flow: &Flow| Ok::<_, FlowError>((plan_termination(flow), ())))
                    .await
                    .map_err(FlowError::from)?;
                return Ok(());
            }

            for dispatch in dispatches {
                match &dispatch.step.kind {
                    StepKind::Sync { .. } | StepKind::Script { .. } => {
                        let disposition = self
                            .invoker
                            .invoke(
                                &dispatch.step,
                                InvokeContext {
                                    inputs: &dispatch.inputs,
                                    token: None,
                                    callback_url: None,
                                },
                            )
                            .await;
                        match disposition {
                            Disposition::Completed { outputs } => {
                                self.complete_inner(flow_id, &dispatch.step.id, None, &outputs)
                                    .await?;
                            }
                            Disposition::Failed { error } => {
                                self.fail_inner(flow_id, &dispatch.step.id, None, &error)
                                    .await?;
                            }
                            Disposition::Dispatched => {
                                self.fail_inner(
                                    flow_id,
                                    &dispatch.step.id,
                                    None,
                                    "invoker dispatched a non-async step",
                                )
                                .await?;
                            }
                        }
                    }
                    StepKind::Async { .. } => {
                        for item in dispatch.items {
                            self.spawn_async_dispatch(
                                flow_id.to_string(),
                                dispatch.step.clone(),
                                item,
                            );
                        }
                    }
                }
            }
        }
    }

    fn spawn_async_dispatch(self: &Arc<Self>, flow_id: String, step: Step, item: WorkDispatch) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let callback_url = format!(
                "{}/webhook/{}/{}/{}",
                engine.callback_base, flow_id, step.id, item.token
            );
            let disposition = engine
                .invoker
                .invoke(
                    &step,
                    InvokeContext {
                        inputs: &item.inputs,
                        token: Some(&item.token),
                        callback_url: Some(&callback_url),
                    },
                )
                .await;

            let result = match disposition {
                // Accepted; the completion arrives via webhook.
                Disposition::Dispatched => Ok(()),
                // The endpoint answered inline; treat it as the callback.
                Disposition::Completed { outputs } => {
                    engine
                        .complete_work(&flow_id, &step.id, Some(&item.token), outputs)
                        .await
                }
                Disposition::Failed { error } => {
                    engine
                        .fail_work(&flow_id, &step.id, Some(&item.token), error)
                        .await
                }
            };
            if let Err(error) = result {
                tracing::warn!(
                    flow = %flow_id,
                    step = %step.id,
                    %error,
                    "async dispatch result could not be recorded"
                );
            }
        });
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Current state of a flow
    pub async fn get(&self, flow_id: &str) -> Result<Flow, FlowError> {
        let aggregator = self
            .existing(flow_id)
            .await
            .ok_or_else(|| FlowError::NotFound(flow_id.to_string()))?;
        let (flow, _) = aggregator.state().await.map_err(FlowError::Store)?;
        if flow.started() {
            Ok(flow)
        } else {
            Err(FlowError::NotFound(flow_id.to_string()))
        }
    }

    /// Snapshot for subscriptions: the projection (if the flow has started)
    /// and the aggregate's next sequence.
    pub async fn snapshot(&self, flow_id: &str) -> Result<(Option<Flow>, i64), EventStoreError> {
        match self.existing(flow_id).await {
            Some(aggregator) => {
                let (flow, next_sequence) = aggregator.state().await?;
                Ok((flow.started().then_some(flow), next_sequence))
            }
            None => {
                let next_sequence = self
                    .store
                    .current_sequence(&AggregateId::flow(flow_id))
                    .await?;
                Ok((None, next_sequence))
            }
        }
    }

    /// List flows matching the query
    pub async fn query(&self, query: &FlowQuery) -> Result<Vec<Flow>, FlowError> {
        let aggregators: Vec<Arc<Aggregator<Flow>>> =
            self.flows.read().await.values().cloned().collect();

        let mut flows = Vec::new();
        for aggregator in aggregators {
            let (flow, _) = aggregator.state().await.map_err(FlowError::Store)?;
            if !flow.started() {
                continue;
            }
            if !query.statuses.is_empty() && !query.statuses.contains(&flow.status) {
                continue;
            }
            if let Some(prefix) = &query.id_prefix {
                if !flow.id.starts_with(prefix.as_str()) {
                    continue;
                }
            }
            if !query
                .labels
                .iter()
                .all(|(key, value)| flow.labels.get(key) == Some(value))
            {
                continue;
            }
            flows.push(flow);
        }

        match query.sort {
            FlowSort::StartedAt => flows.sort_by(|a, b| {
                b.started_at
                    .cmp(&a.started_at)
                    .then_with(|| a.id.cmp(&b.id))
            }),
            FlowSort::Id => flows.sort_by(|a, b| a.id.cmp(&b.id)),
        }
        if let Some(limit) = query.limit {
            flows.truncate(limit);
        }
        Ok(flows)
    }

    /// Whether any active flow's plan references the step
    pub async fn step_in_use(&self, step_id: &str) -> Result<bool, FlowError> {
        let aggregators: Vec<Arc<Aggregator<Flow>>> =
            self.flows.read().await.values().cloned().collect();

        for aggregator in aggregators {
            let (flow, _) = aggregator.state().await.map_err(FlowError::Store)?;
            if flow.started() && flow.status == FlowStatus::Active && flow.plan.contains(step_id) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::event::{EventHub, MemoryEventStore};
    use strand_domain::{AttributeSpec, HttpConfig, ValueType};

    /// Invoker scripted per step id; async steps default to `Dispatched`.
    struct FakeInvoker {
        responses: Mutex<StdHashMap<String, Disposition>>,
    }

    impl FakeInvoker {
        fn new() -> Self {
            Self {
                responses: Mutex::new(StdHashMap::new()),
            }
        }

        fn completes(self, step_id: &str, outputs: serde_json::Value) -> Self {
            let map: BTreeMap<String, serde_json::Value> =
                serde_json::from_value(outputs).unwrap();
            self.responses.lock().unwrap().insert(
                step_id.to_string(),
                Disposition::Completed { outputs: map },
            );
            self
        }

        fn fails(self, step_id: &str, error: &str) -> Self {
            self.responses.lock().unwrap().insert(
                step_id.to_string(),
                Disposition::Failed {
                    error: error.to_string(),
                },
            );
            self
        }
    }

    #[async_trait]
    impl StepInvoker for FakeInvoker {
        async fn invoke(&self, step: &Step, _ctx: InvokeContext<'_>) -> Disposition {
            self.responses
                .lock()
                .unwrap()
                .get(&step.id)
                .cloned()
                .unwrap_or(Disposition::Dispatched)
        }
    }

    fn sync_step(id: &str, requires: &[&str], outputs: &[&str]) -> Step {
        let mut attributes = BTreeMap::new();
        for name in requires {
            attributes.insert((*name).to_string(), AttributeSpec::required(ValueType::Any));
        }
        for name in outputs {
            attributes.insert((*name).to_string(), AttributeSpec::output(ValueType::Any));
        }
        Step {
            id: id.to_string(),
            name: id.to_string(),
            kind: StepKind::Sync {
                http: HttpConfig {
                    endpoint: format!("http://svc/{id}"),
                    health_check: None,
                    timeout_secs: None,
                },
            },
            attributes,
        }
    }

    fn async_step(id: &str, requires: &[&str], outputs: &[&str]) -> Step {
        let mut step = sync_step(id, requires, outputs);
        step.kind = StepKind::Async {
            http: HttpConfig {
                endpoint: format!("http://svc/{id}"),
                health_check: None,
                timeout_secs: None,
            },
        };
        step
    }

    fn engine(invoker: FakeInvoker) -> (Arc<FlowEngine>, Arc<MemoryEventStore>) {
        let hub = Arc::new(EventHub::new());
        let store = Arc::new(MemoryEventStore::new(hub));
        let flow_engine = Arc::new(FlowEngine::new(
            Arc::clone(&store) as Arc<dyn EventStore>,
            Arc::new(invoker),
            "http://localhost:3000".to_string(),
        ));
        (flow_engine, store)
    }

    fn catalog(steps: Vec<Step>) -> BTreeMap<String, Step> {
        steps.into_iter().map(|s| (s.id.clone(), s)).collect()
    }

    fn start_request(id: &str, goals: &[&str]) -> StartFlow {
        StartFlow {
            id: id.to_string(),
            goals: goals.iter().map(|g| (*g).to_string()).collect(),
            init: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_single_sync_step_completes_flow() {
        let invoker = FakeInvoker::new().completes("greet", serde_json::json!({"message": "hi"}));
        let (engine, _) = engine(invoker);
        let catalog = catalog(vec![sync_step("greet", &[], &["message"])]);

        let flow = engine
            .start(&catalog, start_request("f1", &["greet"]))
            .await
            .unwrap();

        assert_eq!(flow.status, FlowStatus::Completed);
        assert_eq!(flow.state["message"].value, serde_json::json!("hi"));
        assert_eq!(flow.executions["greet"].status, ExecutionStatus::Completed);
        assert!(flow.completed_at.unwrap() >= flow.started_at);
        assert!(flow.error.is_none());
    }

    #[tokio::test]
    async fn test_two_step_chain_event_order() {
        let invoker = FakeInvoker::new()
            .completes("a", serde_json::json!({"x": "1"}))
            .completes("b", serde_json::json!({"y": "2"}));
        let (engine, store) = engine(invoker);
        let catalog = catalog(vec![
            sync_step("a", &[], &["x"]),
            sync_step("b", &["x"], &["y"]),
        ]);

        engine
            .start(&catalog, start_request("f2", &["b"]))
            .await
            .unwrap();

        let events = store
            .events(&AggregateId::flow("f2"), 0)
            .await
            .unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            types,
            vec![
                "flow_started",
                "step_started",
                "attribute_set",
                "step_completed",
                "step_started",
                "attribute_set",
                "step_completed",
                "flow_completed",
            ]
        );
        // Sequences are dense from 0.
        for (position, event) in events.iter().enumerate() {
            assert_eq!(event.sequence, position as i64);
        }
    }

    #[tokio::test]
    async fn test_missing_required_writes_no_events() {
        let (engine, store) = engine(FakeInvoker::new());
        let catalog = catalog(vec![sync_step("render", &["user_id"], &["page"])]);

        let err = engine
            .start(&catalog, start_request("f4", &["render"]))
            .await
            .unwrap_err();
        match err {
            FlowError::MissingRequired { missing } => {
                assert_eq!(missing, vec!["user_id".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            store.current_sequence(&AggregateId::flow("f4")).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_duplicate_start_conflicts() {
        let invoker = FakeInvoker::new().completes("greet", serde_json::json!({"message": "hi"}));
        let (engine, _) = engine(invoker);
        let catalog = catalog(vec![sync_step("greet", &[], &["message"])]);

        engine
            .start(&catalog, start_request("dup", &["greet"]))
            .await
            .unwrap();
        let err = engine
            .start(&catalog, start_request("dup", &["greet"]))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Exists(id) if id == "dup"));
    }

    #[tokio::test]
    async fn test_async_webhook_roundtrip() {
        let (engine, _) = engine(FakeInvoker::new());
        let catalog = catalog(vec![async_step("poll", &[], &["r"])]);

        let flow = engine
            .start(&catalog, start_request("f3", &["poll"]))
            .await
            .unwrap();
        assert_eq!(flow.status, FlowStatus::Active);
        let token = flow.executions["poll"]
            .work_items
            .keys()
            .next()
            .unwrap()
            .clone();

        engine
            .complete_work(
                "f3",
                "poll",
                Some(&token),
                BTreeMap::from([("r".to_string(), serde_json::json!("ok"))]),
            )
            .await
            .unwrap();

        let flow = engine.get("f3").await.unwrap();
        assert_eq!(flow.status, FlowStatus::Completed);
        assert_eq!(flow.state["r"].value, serde_json::json!("ok"));

        // A second completion of the same token is an invalid transition
        // and leaves the flow unchanged.
        let err = engine
            .complete_work("f3", "poll", Some(&token), BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::FlowTerminal("completed")));
    }

    #[tokio::test]
    async fn test_double_complete_same_token() {
        // Two async goals keep the flow active after the first completes,
        // so the second POST exercises the work-item guard itself.
        let (engine, _) = engine(FakeInvoker::new());
        let catalog = catalog(vec![
            async_step("one", &[], &["a"]),
            async_step("two", &[], &["b"]),
        ]);

        let flow = engine
            .start(&catalog, start_request("f", &["one", "two"]))
            .await
            .unwrap();
        let token = flow.executions["one"]
            .work_items
            .keys()
            .next()
            .unwrap()
            .clone();

        engine
            .complete_work(
                "f",
                "one",
                Some(&token),
                BTreeMap::from([("a".to_string(), serde_json::json!(1))]),
            )
            .await
            .unwrap();
        let before = engine.get("f").await.unwrap();

        let err = engine
            .complete_work(
                "f",
                "one",
                Some(&token),
                BTreeMap::from([("a".to_string(), serde_json::json!(2))]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::WorkItemTerminal(status) if status == "completed"));
        assert_eq!(engine.get("f").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_unknown_token_rejected() {
        let (engine, _) = engine(FakeInvoker::new());
        let catalog = catalog(vec![async_step("poll", &[], &["r"])]);
        engine
            .start(&catalog, start_request("f", &["poll"]))
            .await
            .unwrap();

        let err = engine
            .complete_work("f", "poll", Some("bogus"), BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::InvalidToken));
    }

    #[tokio::test]
    async fn test_fanout_one_item_per_element() {
        let (engine, _) = engine(FakeInvoker::new());
        let mut step = async_step("mapper", &[], &["done"]);
        step.attributes.insert(
            "items".to_string(),
            AttributeSpec::required(ValueType::List).with_fanout(),
        );
        let catalog = catalog(vec![step]);

        let mut request = start_request("fan", &["mapper"]);
        request.init.insert(
            "items".to_string(),
            serde_json::json!(["alpha", "beta", "gamma"]),
        );
        let flow = engine.start(&catalog, request).await.unwrap();

        let items = &flow.executions["mapper"].work_items;
        assert_eq!(items.len(), 3);
        let mut bound: Vec<serde_json::Value> = items
            .values()
            .map(|item| item.inputs["items"].clone())
            .collect();
        bound.sort_by_key(std::string::ToString::to_string);
        assert_eq!(
            bound,
            vec![
                serde_json::json!("alpha"),
                serde_json::json!("beta"),
                serde_json::json!("gamma")
            ]
        );

        // Completing every item with the same outputs completes the step.
        let tokens: Vec<String> = items.keys().cloned().collect();
        for token in &tokens {
            engine
                .complete_work(
                    "fan",
                    "mapper",
                    Some(token),
                    BTreeMap::from([("done".to_string(), serde_json::json!(true))]),
                )
                .await
                .unwrap();
        }
        let flow = engine.get("fan").await.unwrap();
        assert_eq!(flow.status, FlowStatus::Completed);
        assert_eq!(flow.executions["mapper"].status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_and_fails_flow() {
        let invoker = FakeInvoker::new().fails("a", "upstream exploded");
        let (engine, _) = engine(invoker);
        let catalog = catalog(vec![
            sync_step("a", &[], &["x"]),
            sync_step("b", &["x"], &["y"]),
        ]);

        let flow = engine
            .start(&catalog, start_request("f", &["b"]))
            .await
            .unwrap();

        assert_eq!(flow.status, FlowStatus::Failed);
        assert_eq!(flow.executions["a"].status, ExecutionStatus::Failed);
        assert_eq!(flow.executions["b"].status, ExecutionStatus::Skipped);
        assert!(flow.error.as_deref().unwrap().contains("upstream exploded"));
        assert!(flow.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_redundant_provider_failure_does_not_fail_flow() {
        // Both providers of 'x' dispatch; one fails, the other supplies the
        // value, so the goal still completes.
        let invoker = FakeInvoker::new()
            .fails("p1", "boom")
            .completes("p2", serde_json::json!({"x": "v"}))
            .completes("c", serde_json::json!({"y": "done"}));
        let (engine, _) = engine(invoker);
        let catalog = catalog(vec![
            sync_step("p1", &[], &["x"]),
            sync_step("p2", &[], &["x"]),
            sync_step("c", &["x"], &["y"]),
        ]);

        let flow = engine
            .start(&catalog, start_request("f", &["c"]))
            .await
            .unwrap();

        assert_eq!(flow.status, FlowStatus::Completed);
        assert_eq!(flow.executions["p1"].status, ExecutionStatus::Failed);
        assert_eq!(flow.executions["c"].status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_equal_value_from_second_provider_is_skipped() {
        let invoker = FakeInvoker::new()
            .completes("p1", serde_json::json!({"x": "same"}))
            .completes("p2", serde_json::json!({"x": "same"}))
            .completes("c", serde_json::json!({"y": "done"}));
        let (engine, _) = engine(invoker);
        let catalog = catalog(vec![
            sync_step("p1", &[], &["x"]),
            sync_step("p2", &[], &["x"]),
            sync_step("c", &["x"], &["y"]),
        ]);

        let flow = engine
            .start(&catalog, start_request("f", &["c"]))
            .await
            .unwrap();
        assert_eq!(flow.status, FlowStatus::Completed);
        assert_eq!(flow.state["x"].value, serde_json::json!("same"));
    }

    #[tokio::test]
    async fn test_conflicting_attribute_fails_flow() {
        let invoker = FakeInvoker::new()
            .completes("p1", serde_json::json!({"x": "one"}))
            .completes("p2", serde_json::json!({"x": "two"}))
            .completes("c", serde_json::json!({"y": "done"}));
        let (engine, _) = engine(invoker);
        let catalog = catalog(vec![
            sync_step("p1", &[], &["x"]),
            sync_step("p2", &[], &["x"]),
            sync_step("c", &["x"], &["y"]),
        ]);

        let flow = engine
            .start(&catalog, start_request("f", &["c"]))
            .await
            .unwrap();
        assert_eq!(flow.status, FlowStatus::Failed);
        assert!(flow
            .error
            .as_deref()
            .unwrap()
            .contains("conflicting attribute 'x'"));
        // First write wins in state.
        assert_eq!(flow.state["x"].value, serde_json::json!("one"));
    }

    #[tokio::test]
    async fn test_earlier_outputs_survive_same_call_conflict() {
        // One completion carries two outputs; 'm' is new, 'z' conflicts.
        // The 'm' write is kept, the conflict fails the step and the flow.
        let invoker = FakeInvoker::new()
            .completes("a-seed", serde_json::json!({"z": "1"}))
            .completes("b-multi", serde_json::json!({"m": "ok", "z": "2"}))
            .completes("c", serde_json::json!({"y": "done"}));
        let (engine, store) = engine(invoker);
        let catalog = catalog(vec![
            sync_step("a-seed", &[], &["z"]),
            sync_step("b-multi", &[], &["m", "z"]),
            sync_step("c", &["m", "z"], &["y"]),
        ]);

        let flow = engine
            .start(&catalog, start_request("f", &["c"]))
            .await
            .unwrap();

        assert_eq!(flow.status, FlowStatus::Failed);
        assert_eq!(flow.state["m"].value, serde_json::json!("ok"));
        assert_eq!(flow.state["z"].value, serde_json::json!("1"));
        assert_eq!(
            flow.executions["b-multi"].status,
            ExecutionStatus::Failed
        );
        assert!(flow
            .error
            .as_deref()
            .unwrap()
            .contains("conflicting attribute 'z'"));

        // The accepted write was committed as its own event.
        let events = store.events(&AggregateId::flow("f"), 0).await.unwrap();
        assert!(events.iter().any(|e| {
            e.event_type == "attribute_set" && e.data["name"] == "m"
        }));
    }

    #[tokio::test]
    async fn test_replay_reproduces_projection() {
        let invoker = FakeInvoker::new()
            .completes("a", serde_json::json!({"x": "1"}))
            .completes("b", serde_json::json!({"y": "2"}));
        let (engine, store) = engine(invoker);
        let catalog = catalog(vec![
            sync_step("a", &[], &["x"]),
            sync_step("b", &["x"], &["y"]),
        ]);

        let live = engine
            .start(&catalog, start_request("rp", &["b"]))
            .await
            .unwrap();

        let mut replayed = Flow::default();
        for envelope in store.events(&AggregateId::flow("rp"), 0).await.unwrap() {
            let payload = crate::event::DomainEvent::from_event(&envelope).unwrap();
            crate::aggregate::Projection::apply(&mut replayed, &envelope, &payload);
        }
        assert_eq!(replayed, live);
    }

    #[tokio::test]
    async fn test_query_filters_and_sort() {
        let invoker = FakeInvoker::new().completes("greet", serde_json::json!({"message": "hi"}));
        let (engine, _) = engine(invoker);
        let catalog = catalog(vec![sync_step("greet", &[], &["message"])]);

        for (id, team) in [("wf-a", "red"), ("wf-b", "blue"), ("other", "red")] {
            let mut request = start_request(id, &["greet"]);
            request
                .labels
                .insert("team".to_string(), team.to_string());
            engine.start(&catalog, request).await.unwrap();
        }

        let by_prefix = engine
            .query(&FlowQuery {
                id_prefix: Some("wf-".to_string()),
                sort: FlowSort::Id,
                ..Default::default()
            })
            .await
            .unwrap();
        let ids: Vec<&str> = by_prefix.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["wf-a", "wf-b"]);

        let by_label = engine
            .query(&FlowQuery {
                labels: BTreeMap::from([("team".to_string(), "red".to_string())]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_label.len(), 2);

        let limited = engine
            .query(&FlowQuery {
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_step_in_use_tracks_active_flows() {
        let (engine, _) = engine(FakeInvoker::new());
        let catalog = catalog(vec![async_step("poll", &[], &["r"])]);

        engine
            .start(&catalog, start_request("f", &["poll"]))
            .await
            .unwrap();
        assert!(engine.step_in_use("poll").await.unwrap());
        assert!(!engine.step_in_use("other").await.unwrap());

        let flow = engine.get("f").await.unwrap();
        let token = flow.executions["poll"]
            .work_items
            .keys()
            .next()
            .unwrap()
            .clone();
        engine
            .complete_work(
                "f",
                "poll",
                Some(&token),
                BTreeMap::from([("r".to_string(), serde_json::json!(1))]),
            )
            .await
            .unwrap();
        assert!(!engine.step_in_use("poll").await.unwrap());
    }
}
