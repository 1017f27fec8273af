//! Flow projection fold
//!
//! Rebuilds a [`Flow`] by folding its event history. The fold is total:
//! guard checks happen in the commands that raise events, never here, so
//! replaying a committed history always reproduces the live projection.

use strand_domain::{
    AttributeValue, Execution, ExecutionStatus, Flow, FlowStatus, WorkItem, WorkItemStatus,
};

use crate::aggregate::Projection;
use crate::event::{Event, FlowEvent};

impl Projection for Flow {
    type Event = FlowEvent;

    fn apply(&mut self, envelope: &Event, payload: &Self::Event) {
        match payload {
            FlowEvent::FlowStarted {
                flow_id,
                plan,
                init,
                labels,
            } => {
                self.id = flow_id.clone();
                self.status = FlowStatus::Active;
                self.plan = plan.clone();
                self.labels = labels.clone();
                self.started_at = envelope.timestamp;
                for (name, value) in init {
                    self.state.insert(
                        name.clone(),
                        AttributeValue {
                            value: value.clone(),
                            producing_step_id: None,
                        },
                    );
                }
                for step_id in plan.steps.keys() {
                    self.executions
                        .insert(step_id.clone(), Execution::default());
                }
            }

            FlowEvent::StepStarted { step_id, inputs } => {
                let execution = self.executions.entry(step_id.clone()).or_default();
                execution.status = ExecutionStatus::Active;
                execution.inputs = inputs.clone();
                execution.started_at = Some(envelope.timestamp);
            }

            FlowEvent::WorkItemStarted {
                step_id,
                token,
                inputs,
            } => {
                let execution = self.executions.entry(step_id.clone()).or_default();
                execution.work_items.insert(
                    token.clone(),
                    WorkItem {
                        token: token.clone(),
                        status: WorkItemStatus::Active,
                        inputs: inputs.clone(),
                        outputs: None,
                        error: None,
                        started_at: envelope.timestamp,
                        completed_at: None,
                    },
                );
            }

            FlowEvent::AttributeSet {
                name,
                value,
                step_id,
            } => {
                // Keys are write-once; commands skip equal re-writes and
                // fail the flow on conflicting ones.
                self.state.entry(name.clone()).or_insert(AttributeValue {
                    value: value.clone(),
                    producing_step_id: step_id.clone(),
                });
            }

            FlowEvent::WorkItemCompleted {
                step_id,
                token,
                outputs,
            } => {
                let execution = self.executions.entry(step_id.clone()).or_default();
                if let Some(item) = execution.work_items.get_mut(token) {
                    item.status = WorkItemStatus::Completed;
                    item.outputs = Some(outputs.clone());
                    item.completed_at = Some(envelope.timestamp);
                }
            }

            FlowEvent::WorkItemFailed {
                step_id,
                token,
                error,
            } => {
                let execution = self.executions.entry(step_id.clone()).or_default();
                if let Some(item) = execution.work_items.get_mut(token) {
                    item.status = WorkItemStatus::Failed;
                    item.error = Some(error.clone());
                    item.completed_at = Some(envelope.timestamp);
                }
            }

            FlowEvent::StepCompleted { step_id, outputs } => {
                let execution = self.executions.entry(step_id.clone()).or_default();
                execution.status = ExecutionStatus::Completed;
                execution.outputs = outputs.clone();
                execution.completed_at = Some(envelope.timestamp);
            }

            FlowEvent::StepFailed { step_id, error } => {
                let execution = self.executions.entry(step_id.clone()).or_default();
                execution.status = ExecutionStatus::Failed;
                execution.error = Some(error.clone());
                execution.completed_at = Some(envelope.timestamp);
            }

            FlowEvent::StepSkipped { step_id, reason } => {
                let execution = self.executions.entry(step_id.clone()).or_default();
                execution.status = ExecutionStatus::Skipped;
                execution.error = Some(reason.clone());
                execution.completed_at = Some(envelope.timestamp);
            }

            FlowEvent::FlowCompleted => {
                self.status = FlowStatus::Completed;
                self.completed_at = Some(envelope.timestamp);
            }

            FlowEvent::FlowFailed { error } => {
                self.status = FlowStatus::Failed;
                self.error = Some(error.clone());
                self.completed_at = Some(envelope.timestamp);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;
    use crate::event::{AggregateId, DomainEvent};

    fn fold(events: Vec<FlowEvent>) -> Flow {
        let mut flow = Flow::default();
        for (sequence, payload) in events.into_iter().enumerate() {
            let new_event = payload.to_new_event().unwrap();
            let envelope = Event {
                aggregate_id: AggregateId::flow("f"),
                sequence: sequence as i64,
                event_type: new_event.event_type,
                timestamp: Utc::now(),
                data: new_event.data,
            };
            flow.apply(&envelope, &payload);
        }
        flow
    }

    fn started(goals: &[&str], steps: Vec<strand_domain::Step>) -> FlowEvent {
        let catalog: BTreeMap<String, strand_domain::Step> =
            steps.into_iter().map(|s| (s.id.clone(), s)).collect();
        let goals: Vec<String> = goals.iter().map(|g| (*g).to_string()).collect();
        let plan = crate::planner::plan(&catalog, &goals, &BTreeMap::new()).unwrap();
        FlowEvent::FlowStarted {
            flow_id: "f".to_string(),
            plan,
            init: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }

    fn sync_step(id: &str, outputs: &[&str]) -> strand_domain::Step {
        use strand_domain::{AttributeSpec, HttpConfig, StepKind, ValueType};
        strand_domain::Step {
            id: id.to_string(),
            name: id.to_string(),
            kind: StepKind::Sync {
                http: HttpConfig {
                    endpoint: format!("http://svc/{id}"),
                    health_check: None,
                    timeout_secs: None,
                },
            },
            attributes: outputs
                .iter()
                .map(|o| ((*o).to_string(), AttributeSpec::output(ValueType::Any)))
                .collect(),
        }
    }

    #[test]
    fn test_fold_single_step_lifecycle() {
        let flow = fold(vec![
            started(&["greet"], vec![sync_step("greet", &["message"])]),
            FlowEvent::StepStarted {
                step_id: "greet".to_string(),
                inputs: BTreeMap::new(),
            },
            FlowEvent::AttributeSet {
                name: "message".to_string(),
                value: serde_json::json!("hi"),
                step_id: Some("greet".to_string()),
            },
            FlowEvent::StepCompleted {
                step_id: "greet".to_string(),
                outputs: BTreeMap::from([("message".to_string(), serde_json::json!("hi"))]),
            },
            FlowEvent::FlowCompleted,
        ]);

        assert_eq!(flow.status, FlowStatus::Completed);
        assert_eq!(flow.state["message"].value, serde_json::json!("hi"));
        assert_eq!(
            flow.executions["greet"].status,
            ExecutionStatus::Completed
        );
        assert!(flow.completed_at.is_some());
    }

    #[test]
    fn test_attribute_is_write_once_in_fold() {
        let flow = fold(vec![
            started(&["greet"], vec![sync_step("greet", &["message"])]),
            FlowEvent::AttributeSet {
                name: "message".to_string(),
                value: serde_json::json!("first"),
                step_id: Some("greet".to_string()),
            },
            FlowEvent::AttributeSet {
                name: "message".to_string(),
                value: serde_json::json!("second"),
                step_id: Some("other".to_string()),
            },
        ]);

        assert_eq!(flow.state["message"].value, serde_json::json!("first"));
        assert_eq!(
            flow.state["message"].producing_step_id.as_deref(),
            Some("greet")
        );
    }

    #[test]
    fn test_work_item_fold() {
        let flow = fold(vec![
            started(&["poll"], vec![sync_step("poll", &["r"])]),
            FlowEvent::StepStarted {
                step_id: "poll".to_string(),
                inputs: BTreeMap::new(),
            },
            FlowEvent::WorkItemStarted {
                step_id: "poll".to_string(),
                token: "t1".to_string(),
                inputs: BTreeMap::new(),
            },
            FlowEvent::WorkItemFailed {
                step_id: "poll".to_string(),
                token: "t1".to_string(),
                error: "timeout".to_string(),
            },
        ]);

        let item = &flow.executions["poll"].work_items["t1"];
        assert_eq!(item.status, WorkItemStatus::Failed);
        assert_eq!(item.error.as_deref(), Some("timeout"));
        assert!(item.completed_at.is_some());
    }
}
