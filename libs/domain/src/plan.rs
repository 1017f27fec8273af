//! Execution plans
//!
//! A plan is the immutable dependency closure of a set of goal steps plus an
//! attribute provider/consumer index. It is built once by the planner and
//! embedded verbatim in the flow's start event.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::step::Step;

/// Provider and consumer step sets for one attribute
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeEdges {
    /// Steps in the plan that output this attribute
    #[serde(default)]
    pub providers: BTreeSet<String>,

    /// Steps in the plan that consume this attribute
    #[serde(default)]
    pub consumers: BTreeSet<String>,
}

/// The dependency closure of a set of goals within a catalog
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Goal step ids, in request order
    pub goals: Vec<String>,

    /// Every step included in the closure, keyed by id
    pub steps: BTreeMap<String, Step>,

    /// Attribute name to provider/consumer index
    pub attributes: BTreeMap<String, AttributeEdges>,

    /// Required-role inputs that neither the initial state nor any included
    /// step supplies; the caller must provide these to start a flow
    pub required: BTreeSet<String>,
}

impl ExecutionPlan {
    /// Steps in the plan that output the attribute
    #[must_use]
    pub fn providers_of(&self, attribute: &str) -> &BTreeSet<String> {
        static EMPTY: BTreeSet<String> = BTreeSet::new();
        self.attributes
            .get(attribute)
            .map_or(&EMPTY, |edges| &edges.providers)
    }

    /// Whether the plan contains the step
    #[must_use]
    pub fn contains(&self, step_id: &str) -> bool {
        self.steps.contains_key(step_id)
    }
}
