//! Execution planner
//!
//! Pure function from (catalog, goals, initial state) to an execution plan:
//! the minimal dependency closure of the goals, the attribute
//! provider/consumer index, and the set of inputs the caller must supply.
//! Iteration is over sorted maps throughout, so identical inputs produce a
//! byte-identical plan.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::algo;
use petgraph::graph::DiGraph;
use thiserror::Error;

use strand_domain::{AttributeEdges, AttributeRole, ExecutionPlan, Step};

// =============================================================================
// Errors
// =============================================================================

/// Planner failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// A goal or required provider is not in the catalog
    #[error("step not found: '{step_id}'{}", suggestion.as_ref().map(|s| format!(" (did you mean '{s}'?)")).unwrap_or_default())]
    StepNotFound {
        step_id: String,
        suggestion: Option<String>,
    },

    /// The dependency closure contains a cycle
    #[error("cyclic plan involving steps: {}", cycle.join(" -> "))]
    CyclicPlan { cycle: Vec<String> },
}

/// Find the closest step id by Levenshtein distance, if reasonably similar
fn find_similar_step(target: &str, catalog: &BTreeMap<String, Step>) -> Option<String> {
    let mut best: Option<(&str, usize)> = None;

    for step_id in catalog.keys() {
        let distance = strsim::levenshtein(target, step_id);
        if distance <= 3 && best.is_none_or(|(_, d)| distance < d) {
            best = Some((step_id, distance));
        }
    }

    best.map(|(step_id, _)| step_id.to_string())
}

// =============================================================================
// Planner
// =============================================================================

/// Derive the execution plan for a set of goals.
///
/// Starting from the goals, each unsatisfied required input pulls in every
/// catalog step producing it. Optional inputs never force inclusion; they
/// are indexed only when their producer is already in the closure. The
/// resulting graph must be acyclic.
pub fn plan(
    catalog: &BTreeMap<String, Step>,
    goals: &[String],
    init: &BTreeMap<String, serde_json::Value>,
) -> Result<ExecutionPlan, PlanError> {
    // Dedupe goals preserving request order.
    let mut goal_list: Vec<String> = Vec::new();
    for goal in goals {
        if !goal_list.contains(goal) {
            goal_list.push(goal.clone());
        }
    }

    let mut steps: BTreeMap<String, Step> = BTreeMap::new();
    for goal in &goal_list {
        expand(catalog, init, goal, &mut steps)?;
    }

    // Attribute provider/consumer index over the included steps.
    let mut attributes: BTreeMap<String, AttributeEdges> = BTreeMap::new();
    for (step_id, step) in &steps {
        for (name, spec) in &step.attributes {
            let edges = attributes.entry(name.clone()).or_default();
            if spec.role == AttributeRole::Output {
                edges.providers.insert(step_id.clone());
            } else {
                edges.consumers.insert(step_id.clone());
            }
        }
    }

    // Required inputs the caller must supply: required-role, not initial,
    // not produced by any included step.
    let mut required: BTreeSet<String> = BTreeSet::new();
    for step in steps.values() {
        for name in step.required_input_names() {
            let provided = attributes
                .get(name)
                .is_some_and(|edges| !edges.providers.is_empty());
            if !init.contains_key(name) && !provided {
                required.insert(name.to_string());
            }
        }
    }

    check_acyclic(&steps, &attributes, init)?;

    Ok(ExecutionPlan {
        goals: goal_list,
        steps,
        attributes,
        required,
    })
}

/// Pull `step_id` and the providers of its unsatisfied required inputs into
/// the closure.
fn expand(
    catalog: &BTreeMap<String, Step>,
    init: &BTreeMap<String, serde_json::Value>,
    step_id: &str,
    steps: &mut BTreeMap<String, Step>,
) -> Result<(), PlanError> {
    if steps.contains_key(step_id) {
        return Ok(());
    }

    let step = catalog.get(step_id).ok_or_else(|| PlanError::StepNotFound {
        step_id: step_id.to_string(),
        suggestion: find_similar_step(step_id, catalog),
    })?;
    steps.insert(step_id.to_string(), step.clone());

    let required: Vec<String> = step
        .required_input_names()
        .map(str::to_string)
        .collect();
    for input in required {
        if init.contains_key(&input) {
            continue;
        }
        // All producers are retained; consumers accept the first value
        // written. Catalog iteration is sorted, keeping expansion stable.
        let providers: Vec<String> = catalog
            .iter()
            .filter(|(_, candidate)| candidate.produces(&input))
            .map(|(id, _)| id.clone())
            .collect();
        for provider in providers {
            expand(catalog, init, &provider, steps)?;
        }
    }

    Ok(())
}

/// Reject plans whose gating edges (provider -> consumer of a required,
/// non-initial input) form a cycle, naming the steps involved.
fn check_acyclic(
    steps: &BTreeMap<String, Step>,
    attributes: &BTreeMap<String, AttributeEdges>,
    init: &BTreeMap<String, serde_json::Value>,
) -> Result<(), PlanError> {
    let mut graph = DiGraph::<&str, ()>::new();
    let mut nodes = HashMap::new();
    for step_id in steps.keys() {
        let index = graph.add_node(step_id.as_str());
        nodes.insert(step_id.as_str(), index);
    }

    for (name, edges) in attributes {
        if init.contains_key(name) {
            continue;
        }
        for consumer in &edges.consumers {
            let gating = steps
                .get(consumer)
                .and_then(|step| step.attributes.get(name))
                .is_some_and(|spec| spec.role == AttributeRole::Required);
            if !gating {
                continue;
            }
            for provider in &edges.providers {
                if let (Some(&from), Some(&to)) =
                    (nodes.get(provider.as_str()), nodes.get(consumer.as_str()))
                {
                    graph.add_edge(from, to, ());
                }
            }
        }
    }

    if !algo::is_cyclic_directed(&graph) {
        return Ok(());
    }

    // Name the cycle: a non-trivial strongly connected component, or a
    // single step consuming its own output.
    let cycle = algo::kosaraju_scc(&graph)
        .into_iter()
        .find(|scc| scc.len() > 1)
        .map(|scc| scc.iter().map(|&i| graph[i].to_string()).collect())
        .unwrap_or_else(|| {
            graph
                .node_indices()
                .find(|&i| graph.find_edge(i, i).is_some())
                .map(|i| vec![graph[i].to_string()])
                .unwrap_or_default()
        });

    Err(PlanError::CyclicPlan { cycle })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use strand_domain::{AttributeSpec, HttpConfig, StepKind, ValueType};

    fn step(id: &str, requires: &[&str], optional: &[&str], outputs: &[&str]) -> Step {
        let mut attributes = BTreeMap::new();
        for name in requires {
            attributes.insert(
                (*name).to_string(),
                AttributeSpec::required(ValueType::Any),
            );
        }
        for name in optional {
            attributes.insert(
                (*name).to_string(),
                AttributeSpec::optional(ValueType::Any),
            );
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

    fn catalog(steps: Vec<Step>) -> BTreeMap<String, Step> {
        steps.into_iter().map(|s| (s.id.clone(), s)).collect()
    }

    fn goals(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_chain_closure() {
        let catalog = catalog(vec![
            step("a", &[], &[], &["x"]),
            step("b", &["x"], &[], &["y"]),
            step("unrelated", &[], &[], &["z"]),
        ]);

        let plan = plan(&catalog, &goals(&["b"]), &BTreeMap::new()).unwrap();
        assert_eq!(
            plan.steps.keys().collect::<Vec<_>>(),
            vec!["a", "b"],
            "closure pulls the provider and nothing else"
        );
        assert!(plan.required.is_empty());
        assert_eq!(
            plan.attributes["x"].providers,
            BTreeSet::from(["a".to_string()])
        );
        assert_eq!(
            plan.attributes["x"].consumers,
            BTreeSet::from(["b".to_string()])
        );
    }

    #[test]
    fn test_all_providers_retained() {
        let catalog = catalog(vec![
            step("p1", &[], &[], &["x"]),
            step("p2", &[], &[], &["x"]),
            step("c", &["x"], &[], &["y"]),
        ]);

        let plan = plan(&catalog, &goals(&["c"]), &BTreeMap::new()).unwrap();
        assert!(plan.contains("p1") && plan.contains("p2"));
        assert_eq!(plan.attributes["x"].providers.len(), 2);
    }

    #[test]
    fn test_optional_inputs_do_not_force_inclusion() {
        let catalog = catalog(vec![
            step("enricher", &[], &[], &["extra"]),
            step("c", &[], &["extra"], &["y"]),
        ]);

        let plan = plan(&catalog, &goals(&["c"]), &BTreeMap::new()).unwrap();
        assert!(!plan.contains("enricher"));
        // The optional input is still indexed for its consumer.
        assert_eq!(
            plan.attributes["extra"].consumers,
            BTreeSet::from(["c".to_string()])
        );
    }

    #[test]
    fn test_optional_provider_indexed_when_transitively_required() {
        let catalog = catalog(vec![
            step("a", &[], &[], &["x", "extra"]),
            step("b", &["x"], &["extra"], &["y"]),
        ]);

        let plan = plan(&catalog, &goals(&["b"]), &BTreeMap::new()).unwrap();
        assert!(plan.contains("a"));
        assert_eq!(
            plan.attributes["extra"].providers,
            BTreeSet::from(["a".to_string()])
        );
    }

    #[test]
    fn test_initial_state_short_circuits_providers() {
        let catalog = catalog(vec![
            step("fetch-user", &[], &[], &["user"]),
            step("render", &["user"], &[], &["page"]),
        ]);
        let init = BTreeMap::from([("user".to_string(), serde_json::json!({"id": 1}))]);

        let plan = plan(&catalog, &goals(&["render"]), &init).unwrap();
        assert!(!plan.contains("fetch-user"));
        assert!(plan.required.is_empty());
    }

    #[test]
    fn test_required_lists_unprovided_inputs() {
        let catalog = catalog(vec![step("render", &["user_id"], &[], &["page"])]);

        let plan = plan(&catalog, &goals(&["render"]), &BTreeMap::new()).unwrap();
        assert_eq!(plan.required, BTreeSet::from(["user_id".to_string()]));
    }

    #[test]
    fn test_step_not_found_with_suggestion() {
        let catalog = catalog(vec![step("render", &[], &[], &["page"])]);

        let err = plan(&catalog, &goals(&["rendr"]), &BTreeMap::new()).unwrap_err();
        match err {
            PlanError::StepNotFound {
                step_id,
                suggestion,
            } => {
                assert_eq!(step_id, "rendr");
                assert_eq!(suggestion.as_deref(), Some("render"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cycle_detected() {
        let catalog = catalog(vec![
            step("a", &["y"], &[], &["x"]),
            step("b", &["x"], &[], &["y"]),
        ]);

        let err = plan(&catalog, &goals(&["a"]), &BTreeMap::new()).unwrap_err();
        match err {
            PlanError::CyclicPlan { mut cycle } => {
                cycle.sort();
                assert_eq!(cycle, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_cycle_detected() {
        let catalog = catalog(vec![step("ouroboros", &["x"], &[], &["x"])]);

        let err = plan(&catalog, &goals(&["ouroboros"]), &BTreeMap::new()).unwrap_err();
        assert!(matches!(
            err,
            PlanError::CyclicPlan { ref cycle } if cycle == &vec!["ouroboros".to_string()]
        ));
    }

    #[test]
    fn test_initial_state_breaks_would_be_cycle() {
        // b -> a gating is cut because 'x' arrives in the initial state.
        let catalog = catalog(vec![
            step("a", &["y"], &[], &["x"]),
            step("b", &["x"], &[], &["y"]),
        ]);
        let init = BTreeMap::from([("x".to_string(), serde_json::json!(1))]);

        let plan = plan(&catalog, &goals(&["b"]), &init).unwrap();
        assert!(plan.contains("b"));
    }

    #[test]
    fn test_identical_inputs_yield_identical_plans() {
        let catalog = catalog(vec![
            step("a", &[], &[], &["x"]),
            step("b", &["x"], &[], &["y"]),
            step("c", &["x", "y"], &[], &["z"]),
        ]);
        let init = BTreeMap::new();

        let one = plan(&catalog, &goals(&["c", "b"]), &init).unwrap();
        let two = plan(&catalog, &goals(&["c", "b"]), &init).unwrap();
        assert_eq!(
            serde_json::to_string(&one).unwrap(),
            serde_json::to_string(&two).unwrap()
        );
        assert_eq!(one.goals, vec!["c".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_duplicate_goals_deduped() {
        let catalog = catalog(vec![step("a", &[], &[], &["x"])]);

        let plan = plan(&catalog, &goals(&["a", "a"]), &BTreeMap::new()).unwrap();
        assert_eq!(plan.goals, vec!["a".to_string()]);
    }
}
