//! Accept-time workflow validation
//!
//! Everything that can be rejected before an execution starts is
//! rejected here: malformed seed URLs, duplicate ids, dangling or cyclic
//! dependencies, unknown transition targets, invalid filter patterns and
//! per-node params the registry refuses. Run-time code can then assume a
//! well-formed document.

use regex::Regex;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use url::Url;

use super::types::{Node, Phase, Workflow};
use crate::nodes::NodeRegistry;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow has no start URLs")]
    NoStartUrls,

    #[error("start URL '{url}' is not an absolute URL: {reason}")]
    InvalidStartUrl { url: String, reason: String },

    #[error("duplicate phase id '{0}'")]
    DuplicatePhaseId(String),

    #[error("phase '{phase}' has duplicate node id '{node}'")]
    DuplicateNodeId { phase: String, node: String },

    #[error("phase '{phase}' node '{node}' depends on unknown node '{dependency}'")]
    UnknownDependency {
        phase: String,
        node: String,
        dependency: String,
    },

    #[error("phase '{phase}' has a dependency cycle involving node '{node}'")]
    DependencyCycle { phase: String, node: String },

    #[error("phase '{phase}' transition targets unknown phase '{target}'")]
    UnknownTransitionTarget { phase: String, target: String },

    #[error("phase '{phase}' URL filter pattern '{pattern}' is invalid: {reason}")]
    InvalidFilterPattern {
        phase: String,
        pattern: String,
        reason: String,
    },

    #[error("phase '{phase}' node '{node}' has invalid params: {reason}")]
    InvalidNodeParams {
        phase: String,
        node: String,
        reason: String,
    },
}

/// Validate a workflow against the registry and compile its filters.
///
/// Returns the first violation found; a workflow that passes is safe to
/// hand to the executor.
pub fn validate_workflow(
    workflow: &mut Workflow,
    registry: &NodeRegistry,
) -> Result<(), WorkflowError> {
    if workflow.start_urls.is_empty() {
        return Err(WorkflowError::NoStartUrls);
    }
    for url in &workflow.start_urls {
        Url::parse(url).map_err(|e| WorkflowError::InvalidStartUrl {
            url: url.clone(),
            reason: e.to_string(),
        })?;
    }

    let mut phase_ids = HashSet::new();
    for phase in &workflow.phases {
        if !phase_ids.insert(phase.id.clone()) {
            return Err(WorkflowError::DuplicatePhaseId(phase.id.clone()));
        }
    }

    for phase in &mut workflow.phases {
        validate_phase_nodes(phase, registry)?;
        compile_filter_patterns(phase)?;
    }

    for phase in &workflow.phases {
        if let Some(transition) = &phase.transition
            && !phase_ids.contains(&transition.next_phase_id)
        {
            return Err(WorkflowError::UnknownTransitionTarget {
                phase: phase.id.clone(),
                target: transition.next_phase_id.clone(),
            });
        }
    }

    Ok(())
}

fn validate_phase_nodes(phase: &Phase, registry: &NodeRegistry) -> Result<(), WorkflowError> {
    let mut seen = HashSet::new();
    for node in &phase.nodes {
        if !seen.insert(node.id.as_str()) {
            return Err(WorkflowError::DuplicateNodeId {
                phase: phase.id.clone(),
                node: node.id.clone(),
            });
        }
    }

    for node in &phase.nodes {
        for dependency in &node.dependencies {
            if !seen.contains(dependency.as_str()) {
                return Err(WorkflowError::UnknownDependency {
                    phase: phase.id.clone(),
                    node: node.id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
    }

    // A valid topological order existing is exactly "no cycles"
    topological_order(&phase.nodes).map_err(|node| WorkflowError::DependencyCycle {
        phase: phase.id.clone(),
        node,
    })?;

    for node in &phase.nodes {
        registry
            .validate(node.node_type, &node.params)
            .map_err(|e| WorkflowError::InvalidNodeParams {
                phase: phase.id.clone(),
                node: node.id.clone(),
                reason: e.to_string(),
            })?;
    }

    Ok(())
}

fn compile_filter_patterns(phase: &mut Phase) -> Result<(), WorkflowError> {
    let patterns = phase.url_filter.patterns.clone().unwrap_or_default();
    let mut compiled = Vec::with_capacity(patterns.len());
    for pattern in &patterns {
        let re = Regex::new(pattern).map_err(|e| WorkflowError::InvalidFilterPattern {
            phase: phase.id.clone(),
            pattern: pattern.clone(),
            reason: e.to_string(),
        })?;
        compiled.push(re);
    }
    phase.url_filter.compiled_patterns = compiled;
    Ok(())
}

/// Topological order over a phase's nodes with stable declaration-order
/// tie-breaking, as indexes into the slice.
///
/// On a cycle, returns the id of a node still blocked when the sort
/// stalls.
pub fn topological_order(nodes: &[Node]) -> Result<Vec<usize>, String> {
    let index_of: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.as_str(), i))
        .collect();

    let mut remaining_deps: Vec<usize> = nodes.iter().map(|n| n.dependencies.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        for dependency in &node.dependencies {
            if let Some(&d) = index_of.get(dependency.as_str()) {
                dependents[d].push(i);
            }
        }
    }

    let mut order = Vec::with_capacity(nodes.len());
    let mut emitted = vec![false; nodes.len()];

    // Kahn's algorithm, but each round scans in declaration order so
    // independent nodes stay serialized the way they were written.
    while order.len() < nodes.len() {
        let next = (0..nodes.len()).find(|&i| !emitted[i] && remaining_deps[i] == 0);
        match next {
            Some(i) => {
                emitted[i] = true;
                order.push(i);
                for &dependent in &dependents[i] {
                    remaining_deps[dependent] -= 1;
                }
            }
            None => {
                let blocked = (0..nodes.len())
                    .find(|&i| !emitted[i])
                    .map(|i| nodes[i].id.clone())
                    .unwrap_or_default();
                return Err(blocked);
            }
        }
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::{NodeRegistry, NodeType};

    fn node(id: &str, deps: &[&str]) -> Node {
        Node {
            id: id.to_string(),
            node_type: NodeType::Wait,
            params: serde_json::json!({ "duration_ms": 1 }),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            optional: false,
            retry: None,
            output_key: None,
        }
    }

    #[test]
    fn topological_order_is_stable() {
        // c depends on a; b is independent and declared between them
        let nodes = vec![node("a", &[]), node("b", &[]), node("c", &["a"])];
        let order = topological_order(&nodes).unwrap();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn topological_order_detects_cycles() {
        let nodes = vec![node("a", &["b"]), node("b", &["a"])];
        assert!(topological_order(&nodes).is_err());
    }

    #[test]
    fn topological_order_respects_dependencies() {
        let nodes = vec![node("late", &["early"]), node("early", &[])];
        let order = topological_order(&nodes).unwrap();
        assert_eq!(order, vec![1, 0]);
    }

    fn minimal_workflow(nodes: Vec<Node>) -> Workflow {
        serde_json::from_value::<Workflow>(serde_json::json!({
            "id": "wf",
            "start_urls": ["https://example.com"],
            "phases": []
        }))
        .map(|mut wf| {
            wf.phases = vec![Phase {
                id: "only".to_string(),
                kind: super::super::types::PhaseKind::Custom,
                url_filter: Default::default(),
                nodes,
                transition: None,
            }];
            wf
        })
        .unwrap()
    }

    #[test]
    fn validate_rejects_unknown_dependency() {
        let mut wf = minimal_workflow(vec![node("a", &["ghost"])]);
        let registry = NodeRegistry::standard();
        let err = validate_workflow(&mut wf, &registry).unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownDependency { .. }));
    }

    #[test]
    fn validate_rejects_relative_seed() {
        let mut wf = minimal_workflow(vec![]);
        wf.start_urls = vec!["/not/absolute".to_string()];
        let registry = NodeRegistry::standard();
        let err = validate_workflow(&mut wf, &registry).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidStartUrl { .. }));
    }

    #[test]
    fn validate_rejects_bad_filter_pattern() {
        let mut wf = minimal_workflow(vec![]);
        wf.phases[0].url_filter.patterns = Some(vec!["([".to_string()]);
        let registry = NodeRegistry::standard();
        let err = validate_workflow(&mut wf, &registry).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidFilterPattern { .. }));
    }

    #[test]
    fn validate_compiles_filter_patterns() {
        let mut wf = minimal_workflow(vec![]);
        wf.phases[0].url_filter.patterns = Some(vec![r"/p/\d+".to_string()]);
        let registry = NodeRegistry::standard();
        validate_workflow(&mut wf, &registry).unwrap();
        assert_eq!(wf.phases[0].url_filter.compiled_patterns.len(), 1);
    }
}
