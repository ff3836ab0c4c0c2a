//! Edge-binding construction and value propagation across the graph.

use std::collections::HashMap;

use indexmap::IndexMap;
use lattice_core::workflow::{
    MiddlewareSpec, NodeUi, PortBinding, WorkflowDefinition, extract_middleware_entries,
};
use serde_json::{Map, Value};

use crate::model::{BindingRoot, EdgeBinding, NodeState};
use crate::pointer::{get_nested, parse_binding_path, set_nested};
use crate::scope::{WorkflowScopeIndex, scope_hint_from_binding};

struct BindingResolution {
    node_id: String,
    root: BindingRoot,
    path: Vec<String>,
}

fn resolve_binding_reference(
    binding: &PortBinding,
    owning_node: &str,
    scope_index: Option<&WorkflowScopeIndex>,
) -> Option<BindingResolution> {
    let (root, path) = parse_binding_path(binding.path.as_deref()?)?;
    let node_id = match scope_index {
        Some(index) => index.resolve_node(scope_hint_from_binding(binding).as_ref(), Some(owning_node))?,
        None => owning_node.to_owned(),
    };
    Some(BindingResolution { node_id, root, path })
}

/// Port direction for binding lookup.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Input,
    Output,
}

fn ports_of(ui: &NodeUi, direction: Direction) -> &[lattice_core::workflow::PortDef] {
    match direction {
        Direction::Input => &ui.input_ports,
        Direction::Output => &ui.output_ports,
    }
}

/// Find the binding a `(node, port)` pair declares, following middleware
/// port handles of the form `mw:{middlewareId}:{direction}:{portKey}`.
///
/// Returns the binding and the node that owns it (the middleware id for
/// middleware handles).
fn resolve_port_binding<'a>(
    workflow: &'a WorkflowDefinition,
    node_id: &str,
    port_key: Option<&str>,
    direction: Direction,
) -> Option<(&'a PortBinding, String)> {
    let port_key = port_key?;
    let node = workflow.node(node_id)?;

    if let Some(rest) = port_key.strip_prefix("mw:") {
        let mut parts = rest.splitn(3, ':');
        let mw_id = parts.next()?;
        let handle_dir = parts.next()?;
        let mw_port_key = parts.next()?;
        let expected = match direction {
            Direction::Output => "output",
            Direction::Input => "input",
        };
        if handle_dir != expected {
            return None;
        }
        for spec in &node.middlewares {
            let MiddlewareSpec::Def(def) = spec else {
                continue;
            };
            if def.id != mw_id {
                continue;
            }
            let ui = def.ui.as_ref()?;
            for port in ports_of(ui, direction) {
                if port.key == mw_port_key {
                    return port.binding.as_ref().map(|binding| (binding, mw_id.to_owned()));
                }
            }
        }
        return None;
    }

    let ui = node.ui.as_ref()?;
    for port in ports_of(ui, direction) {
        if port.key == port_key {
            return port.binding.as_ref().map(|binding| (binding, node_id.to_owned()));
        }
    }
    None
}

/// Build the edge-binding table for a workflow.
///
/// Only edges whose two endpoints both declare port bindings produce
/// entries, and only `parameters` is a legal target root.
#[must_use]
pub fn build_edge_bindings_for_workflow(
    workflow: &WorkflowDefinition,
    scope_index: &WorkflowScopeIndex,
) -> HashMap<String, Vec<EdgeBinding>> {
    let node_ids: std::collections::HashSet<&str> =
        workflow.nodes.iter().map(|node| node.id.as_str()).collect();
    let mut middleware_ids: std::collections::HashSet<String> = std::collections::HashSet::new();
    for node in &workflow.nodes {
        let (ids, _) = extract_middleware_entries(&node.middlewares);
        middleware_ids.extend(ids);
    }
    let known =
        |node_id: &str| node_ids.contains(node_id) || middleware_ids.contains(node_id);

    let mut bindings: HashMap<String, Vec<EdgeBinding>> = HashMap::new();
    for edge in &workflow.edges {
        let Some((source_binding, source_owner)) = resolve_port_binding(
            workflow,
            &edge.source.node,
            edge.source.port.as_deref(),
            Direction::Output,
        ) else {
            continue;
        };
        let Some((target_binding, target_owner)) = resolve_port_binding(
            workflow,
            &edge.target.node,
            edge.target.port.as_deref(),
            Direction::Input,
        ) else {
            continue;
        };
        if !known(&source_owner) || !known(&target_owner) {
            continue;
        }

        // Middleware owners bypass the scope index: their ids never appear
        // in the workflow node set.
        let source_scope = node_ids.contains(source_owner.as_str()).then_some(scope_index);
        let target_scope = node_ids.contains(target_owner.as_str()).then_some(scope_index);
        let Some(source) = resolve_binding_reference(source_binding, &source_owner, source_scope)
        else {
            continue;
        };
        let Some(target) = resolve_binding_reference(target_binding, &target_owner, target_scope)
        else {
            continue;
        };
        if target.root != BindingRoot::Parameters {
            // Only parameter bindings are supported for edge propagation.
            continue;
        }

        bindings.entry(source.node_id.clone()).or_default().push(EdgeBinding {
            source_root: source.root,
            source_path: source.path,
            target_node: target.node_id,
            target_root: target.root,
            target_path: target.path,
        });
    }
    bindings
}

/// Apply the bindings sourced at `source_node_id` across `nodes`.
pub fn apply_bindings_for_graph(
    source_node_id: &str,
    bindings: &HashMap<String, Vec<EdgeBinding>>,
    nodes: &mut IndexMap<String, NodeState>,
) {
    let Some(entries) = bindings.get(source_node_id) else {
        return;
    };
    let entries = entries.clone();
    let Some(source) = nodes.get(source_node_id) else {
        return;
    };
    if source.result.is_none() && source.parameters.is_empty() {
        return;
    }
    let source_parameters = source.parameters.clone();
    let source_result = source.result.clone();

    for entry in entries {
        let container: Option<&Map<String, Value>> = match entry.source_root {
            BindingRoot::Parameters => Some(&source_parameters),
            BindingRoot::Results => source_result.as_ref().and_then(Value::as_object),
        };
        let Some(container) = container else {
            continue;
        };
        let Some(value) = get_nested(container, &entry.source_path) else {
            continue;
        };
        let Some(target) = nodes.get_mut(&entry.target_node) else {
            continue;
        };
        match entry.target_root {
            BindingRoot::Parameters => {
                set_nested(&mut target.parameters, &entry.target_path, value);
            }
            BindingRoot::Results => {
                if !matches!(target.result, Some(Value::Object(_))) {
                    target.result = Some(Value::Object(Map::new()));
                }
                if let Some(Value::Object(result)) = target.result.as_mut() {
                    set_nested(result, &entry.target_path, value);
                }
            }
        }
    }
}

/// Project a middleware's declared output-port bindings onto its host so
/// downstream edges see the emitted values.
pub fn apply_middleware_output_bindings(host: &mut NodeState, middleware: &NodeState) {
    let Some(def) = host
        .middleware_defs
        .iter()
        .find(|def| def.id == middleware.node_id)
    else {
        return;
    };
    let Some(ui) = &def.ui else {
        return;
    };
    for port in &ui.output_ports {
        let Some(raw_path) = port.binding.as_ref().and_then(|binding| binding.path.as_deref())
        else {
            continue;
        };
        let Some((root, path)) = parse_binding_path(raw_path) else {
            continue;
        };
        let source: Option<&Map<String, Value>> = match root {
            BindingRoot::Parameters => Some(&middleware.parameters),
            BindingRoot::Results => middleware.result.as_ref().and_then(Value::as_object),
        };
        let Some(source) = source else {
            continue;
        };
        let Some(value) = get_nested(source, &path) else {
            continue;
        };
        match root {
            BindingRoot::Parameters => {
                set_nested(&mut host.parameters, &path, value);
            }
            BindingRoot::Results => {
                if !matches!(host.result, Some(Value::Object(_))) {
                    host.result = Some(Value::Object(Map::new()));
                }
                if let Some(Value::Object(result)) = host.result.as_mut() {
                    set_nested(result, &path, value);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn bound_workflow() -> WorkflowDefinition {
        serde_json::from_value(serde_json::json!({
            "id": "wf",
            "nodes": [
                {
                    "id": "a",
                    "type": "t",
                    "ui": {"outputPorts": [{"key": "out", "binding": {"path": "results.value"}}]}
                },
                {
                    "id": "b",
                    "type": "t",
                    "ui": {"inputPorts": [{"key": "in", "binding": {"path": "parameters.input"}}]}
                }
            ],
            "edges": [
                {"source": {"node": "a", "port": "out"}, "target": {"node": "b", "port": "in"}}
            ]
        }))
        .unwrap()
    }

    fn nodes_for(workflow: &WorkflowDefinition) -> IndexMap<String, NodeState> {
        workflow
            .nodes
            .iter()
            .map(|node| (node.id.clone(), NodeState::new(node.id.clone(), node.id.clone())))
            .collect()
    }

    #[test]
    fn builds_binding_from_matching_ports() {
        let workflow = bound_workflow();
        let index = WorkflowScopeIndex::new(&workflow);
        let bindings = build_edge_bindings_for_workflow(&workflow, &index);
        let entries = bindings.get("a").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].source_root, BindingRoot::Results);
        assert_eq!(entries[0].target_node, "b");
        assert_eq!(entries[0].target_path, vec!["input"]);
    }

    #[test]
    fn edges_without_ports_produce_nothing() {
        let workflow: WorkflowDefinition = serde_json::from_value(serde_json::json!({
            "id": "wf",
            "nodes": [{"id": "a", "type": "t"}, {"id": "b", "type": "t"}],
            "edges": [{"source": {"node": "a"}, "target": {"node": "b"}}]
        }))
        .unwrap();
        let index = WorkflowScopeIndex::new(&workflow);
        assert!(build_edge_bindings_for_workflow(&workflow, &index).is_empty());
    }

    #[test]
    fn result_targets_are_rejected() {
        let workflow: WorkflowDefinition = serde_json::from_value(serde_json::json!({
            "id": "wf",
            "nodes": [
                {"id": "a", "type": "t", "ui": {"outputPorts": [{"key": "o", "binding": {"path": "results.v"}}]}},
                {"id": "b", "type": "t", "ui": {"inputPorts": [{"key": "i", "binding": {"path": "results.v"}}]}}
            ],
            "edges": [{"source": {"node": "a", "port": "o"}, "target": {"node": "b", "port": "i"}}]
        }))
        .unwrap();
        let index = WorkflowScopeIndex::new(&workflow);
        assert!(build_edge_bindings_for_workflow(&workflow, &index).is_empty());
    }

    #[test]
    fn apply_copies_value_into_target_parameters() {
        let workflow = bound_workflow();
        let index = WorkflowScopeIndex::new(&workflow);
        let bindings = build_edge_bindings_for_workflow(&workflow, &index);
        let mut nodes = nodes_for(&workflow);
        nodes.get_mut("a").unwrap().result = Some(serde_json::json!({"value": 42}));

        apply_bindings_for_graph("a", &bindings, &mut nodes);
        assert_eq!(
            nodes["b"].parameters.get("input"),
            Some(&serde_json::json!(42))
        );
    }

    #[test]
    fn apply_skips_missing_source_value() {
        let workflow = bound_workflow();
        let index = WorkflowScopeIndex::new(&workflow);
        let bindings = build_edge_bindings_for_workflow(&workflow, &index);
        let mut nodes = nodes_for(&workflow);
        nodes.get_mut("a").unwrap().result = Some(serde_json::json!({"other": 1}));

        apply_bindings_for_graph("a", &bindings, &mut nodes);
        assert!(nodes["b"].parameters.get("input").is_none());
    }

    #[test]
    fn middleware_handle_ports_resolve() {
        let workflow: WorkflowDefinition = serde_json::from_value(serde_json::json!({
            "id": "wf",
            "nodes": [
                {
                    "id": "h",
                    "type": "t",
                    "middlewares": [
                        {
                            "id": "mw-1",
                            "type": "mw",
                            "ui": {"outputPorts": [{"key": "emit", "binding": {"path": "results.token"}}]}
                        }
                    ]
                },
                {
                    "id": "b",
                    "type": "t",
                    "ui": {"inputPorts": [{"key": "in", "binding": {"path": "parameters.token"}}]}
                }
            ],
            "edges": [
                {"source": {"node": "h", "port": "mw:mw-1:output:emit"}, "target": {"node": "b", "port": "in"}}
            ]
        }))
        .unwrap();
        let index = WorkflowScopeIndex::new(&workflow);
        let bindings = build_edge_bindings_for_workflow(&workflow, &index);
        // The binding is keyed by the middleware id, so it fires when the
        // middleware node completes.
        let entries = bindings.get("mw-1").unwrap();
        assert_eq!(entries[0].target_node, "b");
    }

    #[test]
    fn middleware_output_projection_onto_host() {
        let def: lattice_core::workflow::MiddlewareDef = serde_json::from_value(serde_json::json!({
            "id": "mw-1",
            "type": "mw",
            "ui": {"outputPorts": [{"key": "emit", "binding": {"path": "results.token"}}]}
        }))
        .unwrap();
        let mut host = NodeState::new("h", "h");
        host.middleware_defs = vec![def];
        let mut middleware = NodeState::new("mw-1", "mw-1");
        middleware.result = Some(serde_json::json!({"token": "abc"}));

        apply_middleware_output_bindings(&mut host, &middleware);
        assert_eq!(
            host.result,
            Some(serde_json::json!({"token": "abc"}))
        );
    }
}
