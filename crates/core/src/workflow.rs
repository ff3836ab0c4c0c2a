//! The submitted workflow definition model.
//!
//! Mirrors the wire schema: camelCase field names, permissive extras, and
//! identifier fields that tolerate non-string JSON scalars (UUID-ish values
//! are normalised to strings on ingest so hashing and frame ids stay
//! deterministic).

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::{CONTAINER_NODE_TYPE, CONTAINER_PARAMS_KEY};

fn stringify_id<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let value = Value::deserialize(d)?;
    Ok(match value {
        Value::String(s) => s,
        other => other.to_string(),
    })
}

fn stringify_id_opt<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(d)?;
    Ok(value.map(|v| match v {
        Value::String(s) => s,
        other => other.to_string(),
    }))
}

/// A package reference `{name, version}`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PackageRef {
    /// Package name.
    pub name: String,
    /// Package version.
    pub version: String,
}

/// Scope qualifier attached to a port binding.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortBindingScope {
    /// Scope kind (`subgraph` or `local`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Raw prefix the scope was parsed from, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// Subgraph alias chain the binding is scoped to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subgraph_aliases: Vec<String>,
    /// Legacy single-alias field; folded into `subgraph_aliases` on use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_alias: Option<String>,
    /// Explicit node override inside the scoped subgraph.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

/// A declarative value binding on a node port.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortBinding {
    /// Dotted or JSON-pointer path rooted at `parameters`/`results`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Inline scope prefix (`@alias.#node` / `#node` forms).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// Structured scope, preferred over `prefix` when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<PortBindingScope>,
}

/// A named input or output port on a node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PortDef {
    /// Port key referenced by edges.
    pub key: String,
    /// Optional value binding evaluated on edge propagation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding: Option<PortBinding>,
}

/// UI metadata carrying the port declarations used for edge bindings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUi {
    /// Declared input ports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_ports: Vec<PortDef>,
    /// Declared output ports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_ports: Vec<PortDef>,
}

/// A fully specified middleware entry attached to a host node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MiddlewareDef {
    /// Middleware node id.
    #[serde(deserialize_with = "stringify_id")]
    pub id: String,
    /// Node type of the middleware.
    #[serde(rename = "type", default)]
    pub node_type: String,
    /// Package providing the middleware implementation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<PackageRef>,
    /// Middleware parameters.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    /// Port declarations used for output projection onto the host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<NodeUi>,
}

/// A middleware list entry: either a bare id or a full definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MiddlewareSpec {
    /// Reference by id only.
    Id(String),
    /// Inline definition.
    Def(MiddlewareDef),
}

/// Split middleware entries into their ordered ids and full definitions.
///
/// Bare-id entries yield a definition that carries only the id, so the two
/// vectors always line up index-for-index.
#[must_use]
pub fn extract_middleware_entries(entries: &[MiddlewareSpec]) -> (Vec<String>, Vec<MiddlewareDef>) {
    let mut ids = Vec::with_capacity(entries.len());
    let mut defs = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry {
            MiddlewareSpec::Id(id) => {
                if id.is_empty() {
                    continue;
                }
                ids.push(id.clone());
                defs.push(MiddlewareDef {
                    id: id.clone(),
                    ..MiddlewareDef::default()
                });
            }
            MiddlewareSpec::Def(def) => {
                if def.id.is_empty() {
                    continue;
                }
                ids.push(def.id.clone());
                defs.push(def.clone());
            }
        }
    }
    (ids, defs)
}

/// One endpoint of an edge: the node it touches and an optional port key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeEndpoint {
    /// Node id at this end of the edge.
    #[serde(deserialize_with = "stringify_id")]
    pub node: String,
    /// Port key on that node, when the edge carries a binding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
}

/// A directed dependency edge between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowEdge {
    /// Edge id, when assigned by the client.
    #[serde(default, deserialize_with = "stringify_id_opt", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Upstream endpoint.
    pub source: EdgeEndpoint,
    /// Downstream endpoint.
    pub target: EdgeEndpoint,
}

/// A node in the workflow graph.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowNode {
    /// Node id, unique within its graph.
    #[serde(deserialize_with = "stringify_id")]
    pub id: String,
    /// Node type, e.g. `example.pkg.task` or `workflow.container`.
    #[serde(rename = "type", default)]
    pub node_type: String,
    /// Package implementing the node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<PackageRef>,
    /// Initial node parameters.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    /// Ordered middleware chain wrapped around this node.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub middlewares: Vec<MiddlewareSpec>,
    /// Declared role hint carried into node metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Port declarations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<NodeUi>,
}

impl WorkflowNode {
    /// Returns `true` when this node is a subgraph container.
    #[must_use]
    pub fn is_container(&self) -> bool {
        self.node_type == CONTAINER_NODE_TYPE
            || self.role.as_deref() == Some("container")
    }

    /// Extract the subgraph id a container node points at, if declared.
    #[must_use]
    pub fn subgraph_id(&self) -> Option<String> {
        let container = self.parameters.get(CONTAINER_PARAMS_KEY)?.as_object()?;
        let value = container.get("subgraphId")?.as_str()?.trim();
        if value.is_empty() {
            None
        } else {
            Some(value.to_owned())
        }
    }
}

/// A reusable subgraph definition referenced by container nodes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSubgraph {
    /// Subgraph id.
    #[serde(deserialize_with = "stringify_id")]
    pub id: String,
    /// Human alias used for scoped bindings; defaults to the id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Parent alias for nested subgraphs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_alias: Option<String>,
    /// Free-form metadata (may carry `parentAlias` for legacy payloads).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    /// The subgraph's own workflow definition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<Box<WorkflowDefinition>>,
}

impl WorkflowSubgraph {
    /// The alias this subgraph is addressed by.
    #[must_use]
    pub fn effective_alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.id)
    }

    /// Parent alias, falling back to `metadata.parentAlias`.
    #[must_use]
    pub fn effective_parent_alias(&self) -> Option<&str> {
        if let Some(parent) = self.parent_alias.as_deref() {
            return Some(parent);
        }
        self.metadata.get("parentAlias").and_then(Value::as_str)
    }
}

/// A complete workflow definition as submitted by a client.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Workflow id.
    #[serde(deserialize_with = "stringify_id")]
    pub id: String,
    /// Wire schema version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    /// Graph nodes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<WorkflowNode>,
    /// Graph edges.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<WorkflowEdge>,
    /// Reusable subgraphs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subgraphs: Vec<WorkflowSubgraph>,
}

impl WorkflowDefinition {
    /// Find a node by id.
    #[must_use]
    pub fn node(&self, node_id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|node| node.id == node_id)
    }

    /// Find a subgraph by id.
    #[must_use]
    pub fn subgraph(&self, subgraph_id: &str) -> Option<&WorkflowSubgraph> {
        self.subgraphs.iter().find(|sub| sub.id == subgraph_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn deserialize_minimal_workflow() {
        let wf: WorkflowDefinition = serde_json::from_value(serde_json::json!({
            "id": "wf-1",
            "schemaVersion": "2025-10",
            "nodes": [
                {
                    "id": "a",
                    "type": "example.pkg.task",
                    "package": {"name": "example.pkg", "version": "1.0.0"}
                }
            ],
            "edges": []
        }))
        .unwrap();
        assert_eq!(wf.id, "wf-1");
        assert_eq!(wf.nodes.len(), 1);
        assert_eq!(wf.nodes[0].node_type, "example.pkg.task");
    }

    #[test]
    fn non_string_ids_are_stringified() {
        let wf: WorkflowDefinition = serde_json::from_value(serde_json::json!({
            "id": 42,
            "nodes": [{"id": 7, "type": "t"}],
            "edges": [{"source": {"node": 7}, "target": {"node": 7}}]
        }))
        .unwrap();
        assert_eq!(wf.id, "42");
        assert_eq!(wf.nodes[0].id, "7");
        assert_eq!(wf.edges[0].source.node, "7");
    }

    #[test]
    fn container_subgraph_id_extraction() {
        let node: WorkflowNode = serde_json::from_value(serde_json::json!({
            "id": "c",
            "type": "workflow.container",
            "parameters": {"__container": {"subgraphId": " sg-1 "}}
        }))
        .unwrap();
        assert!(node.is_container());
        assert_eq!(node.subgraph_id().as_deref(), Some("sg-1"));
    }

    #[test]
    fn container_without_subgraph_id() {
        let node = WorkflowNode {
            id: "c".into(),
            node_type: CONTAINER_NODE_TYPE.into(),
            ..WorkflowNode::default()
        };
        assert!(node.is_container());
        assert_eq!(node.subgraph_id(), None);
    }

    #[test]
    fn middleware_entries_accept_ids_and_defs() {
        let specs: Vec<MiddlewareSpec> = serde_json::from_value(serde_json::json!([
            "mw-1",
            {"id": "mw-2", "type": "mw.type", "parameters": {"k": 1}}
        ]))
        .unwrap();
        let (ids, defs) = extract_middleware_entries(&specs);
        assert_eq!(ids, vec!["mw-1", "mw-2"]);
        assert_eq!(defs[0].id, "mw-1");
        assert_eq!(defs[1].node_type, "mw.type");
        assert_eq!(defs[1].parameters.get("k"), Some(&serde_json::json!(1)));
    }

    #[test]
    fn middleware_entries_skip_empty_ids() {
        let specs = vec![MiddlewareSpec::Id(String::new())];
        let (ids, defs) = extract_middleware_entries(&specs);
        assert!(ids.is_empty());
        assert!(defs.is_empty());
    }

    #[test]
    fn subgraph_alias_fallbacks() {
        let sub: WorkflowSubgraph = serde_json::from_value(serde_json::json!({
            "id": "sg-1",
            "metadata": {"parentAlias": "outer"}
        }))
        .unwrap();
        assert_eq!(sub.effective_alias(), "sg-1");
        assert_eq!(sub.effective_parent_alias(), Some("outer"));
    }

    #[test]
    fn serde_roundtrip() {
        let wf: WorkflowDefinition = serde_json::from_value(serde_json::json!({
            "id": "wf",
            "nodes": [
                {
                    "id": "h",
                    "type": "t",
                    "middlewares": ["m1"],
                    "ui": {"outputPorts": [{"key": "out", "binding": {"path": "results.value"}}]}
                }
            ]
        }))
        .unwrap();
        let json = serde_json::to_string(&wf).unwrap();
        let back: WorkflowDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, wf);
    }
}
