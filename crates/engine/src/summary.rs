//! Client-facing projections of run state.

use chrono::{DateTime, Utc};
use lattice_core::{ErrorInfo, RunStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{NodeState, RunRecord};

/// Summary of one node, as exposed by run queries and snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSummary {
    /// Node id within its graph.
    pub node_id: String,
    /// Frame-scoped task id.
    pub task_id: String,
    /// Current status.
    pub status: RunStatus,
    /// Node type.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_type: String,
    /// Worker the node last ran on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_name: Option<String>,
    /// When the node started running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the node finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Owning frame, for frame-scoped nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<String>,
    /// Container that owns the frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_node_id: Option<String>,
    /// Result value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Metadata (stage/progress/message and merged adapter keys).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Node error, when failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Artifacts reported by the worker.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Value>,
}

impl NodeSummary {
    fn from_node(node: &NodeState) -> Self {
        Self {
            node_id: node.node_id.clone(),
            task_id: node.task_id.clone(),
            status: node.status,
            node_type: node.node_type.clone(),
            worker_name: node.worker_name.clone(),
            started_at: node.started_at,
            finished_at: node.finished_at,
            frame_id: node.frame_id.clone(),
            container_node_id: node.container_node_id.clone(),
            result: node.result.clone(),
            metadata: (!node.metadata.is_empty())
                .then(|| Value::Object(node.metadata.clone())),
            error: node.error.clone(),
            artifacts: node.artifacts.clone(),
        }
    }
}

/// Summary of a run, as returned by queries and run snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    /// Run id.
    pub run_id: String,
    /// Rollup status.
    pub status: RunStatus,
    /// Canonical definition hash.
    pub definition_hash: String,
    /// Submitting client session.
    pub client_id: String,
    /// Tenant of the run.
    pub tenant: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the first node started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the run finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Aggregated run error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Aggregated artifacts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Value>,
    /// Node summaries: root nodes first, then frames by nesting depth.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeSummary>,
}

impl RunSummary {
    /// Build the summary projection of a run record.
    #[must_use]
    pub fn from_record(record: &RunRecord) -> Self {
        let mut nodes: Vec<NodeSummary> = record.nodes.values().map(NodeSummary::from_node).collect();
        for frame in record.active_frames.values() {
            nodes.extend(frame.nodes.values().map(NodeSummary::from_node));
        }
        for frame_nodes in record.completed_frames.values() {
            nodes.extend(frame_nodes.values().map(NodeSummary::from_node));
        }
        nodes.sort_by(|a, b| {
            let depth = |summary: &NodeSummary| {
                (
                    usize::from(summary.frame_id.is_some()),
                    summary.frame_id.as_deref().map_or(0, |frame_id| {
                        frame_id.split("::").count()
                    }),
                )
            };
            depth(a)
                .cmp(&depth(b))
                .then_with(|| a.task_id.cmp(&b.task_id))
        });

        Self {
            run_id: record.run_id.clone(),
            status: record.status,
            definition_hash: record.definition_hash.clone(),
            client_id: record.client_id.clone(),
            tenant: record.tenant.clone(),
            created_at: record.created_at,
            started_at: record.started_at,
            finished_at: record.finished_at,
            error: record.error.clone(),
            artifacts: record.artifacts.clone(),
            nodes,
        }
    }

    /// Find a node summary by node id.
    #[must_use]
    pub fn node(&self, node_id: &str) -> Option<&NodeSummary> {
        self.nodes.iter().find(|node| node.node_id == node_id)
    }
}

/// One page of a run listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunListPage {
    /// Runs in creation order.
    pub items: Vec<RunSummary>,
    /// Cursor for the next page, when more runs exist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// The workflow definition annotated with per-node execution state.
#[must_use]
pub fn workflow_with_state(record: &RunRecord) -> Value {
    let mut workflow = serde_json::to_value(&record.workflow).unwrap_or(Value::Null);
    if let Some(nodes) = workflow.get_mut("nodes").and_then(Value::as_array_mut) {
        for node in nodes {
            let Some(node_id) = node.get("id").and_then(Value::as_str) else {
                continue;
            };
            if let Some(state) = record.nodes.get(node_id) {
                node["state"] = Value::String(state.status.to_string());
            }
        }
    }
    workflow
}
