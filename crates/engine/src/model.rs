//! Run, node and frame state for the run registry.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use lattice_core::workflow::MiddlewareDef;
use lattice_core::{ErrorInfo, FrameStatus, RunStatus, WorkflowDefinition};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::scope::WorkflowScopeIndex;

/// Which structural role a node plays, fixed at bootstrap.
///
/// Host-with-middleware is derived, not a variant: a container node may also
/// carry a middleware chain, and both facts matter independently.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// An ordinary executable node.
    #[default]
    Plain,
    /// A container node expanding into a subgraph frame.
    Container,
    /// A middleware link wrapped around a host node.
    Middleware {
        /// The host node the chain wraps.
        host_node_id: String,
        /// Position in the chain, outermost first.
        chain_index: usize,
    },
}

/// Declarative copy rule evaluated when the source node completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingRoot {
    /// Read from / write into node parameters.
    Parameters,
    /// Read from node results (never a legal write target for edges).
    Results,
}

/// A resolved edge binding: copy `source_root/source_path` of the source
/// node into `target_root/target_path` of the target node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeBinding {
    /// Root container on the source node.
    pub source_root: BindingRoot,
    /// Path inside the source root.
    pub source_path: Vec<String>,
    /// Target node id.
    pub target_node: String,
    /// Root container on the target node (always parameters for edges).
    pub target_root: BindingRoot,
    /// Path inside the target root.
    pub target_path: Vec<String>,
}

/// Per-node execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    /// Node id within its graph.
    pub node_id: String,
    /// Frame-scoped unique task id (`frameId::nodeId` inside frames).
    pub task_id: String,
    /// Current status.
    pub status: RunStatus,
    /// Node type.
    pub node_type: String,
    /// Package name.
    pub package_name: String,
    /// Package version.
    pub package_version: String,
    /// Mutable parameters (edge bindings and resource bindings land here).
    pub parameters: Map<String, Value>,
    /// Concurrency key `runId:taskNamespace:nodeId`.
    pub concurrency_key: String,
    /// Worker the node last dispatched to.
    pub worker_name: Option<String>,
    /// When the node started running.
    pub started_at: Option<DateTime<Utc>>,
    /// When the node reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
    /// Dispatch sequence used for the last dispatch.
    pub seq: Option<u64>,
    /// Resource references attached to the node.
    pub resource_refs: Vec<Value>,
    /// Placement affinity hints.
    pub affinity: Option<Value>,
    /// Artifacts reported by the worker.
    pub artifacts: Vec<Value>,
    /// Result value.
    pub result: Option<Value>,
    /// Metadata (feedback merges here; role/host keys are preserved).
    pub metadata: Map<String, Value>,
    /// Last error, when failed.
    pub error: Option<ErrorInfo>,
    /// Upstream node ids.
    pub dependencies: Vec<String>,
    /// Downstream node ids.
    pub dependents: Vec<String>,
    /// Unreleased upstream count.
    pub pending_dependencies: u32,
    /// Exactly-once guard for the ready queue.
    pub enqueued: bool,
    /// `true` between dispatch send and `control.ack`.
    pub pending_ack: bool,
    /// Envelope id of the in-flight dispatch.
    pub dispatch_id: Option<String>,
    /// Deadline for the in-flight ack.
    pub ack_deadline: Option<DateTime<Utc>>,
    /// Frame linkage for frame-scoped nodes.
    pub frame_id: Option<String>,
    /// Container that expanded into this node's frame.
    pub container_node_id: Option<String>,
    /// Subgraph the frame instantiates.
    pub subgraph_id: Option<String>,
    /// Alias chain of the owning frame.
    pub frame_alias: Vec<String>,
    /// Ordered middleware chain node ids (outermost first).
    pub middlewares: Vec<String>,
    /// Full middleware definitions, index-aligned with `middlewares`.
    pub middleware_defs: Vec<MiddlewareDef>,
    /// `true` while this node must wait for its middleware chain.
    pub chain_blocked: bool,
    /// Structural role fixed at bootstrap.
    pub role: NodeRole,
    /// Monotonic counter for result deltas.
    pub result_sequence: u64,
    /// Monotonic counter for feedback chunks.
    pub feedback_sequence: u64,
}

impl NodeState {
    /// Create a queued node with the given ids.
    #[must_use]
    pub fn new(node_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            task_id: task_id.into(),
            status: RunStatus::Queued,
            node_type: String::new(),
            package_name: String::new(),
            package_version: String::new(),
            parameters: Map::new(),
            concurrency_key: String::new(),
            worker_name: None,
            started_at: None,
            finished_at: None,
            seq: None,
            resource_refs: Vec::new(),
            affinity: None,
            artifacts: Vec::new(),
            result: None,
            metadata: Map::new(),
            error: None,
            dependencies: Vec::new(),
            dependents: Vec::new(),
            pending_dependencies: 0,
            enqueued: false,
            pending_ack: false,
            dispatch_id: None,
            ack_deadline: None,
            frame_id: None,
            container_node_id: None,
            subgraph_id: None,
            frame_alias: Vec::new(),
            middlewares: Vec::new(),
            middleware_defs: Vec::new(),
            chain_blocked: false,
            role: NodeRole::Plain,
            result_sequence: 0,
            feedback_sequence: 0,
        }
    }

    /// Returns `true` for middleware links.
    #[must_use]
    pub fn is_middleware(&self) -> bool {
        matches!(self.role, NodeRole::Middleware { .. })
    }

    /// Returns `true` for container nodes.
    #[must_use]
    pub fn is_container(&self) -> bool {
        matches!(self.role, NodeRole::Container)
    }

    /// Returns `true` for a node wrapped by a middleware chain (containers
    /// included, middleware links excluded).
    #[must_use]
    pub fn is_host_with_middleware(&self) -> bool {
        !self.middlewares.is_empty() && !self.is_middleware()
    }

    /// Chain index when this node is a middleware link.
    #[must_use]
    pub fn chain_index(&self) -> Option<usize> {
        match &self.role {
            NodeRole::Middleware { chain_index, .. } => Some(*chain_index),
            _ => None,
        }
    }

    /// Host node id when this node is a middleware link.
    #[must_use]
    pub fn host_node_id(&self) -> Option<&str> {
        match &self.role {
            NodeRole::Middleware { host_node_id, .. } => Some(host_node_id),
            _ => None,
        }
    }

    /// Returns `true` for the outermost middleware of its chain.
    #[must_use]
    pub fn is_outermost_middleware(&self) -> bool {
        self.chain_index() == Some(0)
    }

    /// Clear dispatch bookkeeping so the node can be dispatched again.
    pub fn clear_dispatch_state(&mut self) {
        self.worker_name = None;
        self.started_at = None;
        self.finished_at = None;
        self.seq = None;
        self.pending_ack = false;
        self.dispatch_id = None;
        self.ack_deadline = None;
        self.error = None;
    }
}

/// The dispatcher's unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    /// Run the task belongs to.
    pub run_id: String,
    /// Tenant of the run.
    pub tenant: String,
    /// Node id inside its graph.
    pub node_id: String,
    /// Frame-scoped task id.
    pub task_id: String,
    /// Node type.
    pub node_type: String,
    /// Package name.
    pub package_name: String,
    /// Package version.
    pub package_version: String,
    /// Snapshot of parameters at enqueue time.
    pub parameters: Map<String, Value>,
    /// Resource references attached to the node.
    pub resource_refs: Vec<Value>,
    /// Placement affinity hints.
    pub affinity: Option<Value>,
    /// Concurrency key `runId:taskNamespace:nodeId`.
    pub concurrency_key: String,
    /// Run-scoped dispatch sequence.
    pub seq: u64,
    /// Preferred worker, derived from resource refs.
    pub preferred_worker_name: Option<String>,
    /// Delivery attempts so far.
    pub attempts: u32,
    /// Envelope id of the in-flight dispatch, when sent.
    pub dispatch_id: Option<String>,
    /// Host node id for middleware-chain dispatches.
    pub host_node_id: Option<String>,
    /// The middleware chain, outermost first.
    pub middleware_chain: Option<Vec<String>>,
    /// Index of this dispatch within the chain; absent for the host.
    pub chain_index: Option<usize>,
    /// Deadline for the in-flight ack, when sent.
    pub ack_deadline: Option<DateTime<Utc>>,
}

/// Immutable description of a frame a container node can expand into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameDefinition {
    /// `parentAliasChain::containerNodeId::subgraphId`.
    pub frame_id: String,
    /// Container node the frame belongs to.
    pub container_node_id: String,
    /// Subgraph the frame instantiates.
    pub subgraph_id: String,
    /// Cloned subgraph workflow with stringified identifiers.
    pub workflow: WorkflowDefinition,
    /// Parent frame, for nested containers.
    pub parent_frame_id: Option<String>,
    /// Full alias chain from the root workflow.
    pub alias_chain: Vec<String>,
}

/// Live state of an activated frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRuntimeState {
    /// The definition this runtime instantiates.
    pub definition: FrameDefinition,
    /// Per-frame node map.
    pub nodes: IndexMap<String, NodeState>,
    /// task id → node id within this frame.
    pub task_index: HashMap<String, String>,
    /// Scope index for binding resolution inside the frame.
    pub scope_index: WorkflowScopeIndex,
    /// Edge bindings local to the frame.
    pub edge_bindings: HashMap<String, Vec<EdgeBinding>>,
    /// Frame status.
    pub status: FrameStatus,
    /// When the frame was activated.
    pub started_at: Option<DateTime<Utc>>,
    /// When the frame finalised.
    pub finished_at: Option<DateTime<Utc>>,
}

impl FrameRuntimeState {
    /// Frame id shorthand.
    #[must_use]
    pub fn frame_id(&self) -> &str {
        &self.definition.frame_id
    }

    /// Container node id shorthand.
    #[must_use]
    pub fn container_node_id(&self) -> &str {
        &self.definition.container_node_id
    }

    /// Parent frame id shorthand.
    #[must_use]
    pub fn parent_frame_id(&self) -> Option<&str> {
        self.definition.parent_frame_id.as_deref()
    }
}

/// Where a node lives inside a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeLocation {
    /// The root graph.
    Root,
    /// An active frame.
    Frame(String),
}

/// Per-run in-memory state.
///
/// Never serialized whole — clients see [`crate::summary::RunSummary`]
/// projections instead.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    /// Run id.
    pub run_id: String,
    /// Canonical-JSON SHA-256 of the workflow definition.
    pub definition_hash: String,
    /// Client session that submitted the run.
    pub client_id: String,
    /// Immutable workflow definition.
    pub workflow: WorkflowDefinition,
    /// Tenant of the run.
    pub tenant: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Rollup status (pure function of node statuses).
    pub status: RunStatus,
    /// When the first node started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run finished.
    pub finished_at: Option<DateTime<Utc>>,
    /// Worker of the most recent dispatch.
    pub worker_name: Option<String>,
    /// Task of the most recent dispatch.
    pub task_id: Option<String>,
    /// Node of the most recent dispatch.
    pub node_id: Option<String>,
    /// Node type of the most recent dispatch.
    pub node_type: Option<String>,
    /// Package of the most recent dispatch.
    pub package_name: Option<String>,
    /// Package version of the most recent dispatch.
    pub package_version: Option<String>,
    /// Next dispatch sequence to assign.
    pub next_seq: u64,
    /// Aggregated run error.
    pub error: Option<ErrorInfo>,
    /// Last result payload seen.
    pub result_payload: Option<Value>,
    /// Duration of the last reported result.
    pub duration_ms: Option<u64>,
    /// Aggregated artifacts across nodes.
    pub artifacts: Vec<Value>,
    /// Root node states.
    pub nodes: IndexMap<String, NodeState>,
    /// task id → node id for root nodes.
    pub task_index: HashMap<String, String>,
    /// Root-level edge bindings keyed by source node.
    pub edge_bindings: HashMap<String, Vec<EdgeBinding>>,
    /// Scope index for root-level binding resolution.
    pub scope_index: WorkflowScopeIndex,
    /// All frame definitions, keyed by frame id.
    pub frames: HashMap<String, FrameDefinition>,
    /// `(parent frame, container node)` → frame id.
    pub frames_by_parent: HashMap<(Option<String>, String), String>,
    /// Activated frames.
    pub active_frames: IndexMap<String, FrameRuntimeState>,
    /// Open frames, innermost last.
    pub frame_stack: Vec<String>,
    /// Node maps of finalised frames, kept for summaries.
    pub completed_frames: IndexMap<String, IndexMap<String, NodeState>>,
}

impl RunRecord {
    /// Look up a node by task id, searching the root then active frames
    /// (innermost first).
    #[must_use]
    pub fn locate_by_task(&self, task_id: &str) -> Option<(NodeLocation, String)> {
        if let Some(node_id) = self.task_index.get(task_id) {
            return Some((NodeLocation::Root, node_id.clone()));
        }
        for frame_id in self.frame_stack.iter().rev() {
            if let Some(frame) = self.active_frames.get(frame_id)
                && let Some(node_id) = frame.task_index.get(task_id)
            {
                return Some((NodeLocation::Frame(frame_id.clone()), node_id.clone()));
            }
        }
        for (frame_id, frame) in &self.active_frames {
            if let Some(node_id) = frame.task_index.get(task_id) {
                return Some((NodeLocation::Frame(frame_id.clone()), node_id.clone()));
            }
        }
        None
    }

    /// Look up a node by node id, searching the root then active frames
    /// (innermost first).
    #[must_use]
    pub fn locate_by_node(&self, node_id: &str) -> Option<(NodeLocation, String)> {
        if self.nodes.contains_key(node_id) {
            return Some((NodeLocation::Root, node_id.to_owned()));
        }
        for frame_id in self.frame_stack.iter().rev() {
            if let Some(frame) = self.active_frames.get(frame_id)
                && frame.nodes.contains_key(node_id)
            {
                return Some((NodeLocation::Frame(frame_id.clone()), node_id.to_owned()));
            }
        }
        for (frame_id, frame) in &self.active_frames {
            if frame.nodes.contains_key(node_id) {
                return Some((NodeLocation::Frame(frame_id.clone()), node_id.to_owned()));
            }
        }
        None
    }

    /// Resolve first by task id, then by node id.
    #[must_use]
    pub fn locate(&self, node_id: Option<&str>, task_id: Option<&str>) -> Option<(NodeLocation, String)> {
        if let Some(task_id) = task_id
            && let Some(found) = self.locate_by_task(task_id)
        {
            return Some(found);
        }
        node_id.and_then(|node_id| self.locate_by_node(node_id))
    }

    /// Find the node holding the given in-flight dispatch id.
    #[must_use]
    pub fn locate_by_dispatch(&self, dispatch_id: &str) -> Option<(NodeLocation, String)> {
        for (node_id, node) in &self.nodes {
            if node.dispatch_id.as_deref() == Some(dispatch_id) {
                return Some((NodeLocation::Root, node_id.clone()));
            }
        }
        for (frame_id, frame) in &self.active_frames {
            for (node_id, node) in &frame.nodes {
                if node.dispatch_id.as_deref() == Some(dispatch_id) {
                    return Some((NodeLocation::Frame(frame_id.clone()), node_id.clone()));
                }
            }
        }
        None
    }

    /// Immutable access to a located node.
    #[must_use]
    pub fn node(&self, location: &NodeLocation, node_id: &str) -> Option<&NodeState> {
        match location {
            NodeLocation::Root => self.nodes.get(node_id),
            NodeLocation::Frame(frame_id) => {
                self.active_frames.get(frame_id)?.nodes.get(node_id)
            }
        }
    }

    /// Mutable access to a located node.
    #[must_use]
    pub fn node_mut(&mut self, location: &NodeLocation, node_id: &str) -> Option<&mut NodeState> {
        match location {
            NodeLocation::Root => self.nodes.get_mut(node_id),
            NodeLocation::Frame(frame_id) => {
                self.active_frames.get_mut(frame_id)?.nodes.get_mut(node_id)
            }
        }
    }

    /// Get or create a root node, rebinding the task index when the task id
    /// changes. Used for late arrivals referencing unknown tasks.
    pub fn get_or_insert_root_node(&mut self, node_id: &str, task_id: &str) -> &mut NodeState {
        if !self.nodes.contains_key(node_id) {
            let node = NodeState::new(node_id, task_id);
            self.task_index.insert(task_id.to_owned(), node_id.to_owned());
            self.nodes.insert(node_id.to_owned(), node);
        }
        let node = self.nodes.get_mut(node_id).unwrap_or_else(|| unreachable!());
        if node.task_id != task_id {
            self.task_index.remove(&node.task_id);
            node.task_id = task_id.to_owned();
            self.task_index.insert(task_id.to_owned(), node_id.to_owned());
        }
        node
    }

    /// The innermost open frame, if any.
    #[must_use]
    pub fn current_frame_id(&self) -> Option<&str> {
        self.frame_stack.last().map(String::as_str)
    }

    /// Recompute the rollup status, timestamps, artifacts and aggregated
    /// error from root node statuses.
    pub fn refresh_rollup(&mut self) {
        if self.nodes.is_empty() {
            return;
        }
        let statuses: Vec<RunStatus> = self.nodes.values().map(|node| node.status).collect();
        let any_failed = statuses.contains(&RunStatus::Failed);
        let all_terminal = statuses.iter().all(|status| status.is_terminal());

        self.status = if any_failed {
            RunStatus::Failed
        } else if statuses.iter().all(|s| *s == RunStatus::Queued) {
            RunStatus::Queued
        } else if statuses.iter().all(|s| *s == RunStatus::Succeeded) {
            RunStatus::Succeeded
        } else if all_terminal {
            if statuses.iter().all(|s| *s == RunStatus::Cancelled) {
                RunStatus::Cancelled
            } else {
                RunStatus::Succeeded
            }
        } else {
            RunStatus::Running
        };

        self.started_at = self.nodes.values().filter_map(|node| node.started_at).min();
        let finished = all_terminal || self.status == RunStatus::Failed;
        if finished {
            if self.finished_at.is_none() {
                self.finished_at = Some(Utc::now());
            }
        } else {
            self.finished_at = None;
        }

        self.artifacts = self
            .nodes
            .values()
            .flat_map(|node| node.artifacts.iter().cloned())
            .collect();
        if self.status == RunStatus::Failed {
            self.error = self.nodes.values().find_map(|node| node.error.clone());
        } else if self.status == RunStatus::Succeeded {
            self.error = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record_with_nodes(statuses: &[(&str, RunStatus)]) -> RunRecord {
        let mut record = RunRecord {
            run_id: "r-1".into(),
            definition_hash: "hash".into(),
            client_id: "client".into(),
            workflow: WorkflowDefinition::default(),
            tenant: "default".into(),
            created_at: Utc::now(),
            status: RunStatus::Queued,
            started_at: None,
            finished_at: None,
            worker_name: None,
            task_id: None,
            node_id: None,
            node_type: None,
            package_name: None,
            package_version: None,
            next_seq: 1,
            error: None,
            result_payload: None,
            duration_ms: None,
            artifacts: Vec::new(),
            nodes: IndexMap::new(),
            task_index: HashMap::new(),
            edge_bindings: HashMap::new(),
            scope_index: WorkflowScopeIndex::default(),
            frames: HashMap::new(),
            frames_by_parent: HashMap::new(),
            active_frames: IndexMap::new(),
            frame_stack: Vec::new(),
            completed_frames: IndexMap::new(),
        };
        for (node_id, status) in statuses {
            let mut node = NodeState::new(*node_id, *node_id);
            node.status = *status;
            record.task_index.insert((*node_id).into(), (*node_id).into());
            record.nodes.insert((*node_id).into(), node);
        }
        record
    }

    #[test]
    fn rollup_any_failed_wins() {
        let mut record = record_with_nodes(&[
            ("a", RunStatus::Succeeded),
            ("b", RunStatus::Failed),
            ("c", RunStatus::Queued),
        ]);
        record.nodes.get_mut("b").unwrap().error = Some(ErrorInfo::new("X", "boom"));
        record.refresh_rollup();
        assert_eq!(record.status, RunStatus::Failed);
        assert!(record.finished_at.is_some());
        assert_eq!(record.error.as_ref().unwrap().code, "X");
    }

    #[test]
    fn rollup_all_queued() {
        let mut record = record_with_nodes(&[("a", RunStatus::Queued), ("b", RunStatus::Queued)]);
        record.refresh_rollup();
        assert_eq!(record.status, RunStatus::Queued);
        assert!(record.finished_at.is_none());
    }

    #[test]
    fn rollup_all_succeeded() {
        let mut record =
            record_with_nodes(&[("a", RunStatus::Succeeded), ("b", RunStatus::Succeeded)]);
        record.refresh_rollup();
        assert_eq!(record.status, RunStatus::Succeeded);
    }

    #[test]
    fn rollup_mixed_terminal_with_cancelled() {
        let mut record =
            record_with_nodes(&[("a", RunStatus::Succeeded), ("b", RunStatus::Cancelled)]);
        record.refresh_rollup();
        // Mixed terminal without failure rolls up as succeeded.
        assert_eq!(record.status, RunStatus::Succeeded);

        let mut record =
            record_with_nodes(&[("a", RunStatus::Cancelled), ("b", RunStatus::Cancelled)]);
        record.refresh_rollup();
        assert_eq!(record.status, RunStatus::Cancelled);
    }

    #[test]
    fn rollup_running_when_any_non_terminal() {
        let mut record =
            record_with_nodes(&[("a", RunStatus::Succeeded), ("b", RunStatus::Running)]);
        record.refresh_rollup();
        assert_eq!(record.status, RunStatus::Running);
    }

    #[test]
    fn rollup_success_clears_error() {
        let mut record = record_with_nodes(&[("a", RunStatus::Succeeded)]);
        record.error = Some(ErrorInfo::new("old", "stale"));
        record.refresh_rollup();
        assert!(record.error.is_none());
    }

    #[test]
    fn locate_prefers_task_index() {
        let record = record_with_nodes(&[("a", RunStatus::Queued)]);
        let (location, node_id) = record.locate(None, Some("a")).unwrap();
        assert_eq!(location, NodeLocation::Root);
        assert_eq!(node_id, "a");
        assert!(record.locate(None, Some("missing")).is_none());
    }

    #[test]
    fn get_or_insert_rebinds_task_index() {
        let mut record = record_with_nodes(&[]);
        record.get_or_insert_root_node("n", "t-1");
        record.get_or_insert_root_node("n", "t-2");
        assert_eq!(record.task_index.get("t-2").map(String::as_str), Some("n"));
        assert!(!record.task_index.contains_key("t-1"));
    }

    #[test]
    fn locate_by_dispatch_finds_node() {
        let mut record = record_with_nodes(&[("a", RunStatus::Running)]);
        record.nodes.get_mut("a").unwrap().dispatch_id = Some("d-1".into());
        let (location, node_id) = record.locate_by_dispatch("d-1").unwrap();
        assert_eq!(location, NodeLocation::Root);
        assert_eq!(node_id, "a");
        assert!(record.locate_by_dispatch("d-2").is_none());
    }

    #[test]
    fn node_role_helpers() {
        let mut node = NodeState::new("m", "m");
        node.role = NodeRole::Middleware {
            host_node_id: "h".into(),
            chain_index: 0,
        };
        assert!(node.is_middleware());
        assert!(node.is_outermost_middleware());
        assert_eq!(node.host_node_id(), Some("h"));
        assert!(!node.is_host_with_middleware());

        let mut host = NodeState::new("h", "h");
        host.middlewares = vec!["m".into()];
        assert!(host.is_host_with_middleware());
        assert!(!host.is_middleware());
    }
}
