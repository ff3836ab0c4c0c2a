//! Ready collection and dispatch request construction.

use chrono::Utc;
use lattice_core::RunStatus;
use serde_json::Value;

use crate::frames;
use crate::model::{DispatchRequest, NodeLocation, NodeState, RunRecord};

/// Returns `true` when a node can be handed to the dispatcher right now.
#[must_use]
pub fn should_auto_dispatch(node: &NodeState) -> bool {
    node.status == RunStatus::Queued
        && node.pending_dependencies == 0
        && !node.enqueued
        && !node.chain_blocked
        && !node.is_host_with_middleware()
}

/// Returns `true` when a container node is ready for frame activation.
///
/// Containers with middleware follow the chain rules instead.
#[must_use]
pub fn is_container_ready(node: &NodeState) -> bool {
    node.is_container()
        && node.middlewares.is_empty()
        && !node.chain_blocked
        && node.status == RunStatus::Queued
        && node.pending_dependencies == 0
        && !node.enqueued
}

/// Find the middleware chain containing `node_id`: `(host, chain, index)`.
///
/// The owning frame is scanned first, then the root, then every active
/// frame.
#[must_use]
pub fn resolve_middleware_chain(
    record: &RunRecord,
    node_id: &str,
) -> Option<(String, Vec<String>, usize)> {
    let scan = |nodes: &indexmap::IndexMap<String, NodeState>| {
        nodes.values().find_map(|candidate| {
            candidate
                .middlewares
                .iter()
                .position(|mw| mw == node_id)
                .map(|index| (candidate.node_id.clone(), candidate.middlewares.clone(), index))
        })
    };

    let owning_frame = record
        .locate_by_node(node_id)
        .and_then(|(location, id)| record.node(&location, &id).cloned())
        .and_then(|node| node.frame_id);
    if let Some(frame_id) = owning_frame
        && let Some(frame) = record.active_frames.get(&frame_id)
        && let Some(found) = scan(&frame.nodes)
    {
        return Some(found);
    }
    if let Some(found) = scan(&record.nodes) {
        return Some(found);
    }
    record
        .active_frames
        .values()
        .find_map(|frame| scan(&frame.nodes))
}

/// Build a dispatch request for a node, stamping its chain metadata when it
/// belongs to one.
pub fn build_dispatch_request_for_node(
    record: &mut RunRecord,
    location: &NodeLocation,
    node_id: &str,
) -> Option<DispatchRequest> {
    let chain_info = resolve_middleware_chain(record, node_id);
    let (host_node_id, middleware_chain, chain_index) = match chain_info {
        Some((host, chain, index)) => (Some(host), Some(chain), Some(index)),
        None => (None, None, None),
    };
    build_dispatch_request(record, location, node_id, host_node_id, middleware_chain, chain_index)
}

/// Build a dispatch request with explicit chain metadata.
///
/// Marks the node enqueued and consumes the run's next dispatch sequence.
pub fn build_dispatch_request(
    record: &mut RunRecord,
    location: &NodeLocation,
    node_id: &str,
    host_node_id: Option<String>,
    middleware_chain: Option<Vec<String>>,
    chain_index: Option<usize>,
) -> Option<DispatchRequest> {
    let seq = record.next_seq;
    let run_id = record.run_id.clone();
    let tenant = record.tenant.clone();
    let node = record.node_mut(location, node_id)?;
    node.enqueued = true;

    let resource_refs = node.resource_refs.clone();
    let mut worker_names: Vec<&str> = resource_refs
        .iter()
        .filter_map(|reference| {
            let object = reference.as_object()?;
            object
                .get("workerName")
                .or_else(|| object.get("worker_name"))
                .and_then(Value::as_str)
        })
        .collect();
    worker_names.sort_unstable();
    worker_names.dedup();
    let preferred_worker_name = match worker_names.as_slice() {
        [single] => Some((*single).to_owned()),
        _ => None,
    };

    let concurrency_key = if node.concurrency_key.is_empty() {
        format!("{run_id}:{node_id}")
    } else {
        node.concurrency_key.clone()
    };
    let request = DispatchRequest {
        run_id,
        tenant,
        node_id: node.node_id.clone(),
        task_id: node.task_id.clone(),
        node_type: node.node_type.clone(),
        package_name: node.package_name.clone(),
        package_version: node.package_version.clone(),
        parameters: node.parameters.clone(),
        resource_refs,
        affinity: node.affinity.clone(),
        concurrency_key,
        seq,
        preferred_worker_name,
        attempts: 0,
        dispatch_id: None,
        host_node_id,
        middleware_chain,
        chain_index,
        ack_deadline: None,
    };
    record.next_seq = seq + 1;
    Some(request)
}

/// Collect dispatchable nodes from one graph (the root or an active frame),
/// activating any ready containers along the way.
pub fn collect_ready_for_graph(
    record: &mut RunRecord,
    location: &NodeLocation,
    state_events: &mut Vec<NodeState>,
) -> Vec<DispatchRequest> {
    let node_ids: Vec<String> = match location {
        NodeLocation::Root => record.nodes.keys().cloned().collect(),
        NodeLocation::Frame(frame_id) => match record.active_frames.get(frame_id) {
            Some(frame) => frame.nodes.keys().cloned().collect(),
            None => return Vec::new(),
        },
    };

    let mut ready = Vec::new();
    for node_id in node_ids {
        let Some(node) = record.node(location, &node_id) else {
            continue;
        };
        if node.is_container() {
            if !is_container_ready(node) {
                continue;
            }
            let parent_frame_id = match location {
                NodeLocation::Root => None,
                NodeLocation::Frame(frame_id) => Some(frame_id.clone()),
            };
            ready.extend(start_container_execution(
                record,
                parent_frame_id.as_deref(),
                &node_id,
                state_events,
            ));
            continue;
        }
        if !should_auto_dispatch(node) {
            continue;
        }
        if let Some(request) = build_dispatch_request_for_node(record, location, &node_id) {
            ready.push(request);
        }
    }
    ready
}

/// Collect ready work for a run: the innermost open frame when one exists,
/// otherwise the root graph.
pub fn collect_ready(record: &mut RunRecord, state_events: &mut Vec<NodeState>) -> Vec<DispatchRequest> {
    match record.current_frame_id().map(str::to_owned) {
        Some(frame_id) => {
            collect_ready_for_graph(record, &NodeLocation::Frame(frame_id), state_events)
        }
        None => collect_ready_for_graph(record, &NodeLocation::Root, state_events),
    }
}

/// Activate a container's frame: materialise the runtime graph, mark the
/// container running, emit state events for every contained node, and
/// recursively collect ready nodes inside the frame.
pub fn start_container_execution(
    record: &mut RunRecord,
    parent_frame_id: Option<&str>,
    container_node_id: &str,
    state_events: &mut Vec<NodeState>,
) -> Vec<DispatchRequest> {
    let key = (parent_frame_id.map(str::to_owned), container_node_id.to_owned());
    let mut frame_id = record.frames_by_parent.get(&key).cloned();
    if frame_id.is_none() {
        // Frames are built at bootstrap; rebuild defensively for runs whose
        // definitions were mutated by feedback merges.
        let (frames, frames_by_parent) = frames::build_container_frames(&record.workflow);
        record.frames = frames;
        record.frames_by_parent = frames_by_parent;
        frame_id = record.frames_by_parent.get(&key).cloned();
    }

    let container_location = match parent_frame_id {
        Some(frame_id) => NodeLocation::Frame(frame_id.to_owned()),
        None => NodeLocation::Root,
    };
    let Some(frame_id) = frame_id else {
        tracing::error!(
            container = container_node_id,
            parent_frame = ?parent_frame_id,
            "container node missing its subgraph frame"
        );
        if let Some(container) = record.node_mut(&container_location, container_node_id) {
            container.status = RunStatus::Failed;
            container.enqueued = true;
            container.finished_at = Some(Utc::now());
        }
        return Vec::new();
    };
    let Some(definition) = record.frames.get(&frame_id).cloned() else {
        return Vec::new();
    };

    if let Some(container) = record.node_mut(&container_location, container_node_id) {
        if container.started_at.is_none() {
            container.started_at = Some(Utc::now());
        }
        container.status = RunStatus::Running;
        container.enqueued = true;
        container
            .metadata
            .insert("frameId".into(), Value::String(frame_id.clone()));
        state_events.push(container.clone());
    }

    let frame_state = frames::activate_frame(record, &definition);
    for node in frame_state.nodes.values() {
        state_events.push(node.clone());
    }

    collect_ready_for_graph(record, &NodeLocation::Frame(frame_id), state_events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::build_run_record;
    use lattice_core::WorkflowDefinition;
    use pretty_assertions::assert_eq;

    fn linear_workflow() -> WorkflowDefinition {
        serde_json::from_value(serde_json::json!({
            "id": "wf",
            "nodes": [
                {"id": "a", "type": "t", "package": {"name": "p", "version": "1"}},
                {"id": "b", "type": "t", "package": {"name": "p", "version": "1"}}
            ],
            "edges": [{"source": {"node": "a"}, "target": {"node": "b"}}]
        }))
        .unwrap()
    }

    fn container_workflow() -> WorkflowDefinition {
        serde_json::from_value(serde_json::json!({
            "id": "wf",
            "nodes": [
                {
                    "id": "c",
                    "type": "workflow.container",
                    "parameters": {"__container": {"subgraphId": "sg"}}
                }
            ],
            "subgraphs": [
                {
                    "id": "sg",
                    "definition": {
                        "id": "sg",
                        "nodes": [{"id": "inner", "type": "t", "package": {"name": "p", "version": "1"}}]
                    }
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn collect_ready_yields_roots_only() {
        let mut record = build_run_record("r", linear_workflow(), "c", "t");
        let mut events = Vec::new();
        let ready = collect_ready(&mut record, &mut events);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].node_id, "a");
        assert_eq!(ready[0].seq, 1);
        assert!(record.nodes["a"].enqueued);
        // A second collection is a no-op thanks to the enqueued guard.
        let again = collect_ready(&mut record, &mut events);
        assert!(again.is_empty());
    }

    #[test]
    fn dispatch_request_snapshot_fields() {
        let mut record = build_run_record("r", linear_workflow(), "c", "t");
        let mut events = Vec::new();
        let ready = collect_ready(&mut record, &mut events);
        let request = &ready[0];
        assert_eq!(request.run_id, "r");
        assert_eq!(request.tenant, "t");
        assert_eq!(request.concurrency_key, "r:a");
        assert_eq!(request.package_name, "p");
        assert_eq!(record.next_seq, 2);
    }

    #[test]
    fn preferred_worker_from_unanimous_refs() {
        let mut record = build_run_record("r", linear_workflow(), "c", "t");
        record.nodes.get_mut("a").unwrap().resource_refs = vec![
            serde_json::json!({"workerName": "w-1"}),
            serde_json::json!({"worker_name": "w-1"}),
        ];
        let request =
            build_dispatch_request_for_node(&mut record, &NodeLocation::Root, "a").unwrap();
        assert_eq!(request.preferred_worker_name.as_deref(), Some("w-1"));
    }

    #[test]
    fn no_preferred_worker_on_disagreement() {
        let mut record = build_run_record("r", linear_workflow(), "c", "t");
        record.nodes.get_mut("a").unwrap().resource_refs = vec![
            serde_json::json!({"workerName": "w-1"}),
            serde_json::json!({"workerName": "w-2"}),
        ];
        let request =
            build_dispatch_request_for_node(&mut record, &NodeLocation::Root, "a").unwrap();
        assert_eq!(request.preferred_worker_name, None);
    }

    #[test]
    fn container_activation_enqueues_frame_nodes() {
        let mut record = build_run_record("r", container_workflow(), "c", "t");
        let mut events = Vec::new();
        let ready = collect_ready(&mut record, &mut events);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].node_id, "inner");
        assert!(ready[0].task_id.contains("::inner"));
        assert_eq!(record.nodes["c"].status, RunStatus::Running);
        assert_eq!(record.active_frames.len(), 1);
        assert_eq!(record.frame_stack.len(), 1);
        // Container plus the frame node got state events.
        assert!(events.iter().any(|node| node.node_id == "c"));
        assert!(events.iter().any(|node| node.node_id == "inner"));
    }

    #[test]
    fn chain_blocked_nodes_are_held_back() {
        let mut record = build_run_record("r", linear_workflow(), "c", "t");
        record.nodes.get_mut("a").unwrap().chain_blocked = true;
        let mut events = Vec::new();
        assert!(collect_ready(&mut record, &mut events).is_empty());
    }

    #[test]
    fn resolve_chain_finds_host_and_index() {
        let workflow: WorkflowDefinition = serde_json::from_value(serde_json::json!({
            "id": "wf",
            "nodes": [
                {"id": "h", "type": "t", "middlewares": ["m1", "m2"]}
            ]
        }))
        .unwrap();
        let record = build_run_record("r", workflow, "c", "t");
        let (host, chain, index) = resolve_middleware_chain(&record, "m2").unwrap();
        assert_eq!(host, "h");
        assert_eq!(chain, vec!["m1", "m2"]);
        assert_eq!(index, 1);
        assert!(resolve_middleware_chain(&record, "nope").is_none());
    }
}
