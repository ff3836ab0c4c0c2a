//! Subgraph frames: construction, activation and completion.

use std::collections::HashMap;

use chrono::Utc;
use lattice_core::{FrameStatus, RunStatus, WorkflowDefinition};
use lattice_protocol::NextResponsePayload;

use crate::bootstrap::build_graph_nodes;
use crate::model::{
    DispatchRequest, FrameDefinition, FrameRuntimeState, NodeLocation, NodeState, RunRecord,
};
use crate::pending::PendingNextTable;
use crate::propagate::build_edge_bindings_for_workflow;
use crate::ready::{build_dispatch_request_for_node, should_auto_dispatch, start_container_execution};
use crate::scope::WorkflowScopeIndex;

fn clone_frame_workflow(
    subgraph: &lattice_core::workflow::WorkflowSubgraph,
    parent: &WorkflowDefinition,
) -> Option<WorkflowDefinition> {
    let mut workflow = subgraph.definition.as_deref()?.clone();
    if workflow.id.is_empty() {
        workflow.id = subgraph.id.clone();
    }
    if workflow.schema_version.is_none() {
        workflow.schema_version = parent.schema_version.clone();
    }
    Some(workflow)
}

/// Walk the workflow and materialise a [`FrameDefinition`] per container
/// node, depth-first. Returns the frames keyed by frame id plus the
/// `(parent frame, container node)` index.
#[must_use]
pub fn build_container_frames(
    workflow: &WorkflowDefinition,
) -> (HashMap<String, FrameDefinition>, HashMap<(Option<String>, String), String>) {
    let mut frames = HashMap::new();
    let mut frames_by_parent = HashMap::new();

    fn walk(
        root: &WorkflowDefinition,
        container_node_id: &str,
        subgraph_id: &str,
        alias_chain: &[String],
        parent_frame_id: Option<&str>,
        frames: &mut HashMap<String, FrameDefinition>,
        frames_by_parent: &mut HashMap<(Option<String>, String), String>,
    ) {
        let Some(subgraph) = root.subgraph(subgraph_id) else {
            tracing::warn!(
                subgraph = subgraph_id,
                container = container_node_id,
                "subgraph referenced by container not found"
            );
            return;
        };
        let Some(frame_workflow) = clone_frame_workflow(subgraph, root) else {
            tracing::warn!(subgraph = subgraph_id, "subgraph has no definition to clone");
            return;
        };
        let mut frame_alias_chain = alias_chain.to_vec();
        frame_alias_chain.push(container_node_id.to_owned());
        frame_alias_chain.push(subgraph_id.to_owned());
        let frame_id = frame_alias_chain.join("::");

        let definition = FrameDefinition {
            frame_id: frame_id.clone(),
            container_node_id: container_node_id.to_owned(),
            subgraph_id: subgraph_id.to_owned(),
            workflow: frame_workflow.clone(),
            parent_frame_id: parent_frame_id.map(str::to_owned),
            alias_chain: frame_alias_chain.clone(),
        };
        frames.insert(frame_id.clone(), definition);
        frames_by_parent.insert(
            (parent_frame_id.map(str::to_owned), container_node_id.to_owned()),
            frame_id.clone(),
        );

        for child in &frame_workflow.nodes {
            if let Some(child_subgraph_id) = child.subgraph_id()
                && child.is_container()
            {
                walk(
                    root,
                    &child.id,
                    &child_subgraph_id,
                    &frame_alias_chain,
                    Some(&frame_id),
                    frames,
                    frames_by_parent,
                );
            }
        }
    }

    let root_alias = if workflow.id.is_empty() {
        "root".to_owned()
    } else {
        workflow.id.clone()
    };
    for node in &workflow.nodes {
        if let Some(subgraph_id) = node.subgraph_id()
            && node.is_container()
        {
            walk(
                workflow,
                &node.id,
                &subgraph_id,
                std::slice::from_ref(&root_alias),
                None,
                &mut frames,
                &mut frames_by_parent,
            );
        }
    }
    (frames, frames_by_parent)
}

/// Materialise the runtime graph for a frame definition.
#[must_use]
pub fn initialise_frame_runtime(record: &RunRecord, definition: &FrameDefinition) -> FrameRuntimeState {
    let (nodes, task_index) = build_graph_nodes(&definition.workflow, &record.run_id, Some(definition));
    let scope_index = WorkflowScopeIndex::new(&definition.workflow);
    let edge_bindings = build_edge_bindings_for_workflow(&definition.workflow, &scope_index);
    FrameRuntimeState {
        definition: definition.clone(),
        nodes,
        task_index,
        scope_index,
        edge_bindings,
        status: FrameStatus::Running,
        started_at: Some(Utc::now()),
        finished_at: None,
    }
}

/// Activate a frame: materialise its runtime state and push it onto the
/// frame stack. Returns a clone of the fresh state for event emission.
pub fn activate_frame(record: &mut RunRecord, definition: &FrameDefinition) -> FrameRuntimeState {
    let frame_state = initialise_frame_runtime(record, definition);
    record
        .active_frames
        .insert(definition.frame_id.clone(), frame_state.clone());
    record.frame_stack.push(definition.frame_id.clone());
    frame_state
}

/// Remove a frame from the active set and the stack.
pub fn pop_frame(record: &mut RunRecord, frame_id: &str) {
    record.active_frames.shift_remove(frame_id);
    if record.frame_stack.last().map(String::as_str) == Some(frame_id) {
        record.frame_stack.pop();
        return;
    }
    record.frame_stack.retain(|open| open != frame_id);
}

/// Release the dependents of a completed node into the ready queue.
///
/// Containers that become ready activate their frames; chain-blocked nodes
/// stay held; everything else that satisfies the dispatch predicate yields
/// a dispatch request.
pub fn release_dependents(
    record: &mut RunRecord,
    location: &NodeLocation,
    node_id: &str,
    ready: &mut Vec<DispatchRequest>,
    state_events: &mut Vec<NodeState>,
) {
    let dependents = match record.node(location, node_id) {
        Some(node) => node.dependents.clone(),
        None => return,
    };
    for dependent_id in dependents {
        let Some(dependent) = record.node_mut(location, &dependent_id) else {
            continue;
        };
        if dependent.status != RunStatus::Queued {
            continue;
        }
        if dependent.pending_dependencies > 0 {
            dependent.pending_dependencies -= 1;
        }
        if dependent.chain_blocked {
            continue;
        }
        if dependent.is_container() {
            if dependent.pending_dependencies > 0 || dependent.enqueued {
                continue;
            }
            let parent_frame_id = match location {
                NodeLocation::Root => None,
                NodeLocation::Frame(frame_id) => Some(frame_id.clone()),
            };
            let frame_ready = start_container_execution(
                record,
                parent_frame_id.as_deref(),
                &dependent_id,
                state_events,
            );
            ready.extend(frame_ready);
            continue;
        }
        if dependent.is_host_with_middleware() {
            if dependent.pending_dependencies == 0 && !dependent.enqueued {
                if let Some(request) =
                    build_dispatch_request_for_node(record, location, &dependent_id)
                {
                    ready.push(request);
                }
            }
            continue;
        }
        if should_auto_dispatch(dependent) {
            if let Some(request) = build_dispatch_request_for_node(record, location, &dependent_id)
            {
                ready.push(request);
            }
        }
    }
}

/// Outcome of a frame-completion check.
#[derive(Debug, Default)]
pub struct FrameCompletion {
    /// Dispatch requests released in the parent graph.
    pub ready: Vec<DispatchRequest>,
    /// Snapshot of the finalised container node, for event emission.
    pub container: Option<NodeState>,
    /// Responses for pending `next()` calls that targeted the container.
    pub next_responses: Vec<(Option<String>, NextResponsePayload)>,
}

/// Finalise a frame when every contained node is terminal (or one failed).
///
/// A failing frame cancels its remaining queued nodes and fails the
/// container; a clean frame succeeds the container unless a middleware
/// chain still has to drain, in which case the container returns to queued.
pub fn complete_frame_if_needed(
    record: &mut RunRecord,
    frame_id: &str,
    pending: &mut PendingNextTable,
    state_events: &mut Vec<NodeState>,
) -> FrameCompletion {
    let Some(frame) = record.active_frames.get_mut(frame_id) else {
        return FrameCompletion::default();
    };
    let failed = frame
        .nodes
        .values()
        .any(|node| node.status == RunStatus::Failed);
    let terminal = frame.nodes.values().all(|node| node.status.is_terminal());
    if !failed && !terminal {
        return FrameCompletion::default();
    }

    let now = Utc::now();
    if failed {
        for node in frame.nodes.values_mut() {
            if !node.status.is_terminal() {
                node.status = RunStatus::Cancelled;
                node.enqueued = false;
            }
        }
    }
    frame.finished_at = Some(now);
    frame.status = if failed {
        FrameStatus::Failed
    } else {
        FrameStatus::Succeeded
    };
    let frame_started_at = frame.started_at;
    let failing_error = frame.nodes.values().find_map(|node| node.error.clone());
    let frame_nodes = frame.nodes.clone();
    let parent_frame_id = frame.definition.parent_frame_id.clone();
    let container_node_id = frame.definition.container_node_id.clone();

    let parent_location = match &parent_frame_id {
        Some(parent_id) if record.active_frames.contains_key(parent_id) => {
            NodeLocation::Frame(parent_id.clone())
        }
        _ => NodeLocation::Root,
    };

    if record.node(&parent_location, &container_node_id).is_none() {
        pop_frame(record, frame_id);
        return FrameCompletion::default();
    }

    record
        .completed_frames
        .insert(frame_id.to_owned(), frame_nodes);
    pop_frame(record, frame_id);

    let container_is_host;
    let container_snapshot;
    {
        let container = record
            .node_mut(&parent_location, &container_node_id)
            .unwrap_or_else(|| unreachable!());
        container.finished_at = Some(now);
        container.enqueued = false;
        container.pending_ack = false;
        container.dispatch_id = None;
        container.ack_deadline = None;
        container.worker_name = None;
        container.error = None;
        if container.started_at.is_none() {
            container.started_at = frame_started_at.or(Some(now));
        }
        if failed {
            container.status = RunStatus::Failed;
            container.error = failing_error;
        } else if container.is_host_with_middleware() {
            // The chain still has to run; the outermost middleware
            // finalises the container later.
            container.status = RunStatus::Queued;
            container.finished_at = None;
            container.chain_blocked = true;
            container.pending_dependencies = 0;
        } else {
            container.status = RunStatus::Succeeded;
        }
        if !matches!(container.result, Some(serde_json::Value::Object(_))) {
            container.result = Some(serde_json::Value::Object(serde_json::Map::new()));
        }
        container_is_host = container.is_host_with_middleware();
        container_snapshot = container.clone();
    }

    let container_status = container_snapshot.status;
    let mut next_responses = pending.finalise_for_task(
        &record.run_id.clone(),
        &container_snapshot,
        container_status,
        container_snapshot.error.as_ref(),
        container_snapshot.result.as_ref(),
    );
    if failed {
        for (_, response) in &mut next_responses {
            if response.error.is_none() {
                response.error = Some(lattice_core::ErrorInfo::new(
                    lattice_core::codes::NEXT_FAILED,
                    format!("target {container_node_id} status failed"),
                ));
            }
        }
    }

    let mut ready = Vec::new();
    if !container_is_host && !failed {
        release_dependents(
            record,
            &parent_location,
            &container_node_id,
            &mut ready,
            state_events,
        );
    }

    FrameCompletion {
        ready,
        container: Some(container_snapshot),
        next_responses,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::build_run_record;
    use crate::ready::collect_ready;
    use pretty_assertions::assert_eq;

    fn nested_container_workflow() -> WorkflowDefinition {
        serde_json::from_value(serde_json::json!({
            "id": "wf",
            "nodes": [
                {
                    "id": "outer",
                    "type": "workflow.container",
                    "parameters": {"__container": {"subgraphId": "sg-outer"}}
                },
                {"id": "after", "type": "t"}
            ],
            "edges": [{"source": {"node": "outer"}, "target": {"node": "after"}}],
            "subgraphs": [
                {
                    "id": "sg-outer",
                    "definition": {
                        "id": "sg-outer",
                        "nodes": [
                            {
                                "id": "mid",
                                "type": "workflow.container",
                                "parameters": {"__container": {"subgraphId": "sg-inner"}}
                            }
                        ]
                    }
                },
                {
                    "id": "sg-inner",
                    "definition": {
                        "id": "sg-inner",
                        "nodes": [{"id": "leaf", "type": "t"}]
                    }
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn frames_built_depth_first_with_deterministic_ids() {
        let workflow = nested_container_workflow();
        let (frames, by_parent) = build_container_frames(&workflow);
        assert_eq!(frames.len(), 2);
        let outer_id = "wf::outer::sg-outer";
        let inner_id = "wf::outer::sg-outer::mid::sg-inner";
        assert!(frames.contains_key(outer_id));
        assert!(frames.contains_key(inner_id));
        assert_eq!(frames[inner_id].parent_frame_id.as_deref(), Some(outer_id));
        assert_eq!(
            by_parent.get(&(None, "outer".to_owned())).map(String::as_str),
            Some(outer_id)
        );
    }

    #[test]
    fn activation_cascades_through_nested_frames() {
        let mut record = build_run_record("r", nested_container_workflow(), "c", "t");
        let mut events = Vec::new();
        let ready = collect_ready(&mut record, &mut events);
        // The only dispatchable node is the innermost leaf.
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].node_id, "leaf");
        assert_eq!(record.active_frames.len(), 2);
        assert_eq!(record.frame_stack.len(), 2);
    }

    #[test]
    fn frame_completion_succeeds_container_and_releases_dependents() {
        let mut record = build_run_record("r", nested_container_workflow(), "c", "t");
        let mut events = Vec::new();
        let _ = collect_ready(&mut record, &mut events);

        let inner_id = "wf::outer::sg-outer::mid::sg-inner".to_owned();
        record
            .active_frames
            .get_mut(&inner_id)
            .unwrap()
            .nodes
            .get_mut("leaf")
            .unwrap()
            .status = RunStatus::Succeeded;

        let mut pending = PendingNextTable::default();
        let completion = complete_frame_if_needed(&mut record, &inner_id, &mut pending, &mut events);
        let container = completion.container.unwrap();
        assert_eq!(container.node_id, "mid");
        assert_eq!(container.status, RunStatus::Succeeded);

        // The middle container lives inside the outer frame, which should
        // now also be completable.
        let outer_id = "wf::outer::sg-outer".to_owned();
        let completion = complete_frame_if_needed(&mut record, &outer_id, &mut pending, &mut events);
        let outer = completion.container.unwrap();
        assert_eq!(outer.node_id, "outer");
        assert_eq!(outer.status, RunStatus::Succeeded);
        // Completing the outer container releases "after".
        assert_eq!(completion.ready.len(), 1);
        assert_eq!(completion.ready[0].node_id, "after");
        assert!(record.active_frames.is_empty());
        assert_eq!(record.completed_frames.len(), 2);
    }

    #[test]
    fn failing_frame_cancels_siblings_and_fails_container() {
        let workflow: WorkflowDefinition = serde_json::from_value(serde_json::json!({
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
                        "nodes": [
                            {"id": "x", "type": "t"},
                            {"id": "y", "type": "t"}
                        ]
                    }
                }
            ]
        }))
        .unwrap();
        let mut record = build_run_record("r", workflow, "c", "t");
        let mut events = Vec::new();
        let _ = collect_ready(&mut record, &mut events);

        let frame_id = "wf::c::sg".to_owned();
        {
            let frame = record.active_frames.get_mut(&frame_id).unwrap();
            let x = frame.nodes.get_mut("x").unwrap();
            x.status = RunStatus::Failed;
            x.error = Some(lattice_core::ErrorInfo::new("E.X", "boom"));
        }
        let mut pending = PendingNextTable::default();
        let completion = complete_frame_if_needed(&mut record, &frame_id, &mut pending, &mut events);
        let container = completion.container.unwrap();
        assert_eq!(container.status, RunStatus::Failed);
        assert_eq!(container.error.as_ref().unwrap().code, "E.X");
        // The sibling that never ran was cancelled in the archived frame.
        let archived = &record.completed_frames[&frame_id];
        assert_eq!(archived["y"].status, RunStatus::Cancelled);
        assert!(completion.ready.is_empty());
    }

    #[test]
    fn incomplete_frame_is_untouched() {
        let mut record = build_run_record("r", nested_container_workflow(), "c", "t");
        let mut events = Vec::new();
        let _ = collect_ready(&mut record, &mut events);
        let inner_id = "wf::outer::sg-outer::mid::sg-inner".to_owned();
        let mut pending = PendingNextTable::default();
        let completion = complete_frame_if_needed(&mut record, &inner_id, &mut pending, &mut events);
        assert!(completion.container.is_none());
        assert!(record.active_frames.contains_key(&inner_id));
    }
}
