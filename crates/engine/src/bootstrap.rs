//! Run bootstrap: graph construction from a workflow definition.

use std::collections::HashMap;

use chrono::Utc;
use indexmap::IndexMap;
use lattice_core::workflow::extract_middleware_entries;
use lattice_core::{RunStatus, WorkflowDefinition, definition_hash};
use serde_json::Value;

use crate::frames;
use crate::model::{FrameDefinition, NodeRole, NodeState, RunRecord};
use crate::propagate::build_edge_bindings_for_workflow;
use crate::scope::WorkflowScopeIndex;

/// Build the node map and task index for one graph (the root workflow or a
/// frame's cloned subgraph).
///
/// Creates a `NodeState` per workflow node, one per middleware chain entry
/// (role `middleware`, `chain_blocked` for every link past the first), wires
/// dependency edges, and gives the first middleware of each chain the same
/// upstream dependencies as its host.
pub(crate) fn build_graph_nodes(
    workflow: &WorkflowDefinition,
    run_id: &str,
    frame: Option<&FrameDefinition>,
) -> (IndexMap<String, NodeState>, HashMap<String, String>) {
    let mut nodes: IndexMap<String, NodeState> = IndexMap::new();
    let mut task_index: HashMap<String, String> = HashMap::new();

    let task_id_for = |node_id: &str| match frame {
        Some(frame) => format!("{}::{node_id}", frame.frame_id),
        None => node_id.to_owned(),
    };
    let concurrency_key_for = |node_id: &str| match frame {
        Some(frame) => format!("{run_id}:{}:{node_id}", frame.frame_id),
        None => format!("{run_id}:{node_id}"),
    };
    let apply_frame_linkage = |state: &mut NodeState| {
        if let Some(frame) = frame {
            state.frame_id = Some(frame.frame_id.clone());
            state.container_node_id = Some(frame.container_node_id.clone());
            state.subgraph_id = Some(frame.subgraph_id.clone());
            state.frame_alias = frame.alias_chain.clone();
        }
    };

    for node in &workflow.nodes {
        let (middleware_ids, middleware_defs) = extract_middleware_entries(&node.middlewares);
        let mut state = NodeState::new(node.id.clone(), task_id_for(&node.id));
        state.node_type = node.node_type.clone();
        if let Some(package) = &node.package {
            state.package_name = package.name.clone();
            state.package_version = package.version.clone();
        }
        state.parameters = node.parameters.clone();
        state.concurrency_key = concurrency_key_for(&node.id);
        state.chain_blocked = !middleware_ids.is_empty();
        state.role = if node.is_container() {
            NodeRole::Container
        } else {
            NodeRole::Plain
        };
        if let Some(role) = &node.role {
            state.metadata.insert("role".into(), Value::String(role.clone()));
        }
        state.middlewares = middleware_ids.clone();
        state.middleware_defs = middleware_defs.clone();
        apply_frame_linkage(&mut state);
        task_index.insert(state.task_id.clone(), state.node_id.clone());
        nodes.insert(state.node_id.clone(), state);

        for (index, def) in middleware_defs.iter().enumerate() {
            if def.id.is_empty() || nodes.contains_key(&def.id) {
                continue;
            }
            let mut mw = NodeState::new(def.id.clone(), task_id_for(&def.id));
            mw.node_type = def.node_type.clone();
            if let Some(package) = &def.package {
                mw.package_name = package.name.clone();
                mw.package_version = package.version.clone();
            }
            mw.parameters = def.parameters.clone();
            mw.concurrency_key = concurrency_key_for(&def.id);
            mw.chain_blocked = index > 0;
            mw.role = NodeRole::Middleware {
                host_node_id: node.id.clone(),
                chain_index: index,
            };
            mw.metadata.insert("role".into(), Value::String("middleware".into()));
            mw.metadata
                .insert("hostNodeId".into(), Value::String(node.id.clone()));
            mw.metadata
                .insert("chainIndex".into(), Value::Number(index.into()));
            apply_frame_linkage(&mut mw);
            task_index.insert(mw.task_id.clone(), mw.node_id.clone());
            nodes.insert(mw.node_id.clone(), mw);
        }
    }

    for edge in &workflow.edges {
        let source = edge.source.node.as_str();
        let target = edge.target.node.as_str();
        if source.is_empty() || target.is_empty() {
            continue;
        }
        if !nodes.contains_key(source) || !nodes.contains_key(target) {
            continue;
        }
        {
            let target_state = nodes.get_mut(target).unwrap_or_else(|| unreachable!());
            target_state.dependencies.push(source.to_owned());
            target_state.pending_dependencies += 1;
        }
        let source_state = nodes.get_mut(source).unwrap_or_else(|| unreachable!());
        source_state.dependents.push(target.to_owned());
    }

    // The first middleware waits for the same upstream dependencies as its
    // host; chain order itself is driven by middleware.next, not edges.
    for node in &workflow.nodes {
        let (middleware_ids, _) = extract_middleware_entries(&node.middlewares);
        let Some(first_mw_id) = middleware_ids.first() else {
            continue;
        };
        let Some(host_dependencies) = nodes.get(&node.id).map(|host| host.dependencies.clone())
        else {
            continue;
        };
        for dep_id in host_dependencies {
            if dep_id == *first_mw_id {
                continue;
            }
            if let Some(first_mw) = nodes.get_mut(first_mw_id)
                && !first_mw.dependencies.contains(&dep_id)
            {
                first_mw.dependencies.push(dep_id.clone());
                first_mw.pending_dependencies += 1;
                if let Some(dep) = nodes.get_mut(&dep_id)
                    && !dep.dependents.contains(first_mw_id)
                {
                    dep.dependents.push(first_mw_id.clone());
                }
            }
        }
    }

    (nodes, task_index)
}

/// Build a complete run record from a submitted workflow.
#[must_use]
pub fn build_run_record(
    run_id: &str,
    workflow: WorkflowDefinition,
    client_id: &str,
    tenant: &str,
) -> RunRecord {
    let definition_hash = definition_hash(&workflow);
    let (nodes, task_index) = build_graph_nodes(&workflow, run_id, None);
    let scope_index = WorkflowScopeIndex::new(&workflow);
    let edge_bindings = build_edge_bindings_for_workflow(&workflow, &scope_index);
    let (frame_definitions, frames_by_parent) = frames::build_container_frames(&workflow);

    let mut record = RunRecord {
        run_id: run_id.to_owned(),
        definition_hash,
        client_id: client_id.to_owned(),
        workflow,
        tenant: tenant.to_owned(),
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
        nodes,
        task_index,
        edge_bindings,
        scope_index,
        frames: frame_definitions,
        frames_by_parent,
        active_frames: IndexMap::new(),
        frame_stack: Vec::new(),
        completed_frames: IndexMap::new(),
    };
    // A workflow with zero nodes has nothing to wait for.
    if record.nodes.is_empty() {
        record.status = RunStatus::Succeeded;
        record.finished_at = Some(Utc::now());
    }
    record
}
