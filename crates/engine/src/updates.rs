//! Application of worker-reported results, feedback and command errors.

use chrono::Utc;
use lattice_core::{ErrorInfo, RunStatus};
use lattice_protocol::{ErrorPayload, FeedbackChunk, FeedbackPayload, NextResponsePayload, ResultPayload};
use serde_json::{Map, Value};

use crate::frames::{complete_frame_if_needed, release_dependents};
use crate::model::{DispatchRequest, NodeLocation, NodeState, RunRecord};
use crate::pending::PendingNextTable;
use crate::pointer::{ResultDelta, merge_result_updates};
use crate::propagate::{apply_bindings_for_graph, apply_middleware_output_bindings};

/// Outcome of applying a `biz.exec.result`.
#[derive(Debug, Default)]
pub struct ResultOutcome {
    /// Snapshot of the reporting node after mutation.
    pub node: Option<NodeState>,
    /// Snapshot of the host, when a middleware finalised it.
    pub host: Option<NodeState>,
    /// Snapshot of a container finalised by frame completion.
    pub container: Option<NodeState>,
    /// Newly released dispatch requests.
    pub ready: Vec<DispatchRequest>,
    /// Responses for pending `next()` calls resolved by this result.
    pub next_responses: Vec<(Option<String>, NextResponsePayload)>,
    /// Node snapshots for re-activation events (frame starts etc.).
    pub state_events: Vec<NodeState>,
    /// Run status before the mutation.
    pub previous_status: RunStatus,
    /// Normalised status the worker reported.
    pub status: RunStatus,
    /// `true` when the result was a duplicate and nothing changed.
    pub duplicate: bool,
}

fn apply_graph_bindings(record: &mut RunRecord, location: &NodeLocation, node_id: &str) {
    match location {
        NodeLocation::Root => {
            apply_bindings_for_graph(node_id, &record.edge_bindings.clone(), &mut record.nodes);
        }
        NodeLocation::Frame(frame_id) => {
            if let Some(frame) = record.active_frames.get_mut(frame_id) {
                let bindings = frame.edge_bindings.clone();
                apply_bindings_for_graph(node_id, &bindings, &mut frame.nodes);
            }
        }
    }
}

/// Apply a terminal task result.
///
/// Hosts with pending middleware return to `queued` instead of
/// finalising; middleware completion projects output bindings onto the
/// host and the outermost link (or a skip) finalises it. Frame membership
/// triggers a completion check, and pending `next()` calls waiting on this
/// task are resolved.
pub fn apply_result(
    record: &mut RunRecord,
    payload: &ResultPayload,
    pending: &mut PendingNextTable,
) -> ResultOutcome {
    let previous_status = record.status;
    let status = RunStatus::normalise(&payload.status);
    let mut outcome = ResultOutcome {
        previous_status,
        status,
        ..ResultOutcome::default()
    };

    let (location, node_id) = match record.locate(None, Some(&payload.task_id)) {
        Some(found) => found,
        None => {
            record.get_or_insert_root_node(&payload.task_id, &payload.task_id);
            (NodeLocation::Root, payload.task_id.clone())
        }
    };

    // Same dispatch reported twice: the first application won.
    if record
        .node(&location, &node_id)
        .is_some_and(|node| node.status.is_terminal())
    {
        outcome.duplicate = true;
        outcome.node = record.node(&location, &node_id).cloned();
        return outcome;
    }

    let timestamp = Utc::now();
    let run_error;
    let frame_id = match &location {
        NodeLocation::Frame(frame_id) => Some(frame_id.clone()),
        NodeLocation::Root => None,
    };
    {
        let Some(node) = record.node_mut(&location, &node_id) else {
            return outcome;
        };
        node.status = status;
        node.finished_at = Some(timestamp);
        node.result = payload.result.clone();
        if let Some(incoming) = &payload.metadata {
            // Preserve existing role/host metadata while merging adapter keys.
            for (key, value) in incoming {
                node.metadata.insert(key.clone(), value.clone());
            }
        }
        node.artifacts = payload.artifacts.clone();
        node.error = None;
        node.enqueued = false;
        if let Some(error) = &payload.error {
            let mut info = ErrorInfo::new(error.code.clone(), error.message.clone());
            if let Some(remediation) = &error.remediation {
                info = info.with_details(serde_json::json!({ "remediation": remediation }));
            }
            node.error = Some(info.clone());
            run_error = Some(info);
        } else {
            run_error = None;
        }
    }
    record.duration_ms = payload.duration_ms;
    record.result_payload = payload.result.clone();
    if let Some(error) = run_error {
        record.error = Some(error);
    } else if status == RunStatus::Succeeded {
        record.error = None;
    }

    let node_view = record
        .node(&location, &node_id)
        .cloned()
        .unwrap_or_else(|| NodeState::new(node_id.clone(), payload.task_id.clone()));

    if node_view.is_host_with_middleware() {
        // The middleware chain keeps looping; the host may be dispatched
        // again via next() until the outermost link completes.
        let Some(node) = record.node_mut(&location, &node_id) else {
            return outcome;
        };
        if status != RunStatus::Skipped {
            node.status = RunStatus::Queued;
        }
        node.enqueued = false;
        node.pending_dependencies = 0;
        node.chain_blocked = true;
    } else if status.is_success_like() {
        apply_graph_bindings(record, &location, &node_id);
        release_dependents(
            record,
            &location,
            &node_id,
            &mut outcome.ready,
            &mut outcome.state_events,
        );
    }

    if node_view.is_middleware() {
        {
            let Some(node) = record.node_mut(&location, &node_id) else {
                return outcome;
            };
            if status.is_success_like() {
                node.enqueued = false;
                node.pending_dependencies = 0;
                node.chain_blocked = false;
            } else {
                node.chain_blocked = true;
            }
        }
        if let Some(host_id) = node_view.host_node_id().map(str::to_owned) {
            let middleware_view = record
                .node(&location, &node_id)
                .cloned()
                .unwrap_or(node_view.clone());
            if let Some((host_location, host_node_id)) = record.locate(Some(&host_id), None) {
                let should_finalise =
                    status == RunStatus::Skipped || node_view.is_outermost_middleware();
                let mut finalised = false;
                {
                    let Some(host) = record.node_mut(&host_location, &host_node_id) else {
                        return outcome;
                    };
                    apply_middleware_output_bindings(host, &middleware_view);
                    if should_finalise && !host.status.is_terminal() {
                        host.status = status;
                        host.finished_at = Some(timestamp);
                        host.enqueued = false;
                        host.pending_dependencies = 0;
                        host.chain_blocked = false;
                        finalised = true;
                    }
                }
                if finalised && status.is_success_like() {
                    apply_graph_bindings(record, &host_location, &host_node_id);
                    release_dependents(
                        record,
                        &host_location,
                        &host_node_id,
                        &mut outcome.ready,
                        &mut outcome.state_events,
                    );
                }
                outcome.host = record.node(&host_location, &host_node_id).cloned();
            }
        }
    }

    // Snapshot before frame completion: finalising the frame archives its
    // node map out of the active set.
    let final_node = record.node(&location, &node_id).cloned();

    if let Some(frame_id) = frame_id {
        let completion =
            complete_frame_if_needed(record, &frame_id, pending, &mut outcome.state_events);
        outcome.ready.extend(completion.ready);
        outcome.next_responses.extend(completion.next_responses);
        outcome.container = completion.container;
    }

    // Resolve pending middleware.next calls waiting on this task.
    if let Some(node) = final_node {
        let responses = pending.finalise_for_task(
            &record.run_id.clone(),
            &node,
            status,
            node.error.as_ref(),
            node.result.as_ref(),
        );
        outcome.next_responses.extend(responses);
        outcome.node = Some(node);
    }

    record.refresh_rollup();
    outcome
}

/// One sequenced result delta carried out of a feedback application.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedDelta {
    /// The mutation.
    pub delta: ResultDelta,
    /// Revision (the node's dispatch sequence).
    pub revision: u64,
    /// Monotonic sequence within the revision.
    pub sequence: u64,
}

/// One sequenced stream chunk carried out of a feedback application.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkEvent {
    /// The chunk as reported.
    pub chunk: FeedbackChunk,
    /// Revision (the node's dispatch sequence).
    pub revision: u64,
    /// Monotonic sequence within the revision.
    pub sequence: u64,
}

/// Outcome of applying a `biz.exec.feedback`.
#[derive(Debug, Default)]
pub struct FeedbackOutcome {
    /// Snapshot of the node after the merge, when anything changed.
    pub node: Option<NodeState>,
    /// `true` when node state changed beyond chunk appends.
    pub changed: bool,
    /// Sequenced stream chunks.
    pub chunk_events: Vec<ChunkEvent>,
    /// Sequenced result deltas.
    pub result_deltas: Vec<SequencedDelta>,
}

/// Merge a non-terminal feedback update into a node.
pub fn apply_feedback(record: &mut RunRecord, payload: &FeedbackPayload) -> FeedbackOutcome {
    let (location, node_id) = match record.locate(None, Some(&payload.task_id)) {
        Some(found) => found,
        None => {
            record.get_or_insert_root_node(&payload.task_id, &payload.task_id);
            (NodeLocation::Root, payload.task_id.clone())
        }
    };
    let mut outcome = FeedbackOutcome::default();
    let Some(node) = record.node_mut(&location, &node_id) else {
        return outcome;
    };

    let now = Utc::now();
    node.metadata
        .insert("lastUpdatedAt".into(), Value::String(now.to_rfc3339()));
    if let Some(stage) = &payload.stage {
        node.metadata.insert("stage".into(), Value::String(stage.clone()));
        outcome.changed = true;
    }
    if let Some(progress) = payload.progress {
        if let Some(number) = serde_json::Number::from_f64(progress) {
            node.metadata.insert("progress".into(), Value::Number(number));
            outcome.changed = true;
        }
    }
    if let Some(message) = &payload.message {
        node.metadata
            .insert("message".into(), Value::String(message.clone()));
        outcome.changed = true;
    }

    let incoming = payload.metadata.clone().unwrap_or_default();
    let mut incoming_results = incoming.get("results").and_then(Value::as_object).cloned();
    if incoming_results.is_none()
        && let Some(summary) = incoming.get("summary")
    {
        let mut map = Map::new();
        map.insert("summary".into(), summary.clone());
        incoming_results = Some(map);
    }
    for (key, value) in &incoming {
        if key == "results" {
            continue;
        }
        if value.is_null() {
            if node.metadata.remove(key).is_some() {
                outcome.changed = true;
            }
        } else if node.metadata.get(key) != Some(value) {
            node.metadata.insert(key.clone(), value.clone());
            outcome.changed = true;
        }
    }

    if let Some(updates) = incoming_results {
        if !matches!(node.result, Some(Value::Object(_))) {
            node.result = Some(Value::Object(Map::new()));
        }
        let revision = node.seq.unwrap_or(0);
        let mut sequence = node.result_sequence;
        if let Some(Value::Object(target)) = node.result.as_mut() {
            let deltas = merge_result_updates(target, &updates);
            if !deltas.is_empty() {
                outcome.changed = true;
            }
            for delta in deltas {
                sequence += 1;
                outcome.result_deltas.push(SequencedDelta {
                    delta,
                    revision,
                    sequence,
                });
            }
        }
        node.result_sequence = sequence;
    }

    if let Some(metrics) = &payload.metrics {
        let entry = node
            .metadata
            .entry("metrics".to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Some(target) = entry.as_object_mut() {
            for (key, value) in metrics {
                target.insert(key.clone(), value.clone());
            }
        }
        outcome.changed = true;
    }

    if !payload.chunks.is_empty() {
        let revision = node.seq.unwrap_or(0);
        for chunk in &payload.chunks {
            node.feedback_sequence += 1;
            outcome.chunk_events.push(ChunkEvent {
                chunk: chunk.clone(),
                revision,
                sequence: node.feedback_sequence,
            });
        }
        outcome.changed = true;
    }

    if outcome.changed || !outcome.chunk_events.is_empty() {
        outcome.node = Some(node.clone());
    }
    outcome
}

/// Outcome of applying a `biz.exec.error` that fails the run.
#[derive(Debug, Default)]
pub struct CommandErrorOutcome {
    /// Snapshot of the failed node, when one was identified.
    pub node: Option<NodeState>,
    /// Snapshot of a container finalised by frame completion.
    pub container: Option<NodeState>,
    /// Dispatch requests released by frame completion.
    pub ready: Vec<DispatchRequest>,
    /// Responses for pending `next()` calls resolved by frame completion.
    pub next_responses: Vec<(Option<String>, NextResponsePayload)>,
    /// Node snapshots for re-activation events.
    pub state_events: Vec<NodeState>,
    /// Run status before the mutation.
    pub previous_status: RunStatus,
}

/// Apply a structured command error: the run fails, and the named node (or
/// the most recently dispatched one) is marked failed.
pub fn apply_command_error(
    record: &mut RunRecord,
    payload: &ErrorPayload,
    task_id: Option<&str>,
    pending: &mut PendingNextTable,
) -> CommandErrorOutcome {
    let mut outcome = CommandErrorOutcome {
        previous_status: record.status,
        ..CommandErrorOutcome::default()
    };
    let details = payload
        .context
        .as_ref()
        .and_then(|context| context.details.clone());
    let mut error = ErrorInfo::new(payload.code.clone(), payload.message.clone());
    if let Some(details) = details {
        error = error.with_details(details);
    }
    record.error = Some(error.clone());
    record.status = RunStatus::Failed;

    let located = task_id
        .and_then(|task_id| record.locate(None, Some(task_id)))
        .or_else(|| {
            record
                .node_id
                .clone()
                .and_then(|node_id| record.locate(Some(&node_id), None))
        });

    if let Some((location, node_id)) = located {
        let frame_id = match &location {
            NodeLocation::Frame(frame_id) => Some(frame_id.clone()),
            NodeLocation::Root => None,
        };
        if let Some(node) = record.node_mut(&location, &node_id) {
            node.status = RunStatus::Failed;
            node.finished_at = Some(Utc::now());
            node.error = Some(error);
            node.enqueued = false;
            node.pending_ack = false;
            node.dispatch_id = None;
            node.ack_deadline = None;
            node.worker_name = None;
            outcome.node = Some(node.clone());
        }
        if let Some(frame_id) = frame_id {
            let completion =
                complete_frame_if_needed(record, &frame_id, pending, &mut outcome.state_events);
            outcome.ready.extend(completion.ready);
            outcome.next_responses.extend(completion.next_responses);
            outcome.container = completion.container;
        }
    }

    record.refresh_rollup();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::build_run_record;
    use crate::ready::collect_ready;
    use lattice_core::WorkflowDefinition;
    use pretty_assertions::assert_eq;

    fn fan_workflow() -> WorkflowDefinition {
        serde_json::from_value(serde_json::json!({
            "id": "wf",
            "nodes": [
                {"id": "a", "type": "t"},
                {"id": "b", "type": "t"},
                {"id": "c", "type": "t"},
                {"id": "d", "type": "t"}
            ],
            "edges": [
                {"source": {"node": "a"}, "target": {"node": "b"}},
                {"source": {"node": "a"}, "target": {"node": "c"}},
                {"source": {"node": "b"}, "target": {"node": "d"}},
                {"source": {"node": "c"}, "target": {"node": "d"}}
            ]
        }))
        .unwrap()
    }

    fn result(task_id: &str, status: &str) -> ResultPayload {
        ResultPayload {
            run_id: "r".into(),
            task_id: task_id.into(),
            status: status.into(),
            result: Some(serde_json::json!({"out": task_id})),
            error: None,
            metadata: None,
            artifacts: Vec::new(),
            duration_ms: Some(10),
        }
    }

    #[test]
    fn success_releases_fan_out() {
        let mut record = build_run_record("r", fan_workflow(), "c", "t");
        let mut pending = PendingNextTable::default();
        let mut events = Vec::new();
        let _ = collect_ready(&mut record, &mut events);

        let outcome = apply_result(&mut record, &result("a", "succeeded"), &mut pending);
        let released: Vec<&str> = outcome.ready.iter().map(|r| r.node_id.as_str()).collect();
        assert_eq!(released, vec!["b", "c"]);
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(record.nodes["d"].pending_dependencies, 2);
    }

    #[test]
    fn join_waits_for_all_upstreams() {
        let mut record = build_run_record("r", fan_workflow(), "c", "t");
        let mut pending = PendingNextTable::default();
        let mut events = Vec::new();
        let _ = collect_ready(&mut record, &mut events);
        let _ = apply_result(&mut record, &result("a", "succeeded"), &mut pending);

        let outcome = apply_result(&mut record, &result("b", "succeeded"), &mut pending);
        assert!(outcome.ready.is_empty());
        let outcome = apply_result(&mut record, &result("c", "succeeded"), &mut pending);
        assert_eq!(outcome.ready.len(), 1);
        assert_eq!(outcome.ready[0].node_id, "d");
    }

    #[test]
    fn failure_sets_run_error_and_releases_nothing() {
        let mut record = build_run_record("r", fan_workflow(), "c", "t");
        let mut pending = PendingNextTable::default();
        let mut events = Vec::new();
        let _ = collect_ready(&mut record, &mut events);

        let mut payload = result("a", "failed");
        payload.error = Some(lattice_protocol::ResultError {
            code: "E.TASK".into(),
            message: "boom".into(),
            remediation: Some("try again".into()),
        });
        let outcome = apply_result(&mut record, &payload, &mut pending);
        assert!(outcome.ready.is_empty());
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.error.as_ref().unwrap().code, "E.TASK");
        // Dependents of the failed node stay queued; the rollup carries
        // the verdict.
        assert_eq!(record.nodes["b"].status, RunStatus::Queued);
    }

    #[test]
    fn duplicate_result_is_a_no_op() {
        let mut record = build_run_record("r", fan_workflow(), "c", "t");
        let mut pending = PendingNextTable::default();
        let mut events = Vec::new();
        let _ = collect_ready(&mut record, &mut events);

        let first = apply_result(&mut record, &result("a", "succeeded"), &mut pending);
        assert!(!first.duplicate);
        let second = apply_result(&mut record, &result("a", "succeeded"), &mut pending);
        assert!(second.duplicate);
        assert!(second.ready.is_empty());
        // Dependents were not double-released.
        assert_eq!(record.nodes["d"].pending_dependencies, 2);
    }

    #[test]
    fn host_with_middleware_returns_to_queued() {
        let workflow: WorkflowDefinition = serde_json::from_value(serde_json::json!({
            "id": "wf",
            "nodes": [
                {"id": "h", "type": "t", "middlewares": ["m1", "m2"]},
                {"id": "z", "type": "t"}
            ],
            "edges": [{"source": {"node": "h"}, "target": {"node": "z"}}]
        }))
        .unwrap();
        let mut record = build_run_record("r", workflow, "c", "t");
        let mut pending = PendingNextTable::default();

        let outcome = apply_result(&mut record, &result("h", "succeeded"), &mut pending);
        assert_eq!(record.nodes["h"].status, RunStatus::Queued);
        assert!(record.nodes["h"].chain_blocked);
        assert!(outcome.ready.is_empty());
        assert_eq!(record.nodes["z"].status, RunStatus::Queued);
    }

    #[test]
    fn outermost_middleware_finalises_host() {
        let workflow: WorkflowDefinition = serde_json::from_value(serde_json::json!({
            "id": "wf",
            "nodes": [
                {"id": "h", "type": "t", "middlewares": ["m1", "m2"]},
                {"id": "z", "type": "t"}
            ],
            "edges": [{"source": {"node": "h"}, "target": {"node": "z"}}]
        }))
        .unwrap();
        let mut record = build_run_record("r", workflow, "c", "t");
        let mut pending = PendingNextTable::default();

        // Host ran via next() and reported; it waits queued for the chain.
        let _ = apply_result(&mut record, &result("h", "succeeded"), &mut pending);
        // Inner middleware (chain_index 1) completes: host untouched.
        let outcome = apply_result(&mut record, &result("m2", "succeeded"), &mut pending);
        assert!(outcome.ready.is_empty());
        assert_eq!(record.nodes["h"].status, RunStatus::Queued);
        // Outermost middleware completes: host finalises and releases z.
        let outcome = apply_result(&mut record, &result("m1", "succeeded"), &mut pending);
        assert_eq!(record.nodes["h"].status, RunStatus::Succeeded);
        let released: Vec<&str> = outcome.ready.iter().map(|r| r.node_id.as_str()).collect();
        assert!(released.contains(&"z"));
        assert_eq!(outcome.host.as_ref().unwrap().node_id, "h");
    }

    #[test]
    fn feedback_merges_metadata_and_results() {
        let mut record = build_run_record("r", fan_workflow(), "c", "t");
        record.nodes.get_mut("a").unwrap().seq = Some(3);
        let payload = FeedbackPayload {
            run_id: "r".into(),
            task_id: "a".into(),
            stage: Some("working".into()),
            progress: Some(0.5),
            message: Some("halfway".into()),
            metadata: Some(
                serde_json::json!({"results": {"tokens": 5}, "custom": "x"})
                    .as_object()
                    .cloned()
                    .unwrap(),
            ),
            metrics: Some(serde_json::json!({"cpu": 0.2}).as_object().cloned().unwrap()),
            chunks: Vec::new(),
        };
        let outcome = apply_feedback(&mut record, &payload);
        assert!(outcome.changed);
        assert_eq!(outcome.result_deltas.len(), 1);
        let delta = &outcome.result_deltas[0];
        assert_eq!(delta.delta.path, "/tokens");
        assert_eq!(delta.revision, 3);
        assert_eq!(delta.sequence, 1);
        let node = &record.nodes["a"];
        assert_eq!(node.metadata.get("stage"), Some(&serde_json::json!("working")));
        assert_eq!(node.result, Some(serde_json::json!({"tokens": 5})));
        assert_eq!(
            node.metadata.get("metrics"),
            Some(&serde_json::json!({"cpu": 0.2}))
        );
    }

    #[test]
    fn feedback_sequences_accumulate() {
        let mut record = build_run_record("r", fan_workflow(), "c", "t");
        let mk = |n: i64| FeedbackPayload {
            run_id: "r".into(),
            task_id: "a".into(),
            stage: None,
            progress: None,
            message: None,
            metadata: Some(
                serde_json::json!({"results": {"count": n}}).as_object().cloned().unwrap(),
            ),
            metrics: None,
            chunks: Vec::new(),
        };
        let first = apply_feedback(&mut record, &mk(1));
        let second = apply_feedback(&mut record, &mk(2));
        assert_eq!(first.result_deltas[0].sequence, 1);
        assert_eq!(second.result_deltas[0].sequence, 2);
    }

    #[test]
    fn feedback_chunks_sequence_and_terminal() {
        let mut record = build_run_record("r", fan_workflow(), "c", "t");
        let payload = FeedbackPayload {
            run_id: "r".into(),
            task_id: "a".into(),
            stage: None,
            progress: None,
            message: None,
            metadata: None,
            metrics: None,
            chunks: vec![
                serde_json::from_value(serde_json::json!({"channel": "tokens", "text": "hi"}))
                    .unwrap(),
                serde_json::from_value(
                    serde_json::json!({"channel": "tokens", "text": "", "metadata": {"terminal": true}}),
                )
                .unwrap(),
            ],
        };
        let outcome = apply_feedback(&mut record, &payload);
        assert_eq!(outcome.chunk_events.len(), 2);
        assert_eq!(outcome.chunk_events[0].sequence, 1);
        assert_eq!(outcome.chunk_events[1].sequence, 2);
        assert!(outcome.chunk_events[1].chunk.is_terminal());
    }

    #[test]
    fn command_error_fails_run_and_node() {
        let mut record = build_run_record("r", fan_workflow(), "c", "t");
        let mut pending = PendingNextTable::default();
        let payload = ErrorPayload {
            code: "E.DISPATCH.UNAVAILABLE".into(),
            message: "no worker".into(),
            context: None,
        };
        let outcome = apply_command_error(&mut record, &payload, Some("a"), &mut pending);
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.error.as_ref().unwrap().code, "E.DISPATCH.UNAVAILABLE");
        assert_eq!(outcome.node.as_ref().unwrap().status, RunStatus::Failed);
    }
}
