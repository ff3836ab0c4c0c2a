//! Event projection builders.
//!
//! Every mutating entrypoint gathers its publications through these helpers
//! while the run-state lock is held; the caller publishes after release.
//! Runs without a client session id produce no events.

use chrono::Utc;
use lattice_events::{DeltaOperation, EventData, EventScope, RunEvent};
use serde_json::Value;

use crate::model::{NodeState, RunRecord};
use crate::summary::RunSummary;
use crate::updates::{ChunkEvent, CommandErrorOutcome, FeedbackOutcome, ResultOutcome, SequencedDelta};

fn scope(record: &RunRecord) -> EventScope {
    EventScope {
        tenant: record.tenant.clone(),
        run_id: Some(record.run_id.clone()),
        client_session_id: Some(record.client_id.clone()),
    }
}

fn wants_events(record: &RunRecord) -> bool {
    !record.client_id.is_empty()
}

/// `run.state` for the record's current status.
#[must_use]
pub fn run_state_event(record: &RunRecord) -> RunEvent {
    RunEvent::now(
        scope(record),
        EventData::RunState {
            run_id: record.run_id.clone(),
            status: record.status,
            started_at: record.started_at,
            finished_at: record.finished_at,
            reason: record.error.as_ref().map(|error| error.message.clone()),
        },
    )
}

/// `run.snapshot` with the aggregate view plus node summaries.
#[must_use]
pub fn run_snapshot_event(record: &RunRecord) -> RunEvent {
    let summary = RunSummary::from_record(record);
    let mut run = serde_json::to_value(&summary).unwrap_or(Value::Null);
    let nodes = run
        .as_object_mut()
        .and_then(|object| object.remove("nodes"));
    RunEvent::now(scope(record), EventData::RunSnapshot { run, nodes })
}

/// `node.state` for one node snapshot.
#[must_use]
pub fn node_state_event(record: &RunRecord, node: &NodeState) -> RunEvent {
    let stage = node
        .metadata
        .get("stage")
        .and_then(Value::as_str)
        .map_or_else(|| node.status.to_string(), str::to_owned);
    let progress = node.metadata.get("progress").and_then(Value::as_f64);
    let message = node
        .metadata
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .or_else(|| node.error.as_ref().map(|error| error.message.clone()));
    RunEvent::now(
        scope(record),
        EventData::NodeState {
            run_id: record.run_id.clone(),
            node_id: node.node_id.clone(),
            stage,
            progress,
            message,
            error: node.error.clone(),
        },
    )
}

/// `node.result.snapshot` for one node snapshot.
#[must_use]
pub fn node_result_snapshot_event(record: &RunRecord, node: &NodeState, complete: bool) -> RunEvent {
    let content = match &node.result {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        Some(other) => serde_json::json!({ "value": other }),
        None => Value::Object(serde_json::Map::new()),
    };
    let summary = node
        .error
        .as_ref()
        .map(|error| error.message.clone())
        .or_else(|| {
            node.metadata
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_owned)
        });
    RunEvent::now(
        scope(record),
        EventData::NodeResultSnapshot {
            run_id: record.run_id.clone(),
            node_id: node.node_id.clone(),
            revision: node.seq.unwrap_or(0),
            content,
            artifacts: node.artifacts.clone(),
            complete,
            summary,
        },
    )
}

fn result_delta_event(record: &RunRecord, node: &NodeState, delta: &SequencedDelta) -> RunEvent {
    let payload = (delta.delta.operation != DeltaOperation::Remove)
        .then(|| serde_json::json!({ "value": delta.delta.value }));
    RunEvent::now(
        scope(record),
        EventData::NodeResultDelta {
            run_id: record.run_id.clone(),
            node_id: node.node_id.clone(),
            revision: delta.revision,
            sequence: delta.sequence,
            operation: delta.delta.operation,
            path: Some(delta.delta.path.clone()),
            payload,
            chunk: None,
            terminal: false,
        },
    )
}

fn chunk_delta_event(record: &RunRecord, node: &NodeState, event: &ChunkEvent) -> RunEvent {
    let channel = event.chunk.channel.clone().unwrap_or_else(|| "log".into());
    let mut payload = serde_json::Map::new();
    if let Some(text) = &event.chunk.text {
        payload.insert("text".into(), Value::String(text.clone()));
    }
    if let Some(data) = &event.chunk.data_base64 {
        payload.insert("data".into(), Value::String(data.clone()));
    }
    if let Some(mime_type) = &event.chunk.mime_type {
        payload.insert("mimeType".into(), Value::String(mime_type.clone()));
    }
    let mut chunk_meta = serde_json::Map::new();
    chunk_meta.insert("channel".into(), Value::String(channel.clone()));
    if let Some(metadata) = &event.chunk.metadata {
        chunk_meta.insert("metadata".into(), Value::Object(metadata.clone()));
    }
    RunEvent::now(
        scope(record),
        EventData::NodeResultDelta {
            run_id: record.run_id.clone(),
            node_id: node.node_id.clone(),
            revision: event.revision,
            sequence: event.sequence,
            operation: DeltaOperation::Append,
            path: Some(format!("/channels/{channel}")),
            payload: (!payload.is_empty()).then_some(Value::Object(payload)),
            chunk: Some(Value::Object(chunk_meta)),
            terminal: event.chunk.is_terminal(),
        },
    )
}

/// Events for a freshly created (or cancelled) run: state plus snapshot.
#[must_use]
pub fn run_lifecycle_events(record: &RunRecord) -> Vec<RunEvent> {
    if !wants_events(record) {
        return Vec::new();
    }
    vec![run_state_event(record), run_snapshot_event(record)]
}

/// Events for a node-level mutation: the node state, a `run.state` when the
/// rollup changed, and the run snapshot.
#[must_use]
pub fn node_mutation_events(
    record: &RunRecord,
    node: &NodeState,
    previous_status: lattice_core::RunStatus,
) -> Vec<RunEvent> {
    if !wants_events(record) {
        return Vec::new();
    }
    let mut events = vec![node_state_event(record, node)];
    if record.status != previous_status {
        events.push(run_state_event(record));
    }
    events.push(run_snapshot_event(record));
    events
}

/// Events for a batch of node re-activations (frame starts, chain resets).
#[must_use]
pub fn state_change_events(record: &RunRecord, nodes: &[NodeState]) -> Vec<RunEvent> {
    if !wants_events(record) || nodes.is_empty() {
        return Vec::new();
    }
    let mut events: Vec<RunEvent> = nodes
        .iter()
        .map(|node| node_state_event(record, node))
        .collect();
    events.push(run_snapshot_event(record));
    events
}

/// Events for a result application: node state + result snapshot (host and
/// container included), run state on change, run snapshot, re-activations.
#[must_use]
pub fn result_events(record: &RunRecord, outcome: &ResultOutcome) -> Vec<RunEvent> {
    if !wants_events(record) || outcome.duplicate {
        return Vec::new();
    }
    let complete = outcome.status.is_terminal();
    let mut events = Vec::new();
    if let Some(node) = &outcome.node {
        events.push(node_state_event(record, node));
        events.push(node_result_snapshot_event(record, node, complete));
    }
    if let Some(host) = &outcome.host {
        events.push(node_state_event(record, host));
        events.push(node_result_snapshot_event(record, host, complete));
    }
    if let Some(container) = &outcome.container {
        events.push(node_state_event(record, container));
        events.push(node_result_snapshot_event(record, container, true));
    }
    if record.status != outcome.previous_status {
        events.push(run_state_event(record));
    }
    events.push(run_snapshot_event(record));
    events.extend(state_change_events(record, &outcome.state_events));
    events
}

/// Events for a feedback application: node state when it changed, plus the
/// sequenced result and chunk deltas.
#[must_use]
pub fn feedback_events(record: &RunRecord, outcome: &FeedbackOutcome) -> Vec<RunEvent> {
    if !wants_events(record) {
        return Vec::new();
    }
    let Some(node) = &outcome.node else {
        return Vec::new();
    };
    let mut events = Vec::new();
    if outcome.changed {
        events.push(node_state_event(record, node));
        events.push(node_result_snapshot_event(record, node, false));
    }
    for delta in &outcome.result_deltas {
        events.push(result_delta_event(record, node, delta));
    }
    for chunk in &outcome.chunk_events {
        events.push(chunk_delta_event(record, node, chunk));
    }
    events
}

/// Events for a command-error application.
#[must_use]
pub fn command_error_events(record: &RunRecord, outcome: &CommandErrorOutcome) -> Vec<RunEvent> {
    if !wants_events(record) {
        return Vec::new();
    }
    let mut events = Vec::new();
    if let Some(node) = &outcome.node {
        events.push(node_state_event(record, node));
    }
    if let Some(container) = &outcome.container {
        events.push(node_state_event(record, container));
    }
    if record.status != outcome.previous_status {
        events.push(run_state_event(record));
    }
    events.push(run_snapshot_event(record));
    events
}

/// Worker heartbeat projection, emitted by the session layer.
#[must_use]
pub fn worker_heartbeat_event(
    tenant: &str,
    worker_instance_id: &str,
    worker_name: &str,
    healthy: bool,
    metrics: Value,
) -> RunEvent {
    RunEvent {
        scope: EventScope {
            tenant: tenant.to_owned(),
            run_id: None,
            client_session_id: None,
        },
        occurred_at: Utc::now(),
        data: EventData::WorkerHeartbeat {
            worker_instance_id: worker_instance_id.to_owned(),
            worker_name: worker_name.to_owned(),
            healthy,
            metrics,
        },
    }
}
