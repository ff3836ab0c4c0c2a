//! Run lifecycle mutations: dispatch stamping, acks, cancellation, resets.

use chrono::{DateTime, Utc};
use lattice_core::RunStatus;

use crate::model::{NodeState, RunRecord};
use crate::pending::{ExpiredNextRequest, PendingNextTable};

/// Snapshot pair returned from node-level lifecycle mutations.
#[derive(Debug)]
pub struct NodeMutation {
    /// Clone of the mutated node.
    pub node: NodeState,
    /// Run status before the mutation.
    pub previous_status: RunStatus,
}

/// Fields identifying a dispatch being stamped onto a run.
#[derive(Debug, Clone)]
pub struct DispatchStamp {
    /// Chosen worker.
    pub worker_name: String,
    /// Task id of the dispatch.
    pub task_id: String,
    /// Node id of the dispatch.
    pub node_id: String,
    /// Node type.
    pub node_type: String,
    /// Package name.
    pub package_name: String,
    /// Package version.
    pub package_version: String,
    /// Dispatch sequence used.
    pub seq_used: u64,
    /// Resource refs snapshot, when attached.
    pub resource_refs: Option<Vec<serde_json::Value>>,
    /// Affinity snapshot, when attached.
    pub affinity: Option<serde_json::Value>,
    /// Envelope id of the dispatch.
    pub dispatch_id: Option<String>,
    /// Ack deadline for the dispatch.
    pub ack_deadline: Option<DateTime<Utc>>,
}

/// Record a dispatch handed to a worker: node goes running with pending
/// ack, run-level dispatch surface fields update, and `nextSeq` advances.
///
/// When the rollup lands terminal, the run's pending `next()` requests are
/// purged.
pub fn mark_dispatched(
    record: &mut RunRecord,
    stamp: &DispatchStamp,
    pending: &mut PendingNextTable,
) -> Option<NodeMutation> {
    let previous_status = record.status;
    let timestamp = Utc::now();
    record.status = RunStatus::Running;
    record.started_at = record.started_at.or(Some(timestamp));
    record.worker_name = Some(stamp.worker_name.clone());
    record.task_id = Some(stamp.task_id.clone());
    record.node_id = Some(stamp.node_id.clone());
    record.node_type = Some(stamp.node_type.clone());
    record.package_name = Some(stamp.package_name.clone());
    record.package_version = Some(stamp.package_version.clone());
    record.next_seq = record.next_seq.max(stamp.seq_used + 1);

    let located = record.locate(Some(&stamp.node_id), Some(&stamp.task_id));
    let node_snapshot = match located {
        Some((location, node_id)) => {
            let node = record.node_mut(&location, &node_id)?;
            apply_stamp(node, stamp, timestamp);
            node.clone()
        }
        None => {
            let node = record.get_or_insert_root_node(&stamp.node_id, &stamp.task_id);
            apply_stamp(node, stamp, timestamp);
            node.clone()
        }
    };

    record.refresh_rollup();
    if record.status.is_terminal() {
        let _ = pending.purge_run(&record.run_id.clone());
    }
    Some(NodeMutation {
        node: node_snapshot,
        previous_status,
    })
}

fn apply_stamp(node: &mut NodeState, stamp: &DispatchStamp, timestamp: DateTime<Utc>) {
    node.status = RunStatus::Running;
    node.worker_name = Some(stamp.worker_name.clone());
    node.started_at = Some(timestamp);
    node.finished_at = None;
    node.seq = Some(stamp.seq_used);
    if let Some(resource_refs) = &stamp.resource_refs {
        node.resource_refs = resource_refs.clone();
    }
    if let Some(affinity) = &stamp.affinity {
        node.affinity = Some(affinity.clone());
    }
    node.error = None;
    node.enqueued = false;
    node.pending_ack = stamp.dispatch_id.is_some();
    node.dispatch_id = stamp.dispatch_id.clone();
    node.ack_deadline = stamp.ack_deadline;
}

/// Clear the pending-ack flag once `control.ack` arrives for a dispatch.
///
/// Returns `None` when the dispatch id no longer maps to the named node
/// (late ack after a reset).
pub fn mark_acknowledged(
    record: &mut RunRecord,
    node_id: &str,
    dispatch_id: &str,
) -> Option<NodeMutation> {
    let (location, found_node_id) = record.locate_by_dispatch(dispatch_id)?;
    if found_node_id != node_id {
        return None;
    }
    let previous_status = record.status;
    let node = record.node_mut(&location, &found_node_id)?;
    node.pending_ack = false;
    node.ack_deadline = None;
    let node_snapshot = node.clone();
    record.refresh_rollup();
    Some(NodeMutation {
        node: node_snapshot,
        previous_status,
    })
}

/// Cancel a run: every non-terminal node (frames included) becomes
/// cancelled, frames are torn down, and the run's pending `next()` entries
/// are purged for synthetic responses.
pub fn cancel_run(
    record: &mut RunRecord,
    pending: &mut PendingNextTable,
) -> Vec<ExpiredNextRequest> {
    let timestamp = Utc::now();
    let cancel = |node: &mut NodeState| {
        if node.status.is_terminal() {
            return;
        }
        node.status = RunStatus::Cancelled;
        node.enqueued = false;
        node.pending_dependencies = 0;
        node.pending_ack = false;
        node.dispatch_id = None;
        node.ack_deadline = None;
        node.finished_at = Some(timestamp);
    };
    for node in record.nodes.values_mut() {
        cancel(node);
    }
    for frame in record.active_frames.values_mut() {
        for node in frame.nodes.values_mut() {
            cancel(node);
        }
    }
    record.active_frames.clear();
    record.frame_stack.clear();
    record.status = RunStatus::Cancelled;
    record.finished_at = Some(timestamp);

    let cancelled = pending.purge_run(&record.run_id.clone());
    record.refresh_rollup();
    // The rollup reflects node statuses; the run-level verdict stays
    // cancelled even when some nodes had already succeeded.
    record.status = RunStatus::Cancelled;
    cancelled
}

fn clear_run_dispatch_surface(record: &mut RunRecord, node: &NodeState) {
    if record.node_id.as_deref() == Some(&node.node_id) {
        record.node_id = None;
    }
    if record.task_id.as_deref() == Some(&node.task_id) {
        record.task_id = None;
    }
    if record.node_type.as_deref() == Some(&node.node_type) {
        record.node_type = None;
    }
    if record.worker_name == node.worker_name {
        record.worker_name = None;
    }
    if record.package_name.as_deref() == Some(&node.package_name) {
        record.package_name = None;
    }
    if record.package_version.as_deref() == Some(&node.package_version) {
        record.package_version = None;
    }
}

/// Reset a node whose dispatch was never acknowledged: back to queued with
/// counters cleared, still enqueued so the dispatcher retry owns it.
pub fn reset_after_ack_timeout(
    record: &mut RunRecord,
    node_id: &str,
    dispatch_id: &str,
) -> Option<NodeMutation> {
    let (location, found_node_id) = record.locate_by_dispatch(dispatch_id)?;
    if found_node_id != node_id {
        return None;
    }
    let previous_status = record.status;
    let previous;
    {
        let node = record.node_mut(&location, &found_node_id)?;
        previous = node.clone();
        node.status = RunStatus::Queued;
        node.clear_dispatch_state();
        node.enqueued = true;
    }
    clear_run_dispatch_surface(record, &previous);
    record.refresh_rollup();
    let node_snapshot = record.node(&location, &found_node_id)?.clone();
    Some(NodeMutation {
        node: node_snapshot,
        previous_status,
    })
}

/// Reset a node after a worker-side cancellation so it can be retried, and
/// drop any pending `next()` waiting on its task.
pub fn reset_after_worker_cancel(
    record: &mut RunRecord,
    location: &crate::model::NodeLocation,
    node_id: &str,
    pending: &mut PendingNextTable,
) -> Option<NodeMutation> {
    let previous_status = record.status;
    let task_id;
    let node_snapshot;
    {
        let node = record.node_mut(location, node_id)?;
        node.status = RunStatus::Queued;
        node.clear_dispatch_state();
        node.enqueued = false;
        // The node must be re-dispatchable immediately.
        node.pending_dependencies = 0;
        node.chain_blocked = false;
        task_id = node.task_id.clone();
        node_snapshot = node.clone();
    }
    pending.purge_task(&record.run_id.clone(), &task_id);
    record.refresh_rollup();
    Some(NodeMutation {
        node: node_snapshot,
        previous_status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::build_run_record;
    use crate::model::NodeLocation;
    use crate::pending::PendingNextRequest;
    use lattice_core::WorkflowDefinition;
    use pretty_assertions::assert_eq;

    fn record() -> RunRecord {
        let workflow: WorkflowDefinition = serde_json::from_value(serde_json::json!({
            "id": "wf",
            "nodes": [
                {"id": "a", "type": "t", "package": {"name": "p", "version": "1"}},
                {"id": "b", "type": "t"}
            ],
            "edges": [{"source": {"node": "a"}, "target": {"node": "b"}}]
        }))
        .unwrap();
        build_run_record("r-1", workflow, "client", "default")
    }

    fn stamp(node_id: &str, dispatch_id: &str, seq: u64) -> DispatchStamp {
        DispatchStamp {
            worker_name: "w-1".into(),
            task_id: node_id.into(),
            node_id: node_id.into(),
            node_type: "t".into(),
            package_name: "p".into(),
            package_version: "1".into(),
            seq_used: seq,
            resource_refs: None,
            affinity: None,
            dispatch_id: Some(dispatch_id.into()),
            ack_deadline: Some(Utc::now() + chrono::Duration::seconds(5)),
        }
    }

    #[test]
    fn mark_dispatched_stamps_node_and_run() {
        let mut record = record();
        let mut pending = PendingNextTable::default();
        let outcome = mark_dispatched(&mut record, &stamp("a", "d-1", 1), &mut pending).unwrap();
        assert_eq!(outcome.previous_status, RunStatus::Queued);
        assert_eq!(outcome.node.status, RunStatus::Running);
        assert!(outcome.node.pending_ack);
        assert_eq!(record.status, RunStatus::Running);
        assert_eq!(record.next_seq, 2);
        assert_eq!(record.worker_name.as_deref(), Some("w-1"));
        assert_eq!(record.nodes["a"].dispatch_id.as_deref(), Some("d-1"));
    }

    #[test]
    fn mark_dispatched_next_seq_is_monotonic() {
        let mut record = record();
        record.next_seq = 10;
        let mut pending = PendingNextTable::default();
        let _ = mark_dispatched(&mut record, &stamp("a", "d-1", 3), &mut pending);
        assert_eq!(record.next_seq, 10);
    }

    #[test]
    fn mark_acknowledged_clears_pending_ack() {
        let mut record = record();
        let mut pending = PendingNextTable::default();
        let _ = mark_dispatched(&mut record, &stamp("a", "d-1", 1), &mut pending);
        let outcome = mark_acknowledged(&mut record, "a", "d-1").unwrap();
        assert!(!outcome.node.pending_ack);
        assert!(outcome.node.ack_deadline.is_none());
        // The node keeps running; only the ack bookkeeping clears.
        assert_eq!(record.nodes["a"].status, RunStatus::Running);
    }

    #[test]
    fn mark_acknowledged_rejects_mismatched_node() {
        let mut record = record();
        let mut pending = PendingNextTable::default();
        let _ = mark_dispatched(&mut record, &stamp("a", "d-1", 1), &mut pending);
        assert!(mark_acknowledged(&mut record, "b", "d-1").is_none());
        assert!(mark_acknowledged(&mut record, "a", "d-other").is_none());
    }

    #[test]
    fn cancel_run_cancels_everything_and_purges_next() {
        let mut record = record();
        let mut pending = PendingNextTable::default();
        pending.insert(
            "req-1".into(),
            PendingNextRequest {
                run_id: "r-1".into(),
                worker_instance_id: Some("wi".into()),
                worker_name: None,
                deadline: None,
                node_id: None,
                middleware_id: None,
                target_task_id: Some("a".into()),
            },
        );
        let _ = mark_dispatched(&mut record, &stamp("a", "d-1", 1), &mut pending);

        let cancelled = cancel_run(&mut record, &mut pending);
        assert_eq!(record.status, RunStatus::Cancelled);
        assert!(record.finished_at.is_some());
        assert_eq!(record.nodes["a"].status, RunStatus::Cancelled);
        assert_eq!(record.nodes["b"].status, RunStatus::Cancelled);
        assert_eq!(cancelled.len(), 1);
        assert!(pending.is_empty());
    }

    #[test]
    fn cancel_run_is_idempotent() {
        let mut record = record();
        let mut pending = PendingNextTable::default();
        let first = cancel_run(&mut record, &mut pending);
        let second = cancel_run(&mut record, &mut pending);
        assert_eq!(record.status, RunStatus::Cancelled);
        assert!(first.is_empty() && second.is_empty());
    }

    #[test]
    fn ack_timeout_resets_node_for_retry() {
        let mut record = record();
        let mut pending = PendingNextTable::default();
        let _ = mark_dispatched(&mut record, &stamp("a", "d-1", 1), &mut pending);
        let outcome = reset_after_ack_timeout(&mut record, "a", "d-1").unwrap();
        assert_eq!(outcome.node.status, RunStatus::Queued);
        assert!(outcome.node.enqueued);
        assert!(outcome.node.dispatch_id.is_none());
        assert!(outcome.node.worker_name.is_none());
        // The run-level surface fields were cleared.
        assert!(record.worker_name.is_none());
        assert!(record.node_id.is_none());
    }

    #[test]
    fn worker_cancel_reset_clears_chain_block_and_purges_task() {
        let mut record = record();
        let mut pending = PendingNextTable::default();
        pending.insert(
            "req-1".into(),
            PendingNextRequest {
                run_id: "r-1".into(),
                worker_instance_id: Some("wi".into()),
                worker_name: None,
                deadline: None,
                node_id: None,
                middleware_id: None,
                target_task_id: Some("a".into()),
            },
        );
        record.nodes.get_mut("a").unwrap().chain_blocked = true;
        let outcome =
            reset_after_worker_cancel(&mut record, &NodeLocation::Root, "a", &mut pending)
                .unwrap();
        assert_eq!(outcome.node.status, RunStatus::Queued);
        assert!(!outcome.node.chain_blocked);
        assert!(!outcome.node.enqueued);
        assert!(pending.is_empty());
    }
}
