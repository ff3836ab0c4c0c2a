//! Middleware `next()` call-through handling.

use chrono::{Duration, Utc};
use lattice_core::{RunStatus, codes};
use lattice_protocol::NextRequestPayload;

use crate::model::{DispatchRequest, NodeLocation, NodeState, RunRecord};
use crate::pending::{PendingNextRequest, PendingNextTable};
use crate::ready::{build_dispatch_request, start_container_execution};

/// Outcome of handling a `biz.exec.next.request`.
#[derive(Debug, Default)]
pub struct NextOutcome {
    /// Dispatch requests for the chain target (or frame contents).
    pub ready: Vec<DispatchRequest>,
    /// Refusal code when the request could not be serviced.
    pub error_code: Option<&'static str>,
    /// Node snapshots for re-activation events.
    pub state_events: Vec<NodeState>,
    /// Snapshot of the target node, when one was dispatched.
    pub node: Option<NodeState>,
}

impl NextOutcome {
    fn refused(code: &'static str) -> Self {
        Self {
            error_code: Some(code),
            ..Self::default()
        }
    }
}

fn find_chain_for_middleware(
    record: &RunRecord,
    middleware_id: &str,
) -> Option<(String, Vec<String>)> {
    let scan = |nodes: &indexmap::IndexMap<String, NodeState>| {
        nodes.values().find_map(|node| {
            node.middlewares
                .iter()
                .any(|mw| mw == middleware_id)
                .then(|| (node.node_id.clone(), node.middlewares.clone()))
        })
    };
    scan(&record.nodes).or_else(|| record.active_frames.values().find_map(|frame| scan(&frame.nodes)))
}

/// Handle a middleware `next()` call: route control to the next chain link
/// (or the host), re-queueing stale targets and activating container
/// targets, and register the pending response correlation.
pub fn handle_next_request(
    record: &mut RunRecord,
    payload: &NextRequestPayload,
    worker_name: Option<&str>,
    worker_instance_id: Option<&str>,
    pending: &mut PendingNextTable,
) -> NextOutcome {
    if pending.contains(&payload.request_id) {
        return NextOutcome::refused(codes::NEXT_DUPLICATE);
    }

    let Some((host_node_id, chain)) = find_chain_for_middleware(record, &payload.middleware_id)
    else {
        return NextOutcome::refused(codes::NEXT_NO_CHAIN);
    };
    let current_index = match payload.chain_index {
        Some(index) => index,
        None => match chain.iter().position(|mw| mw == &payload.middleware_id) {
            Some(index) => index,
            None => return NextOutcome::refused(codes::NEXT_INVALID_CHAIN),
        },
    };

    let target_index = current_index + 1;
    let (target_node_id, target_chain_index) = if target_index < chain.len() {
        (chain[target_index].clone(), Some(target_index))
    } else {
        (host_node_id.clone(), None)
    };

    let Some((location, node_id)) = record.locate(Some(&target_node_id), None) else {
        return NextOutcome::refused(codes::NEXT_TARGET_NOT_READY);
    };
    let Some(target_view) = record.node(&location, &node_id).cloned() else {
        return NextOutcome::refused(codes::NEXT_TARGET_NOT_READY);
    };

    // A container whose frame is still open cannot be re-entered.
    if target_view.is_container() {
        let parent_frame_id = match &location {
            NodeLocation::Frame(frame_id) => Some(frame_id.as_str()),
            NodeLocation::Root => None,
        };
        let frame_open = record.active_frames.values().any(|frame| {
            frame.definition.container_node_id == node_id
                && frame.definition.parent_frame_id.as_deref() == parent_frame_id
                && !frame.status.is_terminal()
        });
        if frame_open {
            return NextOutcome::refused(codes::NEXT_TARGET_NOT_READY);
        }
    }

    let mut outcome = NextOutcome::default();
    let is_chain_node = target_view.is_middleware() || target_view.is_host_with_middleware();
    if is_chain_node {
        if target_view.enqueued || target_view.pending_dependencies != 0 {
            return NextOutcome::refused(codes::NEXT_TARGET_NOT_READY);
        }
        let Some(target) = record.node_mut(&location, &node_id) else {
            return NextOutcome::refused(codes::NEXT_TARGET_NOT_READY);
        };
        // Chain targets may be re-queued after a terminal status or a stale
        // running state left by a lost worker.
        if target.status.is_terminal() || target.status == RunStatus::Running {
            target.status = RunStatus::Queued;
            target.worker_name = None;
            target.pending_ack = false;
            target.dispatch_id = None;
            target.ack_deadline = None;
            target.enqueued = false;
            target.finished_at = None;
            outcome.state_events.push(target.clone());
        }
        target.chain_blocked = false;
    }
    if let Some(target) = record.node_mut(&location, &node_id) {
        target.enqueued = false;
    }

    let deadline = payload
        .timeout_ms
        .filter(|timeout| *timeout > 0)
        .map(|timeout| Utc::now() + Duration::milliseconds(timeout));
    let entry = PendingNextRequest {
        run_id: record.run_id.clone(),
        worker_instance_id: worker_instance_id.map(str::to_owned),
        worker_name: worker_name.map(str::to_owned),
        deadline,
        node_id: Some(payload.node_id.clone()),
        middleware_id: Some(payload.middleware_id.clone()),
        target_task_id: None,
    };

    if target_view.is_container() {
        let parent_frame_id = match &location {
            NodeLocation::Frame(frame_id) => Some(frame_id.clone()),
            NodeLocation::Root => None,
        };
        let frame_ready = start_container_execution(
            record,
            parent_frame_id.as_deref(),
            &node_id,
            &mut outcome.state_events,
        );
        let target_task_id = record
            .node(&location, &node_id)
            .map(|node| node.task_id.clone());
        pending.insert(
            payload.request_id.clone(),
            PendingNextRequest {
                target_task_id,
                ..entry
            },
        );
        outcome.ready.extend(frame_ready);
        return outcome;
    }

    let Some(request) = build_dispatch_request(
        record,
        &location,
        &node_id,
        Some(host_node_id),
        Some(chain),
        target_chain_index,
    ) else {
        return NextOutcome::refused(codes::NEXT_TARGET_NOT_READY);
    };
    pending.insert(
        payload.request_id.clone(),
        PendingNextRequest {
            target_task_id: Some(request.task_id.clone()),
            ..entry
        },
    );
    outcome.node = record.node(&location, &node_id).cloned();
    outcome.ready.push(request);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::build_run_record;
    use lattice_core::WorkflowDefinition;
    use pretty_assertions::assert_eq;

    fn chain_record() -> RunRecord {
        let workflow: WorkflowDefinition = serde_json::from_value(serde_json::json!({
            "id": "wf",
            "nodes": [
                {"id": "h", "type": "t", "middlewares": ["m1", "m2"]}
            ]
        }))
        .unwrap();
        build_run_record("r", workflow, "c", "t")
    }

    fn next_payload(request_id: &str, middleware_id: &str, chain_index: Option<usize>) -> NextRequestPayload {
        NextRequestPayload {
            request_id: request_id.into(),
            run_id: "r".into(),
            node_id: "h".into(),
            middleware_id: middleware_id.into(),
            chain_index,
            timeout_ms: Some(30_000),
        }
    }

    #[test]
    fn next_routes_to_following_middleware() {
        let mut record = chain_record();
        let mut pending = PendingNextTable::default();
        let outcome = handle_next_request(
            &mut record,
            &next_payload("req-1", "m1", Some(0)),
            Some("w"),
            Some("wi"),
            &mut pending,
        );
        assert!(outcome.error_code.is_none());
        assert_eq!(outcome.ready.len(), 1);
        let request = &outcome.ready[0];
        assert_eq!(request.node_id, "m2");
        assert_eq!(request.chain_index, Some(1));
        assert_eq!(request.host_node_id.as_deref(), Some("h"));
        assert!(pending.contains("req-1"));
    }

    #[test]
    fn next_past_end_of_chain_targets_host() {
        let mut record = chain_record();
        let mut pending = PendingNextTable::default();
        let outcome = handle_next_request(
            &mut record,
            &next_payload("req-2", "m2", Some(1)),
            Some("w"),
            Some("wi"),
            &mut pending,
        );
        assert!(outcome.error_code.is_none());
        let request = &outcome.ready[0];
        assert_eq!(request.node_id, "h");
        assert_eq!(request.chain_index, None);
        assert_eq!(request.middleware_chain.as_deref(), Some(&["m1".to_owned(), "m2".to_owned()][..]));
    }

    #[test]
    fn duplicate_request_refused() {
        let mut record = chain_record();
        let mut pending = PendingNextTable::default();
        let payload = next_payload("req-1", "m1", Some(0));
        let _ = handle_next_request(&mut record, &payload, None, None, &mut pending);
        let outcome = handle_next_request(&mut record, &payload, None, None, &mut pending);
        assert_eq!(outcome.error_code, Some(codes::NEXT_DUPLICATE));
    }

    #[test]
    fn unknown_middleware_refused() {
        let mut record = chain_record();
        let mut pending = PendingNextTable::default();
        let outcome = handle_next_request(
            &mut record,
            &next_payload("req-1", "ghost", None),
            None,
            None,
            &mut pending,
        );
        assert_eq!(outcome.error_code, Some(codes::NEXT_NO_CHAIN));
    }

    #[test]
    fn busy_target_refused() {
        let mut record = chain_record();
        record.nodes.get_mut("m2").unwrap().enqueued = true;
        let mut pending = PendingNextTable::default();
        let outcome = handle_next_request(
            &mut record,
            &next_payload("req-1", "m1", Some(0)),
            None,
            None,
            &mut pending,
        );
        assert_eq!(outcome.error_code, Some(codes::NEXT_TARGET_NOT_READY));
    }

    #[test]
    fn stale_running_target_is_requeued_with_event() {
        let mut record = chain_record();
        {
            let host = record.nodes.get_mut("h").unwrap();
            host.status = RunStatus::Running;
            host.worker_name = Some("w-lost".into());
        }
        let mut pending = PendingNextTable::default();
        let outcome = handle_next_request(
            &mut record,
            &next_payload("req-1", "m2", Some(1)),
            None,
            None,
            &mut pending,
        );
        assert!(outcome.error_code.is_none());
        assert_eq!(outcome.state_events.len(), 1);
        assert_eq!(outcome.state_events[0].node_id, "h");
        assert_eq!(record.nodes["h"].worker_name, None);
    }

    #[test]
    fn deadline_registered_from_timeout() {
        let mut record = chain_record();
        let mut pending = PendingNextTable::default();
        let _ = handle_next_request(
            &mut record,
            &next_payload("req-1", "m1", Some(0)),
            None,
            Some("wi"),
            &mut pending,
        );
        // A future deadline means no immediate expiry.
        assert!(pending.collect_expired(Utc::now()).is_empty());
        assert!(pending.contains("req-1"));
    }
}
