//! The run registry: every run's state behind one async lock.
//!
//! Mutations happen under the lock; event publications are gathered there
//! and published after release so sinks never block the engine. The
//! registry is process-local — a crash forfeits in-flight runs.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use lattice_core::{RunStatus, WorkflowDefinition};
use lattice_events::{EventSink, RunEvent, publish_all};
use lattice_protocol::{
    ErrorPayload, FeedbackPayload, NextRequestPayload, NextResponsePayload, ResultPayload,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::emit;
use crate::error::EngineError;
use crate::lifecycle::{self, DispatchStamp};
use crate::model::{DispatchRequest, NodeLocation, RunRecord};
use crate::next::handle_next_request;
use crate::pending::{ExpiredNextRequest, PendingNextTable};
use crate::ready;
use crate::resources::ResourceBinder;
use crate::summary::{RunListPage, RunSummary, workflow_with_state};
use crate::updates::{apply_command_error, apply_feedback, apply_result};
use crate::bootstrap::build_run_record;

/// A run submission: the client session plus the workflow to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunRequest {
    /// Client session id events fan out to.
    pub client_id: String,
    /// Workflow to execute.
    pub workflow: WorkflowDefinition,
}

#[derive(Default)]
struct RegistryInner {
    runs: HashMap<String, RunRecord>,
    pending: PendingNextTable,
}

/// Thread-safe run state registry shared by the REST and control-plane
/// layers.
pub struct RunRegistry {
    inner: Mutex<RegistryInner>,
    sink: Arc<dyn EventSink>,
    binder: Option<Arc<ResourceBinder>>,
}

impl RunRegistry {
    /// Create a registry publishing to the given sink.
    #[must_use]
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            sink,
            binder: None,
        }
    }

    /// Attach a resource binder applied to every outgoing dispatch batch.
    #[must_use]
    pub fn with_binder(mut self, binder: Arc<ResourceBinder>) -> Self {
        self.binder = Some(binder);
        self
    }

    fn bind_resources(
        &self,
        ready: &mut [DispatchRequest],
        workflow_ids: &HashMap<String, String>,
    ) {
        if ready.is_empty() || workflow_ids.is_empty() {
            return;
        }
        if let Some(binder) = &self.binder {
            binder.apply(ready, workflow_ids);
        }
    }

    /// Create and register a run, emitting its initial projections.
    pub async fn create_run(
        &self,
        run_id: &str,
        request: StartRunRequest,
        tenant: &str,
    ) -> RunSummary {
        let (summary, events) = {
            let mut inner = self.inner.lock().await;
            let record = build_run_record(run_id, request.workflow, &request.client_id, tenant);
            let events = emit::run_lifecycle_events(&record);
            let summary = RunSummary::from_record(&record);
            inner.runs.insert(run_id.to_owned(), record);
            (summary, events)
        };
        publish_all(&*self.sink, events).await;
        summary
    }

    /// Fetch a run summary.
    pub async fn get(&self, run_id: &str) -> Result<RunSummary, EngineError> {
        let inner = self.inner.lock().await;
        inner
            .runs
            .get(run_id)
            .map(RunSummary::from_record)
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_owned()))
    }

    /// Fetch just the rollup status (cheap dispatcher check).
    pub async fn run_status(&self, run_id: &str) -> Option<RunStatus> {
        let inner = self.inner.lock().await;
        inner.runs.get(run_id).map(|record| record.status)
    }

    /// Find the run owning a task id.
    pub async fn find_run_for_task(&self, task_id: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .runs
            .values()
            .find(|record| {
                record.task_id.as_deref() == Some(task_id)
                    || record.locate_by_task(task_id).is_some()
            })
            .map(|record| record.run_id.clone())
    }

    /// The workflow definition annotated with per-node state.
    pub async fn workflow_with_state(&self, run_id: &str) -> Result<Value, EngineError> {
        let inner = self.inner.lock().await;
        inner
            .runs
            .get(run_id)
            .map(workflow_with_state)
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_owned()))
    }

    /// Paginated run listing with optional status/client filters.
    pub async fn list(
        &self,
        limit: usize,
        cursor: Option<&str>,
        status: Option<RunStatus>,
        client_id: Option<&str>,
    ) -> RunListPage {
        let inner = self.inner.lock().await;
        let mut runs: Vec<&RunRecord> = inner.runs.values().collect();
        runs.sort_by_key(|record| record.created_at);
        let filtered: Vec<&RunRecord> = runs
            .into_iter()
            .filter(|record| status.is_none_or(|status| record.status == status))
            .filter(|record| client_id.is_none_or(|client| record.client_id == client))
            .collect();

        let start_index = cursor
            .and_then(|cursor| filtered.iter().position(|record| record.run_id == cursor))
            .map_or(0, |index| index + 1);
        let window: Vec<&RunRecord> = filtered
            .iter()
            .skip(start_index)
            .take(limit)
            .copied()
            .collect();
        let next_cursor = (start_index + window.len() < filtered.len())
            .then(|| window.last().map(|record| record.run_id.clone()))
            .flatten();
        RunListPage {
            items: window.iter().map(|record| RunSummary::from_record(record)).collect(),
            next_cursor,
        }
    }

    /// Collect dispatchable work: for one run, or across every live run.
    pub async fn collect_ready(&self, run_id: Option<&str>) -> Vec<DispatchRequest> {
        let mut workflow_ids = HashMap::new();
        let (mut ready, events) = {
            let mut inner = self.inner.lock().await;
            let RegistryInner { runs, pending } = &mut *inner;
            let run_ids: Vec<String> = match run_id {
                Some(run_id) => vec![run_id.to_owned()],
                None => runs.keys().cloned().collect(),
            };
            let mut ready = Vec::new();
            let mut events: Vec<RunEvent> = Vec::new();
            for run_id in run_ids {
                let Some(record) = runs.get_mut(&run_id) else {
                    continue;
                };
                if record.status.is_terminal() {
                    continue;
                }
                workflow_ids.insert(record.run_id.clone(), record.workflow.id.clone());
                let mut state_events = Vec::new();
                ready.extend(ready::collect_ready(record, &mut state_events));
                // Frames with nothing left to run (empty subgraphs included)
                // complete here, since no result will ever arrive for them.
                loop {
                    let completable = record
                        .frame_stack
                        .iter()
                        .rev()
                        .find(|frame_id| {
                            record.active_frames.get(*frame_id).is_some_and(|frame| {
                                frame.nodes.values().all(|node| node.status.is_terminal())
                            })
                        })
                        .cloned();
                    let Some(frame_id) = completable else {
                        break;
                    };
                    let completion = crate::frames::complete_frame_if_needed(
                        record,
                        &frame_id,
                        pending,
                        &mut state_events,
                    );
                    ready.extend(completion.ready);
                    if let Some(container) = completion.container {
                        state_events.push(container);
                    }
                }
                record.refresh_rollup();
                events.extend(emit::state_change_events(record, &state_events));
            }
            (ready, events)
        };
        publish_all(&*self.sink, events).await;
        self.bind_resources(&mut ready, &workflow_ids);
        ready
    }

    /// Stamp a dispatch onto the run.
    ///
    /// Fails with [`EngineError::RunFinalised`] when the run is (or lands)
    /// terminal so the dispatcher drops the dispatch instead of tracking an
    /// ack that can never matter.
    pub async fn mark_dispatched(
        &self,
        run_id: &str,
        stamp: DispatchStamp,
    ) -> Result<RunSummary, EngineError> {
        let (summary, events) = {
            let mut inner = self.inner.lock().await;
            let RegistryInner { runs, pending } = &mut *inner;
            let record = runs
                .get_mut(run_id)
                .ok_or_else(|| EngineError::RunNotFound(run_id.to_owned()))?;
            if record.status.is_terminal() {
                return Err(EngineError::RunFinalised(run_id.to_owned()));
            }
            let mutation = lifecycle::mark_dispatched(record, &stamp, pending)
                .ok_or_else(|| EngineError::NodeNotFound(stamp.node_id.clone()))?;
            let events = emit::node_mutation_events(record, &mutation.node, mutation.previous_status);
            (RunSummary::from_record(record), events)
        };
        publish_all(&*self.sink, events).await;
        if summary.status.is_terminal() {
            return Err(EngineError::RunFinalised(run_id.to_owned()));
        }
        Ok(summary)
    }

    /// Clear the pending ack for a dispatch.
    pub async fn mark_acknowledged(
        &self,
        run_id: &str,
        node_id: &str,
        dispatch_id: &str,
    ) -> Option<RunSummary> {
        let (summary, events) = {
            let mut inner = self.inner.lock().await;
            let record = inner.runs.get_mut(run_id)?;
            if record.status.is_terminal() {
                return Some(RunSummary::from_record(record));
            }
            let Some(mutation) = lifecycle::mark_acknowledged(record, node_id, dispatch_id) else {
                return Some(RunSummary::from_record(record));
            };
            let events = emit::node_mutation_events(record, &mutation.node, mutation.previous_status);
            (RunSummary::from_record(record), events)
        };
        publish_all(&*self.sink, events).await;
        Some(summary)
    }

    /// Cancel a run. Idempotent; returns synthetic `next_cancelled`
    /// responses for workers waiting on `next()` calls.
    pub async fn cancel_run(
        &self,
        run_id: &str,
    ) -> Result<(RunSummary, Vec<(String, NextResponsePayload)>), EngineError> {
        let (summary, responses, events) = {
            let mut inner = self.inner.lock().await;
            let RegistryInner { runs, pending } = &mut *inner;
            let record = runs
                .get_mut(run_id)
                .ok_or_else(|| EngineError::RunNotFound(run_id.to_owned()))?;
            if record.status.is_terminal() {
                return Ok((RunSummary::from_record(record), Vec::new()));
            }
            let cancelled = lifecycle::cancel_run(record, pending);
            let responses: Vec<(String, NextResponsePayload)> = cancelled
                .iter()
                .map(|entry| (entry.worker_ref.clone(), PendingNextTable::cancelled_response(entry)))
                .collect();
            let events = emit::run_lifecycle_events(record);
            (RunSummary::from_record(record), responses, events)
        };
        publish_all(&*self.sink, events).await;
        Ok((summary, responses))
    }

    /// Reset a node whose dispatch ack never arrived.
    pub async fn reset_after_ack_timeout(
        &self,
        run_id: &str,
        node_id: &str,
        dispatch_id: &str,
    ) -> Option<RunSummary> {
        let (summary, events) = {
            let mut inner = self.inner.lock().await;
            let record = inner.runs.get_mut(run_id)?;
            if record.status.is_terminal() {
                return Some(RunSummary::from_record(record));
            }
            let Some(mutation) = lifecycle::reset_after_ack_timeout(record, node_id, dispatch_id)
            else {
                return Some(RunSummary::from_record(record));
            };
            let events = emit::node_mutation_events(record, &mutation.node, mutation.previous_status);
            (RunSummary::from_record(record), events)
        };
        publish_all(&*self.sink, events).await;
        Some(summary)
    }

    /// Reset a node after a worker-side cancellation so it can be retried.
    pub async fn reset_after_worker_cancel(
        &self,
        run_id: Option<&str>,
        node_id: Option<&str>,
        task_id: Option<&str>,
    ) -> Option<RunSummary> {
        let (summary, events) = {
            let mut inner = self.inner.lock().await;
            let RegistryInner { runs, pending } = &mut *inner;
            let resolved_run_id = run_id.map(str::to_owned).or_else(|| {
                task_id.and_then(|task_id| {
                    runs.values()
                        .find(|record| record.task_id.as_deref() == Some(task_id))
                        .map(|record| record.run_id.clone())
                })
            })?;
            let record = runs.get_mut(&resolved_run_id)?;
            if record.status.is_terminal() {
                return Some(RunSummary::from_record(record));
            }
            let Some((location, found_node_id)) = record.locate(node_id, task_id) else {
                return Some(RunSummary::from_record(record));
            };
            let Some(mutation) =
                lifecycle::reset_after_worker_cancel(record, &location, &found_node_id, pending)
            else {
                return Some(RunSummary::from_record(record));
            };
            let events = emit::node_mutation_events(record, &mutation.node, mutation.previous_status);
            (RunSummary::from_record(record), events)
        };
        publish_all(&*self.sink, events).await;
        Some(summary)
    }

    /// Apply a terminal task result and release downstream work.
    pub async fn record_result(
        &self,
        run_id: &str,
        payload: ResultPayload,
    ) -> (
        Option<RunSummary>,
        Vec<DispatchRequest>,
        Vec<(Option<String>, NextResponsePayload)>,
    ) {
        let mut workflow_ids = HashMap::new();
        let (summary, mut ready, responses, events) = {
            let mut inner = self.inner.lock().await;
            let RegistryInner { runs, pending } = &mut *inner;
            let Some(record) = runs.get_mut(run_id) else {
                return (None, Vec::new(), Vec::new());
            };
            if record.status.is_terminal() {
                return (Some(RunSummary::from_record(record)), Vec::new(), Vec::new());
            }
            let outcome = apply_result(record, &payload, pending);
            workflow_ids.insert(record.run_id.clone(), record.workflow.id.clone());
            let events = emit::result_events(record, &outcome);
            (
                RunSummary::from_record(record),
                outcome.ready,
                outcome.next_responses,
                events,
            )
        };
        publish_all(&*self.sink, events).await;
        self.bind_resources(&mut ready, &workflow_ids);
        (Some(summary), ready, responses)
    }

    /// Merge a non-terminal feedback update.
    pub async fn record_feedback(&self, payload: FeedbackPayload) {
        let events = {
            let mut inner = self.inner.lock().await;
            let Some(record) = inner.runs.get_mut(&payload.run_id) else {
                return;
            };
            let outcome = apply_feedback(record, &payload);
            emit::feedback_events(record, &outcome)
        };
        publish_all(&*self.sink, events).await;
    }

    /// Handle a middleware `next()` call.
    pub async fn handle_next_request(
        &self,
        payload: NextRequestPayload,
        worker_name: Option<&str>,
        worker_instance_id: Option<&str>,
    ) -> (Vec<DispatchRequest>, Option<&'static str>) {
        let mut workflow_ids = HashMap::new();
        let (mut ready, error_code, events) = {
            let mut inner = self.inner.lock().await;
            let RegistryInner { runs, pending } = &mut *inner;
            let Some(record) = runs.get_mut(&payload.run_id) else {
                return (Vec::new(), Some(lattice_core::codes::NEXT_RUN_FINALISED));
            };
            if record.status.is_terminal() {
                return (Vec::new(), Some(lattice_core::codes::NEXT_RUN_FINALISED));
            }
            let outcome =
                handle_next_request(record, &payload, worker_name, worker_instance_id, pending);
            if let Some(code) = outcome.error_code {
                return (Vec::new(), Some(code));
            }
            workflow_ids.insert(record.run_id.clone(), record.workflow.id.clone());
            let mut events = emit::state_change_events(record, &outcome.state_events);
            if let Some(node) = &outcome.node {
                events.push(emit::node_state_event(record, node));
                events.push(emit::run_snapshot_event(record));
            }
            (outcome.ready, None, events)
        };
        publish_all(&*self.sink, events).await;
        self.bind_resources(&mut ready, &workflow_ids);
        (ready, error_code)
    }

    /// Resolve the worker waiting on a `next()` response.
    pub async fn resolve_next_response_worker(&self, request_id: &str) -> Option<String> {
        let mut inner = self.inner.lock().await;
        inner.pending.resolve_worker(request_id, Utc::now())
    }

    /// Collect `next()` requests whose deadlines expired.
    pub async fn collect_expired_next_requests(&self) -> Vec<ExpiredNextRequest> {
        let mut inner = self.inner.lock().await;
        inner.pending.collect_expired(Utc::now())
    }

    /// Apply a structured command error, failing the run.
    pub async fn record_command_error(
        &self,
        payload: ErrorPayload,
        run_id: Option<&str>,
        task_id: Option<&str>,
    ) -> (Option<RunSummary>, Vec<DispatchRequest>) {
        let (summary, ready, events) = {
            let mut inner = self.inner.lock().await;
            let RegistryInner { runs, pending } = &mut *inner;
            let resolved_run_id = run_id.map(str::to_owned).or_else(|| {
                task_id.and_then(|task_id| {
                    runs.values()
                        .find(|record| {
                            record.task_id.as_deref() == Some(task_id)
                                || record.locate_by_task(task_id).is_some()
                        })
                        .map(|record| record.run_id.clone())
                })
            });
            let Some(resolved_run_id) = resolved_run_id else {
                return (None, Vec::new());
            };
            let Some(record) = runs.get_mut(&resolved_run_id) else {
                return (None, Vec::new());
            };
            if record.status.is_terminal() {
                return (Some(RunSummary::from_record(record)), Vec::new());
            }
            let outcome = apply_command_error(record, &payload, task_id, pending);
            let events = emit::command_error_events(record, &outcome);
            (RunSummary::from_record(record), outcome.ready, events)
        };
        publish_all(&*self.sink, events).await;
        (Some(summary), ready)
    }

    /// Locations of a node, for tests and diagnostics.
    pub async fn locate_node(&self, run_id: &str, node_id: &str) -> Option<NodeLocation> {
        let inner = self.inner.lock().await;
        inner
            .runs
            .get(run_id)
            .and_then(|record| record.locate_by_node(node_id))
            .map(|(location, _)| location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_events::{BroadcastSink, EventBus};
    use pretty_assertions::assert_eq;

    fn registry() -> (Arc<RunRegistry>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new(256));
        let sink = Arc::new(BroadcastSink::new(Arc::clone(&bus)));
        (Arc::new(RunRegistry::new(sink)), bus)
    }

    fn start_request(workflow: serde_json::Value) -> StartRunRequest {
        StartRunRequest {
            client_id: "client-1".into(),
            workflow: serde_json::from_value(workflow).unwrap(),
        }
    }

    fn linear() -> serde_json::Value {
        serde_json::json!({
            "id": "wf",
            "nodes": [
                {"id": "a", "type": "t"},
                {"id": "b", "type": "t"}
            ],
            "edges": [{"source": {"node": "a"}, "target": {"node": "b"}}]
        })
    }

    fn result(task_id: &str, status: &str) -> ResultPayload {
        ResultPayload {
            run_id: "r".into(),
            task_id: task_id.into(),
            status: status.into(),
            result: None,
            error: None,
            metadata: None,
            artifacts: Vec::new(),
            duration_ms: None,
        }
    }

    #[tokio::test]
    async fn create_and_get() {
        let (registry, bus) = registry();
        let mut sub = bus.subscribe();
        let summary = registry.create_run("r", start_request(linear()), "t").await;
        assert_eq!(summary.status, RunStatus::Queued);
        assert_eq!(registry.get("r").await.unwrap().run_id, "r");
        // run.state + run.snapshot published.
        assert_eq!(sub.try_recv().unwrap().kind(), "run.state");
        assert_eq!(sub.try_recv().unwrap().kind(), "run.snapshot");
    }

    #[tokio::test]
    async fn collect_ready_then_result_chain() {
        let (registry, _bus) = registry();
        registry.create_run("r", start_request(linear()), "t").await;
        let ready = registry.collect_ready(Some("r")).await;
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].node_id, "a");

        let (summary, released, _) = registry.record_result("r", result("a", "succeeded")).await;
        assert_eq!(summary.unwrap().status, RunStatus::Running);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].node_id, "b");

        let (summary, released, _) = registry.record_result("r", result("b", "succeeded")).await;
        assert_eq!(summary.unwrap().status, RunStatus::Succeeded);
        assert!(released.is_empty());
    }

    #[tokio::test]
    async fn terminal_run_rejects_further_results() {
        let (registry, _bus) = registry();
        registry.create_run("r", start_request(linear()), "t").await;
        let _ = registry.cancel_run("r").await;
        let (summary, ready, _) = registry.record_result("r", result("a", "succeeded")).await;
        assert_eq!(summary.unwrap().status, RunStatus::Cancelled);
        assert!(ready.is_empty());
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let (registry, _bus) = registry();
        registry.create_run("r", start_request(linear()), "t").await;
        let (first, _) = registry.cancel_run("r").await.unwrap();
        let (second, _) = registry.cancel_run("r").await.unwrap();
        assert_eq!(first.status, RunStatus::Cancelled);
        assert_eq!(second.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn unknown_run_is_an_error() {
        let (registry, _bus) = registry();
        assert!(matches!(
            registry.get("ghost").await,
            Err(EngineError::RunNotFound(_))
        ));
        assert!(matches!(
            registry.workflow_with_state("ghost").await,
            Err(EngineError::RunNotFound(_))
        ));
        assert!(matches!(
            registry.cancel_run("ghost").await,
            Err(EngineError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn dispatch_stamp_rejected_on_finished_run() {
        let (registry, _bus) = registry();
        registry.create_run("r", start_request(linear()), "t").await;
        let _ = registry.cancel_run("r").await;
        let stamp = DispatchStamp {
            worker_name: "w-1".into(),
            task_id: "a".into(),
            node_id: "a".into(),
            node_type: "t".into(),
            package_name: String::new(),
            package_version: String::new(),
            seq_used: 1,
            resource_refs: None,
            affinity: None,
            dispatch_id: Some("d-1".into()),
            ack_deadline: None,
        };
        assert!(matches!(
            registry.mark_dispatched("r", stamp).await,
            Err(EngineError::RunFinalised(_))
        ));
    }

    #[tokio::test]
    async fn list_paginates_with_cursor() {
        let (registry, _bus) = registry();
        for index in 0..5 {
            registry
                .create_run(&format!("r-{index}"), start_request(linear()), "t")
                .await;
        }
        let first = registry.list(2, None, None, None).await;
        assert_eq!(first.items.len(), 2);
        let cursor = first.next_cursor.clone().unwrap();
        let second = registry.list(2, Some(&cursor), None, None).await;
        assert_eq!(second.items.len(), 2);
        assert_ne!(first.items[0].run_id, second.items[0].run_id);
        let third = registry.list(2, second.next_cursor.as_deref(), None, None).await;
        assert_eq!(third.items.len(), 1);
        assert!(third.next_cursor.is_none());
    }

    #[tokio::test]
    async fn list_filters_by_status_and_client() {
        let (registry, _bus) = registry();
        registry.create_run("r-1", start_request(linear()), "t").await;
        registry.create_run("r-2", start_request(linear()), "t").await;
        let _ = registry.cancel_run("r-2").await;

        let cancelled = registry
            .list(10, None, Some(RunStatus::Cancelled), None)
            .await;
        assert_eq!(cancelled.items.len(), 1);
        assert_eq!(cancelled.items[0].run_id, "r-2");

        let none = registry.list(10, None, None, Some("other-client")).await;
        assert!(none.items.is_empty());
    }

    #[tokio::test]
    async fn empty_workflow_succeeds_at_creation() {
        let (registry, _bus) = registry();
        let summary = registry
            .create_run(
                "r",
                start_request(serde_json::json!({"id": "wf", "nodes": [], "edges": []})),
                "t",
            )
            .await;
        assert_eq!(summary.status, RunStatus::Succeeded);
        assert!(registry.collect_ready(Some("r")).await.is_empty());
    }
}
