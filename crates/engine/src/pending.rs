//! Pending middleware `next()` request table.
//!
//! Correlation from `requestId` to the originating worker is kept only in
//! memory, owned by the engine and mutated under the run-state lock.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use lattice_core::{ErrorInfo, RunStatus, codes};
use lattice_protocol::NextResponsePayload;
use serde_json::Value;

use crate::model::NodeState;

/// One outstanding `next()` call waiting for its target to finish.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingNextRequest {
    /// Run the chain belongs to.
    pub run_id: String,
    /// Worker instance that issued the call.
    pub worker_instance_id: Option<String>,
    /// Worker label, used when the instance id is unknown.
    pub worker_name: Option<String>,
    /// Deadline after which a `next_timeout` response is synthesised.
    pub deadline: Option<DateTime<Utc>>,
    /// Host node id as reported by the caller.
    pub node_id: Option<String>,
    /// The middleware that issued the call.
    pub middleware_id: Option<String>,
    /// Task id of the target the call waits on.
    pub target_task_id: Option<String>,
}

impl PendingNextRequest {
    /// The address to route the response to.
    #[must_use]
    pub fn worker_ref(&self) -> Option<String> {
        self.worker_instance_id
            .clone()
            .or_else(|| self.worker_name.clone())
    }
}

/// An expired request, ready for a synthetic `next_timeout` response.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiredNextRequest {
    /// The request id.
    pub request_id: String,
    /// Worker address to notify.
    pub worker_ref: String,
    /// Run the chain belongs to.
    pub run_id: String,
    /// Host node id.
    pub node_id: Option<String>,
    /// Middleware id.
    pub middleware_id: Option<String>,
}

/// In-memory table of pending `next()` requests keyed by request id.
#[derive(Debug, Default)]
pub struct PendingNextTable {
    entries: HashMap<String, PendingNextRequest>,
}

impl PendingNextTable {
    /// Returns `true` when the request id was already seen.
    #[must_use]
    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.contains_key(request_id)
    }

    /// Register a pending request.
    pub fn insert(&mut self, request_id: String, entry: PendingNextRequest) {
        self.entries.insert(request_id, entry);
    }

    /// Resolve the worker waiting on a response, dropping the entry.
    ///
    /// Returns `None` for unknown requests and for entries whose deadline
    /// already passed (the timeout poller owns those).
    pub fn resolve_worker(&mut self, request_id: &str, now: DateTime<Utc>) -> Option<String> {
        let entry = self.entries.remove(request_id)?;
        if let Some(deadline) = entry.deadline
            && now > deadline
        {
            return None;
        }
        entry.worker_ref()
    }

    /// Remove and return every entry whose deadline has passed.
    pub fn collect_expired(&mut self, now: DateTime<Utc>) -> Vec<ExpiredNextRequest> {
        let mut expired = Vec::new();
        self.entries.retain(|request_id, entry| {
            let is_expired = entry.deadline.is_some_and(|deadline| now > deadline);
            if is_expired && let Some(worker_ref) = entry.worker_ref() {
                expired.push(ExpiredNextRequest {
                    request_id: request_id.clone(),
                    worker_ref,
                    run_id: entry.run_id.clone(),
                    node_id: entry.node_id.clone(),
                    middleware_id: entry.middleware_id.clone(),
                });
            }
            !is_expired
        });
        expired
    }

    /// Build terminal responses for every request waiting on `node`'s task,
    /// dropping the entries.
    ///
    /// A non-succeeded status produces a `next_<status>` error body unless
    /// the node carries its own error.
    pub fn finalise_for_task(
        &mut self,
        run_id: &str,
        node: &NodeState,
        status: RunStatus,
        node_error: Option<&ErrorInfo>,
        result: Option<&Value>,
    ) -> Vec<(Option<String>, NextResponsePayload)> {
        let matching: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.run_id == run_id && entry.target_task_id.as_deref() == Some(&node.task_id)
            })
            .map(|(request_id, _)| request_id.clone())
            .collect();

        let mut responses = Vec::new();
        for request_id in matching {
            let Some(entry) = self.entries.remove(&request_id) else {
                continue;
            };
            let error = if let Some(error) = node_error {
                Some(ErrorInfo::new(error.code.clone(), error.message.clone()))
            } else if status == RunStatus::Succeeded {
                None
            } else {
                Some(ErrorInfo::new(
                    format!("next_{status}"),
                    format!("target {} status {status}", node.node_id),
                ))
            };
            responses.push((
                entry.worker_ref(),
                NextResponsePayload {
                    request_id,
                    run_id: run_id.to_owned(),
                    node_id: entry.node_id.clone().unwrap_or_default(),
                    middleware_id: entry.middleware_id.clone().unwrap_or_default(),
                    result: result.cloned(),
                    error,
                },
            ));
        }
        responses
    }

    /// Drop every entry for a run. Entries with a known worker are returned
    /// so callers can send synthetic `next_cancelled` responses.
    pub fn purge_run(&mut self, run_id: &str) -> Vec<ExpiredNextRequest> {
        let mut cancelled = Vec::new();
        self.entries.retain(|request_id, entry| {
            if entry.run_id != run_id {
                return true;
            }
            if let Some(worker_ref) = entry.worker_ref() {
                cancelled.push(ExpiredNextRequest {
                    request_id: request_id.clone(),
                    worker_ref,
                    run_id: entry.run_id.clone(),
                    node_id: entry.node_id.clone(),
                    middleware_id: entry.middleware_id.clone(),
                });
            }
            false
        });
        cancelled
    }

    /// Drop every entry of a run waiting on the given task.
    pub fn purge_task(&mut self, run_id: &str, task_id: &str) {
        self.entries.retain(|_, entry| {
            entry.run_id != run_id || entry.target_task_id.as_deref() != Some(task_id)
        });
    }

    /// Build a synthetic `next_cancelled` response for a purged entry.
    #[must_use]
    pub fn cancelled_response(entry: &ExpiredNextRequest) -> NextResponsePayload {
        NextResponsePayload {
            request_id: entry.request_id.clone(),
            run_id: entry.run_id.clone(),
            node_id: entry.node_id.clone().unwrap_or_default(),
            middleware_id: entry.middleware_id.clone().unwrap_or_default(),
            result: None,
            error: Some(ErrorInfo::new(
                codes::NEXT_CANCELLED,
                codes::next_error_message(codes::NEXT_CANCELLED),
            )),
        }
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no requests are outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
