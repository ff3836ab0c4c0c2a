//! Event envelope and typed event data.

use chrono::{DateTime, Utc};
use lattice_core::{ErrorInfo, RunStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Addressing scope carried on every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventScope {
    /// Tenant the event belongs to.
    pub tenant: String,
    /// Run the event concerns, when run-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Client session the event should be fanned out to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_session_id: Option<String>,
}

/// Mutation kind of a result delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaOperation {
    /// Append to a stream (channel chunks).
    Append,
    /// Replace the value at the path.
    Replace,
    /// Remove the value at the path.
    Remove,
}

/// Typed event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EventData {
    /// Run status change (terminal transitions included).
    #[serde(rename = "run.state")]
    RunState {
        /// Run id.
        run_id: String,
        /// New rollup status.
        status: RunStatus,
        /// When the run started, if it has.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        started_at: Option<DateTime<Utc>>,
        /// When the run finished, if it has.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finished_at: Option<DateTime<Utc>>,
        /// Failure reason, when failed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Full aggregate view of the run plus all node summaries.
    #[serde(rename = "run.snapshot")]
    RunSnapshot {
        /// Serialized run summary.
        run: Value,
        /// Serialized node summaries.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nodes: Option<Value>,
    },
    /// Stage/progress/message/error delta for one node.
    #[serde(rename = "node.state")]
    NodeState {
        /// Run id.
        run_id: String,
        /// Node id.
        node_id: String,
        /// Current stage label.
        stage: String,
        /// Progress in `[0, 1]`, when reported.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<f64>,
        /// Status line, when reported.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        /// Node error, when failed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorInfo>,
    },
    /// Full node result after a status change.
    #[serde(rename = "node.result.snapshot")]
    NodeResultSnapshot {
        /// Run id.
        run_id: String,
        /// Node id.
        node_id: String,
        /// Revision (the node's dispatch sequence).
        revision: u64,
        /// Result content.
        content: Value,
        /// Artifacts attached to the node.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        artifacts: Vec<Value>,
        /// `true` once the node is terminal.
        complete: bool,
        /// Short human summary, when available.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    /// Fine-grained result mutation at a JSON pointer.
    #[serde(rename = "node.result.delta")]
    NodeResultDelta {
        /// Run id.
        run_id: String,
        /// Node id.
        node_id: String,
        /// Revision (the node's dispatch sequence).
        revision: u64,
        /// Monotonic sequence within the revision.
        sequence: u64,
        /// Mutation kind.
        operation: DeltaOperation,
        /// JSON pointer the mutation applies at.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        /// Mutation payload (`value` or chunk body).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        /// Chunk metadata for stream appends.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chunk: Option<Value>,
        /// `true` closes the stream channel at `path`.
        #[serde(default)]
        terminal: bool,
    },
    /// Worker heartbeat observed by the session layer.
    #[serde(rename = "worker.heartbeat")]
    WorkerHeartbeat {
        /// Durable worker instance id.
        worker_instance_id: String,
        /// Human worker label.
        worker_name: String,
        /// Health flag from the heartbeat.
        healthy: bool,
        /// Raw metrics block.
        metrics: Value,
    },
    /// Worker package advertisement change.
    #[serde(rename = "worker.package")]
    WorkerPackage {
        /// Durable worker instance id.
        worker_instance_id: String,
        /// Human worker label.
        worker_name: String,
        /// Serialized package entry.
        package: Value,
    },
}

/// An event ready for fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    /// Addressing scope.
    pub scope: EventScope,
    /// When the underlying state change happened.
    pub occurred_at: DateTime<Utc>,
    /// Typed payload.
    #[serde(flatten)]
    pub data: EventData,
}

impl RunEvent {
    /// Build an event stamped with the current time.
    #[must_use]
    pub fn now(scope: EventScope, data: EventData) -> Self {
        Self {
            scope,
            occurred_at: Utc::now(),
            data,
        }
    }

    /// The wire kind string of this event.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self.data {
            EventData::RunState { .. } => "run.state",
            EventData::RunSnapshot { .. } => "run.snapshot",
            EventData::NodeState { .. } => "node.state",
            EventData::NodeResultSnapshot { .. } => "node.result.snapshot",
            EventData::NodeResultDelta { .. } => "node.result.delta",
            EventData::WorkerHeartbeat { .. } => "worker.heartbeat",
            EventData::WorkerPackage { .. } => "worker.package",
        }
    }
}
