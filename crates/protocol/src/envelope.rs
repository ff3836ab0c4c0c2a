//! The wire envelope every control-plane message travels in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ProtocolError;

/// Well-known message types.
///
/// Control frames are prefixed `control.`; business frames `biz.`.
pub mod types {
    /// Worker → scheduler: open a session.
    pub const CONTROL_HANDSHAKE: &str = "control.handshake";
    /// Worker → scheduler: advertise packages, runtimes, features.
    pub const CONTROL_REGISTER: &str = "control.register";
    /// Worker → scheduler: reconnect with a prior session.
    pub const CONTROL_RESUME: &str = "control.resume";
    /// Worker → scheduler: liveness and load metrics.
    pub const CONTROL_HEARTBEAT: &str = "control.heartbeat";
    /// Worker → scheduler: stop sending new dispatches.
    pub const CONTROL_DRAIN: &str = "control.drain";
    /// Both directions: per-message ack carrying window state.
    pub const CONTROL_ACK: &str = "control.ack";
    /// Scheduler → worker: session established or resumed.
    pub const CONTROL_SESSION_ACCEPT: &str = "control.session.accept";
    /// Scheduler → worker: session terminated with code and reason.
    pub const CONTROL_RESET: &str = "control.reset";

    /// Scheduler → worker: task dispatch.
    pub const BIZ_EXEC_DISPATCH: &str = "biz.exec.dispatch";
    /// Worker → scheduler: terminal task outcome.
    pub const BIZ_EXEC_RESULT: &str = "biz.exec.result";
    /// Worker → scheduler: progress, metadata and stream chunks.
    pub const BIZ_EXEC_FEEDBACK: &str = "biz.exec.feedback";
    /// Worker → scheduler: structured command error.
    pub const BIZ_EXEC_ERROR: &str = "biz.exec.error";
    /// Worker → scheduler: middleware call-through.
    pub const BIZ_EXEC_NEXT_REQUEST: &str = "biz.exec.next.request";
    /// Both directions: correlated response to a next request.
    pub const BIZ_EXEC_NEXT_RESPONSE: &str = "biz.exec.next.response";
}

/// Returns `true` for `control.*` message types.
#[must_use]
pub fn is_control_type(message_type: &str) -> bool {
    message_type.starts_with("control.")
}

/// The role of an envelope sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// A worker process.
    Worker,
    /// The scheduler.
    Scheduler,
}

/// Envelope sender identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    /// Sender role.
    pub role: Role,
    /// Sender id: worker instance id or scheduler id.
    pub id: String,
}

/// Per-message ack fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckFields {
    /// The sender requests an ack for this envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<bool>,
    /// This envelope acknowledges the message with the given id.
    #[serde(rename = "for", default, skip_serializing_if = "Option::is_none")]
    pub for_id: Option<String>,
}

impl AckFields {
    /// Returns `true` when the sender asked for an ack.
    #[must_use]
    pub fn requested(&self) -> bool {
        self.request == Some(true)
    }
}

/// A control-plane message frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Dot-namespaced message type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Globally unique message id.
    pub id: String,
    /// Send timestamp.
    pub ts: DateTime<Utc>,
    /// Correlation id linking responses to requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corr: Option<String>,
    /// Business sequence number (run-scoped dispatch numbering).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Session sliding-window position for business frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_seq: Option<u64>,
    /// Tenant the message belongs to.
    pub tenant: String,
    /// Sender identity.
    pub sender: Sender,
    /// Per-message ack fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<AckFields>,
    /// Typed payload, shape determined by `kind`.
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Build an envelope with a fresh id and current timestamp.
    #[must_use]
    pub fn new(kind: impl Into<String>, tenant: impl Into<String>, sender: Sender) -> Self {
        Self {
            kind: kind.into(),
            id: Uuid::new_v4().to_string(),
            ts: Utc::now(),
            corr: None,
            seq: None,
            session_seq: None,
            tenant: tenant.into(),
            sender,
            ack: None,
            payload: Value::Null,
        }
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_corr(mut self, corr: impl Into<String>) -> Self {
        self.corr = Some(corr.into());
        self
    }

    /// Set the business sequence number.
    #[must_use]
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    /// Mark the envelope as requesting an ack.
    #[must_use]
    pub fn request_ack(mut self) -> Self {
        self.ack.get_or_insert_with(AckFields::default).request = Some(true);
        self
    }

    /// Mark the envelope as acknowledging another message.
    #[must_use]
    pub fn acking(mut self, for_id: impl Into<String>) -> Self {
        self.ack.get_or_insert_with(AckFields::default).for_id = Some(for_id.into());
        self
    }

    /// Attach a serializable payload.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, ProtocolError> {
        self.payload = serde_json::to_value(payload)?;
        Ok(self)
    }

    /// Returns `true` for `control.*` frames, which bypass the send window.
    #[must_use]
    pub fn is_control(&self) -> bool {
        is_control_type(&self.kind)
    }

    /// Deserialize the payload into a typed struct.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}
