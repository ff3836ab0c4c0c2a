//! The user-visible error shape and scheduler-emitted error codes.

use serde::{Deserialize, Serialize};

/// Structured error carried on runs, nodes and wire payloads.
///
/// Exposed verbatim through run summaries, so the fields match the wire
/// contract: `{code, message, details?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    /// Machine-readable code, e.g. `E.DISPATCH.UNAVAILABLE`.
    pub code: String,
    /// Human-readable description.
    pub message: String,
    /// Optional structured context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorInfo {
    /// Create an error with no details.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Attach structured details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Scheduler-emitted error codes.
pub mod codes {
    /// No worker satisfied selection within the retry budget; fails the run.
    pub const DISPATCH_UNAVAILABLE: &str = "E.DISPATCH.UNAVAILABLE";
    /// Middleware chain metadata failed pre-send validation; fails the node.
    pub const DISPATCH_INVALID_METADATA: &str = "E.DISPATCH.INVALID_METADATA";
    /// Worker-reported advisory: a concurrency-key conflict was detected.
    pub const CMD_CONCURRENCY_VIOLATION: &str = "E.CMD.CONCURRENCY_VIOLATION";
    /// Worker-side cancellation; the node is reset and becomes redispatchable.
    pub const RUNNER_CANCELLED: &str = "E.RUNNER.CANCELLED";

    /// `control.reset` code when a resume referenced an unknown session.
    pub const SESSION_NOT_FOUND: &str = "session_not_found";
    /// `control.reset` code for failed handshake authentication.
    pub const AUTH_FAILED: &str = "auth_failed";
    /// `control.reset` code for an unsupported protocol version.
    pub const PROTOCOL_MISMATCH: &str = "protocol_mismatch";

    /// Middleware `next()` refused: the run is already terminal.
    pub const NEXT_RUN_FINALISED: &str = "next_run_finalised";
    /// Middleware `next()` refused: the request id was already seen.
    pub const NEXT_DUPLICATE: &str = "next_duplicate";
    /// Middleware `next()` refused: the middleware belongs to no known chain.
    pub const NEXT_NO_CHAIN: &str = "next_no_chain";
    /// Middleware `next()` refused: the chain index is inconsistent.
    pub const NEXT_INVALID_CHAIN: &str = "next_invalid_chain";
    /// Middleware `next()` refused: the target cannot accept work right now.
    pub const NEXT_TARGET_NOT_READY: &str = "next_target_not_ready";
    /// Middleware `next()` deadline expired before the target finished.
    pub const NEXT_TIMEOUT: &str = "next_timeout";
    /// The `next()` target finished with a failure.
    pub const NEXT_FAILED: &str = "next_failed";
    /// The `next()` target was cancelled (run cancellation included).
    pub const NEXT_CANCELLED: &str = "next_cancelled";
    /// Catch-all when a `next()` request could not be serviced.
    pub const NEXT_UNAVAILABLE: &str = "next_unavailable";

    /// Human-readable message for a middleware `next()` error code.
    #[must_use]
    pub fn next_error_message(code: &str) -> &'static str {
        match code {
            NEXT_RUN_FINALISED => "the run has already finished",
            NEXT_DUPLICATE => "a next request with this id was already processed",
            NEXT_NO_CHAIN => "the middleware does not belong to any chain",
            NEXT_INVALID_CHAIN => "the chain index does not match the chain",
            NEXT_TARGET_NOT_READY => "the next target is not ready to execute",
            NEXT_TIMEOUT => "the next target did not finish before the deadline",
            NEXT_FAILED => "the next target failed",
            NEXT_CANCELLED => "the next target was cancelled",
            _ => "the next request could not be serviced",
        }
    }
}
