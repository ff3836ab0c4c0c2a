#![warn(missing_docs)]

//! # Lattice Protocol
//!
//! The control-plane wire protocol shared by scheduler and workers:
//!
//! - [`Envelope`] — the JSON frame every message travels in
//! - typed payloads for `control.*` and `biz.*` message types
//! - [`ReceiveWindow`] / [`SendWindow`] — per-session sliding windows with
//!   ack bitmaps and credit accounting
//!
//! The protocol crate is transport-agnostic: it knows nothing about
//! WebSockets, only about frames and ordering.

pub mod envelope;
pub mod error;
pub mod payload;
pub mod window;

pub use envelope::{AckFields, Envelope, Role, Sender, types};
pub use error::ProtocolError;
pub use payload::{
    AckPayload, DispatchPayload, DrainPayload, ErrorContext, ErrorPayload, FeedbackChunk,
    FeedbackPayload, HandshakePayload, HeartbeatMetrics, HeartbeatPayload, NextRequestPayload,
    NextResponsePayload, PackageStatus, RegisterPayload, ResetPayload, ResultError, ResultPayload,
    ResumePayload, SessionAcceptPayload, WorkerPackage,
};
pub use window::{AckState, DropReason, ReceiveWindow, Received, SendWindow, WindowError, is_seq_acked};

/// Protocol version advertised and accepted during handshake.
pub const PROTOCOL_VERSION: u32 = 1;
