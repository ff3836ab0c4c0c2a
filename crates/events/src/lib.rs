#![warn(missing_docs)]

//! # Lattice Events
//!
//! Snapshot/delta projections of run and worker state for external fan-out.
//!
//! Events are projections, **not** the source of truth: publication is
//! fire-and-forget, failures are logged and swallowed, and consumers
//! reconstruct state by applying deltas on top of the last snapshot. For each
//! `(runId, nodeId)` the `(revision, sequence)` pair on deltas is
//! non-decreasing.

pub mod bus;
pub mod event;

pub use bus::{BroadcastSink, EventBus, EventSink, publish_all};
pub use event::{DeltaOperation, EventData, EventScope, RunEvent};
