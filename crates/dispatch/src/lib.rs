#![warn(missing_docs)]

//! # Lattice Dispatch
//!
//! The background dispatcher: consumes the ready queue, selects a worker
//! per request with backpressure-aware policies, sends `biz.exec.dispatch`
//! envelopes, and owns per-dispatch ack timeouts and bounded retry.

pub mod dispatcher;
pub mod error;
pub mod strategy;

pub use dispatcher::{DispatchGateway, Dispatcher, SelectionFilter};
pub use error::DispatchError;
pub use strategy::WorkerStrategy;
