#![warn(missing_docs)]

//! # Lattice Core
//!
//! Shared primitives for the Lattice scheduler control plane.
//!
//! This crate carries the types every other crate agrees on:
//!
//! - [`RunStatus`] / [`FrameStatus`] — run, node and frame state machines
//! - [`ErrorInfo`] — the `{code, message, details}` error shape surfaced to
//!   clients and carried on the wire
//! - [`WorkflowDefinition`] and friends — the submitted workflow graph model
//! - [`definition_hash`] — canonical-JSON SHA-256 hashing of definitions

pub mod error;
pub mod hash;
pub mod status;
pub mod workflow;

pub use error::{codes, ErrorInfo};
pub use hash::{canonical_json, definition_hash};
pub use status::{FrameStatus, RunStatus};
pub use workflow::{
    EdgeEndpoint, MiddlewareDef, MiddlewareSpec, NodeUi, PackageRef, PortBinding, PortBindingScope,
    PortDef, WorkflowDefinition, WorkflowEdge, WorkflowNode, WorkflowSubgraph,
};

/// Node type marking a container node that expands into a subgraph frame.
pub const CONTAINER_NODE_TYPE: &str = "workflow.container";

/// Parameter key under which container nodes carry their subgraph reference.
pub const CONTAINER_PARAMS_KEY: &str = "__container";
