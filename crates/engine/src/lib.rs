//! # Lattice Engine
//!
//! The run state engine: per-run graphs of node states, subgraph frames,
//! middleware chain bookkeeping, edge-binding propagation, pending
//! cross-worker requests, and the [`RunRegistry`] facade that serialises
//! every mutation behind one lock.
//!
//! Mutating entrypoints gather their event publications while holding the
//! lock and the registry publishes them afterwards, so emitters never block
//! mutations.

pub mod bootstrap;
pub mod emit;
pub mod error;
pub mod frames;
pub mod lifecycle;
pub mod model;
pub mod next;
pub mod pending;
pub mod pointer;
pub mod propagate;
pub mod ready;
pub mod registry;
pub mod resources;
pub mod scope;
pub mod stores;
pub mod summary;
pub mod updates;

pub use error::EngineError;
pub use lifecycle::DispatchStamp;
pub use model::{
    DispatchRequest, EdgeBinding, FrameDefinition, FrameRuntimeState, NodeLocation, NodeRole,
    NodeState, RunRecord,
};
pub use pending::ExpiredNextRequest;
pub use registry::{RunRegistry, StartRunRequest};
pub use resources::ResourceBinder;
pub use stores::{
    CatalogError, GrantQuery, GrantScope, InMemoryCatalog, InMemoryGrantStore,
    InMemoryResourceProvider, InMemoryWorkflowStore, PackageCatalog, PackageManifest,
    ResourceError, ResourceGrant, ResourceProvider, ResourceRequirement, StoredResource,
    WorkflowStore,
};
pub use summary::{NodeSummary, RunListPage, RunSummary};
