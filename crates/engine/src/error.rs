//! Engine error types.

use thiserror::Error;

/// Errors from run state engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A referenced run does not exist in the registry.
    #[error("run not found: {0}")]
    RunNotFound(String),

    /// The run is terminal and admits no further mutations.
    #[error("run {0} is already terminal")]
    RunFinalised(String),

    /// A referenced node does not exist in the run.
    #[error("node not found: {0}")]
    NodeNotFound(String),
}
