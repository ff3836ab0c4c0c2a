//! Dispatch error types.

use lattice_session::SessionError;
use thiserror::Error;

/// Errors from dispatch validation and delivery.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A middleware chain was attached without naming its host.
    #[error("middleware chain present but host node id missing")]
    MissingHostNodeId,

    /// A host dispatch carried a chain index it must not have.
    #[error("host dispatch must not carry a chain index")]
    UnexpectedChainIndex,

    /// A middleware dispatch lacked its chain index.
    #[error("middleware dispatch missing chain index")]
    MissingChainIndex,

    /// The chain index points past the end of the chain.
    #[error("middleware chain index {index} out of bounds for chain of {chain_len}")]
    ChainIndexOutOfBounds {
        /// The offending index.
        index: usize,
        /// Length of the chain.
        chain_len: usize,
    },

    /// The chain entry at the index is not the dispatched node.
    #[error("middleware chain index {index} does not match node {node_id}")]
    ChainIndexMismatch {
        /// The chain index carried by the dispatch.
        index: usize,
        /// The node the dispatch targets.
        node_id: String,
    },

    /// The session layer refused or lost the send.
    #[error(transparent)]
    Session(#[from] SessionError),
}
