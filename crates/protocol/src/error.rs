//! Protocol error types.

use thiserror::Error;

use crate::window::WindowError;

/// Errors from envelope handling and window bookkeeping.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A payload failed to serialize or deserialize.
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A window operation failed (reset mid-acquire).
    #[error(transparent)]
    Window(#[from] WindowError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_display() {
        let serde_error = serde_json::from_str::<String>("not valid json").unwrap_err();
        let error = ProtocolError::from(serde_error);
        assert!(error.to_string().starts_with("serialization:"));
    }

    #[test]
    fn window_errors_pass_through() {
        let error = ProtocolError::from(WindowError::Reset);
        assert_eq!(
            error.to_string(),
            "send window was reset while waiting for a credit"
        );
    }
}
