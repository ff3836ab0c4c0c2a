//! Run and node status tracking.

use serde::{Deserialize, Serialize};

/// The status of a run or of a single node within it.
///
/// Runs and nodes share one vocabulary: the run-level value is a pure rollup
/// of its node statuses.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Waiting for dependencies or a worker.
    #[default]
    Queued,
    /// Dispatched to a worker and executing.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Cancelled before completion.
    Cancelled,
    /// Skipped by a worker or middleware decision.
    Skipped,
}

impl RunStatus {
    /// Returns `true` if this status is final — no further transitions are
    /// admitted once it is reached.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::Skipped
        )
    }

    /// Returns `true` for the two statuses a worker may report as a
    /// successful outcome.
    #[must_use]
    pub fn is_success_like(self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }

    /// Parse a worker-reported status string, normalising unknown values to
    /// `failed` so a misbehaving worker cannot wedge a node in limbo.
    #[must_use]
    pub fn normalise(value: &str) -> Self {
        match value {
            "queued" => Self::Queued,
            "running" => Self::Running,
            "succeeded" => Self::Succeeded,
            "cancelled" => Self::Cancelled,
            "skipped" => Self::Skipped,
            _ => Self::Failed,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// The status of a subgraph frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameStatus {
    /// Materialised but not yet activated.
    Idle,
    /// Activated; contained nodes are executing.
    Running,
    /// Every contained node succeeded or was skipped.
    Succeeded,
    /// A contained node failed; remaining queued nodes were cancelled.
    Failed,
}

impl FrameStatus {
    /// Returns `true` once the frame has finished.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for FrameStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
