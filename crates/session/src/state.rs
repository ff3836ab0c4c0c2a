//! Session state machine.

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Lifecycle states of a worker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Connection open, nothing negotiated yet.
    New,
    /// Handshake received, awaiting validation or registration.
    Handshaking,
    /// Capabilities registered; session accept issued.
    Registered,
    /// Heartbeats flowing; the worker is selectable.
    Heartbeating,
    /// Transport lost; the session is resumable during the grace period.
    Backoff,
    /// The worker asked to stop receiving new dispatches.
    Draining,
    /// Torn down; no further transitions.
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Handshaking => write!(f, "handshaking"),
            Self::Registered => write!(f, "registered"),
            Self::Heartbeating => write!(f, "heartbeating"),
            Self::Backoff => write!(f, "backoff"),
            Self::Draining => write!(f, "draining"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Returns `true` when the transition is allowed.
#[must_use]
pub fn can_transition(from: SessionState, to: SessionState) -> bool {
    use SessionState as S;
    matches!(
        (from, to),
        (S::New, S::Handshaking)
            | (S::Handshaking, S::Registered)
            | (S::Handshaking, S::Heartbeating)
            | (S::Handshaking, S::Backoff)
            | (S::Registered, S::Heartbeating)
            | (S::Registered, S::Backoff)
            | (S::Heartbeating, S::Draining)
            | (S::Heartbeating, S::Backoff)
            | (S::Draining, S::Backoff)
            | (S::Backoff, S::New)
            | (S::Backoff, S::Handshaking)
            | (_, S::Closed)
    ) && from != S::Closed
}

/// Tracks one session's state with validated transitions.
#[derive(Debug)]
pub struct SessionTracker {
    state: SessionState,
}

impl SessionTracker {
    /// Start in [`SessionState::New`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: SessionState::New,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Transition, rejecting illegal moves.
    pub fn transition(&mut self, to: SessionState) -> Result<(), SessionError> {
        if !can_transition(self.state, to) {
            return Err(SessionError::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        Ok(())
    }

    /// Transition, ignoring illegal moves with a debug log.
    pub fn try_transition(&mut self, to: SessionState) {
        if let Err(error) = self.transition(to) {
            tracing::debug!(%error, "ignoring invalid session transition");
        }
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut tracker = SessionTracker::new();
        assert!(tracker.transition(SessionState::Handshaking).is_ok());
        assert!(tracker.transition(SessionState::Registered).is_ok());
        assert!(tracker.transition(SessionState::Heartbeating).is_ok());
        assert!(tracker.transition(SessionState::Draining).is_ok());
        assert_eq!(tracker.state(), SessionState::Draining);
    }

    #[test]
    fn resume_path_skips_registration() {
        let mut tracker = SessionTracker::new();
        tracker.transition(SessionState::Handshaking).unwrap();
        assert!(tracker.transition(SessionState::Heartbeating).is_ok());
    }

    #[test]
    fn closed_is_final() {
        let mut tracker = SessionTracker::new();
        tracker.transition(SessionState::Closed).unwrap();
        assert!(tracker.transition(SessionState::New).is_err());
        assert!(tracker.transition(SessionState::Handshaking).is_err());
    }

    #[test]
    fn invalid_transitions_rejected() {
        assert!(!can_transition(SessionState::New, SessionState::Heartbeating));
        assert!(!can_transition(SessionState::Registered, SessionState::New));
    }

    #[test]
    fn try_transition_swallows_errors() {
        let mut tracker = SessionTracker::new();
        tracker.try_transition(SessionState::Heartbeating);
        assert_eq!(tracker.state(), SessionState::New);
    }

    #[test]
    fn backoff_allows_reestablish() {
        let mut tracker = SessionTracker::new();
        tracker.transition(SessionState::Handshaking).unwrap();
        tracker.transition(SessionState::Backoff).unwrap();
        assert!(tracker.transition(SessionState::Handshaking).is_ok());
    }
}
