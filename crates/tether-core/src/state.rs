//! Orchestrator run state.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of the orchestrator's single active invocation.
///
/// Only the dispatch loop writes this value. Everyone else observes it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "lowercase")]
pub enum RunState {
    /// Nothing in flight.
    #[default]
    Idle,
    /// A prompt was dequeued and the backend invoked.
    Starting,
    /// The backend has produced output.
    Running,
    /// Cancellation requested, waiting to settle.
    Stopping,
    /// The last turn failed.
    Error(String),
}

impl RunState {
    /// Whether a backend invocation is in flight.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    /// Whether a new invocation may start from this state.
    pub fn accepts_dispatch(&self) -> bool {
        matches!(self, Self::Idle | Self::Error(_))
    }

    /// Whether moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: &Self) -> bool {
        match (self, next) {
            (_, Self::Error(_)) => true,
            (Self::Idle | Self::Error(_), Self::Starting)
            | (Self::Starting, Self::Running)
            | (Self::Starting | Self::Running | Self::Stopping, Self::Idle)
            | (Self::Starting | Self::Running, Self::Stopping)
            | (Self::Error(_), Self::Idle) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Starting => f.write_str("starting"),
            Self::Running => f.write_str("running"),
            Self::Stopping => f.write_str("stopping"),
            Self::Error(detail) => write!(f, "error: {detail}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_idle() {
        assert_eq!(RunState::default(), RunState::Idle);
        assert!(!RunState::Idle.is_active());
    }

    #[test]
    fn active_states() {
        assert!(RunState::Starting.is_active());
        assert!(RunState::Running.is_active());
        assert!(RunState::Stopping.is_active());
        assert!(!RunState::Error("x".into()).is_active());
    }

    #[test]
    fn dispatch_allowed_from_idle_or_error() {
        assert!(RunState::Idle.accepts_dispatch());
        assert!(RunState::Error("x".into()).accepts_dispatch());
        assert!(!RunState::Running.accepts_dispatch());
    }

    #[test]
    fn legal_transitions() {
        assert!(RunState::Idle.can_transition_to(&RunState::Starting));
        assert!(RunState::Starting.can_transition_to(&RunState::Running));
        assert!(RunState::Running.can_transition_to(&RunState::Idle));
        assert!(RunState::Running.can_transition_to(&RunState::Stopping));
        assert!(RunState::Stopping.can_transition_to(&RunState::Idle));
        assert!(RunState::Running.can_transition_to(&RunState::Error("e".into())));
    }

    #[test]
    fn illegal_transitions() {
        assert!(!RunState::Idle.can_transition_to(&RunState::Running));
        assert!(!RunState::Running.can_transition_to(&RunState::Starting));
        assert!(!RunState::Stopping.can_transition_to(&RunState::Running));
    }

    #[test]
    fn display_includes_error_detail() {
        assert_eq!(RunState::Error("exit 2".into()).to_string(), "error: exit 2");
    }
}
