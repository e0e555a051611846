//! Connection lifecycle state machine
//!
//! One lifecycle per remote peer. Transitions outside the allowed edges are
//! rejected with a `StateError` and leave the state untouched.

use crate::error::StateError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    /// Whether `self -> next` is an allowed edge. Self-loops are not edges.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (a, b) if a == b => false,
            (_, Failed) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Connected) => true,
            (Connecting, Disconnected) => true,
            (Connected, Disconnected) => true,
            (Failed, Disconnected) => true,
            (Failed, Connecting) => true,
            _ => false,
        }
    }

    pub fn is_terminal_failure(self) -> bool {
        self == ConnectionState::Failed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

/// Lifecycle of the connection to one remote peer
#[derive(Debug, Clone)]
pub struct ConnectionLifecycle {
    peer_id: String,
    state: ConnectionState,
}

impl ConnectionLifecycle {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            state: ConnectionState::Disconnected,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `next`. Returns the previous state, or `Ok(None)` when the
    /// lifecycle is already in `next`.
    pub fn transition(
        &mut self,
        next: ConnectionState,
    ) -> Result<Option<ConnectionState>, StateError> {
        if self.state == next {
            return Ok(None);
        }
        if !self.state.can_transition_to(next) {
            return Err(StateError::InvalidTransition {
                peer_id: self.peer_id.clone(),
                from: self.state,
                to: next,
            });
        }
        let previous = self.state;
        self.state = next;
        Ok(Some(previous))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_retry_after_failure() {
        let mut lifecycle = ConnectionLifecycle::new("b1");
        assert_eq!(lifecycle.transition(Connecting).unwrap(), Some(Disconnected));
        assert_eq!(lifecycle.transition(Failed).unwrap(), Some(Connecting));
        assert_eq!(lifecycle.transition(Connecting).unwrap(), Some(Failed));
        assert_eq!(lifecycle.transition(Connected).unwrap(), Some(Connecting));
        assert_eq!(lifecycle.state(), Connected);
    }

    #[test]
    fn test_connected_cannot_go_back_to_connecting() {
        let mut lifecycle = ConnectionLifecycle::new("b1");
        lifecycle.transition(Connecting).unwrap();
        lifecycle.transition(Connected).unwrap();

        let err = lifecycle.transition(Connecting).unwrap_err();
        assert_eq!(
            err,
            StateError::InvalidTransition {
                peer_id: "b1".to_string(),
                from: Connected,
                to: Connecting,
            }
        );
        assert_eq!(lifecycle.state(), Connected);
    }

    #[test]
    fn test_disconnected_cannot_jump_to_connected() {
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(Disconnected.can_transition_to(Failed));
        assert!(Connecting.can_transition_to(Disconnected));
        assert!(!Failed.can_transition_to(Connected));
    }

    #[test]
    fn test_same_state_is_noop() {
        let mut lifecycle = ConnectionLifecycle::new("b1");
        assert_eq!(lifecycle.transition(Disconnected).unwrap(), None);
    }
}
