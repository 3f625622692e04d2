//! Call value objects

use serde::{Deserialize, Serialize};

/// Call direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

/// Call state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// INVITE sent or received, no media yet
    Connecting,
    /// Media negotiated
    Active,
    /// BYE or CANCEL in progress
    Disconnecting,
    Finished,
}

impl CallState {
    /// Check if state transition is valid
    pub fn can_transition_to(&self, new_state: &CallState) -> bool {
        use CallState::*;

        match (self, new_state) {
            (Connecting, Active) => true,
            (Connecting, Disconnecting) => true,
            (Connecting, Finished) => true,

            (Active, Disconnecting) => true,
            (Active, Finished) => true,

            (Disconnecting, Finished) => true,

            // Can't transition from Finished
            (Finished, _) => false,

            _ => false,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, CallState::Finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_state_transitions() {
        assert!(CallState::Connecting.can_transition_to(&CallState::Active));
        assert!(CallState::Connecting.can_transition_to(&CallState::Finished));
        assert!(CallState::Active.can_transition_to(&CallState::Disconnecting));
        assert!(CallState::Disconnecting.can_transition_to(&CallState::Finished));
    }

    #[test]
    fn test_invalid_state_transitions() {
        assert!(!CallState::Finished.can_transition_to(&CallState::Active));
        assert!(!CallState::Disconnecting.can_transition_to(&CallState::Active));
        assert!(!CallState::Active.can_transition_to(&CallState::Connecting));
    }
}
