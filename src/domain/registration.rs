//! Registration state of a client

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientState {
    Disconnected,
    /// Resolving servers or waiting for the first REGISTER to succeed
    Connecting,
    Connected,
    /// Unregistering
    Disconnecting,
}

impl ClientState {
    pub fn can_transition_to(&self, new_state: &ClientState) -> bool {
        use ClientState::*;

        matches!(
            (self, new_state),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnecting)
                | (Connected, Disconnected)
                | (Disconnecting, Disconnected)
        )
    }
}
