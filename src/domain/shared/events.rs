//! Events reported to the application owning the client

use super::error::SignalingError;
use crate::domain::call::CallState;
use crate::domain::registration::ClientState;
use serde::Serialize;
use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Registration state changed
    StateChanged { state: ClientState },
    /// Registration attempt failed; a retry is scheduled
    RegistrationFailed { error: SignalingError },
    /// STUN reported a new public address for the signaling socket
    ReflexiveAddressChanged { address: SocketAddr },
    /// Unanswered incoming call
    CallReceived { call_id: String, from: String },
    /// Outgoing call placed or incoming call answered
    CallStarted { call_id: String },
    CallRinging { call_id: String },
    CallStateChanged { call_id: String, state: CallState },
    CallFinished {
        call_id: String,
        error: Option<SignalingError>,
        duration_secs: i64,
    },
    ActiveCallsChanged { count: usize },
}

impl ClientEvent {
    /// Returns the event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            ClientEvent::StateChanged { .. } => "StateChanged",
            ClientEvent::RegistrationFailed { .. } => "RegistrationFailed",
            ClientEvent::ReflexiveAddressChanged { .. } => "ReflexiveAddressChanged",
            ClientEvent::CallReceived { .. } => "CallReceived",
            ClientEvent::CallStarted { .. } => "CallStarted",
            ClientEvent::CallRinging { .. } => "CallRinging",
            ClientEvent::CallStateChanged { .. } => "CallStateChanged",
            ClientEvent::CallFinished { .. } => "CallFinished",
            ClientEvent::ActiveCallsChanged { .. } => "ActiveCallsChanged",
        }
    }

    /// Call the event is about, if any
    pub fn call_id(&self) -> Option<&str> {
        match self {
            ClientEvent::CallReceived { call_id, .. }
            | ClientEvent::CallStarted { call_id }
            | ClientEvent::CallRinging { call_id }
            | ClientEvent::CallStateChanged { call_id, .. }
            | ClientEvent::CallFinished { call_id, .. } => Some(call_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = ClientEvent::CallStateChanged {
            call_id: "abc".to_string(),
            state: CallState::Active,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"call_state_changed","call_id":"abc","state":"Active"}"#);
        assert_eq!(event.event_type(), "CallStateChanged");
        assert_eq!(event.call_id(), Some("abc"));
    }
}
