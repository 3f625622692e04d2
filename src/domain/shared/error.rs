//! Signaling errors

use serde::Serialize;
use thiserror::Error;

/// Why a call or registration ended badly. Carried in terminal states and
/// events rather than returned.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SignalingError {
    #[error("No final response before the transaction deadline")]
    TransactionTimeout,

    #[error("Authentication failed")]
    AuthenticationExhausted,

    #[error("SDP negotiation failed: {0}")]
    SdpNegotiationFailure(String),

    #[error("Remote rejected the request: {code} {reason}")]
    RemoteRejection { code: u16, reason: String },

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),
}

/// Misuse of the client API
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Not connected to a SIP server")]
    NotConnected,

    #[error("Unknown call: {0}")]
    UnknownCall(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}
