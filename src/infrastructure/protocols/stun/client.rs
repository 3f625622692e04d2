//! STUN binding tracker for reflexive address discovery
//!
//! Sans-IO: the owner sends the bytes returned by [`StunBinding::request`]
//! from its signaling socket and feeds matching datagrams back in.

use super::message::{StunMessage, StunMessageType, TransactionId};
use bytes::Bytes;
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// Outcome of a binding response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingOutcome {
    /// The reflexive address is new or differs from the previous one
    Changed(SocketAddr),
    Unchanged(SocketAddr),
    /// Error response or a response without a mapped address
    Failed,
}

#[derive(Debug, Default)]
pub struct StunBinding {
    server: Option<SocketAddr>,
    outstanding: Option<TransactionId>,
    reflexive: Option<SocketAddr>,
}

impl StunBinding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_server(&mut self, server: SocketAddr) {
        info!("Using STUN server {}", server);
        self.server = Some(server);
    }

    pub fn reflexive_address(&self) -> Option<SocketAddr> {
        self.reflexive
    }

    /// Start a new binding transaction. Any previous one is abandoned.
    pub fn request(&mut self) -> Option<(SocketAddr, Bytes)> {
        let server = self.server?;
        let request = StunMessage::binding_request();
        debug!("Sending STUN binding request to {}", server);
        self.outstanding = Some(request.transaction_id);
        Some((server, request.to_bytes()))
    }

    /// Whether the datagram answers the outstanding binding request
    pub fn matches(&self, data: &[u8]) -> bool {
        match (StunMessage::peek(data), self.outstanding) {
            (Some(header), Some(id)) => header.transaction_id == id,
            _ => false,
        }
    }

    pub fn handle_response(&mut self, data: &[u8]) -> BindingOutcome {
        self.outstanding = None;
        let message = match StunMessage::parse(data) {
            Ok(message) => message,
            Err(e) => {
                warn!("Invalid STUN response: {}", e);
                return BindingOutcome::Failed;
            }
        };
        match (message.message_type, message.error_code()) {
            (StunMessageType::BindingResponse, _) => {}
            (_, Some((code, reason))) => {
                warn!("STUN binding failed: {} {}", code, reason);
                return BindingOutcome::Failed;
            }
            (other, None) => {
                warn!("STUN binding failed: {:?}", other);
                return BindingOutcome::Failed;
            }
        }
        let Some(address) = message.reflexive_address() else {
            warn!("STUN binding response carries no mapped address");
            return BindingOutcome::Failed;
        };

        if self.reflexive == Some(address) {
            BindingOutcome::Unchanged(address)
        } else {
            info!("Reflexive address changed to {}", address);
            self.reflexive = Some(address);
            BindingOutcome::Changed(address)
        }
    }
}
