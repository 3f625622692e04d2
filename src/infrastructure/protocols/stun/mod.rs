//! STUN (Session Traversal Utilities for NAT), RFC 5389 binding subset

pub mod client;
pub mod message;

pub use client::{BindingOutcome, StunBinding};
pub use message::{StunAttribute, StunError, StunHeader, StunMessage, StunMessageType, TransactionId};
