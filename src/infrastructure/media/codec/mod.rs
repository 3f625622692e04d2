//! Audio codec descriptions and negotiation

pub mod negotiator;

pub use negotiator::{CodecNegotiator, PayloadType, TELEPHONE_EVENT};
