//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - Protocol implementations (SIP, STUN, ICE)
//! - Media channel and codec negotiation

pub mod media;
pub mod protocols;
