//! Wire protocols: SIP signaling, STUN address discovery and ICE candidates

pub mod ice;
pub mod sip;
pub mod stun;
