//! ICE candidate representation and the per-call ICE component interface

pub mod agent;
pub mod candidate;

pub use agent::{IceComponent, StaticIceAgent};
pub use candidate::{CandidateError, CandidateType, IceCandidate, RTCP_COMPONENT, RTP_COMPONENT};
