//! YakPhone - a minimal SIP user agent
//!
//! Registers one account with its SIP server, keeps the registration alive
//! behind NAT using STUN, and places and answers audio calls negotiated with
//! SDP offer/answer.

pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use domain::{CallDirection, CallState, ClientError, ClientEvent, ClientState, SignalingError};
pub use infrastructure::protocols::sip::{ClientConfig, SipClient, UserAgent, UserAgentHandle};
