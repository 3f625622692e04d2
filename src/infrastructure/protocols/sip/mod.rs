//! SIP user agent
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────┐
//! │       User Agent        │
//! │ (socket, DNS, commands) │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │       SIP Client        │
//! │ (registration, routing) │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │         Calls           │
//! │  (INVITE dialogs, SDP)  │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transaction Layer     │
//! │ (retransmit, timeouts)  │
//! └─────────────────────────┘
//! ```

pub mod auth;
pub mod builder;
pub mod call;
pub mod client;
pub mod dialog;
pub mod dns;
pub mod message;
pub mod reactor;
pub mod registry;
pub mod sdp;
pub mod transaction;
pub mod transport;
pub mod user_agent;

pub use auth::{AuthError, DigestChallenge};
pub use builder::{MessageBuilder, UserIdentity};
pub use call::{Call, CallContext};
pub use client::{
    ClientConfig, LookupKind, LookupRequest, SessionFactory, SipClient, SrvRecord,
    StaticSessionFactory, Transmit,
};
pub use dialog::DialogContext;
pub use dns::{Resolver, SystemResolver};
pub use message::{ParseError, SipError, SipMessage, SipMethod};
pub use sdp::{LocalDescription, SdpMessage, SdpSession};
pub use transaction::{SipTimers, Transaction, TransactionState};
pub use transport::{IncomingDatagram, Transport, UdpTransport};
pub use user_agent::{Command, UserAgent, UserAgentHandle};
