//! Shared kernel - error and event types used across the client

pub mod error;
pub mod events;

pub use error::{ClientError, SignalingError};
pub use events::ClientEvent;
