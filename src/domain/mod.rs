//! Domain layer - states, errors and events of calls and registration

pub mod call;
pub mod registration;
pub mod shared;

pub use call::{CallDirection, CallState};
pub use registration::ClientState;
pub use shared::{ClientError, ClientEvent, SignalingError};
