//! Media collaborators of the signaling stack

pub mod channel;
pub mod codec;

pub use channel::{MediaChannel, NegotiatedChannel};
pub use codec::{CodecNegotiator, PayloadType};
