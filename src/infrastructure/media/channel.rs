//! Media channel handle consumed by calls
//!
//! Audio capture and RTP transport live outside the signaling stack. A call
//! only tells the channel which payload types the remote side offered and asks
//! whether media can flow.

use super::codec::{CodecNegotiator, PayloadType};
use tracing::{debug, info};

/// Bidirectional audio channel attached to one call
#[cfg_attr(test, mockall::automock)]
pub trait MediaChannel: Send {
    /// Payload types we offer, in preference order
    fn local_payload_types(&self) -> Vec<PayloadType>;

    /// Payload types announced by the remote side
    fn set_remote_payload_types(&mut self, remote: &[PayloadType]);

    /// Whether a common codec was selected and media can flow
    fn is_open(&self) -> bool;

    fn close(&mut self);
}

/// Media channel that opens as soon as the remote side shares one of our codecs
#[derive(Debug, Clone)]
pub struct NegotiatedChannel {
    negotiator: CodecNegotiator,
    selected: Option<PayloadType>,
    closed: bool,
}

impl NegotiatedChannel {
    pub fn new(negotiator: CodecNegotiator) -> Self {
        Self {
            negotiator,
            selected: None,
            closed: false,
        }
    }

    pub fn selected(&self) -> Option<&PayloadType> {
        self.selected.as_ref()
    }
}

impl Default for NegotiatedChannel {
    fn default() -> Self {
        Self::new(CodecNegotiator::new())
    }
}

impl MediaChannel for NegotiatedChannel {
    fn local_payload_types(&self) -> Vec<PayloadType> {
        self.negotiator.supported().to_vec()
    }

    fn set_remote_payload_types(&mut self, remote: &[PayloadType]) {
        self.selected = self.negotiator.select_best(remote);
        match &self.selected {
            Some(pt) => info!("Selected codec {} ({})", pt.name, pt.id),
            None => debug!("No common codec among {} remote payload types", remote.len()),
        }
    }

    fn is_open(&self) -> bool {
        !self.closed && self.selected.is_some()
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
