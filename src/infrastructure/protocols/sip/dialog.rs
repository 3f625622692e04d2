//! Per-dialog state shared by the registration and call paths

use super::auth::DigestChallenge;
use super::message::SipMessage;
use rand::Rng;
use tracing::{debug, warn};
use uuid::Uuid;

/// Random token for tags
pub fn generate_tag() -> String {
    format!("{:08x}", rand::thread_rng().gen::<u32>())
}

/// Call-ID, local tag, CSeq counter and cached challenges of one dialog.
///
/// The counter starts at 1 and never goes backwards. A cached challenge is
/// only replaced by one with a different realm or nonce.
#[derive(Debug, Clone)]
pub struct DialogContext {
    call_id: String,
    tag: String,
    cseq: u32,
    challenge: Option<DigestChallenge>,
    proxy_challenge: Option<DigestChallenge>,
}

impl DialogContext {
    pub fn new() -> Self {
        Self::with_ids(Uuid::new_v4().to_string(), generate_tag())
    }

    /// Context for a dialog created by the remote side
    pub fn with_ids(call_id: String, tag: String) -> Self {
        Self {
            call_id,
            tag,
            cseq: 1,
            challenge: None,
            proxy_challenge: None,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Sequence number for the next new request
    pub fn next_cseq(&mut self) -> u32 {
        let seq = self.cseq;
        self.cseq += 1;
        seq
    }

    pub fn challenge(&self) -> Option<&DigestChallenge> {
        self.challenge.as_ref()
    }

    pub fn proxy_challenge(&self) -> Option<&DigestChallenge> {
        self.proxy_challenge.as_ref()
    }

    /// Cache the challenge of a 401/407. Returns false when there is nothing
    /// usable to answer or when the server repeated the challenge we already
    /// answered, meaning our credentials were rejected.
    pub fn handle_authentication(&mut self, response: &SipMessage) -> bool {
        let (header, slot) = match response.status_code() {
            Some(401) => ("WWW-Authenticate", &mut self.challenge),
            Some(407) => ("Proxy-Authenticate", &mut self.proxy_challenge),
            _ => return false,
        };

        let Some(value) = response.first_header(header) else {
            warn!("{} response without {} header", response.status_code().unwrap_or_default(), header);
            return false;
        };
        let challenge = match DigestChallenge::parse(value) {
            Ok(challenge) => challenge,
            Err(e) => {
                warn!("Cannot answer challenge: {}", e);
                return false;
            }
        };

        if let Some(previous) = slot.as_ref() {
            if previous.is_repeat_of(&challenge) {
                warn!("Authentication failed for realm {}", challenge.realm);
                return false;
            }
        }

        debug!("Caching challenge for realm {}", challenge.realm);
        *slot = Some(challenge);
        true
    }

    pub fn clear_challenges(&mut self) {
        self.challenge = None;
        self.proxy_challenge = None;
    }
}

impl Default for DialogContext {
    fn default() -> Self {
        Self::new()
    }
}
