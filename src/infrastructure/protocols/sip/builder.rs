//! SIP request and response construction

use super::auth::{authorization, DigestChallenge};
use super::dialog::DialogContext;
use super::message::{SipMessage, SipMethod};
use rand::Rng;
use std::net::SocketAddr;

/// Methods advertised in `Allow`
pub const ALLOWED_METHODS: &str = "INVITE, ACK, CANCEL, OPTIONS, BYE";

/// Magic cookie prefix of RFC 3261 branch tokens
const BRANCH_PREFIX: &str = "z9hG4bK";

/// Unique branch token for a new request
pub fn generate_branch() -> String {
    format!("{}{:016x}", BRANCH_PREFIX, rand::thread_rng().gen::<u64>())
}

/// The local account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub username: String,
    pub password: String,
    pub domain: String,
    pub display_name: Option<String>,
}

impl UserIdentity {
    /// `sip:user@domain`
    pub fn address_of_record(&self) -> String {
        format!("sip:{}@{}", self.username, self.domain)
    }

    /// Name-addr for From/To
    pub fn name_addr(&self) -> String {
        match &self.display_name {
            Some(name) if !name.is_empty() => format!("\"{}\" <{}>", name, self.address_of_record()),
            _ => format!("<{}>", self.address_of_record()),
        }
    }
}

/// Builds the requests and responses of one signaling identity. The contact
/// address follows the reflexive address once it is known.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    identity: UserIdentity,
    contact_address: SocketAddr,
    user_agent: String,
}

impl MessageBuilder {
    pub fn new(identity: UserIdentity, contact_address: SocketAddr) -> Self {
        Self {
            identity,
            contact_address,
            user_agent: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    pub fn contact_address(&self) -> SocketAddr {
        self.contact_address
    }

    pub fn set_contact_address(&mut self, address: SocketAddr) {
        self.contact_address = address;
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn contact(&self) -> String {
        format!("<sip:{}@{}>", self.identity.username, self.contact_address)
    }

    fn via(&self) -> String {
        format!("SIP/2.0/UDP {};branch={};rport", self.contact_address, generate_branch())
    }

    /// New request on `ctx`. To is the local address; callers in a dialog
    /// replace it with the remote party.
    pub fn request(&self, method: SipMethod, uri: &str, ctx: &DialogContext, seq: u32) -> SipMessage {
        let mut request = SipMessage::request(method.as_str(), uri);
        request.add_header("Via", self.via());
        request.add_header("Max-Forwards", "70");
        request.add_header("To", self.identity.name_addr());
        request.add_header("From", format!("{};tag={}", self.identity.name_addr(), ctx.tag()));
        request.add_header("Call-ID", ctx.call_id());
        request.add_header("CSeq", format!("{} {}", seq, method));
        request.add_header("Contact", self.contact());
        self.authorize(&mut request, ctx);
        request.add_header("User-Agent", self.user_agent.clone());
        if !matches!(method, SipMethod::Ack | SipMethod::Cancel) {
            request.add_header("Allow", ALLOWED_METHODS);
        }
        request
    }

    /// Copy of `original` as a new transaction: fresh branch, next CSeq and
    /// authorization recomputed from the cached challenges.
    pub fn retry(&self, original: &SipMessage, ctx: &mut DialogContext) -> SipMessage {
        let mut request = original.clone();
        let method = request.method().unwrap_or_default().to_string();
        request.set_header("Via", self.via());
        request.set_header("CSeq", format!("{} {}", ctx.next_cseq(), method));
        request.remove_header("Authorization");
        request.remove_header("Proxy-Authorization");
        self.authorize(&mut request, ctx);
        request
    }

    fn authorize(&self, request: &mut SipMessage, ctx: &DialogContext) {
        let method = request.method().unwrap_or_default().to_string();
        let uri = request.uri().unwrap_or_default().to_string();
        let answer = |challenge: &DigestChallenge| {
            authorization(
                challenge,
                &self.identity.username,
                &self.identity.password,
                &method,
                &uri,
            )
        };
        if let Some(challenge) = ctx.challenge() {
            request.add_header("Authorization", answer(challenge));
        }
        if let Some(challenge) = ctx.proxy_challenge() {
            request.add_header("Proxy-Authorization", answer(challenge));
        }
    }

    /// Response to `request`, echoing its transaction and dialog headers
    pub fn response(&self, request: &SipMessage, code: u16, reason: &str) -> SipMessage {
        let mut response = SipMessage::response(code, reason);
        for (name, value) in request.headers() {
            if matches!(name, "Via" | "From" | "To" | "Call-ID" | "CSeq" | "Record-Route") {
                response.add_header(name, value);
            }
        }
        response.add_header("Contact", self.contact());
        response.add_header("User-Agent", self.user_agent.clone());
        response
    }
}
