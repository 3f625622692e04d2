//! Shared fixtures: a client wired to a scripted server, plus media and ICE
//! fakes whose candidates the test controls.

#![allow(dead_code)]

use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use yakphone::infrastructure::media::{CodecNegotiator, MediaChannel, PayloadType};
use yakphone::infrastructure::protocols::ice::{CandidateType, IceCandidate, IceComponent};
use yakphone::infrastructure::protocols::sip::{
    ClientConfig, LookupKind, SessionFactory, SipClient, SipMessage, StaticSessionFactory,
    UserIdentity,
};
use yakphone::infrastructure::protocols::stun::StunMessage;
use yakphone::{ClientEvent, ClientState};

pub const LOCAL: &str = "10.0.0.1:5060";
pub const SERVER: &str = "192.0.2.1:5060";
pub const STUN_SERVER: &str = "192.0.2.2:3478";
pub const REFLEXIVE: &str = "203.0.113.5:40000";

pub const REMOTE_SDP: &str = "v=0\r\n\
    o=- 1 1 IN IP4 198.51.100.7\r\n\
    s=-\r\n\
    c=IN IP4 198.51.100.7\r\n\
    t=0 0\r\n\
    m=audio 30000 RTP/AVP 0 101\r\n\
    a=rtpmap:0 PCMU/8000\r\n\
    a=rtpmap:101 telephone-event/8000\r\n\
    a=ice-ufrag:rmt1\r\n\
    a=ice-pwd:remotepasswordremotepass\r\n";

pub fn identity() -> UserIdentity {
    UserIdentity {
        username: "alice".to_string(),
        password: "secret".to_string(),
        domain: "example.com".to_string(),
        display_name: None,
    }
}

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

/// Candidates shared between a test and the ICE component it handed out
#[derive(Clone, Default)]
pub struct SharedCandidates(pub Arc<Mutex<Vec<IceCandidate>>>);

impl SharedCandidates {
    pub fn add_reflexive(&self, rtp: SocketAddr) {
        let mut candidates = self.0.lock().unwrap();
        for (component, port) in [(1, rtp.port()), (2, rtp.port() + 1)] {
            let address = SocketAddr::new(rtp.ip(), port);
            candidates.push(IceCandidate::new(CandidateType::ServerReflexive, address, component));
        }
    }
}

pub struct FakeIce {
    candidates: SharedCandidates,
    pub remote: Arc<Mutex<Vec<IceCandidate>>>,
}

impl IceComponent for FakeIce {
    fn local_user(&self) -> String {
        "usr1".to_string()
    }

    fn local_password(&self) -> String {
        "localpasswordlocalpass".to_string()
    }

    fn local_candidates(&self) -> Vec<IceCandidate> {
        self.candidates.0.lock().unwrap().clone()
    }

    fn set_remote_user(&mut self, _user: &str) {}

    fn set_remote_password(&mut self, _password: &str) {}

    fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        self.remote.lock().unwrap().push(candidate);
    }

    fn close(&mut self) {}
}

/// Media channel that opens whenever the remote side offered PCMU
pub struct FakeMedia {
    open: bool,
}

impl MediaChannel for FakeMedia {
    fn local_payload_types(&self) -> Vec<PayloadType> {
        CodecNegotiator::new().supported().to_vec()
    }

    fn set_remote_payload_types(&mut self, remote: &[PayloadType]) {
        self.open = remote.iter().any(|pt| pt.name.eq_ignore_ascii_case("PCMU"));
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        self.open = false;
    }
}

/// Hands out fake sessions whose candidates start empty
#[derive(Clone, Default)]
pub struct FakeFactory {
    pub sessions: Arc<Mutex<Vec<SharedCandidates>>>,
}

impl SessionFactory for FakeFactory {
    fn create(
        &mut self,
        _local_ip: IpAddr,
        _reflexive_ip: Option<IpAddr>,
    ) -> (Box<dyn MediaChannel>, Box<dyn IceComponent>) {
        let candidates = SharedCandidates::default();
        self.sessions.lock().unwrap().push(candidates.clone());
        let ice = FakeIce {
            candidates,
            remote: Arc::new(Mutex::new(Vec::new())),
        };
        (Box::new(FakeMedia { open: false }), Box::new(ice))
    }
}

/// A client and a clock. Everything the client sends goes to [`SERVER`]
/// or [`STUN_SERVER`].
pub struct Harness {
    pub client: SipClient,
    pub now: Instant,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_factory(Box::new(StaticSessionFactory::new(20000)))
    }

    pub fn with_factory(factory: Box<dyn SessionFactory>) -> Self {
        Self {
            client: SipClient::new(ClientConfig::new(identity()), addr(LOCAL), factory),
            now: Instant::now(),
        }
    }

    /// Run connect, lookups and STUN up to the first REGISTER, which is returned
    pub fn start(&mut self) -> SipMessage {
        self.client.connect_to_server(self.now);
        while self.client.poll_lookup().is_some() {}
        self.client
            .handle_host_lookup(self.now, LookupKind::Sip, Some(addr(SERVER)));
        self.client
            .handle_host_lookup(self.now, LookupKind::Stun, Some(addr(STUN_SERVER)));
        self.answer_stun(addr(REFLEXIVE));
        let mut sent = self.sent();
        assert_eq!(sent.len(), 1, "expected a single REGISTER");
        sent.remove(0)
    }

    /// Registered with the server, events drained
    pub fn connected() -> Self {
        Self::connected_with(Box::new(StaticSessionFactory::new(20000)))
    }

    pub fn connected_with(factory: Box<dyn SessionFactory>) -> Self {
        let mut harness = Self::with_factory(factory);
        let register = harness.start();
        harness.deliver(&respond(&register, 200, "OK"));
        assert_eq!(harness.client.state(), ClientState::Connected);
        harness.events();
        harness
    }

    /// Answer the pending STUN binding request with `mapped`
    pub fn answer_stun(&mut self, mapped: SocketAddr) {
        let request = self
            .client
            .poll_transmit()
            .expect("STUN binding request");
        assert_eq!(request.destination, addr(STUN_SERVER));
        let header = StunMessage::peek(&request.payload).expect("STUN header");
        let response = StunMessage::binding_response(header.transaction_id, mapped).to_bytes();
        self.client.handle_datagram(self.now, addr(STUN_SERVER), &response);
    }

    /// SIP messages sent to the server since the last call
    pub fn sent(&mut self) -> Vec<SipMessage> {
        let mut messages = Vec::new();
        while let Some(transmit) = self.client.poll_transmit() {
            if transmit.destination == addr(SERVER) {
                messages.push(SipMessage::parse(&transmit.payload).unwrap());
            }
        }
        messages
    }

    pub fn deliver(&mut self, message: &SipMessage) {
        let data: Bytes = message.to_bytes();
        self.client.handle_datagram(self.now, addr(SERVER), &data);
    }

    pub fn deliver_raw(&mut self, data: &str) {
        self.client.handle_datagram(self.now, addr(SERVER), data.as_bytes());
    }

    pub fn events(&mut self) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.client.poll_event() {
            events.push(event);
        }
        events
    }

    /// Move the clock forward and fire due timers
    pub fn advance(&mut self, by: Duration) {
        self.now += by;
        self.client.handle_timeout(self.now);
    }

    /// Jump to the next timer deadline
    pub fn advance_to_next_timer(&mut self) {
        let deadline = self.client.poll_timeout().expect("pending timer");
        self.now = deadline;
        self.client.handle_timeout(self.now);
    }
}

/// Server response to `request` adding a To tag
pub fn respond(request: &SipMessage, code: u16, reason: &str) -> SipMessage {
    let mut response = SipMessage::response(code, reason);
    for (name, value) in request.headers() {
        match name {
            "Via" | "From" | "Call-ID" | "CSeq" => response.add_header(name, value),
            "To" if !value.contains("tag=") => response.add_header(name, format!("{};tag=srv1", value)),
            "To" => response.add_header(name, value),
            _ => {}
        }
    }
    response
}

/// 200 OK to an INVITE carrying the remote SDP
pub fn answer(invite: &SipMessage) -> SipMessage {
    let mut response = respond(invite, 200, "OK");
    response.add_header("Contact", "<sip:bob@198.51.100.7:5070>");
    response.set_body("application/sdp", Bytes::from_static(REMOTE_SDP.as_bytes()));
    response
}

/// Incoming INVITE from bob with `sdp` as body
pub fn incoming_invite(call_id: &str, sdp: &str) -> SipMessage {
    let mut invite = SipMessage::request("INVITE", "sip:alice@203.0.113.5:40000");
    invite.add_header("Via", "SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bKinv1");
    invite.add_header("From", "<sip:bob@example.com>;tag=b0b");
    invite.add_header("To", "<sip:alice@example.com>");
    invite.add_header("Call-ID", call_id);
    invite.add_header("CSeq", "1 INVITE");
    invite.add_header("Contact", "<sip:bob@198.51.100.7:5070>");
    invite.set_body("application/sdp", Bytes::from(sdp.to_string()));
    invite
}

/// In-dialog request from bob for an incoming call
pub fn remote_request(method: &str, invite: &SipMessage, seq: u32, branch: &str) -> SipMessage {
    let mut request = SipMessage::request(method, "sip:alice@203.0.113.5:40000");
    request.add_header("Via", format!("SIP/2.0/UDP 192.0.2.1:5060;branch={}", branch));
    request.add_header("From", invite.first_header("From").unwrap());
    request.add_header("To", "<sip:alice@example.com>;tag=ignored");
    request.add_header("Call-ID", invite.call_id().unwrap());
    request.add_header("CSeq", format!("{} {}", seq, method));
    request
}
