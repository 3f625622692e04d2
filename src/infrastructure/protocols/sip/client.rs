//! Registering SIP client
//!
//! The client is a sans-IO state machine. The owner feeds it datagrams,
//! DNS results and the current time, and drains outbound datagrams, lookup
//! requests and events through the `poll_*` methods. One UDP socket carries
//! both SIP and STUN.
//!
//! ## Connecting
//! 1. SRV lookups for `_sip._udp.<domain>` and `_stun._udp.<domain>`
//! 2. Host lookups of the chosen targets
//! 3. STUN binding to learn the reflexive address used in Contact
//! 4. REGISTER, renewed shortly before the granted expiry

use super::builder::{MessageBuilder, UserIdentity};
use super::call::{Call, CallContext};
use super::dialog::DialogContext;
use super::message::{header_uri, parse_parameters, SipMessage, SipMethod};
use super::reactor::{Outbox, TimerKey, TimerOwner, TimerPurpose, TimerWheel};
use super::registry::CallRegistry;
use super::transaction::{FinishedTransaction, SipTimers, TransactionSet};
use crate::domain::{ClientError, ClientEvent, ClientState, SignalingError};
use crate::infrastructure::media::{MediaChannel, NegotiatedChannel};
use crate::infrastructure::protocols::ice::{IceComponent, StaticIceAgent};
use crate::infrastructure::protocols::stun::{BindingOutcome, StunBinding, StunMessage};
use bytes::Bytes;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_SIP_PORT: u16 = 5060;
pub const DEFAULT_STUN_PORT: u16 = 3478;

/// Creates the media channel and ICE component of each new call
pub trait SessionFactory: Send {
    fn create(
        &mut self,
        local_ip: IpAddr,
        reflexive_ip: Option<IpAddr>,
    ) -> (Box<dyn MediaChannel>, Box<dyn IceComponent>);
}

/// Negotiating channels and static candidates on consecutive even RTP ports
#[derive(Debug, Clone)]
pub struct StaticSessionFactory {
    first_port: u16,
    next_port: u16,
}

impl StaticSessionFactory {
    pub fn new(first_port: u16) -> Self {
        let first_port = first_port & !1;
        Self {
            first_port,
            next_port: first_port,
        }
    }
}

impl SessionFactory for StaticSessionFactory {
    fn create(
        &mut self,
        local_ip: IpAddr,
        reflexive_ip: Option<IpAddr>,
    ) -> (Box<dyn MediaChannel>, Box<dyn IceComponent>) {
        let port = self.next_port;
        self.next_port = match self.next_port.checked_add(2) {
            Some(next) if next < u16::MAX => next,
            _ => self.first_port,
        };
        debug!("Allocated RTP port {}", port);
        (
            Box::new(NegotiatedChannel::default()),
            Box::new(StaticIceAgent::new(local_ip, port, reflexive_ip)),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupKind {
    Sip,
    Stun,
}

/// DNS work requested by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupRequest {
    Srv { kind: LookupKind, name: String },
    Host { kind: LookupKind, host: String, port: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub target: String,
    pub port: u16,
}

/// Datagram to send from the signaling socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub destination: SocketAddr,
    pub payload: Bytes,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub identity: UserIdentity,
    pub timers: SipTimers,
    /// Registration lifetime requested in REGISTER
    pub expires: u32,
    /// Renew this long before the granted expiry
    pub register_margin: Duration,
    pub connect_retry: Duration,
    pub stun_retry: Duration,
    pub stun_refresh: Duration,
}

impl ClientConfig {
    pub fn new(identity: UserIdentity) -> Self {
        Self {
            identity,
            timers: SipTimers::default(),
            expires: 3600,
            register_margin: Duration::from_secs(10),
            connect_retry: Duration::from_secs(60),
            stun_retry: Duration::from_millis(500),
            stun_refresh: Duration::from_secs(30),
        }
    }
}

pub struct SipClient {
    config: ClientConfig,
    state: ClientState,
    local_address: SocketAddr,
    builder: MessageBuilder,
    registration: DialogContext,
    register_transactions: TransactionSet,
    /// Contact of the last REGISTER, to find our binding in the answer
    registered_contact: Option<String>,
    sip_server: Option<SocketAddr>,
    stun: StunBinding,
    stun_done: bool,
    calls: CallRegistry,
    factory: Box<dyn SessionFactory>,
    wheel: TimerWheel,
    out: Outbox,
    stun_out: VecDeque<Transmit>,
    lookups: VecDeque<LookupRequest>,
}

impl SipClient {
    pub fn new(config: ClientConfig, local_address: SocketAddr, factory: Box<dyn SessionFactory>) -> Self {
        let builder = MessageBuilder::new(config.identity.clone(), local_address);
        let register_transactions = TransactionSet::new(TimerOwner::Client, config.timers);
        Self {
            config,
            state: ClientState::Disconnected,
            local_address,
            builder,
            registration: DialogContext::new(),
            register_transactions,
            registered_contact: None,
            sip_server: None,
            stun: StunBinding::new(),
            stun_done: false,
            calls: CallRegistry::new(),
            factory,
            wheel: TimerWheel::new(),
            out: Outbox::new(),
            stun_out: VecDeque::new(),
            lookups: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    pub fn reflexive_address(&self) -> Option<SocketAddr> {
        self.stun.reflexive_address()
    }

    pub fn sip_server(&self) -> Option<SocketAddr> {
        self.sip_server
    }

    pub fn find_call(&self, call_id: &str) -> Option<&Call> {
        self.calls.get(call_id)
    }

    pub fn calls(&self) -> impl Iterator<Item = &Call> {
        self.calls.iter()
    }

    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }

    fn client_key(purpose: TimerPurpose) -> TimerKey {
        TimerKey::new(TimerOwner::Client, purpose)
    }

    fn set_state(&mut self, state: ClientState) {
        if self.state == state {
            return;
        }
        if !self.state.can_transition_to(&state) {
            warn!("Ignoring client transition {:?} -> {:?}", self.state, state);
            return;
        }
        info!("Client {:?} -> {:?}", self.state, state);
        self.state = state;
        self.out.emit(ClientEvent::StateChanged { state });
    }

    /// Resolve the servers and register. Also used by the retry timer.
    pub fn connect_to_server(&mut self, now: Instant) {
        if matches!(self.state, ClientState::Connected | ClientState::Disconnecting) {
            debug!("Already connected");
            return;
        }
        let domain = self.config.identity.domain.clone();
        info!("Connecting to {}", domain);
        self.set_state(ClientState::Connecting);

        self.register_transactions.clear(&mut self.wheel);
        self.wheel.cancel(&Self::client_key(TimerPurpose::StunRefresh));
        self.sip_server = None;
        self.stun = StunBinding::new();
        self.stun_done = false;

        self.lookups.push_back(LookupRequest::Srv {
            kind: LookupKind::Sip,
            name: format!("_sip._udp.{}", domain),
        });
        self.lookups.push_back(LookupRequest::Srv {
            kind: LookupKind::Stun,
            name: format!("_stun._udp.{}", domain),
        });
        self.wheel.schedule(
            Self::client_key(TimerPurpose::ConnectRetry),
            now + self.config.connect_retry,
        );
    }

    /// Result of an SRV lookup, best record first. Empty falls back to the
    /// conventional host name and port.
    pub fn handle_srv_lookup(&mut self, kind: LookupKind, records: Vec<SrvRecord>) {
        if self.state != ClientState::Connecting {
            return;
        }
        let request = match records.into_iter().next() {
            Some(record) => LookupRequest::Host {
                kind,
                host: record.target,
                port: record.port,
            },
            None => {
                let (prefix, port) = match kind {
                    LookupKind::Sip => ("sip", DEFAULT_SIP_PORT),
                    LookupKind::Stun => ("stun", DEFAULT_STUN_PORT),
                };
                let host = format!("{}.{}", prefix, self.config.identity.domain);
                debug!("No SRV record for {:?}, trying {}:{}", kind, host, port);
                LookupRequest::Host { kind, host, port }
            }
        };
        self.lookups.push_back(request);
    }

    pub fn handle_host_lookup(&mut self, now: Instant, kind: LookupKind, address: Option<SocketAddr>) {
        if self.state != ClientState::Connecting {
            return;
        }
        match (kind, address) {
            (LookupKind::Sip, Some(server)) => {
                info!("Using SIP server {}", server);
                self.sip_server = Some(server);
                if self.stun_done {
                    self.register_with_server(now);
                }
            }
            (LookupKind::Sip, None) => {
                self.registration_failed(
                    now,
                    SignalingError::TransportUnavailable("SIP server not found".to_string()),
                );
            }
            (LookupKind::Stun, Some(server)) => {
                self.stun.set_server(server);
                self.send_stun(now);
            }
            (LookupKind::Stun, None) => {
                warn!("STUN server not found, registering with the local address");
                self.stun_done = true;
                self.register_with_server(now);
            }
        }
    }

    fn send_stun(&mut self, now: Instant) {
        if let Some((destination, payload)) = self.stun.request() {
            self.stun_out.push_back(Transmit { destination, payload });
            self.wheel.schedule(
                Self::client_key(TimerPurpose::StunRefresh),
                now + self.config.stun_retry,
            );
        }
    }

    fn handle_stun(&mut self, now: Instant, data: &[u8]) {
        if !matches!(self.state, ClientState::Connecting | ClientState::Connected) {
            debug!("Ignoring STUN response while {:?}", self.state);
            return;
        }
        let outcome = self.stun.handle_response(data);
        self.wheel.schedule(
            Self::client_key(TimerPurpose::StunRefresh),
            now + self.config.stun_refresh,
        );

        match outcome {
            BindingOutcome::Changed(address) => {
                self.builder.set_contact_address(address);
                self.registration.clear_challenges();
                self.out.emit(ClientEvent::ReflexiveAddressChanged { address });
                self.stun_done = true;
                if self.state != ClientState::Disconnecting {
                    self.register_with_server(now);
                }
            }
            BindingOutcome::Unchanged(_) => {}
            BindingOutcome::Failed => {
                if !self.stun_done {
                    warn!("STUN binding failed, registering with the local address");
                    self.stun_done = true;
                    self.register_with_server(now);
                }
            }
        }
    }

    fn register_with_server(&mut self, now: Instant) {
        self.send_register(now, self.config.expires);
    }

    fn send_register(&mut self, now: Instant, expires: u32) {
        if self.sip_server.is_none() {
            debug!("SIP server not known yet");
            return;
        }
        if self.state == ClientState::Disconnected {
            self.set_state(ClientState::Connecting);
        }

        let uri = format!("sip:{}", self.config.identity.domain);
        let seq = self.registration.next_cseq();
        let mut request = self.builder.request(SipMethod::Register, &uri, &self.registration, seq);
        let contact = self.builder.contact();
        if expires == 0 {
            request.set_header("Contact", format!("{};expires=0", contact));
        }
        request.add_header("Expires", expires.to_string());
        self.registered_contact = Some(contact);

        info!("Registering with {} for {}s", uri, expires);
        self.register_transactions.clear(&mut self.wheel);
        self.register_transactions
            .start(request, &mut self.out, &mut self.wheel, now);
    }

    /// Lifetime granted for our binding: our Contact's expires parameter,
    /// then the Expires header, then what we asked for.
    fn granted_expiry(&self, response: &SipMessage) -> u32 {
        let ours = self.registered_contact.as_deref().map(header_uri);
        let from_contact = response
            .header_values("Contact")
            .iter()
            .filter(|contact| Some(header_uri(contact)) == ours)
            .find_map(|contact| parse_parameters(contact).get("expires")?.parse().ok());
        from_contact
            .or_else(|| response.first_header("Expires")?.trim().parse().ok())
            .unwrap_or(self.config.expires)
    }

    fn register_finished(&mut self, now: Instant, finished: FinishedTransaction) {
        let Some(response) = finished.response else {
            self.registration_failed(now, SignalingError::TransactionTimeout);
            return;
        };
        let code = response.status_code().unwrap_or_default();

        match code {
            200..=299 => {
                if self.state == ClientState::Disconnecting {
                    info!("Unregistered");
                    self.set_state(ClientState::Disconnected);
                    return;
                }
                let expiry = self.granted_expiry(&response);
                let renew = Duration::from_secs(expiry as u64)
                    .saturating_sub(self.config.register_margin)
                    .max(self.config.timers.t1);
                info!("Registered for {}s, renewing in {:?}", expiry, renew);
                self.wheel.cancel(&Self::client_key(TimerPurpose::ConnectRetry));
                self.wheel.schedule(Self::client_key(TimerPurpose::Register), now + renew);
                self.set_state(ClientState::Connected);
            }
            401 | 407 => {
                if self.registration.handle_authentication(&response) {
                    let retry = self.builder.retry(&finished.request, &mut self.registration);
                    self.register_transactions
                        .start(retry, &mut self.out, &mut self.wheel, now);
                } else {
                    self.registration_failed(now, SignalingError::AuthenticationExhausted);
                }
            }
            _ => {
                let reason = response.reason().unwrap_or_default().to_string();
                self.registration_failed(now, SignalingError::RemoteRejection { code, reason });
            }
        }
    }

    fn registration_failed(&mut self, now: Instant, error: SignalingError) {
        if self.state == ClientState::Disconnecting {
            warn!("Unregistration failed: {}", error);
            self.set_state(ClientState::Disconnected);
            return;
        }
        warn!("Registration failed: {}", error);
        self.out.emit(ClientEvent::RegistrationFailed { error });
        self.wheel.cancel(&Self::client_key(TimerPurpose::Register));
        self.wheel.schedule(
            Self::client_key(TimerPurpose::ConnectRetry),
            now + self.config.connect_retry,
        );
        self.set_state(ClientState::Disconnected);
    }

    /// Hang up every call and unregister
    pub fn disconnect_from_server(&mut self, now: Instant) {
        for id in self.calls.ids() {
            if let Err(e) = self.hangup(now, &id) {
                warn!("Hangup of {} on disconnect: {}", id, e);
            }
        }
        for purpose in [TimerPurpose::Register, TimerPurpose::ConnectRetry, TimerPurpose::StunRefresh] {
            self.wheel.cancel(&Self::client_key(purpose));
        }
        // a binding request still in flight must not match anymore
        self.stun = StunBinding::new();
        self.stun_done = false;
        self.stun_out.clear();

        match self.state {
            ClientState::Connected => {
                info!("Unregistering");
                self.set_state(ClientState::Disconnecting);
                self.send_register(now, 0);
            }
            ClientState::Connecting => {
                self.register_transactions.clear(&mut self.wheel);
                self.set_state(ClientState::Disconnected);
            }
            ClientState::Disconnected | ClientState::Disconnecting => {}
        }
        self.reap();
    }

    /// Normalize a dial string into a SIP URI on our domain when it is
    /// missing the scheme or host.
    fn normalize_recipient(&self, recipient: &str) -> Result<String, ClientError> {
        let recipient = recipient.trim();
        if recipient.is_empty() {
            return Err(ClientError::InvalidRecipient(recipient.to_string()));
        }
        let uri = header_uri(recipient);
        let mut full = if uri.contains(':') {
            uri.to_string()
        } else {
            format!("sip:{}", uri)
        };
        if !full.contains('@') {
            full = format!("{}@{}", full, self.config.identity.domain);
        }
        rsip::Uri::try_from(full.as_str())
            .map_err(|e| ClientError::InvalidRecipient(format!("{}: {}", recipient, e)))?;

        if recipient.contains('<') && uri == full {
            Ok(recipient.to_string())
        } else {
            Ok(full)
        }
    }

    /// Start an outgoing call. The INVITE leaves once the call's ICE
    /// component has reflexive candidates.
    pub fn call(&mut self, now: Instant, recipient: &str) -> Result<String, ClientError> {
        if self.state != ClientState::Connected {
            return Err(ClientError::NotConnected);
        }
        let recipient = self.normalize_recipient(recipient)?;
        let reflexive = self.stun.reflexive_address().map(|a| a.ip());
        let (media, ice) = self.factory.create(self.local_address.ip(), reflexive);
        let mut call = Call::outgoing(&recipient, media, ice, self.config.timers);
        let call_id = call.id().to_string();
        info!("Calling {} ({})", recipient, call_id);

        self.out.emit(ClientEvent::CallStarted {
            call_id: call_id.clone(),
        });
        let mut cx = CallContext {
            builder: &self.builder,
            out: &mut self.out,
            wheel: &mut self.wheel,
            now,
        };
        call.start(&mut cx);
        self.calls.insert(call);
        self.out.emit(ClientEvent::ActiveCallsChanged {
            count: self.calls.len(),
        });
        self.reap();
        Ok(call_id)
    }

    fn with_call<F>(&mut self, now: Instant, call_id: &str, f: F) -> Result<(), ClientError>
    where
        F: FnOnce(&mut Call, &mut CallContext) -> Result<(), ClientError>,
    {
        let call = self
            .calls
            .get_mut(call_id)
            .ok_or_else(|| ClientError::UnknownCall(call_id.to_string()))?;
        let mut cx = CallContext {
            builder: &self.builder,
            out: &mut self.out,
            wheel: &mut self.wheel,
            now,
        };
        let result = f(call, &mut cx);
        self.reap();
        result
    }

    pub fn accept(&mut self, now: Instant, call_id: &str) -> Result<(), ClientError> {
        self.with_call(now, call_id, |call, cx| call.accept(cx))
    }

    pub fn hangup(&mut self, now: Instant, call_id: &str) -> Result<(), ClientError> {
        self.with_call(now, call_id, |call, cx| {
            call.hangup(cx);
            Ok(())
        })
    }

    /// The ICE component of `call_id` gathered new local candidates
    pub fn handle_local_candidates(&mut self, now: Instant, call_id: &str) -> Result<(), ClientError> {
        self.with_call(now, call_id, |call, cx| {
            call.local_candidates_changed(cx);
            Ok(())
        })
    }

    /// Datagram received on the signaling socket
    pub fn handle_datagram(&mut self, now: Instant, from: SocketAddr, data: &[u8]) {
        if self.stun.matches(data) {
            self.handle_stun(now, data);
            return;
        }
        if StunMessage::peek(data).is_some() {
            debug!("Dropping unexpected STUN message from {}", from);
            return;
        }

        let message = match SipMessage::parse(data) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed SIP datagram from {}: {}", from, e);
                return;
            }
        };

        if message.is_request() {
            self.handle_request(now, &message);
        } else {
            self.handle_response(now, &message);
        }
        self.reap();
    }

    fn handle_response(&mut self, now: Instant, response: &SipMessage) {
        if self.register_transactions.matches(response) {
            if let Some(finished) = self
                .register_transactions
                .handle_response(response, &mut self.wheel, now)
            {
                self.register_finished(now, finished);
            }
            return;
        }

        let Some(call_id) = self.calls.route(response) else {
            debug!("Dropping response matching no transaction");
            return;
        };
        if let Err(e) = self.with_call(now, &call_id, |call, cx| {
            call.handle_response(response, cx);
            Ok(())
        }) {
            warn!("Response for {}: {}", call_id, e);
        }
    }

    fn handle_request(&mut self, now: Instant, request: &SipMessage) {
        if let Some(call_id) = self.calls.route(request) {
            if let Err(e) = self.with_call(now, &call_id, |call, cx| {
                call.handle_request(request, cx);
                Ok(())
            }) {
                warn!("Request for {}: {}", call_id, e);
            }
            return;
        }

        let method = request.method().unwrap_or_default();
        let has_to_tag = request
            .first_header("To")
            .map(|to| parse_parameters(to).contains_key("tag"))
            .unwrap_or(false);

        match SipMethod::parse(method) {
            Some(SipMethod::Invite) if !has_to_tag && request.call_id().is_some() => {
                let reflexive = self.stun.reflexive_address().map(|a| a.ip());
                let (media, ice) = self.factory.create(self.local_address.ip(), reflexive);
                let mut call = Call::incoming(request, media, ice, self.config.timers);
                info!("Incoming call {} from {}", call.id(), call.recipient());
                let mut cx = CallContext {
                    builder: &self.builder,
                    out: &mut self.out,
                    wheel: &mut self.wheel,
                    now,
                };
                call.handle_request(request, &mut cx);
                self.calls.insert(call);
                self.out.emit(ClientEvent::ActiveCallsChanged {
                    count: self.calls.len(),
                });
            }
            Some(SipMethod::Ack) => debug!("Dropping ACK outside of a dialog"),
            Some(SipMethod::Options) => {
                let mut response = self.builder.response(request, 200, "OK");
                response.add_header("Allow", super::builder::ALLOWED_METHODS);
                self.out.send(response.to_bytes());
            }
            _ => {
                debug!("No dialog for {} request", method);
                let response = self
                    .builder
                    .response(request, 481, "Call/Transaction Does Not Exist");
                self.out.send(response.to_bytes());
            }
        }
    }

    /// Fire every timer due at `now`
    pub fn handle_timeout(&mut self, now: Instant) {
        while let Some(key) = self.wheel.pop_expired(now) {
            match key.owner {
                TimerOwner::Client => self.handle_client_timer(now, key.purpose),
                TimerOwner::Call(call_id) => {
                    let purpose = key.purpose;
                    if let Err(e) = self.with_call(now, &call_id, |call, cx| {
                        call.handle_timer(&purpose, cx);
                        Ok(())
                    }) {
                        debug!("Timer {:?} of {}: {}", purpose, call_id, e);
                    }
                }
            }
        }
        self.reap();
    }

    fn handle_client_timer(&mut self, now: Instant, purpose: TimerPurpose) {
        match purpose {
            TimerPurpose::Register => {
                if self.state == ClientState::Connected {
                    debug!("Renewing registration");
                    self.register_with_server(now);
                }
            }
            TimerPurpose::ConnectRetry => {
                if self.state == ClientState::Connecting {
                    // nothing came of the last attempt, start over
                    self.register_transactions.clear(&mut self.wheel);
                    self.set_state(ClientState::Disconnected);
                }
                self.connect_to_server(now);
            }
            TimerPurpose::StunRefresh => self.send_stun(now),
            TimerPurpose::Retransmit(_) | TimerPurpose::TransactionTimeout(_) => {
                if let Some(finished) =
                    self.register_transactions
                        .handle_timer(&purpose, &mut self.out, &mut self.wheel, now)
                {
                    self.register_finished(now, finished);
                }
            }
            TimerPurpose::InviteTimeout => {}
        }
    }

    fn reap(&mut self) {
        let finished = self.calls.reap_finished();
        if finished.is_empty() {
            return;
        }
        for call in &finished {
            debug!("Removing finished call {}", call.id());
        }
        self.out.emit(ClientEvent::ActiveCallsChanged {
            count: self.calls.len(),
        });
    }

    /// Earliest instant [`SipClient::handle_timeout`] should be called
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.wheel.next_deadline()
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        if let Some(transmit) = self.stun_out.pop_front() {
            return Some(transmit);
        }
        loop {
            let payload = self.out.pop_sip()?;
            match self.sip_server {
                Some(destination) => return Some(Transmit { destination, payload }),
                None => warn!("Dropping SIP datagram, no server"),
            }
        }
    }

    pub fn poll_lookup(&mut self) -> Option<LookupRequest> {
        self.lookups.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<ClientEvent> {
        self.out.pop_event()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SipClient {
        let identity = UserIdentity {
            username: "alice".to_string(),
            password: "secret".to_string(),
            domain: "example.com".to_string(),
            display_name: None,
        };
        SipClient::new(
            ClientConfig::new(identity),
            "10.0.0.1:5060".parse().unwrap(),
            Box::new(StaticSessionFactory::new(20000)),
        )
    }

    #[test]
    fn test_connect_queues_srv_lookups() {
        let now = Instant::now();
        let mut client = client();
        client.connect_to_server(now);

        assert_eq!(client.state(), ClientState::Connecting);
        assert_eq!(
            client.poll_lookup(),
            Some(LookupRequest::Srv {
                kind: LookupKind::Sip,
                name: "_sip._udp.example.com".to_string()
            })
        );
        assert_eq!(
            client.poll_lookup(),
            Some(LookupRequest::Srv {
                kind: LookupKind::Stun,
                name: "_stun._udp.example.com".to_string()
            })
        );
        assert_eq!(client.poll_timeout(), Some(now + Duration::from_secs(60)));
        assert_eq!(
            client.poll_event(),
            Some(ClientEvent::StateChanged {
                state: ClientState::Connecting
            })
        );
    }

    #[test]
    fn test_srv_fallback_to_conventional_host() {
        let mut client = client();
        client.connect_to_server(Instant::now());
        while client.poll_lookup().is_some() {}

        client.handle_srv_lookup(LookupKind::Stun, Vec::new());
        assert_eq!(
            client.poll_lookup(),
            Some(LookupRequest::Host {
                kind: LookupKind::Stun,
                host: "stun.example.com".to_string(),
                port: DEFAULT_STUN_PORT
            })
        );

        client.handle_srv_lookup(
            LookupKind::Sip,
            vec![SrvRecord {
                target: "proxy.example.com".to_string(),
                port: 5080,
            }],
        );
        assert_eq!(
            client.poll_lookup(),
            Some(LookupRequest::Host {
                kind: LookupKind::Sip,
                host: "proxy.example.com".to_string(),
                port: 5080
            })
        );
    }

    #[test]
    fn test_register_waits_for_stun() {
        let now = Instant::now();
        let mut client = client();
        client.connect_to_server(now);
        client.handle_host_lookup(now, LookupKind::Sip, Some("192.0.2.1:5060".parse().unwrap()));
        assert!(client.poll_transmit().is_none());

        let stun_server: SocketAddr = "192.0.2.2:3478".parse().unwrap();
        client.handle_host_lookup(now, LookupKind::Stun, Some(stun_server));
        let binding = client.poll_transmit().unwrap();
        assert_eq!(binding.destination, stun_server);
        assert!(client.poll_transmit().is_none());

        let header = StunMessage::peek(&binding.payload).unwrap();
        let mapped: SocketAddr = "203.0.113.5:40000".parse().unwrap();
        let response = StunMessage::binding_response(header.transaction_id, mapped).to_bytes();
        client.handle_datagram(now, stun_server, &response);

        assert_eq!(client.reflexive_address(), Some(mapped));
        let register = client.poll_transmit().unwrap();
        assert_eq!(register.destination, "192.0.2.1:5060".parse().unwrap());
        let register = SipMessage::parse(&register.payload).unwrap();
        assert_eq!(register.method(), Some("REGISTER"));
        assert_eq!(register.first_header("Contact"), Some("<sip:alice@203.0.113.5:40000>"));
        assert_eq!(register.first_header("Expires"), Some("3600"));
    }

    #[test]
    fn test_missing_stun_server_registers_with_local_address() {
        let now = Instant::now();
        let mut client = client();
        client.connect_to_server(now);
        client.handle_host_lookup(now, LookupKind::Sip, Some("192.0.2.1:5060".parse().unwrap()));
        client.handle_host_lookup(now, LookupKind::Stun, None);

        let register = SipMessage::parse(&client.poll_transmit().unwrap().payload).unwrap();
        assert_eq!(register.first_header("Contact"), Some("<sip:alice@10.0.0.1:5060>"));
    }

    #[test]
    fn test_call_requires_connection() {
        let mut client = client();
        assert_eq!(
            client.call(Instant::now(), "sip:bob@example.com"),
            Err(ClientError::NotConnected)
        );
    }

    #[test]
    fn test_normalize_recipient() {
        let client = client();
        assert_eq!(client.normalize_recipient("bob").unwrap(), "sip:bob@example.com");
        assert_eq!(
            client.normalize_recipient("sip:bob@other.org").unwrap(),
            "sip:bob@other.org"
        );
        assert_eq!(
            client.normalize_recipient("\"Bob\" <sip:bob@other.org>").unwrap(),
            "\"Bob\" <sip:bob@other.org>"
        );
        assert!(client.normalize_recipient("  ").is_err());
    }

    #[test]
    fn test_request_outside_dialog_gets_481() {
        let now = Instant::now();
        let mut client = client();
        client.connect_to_server(now);
        client.handle_host_lookup(now, LookupKind::Sip, Some("192.0.2.1:5060".parse().unwrap()));

        let bye = "BYE sip:alice@10.0.0.1:5060 SIP/2.0\r\n\
            Via: SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bKx\r\n\
            From: <sip:bob@example.com>;tag=1\r\n\
            To: <sip:alice@example.com>;tag=2\r\n\
            Call-ID: nobody\r\n\
            CSeq: 5 BYE\r\n\
            Content-Length: 0\r\n\r\n";
        client.handle_datagram(now, "192.0.2.1:5060".parse().unwrap(), bye.as_bytes());

        let response = SipMessage::parse(&client.poll_transmit().unwrap().payload).unwrap();
        assert_eq!(response.status_code(), Some(481));
        assert_eq!(response.call_id(), Some("nobody"));
    }

    #[test]
    fn test_session_factory_allocates_even_ports() {
        let mut factory = StaticSessionFactory::new(20001);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let (_, first) = factory.create(ip, None);
        let (_, second) = factory.create(ip, None);
        assert_eq!(first.local_candidates()[0].address.port(), 20000);
        assert_eq!(second.local_candidates()[0].address.port(), 20002);
    }
}
