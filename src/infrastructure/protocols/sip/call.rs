//! INVITE dialogs
//!
//! A call negotiates one audio stream through SDP offer/answer. Outgoing
//! calls hold their INVITE back until the ICE component has a server
//! reflexive candidate for both RTP and RTCP, so the offer always carries a
//! reachable address. The INVITE itself is sent once and guarded by a
//! call-level timeout; BYE and CANCEL run as client transactions.

use super::builder::MessageBuilder;
use super::dialog::{generate_tag, DialogContext};
use super::message::{header_uri, parse_parameters, SipMessage, SipMethod};
use super::reactor::{Outbox, TimerKey, TimerOwner, TimerPurpose, TimerWheel};
use super::sdp::{LocalDescription, SdpMessage, SdpSession};
use super::transaction::{FinishedTransaction, SipTimers, TransactionSet};
use crate::domain::{CallDirection, CallState, ClientError, ClientEvent, SignalingError};
use crate::infrastructure::media::MediaChannel;
use crate::infrastructure::protocols::ice::{
    CandidateType, IceCandidate, IceComponent, RTCP_COMPONENT, RTP_COMPONENT,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, info, warn};

const SDP_CONTENT_TYPE: &str = "application/sdp";

/// Everything a call needs from its owner while handling one input
pub struct CallContext<'a> {
    pub builder: &'a MessageBuilder,
    pub out: &'a mut Outbox,
    pub wheel: &'a mut TimerWheel,
    pub now: Instant,
}

pub struct Call {
    direction: CallDirection,
    state: CallState,
    error: Option<SignalingError>,
    dialog: DialogContext,
    transactions: TransactionSet,
    timers: SipTimers,
    media: Box<dyn MediaChannel>,
    ice: Box<dyn IceComponent>,
    /// Remote name-addr used in To (with the remote tag once known)
    remote_recipient: String,
    /// Request-URI for requests inside the dialog
    remote_uri: String,
    remote_route: Vec<String>,
    /// Outgoing: last INVITE sent. Incoming: the INVITE that created the call.
    invite: Option<SipMessage>,
    invite_pending: bool,
    invite_queued: bool,
    answered: bool,
    local_rtp: Option<SocketAddr>,
    remote_rtp: Option<SocketAddr>,
    active_time: String,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl Call {
    /// Outgoing call to `recipient` (name-addr or URI). The INVITE is queued
    /// until [`Call::local_candidates_changed`] finds usable candidates.
    pub fn outgoing(
        recipient: &str,
        media: Box<dyn MediaChannel>,
        ice: Box<dyn IceComponent>,
        timers: SipTimers,
    ) -> Self {
        let remote_recipient = if recipient.contains('<') {
            recipient.to_string()
        } else {
            format!("<{}>", recipient)
        };
        let remote_uri = header_uri(&remote_recipient).to_string();
        Self::new(
            CallDirection::Outgoing,
            DialogContext::new(),
            remote_recipient,
            remote_uri,
            media,
            ice,
            timers,
        )
    }

    /// Incoming call for an INVITE that matched no dialog. Call
    /// [`Call::handle_request`] with the same INVITE next.
    pub fn incoming(
        invite: &SipMessage,
        media: Box<dyn MediaChannel>,
        ice: Box<dyn IceComponent>,
        timers: SipTimers,
    ) -> Self {
        let call_id = invite.call_id().unwrap_or_default().to_string();
        let tag = invite
            .first_header("To")
            .and_then(|to| parse_parameters(to).remove("tag"))
            .filter(|tag| !tag.is_empty())
            .unwrap_or_else(generate_tag);
        let from = invite.first_header("From").unwrap_or_default().to_string();
        let remote_uri = invite
            .first_header("Contact")
            .map(header_uri)
            .unwrap_or_else(|| header_uri(&from))
            .to_string();

        let mut call = Self::new(
            CallDirection::Incoming,
            DialogContext::with_ids(call_id, tag),
            from,
            remote_uri,
            media,
            ice,
            timers,
        );
        call.invite_queued = false;
        call.remote_route = invite.header_values("Record-Route");
        call
    }

    fn new(
        direction: CallDirection,
        dialog: DialogContext,
        remote_recipient: String,
        remote_uri: String,
        media: Box<dyn MediaChannel>,
        ice: Box<dyn IceComponent>,
        timers: SipTimers,
    ) -> Self {
        Self {
            direction,
            state: CallState::Connecting,
            error: None,
            transactions: TransactionSet::new(TimerOwner::Call(dialog.call_id().to_string()), timers),
            dialog,
            timers,
            media,
            ice,
            remote_recipient,
            remote_uri,
            remote_route: Vec::new(),
            invite: None,
            invite_pending: false,
            invite_queued: true,
            answered: false,
            local_rtp: None,
            remote_rtp: None,
            active_time: "0 0".to_string(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn id(&self) -> &str {
        self.dialog.call_id()
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn error(&self) -> Option<&SignalingError> {
        self.error.as_ref()
    }

    /// Remote party as it appears in To/From
    pub fn recipient(&self) -> &str {
        &self.remote_recipient
    }

    pub fn local_rtp_address(&self) -> Option<SocketAddr> {
        self.local_rtp
    }

    pub fn remote_rtp_address(&self) -> Option<SocketAddr> {
        self.remote_rtp
    }

    /// Seconds between becoming Active and Finished (or now)
    pub fn duration(&self) -> i64 {
        match self.started_at {
            Some(start) => (self.finished_at.unwrap_or_else(Utc::now) - start).num_seconds(),
            None => 0,
        }
    }

    /// Whether one of this call's transactions sent the request `response` answers
    pub fn owns_response(&self, response: &SipMessage) -> bool {
        self.transactions.matches(response)
    }

    fn timer_key(&self, purpose: TimerPurpose) -> TimerKey {
        TimerKey::new(TimerOwner::Call(self.id().to_string()), purpose)
    }

    fn set_state(&mut self, state: CallState, cx: &mut CallContext) {
        if self.state == state {
            return;
        }
        if !self.state.can_transition_to(&state) {
            warn!("Call {}: ignoring transition {:?} -> {:?}", self.id(), self.state, state);
            return;
        }
        info!("Call {} {:?} -> {:?}", self.id(), self.state, state);
        self.state = state;

        match state {
            CallState::Active => self.started_at = Some(Utc::now()),
            CallState::Finished => {
                self.finished_at = Some(Utc::now());
                self.transactions.clear(cx.wheel);
                cx.wheel.cancel_owner(&TimerOwner::Call(self.id().to_string()));
                self.media.close();
                self.ice.close();
            }
            _ => {}
        }

        cx.out.emit(ClientEvent::CallStateChanged {
            call_id: self.id().to_string(),
            state,
        });
        if state == CallState::Finished {
            cx.out.emit(ClientEvent::CallFinished {
                call_id: self.id().to_string(),
                error: self.error.clone(),
                duration_secs: self.duration(),
            });
        }
    }

    fn fail(&mut self, error: SignalingError, cx: &mut CallContext) {
        warn!("Call {} failed: {}", self.id(), error);
        if self.error.is_none() {
            self.error = Some(error);
        }
        self.set_state(CallState::Finished, cx);
    }

    /// Request inside this dialog addressed to the remote party
    fn dialog_request(&self, method: SipMethod, seq: u32, cx: &CallContext) -> SipMessage {
        let mut request = cx.builder.request(method, &self.remote_uri, &self.dialog, seq);
        request.set_header("To", self.remote_recipient.clone());
        for route in &self.remote_route {
            request.add_header("Route", route.clone());
        }
        request
    }

    fn local_description(&self, cx: &CallContext) -> LocalDescription {
        let candidates = self.ice.local_candidates();
        let rtp_candidate = |candidate_type: CandidateType| {
            candidates
                .iter()
                .find(|c| c.is_rtp() && c.candidate_type == candidate_type)
                .map(|c| c.address)
        };
        let rtp_address = self
            .local_rtp
            .or_else(|| rtp_candidate(CandidateType::ServerReflexive))
            .or_else(|| rtp_candidate(CandidateType::Host))
            .unwrap_or_else(|| SocketAddr::new(cx.builder.contact_address().ip(), 0));
        LocalDescription {
            origin: cx.builder.contact_address().ip(),
            rtp_address,
            active_time: self.active_time.clone(),
            ice_user: self.ice.local_user(),
            ice_password: self.ice.local_password(),
            payload_types: self.media.local_payload_types(),
            candidates,
        }
    }

    fn sdp_body(&self, cx: &CallContext) -> Bytes {
        self.local_description(cx).to_message().to_bytes()
    }

    /// Apply a remote description to the ICE component and media channel.
    fn handle_sdp(&mut self, body: &[u8]) -> Result<(), String> {
        let session = SdpSession::from_message(&SdpMessage::parse(body));

        if let Some(user) = &session.ice_user {
            self.ice.set_remote_user(user);
        }
        if let Some(password) = &session.ice_password {
            self.ice.set_remote_password(password);
        }
        for candidate in &session.candidates {
            self.ice.add_remote_candidate(candidate.clone());
        }
        if self.direction == CallDirection::Incoming {
            if let Some(time) = &session.active_time {
                self.active_time = time.clone();
            }
        }

        let (Some(rtp), Some(rtcp)) = (session.rtp_address(), session.rtcp_address()) else {
            return Err("no audio stream or connection address".to_string());
        };
        self.remote_rtp = Some(rtp);
        self.ice
            .add_remote_candidate(IceCandidate::new(CandidateType::Host, rtp, RTP_COMPONENT));
        self.ice
            .add_remote_candidate(IceCandidate::new(CandidateType::Host, rtcp, RTCP_COMPONENT));

        if session.payload_types.is_empty() {
            return Err("no payload types".to_string());
        }
        self.media.set_remote_payload_types(&session.payload_types);
        if !self.media.is_open() {
            return Err("no common payload type".to_string());
        }
        Ok(())
    }

    /// Arm the call deadline and send the INVITE if candidates are ready.
    /// A call still waiting for candidates after 64*T1 times out.
    pub fn start(&mut self, cx: &mut CallContext) {
        let key = self.timer_key(TimerPurpose::InviteTimeout);
        cx.wheel.schedule(key, cx.now + self.timers.timeout());
        self.local_candidates_changed(cx);
    }

    /// Called when the ICE component reports new local candidates
    pub fn local_candidates_changed(&mut self, cx: &mut CallContext) {
        if !self.invite_queued || self.state != CallState::Connecting {
            return;
        }
        let candidates = self.ice.local_candidates();
        let reflexive = |component: u16| {
            candidates
                .iter()
                .find(|c| c.component == component && c.candidate_type == CandidateType::ServerReflexive)
                .map(|c| c.address)
        };
        let (Some(rtp), Some(_)) = (reflexive(RTP_COMPONENT), reflexive(RTCP_COMPONENT)) else {
            debug!("Call {}: waiting for reflexive candidates", self.id());
            return;
        };

        self.local_rtp = Some(rtp);
        self.invite_queued = false;
        self.send_invite(cx);
    }

    fn send_invite(&mut self, cx: &mut CallContext) {
        let seq = self.dialog.next_cseq();
        let mut invite = self.dialog_request(SipMethod::Invite, seq, cx);
        invite.set_body(SDP_CONTENT_TYPE, self.sdp_body(cx));
        info!("Call {}: sending INVITE to {}", self.id(), self.remote_uri);
        self.transmit_invite(invite, cx);
    }

    fn transmit_invite(&mut self, invite: SipMessage, cx: &mut CallContext) {
        cx.out.send(invite.to_bytes());
        self.invite = Some(invite);
        self.invite_pending = true;
        let key = self.timer_key(TimerPurpose::InviteTimeout);
        cx.wheel.schedule(key, cx.now + self.timers.timeout());
    }

    /// Answer an incoming call with our SDP
    pub fn accept(&mut self, cx: &mut CallContext) -> Result<(), ClientError> {
        if self.direction != CallDirection::Incoming || self.state != CallState::Connecting || self.answered {
            return Err(ClientError::InvalidState(format!(
                "call {} cannot be accepted",
                self.id()
            )));
        }
        let Some(invite) = &self.invite else {
            return Err(ClientError::InvalidState(format!("call {} has no INVITE", self.id())));
        };

        let mut response = cx.builder.response(invite, 200, "OK");
        response.add_header("Allow", super::builder::ALLOWED_METHODS);
        response.add_header("Supported", "replaces");
        response.set_body(SDP_CONTENT_TYPE, self.sdp_body(cx));
        cx.out.send(response.to_bytes());
        self.answered = true;
        info!("Call {}: accepted", self.id());
        cx.out.emit(ClientEvent::CallStarted {
            call_id: self.id().to_string(),
        });

        let key = self.timer_key(TimerPurpose::InviteTimeout);
        cx.wheel.schedule(key, cx.now + self.timers.timeout());
        Ok(())
    }

    /// End the call from any non-terminal state without waiting for the peer
    pub fn hangup(&mut self, cx: &mut CallContext) {
        if matches!(self.state, CallState::Disconnecting | CallState::Finished) {
            return;
        }
        info!("Call {}: hanging up", self.id());

        if self.invite_queued {
            self.set_state(CallState::Finished, cx);
        } else if self.direction == CallDirection::Outgoing && self.invite_pending {
            let Some(invite) = &self.invite else {
                self.set_state(CallState::Finished, cx);
                return;
            };
            let seq = invite.cseq_number().unwrap_or_default();
            let mut cancel = cx.builder.request(SipMethod::Cancel, invite.uri().unwrap_or_default(), &self.dialog, seq);
            cancel.set_header("Via", invite.first_header("Via").unwrap_or_default());
            cancel.set_header("To", invite.first_header("To").unwrap_or_default());
            for route in invite.header_values("Route") {
                cancel.add_header("Route", route);
            }
            cancel.remove_header("Contact");
            self.transactions.start(cancel, cx.out, cx.wheel, cx.now);
            self.set_state(CallState::Disconnecting, cx);
        } else if self.direction == CallDirection::Incoming && !self.answered {
            if let Some(invite) = &self.invite {
                let response = cx.builder.response(invite, 603, "Decline");
                cx.out.send(response.to_bytes());
            }
            self.set_state(CallState::Finished, cx);
        } else {
            self.send_bye(cx);
            self.set_state(CallState::Disconnecting, cx);
        }
    }

    fn send_bye(&mut self, cx: &mut CallContext) {
        let seq = self.dialog.next_cseq();
        let bye = self.dialog_request(SipMethod::Bye, seq, cx);
        self.transactions.start(bye, cx.out, cx.wheel, cx.now);
    }

    fn send_ack(&self, response: &SipMessage, cx: &mut CallContext) {
        let Some(invite) = &self.invite else {
            return;
        };
        let seq = invite.cseq_number().unwrap_or_default();
        let mut ack = cx.builder.request(SipMethod::Ack, &self.remote_uri, &self.dialog, seq);
        ack.set_header("Via", invite.first_header("Via").unwrap_or_default());
        ack.set_header(
            "To",
            response.first_header("To").unwrap_or(&self.remote_recipient).to_string(),
        );
        ack.remove_header("Contact");
        for route in &self.remote_route {
            ack.add_header("Route", route.clone());
        }
        cx.out.send(ack.to_bytes());
    }

    /// Route a response: owned transactions first, then the INVITE itself
    pub fn handle_response(&mut self, response: &SipMessage, cx: &mut CallContext) {
        if self.transactions.matches(response) {
            if let Some(finished) = self.transactions.handle_response(response, cx.wheel, cx.now) {
                self.transaction_finished(finished, cx);
            }
            return;
        }
        if response.cseq_method() == Some(SipMethod::Invite.as_str()) {
            self.handle_invite_response(response, cx);
        } else {
            debug!("Call {}: ignoring unmatched response", self.id());
        }
    }

    fn update_remote_target(&mut self, response: &SipMessage) {
        if let Some(to) = response.first_header("To") {
            self.remote_recipient = to.to_string();
        }
        if let Some(contact) = response.first_header("Contact") {
            self.remote_uri = header_uri(contact).to_string();
        }
        let mut route = response.header_values("Record-Route");
        if !route.is_empty() {
            route.reverse();
            self.remote_route = route;
        }
    }

    fn handle_invite_response(&mut self, response: &SipMessage, cx: &mut CallContext) {
        let Some(code) = response.status_code() else {
            return;
        };
        let current_seq = self.invite.as_ref().and_then(|i| i.cseq_number());
        if self.direction != CallDirection::Outgoing || response.cseq_number() != current_seq {
            debug!("Call {}: ignoring stale INVITE response {}", self.id(), code);
            return;
        }

        if (101..300).contains(&code) {
            self.update_remote_target(response);
        }
        if code < 200 {
            if code == 180 {
                cx.out.emit(ClientEvent::CallRinging {
                    call_id: self.id().to_string(),
                });
            }
            return;
        }
        if !self.invite_pending {
            // retransmitted final response, our ACK was lost
            self.send_ack(response, cx);
            return;
        }

        self.invite_pending = false;
        let key = self.timer_key(TimerPurpose::InviteTimeout);
        cx.wheel.cancel(&key);
        self.send_ack(response, cx);

        if self.state == CallState::Disconnecting {
            if code < 300 {
                self.send_bye(cx);
            } else {
                self.set_state(CallState::Finished, cx);
            }
            return;
        }

        match code {
            200..=299 => {
                let is_sdp = response
                    .content_type()
                    .map(|ct| ct.eq_ignore_ascii_case(SDP_CONTENT_TYPE))
                    .unwrap_or(false);
                let result = if is_sdp {
                    self.handle_sdp(response.body())
                } else {
                    Err("answer carries no SDP".to_string())
                };
                match result {
                    Ok(()) => self.set_state(CallState::Active, cx),
                    Err(reason) => {
                        warn!("Call {}: {}", self.id(), reason);
                        self.error = Some(SignalingError::SdpNegotiationFailure(reason));
                        self.hangup(cx);
                    }
                }
            }
            401 | 407 => {
                if self.dialog.handle_authentication(response) {
                    if let Some(previous) = self.invite.take() {
                        let retry = cx.builder.retry(&previous, &mut self.dialog);
                        info!("Call {}: retrying INVITE with credentials", self.id());
                        self.transmit_invite(retry, cx);
                    }
                } else {
                    self.fail(SignalingError::AuthenticationExhausted, cx);
                }
            }
            _ => {
                let reason = response.reason().unwrap_or_default().to_string();
                self.fail(SignalingError::RemoteRejection { code, reason }, cx);
            }
        }
    }

    fn transaction_finished(&mut self, finished: FinishedTransaction, cx: &mut CallContext) {
        let method = finished.request.method().unwrap_or_default().to_string();
        let Some(response) = finished.response else {
            if self.error.is_none() {
                self.error = Some(SignalingError::TransactionTimeout);
            }
            self.set_state(CallState::Finished, cx);
            return;
        };

        let code = response.status_code().unwrap_or_default();
        if code == 401 || code == 407 {
            if self.dialog.handle_authentication(&response) {
                let retry = cx.builder.retry(&finished.request, &mut self.dialog);
                self.transactions.start(retry, cx.out, cx.wheel, cx.now);
                return;
            }
            if self.error.is_none() {
                self.error = Some(SignalingError::AuthenticationExhausted);
            }
            self.set_state(CallState::Finished, cx);
            return;
        }

        match method.as_str() {
            "BYE" => self.set_state(CallState::Finished, cx),
            // success: the INVITE will be answered with 487
            "CANCEL" if code < 300 && self.invite_pending => {}
            "CANCEL" => self.set_state(CallState::Finished, cx),
            _ => {}
        }
    }

    pub fn handle_request(&mut self, request: &SipMessage, cx: &mut CallContext) {
        let method = request.method().unwrap_or_default();
        match SipMethod::parse(method) {
            Some(SipMethod::Invite) => self.handle_invite(request, cx),
            Some(SipMethod::Ack) => {
                if self.direction != CallDirection::Incoming || !self.answered || self.state != CallState::Connecting {
                    return;
                }
                let key = self.timer_key(TimerPurpose::InviteTimeout);
                cx.wheel.cancel(&key);
                if self.media.is_open() {
                    self.set_state(CallState::Active, cx);
                } else {
                    self.fail(SignalingError::SdpNegotiationFailure("media channel not open".to_string()), cx);
                }
            }
            Some(SipMethod::Bye) => {
                cx.out.send(cx.builder.response(request, 200, "OK").to_bytes());
                self.set_state(CallState::Finished, cx);
            }
            Some(SipMethod::Cancel) => {
                cx.out.send(cx.builder.response(request, 200, "OK").to_bytes());
                if self.direction == CallDirection::Incoming && !self.answered {
                    if let Some(invite) = &self.invite {
                        let terminated = cx.builder.response(invite, 487, "Request Terminated");
                        cx.out.send(terminated.to_bytes());
                    }
                }
                self.set_state(CallState::Finished, cx);
            }
            Some(SipMethod::Options) => {
                let mut response = cx.builder.response(request, 200, "OK");
                response.add_header("Allow", super::builder::ALLOWED_METHODS);
                cx.out.send(response.to_bytes());
            }
            _ => {
                debug!("Call {}: rejecting {}", self.id(), method);
                let mut response = cx.builder.response(request, 405, "Method Not Allowed");
                response.add_header("Allow", super::builder::ALLOWED_METHODS);
                cx.out.send(response.to_bytes());
            }
        }
    }

    fn handle_invite(&mut self, request: &SipMessage, cx: &mut CallContext) {
        if let Some(invite) = &self.invite {
            let retransmission = self.direction == CallDirection::Incoming
                && invite.via_branch().is_some()
                && invite.via_branch() == request.via_branch();
            if retransmission && !self.answered && self.state == CallState::Connecting {
                cx.out.send(cx.builder.response(invite, 180, "Ringing").to_bytes());
            } else if !retransmission {
                debug!("Call {}: rejecting re-INVITE", self.id());
                cx.out.send(cx.builder.response(request, 488, "Not Acceptable Here").to_bytes());
            }
            return;
        }
        if self.direction != CallDirection::Incoming {
            return;
        }

        // our tag goes into every response for this INVITE
        let mut invite = request.clone();
        let to = invite.first_header("To").unwrap_or_default().to_string();
        if !parse_parameters(&to).contains_key("tag") {
            invite.set_header("To", format!("{};tag={}", to, self.dialog.tag()));
        }
        self.invite = Some(invite);

        let is_sdp = request
            .content_type()
            .map(|ct| ct.eq_ignore_ascii_case(SDP_CONTENT_TYPE))
            .unwrap_or(false);
        let result = if is_sdp {
            self.handle_sdp(request.body())
        } else {
            Err("offer carries no SDP".to_string())
        };

        let Some(invite) = &self.invite else {
            return;
        };
        match result {
            Ok(()) => {
                cx.out.send(cx.builder.response(invite, 180, "Ringing").to_bytes());
                cx.out.emit(ClientEvent::CallReceived {
                    call_id: self.id().to_string(),
                    from: self.remote_recipient.clone(),
                });
            }
            Err(reason) => {
                cx.out.send(cx.builder.response(invite, 400, "Bad Request").to_bytes());
                self.fail(SignalingError::SdpNegotiationFailure(reason), cx);
            }
        }
    }

    /// Timer of this call fired
    pub fn handle_timer(&mut self, purpose: &TimerPurpose, cx: &mut CallContext) {
        match purpose {
            TimerPurpose::InviteTimeout => {
                if self.invite_pending {
                    self.invite_pending = false;
                    self.fail(SignalingError::TransactionTimeout, cx);
                } else if self.invite_queued && self.state == CallState::Connecting {
                    warn!("Call {}: no reflexive candidates gathered", self.id());
                    self.invite_queued = false;
                    self.fail(SignalingError::TransactionTimeout, cx);
                } else if self.answered && self.state == CallState::Connecting {
                    warn!("Call {}: no ACK received", self.id());
                    self.fail(SignalingError::TransactionTimeout, cx);
                }
            }
            TimerPurpose::Retransmit(_) | TimerPurpose::TransactionTimeout(_) => {
                if let Some(finished) = self.transactions.handle_timer(purpose, cx.out, cx.wheel, cx.now) {
                    self.transaction_finished(finished, cx);
                }
            }
            _ => {}
        }
    }
}
