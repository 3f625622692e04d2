//! Call flows against a scripted server

mod common;

use common::*;
use std::time::Duration;
use yakphone::infrastructure::protocols::sip::{SdpMessage, SdpSession, SipMessage};
use yakphone::{CallState, ClientEvent, SignalingError};

fn find_method<'a>(messages: &'a [SipMessage], method: &str) -> &'a SipMessage {
    messages
        .iter()
        .find(|m| m.method() == Some(method))
        .unwrap_or_else(|| panic!("no {} in {:?}", method, messages))
}

fn finished_event(events: &[ClientEvent]) -> Option<&ClientEvent> {
    events
        .iter()
        .find(|e| matches!(e, ClientEvent::CallFinished { .. }))
}

#[test]
fn test_outgoing_call_success_and_hangup() {
    let mut h = Harness::connected();
    let call_id = h.client.call(h.now, "sip:bob@example.com").unwrap();

    let sent = h.sent();
    let invite = find_method(&sent, "INVITE");
    assert_eq!(invite.uri(), Some("sip:bob@example.com"));
    assert_eq!(invite.call_id(), Some(call_id.as_str()));
    assert_eq!(invite.content_type(), Some("application/sdp"));
    let offer = SdpSession::from_message(&SdpMessage::parse(invite.body()));
    assert_eq!(offer.rtp_address(), Some(addr("203.0.113.5:20000")));
    assert!(offer.payload_types.iter().any(|pt| pt.name == "PCMU"));
    assert_eq!(offer.candidates.len(), 4);

    let events = h.events();
    assert!(events.contains(&ClientEvent::CallStarted { call_id: call_id.clone() }));
    assert!(events.contains(&ClientEvent::ActiveCallsChanged { count: 1 }));

    h.deliver(&respond(invite, 100, "Trying"));
    h.deliver(&respond(invite, 180, "Ringing"));
    assert!(h.events().contains(&ClientEvent::CallRinging { call_id: call_id.clone() }));

    h.deliver(&answer(invite));
    let sent = h.sent();
    let ack = find_method(&sent, "ACK");
    assert_eq!(ack.uri(), Some("sip:bob@198.51.100.7:5070"));
    assert_eq!(ack.cseq_number(), invite.cseq_number());
    assert_eq!(ack.first_header("CSeq"), Some(format!("{} ACK", invite.cseq_number().unwrap()).as_str()));
    assert_eq!(ack.via_branch(), invite.via_branch());
    assert!(ack.first_header("To").unwrap().contains("tag=srv1"));

    let call = h.client.find_call(&call_id).unwrap();
    assert_eq!(call.state(), CallState::Active);
    assert_eq!(call.remote_rtp_address(), Some(addr("198.51.100.7:30000")));

    h.client.hangup(h.now, &call_id).unwrap();
    let sent = h.sent();
    let bye = find_method(&sent, "BYE");
    assert!(bye.cseq_number().unwrap() > invite.cseq_number().unwrap());
    assert_ne!(bye.via_branch(), invite.via_branch());
    assert_eq!(h.client.find_call(&call_id).unwrap().state(), CallState::Disconnecting);

    h.deliver(&respond(bye, 200, "OK"));
    let events = h.events();
    match finished_event(&events) {
        Some(ClientEvent::CallFinished { error, .. }) => assert_eq!(error, &None),
        other => panic!("unexpected {:?}", other),
    }
    assert!(events.contains(&ClientEvent::ActiveCallsChanged { count: 0 }));
    assert!(h.client.find_call(&call_id).is_none());
}

#[test]
fn test_outgoing_call_rejected() {
    let mut h = Harness::connected();
    let call_id = h.client.call(h.now, "sip:bob@example.com").unwrap();
    let sent = h.sent();
    let invite = find_method(&sent, "INVITE");
    h.events();

    h.deliver(&respond(invite, 486, "Busy Here"));
    let sent = h.sent();
    assert_eq!(find_method(&sent, "ACK").cseq_number(), invite.cseq_number());

    let events = h.events();
    assert!(events.contains(&ClientEvent::CallStateChanged {
        call_id: call_id.clone(),
        state: CallState::Finished
    }));
    match finished_event(&events) {
        Some(ClientEvent::CallFinished { error, duration_secs, .. }) => {
            assert_eq!(
                error,
                &Some(SignalingError::RemoteRejection {
                    code: 486,
                    reason: "Busy Here".to_string()
                })
            );
            assert_eq!(*duration_secs, 0);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_invite_waits_for_reflexive_candidates() {
    let factory = FakeFactory::default();
    let sessions = factory.sessions.clone();
    let mut h = Harness::connected_with(Box::new(factory));

    let call_id = h.client.call(h.now, "bob").unwrap();
    assert!(h.sent().is_empty());
    assert_eq!(h.client.find_call(&call_id).unwrap().state(), CallState::Connecting);

    let candidates = sessions.lock().unwrap()[0].clone();
    candidates.add_reflexive(addr("203.0.113.5:41000"));
    h.client.handle_local_candidates(h.now, &call_id).unwrap();

    let sent = h.sent();
    let invite = find_method(&sent, "INVITE");
    assert_eq!(invite.uri(), Some("sip:bob@example.com"));
    let offer = SdpSession::from_message(&SdpMessage::parse(invite.body()));
    assert_eq!(offer.rtp_address(), Some(addr("203.0.113.5:41000")));
    assert_eq!(h.client.find_call(&call_id).unwrap().local_rtp_address(), Some(addr("203.0.113.5:41000")));
}

#[test]
fn test_hangup_before_invite_sent_finishes_immediately() {
    let mut h = Harness::connected_with(Box::new(FakeFactory::default()));
    let call_id = h.client.call(h.now, "sip:bob@example.com").unwrap();
    h.client.hangup(h.now, &call_id).unwrap();

    assert!(h.sent().is_empty());
    assert!(finished_event(&h.events()).is_some());
    assert_eq!(h.client.active_calls(), 0);
}

#[test]
fn test_call_without_reflexive_candidates_times_out() {
    let mut h = Harness::connected_with(Box::new(FakeFactory::default()));
    let call_id = h.client.call(h.now, "sip:bob@example.com").unwrap();
    h.events();

    h.advance(Duration::from_secs(31));
    assert_eq!(h.client.find_call(&call_id).unwrap().state(), CallState::Connecting);

    h.advance(Duration::from_secs(1));
    assert!(h.sent().iter().all(|m| m.method() != Some("INVITE")));
    let events = h.events();
    match finished_event(&events) {
        Some(ClientEvent::CallFinished { error, .. }) => {
            assert_eq!(error, &Some(SignalingError::TransactionTimeout))
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(h.client.find_call(&call_id).is_none());
    assert_eq!(h.client.active_calls(), 0);
}

#[test]
fn test_invite_timeout() {
    let mut h = Harness::connected();
    let call_id = h.client.call(h.now, "sip:bob@example.com").unwrap();
    h.sent();
    h.events();

    h.advance(Duration::from_secs(31));
    // the INVITE is sent once, not retransmitted
    assert!(h.sent().iter().all(|m| m.method() != Some("INVITE")));
    assert!(h.client.find_call(&call_id).is_some());

    h.advance(Duration::from_secs(1));
    let events = h.events();
    match finished_event(&events) {
        Some(ClientEvent::CallFinished { error, .. }) => {
            assert_eq!(error, &Some(SignalingError::TransactionTimeout))
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_cancel_pending_invite() {
    let mut h = Harness::connected();
    let call_id = h.client.call(h.now, "sip:bob@example.com").unwrap();
    let sent = h.sent();
    let invite = find_method(&sent, "INVITE").clone();
    h.deliver(&respond(&invite, 180, "Ringing"));

    h.client.hangup(h.now, &call_id).unwrap();
    let sent = h.sent();
    let cancel = find_method(&sent, "CANCEL");
    assert_eq!(cancel.via_branch(), invite.via_branch());
    assert_eq!(cancel.cseq_number(), invite.cseq_number());
    assert_eq!(cancel.uri(), invite.uri());
    assert_eq!(h.client.find_call(&call_id).unwrap().state(), CallState::Disconnecting);

    h.deliver(&respond(cancel, 200, "OK"));
    assert!(h.client.find_call(&call_id).is_some());

    h.deliver(&respond(&invite, 487, "Request Terminated"));
    let sent = h.sent();
    find_method(&sent, "ACK");
    assert!(h.client.find_call(&call_id).is_none());
}

#[test]
fn test_answer_after_cancel_is_acked_and_hung_up() {
    let mut h = Harness::connected();
    let call_id = h.client.call(h.now, "sip:bob@example.com").unwrap();
    let sent = h.sent();
    let invite = find_method(&sent, "INVITE").clone();

    h.client.hangup(h.now, &call_id).unwrap();
    h.sent();
    h.deliver(&answer(&invite));

    let sent = h.sent();
    find_method(&sent, "ACK");
    let bye = find_method(&sent, "BYE");
    h.deliver(&respond(bye, 200, "OK"));
    assert!(h.client.find_call(&call_id).is_none());
}

#[test]
fn test_invite_challenge_is_answered() {
    let mut h = Harness::connected();
    h.client.call(h.now, "sip:bob@example.com").unwrap();
    let sent = h.sent();
    let invite = find_method(&sent, "INVITE").clone();

    let mut challenge = respond(&invite, 407, "Proxy Authentication Required");
    challenge.add_header(
        "Proxy-Authenticate",
        r#"Digest realm="example.com", nonce="n1", qop="auth""#,
    );
    h.deliver(&challenge);

    let sent = h.sent();
    find_method(&sent, "ACK");
    let retry = find_method(&sent, "INVITE");
    assert_eq!(retry.call_id(), invite.call_id());
    assert_eq!(retry.cseq_number(), Some(invite.cseq_number().unwrap() + 1));
    assert_ne!(retry.via_branch(), invite.via_branch());
    let auth = retry.first_header("Proxy-Authorization").unwrap();
    assert!(auth.contains(r#"realm="example.com""#));
    assert!(auth.contains(r#"uri="sip:bob@example.com""#));
    assert_eq!(retry.body(), invite.body());
}

#[test]
fn test_answer_without_common_codec_hangs_up() {
    let mut h = Harness::connected();
    let call_id = h.client.call(h.now, "sip:bob@example.com").unwrap();
    let sent = h.sent();
    let invite = find_method(&sent, "INVITE").clone();

    let mut ok = respond(&invite, 200, "OK");
    ok.set_body(
        "application/sdp",
        bytes::Bytes::from_static(b"v=0\r\nc=IN IP4 198.51.100.7\r\nt=0 0\r\nm=audio 30000 RTP/AVP 18\r\n"),
    );
    h.deliver(&ok);

    let sent = h.sent();
    find_method(&sent, "ACK");
    let bye = find_method(&sent, "BYE").clone();
    h.deliver(&respond(&bye, 200, "OK"));

    let events = h.events();
    match finished_event(&events) {
        Some(ClientEvent::CallFinished { call_id: id, error, .. }) => {
            assert_eq!(id, &call_id);
            assert!(matches!(error, Some(SignalingError::SdpNegotiationFailure(_))));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_incoming_call_accept_and_remote_hangup() {
    let mut h = Harness::connected();
    let invite = incoming_invite("in-1@bob", REMOTE_SDP);
    h.deliver(&invite);

    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    let ringing = &sent[0];
    assert_eq!(ringing.status_code(), Some(180));
    assert!(ringing.first_header("To").unwrap().contains("tag="));
    let events = h.events();
    assert!(events.contains(&ClientEvent::CallReceived {
        call_id: "in-1@bob".to_string(),
        from: "<sip:bob@example.com>;tag=b0b".to_string()
    }));

    // retransmitted INVITE gets the same provisional answer
    h.deliver(&invite);
    let sent = h.sent();
    assert_eq!(sent[0].status_code(), Some(180));
    assert_eq!(sent[0].first_header("To"), ringing.first_header("To"));

    h.client.accept(h.now, "in-1@bob").unwrap();
    let sent = h.sent();
    let ok = &sent[0];
    assert_eq!(ok.status_code(), Some(200));
    assert_eq!(ok.first_header("To"), ringing.first_header("To"));
    assert_eq!(ok.first_header("Supported"), Some("replaces"));
    assert!(ok.first_header("Allow").unwrap().contains("INVITE"));
    let answer = SdpSession::from_message(&SdpMessage::parse(ok.body()));
    assert_eq!(answer.active_time.as_deref(), Some("0 0"));
    assert_eq!(answer.rtp_address(), Some(addr("203.0.113.5:20000")));
    assert!(h.events().contains(&ClientEvent::CallStarted {
        call_id: "in-1@bob".to_string()
    }));

    h.deliver(&remote_request("ACK", &invite, 1, "z9hG4bKack1"));
    assert_eq!(h.client.find_call("in-1@bob").unwrap().state(), CallState::Active);

    h.deliver(&remote_request("BYE", &invite, 2, "z9hG4bKbye1"));
    let sent = h.sent();
    assert_eq!(sent[0].status_code(), Some(200));
    assert_eq!(sent[0].cseq_method(), Some("BYE"));
    assert!(h.client.find_call("in-1@bob").is_none());
}

#[test]
fn test_incoming_invite_with_bad_sdp_is_rejected() {
    let mut h = Harness::connected();
    h.deliver(&incoming_invite("in-2@bob", "v=0\r\ns=-\r\n"));

    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].status_code(), Some(400));

    let events = h.events();
    assert!(!events.iter().any(|e| matches!(e, ClientEvent::CallReceived { .. })));
    match finished_event(&events) {
        Some(ClientEvent::CallFinished { error, .. }) => {
            assert!(matches!(error, Some(SignalingError::SdpNegotiationFailure(_))))
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(h.client.active_calls(), 0);
}

#[test]
fn test_incoming_call_cancelled() {
    let mut h = Harness::connected();
    let invite = incoming_invite("in-3@bob", REMOTE_SDP);
    h.deliver(&invite);
    h.sent();

    h.deliver(&remote_request("CANCEL", &invite, 1, "z9hG4bKinv1"));
    let sent = h.sent();
    let codes: Vec<_> = sent.iter().map(|m| m.status_code()).collect();
    assert_eq!(codes, vec![Some(200), Some(487)]);
    assert_eq!(sent[1].cseq_method(), Some("INVITE"));
    assert!(h.client.find_call("in-3@bob").is_none());
}

#[test]
fn test_decline_incoming_call() {
    let mut h = Harness::connected();
    h.deliver(&incoming_invite("in-4@bob", REMOTE_SDP));
    h.sent();

    h.client.hangup(h.now, "in-4@bob").unwrap();
    let sent = h.sent();
    assert_eq!(sent[0].status_code(), Some(603));
    assert!(h.client.find_call("in-4@bob").is_none());
}

#[test]
fn test_unsupported_in_dialog_request() {
    let mut h = Harness::connected();
    let invite = incoming_invite("in-5@bob", REMOTE_SDP);
    h.deliver(&invite);
    h.sent();

    h.deliver(&remote_request("UPDATE", &invite, 2, "z9hG4bKupd"));
    let sent = h.sent();
    assert_eq!(sent[0].status_code(), Some(405));
    assert!(sent[0].first_header("Allow").is_some());
}

#[test]
fn test_unknown_call_operations_fail() {
    let mut h = Harness::connected();
    assert!(h.client.hangup(h.now, "nope").is_err());
    assert!(h.client.accept(h.now, "nope").is_err());
    assert!(matches!(
        h.client.call(h.now, "  "),
        Err(yakphone::ClientError::InvalidRecipient(_))
    ));
}
