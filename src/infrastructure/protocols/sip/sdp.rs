//! SDP (Session Description Protocol) subset for one audio stream with ICE

use crate::infrastructure::media::codec::PayloadType;
use crate::infrastructure::protocols::ice::IceCandidate;
use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};
use tracing::debug;

/// Seconds between the NTP epoch (1900) and the Unix epoch
const NTP_EPOCH_OFFSET: i64 = 2_208_988_800;

/// SDP body as an ordered list of `type=value` fields. Order matters since an
/// `m=` line scopes the `a=` lines after it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdpMessage {
    fields: Vec<(char, String)>,
}

impl SdpMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines that are not of the form `X=...` are skipped. Unknown field
    /// types are kept as they are.
    pub fn parse(data: &[u8]) -> Self {
        let text = String::from_utf8_lossy(data);
        let fields = text
            .split('\n')
            .map(|line| line.trim_end_matches('\r'))
            .filter_map(|line| {
                let mut chars = line.chars();
                match (chars.next(), chars.next()) {
                    (Some(kind), Some('=')) => Some((kind, line[kind.len_utf8() + 1..].to_string())),
                    _ => None,
                }
            })
            .collect();
        Self { fields }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = String::new();
        for (kind, value) in &self.fields {
            out.push(*kind);
            out.push('=');
            out.push_str(value);
            out.push_str("\r\n");
        }
        Bytes::from(out)
    }

    pub fn add_field(&mut self, kind: char, value: impl Into<String>) {
        self.fields.push((kind, value.into()));
    }

    pub fn fields(&self) -> &[(char, String)] {
        &self.fields
    }

    pub fn values(&self, kind: char) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(move |(k, _)| *k == kind)
            .map(|(_, v)| v.as_str())
    }
}

/// The parts of a remote description a call acts on
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SdpSession {
    pub connection: Option<IpAddr>,
    pub audio_port: Option<u16>,
    pub payload_types: Vec<PayloadType>,
    pub ice_user: Option<String>,
    pub ice_password: Option<String>,
    pub candidates: Vec<IceCandidate>,
    pub ptime: Option<u32>,
    /// Value of the `t=` line
    pub active_time: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Session,
    Audio,
    Ignored,
}

impl SdpSession {
    /// Read the session level fields and the first `m=audio ... RTP/AVP`
    /// section. Later media sections and unknown attributes are ignored.
    pub fn from_message(sdp: &SdpMessage) -> Self {
        let mut session = SdpSession::default();
        let mut scope = Scope::Session;
        let mut seen_audio = false;

        for (kind, value) in sdp.fields() {
            match kind {
                'm' => {
                    scope = Scope::Ignored;
                    if seen_audio {
                        continue;
                    }
                    if let Some((port, payloads)) = parse_audio_media(value) {
                        seen_audio = true;
                        scope = Scope::Audio;
                        session.audio_port = Some(port);
                        session.payload_types = payloads;
                    }
                }
                't' if scope == Scope::Session => session.active_time = Some(value.clone()),
                'c' if scope != Scope::Ignored => {
                    if let Some(ip) = parse_connection(value) {
                        session.connection = Some(ip);
                    }
                }
                'a' if scope != Scope::Ignored => session.apply_attribute(value),
                _ => {}
            }
        }

        if let Some(ptime) = session.ptime {
            for pt in &mut session.payload_types {
                pt.ptime = Some(ptime);
            }
        }
        session
    }

    fn apply_attribute(&mut self, attribute: &str) {
        let (name, value) = attribute.split_once(':').unwrap_or((attribute, ""));
        match name {
            "ice-ufrag" => self.ice_user = Some(value.trim().to_string()),
            "ice-pwd" => self.ice_password = Some(value.trim().to_string()),
            "candidate" => match value.parse::<IceCandidate>() {
                Ok(candidate) => self.candidates.push(candidate),
                Err(e) => debug!("Ignoring candidate: {}", e),
            },
            "rtpmap" => {
                if let Some(mapped) = PayloadType::from_rtpmap(value) {
                    if let Some(pt) = self.payload_types.iter_mut().find(|pt| pt.id == mapped.id) {
                        *pt = mapped;
                    }
                }
            }
            "ptime" => self.ptime = value.trim().parse().ok(),
            _ => {}
        }
    }

    pub fn rtp_address(&self) -> Option<SocketAddr> {
        Some(SocketAddr::new(self.connection?, self.audio_port?))
    }

    /// RTCP on the port after RTP
    pub fn rtcp_address(&self) -> Option<SocketAddr> {
        let rtp = self.rtp_address()?;
        Some(SocketAddr::new(rtp.ip(), rtp.port().checked_add(1)?))
    }

    /// An address and at least one payload type were found
    pub fn is_usable(&self) -> bool {
        self.rtp_address().is_some() && !self.payload_types.is_empty()
    }
}

fn parse_connection(value: &str) -> Option<IpAddr> {
    let mut parts = value.split_whitespace();
    if parts.next()? != "IN" {
        return None;
    }
    match parts.next()? {
        "IP4" | "IP6" => {}
        _ => return None,
    }
    parts.next()?.split('/').next()?.parse().ok()
}

fn parse_audio_media(value: &str) -> Option<(u16, Vec<PayloadType>)> {
    let mut parts = value.split_whitespace();
    if parts.next()? != "audio" {
        return None;
    }
    let port = parts.next()?.split('/').next()?.parse().ok()?;
    if parts.next()? != "RTP/AVP" {
        return None;
    }
    let payloads = parts
        .filter_map(|id| id.parse::<u8>().ok())
        .map(PayloadType::from_static)
        .collect();
    Some((port, payloads))
}

/// Local offer or answer
#[derive(Debug, Clone)]
pub struct LocalDescription {
    pub origin: IpAddr,
    pub rtp_address: SocketAddr,
    pub active_time: String,
    pub ice_user: String,
    pub ice_password: String,
    pub payload_types: Vec<PayloadType>,
    pub candidates: Vec<IceCandidate>,
}

fn address_type(ip: &IpAddr) -> &'static str {
    match ip {
        IpAddr::V4(_) => "IP4",
        IpAddr::V6(_) => "IP6",
    }
}

impl LocalDescription {
    pub fn to_message(&self) -> SdpMessage {
        let ntp = chrono::Utc::now().timestamp() + NTP_EPOCH_OFFSET;
        let mut sdp = SdpMessage::new();
        sdp.add_field('v', "0");
        sdp.add_field(
            'o',
            format!("- {} {} IN {} {}", ntp, ntp, address_type(&self.origin), self.origin),
        );
        sdp.add_field('s', "-");
        sdp.add_field(
            'c',
            format!("IN {} {}", address_type(&self.rtp_address.ip()), self.rtp_address.ip()),
        );
        sdp.add_field('t', self.active_time.clone());
        sdp.add_field('a', format!("ice-ufrag:{}", self.ice_user));
        sdp.add_field('a', format!("ice-pwd:{}", self.ice_password));

        let ids: Vec<String> = self.payload_types.iter().map(|pt| pt.id.to_string()).collect();
        sdp.add_field(
            'm',
            format!("audio {} RTP/AVP {}", self.rtp_address.port(), ids.join(" ")),
        );
        for pt in &self.payload_types {
            sdp.add_field('a', format!("rtpmap:{}", pt.rtpmap()));
            if pt.is_telephone_event() {
                sdp.add_field('a', format!("fmtp:{} 0-15", pt.id));
            }
        }
        if let Some(ptime) = self.payload_types.iter().find_map(|pt| pt.ptime) {
            sdp.add_field('a', format!("ptime:{}", ptime));
        }
        sdp.add_field('a', "sendrecv");
        for candidate in &self.candidates {
            sdp.add_field('a', format!("candidate:{}", candidate));
        }
        sdp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::ice::CandidateType;

    const OFFER: &str = "v=0\r\n\
        o=- 3900000000 3900000000 IN IP4 198.51.100.20\r\n\
        s=-\r\n\
        c=IN IP4 198.51.100.20\r\n\
        t=0 0\r\n\
        a=ice-ufrag:F7gI\r\n\
        a=ice-pwd:x9cml/YzichV2+XlhiMu8g\r\n\
        m=audio 49170 RTP/AVP 8 0 101\r\n\
        a=rtpmap:8 PCMA/8000\r\n\
        a=rtpmap:101 telephone-event/8000\r\n\
        a=fmtp:101 0-15\r\n\
        a=ptime:20\r\n\
        a=x-unknown:whatever\r\n\
        a=candidate:1 1 UDP 2130706431 198.51.100.20 49170 typ host\r\n\
        a=candidate:2 1 UDP 1694498815 203.0.113.4 49170 typ srflx raddr 198.51.100.20 rport 49170\r\n\
        m=audio 50000 RTP/AVP 18\r\n\
        a=rtpmap:0 BOGUS/1\r\n";

    #[test]
    fn test_parse_keeps_order_and_unknown_fields() {
        let sdp = SdpMessage::parse(b"v=0\r\nz=custom\r\ngarbage\r\ns=-\r\n");
        assert_eq!(
            sdp.fields(),
            &[('v', "0".to_string()), ('z', "custom".to_string()), ('s', "-".to_string())]
        );
        assert_eq!(sdp.to_bytes().as_ref(), b"v=0\r\nz=custom\r\ns=-\r\n");
    }

    #[test]
    fn test_extract_offer() {
        let session = SdpSession::from_message(&SdpMessage::parse(OFFER.as_bytes()));

        assert_eq!(session.rtp_address(), Some("198.51.100.20:49170".parse().unwrap()));
        assert_eq!(session.rtcp_address(), Some("198.51.100.20:49171".parse().unwrap()));
        assert_eq!(session.active_time.as_deref(), Some("0 0"));
        assert_eq!(session.ice_user.as_deref(), Some("F7gI"));
        assert_eq!(session.ice_password.as_deref(), Some("x9cml/YzichV2+XlhiMu8g"));
        assert_eq!(session.candidates.len(), 2);
        assert_eq!(session.candidates[1].candidate_type, CandidateType::ServerReflexive);
        assert_eq!(session.ptime, Some(20));

        let names: Vec<_> = session.payload_types.iter().map(|pt| pt.name.as_str()).collect();
        assert_eq!(names, vec!["PCMA", "PCMU", "telephone-event"]);
        assert!(session.payload_types.iter().all(|pt| pt.ptime == Some(20)));
        assert!(session.is_usable());
    }

    #[test]
    fn test_missing_audio_is_unusable() {
        let sdp = SdpMessage::parse(b"v=0\r\nc=IN IP4 10.0.0.1\r\nm=video 5000 RTP/AVP 96\r\n");
        let session = SdpSession::from_message(&sdp);

        assert!(session.audio_port.is_none());
        assert!(!session.is_usable());
    }

    #[test]
    fn test_non_avp_audio_is_skipped() {
        let sdp = SdpMessage::parse(
            b"c=IN IP4 10.0.0.1\r\nm=audio 4000 RTP/SAVP 0\r\nm=audio 5000 RTP/AVP 0\r\n",
        );
        let session = SdpSession::from_message(&sdp);

        assert_eq!(session.audio_port, Some(5000));
    }

    #[test]
    fn test_local_description() {
        let host = IceCandidate::new(CandidateType::Host, "10.0.0.5:40000".parse().unwrap(), 1);
        let local = LocalDescription {
            origin: "10.0.0.5".parse().unwrap(),
            rtp_address: "203.0.113.5:40000".parse().unwrap(),
            active_time: "0 0".to_string(),
            ice_user: "abcd".to_string(),
            ice_password: "0123456789abcdefghijkl".to_string(),
            payload_types: vec![PayloadType::pcmu(), PayloadType::telephone_event(101)],
            candidates: vec![host],
        };
        let sdp = local.to_message();
        let kinds: String = sdp.fields().iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds, "vosctaamaaaaa");

        let text = String::from_utf8(sdp.to_bytes().to_vec()).unwrap();
        assert!(text.contains("c=IN IP4 203.0.113.5\r\n"));
        assert!(text.contains("m=audio 40000 RTP/AVP 0 101\r\n"));
        assert!(text.contains("a=fmtp:101 0-15\r\n"));
        assert!(text.contains("a=candidate:"));

        // what we offer we can read back
        let session = SdpSession::from_message(&SdpMessage::parse(&sdp.to_bytes()));
        assert!(session.is_usable());
        assert_eq!(session.payload_types[1].name, "telephone-event");
    }
}
