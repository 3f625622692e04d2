//! ICE candidates as carried in `a=candidate:` SDP attributes
//!
//! Format: `<foundation> <component> <transport> <priority> <ip> <port> typ <type>
//! [raddr <ip> rport <port>]`.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

pub const RTP_COMPONENT: u16 = 1;
pub const RTCP_COMPONENT: u16 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CandidateError {
    #[error("Candidate has too few fields: {0}")]
    TooShort(String),
    #[error("Missing 'typ' keyword")]
    MissingTyp,
    #[error("Invalid {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

fn field<T: FromStr>(name: &'static str, value: &str) -> Result<T, CandidateError> {
    value.parse().map_err(|_| CandidateError::InvalidField {
        field: name,
        value: value.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateType {
    Host,
    /// Public mapping learned from a STUN server
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl CandidateType {
    /// Recommended type preference of RFC 5245 section 4.1.2.2
    fn type_preference(self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::PeerReflexive => 110,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relay => 0,
        }
    }

    fn token(self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
        }
    }
}

impl FromStr for CandidateType {
    type Err = CandidateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(CandidateType::Host),
            "srflx" => Ok(CandidateType::ServerReflexive),
            "prflx" => Ok(CandidateType::PeerReflexive),
            "relay" => Ok(CandidateType::Relay),
            other => Err(CandidateError::InvalidField {
                field: "candidate type",
                value: other.to_string(),
            }),
        }
    }
}

/// One transport address offered for a media component. Only UDP
/// candidates are produced; remote ones keep whatever transport they name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub foundation: String,
    pub component: u16,
    pub transport: String,
    pub priority: u32,
    pub address: SocketAddr,
    pub candidate_type: CandidateType,
    pub related_address: Option<SocketAddr>,
}

impl IceCandidate {
    pub fn new(candidate_type: CandidateType, address: SocketAddr, component: u16) -> Self {
        Self {
            foundation: foundation(candidate_type, address.ip()),
            component,
            transport: "UDP".to_string(),
            priority: priority(candidate_type, component),
            address,
            candidate_type,
            related_address: None,
        }
    }

    /// Base a reflexive candidate on the host address it was learned from
    pub fn with_related_address(mut self, base: SocketAddr) -> Self {
        self.related_address = Some(base);
        self
    }

    pub fn is_rtp(&self) -> bool {
        self.component == RTP_COMPONENT
    }
}

/// Same type and base IP share a foundation
fn foundation(candidate_type: CandidateType, ip: IpAddr) -> String {
    let octets: Vec<u8> = match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    let folded = octets
        .iter()
        .fold(candidate_type.type_preference(), |acc, b| {
            acc.wrapping_mul(31).wrapping_add(*b as u32)
        });
    (folded % 1_000_000).to_string()
}

/// `2^24 * type + 2^8 * local + (256 - component)` with the maximum local preference
fn priority(candidate_type: CandidateType, component: u16) -> u32 {
    (candidate_type.type_preference() << 24) + (65535 << 8) + (256 - component as u32)
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.transport,
            self.priority,
            self.address.ip(),
            self.address.port(),
            self.candidate_type.token()
        )?;
        if let Some(related) = self.related_address {
            write!(f, " raddr {} rport {}", related.ip(), related.port())?;
        }
        Ok(())
    }
}

impl FromStr for IceCandidate {
    type Err = CandidateError;

    /// Accepts the attribute value with or without its `candidate:` prefix
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.strip_prefix("candidate:").unwrap_or(s);
        let tokens: Vec<&str> = s.split_whitespace().collect();
        let [foundation, component, transport, priority, ip, port, typ, kind, extensions @ ..] =
            tokens.as_slice()
        else {
            return Err(CandidateError::TooShort(s.to_string()));
        };
        if *typ != "typ" {
            return Err(CandidateError::MissingTyp);
        }

        let ip: IpAddr = field("address", ip)?;
        let related_address = extensions
            .chunks(2)
            .fold((None, None), |(raddr, rport), pair| match pair {
                ["raddr", value] => (value.parse::<IpAddr>().ok(), rport),
                ["rport", value] => (raddr, value.parse::<u16>().ok()),
                _ => (raddr, rport),
            });

        Ok(Self {
            foundation: foundation.to_string(),
            component: field("component", component)?,
            transport: transport.to_ascii_uppercase(),
            priority: field("priority", priority)?,
            address: SocketAddr::new(ip, field("port", port)?),
            candidate_type: kind.parse()?,
            related_address: match related_address {
                (Some(ip), Some(port)) => Some(SocketAddr::new(ip, port)),
                _ => None,
            },
        })
    }
}
