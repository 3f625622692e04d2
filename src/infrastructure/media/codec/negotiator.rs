//! Codec Negotiation
//!
//! Payload type descriptions exchanged in SDP and selection of the codec
//! both endpoints support.

use serde::Serialize;

/// Payload type name reserved for DTMF events (RFC 4733)
pub const TELEPHONE_EVENT: &str = "telephone-event";

/// An RTP payload type as described by `m=` and `a=rtpmap:` lines
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayloadType {
    pub id: u8,
    pub name: String,
    pub clock_rate: u32,
    pub channels: u8,
    pub ptime: Option<u32>,
}

impl PayloadType {
    pub fn new(id: u8, name: &str, clock_rate: u32) -> Self {
        Self {
            id,
            name: name.to_string(),
            clock_rate,
            channels: 1,
            ptime: None,
        }
    }

    pub fn pcmu() -> Self {
        Self::new(0, "PCMU", 8000)
    }

    pub fn pcma() -> Self {
        Self::new(8, "PCMA", 8000)
    }

    pub fn telephone_event(id: u8) -> Self {
        Self::new(id, TELEPHONE_EVENT, 8000)
    }

    /// Payload type for an id listed on `m=` without an `a=rtpmap:` line.
    /// Static ids (RFC 3551) get their well-known names.
    pub fn from_static(id: u8) -> Self {
        match id {
            0 => Self::pcmu(),
            3 => Self::new(3, "GSM", 8000),
            8 => Self::pcma(),
            9 => Self::new(9, "G722", 8000),
            18 => Self::new(18, "G729", 8000),
            _ => Self::new(id, "", 8000),
        }
    }

    /// Parse the value of an `a=rtpmap:` attribute:
    /// `<id> <name>/<clockrate>[/<channels>]`
    pub fn from_rtpmap(value: &str) -> Option<Self> {
        let (id, encoding) = value.trim().split_once(' ')?;
        let id = id.parse().ok()?;
        let mut bits = encoding.trim().split('/');
        let name = bits.next()?;
        let clock_rate = bits.next()?.parse().ok()?;
        let channels = match bits.next() {
            Some(ch) => ch.parse().ok()?,
            None => 1,
        };
        Some(Self {
            id,
            name: name.to_string(),
            clock_rate,
            channels,
            ptime: None,
        })
    }

    /// `a=rtpmap:` value for this payload type
    pub fn rtpmap(&self) -> String {
        if self.channels > 1 {
            format!("{} {}/{}/{}", self.id, self.name, self.clock_rate, self.channels)
        } else {
            format!("{} {}/{}", self.id, self.name, self.clock_rate)
        }
    }

    pub fn is_telephone_event(&self) -> bool {
        self.name.eq_ignore_ascii_case(TELEPHONE_EVENT)
    }

    /// Static ids match by number, dynamic ids by encoding name and rate.
    pub fn matches(&self, other: &PayloadType) -> bool {
        if self.id < 96 && other.id < 96 {
            self.id == other.id
        } else {
            !self.name.is_empty()
                && self.name.eq_ignore_ascii_case(&other.name)
                && self.clock_rate == other.clock_rate
        }
    }
}

/// Codec Negotiator
#[derive(Debug, Clone)]
pub struct CodecNegotiator {
    supported_codecs: Vec<PayloadType>,
}

impl CodecNegotiator {
    /// Create negotiator with default supported codecs
    pub fn new() -> Self {
        Self::with_codecs(vec![
            PayloadType::pcmu(),
            PayloadType::pcma(),
            PayloadType::telephone_event(101),
        ])
    }

    pub fn with_codecs(supported_codecs: Vec<PayloadType>) -> Self {
        Self { supported_codecs }
    }

    pub fn supported(&self) -> &[PayloadType] {
        &self.supported_codecs
    }

    /// Negotiate codecs based on offer
    ///
    /// Returns the offered audio codecs we support, in the remote preference order
    pub fn negotiate(&self, offered: &[PayloadType]) -> Vec<PayloadType> {
        offered
            .iter()
            .filter(|pt| !pt.is_telephone_event())
            .filter(|pt| self.supported_codecs.iter().any(|c| c.matches(pt)))
            .cloned()
            .collect()
    }

    /// Select best codec from the offer
    pub fn select_best(&self, offered: &[PayloadType]) -> Option<PayloadType> {
        self.negotiate(offered).into_iter().next()
    }
}

impl Default for CodecNegotiator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtpmap_parsing() {
        let pt = PayloadType::from_rtpmap("111 opus/48000/2").unwrap();
        assert_eq!(pt.id, 111);
        assert_eq!(pt.name, "opus");
        assert_eq!(pt.clock_rate, 48000);
        assert_eq!(pt.channels, 2);
        assert_eq!(pt.rtpmap(), "111 opus/48000/2");

        assert_eq!(PayloadType::pcmu().rtpmap(), "0 PCMU/8000");
        assert!(PayloadType::from_rtpmap("x PCMU/8000").is_none());
    }

    #[test]
    fn test_negotiate_pcmu() {
        let negotiator = CodecNegotiator::new();
        let offered = vec![PayloadType::pcmu(), PayloadType::from_static(18)];

        let negotiated = negotiator.negotiate(&offered);
        assert_eq!(negotiated.len(), 1);
        assert_eq!(negotiated[0].name, "PCMU");
    }

    #[test]
    fn test_negotiate_keeps_remote_order() {
        let negotiator = CodecNegotiator::new();
        let offered = vec![PayloadType::pcma(), PayloadType::pcmu()];

        assert_eq!(negotiator.select_best(&offered).unwrap().id, 8);
    }

    #[test]
    fn test_dynamic_ids_match_by_name() {
        let negotiator = CodecNegotiator::new();
        let offered = vec![PayloadType::telephone_event(96)];

        // telephone-event alone is not an audio codec
        assert!(negotiator.select_best(&offered).is_none());
        assert!(PayloadType::telephone_event(96).matches(&PayloadType::telephone_event(101)));
    }

    #[test]
    fn test_no_common_codec() {
        let negotiator = CodecNegotiator::new();
        let offered = vec![PayloadType::from_static(18)];

        assert!(negotiator.negotiate(&offered).is_empty());
    }
}
