//! SIP message types, wire parsing and serialization

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Failure to read a datagram as a SIP message. The datagram is dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Malformed start line")]
    MalformedStartLine,

    #[error("Missing CRLF terminator")]
    MissingCrlf,

    #[error("Malformed header: {0}")]
    MalformedHeader(String),
}

/// Failures of the socket and resolver around the signaling state machine
#[derive(Error, Debug)]
pub enum SipError {
    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("DNS error: {0}")]
    DnsError(String),

    #[error("Parse error: {0}")]
    ParseError(#[from] ParseError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// SIP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Update,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Update => "UPDATE",
        }
    }

    pub fn parse(method: &str) -> Option<Self> {
        match method {
            "REGISTER" => Some(SipMethod::Register),
            "INVITE" => Some(SipMethod::Invite),
            "ACK" => Some(SipMethod::Ack),
            "CANCEL" => Some(SipMethod::Cancel),
            "BYE" => Some(SipMethod::Bye),
            "OPTIONS" => Some(SipMethod::Options),
            "UPDATE" => Some(SipMethod::Update),
            _ => None,
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Compact header forms (RFC 3261 section 7.3.3). Accepted on receive, never emitted.
const COMPACT_HEADERS: &[(char, &str)] = &[
    ('c', "Content-Type"),
    ('e', "Content-Encoding"),
    ('f', "From"),
    ('i', "Call-ID"),
    ('k', "Supported"),
    ('l', "Content-Length"),
    ('m', "Contact"),
    ('s', "Subject"),
    ('t', "To"),
    ('v', "Via"),
];

/// Expand a compact header name to its long form.
pub fn canonical_header_name(name: &str) -> String {
    let mut chars = name.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        let c = c.to_ascii_lowercase();
        if let Some((_, long)) = COMPACT_HEADERS.iter().find(|(short, _)| *short == c) {
            return (*long).to_string();
        }
    }
    name.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: String, uri: String },
    Response { code: u16, reason: String },
}

impl StartLine {
    fn parse(line: &str) -> Result<Self, ParseError> {
        if let Some(rest) = line.strip_prefix("SIP/2.0 ") {
            let (code, reason) = match rest.split_once(' ') {
                Some((code, reason)) => (code, reason),
                None => (rest, ""),
            };
            if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ParseError::MalformedStartLine);
            }
            let code: u16 = code.parse().map_err(|_| ParseError::MalformedStartLine)?;
            if !(100..700).contains(&code) {
                return Err(ParseError::MalformedStartLine);
            }
            return Ok(StartLine::Response {
                code,
                reason: reason.to_string(),
            });
        }

        let mut parts = line.splitn(3, ' ');
        let (Some(method), Some(uri), Some(version)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseError::MalformedStartLine);
        };
        let method_ok = !method.is_empty()
            && method
                .bytes()
                .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'-' || b == b'_');
        if !method_ok || uri.is_empty() || version != "SIP/2.0" {
            return Err(ParseError::MalformedStartLine);
        }
        Ok(StartLine::Request {
            method: method.to_string(),
            uri: uri.to_string(),
        })
    }
}

impl fmt::Display for StartLine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StartLine::Request { method, uri } => write!(f, "{} {} SIP/2.0", method, uri),
            StartLine::Response { code, reason } => write!(f, "SIP/2.0 {} {}", code, reason),
        }
    }
}

/// A SIP request or response.
///
/// Headers are an ordered multimap: each received header line is kept as one
/// entry, in order, under its canonical (long form) name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipMessage {
    start: StartLine,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl SipMessage {
    pub fn request(method: &str, uri: &str) -> Self {
        Self {
            start: StartLine::Request {
                method: method.to_string(),
                uri: uri.to_string(),
            },
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn response(code: u16, reason: &str) -> Self {
        Self {
            start: StartLine::Response {
                code,
                reason: reason.to_string(),
            },
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Parse a datagram. Bytes after the blank line are the body, verbatim.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let line_end = find_crlf(data, 0).ok_or(ParseError::MissingCrlf)?;
        let line = std::str::from_utf8(&data[..line_end]).map_err(|_| ParseError::MalformedStartLine)?;
        let start = StartLine::parse(line)?;

        let mut headers = Vec::new();
        let mut pos = line_end + 2;
        loop {
            let end = find_crlf(data, pos).ok_or(ParseError::MissingCrlf)?;
            if end == pos {
                pos += 2;
                break;
            }
            let line = String::from_utf8_lossy(&data[pos..end]);
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ParseError::MalformedHeader(line.to_string()))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(ParseError::MalformedHeader(line.to_string()));
            }
            headers.push((canonical_header_name(name), value.trim().to_string()));
            pos = end + 2;
        }

        Ok(Self {
            start,
            headers,
            body: Bytes::copy_from_slice(&data[pos..]),
        })
    }

    /// Serialize to wire format, appending Content-Length when absent.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(512 + self.body.len());
        buf.put_slice(self.start.to_string().as_bytes());
        buf.put_slice(b"\r\n");
        for (name, value) in &self.headers {
            buf.put_slice(name.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        if self.first_header("Content-Length").is_none() {
            buf.put_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        buf.put_slice(b"\r\n");
        buf.put_slice(&self.body);
        buf.freeze()
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    pub fn method(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn uri(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { uri, .. } => Some(uri),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.start {
            StartLine::Response { code, .. } => Some(*code),
            StartLine::Request { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match &self.start {
            StartLine::Response { reason, .. } => Some(reason),
            StartLine::Request { .. } => None,
        }
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// First header line with this name, unsplit.
    pub fn first_header(&self, name: &str) -> Option<&str> {
        let name = canonical_header_name(name);
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value of a header, with comma separated lines split apart.
    pub fn header_values(&self, name: &str) -> Vec<String> {
        let name = canonical_header_name(name);
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(&name))
            .flat_map(|(_, v)| split_header_values(v))
            .collect()
    }

    /// All values of a header joined with ", ".
    pub fn header(&self, name: &str) -> Option<String> {
        let values = self.header_values(name);
        if values.is_empty() {
            None
        } else {
            Some(values.join(", "))
        }
    }

    pub fn add_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.push((canonical_header_name(name), value.into()));
    }

    /// Replace every occurrence of a header with a single value, keeping the
    /// position of the first occurrence.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let name = canonical_header_name(name);
        let value = value.into();
        match self.headers.iter().position(|(n, _)| n.eq_ignore_ascii_case(&name)) {
            Some(index) => {
                self.headers[index].1 = value;
                let mut i = 0;
                self.headers.retain(|(n, _)| {
                    let keep = i <= index || !n.eq_ignore_ascii_case(&name);
                    i += 1;
                    keep
                });
            }
            None => self.headers.push((name, value)),
        }
    }

    pub fn remove_header(&mut self, name: &str) {
        let name = canonical_header_name(name);
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Replace the body. Any previous Content-Length is dropped so it is
    /// recomputed on serialization.
    pub fn set_body(&mut self, content_type: &str, body: Bytes) {
        self.remove_header("Content-Length");
        if body.is_empty() {
            self.remove_header("Content-Type");
        } else {
            self.set_header("Content-Type", content_type);
        }
        self.body = body;
    }

    pub fn call_id(&self) -> Option<&str> {
        self.first_header("Call-ID")
    }

    /// Branch parameter of the top Via.
    pub fn via_branch(&self) -> Option<String> {
        let via = self.header_values("Via").into_iter().next()?;
        parse_parameters(&via).remove("branch").filter(|b| !b.is_empty())
    }

    pub fn cseq_number(&self) -> Option<u32> {
        self.first_header("CSeq")?.split_whitespace().next()?.parse().ok()
    }

    pub fn cseq_method(&self) -> Option<&str> {
        self.first_header("CSeq")?.split_whitespace().nth(1)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.first_header("Content-Type")
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.to_bytes()))
    }
}

fn find_crlf(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| from + i)
}

/// Split a header line on commas that are outside quotes and angle brackets.
pub fn split_header_values(line: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut angle = false;
    for c in line.chars() {
        match c {
            '"' => quoted = !quoted,
            '<' if !quoted => angle = true,
            '>' if !quoted => angle = false,
            ',' if !quoted && !angle => {
                let value = current.trim();
                if !value.is_empty() {
                    values.push(value.to_string());
                }
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    let value = current.trim();
    if !value.is_empty() {
        values.push(value.to_string());
    }
    values
}

/// Parameters of a `token;k1=v1;k2` header value. Parameters without `=`
/// map to an empty string. Parameters inside `<...>` belong to the URI and
/// are skipped.
pub fn parse_parameters(value: &str) -> HashMap<String, String> {
    let tail = match value.rfind('>') {
        Some(index) => &value[index + 1..],
        None => value.split_once(';').map(|(_, rest)| rest).unwrap_or(""),
    };

    let mut params = HashMap::new();
    for part in tail.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('=') {
            Some((key, val)) => params.insert(key.trim().to_string(), val.trim().trim_matches('"').to_string()),
            None => params.insert(part.to_string(), String::new()),
        };
    }
    params
}

/// The URI of a name-addr (`"Bob" <sip:bob@host>;tag=x`) or a bare addr-spec.
pub fn header_uri(value: &str) -> &str {
    if let (Some(start), Some(end)) = (value.find('<'), value.find('>')) {
        if start < end {
            return &value[start + 1..end];
        }
    }
    value.split(';').next().unwrap_or(value).trim()
}
