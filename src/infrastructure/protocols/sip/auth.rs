//! SIP Digest Authentication (RFC 2617, RFC 3261), client side

use super::message::split_header_values;
use rand::Rng;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// Nonce count sent with every authorization; each challenge is answered once
const NONCE_COUNT: &str = "00000001";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Unsupported authentication scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Missing {0} in challenge")]
    MissingParameter(&'static str),
}

/// Challenge from a WWW-Authenticate or Proxy-Authenticate header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
}

impl DigestChallenge {
    pub fn parse(header: &str) -> Result<Self, AuthError> {
        let header = header.trim();
        let (scheme, rest) = header.split_once(' ').unwrap_or((header, ""));
        if !scheme.eq_ignore_ascii_case("Digest") {
            return Err(AuthError::UnsupportedScheme(scheme.to_string()));
        }

        let mut params = parse_digest_params(rest);
        Ok(Self {
            realm: params.remove("realm").ok_or(AuthError::MissingParameter("realm"))?,
            nonce: params.remove("nonce").ok_or(AuthError::MissingParameter("nonce"))?,
            opaque: params.remove("opaque"),
            algorithm: params.remove("algorithm"),
            qop: params.remove("qop"),
        })
    }

    /// Same realm and nonce: answering again would fail again
    pub fn is_repeat_of(&self, other: &DigestChallenge) -> bool {
        self.realm == other.realm && self.nonce == other.nonce
    }

    /// `auth` when the server offers it, otherwise the first offered option
    fn selected_qop(&self) -> Option<String> {
        let offered = self.qop.as_ref()?;
        let options: Vec<&str> = offered.split(',').map(str::trim).filter(|q| !q.is_empty()).collect();
        if options.contains(&"auth") {
            Some("auth".to_string())
        } else {
            options.first().map(|q| q.to_string())
        }
    }
}

/// Parse Digest authentication parameters; commas inside quotes are kept
fn parse_digest_params(params: &str) -> HashMap<String, String> {
    split_header_values(params)
        .iter()
        .filter_map(|part| part.split_once('='))
        .map(|(key, value)| {
            (
                key.trim().to_ascii_lowercase(),
                value.trim().trim_matches('"').to_string(),
            )
        })
        .collect()
}

/// Calculate digest response
#[allow(clippy::too_many_arguments)]
pub fn calculate_response(
    username: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
    qop: Option<&str>,
    nc: &str,
    cnonce: &str,
) -> String {
    // HA1 = MD5(username:realm:password)
    let ha1 = format!("{:x}", md5::compute(format!("{}:{}:{}", username, realm, password)));

    // HA2 = MD5(method:uri)
    let ha2 = format!("{:x}", md5::compute(format!("{}:{}", method, uri)));

    // Response = MD5(HA1:nonce:HA2) or MD5(HA1:nonce:nc:cnonce:qop:HA2)
    let digest = match qop {
        Some(qop) => md5::compute(format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, cnonce, qop, ha2)),
        None => md5::compute(format!("{}:{}:{}", ha1, nonce, ha2)),
    };
    format!("{:x}", digest)
}

/// Authorization header value answering `challenge` for one request
pub fn authorization(
    challenge: &DigestChallenge,
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
) -> String {
    let qop = challenge.selected_qop();
    let cnonce = hex::encode(rand::thread_rng().gen::<[u8; 8]>());
    let response = calculate_response(
        username,
        password,
        &challenge.realm,
        &challenge.nonce,
        method,
        uri,
        qop.as_deref(),
        NONCE_COUNT,
        &cnonce,
    );
    debug!("Answering digest challenge for realm {}", challenge.realm);

    let mut value = format!(
        r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm=MD5"#,
        username, challenge.realm, challenge.nonce, uri, response
    );
    if let Some(qop) = qop {
        value.push_str(&format!(r#", cnonce="{}", qop={}, nc={}"#, cnonce, qop, NONCE_COUNT));
    }
    if let Some(opaque) = &challenge.opaque {
        value.push_str(&format!(r#", opaque="{}""#, opaque));
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_challenge() {
        let challenge = DigestChallenge::parse(
            r#"Digest realm="example.com", nonce="dcd98b7102dd2f0e", qop="auth,auth-int", opaque="5ccc", algorithm=MD5"#,
        )
        .unwrap();

        assert_eq!(challenge.realm, "example.com");
        assert_eq!(challenge.nonce, "dcd98b7102dd2f0e");
        assert_eq!(challenge.qop.as_deref(), Some("auth,auth-int"));
        assert_eq!(challenge.opaque.as_deref(), Some("5ccc"));
        assert_eq!(challenge.selected_qop().as_deref(), Some("auth"));
    }

    #[test]
    fn test_parse_rejects_other_schemes() {
        assert_eq!(
            DigestChallenge::parse(r#"Basic realm="x""#),
            Err(AuthError::UnsupportedScheme("Basic".to_string()))
        );
        assert_eq!(
            DigestChallenge::parse(r#"Digest realm="x""#),
            Err(AuthError::MissingParameter("nonce"))
        );
    }

    #[test]
    fn test_rfc2617_response() {
        // Example from RFC 2617 section 3.5
        let response = calculate_response(
            "Mufasa",
            "Circle Of Life",
            "testrealm@host.com",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            "GET",
            "/dir/index.html",
            Some("auth"),
            "00000001",
            "0a4f113b",
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn test_response_without_qop() {
        let ha1 = format!("{:x}", md5::compute("alice:example.com:secret"));
        let ha2 = format!("{:x}", md5::compute("REGISTER:sip:example.com"));
        let expected = format!("{:x}", md5::compute(format!("{}:abc:{}", ha1, ha2)));

        let response = calculate_response(
            "alice", "secret", "example.com", "abc", "REGISTER", "sip:example.com", None, NONCE_COUNT, "",
        );
        assert_eq!(response, expected);
    }

    #[test]
    fn test_authorization_header() {
        let challenge = DigestChallenge::parse(r#"Digest realm="example.com", nonce="abc", opaque="xyz""#).unwrap();
        let value = authorization(&challenge, "alice", "secret", "REGISTER", "sip:example.com");

        assert!(value.starts_with(r#"Digest username="alice", realm="example.com", nonce="abc", uri="sip:example.com""#));
        assert!(value.contains("algorithm=MD5"));
        assert!(value.ends_with(r#"opaque="xyz""#));
        assert!(!value.contains("qop"));
    }
}
