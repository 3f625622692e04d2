//! Configuration management
//!
//! Values come from built-in defaults, then an optional TOML file, then
//! `YAKPHONE__SECTION__KEY` environment variables.

use crate::infrastructure::protocols::sip::{ClientConfig, SipTimers, UserIdentity};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sip: SipConfig,
    pub media: MediaConfig,
    pub timers: TimerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SipConfig {
    pub bind_address: String,
    pub bind_port: u16,
    pub domain: String,
    pub username: String,
    pub password: String,
    pub display_name: Option<String>,
    /// Registration lifetime requested from the server, in seconds
    pub expires: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// First RTP port handed to calls
    pub rtp_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    pub t1_ms: u64,
    pub t2_ms: u64,
    pub register_margin_secs: u64,
    pub connect_retry_secs: u64,
    pub stun_retry_ms: u64,
    pub stun_refresh_secs: u64,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            bind_port: 5060,
            domain: "localhost".to_string(),
            username: String::new(),
            password: String::new(),
            display_name: None,
            expires: 3600,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self { rtp_port: 20000 }
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            t1_ms: 500,
            t2_ms: 4000,
            register_margin_secs: 10,
            connect_retry_secs: 60,
            stun_retry_ms: 500,
            stun_refresh_secs: 30,
        }
    }
}

impl Config {
    /// Load from `path` (optional, any format the config crate knows by
    /// extension) and the environment.
    pub fn load(path: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("YAKPHONE")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }

    pub fn bind_address(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.sip.bind_address, self.sip.bind_port).parse()
    }

    pub fn identity(&self) -> UserIdentity {
        UserIdentity {
            username: self.sip.username.clone(),
            password: self.sip.password.clone(),
            domain: self.sip.domain.clone(),
            display_name: self.sip.display_name.clone(),
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        let mut client = ClientConfig::new(self.identity());
        client.timers = SipTimers {
            t1: Duration::from_millis(self.timers.t1_ms),
            t2: Duration::from_millis(self.timers.t2_ms),
        };
        client.expires = self.sip.expires;
        client.register_margin = Duration::from_secs(self.timers.register_margin_secs);
        client.connect_retry = Duration::from_secs(self.timers.connect_retry_secs);
        client.stun_retry = Duration::from_millis(self.timers.stun_retry_ms);
        client.stun_refresh = Duration::from_secs(self.timers.stun_refresh_secs);
        client
    }
}
