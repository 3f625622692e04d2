//! ICE component handle used by calls

use super::candidate::{CandidateType, IceCandidate, RTCP_COMPONENT, RTP_COMPONENT};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::net::{IpAddr, SocketAddr};
use tracing::debug;

/// One ICE session of a call: reports local candidates and receives the
/// remote credentials and candidates. Gathering and connectivity checks
/// happen behind this interface.
#[cfg_attr(test, mockall::automock)]
pub trait IceComponent: Send {
    fn local_user(&self) -> String;

    fn local_password(&self) -> String;

    fn local_candidates(&self) -> Vec<IceCandidate>;

    fn set_remote_user(&mut self, user: &str);

    fn set_remote_password(&mut self, password: &str);

    fn add_remote_candidate(&mut self, candidate: IceCandidate);

    fn close(&mut self);
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// ICE component whose candidates are known up front: host candidates on the
/// local interface and, once the client knows it, the server reflexive
/// address learned through STUN.
#[derive(Debug, Clone)]
pub struct StaticIceAgent {
    local_user: String,
    local_password: String,
    local_candidates: Vec<IceCandidate>,
    remote_user: Option<String>,
    remote_password: Option<String>,
    remote_candidates: Vec<IceCandidate>,
}

impl StaticIceAgent {
    /// Candidates for RTP on `rtp_port` and RTCP on `rtp_port + 1`.
    pub fn new(local_ip: IpAddr, rtp_port: u16, reflexive_ip: Option<IpAddr>) -> Self {
        let mut local_candidates = Vec::new();
        for component in [RTP_COMPONENT, RTCP_COMPONENT] {
            let host = SocketAddr::new(local_ip, rtp_port + component - 1);
            local_candidates.push(IceCandidate::new(CandidateType::Host, host, component));
            if let Some(ip) = reflexive_ip {
                let srflx = SocketAddr::new(ip, host.port());
                local_candidates.push(
                    IceCandidate::new(CandidateType::ServerReflexive, srflx, component)
                        .with_related_address(host),
                );
            }
        }

        Self {
            local_user: random_token(4),
            local_password: random_token(22),
            local_candidates,
            remote_user: None,
            remote_password: None,
            remote_candidates: Vec::new(),
        }
    }

    pub fn remote_user(&self) -> Option<&str> {
        self.remote_user.as_deref()
    }

    pub fn remote_password(&self) -> Option<&str> {
        self.remote_password.as_deref()
    }

    pub fn remote_candidates(&self) -> &[IceCandidate] {
        &self.remote_candidates
    }
}

impl IceComponent for StaticIceAgent {
    fn local_user(&self) -> String {
        self.local_user.clone()
    }

    fn local_password(&self) -> String {
        self.local_password.clone()
    }

    fn local_candidates(&self) -> Vec<IceCandidate> {
        self.local_candidates.clone()
    }

    fn set_remote_user(&mut self, user: &str) {
        self.remote_user = Some(user.to_string());
    }

    fn set_remote_password(&mut self, password: &str) {
        self.remote_password = Some(password.to_string());
    }

    fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        if !self.remote_candidates.contains(&candidate) {
            debug!("Adding remote candidate {}", candidate);
            self.remote_candidates.push(candidate);
        }
    }

    /// Forget the remote side. Local candidates stay valid for the port.
    fn close(&mut self) {
        debug!("Closing ICE session {}", self.local_user);
        self.remote_user = None;
        self.remote_password = None;
        self.remote_candidates.clear();
    }
}
