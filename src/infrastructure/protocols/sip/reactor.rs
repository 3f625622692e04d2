//! Scheduled events and outbound queues shared by the client and its calls
//!
//! Every timer is a single entry keyed by owner and purpose. Scheduling a
//! key that is already pending moves it, so one logical timer never runs
//! twice at once.

use crate::domain::ClientEvent;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerOwner {
    Client,
    Call(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerPurpose {
    /// Retransmit the request of the transaction with this branch
    Retransmit(String),
    /// Overall deadline of the transaction with this branch
    TransactionTimeout(String),
    /// Outgoing INVITE got no final response, or incoming 200 OK got no ACK
    InviteTimeout,
    /// Renew the registration
    Register,
    /// Retry connecting after a failure
    ConnectRetry,
    /// Send the next STUN binding request
    StunRefresh,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub owner: TimerOwner,
    pub purpose: TimerPurpose,
}

impl TimerKey {
    pub fn new(owner: TimerOwner, purpose: TimerPurpose) -> Self {
        Self { owner, purpose }
    }
}

#[derive(Debug, Default)]
pub struct TimerWheel {
    deadlines: HashMap<TimerKey, Instant>,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `key` at `at`, replacing any pending deadline for it
    pub fn schedule(&mut self, key: TimerKey, at: Instant) {
        debug!("Timer {:?} armed", key);
        self.deadlines.insert(key, at);
    }

    pub fn cancel(&mut self, key: &TimerKey) {
        self.deadlines.remove(key);
    }

    /// Drop every timer of `owner`
    pub fn cancel_owner(&mut self, owner: &TimerOwner) {
        self.deadlines.retain(|key, _| &key.owner != owner);
    }

    pub fn deadline(&self, key: &TimerKey) -> Option<Instant> {
        self.deadlines.get(key).copied()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return the earliest timer due at `now`
    pub fn pop_expired(&mut self, now: Instant) -> Option<TimerKey> {
        let key = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .min_by_key(|(_, at)| **at)
            .map(|(key, _)| key.clone())?;
        self.deadlines.remove(&key);
        Some(key)
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

/// Datagrams and events produced while handling one input
#[derive(Debug, Default)]
pub struct Outbox {
    sip: VecDeque<Bytes>,
    events: VecDeque<ClientEvent>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a SIP datagram for the server
    pub fn send(&mut self, data: Bytes) {
        self.sip.push_back(data);
    }

    pub fn emit(&mut self, event: ClientEvent) {
        self.events.push_back(event);
    }

    pub fn pop_sip(&mut self) -> Option<Bytes> {
        self.sip.pop_front()
    }

    pub fn pop_event(&mut self) -> Option<ClientEvent> {
        self.events.pop_front()
    }
}
