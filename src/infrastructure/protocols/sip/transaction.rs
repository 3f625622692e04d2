//! SIP client transactions
//!
//! A transaction owns one outbound request and resends its original bytes
//! until a final response arrives or the overall deadline (64*T1) passes.
//! Responses are matched by the branch of the top Via and the CSeq method,
//! since a CANCEL reuses the branch of the INVITE it cancels.
//!
//! ## States (RFC 3261 Section 17.1.2)
//! - Trying: request sent, retransmitting at T1, 2*T1, ... capped at T2
//! - Proceeding: provisional response seen, retransmitting every T2
//! - Completed: final response received
//! - Terminated: deadline passed without a final response

use super::message::SipMessage;
use super::reactor::{Outbox, TimerKey, TimerOwner, TimerPurpose, TimerWheel};
use bytes::Bytes;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// SIP Timers (RFC 3261 Section 17.1.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SipTimers {
    /// T1: RTT Estimate (default 500ms)
    pub t1: Duration,
    /// T2: Maximum retransmit interval (default 4s)
    pub t2: Duration,
}

impl SipTimers {
    /// Overall transaction deadline (Timer F)
    pub fn timeout(&self) -> Duration {
        self.t1 * 64
    }
}

impl Default for SipTimers {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

impl TransactionState {
    pub fn name(&self) -> &'static str {
        match self {
            TransactionState::Trying => "Trying",
            TransactionState::Proceeding => "Proceeding",
            TransactionState::Completed => "Completed",
            TransactionState::Terminated => "Terminated",
        }
    }
}

/// What a response did to a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// Not for us, or the transaction is already over
    Ignored,
    Provisional,
    Final,
}

#[derive(Debug, Clone)]
pub struct Transaction {
    request: SipMessage,
    payload: Bytes,
    branch: String,
    state: TransactionState,
    interval: Duration,
    timers: SipTimers,
}

impl Transaction {
    pub fn new(request: SipMessage, timers: SipTimers) -> Self {
        let branch = request.via_branch().unwrap_or_default();
        let payload = request.to_bytes();
        Self {
            request,
            payload,
            branch,
            state: TransactionState::Trying,
            interval: timers.t1,
            timers,
        }
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn request(&self) -> &SipMessage {
        &self.request
    }

    /// The bytes sent on every (re)transmission
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Whether `response` answers this transaction's request
    pub fn matches(&self, response: &SipMessage) -> bool {
        response.via_branch().as_deref() == Some(self.branch.as_str())
            && response.cseq_method() == self.request.method()
    }

    /// Delay until the next retransmission
    pub fn retry_interval(&self) -> Duration {
        self.interval
    }

    pub fn on_response(&mut self, response: &SipMessage) -> ResponseOutcome {
        let Some(code) = response.status_code() else {
            return ResponseOutcome::Ignored;
        };
        if matches!(self.state, TransactionState::Completed | TransactionState::Terminated) {
            return ResponseOutcome::Ignored;
        }

        if code < 200 {
            debug!("Transaction {} {} -> Proceeding", self.branch, self.state.name());
            self.state = TransactionState::Proceeding;
            self.interval = self.timers.t2;
            ResponseOutcome::Provisional
        } else {
            debug!("Transaction {} {} -> Completed", self.branch, self.state.name());
            self.state = TransactionState::Completed;
            ResponseOutcome::Final
        }
    }

    /// Bytes to resend, or None once the transaction is over. Advances the
    /// retry interval.
    pub fn retransmit(&mut self) -> Option<Bytes> {
        match self.state {
            TransactionState::Trying => {
                self.interval = (self.interval * 2).min(self.timers.t2);
            }
            TransactionState::Proceeding => self.interval = self.timers.t2,
            TransactionState::Completed | TransactionState::Terminated => return None,
        }
        Some(self.payload.clone())
    }

    pub fn terminate(&mut self) {
        self.state = TransactionState::Terminated;
    }
}

/// A transaction that reached Completed or Terminated
#[derive(Debug, Clone)]
pub struct FinishedTransaction {
    pub request: SipMessage,
    /// None when the deadline passed
    pub response: Option<SipMessage>,
}

/// The transactions of one owner, kept in step with the timer wheel
#[derive(Debug)]
pub struct TransactionSet {
    owner: TimerOwner,
    timers: SipTimers,
    active: Vec<Transaction>,
}

impl TransactionSet {
    pub fn new(owner: TimerOwner, timers: SipTimers) -> Self {
        Self {
            owner,
            timers,
            active: Vec::new(),
        }
    }

    fn key(&self, purpose: TimerPurpose) -> TimerKey {
        TimerKey::new(self.owner.clone(), purpose)
    }

    /// Send `request` and arm its retransmit and deadline timers
    pub fn start(&mut self, request: SipMessage, out: &mut Outbox, wheel: &mut TimerWheel, now: Instant) {
        let transaction = Transaction::new(request, self.timers);
        let branch = transaction.branch().to_string();
        info!(
            "Starting {} transaction {}",
            transaction.request().method().unwrap_or_default(),
            branch
        );

        out.send(transaction.payload().clone());
        wheel.schedule(
            self.key(TimerPurpose::Retransmit(branch.clone())),
            now + transaction.retry_interval(),
        );
        wheel.schedule(
            self.key(TimerPurpose::TransactionTimeout(branch)),
            now + self.timers.timeout(),
        );
        self.active.push(transaction);
    }

    /// Whether one of the running transactions sent the request `response` answers
    pub fn matches(&self, response: &SipMessage) -> bool {
        self.active.iter().any(|t| t.matches(response))
    }

    pub fn contains(&self, branch: &str) -> bool {
        self.active.iter().any(|t| t.branch() == branch)
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn handle_response(
        &mut self,
        response: &SipMessage,
        wheel: &mut TimerWheel,
        now: Instant,
    ) -> Option<FinishedTransaction> {
        let index = self.active.iter().position(|t| t.matches(response))?;
        let branch = self.active[index].branch().to_string();

        match self.active[index].on_response(response) {
            ResponseOutcome::Ignored => None,
            ResponseOutcome::Provisional => {
                let interval = self.active[index].retry_interval();
                wheel.schedule(self.key(TimerPurpose::Retransmit(branch)), now + interval);
                None
            }
            ResponseOutcome::Final => {
                let transaction = self.active.remove(index);
                wheel.cancel(&self.key(TimerPurpose::Retransmit(branch.clone())));
                wheel.cancel(&self.key(TimerPurpose::TransactionTimeout(branch)));
                Some(FinishedTransaction {
                    request: transaction.request,
                    response: Some(response.clone()),
                })
            }
        }
    }

    /// Handle a retransmit or deadline timer of this set
    pub fn handle_timer(
        &mut self,
        purpose: &TimerPurpose,
        out: &mut Outbox,
        wheel: &mut TimerWheel,
        now: Instant,
    ) -> Option<FinishedTransaction> {
        match purpose {
            TimerPurpose::Retransmit(branch) => {
                let transaction = self.active.iter_mut().find(|t| t.branch() == branch)?;
                let payload = transaction.retransmit()?;
                debug!("Retransmitting {}", branch);
                out.send(payload);
                let next = now + transaction.retry_interval();
                wheel.schedule(self.key(TimerPurpose::Retransmit(branch.clone())), next);
                None
            }
            TimerPurpose::TransactionTimeout(branch) => {
                let index = self.active.iter().position(|t| t.branch() == branch)?;
                let mut transaction = self.active.remove(index);
                transaction.terminate();
                warn!(
                    "{} transaction {} timed out",
                    transaction.request().method().unwrap_or_default(),
                    branch
                );
                wheel.cancel(&self.key(TimerPurpose::Retransmit(branch.clone())));
                Some(FinishedTransaction {
                    request: transaction.request,
                    response: None,
                })
            }
            _ => None,
        }
    }

    /// Abandon every transaction and its timers
    pub fn clear(&mut self, wheel: &mut TimerWheel) {
        for transaction in self.active.drain(..) {
            let branch = transaction.branch().to_string();
            wheel.cancel(&TimerKey::new(self.owner.clone(), TimerPurpose::Retransmit(branch.clone())));
            wheel.cancel(&TimerKey::new(self.owner.clone(), TimerPurpose::TransactionTimeout(branch)));
        }
    }
}
