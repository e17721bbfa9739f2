//! Client transactions awaiting a final response, keyed by CSeq.

use crate::utils::parse_cseq;
use crate::{SipError, SipMethod, SipRequest, SipResponse, SipResult};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// What a request was sent for. Completion is dispatched on this tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Register { expires: u32 },
    Subscribe { buddy: String },
    RoamingContacts,
    Publish,
    Message { peer: String },
    Notify { watcher: String },
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub request: SipRequest,
    pub cseq: u32,
    pub created: Instant,
    pub retries: u32,
    /// Authenticated resends answered with another challenge.
    pub auth_attempts: u32,
    pub intent: Intent,
}

impl Transaction {
    pub fn method(&self) -> &SipMethod {
        &self.request.method
    }

    /// Restarts the retransmission clock after an authenticated resend.
    pub fn restart(&mut self, now: Instant) {
        self.created = now;
        self.retries = 0;
    }
}

/// Retransmission policy. Stream transports never resend, they only
/// give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionTimers {
    pub resend_after: Option<Duration>,
    pub give_up_after: Duration,
    pub max_resends: u32,
}

impl TransactionTimers {
    pub fn unreliable() -> Self {
        Self {
            resend_after: Some(Duration::from_secs(2)),
            give_up_after: Duration::from_secs(5),
            max_resends: 1,
        }
    }

    pub fn reliable() -> Self {
        Self {
            resend_after: None,
            give_up_after: Duration::from_secs(32),
            max_resends: 0,
        }
    }
}

impl Default for TransactionTimers {
    fn default() -> Self {
        Self::unreliable()
    }
}

#[derive(Debug, Default)]
pub struct SweepOutcome {
    pub resend: Vec<SipRequest>,
    pub timed_out: Vec<Transaction>,
}

#[derive(Debug)]
pub enum ResponseDisposition {
    /// No live transaction carries this CSeq.
    Unmatched,
    /// 1xx: the transaction stays open.
    Provisional,
    /// 401/407: the transaction stays open for an authenticated resend.
    Challenged { cseq: u32 },
    /// Final response: the transaction was removed and is handed back once.
    Completed(Transaction),
}

#[derive(Debug, Default)]
pub struct TransactionTable {
    transactions: Vec<Transaction>,
    timers: TransactionTimers,
}

impl TransactionTable {
    pub fn new(timers: TransactionTimers) -> Self {
        Self {
            transactions: Vec::new(),
            timers,
        }
    }

    pub fn set_timers(&mut self, timers: TransactionTimers) {
        self.timers = timers;
    }

    /// Tracks a sent request. Returns its CSeq number.
    pub fn register(&mut self, request: SipRequest, intent: Intent, now: Instant) -> SipResult<u32> {
        let (cseq, _) = request
            .headers
            .get("CSeq")
            .and_then(parse_cseq)
            .ok_or_else(|| SipError::InvalidState("request without a valid CSeq".to_string()))?;

        if let Some(pos) = self.transactions.iter().position(|t| t.cseq == cseq) {
            warn!("Replacing live transaction with CSeq {}", cseq);
            self.transactions.remove(pos);
        }

        debug!("Tracking {} {} as CSeq {}", request.method, request.uri, cseq);
        self.transactions.push(Transaction {
            request,
            cseq,
            created: now,
            retries: 0,
            auth_attempts: 0,
            intent,
        });
        Ok(cseq)
    }

    pub fn find_by_cseq(&self, cseq: u32) -> Option<&Transaction> {
        self.transactions.iter().find(|t| t.cseq == cseq)
    }

    pub fn find_by_cseq_mut(&mut self, cseq: u32) -> Option<&mut Transaction> {
        self.transactions.iter_mut().find(|t| t.cseq == cseq)
    }

    pub fn remove(&mut self, cseq: u32) -> Option<Transaction> {
        let pos = self.transactions.iter().position(|t| t.cseq == cseq)?;
        Some(self.transactions.remove(pos))
    }

    /// Matches a response to its transaction by CSeq number and method.
    pub fn classify(&mut self, response: &SipResponse) -> ResponseDisposition {
        let Some((cseq, method)) = response.headers.get("CSeq").and_then(parse_cseq) else {
            return ResponseDisposition::Unmatched;
        };

        match self.find_by_cseq(cseq) {
            Some(transaction) if *transaction.method() == method => {}
            _ => return ResponseDisposition::Unmatched,
        }

        match response.status_code {
            100..=199 => ResponseDisposition::Provisional,
            401 | 407 => ResponseDisposition::Challenged { cseq },
            _ => match self.remove(cseq) {
                Some(transaction) => ResponseDisposition::Completed(transaction),
                None => ResponseDisposition::Unmatched,
            },
        }
    }

    /// Resends requests idle past the first threshold and expires those
    /// that stayed unanswered after their resends.
    pub fn sweep(&mut self, now: Instant) -> SweepOutcome {
        let timers = self.timers;
        let mut outcome = SweepOutcome::default();

        let mut index = 0;
        while index < self.transactions.len() {
            let transaction = &mut self.transactions[index];
            let age = now.saturating_duration_since(transaction.created);

            if transaction.retries < timers.max_resends
                && timers.resend_after.is_some_and(|after| age > after)
            {
                transaction.retries += 1;
                debug!(
                    "Resending {} (CSeq {}) after {:?}",
                    transaction.request.method, transaction.cseq, age
                );
                outcome.resend.push(transaction.request.clone());
            } else if transaction.retries >= timers.max_resends && age > timers.give_up_after {
                let transaction = self.transactions.remove(index);
                warn!(
                    "{} {} (CSeq {}) timed out",
                    transaction.request.method, transaction.request.uri, transaction.cseq
                );
                outcome.timed_out.push(transaction);
                continue;
            }
            index += 1;
        }

        outcome
    }

    /// Drops every transaction without completing any of them.
    pub fn clear(&mut self) -> usize {
        let dropped = self.transactions.len();
        self.transactions.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}
