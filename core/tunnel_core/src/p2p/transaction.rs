//! Bounded request/response transactions
//!
//! Every request the engine puts on the wire (binding requests to the
//! reflexive-address service, relay control requests, connectivity checks,
//! handshake initiations) is driven by the same state machine:
//!
//! ```text
//!   start ──► Pending ──(response)──► done (caller drops it)
//!               │  ▲
//!     rto fires │  │ retransmit, rto doubles up to MAX_RTO
//!               ▼  │
//!             Retransmit
//!               │
//!               └──(attempts exhausted or deadline)──► TimedOut
//! ```

use std::time::{Duration, Instant};

// ============================================================================
// Constants
// ============================================================================

/// Size of transaction ID in bytes
pub const TRANSACTION_ID_LEN: usize = 12;

/// Initial retransmit interval
pub const INITIAL_RTO: Duration = Duration::from_millis(100);

/// Maximum retransmit interval
pub const MAX_RTO: Duration = Duration::from_millis(1600);

/// Default maximum number of transmissions per transaction
pub const MAX_RETRANSMITS: u32 = 5;

pub type TransactionId = [u8; TRANSACTION_ID_LEN];

/// Generate a random transaction ID using CSPRNG
pub fn generate_transaction_id() -> Option<TransactionId> {
    use ring::rand::{SecureRandom, SystemRandom};
    let mut id = [0u8; TRANSACTION_ID_LEN];
    SystemRandom::new().fill(&mut id).ok()?;
    Some(id)
}

// ============================================================================
// Transaction
// ============================================================================

/// What the owner of a transaction has to do after polling it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPoll {
    /// Nothing due yet
    Pending,
    /// Send the request again
    Retransmit,
    /// Give up: attempts exhausted or deadline passed
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct Transaction {
    id: TransactionId,
    attempts: u32,
    max_attempts: u32,
    next_retransmit: Instant,
    deadline: Instant,
}

impl Transaction {
    /// Start a transaction whose first transmission happens at `now`
    ///
    /// `None` if no random id could be drawn.
    pub fn start(now: Instant, max_attempts: u32, timeout: Duration) -> Option<Self> {
        let id = generate_transaction_id()?;
        Some(Self::with_id(id, now, max_attempts, timeout))
    }

    pub fn with_id(id: TransactionId, now: Instant, max_attempts: u32, timeout: Duration) -> Self {
        Self {
            id,
            attempts: 1,
            max_attempts: max_attempts.max(1),
            next_retransmit: now + INITIAL_RTO,
            deadline: now + timeout,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Number of transmissions so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Current retransmit timeout (exponential backoff)
    pub fn current_rto(&self) -> Duration {
        let multiplier = 1u32 << self.attempts.min(5);
        (INITIAL_RTO * multiplier / 2).min(MAX_RTO)
    }

    /// Advance the state machine to `now`
    pub fn poll(&mut self, now: Instant) -> TransactionPoll {
        if now >= self.deadline {
            return TransactionPoll::TimedOut;
        }

        if now < self.next_retransmit {
            return TransactionPoll::Pending;
        }

        if self.attempts >= self.max_attempts {
            return TransactionPoll::TimedOut;
        }

        self.attempts += 1;
        self.next_retransmit = now + self.current_rto();
        TransactionPoll::Retransmit
    }

    /// When `poll` next has something to do
    pub fn next_timeout(&self) -> Instant {
        self.next_retransmit.min(self.deadline)
    }
}

// ============================================================================
// Tests
// ============================================================================
