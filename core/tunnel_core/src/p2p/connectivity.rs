//! Connectivity checks over candidate pairs
//!
//! Implements ICE-style connectivity checks using binding requests/responses
//! to verify reachability between candidate pairs.
//!
//! # Protocol Overview
//!
//! ```text
//! Controlling                                         Controlled
//!   │                                                    │
//!   │── BindingRequest (txn_id, sender, negotiation) ──►│
//!   │                                                    │
//!   │◄── BindingResponse (txn_id, sender, mapped) ──────│
//!   │                                                    │
//!   │   (round trip confirmed: pair succeeded)           │
//! ```
//!
//! Requests carry the sender's PeerId and negotiation id; the receiver only
//! answers requests belonging to a negotiation it knows about.
//!
//! # Candidate Pair Priority (RFC 8445 Section 6.1.2.3)
//!
//! ```text
//! pair_priority = 2^32 * MIN(G,D) + 2 * MAX(G,D) + (G > D ? 1 : 0)
//! ```
//! where G = controlling agent priority, D = controlled agent priority

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::candidate::Candidate;
use super::transaction::{Transaction, TransactionId, TransactionPoll};
use super::Path;
use crate::wire::{self, CodecError, TYPE_BINDING};
use crate::PeerId;

// ============================================================================
// Binding Messages
// ============================================================================

/// Binding request sent to verify connectivity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRequest {
    pub transaction_id: TransactionId,
    pub sender: PeerId,
    pub negotiation_id: u64,
    /// Priority of the candidate pair
    pub priority: u64,
}

/// Binding response confirming connectivity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingResponse {
    /// Transaction ID from the request
    pub transaction_id: TransactionId,
    pub sender: PeerId,
    pub negotiation_id: u64,
    /// Source address of the request as seen by the responder
    pub mapped_address: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindingMessage {
    Request(BindingRequest),
    Response(BindingResponse),
}

impl BindingRequest {
    /// Build the response to this request
    pub fn respond(&self, sender: PeerId, mapped_address: SocketAddr) -> BindingResponse {
        BindingResponse {
            transaction_id: self.transaction_id,
            sender,
            negotiation_id: self.negotiation_id,
            mapped_address,
        }
    }
}

pub fn encode_binding(msg: &BindingMessage) -> Result<Vec<u8>, CodecError> {
    wire::encode_typed(TYPE_BINDING, msg)
}

pub fn decode_binding(packet: &[u8]) -> Result<BindingMessage, CodecError> {
    wire::decode_typed(TYPE_BINDING, packet)
}

// ============================================================================
// Candidate Pairs
// ============================================================================

/// State of a connectivity check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    /// Waiting to be scheduled
    Waiting,
    /// Request sent, awaiting response
    InProgress,
    Succeeded,
    Failed,
}

/// A pair of local and remote candidates for connectivity checking
#[derive(Debug, Clone)]
pub struct CandidatePair {
    pub local: Candidate,
    pub remote: Candidate,
    /// Pair priority (higher = try first)
    pub priority: u64,
    pub state: CheckState,
    txn: Option<Transaction>,
    /// When the check succeeded
    pub succeeded_at: Option<Instant>,
}

impl CandidatePair {
    pub fn new(local: Candidate, remote: Candidate, is_controlling: bool) -> Self {
        let priority = calculate_pair_priority(local.priority, remote.priority, is_controlling);

        Self {
            local,
            remote,
            priority,
            state: CheckState::Waiting,
            txn: None,
            succeeded_at: None,
        }
    }

    /// The path a check for this pair travels
    ///
    /// Server-reflexive locals send from their host base, so they share the
    /// direct path.
    pub fn path(&self) -> Path {
        if self.local.is_relayed() {
            Path::relayed(self.remote.address, self.local.address)
        } else {
            Path::direct(self.remote.address)
        }
    }

    /// Either side goes through a relay
    pub fn is_relayed(&self) -> bool {
        self.local.is_relayed() || self.remote.is_relayed()
    }

    fn is_active(&self) -> bool {
        matches!(self.state, CheckState::Waiting | CheckState::InProgress)
    }
}

/// Calculate pair priority per RFC 8445 Section 6.1.2.3
///
/// Formula: 2^32 * MIN(G,D) + 2 * MAX(G,D) + (G > D ? 1 : 0)
/// where G = controlling priority, D = controlled priority
pub fn calculate_pair_priority(local_priority: u32, remote_priority: u32, is_controlling: bool) -> u64 {
    let (g, d) = if is_controlling {
        (local_priority as u64, remote_priority as u64)
    } else {
        (remote_priority as u64, local_priority as u64)
    };

    let min = g.min(d);
    let max = g.max(d);
    let tie_breaker = if g > d { 1u64 } else { 0u64 };

    (1u64 << 32) * min + 2 * max + tie_breaker
}

// ============================================================================
// Check List
// ============================================================================

/// Limits applied to one peer's checks
#[derive(Debug, Clone, Copy)]
pub struct CheckLimits {
    /// Checks allowed in flight at once
    pub max_in_flight: usize,
    /// Transmissions per check
    pub max_attempts: u32,
    /// Deadline per check
    pub timeout: Duration,
}

/// Manages all candidate pairs of one negotiation and their checks
#[derive(Debug)]
pub struct CheckList {
    /// All candidate pairs, sorted by priority
    pairs: Vec<CandidatePair>,
    sender: PeerId,
    negotiation_id: u64,
    is_controlling: bool,
    limits: CheckLimits,
}

impl CheckList {
    pub fn new(sender: PeerId, negotiation_id: u64, is_controlling: bool, limits: CheckLimits) -> Self {
        Self {
            pairs: Vec::new(),
            sender,
            negotiation_id,
            is_controlling,
            limits,
        }
    }

    /// Pair every local with every remote candidate of the same IP family
    ///
    /// Pairs that would check a path already on the list are skipped.
    pub fn add_pairs(&mut self, local_candidates: &[Candidate], remote_candidates: &[Candidate]) {
        let mut new_pairs = Vec::new();

        for local in local_candidates {
            for remote in remote_candidates {
                if local.address.is_ipv4() != remote.address.is_ipv4() {
                    continue;
                }
                new_pairs.push(CandidatePair::new(local.clone(), remote.clone(), self.is_controlling));
            }
        }

        new_pairs.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut paths: HashSet<Path> = self.pairs.iter().map(|p| p.path()).collect();
        for pair in new_pairs {
            if paths.insert(pair.path()) {
                self.pairs.push(pair);
            }
        }

        // Stable sort keeps insertion order for equal priorities
        self.pairs.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Drop every pair using this remote candidate
    pub fn remove_remote(&mut self, remote: &SocketAddr) -> usize {
        let before = self.pairs.len();
        self.pairs.retain(|p| p.remote.address != *remote);
        before - self.pairs.len()
    }

    /// Drop every pair using this local candidate
    pub fn remove_local(&mut self, local: &SocketAddr) -> usize {
        let before = self.pairs.len();
        self.pairs.retain(|p| p.local.address != *local);
        before - self.pairs.len()
    }

    /// Next binding request to send (retransmissions first), if any
    pub fn poll_check(&mut self, now: Instant) -> Option<(Path, BindingRequest)> {
        let mut in_flight = 0;

        for pair in self.pairs.iter_mut() {
            if pair.state != CheckState::InProgress {
                continue;
            }
            let Some(txn) = pair.txn.as_mut() else {
                continue;
            };

            match txn.poll(now) {
                TransactionPoll::Pending => in_flight += 1,
                TransactionPoll::Retransmit => {
                    let request = BindingRequest {
                        transaction_id: txn.id(),
                        sender: self.sender,
                        negotiation_id: self.negotiation_id,
                        priority: pair.priority,
                    };
                    return Some((pair.path(), request));
                }
                TransactionPoll::TimedOut => {
                    log::debug!("Check {} timed out", pair.path());
                    pair.state = CheckState::Failed;
                    pair.txn = None;
                }
            }
        }

        if in_flight >= self.limits.max_in_flight {
            return None;
        }

        let pair = self.pairs.iter_mut().find(|p| p.state == CheckState::Waiting)?;
        let Some(txn) = Transaction::start(now, self.limits.max_attempts, self.limits.timeout) else {
            log::error!("No randomness for a transaction id, holding check {}", pair.path());
            return None;
        };
        let request = BindingRequest {
            transaction_id: txn.id(),
            sender: self.sender,
            negotiation_id: self.negotiation_id,
            priority: pair.priority,
        };
        pair.state = CheckState::InProgress;
        pair.txn = Some(txn);

        Some((pair.path(), request))
    }

    /// Handle a binding response that arrived on `path`
    ///
    /// Returns the index of the pair that succeeded. Responses must come
    /// back on the path the request used.
    pub fn handle_response(&mut self, response: &BindingResponse, path: Path, now: Instant) -> Option<usize> {
        let idx = self.pairs.iter().position(|p| {
            p.state == CheckState::InProgress
                && p.txn.as_ref().map(|t| t.id()) == Some(response.transaction_id)
        })?;

        let pair = &mut self.pairs[idx];
        if pair.path() != path {
            log::debug!("Response for {} arrived on {}, ignoring", pair.path(), path);
            return None;
        }

        pair.state = CheckState::Succeeded;
        pair.txn = None;
        pair.succeeded_at = Some(now);
        Some(idx)
    }

    /// Earliest retransmit or deadline among in-flight checks
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.pairs
            .iter()
            .filter_map(|p| p.txn.as_ref())
            .map(|t| t.next_timeout())
            .min()
    }

    /// Whether there is a check ready to start right now
    pub fn has_waiting(&self) -> bool {
        self.pairs.iter().any(|p| p.state == CheckState::Waiting)
    }

    /// Best succeeded pair, optionally restricted to non-relayed pairs
    pub fn best_succeeded(&self, direct_only: bool) -> Option<&CandidatePair> {
        self.pairs
            .iter()
            .filter(|p| p.state == CheckState::Succeeded)
            .filter(|p| !direct_only || !p.is_relayed())
            .max_by_key(|p| p.priority)
    }

    /// Cancel every check still waiting or in flight
    pub fn cancel_remaining(&mut self) -> usize {
        let mut cancelled = 0;
        for pair in self.pairs.iter_mut().filter(|p| p.is_active()) {
            pair.state = CheckState::Failed;
            pair.txn = None;
            cancelled += 1;
        }
        cancelled
    }

    /// Every pair has reached a final state
    pub fn is_complete(&self) -> bool {
        self.pairs.iter().all(|p| !p.is_active())
    }

    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    pub fn pairs_by_state(&self, state: CheckState) -> impl Iterator<Item = &CandidatePair> {
        self.pairs.iter().filter(move |p| p.state == state)
    }

    pub fn get_pair(&self, index: usize) -> Option<&CandidatePair> {
        self.pairs.get(index)
    }
}

// ============================================================================
// Tests
// ============================================================================
