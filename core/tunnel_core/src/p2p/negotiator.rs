//! Per-peer connectivity negotiation
//!
//! Drives one peer from gathered candidates to a selected path.
//!
//! # State Machine
//!
//! ```text
//! Gathering ──(local complete + remote candidates)──► Checking ──(selected)──► Connected
//!     │                                                  │                        │
//!     └──(no remote candidates in time)──► Failed ◄──(deadline)──┘                │
//!                                                                                 │
//! Gathering ◄─────────────────────(path failed: fresh candidates)─────────────────┘
//! ```
//!
//! Only the controlling side selects. The first succeeding pair wins unless
//! it is relayed, in which case non-relayed pairs succeeding within the
//! grace window take precedence. The controlled side adopts whichever path
//! a valid handshake arrives on (`nominate`). There is no automatic exit
//! from `Failed`.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::candidate::Candidate;
use super::connectivity::{BindingRequest, BindingResponse, CheckLimits, CheckList};
use super::Path;
use crate::error::{Classify, ErrorClass};
use crate::PeerId;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Gathering,
    Checking,
    Connected,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationError {
    /// The peer never sent candidates
    NoRemoteCandidates,
    /// No pair succeeded before the deadline
    ChecksFailed,
}

impl fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationError::NoRemoteCandidates => write!(f, "no remote candidates received"),
            NegotiationError::ChecksFailed => write!(f, "all connectivity checks failed"),
        }
    }
}

impl std::error::Error for NegotiationError {}

impl Classify for NegotiationError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Transient
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationEvent {
    PathSelected(Path),
    Failed(NegotiationError),
}

#[derive(Debug, Clone, Copy)]
pub struct NegotiationConfig {
    /// Fail if the peer sends no candidates within this window
    pub candidate_timeout: Duration,
    /// Fail if checking yields no path within this window
    pub check_timeout: Duration,
    /// How long a relayed success waits for a direct one
    pub grace_window: Duration,
    pub limits: CheckLimits,
}

// ============================================================================
// Negotiation
// ============================================================================

#[derive(Debug)]
pub struct Negotiation {
    peer: PeerId,
    id: u64,
    is_controlling: bool,
    state: NegotiationState,
    config: NegotiationConfig,
    local: Vec<Candidate>,
    remote: Vec<Candidate>,
    local_complete: bool,
    checklist: CheckList,
    local_id: PeerId,
    started_at: Instant,
    checking_since: Option<Instant>,
    grace_deadline: Option<Instant>,
    selected: Option<Path>,
    events: VecDeque<NegotiationEvent>,
}

impl Negotiation {
    pub fn new(
        local_id: PeerId,
        peer: PeerId,
        id: u64,
        is_controlling: bool,
        config: NegotiationConfig,
        now: Instant,
    ) -> Self {
        Self {
            peer,
            id,
            is_controlling,
            state: NegotiationState::Gathering,
            config,
            local: Vec::new(),
            remote: Vec::new(),
            local_complete: false,
            checklist: CheckList::new(local_id, id, is_controlling, config.limits),
            local_id,
            started_at: now,
            checking_since: None,
            grace_deadline: None,
            selected: None,
            events: VecDeque::new(),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_controlling(&self) -> bool {
        self.is_controlling
    }

    pub fn selected_path(&self) -> Option<Path> {
        self.selected
    }

    /// Local gathering finished and candidates were handed over
    pub fn has_local_candidates(&self) -> bool {
        self.local_complete
    }

    pub fn local_candidates(&self) -> &[Candidate] {
        &self.local
    }

    pub fn remote_candidates(&self) -> &[Candidate] {
        &self.remote
    }

    /// Complete local candidate set from a finished gather cycle
    pub fn set_local_candidates(&mut self, candidates: Vec<Candidate>, now: Instant) {
        if self.state != NegotiationState::Gathering {
            return;
        }
        self.local = candidates;
        self.local_complete = true;
        self.checklist.add_pairs(&self.local, &self.remote);
        self.maybe_start_checking(now);
    }

    /// A local candidate discovered after the cycle completed
    pub fn add_local_candidate(&mut self, candidate: Candidate) {
        if !self.local_complete || self.local.contains(&candidate) || self.is_finished() {
            return;
        }
        self.checklist.add_pairs(std::slice::from_ref(&candidate), &self.remote);
        self.local.push(candidate);
    }

    pub fn remove_local_candidate(&mut self, candidate: &Candidate) {
        self.local.retain(|c| c != candidate);
        self.checklist.remove_local(&candidate.address);
    }

    pub fn add_remote_candidates(&mut self, candidates: &[Candidate], now: Instant) {
        if self.state == NegotiationState::Failed {
            return;
        }

        let new: Vec<Candidate> = candidates
            .iter()
            .filter(|c| !self.remote.contains(c))
            .cloned()
            .collect();
        if new.is_empty() {
            return;
        }

        log::debug!("Peer {}: {} new remote candidates", self.peer, new.len());
        if self.local_complete && self.state != NegotiationState::Connected {
            self.checklist.add_pairs(&self.local, &new);
        }
        self.remote.extend(new);
        self.maybe_start_checking(now);
    }

    /// Remove remote candidates the peer no longer offers
    pub fn invalidate_remote(&mut self, candidates: &[Candidate]) {
        for candidate in candidates {
            self.remote.retain(|c| c.address != candidate.address);
            let removed = self.checklist.remove_remote(&candidate.address);
            if removed > 0 {
                log::debug!("Peer {}: dropped {} pairs for {}", self.peer, removed, candidate.address);
            }
        }
    }

    pub fn remote_addresses(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.remote.iter().map(|c| c.address)
    }

    /// Next connectivity check to send
    pub fn poll_check(&mut self, now: Instant) -> Option<(Path, BindingRequest)> {
        if self.state != NegotiationState::Checking {
            return None;
        }
        self.checklist.poll_check(now)
    }

    /// Whether a binding request belongs to this negotiation
    pub fn accepts(&self, request: &BindingRequest) -> bool {
        request.sender == self.peer && request.negotiation_id == self.id && self.state != NegotiationState::Failed
    }

    pub fn handle_response(&mut self, response: &BindingResponse, path: Path, now: Instant) {
        if self.state != NegotiationState::Checking
            || response.sender != self.peer
            || response.negotiation_id != self.id
        {
            return;
        }

        let Some(idx) = self.checklist.handle_response(response, path, now) else {
            return;
        };
        log::debug!("Peer {}: check succeeded on {}", self.peer, path);

        if !self.is_controlling || self.selected.is_some() {
            return;
        }

        let relayed = self
            .checklist
            .get_pair(idx)
            .map(|p| p.is_relayed())
            .unwrap_or(true);

        if !relayed {
            self.select(path);
        } else if self.grace_deadline.is_none() {
            self.grace_deadline = Some(now + self.config.grace_window);
        }
    }

    /// Adopt the path a valid handshake arrived on (controlled side)
    pub fn nominate(&mut self, path: Path) {
        if self.state == NegotiationState::Failed || self.selected == Some(path) {
            return;
        }
        self.select(path);
    }

    /// The selected path went silent: gather again and re-check
    pub fn path_failed(&mut self, now: Instant) {
        if self.state != NegotiationState::Connected {
            return;
        }
        log::info!("Peer {}: path failed, renegotiating", self.peer);

        self.state = NegotiationState::Gathering;
        self.selected = None;
        self.grace_deadline = None;
        self.checking_since = None;
        self.local.clear();
        self.local_complete = false;
        self.started_at = now;
        self.checklist = CheckList::new(self.local_id, self.id, self.is_controlling, self.config.limits);
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        match self.state {
            NegotiationState::Gathering | NegotiationState::Checking if self.remote.is_empty() => {
                if now >= self.started_at + self.config.candidate_timeout {
                    self.fail(NegotiationError::NoRemoteCandidates);
                }
            }
            NegotiationState::Checking => {
                // Retransmissions are driven by `poll_check`
                if let Some(deadline) = self.grace_deadline {
                    if now >= deadline {
                        let best = self
                            .checklist
                            .best_succeeded(true)
                            .or_else(|| self.checklist.best_succeeded(false))
                            .map(|p| p.path());
                        if let Some(path) = best {
                            self.select(path);
                            return;
                        }
                    }
                }

                if let Some(since) = self.checking_since {
                    if now >= since + self.config.check_timeout && self.selected.is_none() {
                        self.fail(NegotiationError::ChecksFailed);
                    }
                }
            }
            _ => {}
        }
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        match self.state {
            NegotiationState::Gathering | NegotiationState::Checking if self.remote.is_empty() => {
                Some(self.started_at + self.config.candidate_timeout)
            }
            NegotiationState::Checking => {
                let check_deadline = self.checking_since.map(|since| since + self.config.check_timeout);
                [self.checklist.poll_timeout(), self.grace_deadline, check_deadline]
                    .into_iter()
                    .flatten()
                    .min()
            }
            _ => None,
        }
    }

    pub fn poll_event(&mut self) -> Option<NegotiationEvent> {
        self.events.pop_front()
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn is_finished(&self) -> bool {
        matches!(self.state, NegotiationState::Connected | NegotiationState::Failed)
    }

    fn maybe_start_checking(&mut self, now: Instant) {
        if self.state == NegotiationState::Gathering && self.local_complete && !self.remote.is_empty() {
            log::debug!(
                "Peer {}: checking {} pairs",
                self.peer,
                self.checklist.pair_count()
            );
            self.state = NegotiationState::Checking;
            self.checking_since = Some(now);
        }
    }

    fn select(&mut self, path: Path) {
        let cancelled = self.checklist.cancel_remaining();
        log::info!(
            "Peer {}: selected {} ({} checks cancelled)",
            self.peer,
            path,
            cancelled
        );
        self.state = NegotiationState::Connected;
        self.selected = Some(path);
        self.grace_deadline = None;
        self.events.push_back(NegotiationEvent::PathSelected(path));
    }

    fn fail(&mut self, error: NegotiationError) {
        log::warn!("Peer {}: negotiation failed: {}", self.peer, error);
        self.checklist.cancel_remaining();
        self.state = NegotiationState::Failed;
        self.events.push_back(NegotiationEvent::Failed(error));
    }
}

// ============================================================================
// Tests
// ============================================================================
