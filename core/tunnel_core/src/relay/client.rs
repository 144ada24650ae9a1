//! Relay client
//!
//! Sans-IO state machine holding one allocation on one relay server. It keeps
//! the allocation alive (refresh at half lifetime), creates and refreshes
//! permissions, binds channels for peers that carry traffic, and wraps /
//! unwraps relayed datagrams.
//!
//! ```text
//!  Allocating ──(AllocateResponse)──► Allocated ──(release / lost)──► Released
//!      │                                  │
//!      └──(error / timeout)───────────────┴──────────────────────────► Released
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::message::{
    encode_channel_data, encode_relay, AllocationId, RelayBody, RelayErrorCode, RelayMessage,
    CHANNEL_MAX, CHANNEL_MIN,
};
use crate::error::{Classify, ErrorClass};
use crate::p2p::transaction::{Transaction, TransactionId, TransactionPoll};
use crate::Transmit;

// ============================================================================
// Constants
// ============================================================================

/// Lifetime requested for new allocations
pub const DEFAULT_ALLOCATION_LIFETIME_SECS: u32 = 600;

// ============================================================================
// Errors and Events
// ============================================================================

/// Why an allocation could not be obtained or was lost
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayClientError {
    /// No answer within the transaction deadline
    Timeout,
    /// The relay answered with an error
    Rejected(RelayErrorCode),
    /// The allocation expired or the relay forgot it
    Lost,
}

impl fmt::Display for RelayClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayClientError::Timeout => write!(f, "relay request timed out"),
            RelayClientError::Rejected(code) => write!(f, "relay rejected request: {}", code),
            RelayClientError::Lost => write!(f, "allocation lost"),
        }
    }
}

impl std::error::Error for RelayClientError {}

impl Classify for RelayClientError {
    fn class(&self) -> ErrorClass {
        match self {
            RelayClientError::Timeout | RelayClientError::Lost => ErrorClass::Transient,
            RelayClientError::Rejected(code) => code.class(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Allocated { relayed: SocketAddr, mapped: SocketAddr },
    AllocationFailed(RelayClientError),
    /// A previously usable relayed address is gone
    Lost { relayed: SocketAddr },
}

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllocationState {
    Allocating,
    Allocated {
        id: AllocationId,
        relayed: SocketAddr,
        mapped: SocketAddr,
        refresh_at: Instant,
        expires_at: Instant,
        releasing: bool,
    },
    Released,
}

/// Permission or channel lifetime bookkeeping
#[derive(Debug, Clone, Copy, Default)]
struct Lease {
    /// None until the relay confirmed
    refresh_at: Option<Instant>,
    pending: bool,
}

#[derive(Debug, Clone, Copy)]
struct Channel {
    number: u16,
    confirmed: bool,
    lease: Lease,
}

#[derive(Debug)]
struct Pending {
    body: RelayBody,
    txn: Transaction,
}

#[derive(Debug)]
pub struct RelayClient {
    server: SocketAddr,
    state: AllocationState,
    lifetime_secs: u32,
    max_attempts: u32,
    request_timeout: Duration,
    permissions: HashMap<SocketAddr, Lease>,
    channels: HashMap<SocketAddr, Channel>,
    peers_by_channel: HashMap<u16, SocketAddr>,
    next_channel: u16,
    pending: HashMap<TransactionId, Pending>,
    transmits: VecDeque<Transmit>,
    events: VecDeque<RelayEvent>,
}

impl RelayClient {
    /// Start allocating on `server`
    pub fn allocate(
        server: SocketAddr,
        lifetime_secs: u32,
        max_attempts: u32,
        request_timeout: Duration,
        now: Instant,
    ) -> Self {
        let mut client = Self {
            server,
            state: AllocationState::Allocating,
            lifetime_secs,
            max_attempts,
            request_timeout,
            permissions: HashMap::new(),
            channels: HashMap::new(),
            peers_by_channel: HashMap::new(),
            next_channel: CHANNEL_MIN,
            pending: HashMap::new(),
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        };

        log::debug!("Allocating on relay {}", server);
        client.send_request(RelayBody::AllocateRequest { lifetime_secs }, now);
        client
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn relayed_address(&self) -> Option<SocketAddr> {
        match self.state {
            AllocationState::Allocated { relayed, .. } => Some(relayed),
            _ => None,
        }
    }

    /// Our transport address as seen by the relay
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        match self.state {
            AllocationState::Allocated { mapped, .. } => Some(mapped),
            _ => None,
        }
    }

    pub fn allocation_id(&self) -> Option<AllocationId> {
        match self.state {
            AllocationState::Allocated { id, .. } => Some(id),
            _ => None,
        }
    }

    /// Allocated and not being torn down
    pub fn is_usable(&self) -> bool {
        matches!(self.state, AllocationState::Allocated { releasing: false, .. })
    }

    pub fn is_allocating(&self) -> bool {
        self.state == AllocationState::Allocating
    }

    pub fn is_released(&self) -> bool {
        self.state == AllocationState::Released
    }

    /// Whether a response with this transaction ID belongs to us
    pub fn owns_transaction(&self, id: &TransactionId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn has_permission(&self, peer: &SocketAddr) -> bool {
        self.permissions
            .get(peer)
            .map(|lease| lease.refresh_at.is_some())
            .unwrap_or(false)
    }

    /// Tear the allocation down (refresh with lifetime 0)
    pub fn release(&mut self, now: Instant) {
        match self.state {
            AllocationState::Allocated { releasing: true, .. } => {}
            AllocationState::Allocated { id: allocation_id, .. } => {
                if let AllocationState::Allocated { releasing, .. } = &mut self.state {
                    *releasing = true;
                }
                log::debug!("Releasing allocation {} on {}", allocation_id, self.server);
                self.send_request(
                    RelayBody::RefreshRequest {
                        allocation_id,
                        lifetime_secs: 0,
                    },
                    now,
                );
            }
            AllocationState::Allocating => {
                self.pending.clear();
                self.state = AllocationState::Released;
            }
            AllocationState::Released => {}
        }
    }

    /// Make sure `peer` may send to us through the relay
    pub fn create_permission(&mut self, peer: SocketAddr, now: Instant) {
        if self.permissions.contains_key(&peer) {
            return;
        }

        self.permissions.insert(peer, Lease::default());
        if self.is_usable() {
            self.send_permission(peer, now);
        }
    }

    /// Wrap `payload` for `peer`
    ///
    /// Uses ChannelData once a channel is confirmed, a Send indication until
    /// then (binding a channel on first use).
    pub fn encapsulate(&mut self, peer: SocketAddr, payload: &[u8], now: Instant) -> Option<Transmit> {
        let allocation_id = match self.state {
            AllocationState::Allocated { id, releasing: false, .. } => id,
            _ => return None,
        };

        self.create_permission(peer, now);

        if let Some(channel) = self.channels.get(&peer) {
            if channel.confirmed {
                return Some(Transmit {
                    dst: self.server,
                    payload: encode_channel_data(channel.number, payload),
                });
            }
        } else {
            self.bind_channel(peer, now);
        }

        let msg = RelayMessage {
            transaction_id: [0u8; 12],
            body: RelayBody::SendIndication {
                allocation_id,
                peer,
                data: payload.to_vec(),
            },
        };

        match encode_relay(&msg) {
            Ok(payload) => Some(Transmit {
                dst: self.server,
                payload,
            }),
            Err(e) => {
                log::warn!("Failed to encode send indication: {}", e);
                None
            }
        }
    }

    /// Handle a control message from our server
    ///
    /// Returns `(peer, data)` for Data indications.
    pub fn handle_message(&mut self, msg: RelayMessage, now: Instant) -> Option<(SocketAddr, Vec<u8>)> {
        if let RelayBody::DataIndication { peer, data } = msg.body {
            if !self.is_usable() {
                return None;
            }
            return Some((peer, data));
        }

        if !msg.body.is_response() {
            log::debug!("Ignoring unexpected relay message from {}", self.server);
            return None;
        }

        let pending = self.pending.remove(&msg.transaction_id)?;
        self.handle_response(pending.body, msg.body, now);
        None
    }

    /// Map a ChannelData channel number back to the peer
    pub fn handle_channel_data(&self, channel: u16) -> Option<SocketAddr> {
        if !self.is_usable() {
            return None;
        }
        self.peers_by_channel.get(&channel).copied()
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        self.poll_transactions(now);

        let (id, refresh_at, expires_at, releasing, relayed) = match self.state {
            AllocationState::Allocated {
                id,
                refresh_at,
                expires_at,
                releasing,
                relayed,
                ..
            } => (id, refresh_at, expires_at, releasing, relayed),
            _ => return,
        };

        if now >= expires_at {
            log::info!("Allocation {} on {} expired", id, self.server);
            self.lose(relayed);
            return;
        }

        if releasing {
            return;
        }

        if now >= refresh_at && !self.has_pending(|body| matches!(body, RelayBody::RefreshRequest { .. })) {
            let lifetime_secs = self.lifetime_secs;
            self.send_request(
                RelayBody::RefreshRequest {
                    allocation_id: id,
                    lifetime_secs,
                },
                now,
            );
        }

        let due_permissions: Vec<SocketAddr> = self
            .permissions
            .iter()
            .filter(|(_, lease)| lease.is_due(now))
            .map(|(peer, _)| *peer)
            .collect();
        for peer in due_permissions {
            self.send_permission(peer, now);
        }

        let due_channels: Vec<SocketAddr> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.lease.is_due(now))
            .map(|(peer, _)| *peer)
            .collect();
        for peer in due_channels {
            self.send_channel_bind(peer, now);
        }
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        let mut earliest = self.pending.values().map(|p| p.txn.next_timeout()).min();

        if let AllocationState::Allocated {
            refresh_at,
            expires_at,
            releasing,
            ..
        } = self.state
        {
            earliest = min_instant(earliest, Some(expires_at));
            if !releasing {
                earliest = min_instant(earliest, Some(refresh_at));
                for lease in self.permissions.values() {
                    if !lease.pending {
                        earliest = min_instant(earliest, lease.refresh_at);
                    }
                }
                for channel in self.channels.values() {
                    if !channel.lease.pending {
                        earliest = min_instant(earliest, channel.lease.refresh_at);
                    }
                }
            }
        }

        earliest
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<RelayEvent> {
        self.events.pop_front()
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn handle_response(&mut self, request: RelayBody, response: RelayBody, now: Instant) {
        match (request, response) {
            (
                RelayBody::AllocateRequest { .. },
                RelayBody::AllocateResponse {
                    allocation_id,
                    relayed,
                    mapped,
                    lifetime_secs,
                },
            ) => {
                let lifetime = Duration::from_secs(lifetime_secs as u64);
                self.state = AllocationState::Allocated {
                    id: allocation_id,
                    relayed,
                    mapped,
                    refresh_at: now + lifetime / 2,
                    expires_at: now + lifetime,
                    releasing: false,
                };
                log::info!(
                    "Allocated {} on relay {} (lifetime {}s)",
                    relayed,
                    self.server,
                    lifetime_secs
                );
                self.events.push_back(RelayEvent::Allocated { relayed, mapped });

                // Permissions requested while allocating
                let peers: Vec<SocketAddr> = self.permissions.keys().copied().collect();
                for peer in peers {
                    self.send_permission(peer, now);
                }
            }
            (RelayBody::AllocateRequest { .. }, RelayBody::ErrorResponse { code }) => {
                log::warn!("Relay {} rejected allocation: {}", self.server, code);
                self.state = AllocationState::Released;
                self.events
                    .push_back(RelayEvent::AllocationFailed(RelayClientError::Rejected(code)));
            }
            (RelayBody::RefreshRequest { lifetime_secs: 0, .. }, _) => {
                log::debug!("Allocation on {} released", self.server);
                self.state = AllocationState::Released;
                self.pending.clear();
            }
            (RelayBody::RefreshRequest { .. }, RelayBody::RefreshResponse { lifetime_secs }) => {
                if let AllocationState::Allocated {
                    refresh_at,
                    expires_at,
                    ..
                } = &mut self.state
                {
                    let lifetime = Duration::from_secs(lifetime_secs as u64);
                    *refresh_at = now + lifetime / 2;
                    *expires_at = now + lifetime;
                }
            }
            (RelayBody::RefreshRequest { .. }, RelayBody::ErrorResponse { code }) => {
                log::warn!("Refresh on {} failed: {}", self.server, code);
                if let Some(relayed) = self.relayed_address() {
                    self.lose(relayed);
                }
            }
            (
                RelayBody::CreatePermissionRequest { peer, .. },
                RelayBody::CreatePermissionResponse { lifetime_secs },
            ) => {
                if let Some(lease) = self.permissions.get_mut(&peer) {
                    lease.confirm(now, lifetime_secs);
                }
            }
            (RelayBody::CreatePermissionRequest { peer, .. }, RelayBody::ErrorResponse { code }) => {
                log::debug!("Permission for {} on {} refused: {}", peer, self.server, code);
                self.permissions.remove(&peer);
            }
            (
                RelayBody::ChannelBindRequest { peer, .. },
                RelayBody::ChannelBindResponse { lifetime_secs },
            ) => {
                if let Some(channel) = self.channels.get_mut(&peer) {
                    channel.confirmed = true;
                    channel.lease.confirm(now, lifetime_secs);
                }
            }
            (RelayBody::ChannelBindRequest { peer, channel, .. }, RelayBody::ErrorResponse { code }) => {
                log::debug!("Channel bind {:#06x} for {} refused: {}", channel, peer, code);
                self.channels.remove(&peer);
                self.peers_by_channel.remove(&channel);
            }
            (request, response) => {
                log::debug!(
                    "Mismatched relay response {:?} for request {:?}",
                    response,
                    request
                );
            }
        }
    }

    fn poll_transactions(&mut self, now: Instant) {
        let mut retransmit = Vec::new();
        let mut timed_out = Vec::new();

        for (id, pending) in self.pending.iter_mut() {
            match pending.txn.poll(now) {
                TransactionPoll::Pending => {}
                TransactionPoll::Retransmit => retransmit.push(*id),
                TransactionPoll::TimedOut => timed_out.push(*id),
            }
        }

        for id in retransmit {
            if let Some(pending) = self.pending.get(&id) {
                let msg = RelayMessage {
                    transaction_id: id,
                    body: pending.body.clone(),
                };
                self.queue(&msg);
            }
        }

        for id in timed_out {
            let Some(pending) = self.pending.remove(&id) else {
                continue;
            };

            match pending.body {
                RelayBody::AllocateRequest { .. } => {
                    log::warn!("Allocation on {} timed out", self.server);
                    self.state = AllocationState::Released;
                    self.events
                        .push_back(RelayEvent::AllocationFailed(RelayClientError::Timeout));
                }
                RelayBody::RefreshRequest { lifetime_secs: 0, .. } => {
                    self.state = AllocationState::Released;
                }
                RelayBody::CreatePermissionRequest { peer, .. } => {
                    if let Some(lease) = self.permissions.get_mut(&peer) {
                        lease.pending = false;
                        if lease.refresh_at.is_none() {
                            self.permissions.remove(&peer);
                        }
                    }
                }
                RelayBody::ChannelBindRequest { peer, channel, .. } => {
                    if let Some(entry) = self.channels.get_mut(&peer) {
                        entry.lease.pending = false;
                        if !entry.confirmed {
                            self.channels.remove(&peer);
                            self.peers_by_channel.remove(&channel);
                        }
                    }
                }
                // Regular refreshes keep trying until the allocation expires
                _ => {}
            }
        }
    }

    fn lose(&mut self, relayed: SocketAddr) {
        self.state = AllocationState::Released;
        self.pending.clear();
        self.permissions.clear();
        self.channels.clear();
        self.peers_by_channel.clear();
        self.events.push_back(RelayEvent::Lost { relayed });
    }

    fn bind_channel(&mut self, peer: SocketAddr, now: Instant) {
        let Some(number) = self.allocate_channel_number() else {
            log::debug!("No free channel numbers on {}", self.server);
            return;
        };

        self.channels.insert(
            peer,
            Channel {
                number,
                confirmed: false,
                lease: Lease::default(),
            },
        );
        self.peers_by_channel.insert(number, peer);
        self.send_channel_bind(peer, now);
    }

    fn allocate_channel_number(&mut self) -> Option<u16> {
        let span = (CHANNEL_MAX - CHANNEL_MIN) as usize + 1;
        for _ in 0..span {
            let candidate = self.next_channel;
            self.next_channel = if candidate == CHANNEL_MAX {
                CHANNEL_MIN
            } else {
                candidate + 1
            };
            if !self.peers_by_channel.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    fn send_permission(&mut self, peer: SocketAddr, now: Instant) {
        let Some(allocation_id) = self.allocation_id() else {
            return;
        };
        if let Some(lease) = self.permissions.get_mut(&peer) {
            lease.pending = true;
        }
        self.send_request(RelayBody::CreatePermissionRequest { allocation_id, peer }, now);
    }

    fn send_channel_bind(&mut self, peer: SocketAddr, now: Instant) {
        let Some(allocation_id) = self.allocation_id() else {
            return;
        };
        let Some(channel) = self.channels.get_mut(&peer) else {
            return;
        };
        channel.lease.pending = true;
        let number = channel.number;
        self.send_request(
            RelayBody::ChannelBindRequest {
                allocation_id,
                channel: number,
                peer,
            },
            now,
        );
    }

    fn send_request(&mut self, body: RelayBody, now: Instant) {
        let Some(txn) = Transaction::start(now, self.max_attempts, self.request_timeout) else {
            log::error!("No randomness for a transaction id, dropping request to {}", self.server);
            return;
        };
        let msg = RelayMessage {
            transaction_id: txn.id(),
            body: body.clone(),
        };
        self.queue(&msg);
        self.pending.insert(txn.id(), Pending { body, txn });
    }

    fn has_pending(&self, predicate: impl Fn(&RelayBody) -> bool) -> bool {
        self.pending.values().any(|p| predicate(&p.body))
    }

    fn queue(&mut self, msg: &RelayMessage) {
        match encode_relay(msg) {
            Ok(payload) => self.transmits.push_back(Transmit {
                dst: self.server,
                payload,
            }),
            Err(e) => log::warn!("Failed to encode relay request: {}", e),
        }
    }
}

impl Lease {
    fn confirm(&mut self, now: Instant, lifetime_secs: u32) {
        self.pending = false;
        self.refresh_at = Some(now + Duration::from_secs(lifetime_secs as u64) / 2);
    }

    fn is_due(&self, now: Instant) -> bool {
        !self.pending && self.refresh_at.map(|at| now >= at).unwrap_or(false)
    }
}

fn min_instant(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

// ============================================================================
// Tests
// ============================================================================
