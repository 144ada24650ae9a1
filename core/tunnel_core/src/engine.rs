//! Connection engine
//!
//! Ties candidate gathering, negotiation, secure sessions and routing
//! together for one node. The engine never touches a socket or a clock:
//! the caller feeds it datagrams, signaling messages and timeouts, and
//! drains transmits, events and decrypted packets.
//!
//! ```text
//!  virtual interface ──route_outbound──►┌────────┐──poll_transmit──► UDP socket
//!                    ◄──poll_inbound────│ Engine │◄─handle_network── UDP socket
//!  signaling channel ──handle_signaling►│        │──poll_event─────► signaling / app
//!                                       └────────┘
//!                                     handle_timeout / poll_timeout
//! ```
//!
//! # Connection lifecycle (client side)
//!
//! ```text
//! packet to unknown destination
//!   └── RouteMiss, ask control plane ──► route admitted
//!         └── gather ──► Offer ──► Answer ──► checks ──► path selected
//!               └── handshake init ──► response ──► session ready ──► queue flushed
//! ```
//!
//! The client is always the controlling side: it selects the path and
//! initiates (and re-initiates) handshakes. The gateway adopts whichever
//! path a valid handshake or authenticated data packet arrives on.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Instant;

use ipnet::IpNet;
use ring::rand::{SecureRandom, SystemRandom};
use serde::Serialize;

use crate::config::EngineConfig;
use crate::error::{Classify, ErrorClass};
use crate::p2p::candidate::Candidate;
use crate::p2p::connectivity::{decode_binding, encode_binding, BindingMessage};
use crate::p2p::gather::{GatherEvent, Gatherer};
use crate::p2p::negotiator::{Negotiation, NegotiationError, NegotiationEvent, NegotiationState};
use crate::p2p::resilience::PathMonitor;
use crate::p2p::signaling::{generate_negotiation_id, Envelope, SignalingMessage};
use crate::p2p::transaction::TransactionPoll;
use crate::p2p::{Path, Via};
use crate::rate_limit::TokenBucket;
use crate::relay::{decode_channel_data, decode_relay};
use crate::router::{self, Resource, RouteError, Router};
use crate::session::handshake::{self, HandshakeHeader, PendingHandshake};
use crate::session::{parse_data_header, Identity, PublicKey, SessionError, SessionSlot, SessionStats};
use crate::wire::{self, PacketKind};
use crate::{PeerId, Transmit};

// ============================================================================
// Control Plane
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Reaches resources; controlling side of every negotiation
    Client,
    /// Serves resources; controlled side
    Gateway,
}

impl Role {
    pub fn is_controlling(&self) -> bool {
        matches!(self, Role::Client)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<'a> {
    Address(IpAddr),
    Name(&'a str),
}

/// Client-side answer from the control plane: who serves a resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub resource: Resource,
    pub peer: PeerId,
    /// Static key the gateway must prove in the handshake
    pub identity: PublicKey,
    pub allow: bool,
    pub expires_at: Option<Instant>,
}

/// Gateway-side answer: what an authorized client may do
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Tunnel addresses the client may send from
    pub sources: Vec<IpNet>,
    /// Destinations the client may reach through us
    pub destinations: Vec<IpNet>,
    pub expires_at: Option<Instant>,
}

impl Admission {
    fn permits(&self, src: &IpAddr, dst: &IpAddr) -> bool {
        self.sources.iter().any(|n| n.contains(src)) && self.destinations.iter().any(|n| n.contains(dst))
    }
}

/// Access decisions the engine delegates to the control plane
pub trait ControlPlane {
    /// Client: which gateway serves this destination, if any
    fn lookup(&mut self, query: Lookup<'_>) -> Option<Grant>;

    /// Gateway: whether `peer` with this identity may connect
    fn authorize_peer(&mut self, peer: PeerId, identity: &PublicKey) -> Option<Admission>;
}

// ============================================================================
// Errors and Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    Negotiation(NegotiationError),
    Session(SessionError),
    Route(RouteError),
    /// The control plane refused access
    Denied,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Negotiation(e) => write!(f, "negotiation: {}", e),
            EngineError::Session(e) => write!(f, "session: {}", e),
            EngineError::Route(e) => write!(f, "routing: {}", e),
            EngineError::Denied => write!(f, "access denied"),
        }
    }
}

impl std::error::Error for EngineError {}

impl Classify for EngineError {
    fn class(&self) -> ErrorClass {
        match self {
            EngineError::Negotiation(e) => e.class(),
            EngineError::Session(e) => e.class(),
            EngineError::Route(e) => e.class(),
            EngineError::Denied => ErrorClass::Resource,
        }
    }
}

impl From<NegotiationError> for EngineError {
    fn from(e: NegotiationError) -> Self {
        EngineError::Negotiation(e)
    }
}

impl From<SessionError> for EngineError {
    fn from(e: SessionError) -> Self {
        EngineError::Session(e)
    }
}

impl From<RouteError> for EngineError {
    fn from(e: RouteError) -> Self {
        EngineError::Route(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// No data in either direction for the idle timeout
    Idle,
    /// Every route to the peer expired
    Expired,
    /// The session outlived its hard limit without a rekey
    SessionExpired,
    /// `reset` was called
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Deliver over the signaling channel
    Signal(Envelope),
    /// An outbound packet had no route
    RouteMiss { destination: IpAddr },
    ConnectionEstablished { peer: PeerId, path: Path },
    ConnectionFailed { peer: PeerId, error: EngineError },
    ConnectionClosed { peer: PeerId, reason: CloseReason },
}

/// Engine-wide counters plus per-peer session stats
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub route_misses: u64,
    pub packets_queued: u64,
    /// Oldest queued packets dropped because a queue was full
    pub queue_drops: u64,
    /// Decrypted packets outside the peer's admission
    pub packets_filtered: u64,
    pub handshakes_rate_limited: u64,
    /// Datagrams nothing claimed
    pub unknown_packets: u64,
    pub peers: BTreeMap<PeerId, SessionStats>,
}

// ============================================================================
// Peer State
// ============================================================================

#[derive(Debug)]
struct PeerState {
    identity: PublicKey,
    negotiation: Option<Negotiation>,
    path: Option<Path>,
    sessions: SessionSlot,
    pending: Option<PendingHandshake>,
    /// Responder: last init answered and our response, for retransmits
    last_init: Option<(Vec<u8>, Vec<u8>)>,
    monitor: PathMonitor,
    queue: VecDeque<Vec<u8>>,
    admission: Option<Admission>,
    stats: SessionStats,
    established: bool,
}

impl PeerState {
    fn new(identity: PublicKey, config: &EngineConfig, now: Instant) -> Self {
        Self {
            identity,
            negotiation: None,
            path: None,
            sessions: SessionSlot::new(),
            pending: None,
            last_init: None,
            monitor: PathMonitor::with_timeouts(
                now,
                config.keepalive_interval(),
                config.liveness_timeout(),
                config.idle_timeout(),
            ),
            queue: VecDeque::new(),
            admission: None,
            stats: SessionStats::default(),
            established: false,
        }
    }

    fn is_negotiating(&self) -> bool {
        self.negotiation
            .as_ref()
            .map(|n| n.state() != NegotiationState::Failed)
            .unwrap_or(false)
    }

    fn is_connected(&self) -> bool {
        self.path.is_some() && self.sessions.is_ready()
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct Engine<C: ControlPlane> {
    role: Role,
    local_id: PeerId,
    identity: Identity,
    config: EngineConfig,
    control: C,
    gatherer: Gatherer,
    router: Router,
    peers: HashMap<PeerId, PeerState>,
    /// Local session index -> owning peer
    indices: HashMap<u32, PeerId>,
    handshake_limiter: TokenBucket,
    rng: SystemRandom,
    transmits: VecDeque<Transmit>,
    inbound: VecDeque<Vec<u8>>,
    events: VecDeque<EngineEvent>,
    stats: EngineStats,
}

impl<C: ControlPlane> Engine<C> {
    /// Create an engine bound to `local_addrs`
    pub fn new(
        role: Role,
        local_id: PeerId,
        identity: Identity,
        config: EngineConfig,
        control: C,
        local_addrs: Vec<SocketAddr>,
        now: Instant,
    ) -> Self {
        log::info!(
            "Engine {} starting as {:?}, identity {:?}",
            local_id,
            role,
            identity.public_key()
        );

        let gatherer = Gatherer::new(
            local_addrs,
            config.stun_servers.clone(),
            config.relay_servers.clone(),
            config.gather(),
        );
        let router = Router::new(config.synthetic_ipv4_pool, config.synthetic_ipv6_pool);
        let handshake_limiter = TokenBucket::new(config.handshake_rate_limit, config.handshake_burst, now);

        Self {
            role,
            local_id,
            identity,
            config,
            control,
            gatherer,
            router,
            peers: HashMap::new(),
            indices: HashMap::new(),
            handshake_limiter,
            rng: SystemRandom::new(),
            transmits: VecDeque::new(),
            inbound: VecDeque::new(),
            events: VecDeque::new(),
            stats: EngineStats::default(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn public_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    pub fn control_mut(&mut self) -> &mut C {
        &mut self.control
    }

    pub fn local_candidates(&self) -> Vec<Candidate> {
        self.gatherer.candidates()
    }

    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.peers.get(&peer).map(|p| p.is_connected()).unwrap_or(false)
    }

    pub fn selected_path(&self, peer: PeerId) -> Option<Path> {
        self.peers.get(&peer).and_then(|p| p.path)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn stats(&self) -> EngineStats {
        let mut stats = self.stats.clone();
        stats.peers = self
            .peers
            .iter()
            .map(|(id, peer)| (*id, peer.stats.clone()))
            .collect();
        stats
    }

    // ------------------------------------------------------------------------
    // Packet path
    // ------------------------------------------------------------------------

    /// Route one IP packet from the virtual interface
    ///
    /// A packet without a route is dropped; on a client the control plane
    /// is consulted so the next packet to that destination finds a route.
    pub fn route_outbound(&mut self, packet: &[u8], now: Instant) -> Result<(), EngineError> {
        let result = match self.router.route_outbound(packet) {
            Ok(peer) => {
                self.send_to_peer(peer, packet.to_vec(), now);
                Ok(())
            }
            Err(RouteError::NoRoute(dst)) => {
                self.stats.route_misses += 1;
                log::debug!("No route to {}", dst);
                self.events.push_back(EngineEvent::RouteMiss { destination: dst });

                if self.role == Role::Client {
                    // A synthetic address is looked up by the name it was resolved for
                    let name = self.router.synthetic_name(&dst).map(str::to_owned);
                    let grant = match &name {
                        Some(name) => self
                            .control
                            .lookup(Lookup::Name(name))
                            .filter(|grant| grant.resource.matches_name(name)),
                        None => self.control.lookup(Lookup::Address(dst)),
                    };
                    if let Some(grant) = grant {
                        // The miss is still reported to the caller
                        let _ = self.admit(grant, now);
                    }
                }
                Err(EngineError::Route(RouteError::NoRoute(dst)))
            }
            Err(e) => Err(e.into()),
        };

        self.process(now);
        result
    }

    /// Synthetic addresses for a DNS query
    ///
    /// `Ok(None)` means no DNS resource covers the name and the query
    /// should go to the regular resolver.
    pub fn resolve_dns(&mut self, name: &str, now: Instant) -> Result<Option<(Ipv4Addr, Ipv6Addr)>, EngineError> {
        if self.router.lookup_name(name).is_none() && self.role == Role::Client {
            if let Some(grant) = self.control.lookup(Lookup::Name(name)) {
                if grant.resource.matches_name(name) {
                    self.admit(grant, now)?;
                }
            }
        }

        let resolved = self.router.resolve(name)?;
        self.process(now);
        Ok(resolved)
    }

    /// Install a route granted by the control plane and start connecting
    pub fn admit(&mut self, grant: Grant, now: Instant) -> Result<(), EngineError> {
        if !grant.allow {
            log::warn!("Control plane denied {} via peer {}", grant.resource, grant.peer);
            return Err(EngineError::Denied);
        }

        let replaced = self
            .peers
            .get(&grant.peer)
            .map(|p| p.identity != grant.identity)
            .unwrap_or(false);
        if replaced {
            log::warn!("Peer {} changed identity, dropping its sessions", grant.peer);
            self.forget_peer(grant.peer);
        }

        self.router.add_route(grant.resource, grant.peer, grant.expires_at);
        let config = &self.config;
        self.peers
            .entry(grant.peer)
            .or_insert_with(|| PeerState::new(grant.identity, config, now));
        self.connect(grant.peer, now);
        self.process(now);
        Ok(())
    }

    pub fn poll_inbound(&mut self) -> Option<Vec<u8>> {
        self.inbound.pop_front()
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<EngineEvent> {
        self.events.pop_front()
    }

    // ------------------------------------------------------------------------
    // Network input
    // ------------------------------------------------------------------------

    /// Handle a datagram received on the engine's socket
    pub fn handle_network(&mut self, from: SocketAddr, packet: &[u8], now: Instant) {
        match wire::classify(packet) {
            Some(PacketKind::Relay) => self.handle_relay(from, packet, now),
            Some(PacketKind::ChannelData) => {
                let relayed = decode_channel_data(packet)
                    .ok()
                    .and_then(|(channel, payload)| Some((self.gatherer.handle_channel_data(from, channel)?, payload)));
                match relayed {
                    Some(((relayed, peer), payload)) => {
                        self.handle_peer_datagram(Path::relayed(peer, relayed), payload, now)
                    }
                    None => self.stats.unknown_packets += 1,
                }
            }
            Some(_) => self.handle_peer_datagram(Path::direct(from), packet, now),
            None => self.stats.unknown_packets += 1,
        }

        self.process(now);
    }

    fn handle_relay(&mut self, from: SocketAddr, packet: &[u8], now: Instant) {
        if !self.gatherer.is_relay_server(&from) {
            log::debug!("Relay message from non-relay {}", from);
            self.stats.unknown_packets += 1;
            return;
        }

        match decode_relay(packet) {
            Ok(msg) => {
                if let Some((relayed, peer, data)) = self.gatherer.handle_relay_message(from, msg, now) {
                    self.handle_peer_datagram(Path::relayed(peer, relayed), &data, now);
                }
            }
            Err(e) => log::debug!("Bad relay message from {}: {}", from, e),
        }
    }

    fn handle_peer_datagram(&mut self, path: Path, packet: &[u8], now: Instant) {
        match wire::classify(packet) {
            Some(PacketKind::Binding) => self.handle_binding(path, packet, now),
            Some(PacketKind::Handshake) => match handshake::parse_header(packet) {
                Some(HandshakeHeader::Init { initiator, .. }) => self.handle_init(initiator, path, packet, now),
                Some(HandshakeHeader::Response { receiver_index, .. }) => {
                    self.handle_handshake_response(receiver_index, path, packet, now)
                }
                None => log::debug!("Malformed handshake from {}", path),
            },
            Some(PacketKind::Data) => self.handle_data(path, packet, now),
            _ => self.stats.unknown_packets += 1,
        }
    }

    fn handle_binding(&mut self, path: Path, packet: &[u8], now: Instant) {
        let msg = match decode_binding(packet) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("Bad binding message on {}: {}", path, e);
                return;
            }
        };

        match msg {
            BindingMessage::Request(request) => {
                let accepted = self
                    .peers
                    .get(&request.sender)
                    .and_then(|p| p.negotiation.as_ref())
                    .map(|n| n.accepts(&request))
                    .unwrap_or(false);
                if !accepted {
                    log::debug!("Ignoring binding request from {} on {}", request.sender, path);
                    return;
                }

                let response = request.respond(self.local_id, path.remote);
                match encode_binding(&BindingMessage::Response(response)) {
                    Ok(bytes) => self.send_on_path(path, bytes, now),
                    Err(e) => log::warn!("Failed to encode binding response: {}", e),
                }
            }
            BindingMessage::Response(response) => {
                if let Some(negotiation) = self
                    .peers
                    .get_mut(&response.sender)
                    .and_then(|p| p.negotiation.as_mut())
                {
                    negotiation.handle_response(&response, path, now);
                }
            }
        }
    }

    fn handle_init(&mut self, initiator: PeerId, path: Path, packet: &[u8], now: Instant) {
        if self.role != Role::Gateway {
            log::debug!("Ignoring handshake init from {} on a client", initiator);
            return;
        }
        let Some(peer) = self.peers.get(&initiator) else {
            log::debug!("Handshake init from unknown peer {}", initiator);
            return;
        };
        let initiator_identity = peer.identity;

        // A retransmitted init gets the response we already sent
        let cached = peer
            .last_init
            .as_ref()
            .filter(|(init, _)| init.as_slice() == packet)
            .map(|(_, response)| response.clone());
        if let Some(response) = cached {
            self.send_on_path(path, response, now);
            return;
        }

        if !self.handshake_limiter.try_acquire(now) {
            self.stats.handshakes_rate_limited += 1;
            log::warn!("Handshake rate limit hit, dropping init from peer {}", initiator);
            return;
        }

        let Some(index) = self.allocate_index() else {
            log::error!("No randomness for a session index, dropping init from peer {}", initiator);
            return;
        };
        match handshake::respond(&self.identity, &initiator_identity, index, packet, now) {
            Ok((session, response)) => {
                let overlap = self.config.rekey_overlap();
                let Some(peer) = self.peers.get_mut(&initiator) else {
                    return;
                };
                let retired = peer.sessions.install(session, now, overlap);
                peer.last_init = Some((packet.to_vec(), response.clone()));
                self.indices.insert(index, initiator);
                for index in retired {
                    self.indices.remove(&index);
                }

                log::info!("Handshake from peer {} on {}", initiator, path);
                self.adopt_path(initiator, path, now);
                self.send_on_path(path, response, now);
            }
            Err(e) => {
                if let Some(peer) = self.peers.get_mut(&initiator) {
                    peer.stats.record_error(e);
                }
                log::warn!("Rejected handshake from peer {}: {}", initiator, e);
            }
        }
    }

    fn handle_handshake_response(&mut self, receiver_index: u32, path: Path, packet: &[u8], now: Instant) {
        let Some(&peer_id) = self.indices.get(&receiver_index) else {
            log::debug!("Handshake response for unknown index {} on {}", receiver_index, path);
            return;
        };
        let overlap = self.config.rekey_overlap();
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        let Some(pending) = peer.pending.as_mut().filter(|p| p.local_index() == receiver_index) else {
            log::debug!("Stale handshake response from peer {}", peer_id);
            return;
        };

        match pending.complete(packet, now) {
            Ok(session) => {
                peer.pending = None;
                let retired = peer.sessions.install(session, now, overlap);
                peer.stats.handshakes_completed += 1;
                for index in retired {
                    self.indices.remove(&index);
                }

                let path = peer.path.unwrap_or(path);
                let first = !peer.established;
                peer.established = true;
                let has_queued = !peer.queue.is_empty();

                if first {
                    log::info!("Connected to peer {} on {}", peer_id, path);
                    self.events.push_back(EngineEvent::ConnectionEstablished { peer: peer_id, path });
                } else {
                    log::debug!("Rekeyed with peer {}", peer_id);
                }

                // The responder switches on the first packet it sees
                if has_queued {
                    self.flush_queue(peer_id, now);
                } else {
                    self.send_keepalive(peer_id, now);
                }
            }
            Err(e) => {
                peer.stats.record_error(e);
                log::warn!("Bad handshake response from peer {}: {}", peer_id, e);
            }
        }
    }

    fn handle_data(&mut self, path: Path, packet: &[u8], now: Instant) {
        let Some((index, _)) = parse_data_header(packet) else {
            self.stats.unknown_packets += 1;
            return;
        };
        let Some(&peer_id) = self.indices.get(&index) else {
            log::debug!("Data for unknown index {} from {}", index, path);
            self.stats.unknown_packets += 1;
            return;
        };
        let overlap = self.config.rekey_overlap();
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };

        let awaiting_confirmation = peer.sessions.has_pending_confirmation();
        let (plaintext, retired) = match peer.sessions.decrypt(index, packet, now, overlap) {
            Ok(result) => result,
            Err(e) => {
                peer.stats.record_error(e);
                log::debug!("Dropped packet from peer {}: {}", peer_id, e);
                return;
            }
        };
        for index in retired {
            self.indices.remove(&index);
        }

        let keepalive = plaintext.is_empty();
        peer.monitor.record_received(now, keepalive);
        peer.stats.rx_packets += 1;
        peer.stats.rx_bytes += plaintext.len() as u64;
        if awaiting_confirmation && !peer.sessions.has_pending_confirmation() {
            peer.stats.handshakes_completed += 1;
        }

        let newly_established = !peer.established && peer.sessions.is_ready();
        peer.established |= newly_established;
        // The controlled side follows the client when it roams
        let roamed = self.role == Role::Gateway && peer.path != Some(path);

        if roamed {
            self.adopt_path(peer_id, path, now);
        }
        if newly_established {
            log::info!("Connected to peer {} on {}", peer_id, path);
            self.events
                .push_back(EngineEvent::ConnectionEstablished { peer: peer_id, path });
            self.flush_queue(peer_id, now);
        }
        if !keepalive {
            self.deliver_inbound(peer_id, plaintext);
        }
    }

    fn deliver_inbound(&mut self, peer_id: PeerId, packet: Vec<u8>) {
        if self.role == Role::Gateway {
            let admission = self.peers.get(&peer_id).and_then(|p| p.admission.as_ref());
            let permitted = match (router::source(&packet), router::destination(&packet), admission) {
                (Ok(src), Ok(dst), Some(admission)) => admission.permits(&src, &dst),
                _ => false,
            };
            if !permitted {
                self.stats.packets_filtered += 1;
                log::debug!("Filtered packet from peer {}", peer_id);
                return;
            }
        }
        self.inbound.push_back(packet);
    }

    // ------------------------------------------------------------------------
    // Signaling input
    // ------------------------------------------------------------------------

    /// Handle a signaling message from `from`
    pub fn handle_signaling(&mut self, from: PeerId, message: SignalingMessage, now: Instant) -> Result<(), EngineError> {
        let result = match (self.role, message) {
            (
                Role::Gateway,
                SignalingMessage::OfferCandidates {
                    negotiation_id,
                    public_key,
                    candidates,
                },
            ) => self.on_offer(from, negotiation_id, public_key, &candidates, now),
            (
                Role::Client,
                SignalingMessage::AnswerCandidates {
                    negotiation_id,
                    public_key,
                    candidates,
                },
            ) => self.on_answer(from, negotiation_id, public_key, &candidates, now),
            (
                _,
                SignalingMessage::InvalidateCandidates {
                    negotiation_id,
                    candidates,
                },
            ) => {
                if let Some(negotiation) = self
                    .peers
                    .get_mut(&from)
                    .and_then(|p| p.negotiation.as_mut())
                    .filter(|n| n.id() == negotiation_id)
                {
                    negotiation.invalidate_remote(&candidates);
                }
                Ok(())
            }
            (role, message) => {
                log::debug!(
                    "{:?} ignoring signaling for negotiation {:016x} from {}",
                    role,
                    message.negotiation_id(),
                    from
                );
                Ok(())
            }
        };

        self.process(now);
        result
    }

    fn on_offer(
        &mut self,
        from: PeerId,
        negotiation_id: u64,
        public_key: PublicKey,
        candidates: &[Candidate],
        now: Instant,
    ) -> Result<(), EngineError> {
        let known = self
            .peers
            .get(&from)
            .map(|p| p.identity == public_key)
            .unwrap_or(false);

        if !known {
            let Some(admission) = self.control.authorize_peer(from, &public_key) else {
                log::warn!("Peer {} ({:?}) is not authorized", from, public_key);
                return Err(EngineError::Denied);
            };
            self.forget_peer(from);

            for source in &admission.sources {
                self.router.add_route(Resource::Cidr(*source), from, admission.expires_at);
            }
            let mut state = PeerState::new(public_key, &self.config, now);
            state.admission = Some(admission);
            self.peers.insert(from, state);
        }

        let local_id = self.local_id;
        let config = self.config.negotiation();
        let Some(peer) = self.peers.get_mut(&from) else {
            return Ok(());
        };

        let fresh = peer
            .negotiation
            .as_ref()
            .map(|n| n.id() != negotiation_id)
            .unwrap_or(true);
        if fresh {
            log::info!("Negotiation {:016x} with peer {}", negotiation_id, from);
            peer.negotiation = Some(Negotiation::new(local_id, from, negotiation_id, false, config, now));
        }
        if let Some(negotiation) = peer.negotiation.as_mut() {
            negotiation.add_remote_candidates(candidates, now);
        }

        for candidate in candidates {
            self.gatherer.create_permission(candidate.address, now);
        }
        if fresh {
            self.gatherer.start_cycle(now);
        }
        Ok(())
    }

    fn on_answer(
        &mut self,
        from: PeerId,
        negotiation_id: u64,
        public_key: PublicKey,
        candidates: &[Candidate],
        now: Instant,
    ) -> Result<(), EngineError> {
        let Some(peer) = self.peers.get_mut(&from) else {
            log::debug!("Answer from unknown peer {}", from);
            return Ok(());
        };
        if peer.identity != public_key {
            log::warn!("Peer {} answered with an unexpected identity {:?}", from, public_key);
            return Err(EngineError::Denied);
        }
        let Some(negotiation) = peer.negotiation.as_mut().filter(|n| n.id() == negotiation_id) else {
            log::debug!("Stale answer {:016x} from peer {}", negotiation_id, from);
            return Ok(());
        };

        negotiation.add_remote_candidates(candidates, now);
        for candidate in candidates {
            self.gatherer.create_permission(candidate.address, now);
        }
        Ok(())
    }

    /// The signaling channel came back: re-announce our candidates
    pub fn on_signaling_reconnected(&mut self, now: Instant) {
        let announcements: Vec<(PeerId, u64, Vec<Candidate>)> = self
            .peers
            .iter()
            .filter_map(|(id, p)| p.negotiation.as_ref().map(|n| (*id, n)))
            .filter(|(_, n)| n.has_local_candidates() && n.state() != NegotiationState::Failed)
            .map(|(id, n)| (id, n.id(), n.local_candidates().to_vec()))
            .collect();

        for (peer, negotiation_id, candidates) in announcements {
            self.announce(peer, negotiation_id, candidates);
        }
        self.process(now);
    }

    // ------------------------------------------------------------------------
    // Timers and configuration
    // ------------------------------------------------------------------------

    pub fn handle_timeout(&mut self, now: Instant) {
        self.gatherer.handle_timeout(now);

        let ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for id in ids {
            self.peer_timeout(id, now);
        }

        for route in self.router.expire(now) {
            log::info!("Access to {} via peer {} expired", route.resource, route.peer);
            if !self.router.has_peer(route.peer) && self.peers.contains_key(&route.peer) {
                self.close_peer(
                    route.peer,
                    EngineEvent::ConnectionClosed {
                        peer: route.peer,
                        reason: CloseReason::Expired,
                    },
                );
            }
        }

        let in_use: HashSet<SocketAddr> = self
            .peers
            .values()
            .filter_map(|p| match p.path?.via {
                Via::Relay(relayed) => Some(relayed),
                Via::Direct => None,
            })
            .collect();
        self.gatherer.release_unused(&in_use, now);

        self.process(now);
    }

    /// Earliest instant `handle_timeout` has work to do
    pub fn poll_timeout(&self) -> Option<Instant> {
        let rekey_after = self.config.rekey_after_time();
        let reject_after = self.config.reject_after_time();

        let peers = self.peers.values().flat_map(|peer| {
            let mut deadlines = Vec::new();
            deadlines.extend(peer.negotiation.as_ref().and_then(|n| n.poll_timeout()));
            deadlines.extend(peer.pending.as_ref().map(|p| p.next_timeout()));
            deadlines.extend(peer.sessions.poll_timeout());
            if let Some(current) = peer.sessions.current() {
                deadlines.push(current.created_at() + reject_after);
                if peer.path.is_some() {
                    deadlines.push(peer.monitor.next_deadline());
                    if self.role.is_controlling() && peer.pending.is_none() {
                        deadlines.push(current.created_at() + rekey_after);
                    }
                }
            }
            deadlines
        });

        self.gatherer
            .poll_timeout()
            .into_iter()
            .chain(self.router.next_expiry())
            .chain(peers)
            .min()
    }

    /// Replace the relay and reflexive-address server sets
    pub fn update_relays(&mut self, stun_servers: Vec<SocketAddr>, relay_servers: Vec<SocketAddr>, now: Instant) {
        self.config.stun_servers = stun_servers.clone();
        self.config.relay_servers = relay_servers.clone();
        self.gatherer.update_relays(stun_servers, relay_servers, now);
        self.process(now);
    }

    /// Drop every peer, route and allocation
    pub fn reset(&mut self, now: Instant) {
        log::info!("Resetting engine {}", self.local_id);
        let ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for id in ids {
            self.close_peer(
                id,
                EngineEvent::ConnectionClosed {
                    peer: id,
                    reason: CloseReason::Reset,
                },
            );
        }
        self.router.clear();
        self.gatherer.reset(now);
        self.inbound.clear();
        self.drain_gatherer_transmits();
    }

    fn peer_timeout(&mut self, id: PeerId, now: Instant) {
        let rekey_after = self.config.rekey_after_time();
        let rekey_bytes = self.config.rekey_after_bytes;
        let reject_after = self.config.reject_after_time();
        let controlling = self.role.is_controlling();

        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };

        if let Some(negotiation) = peer.negotiation.as_mut() {
            negotiation.handle_timeout(now);
        }
        if let Some(index) = peer.sessions.handle_timeout(now) {
            self.indices.remove(&index);
        }

        let mut resend = None;
        let mut handshake_failed = false;
        if let Some(pending) = peer.pending.as_mut() {
            match pending.poll(now) {
                TransactionPoll::Pending => {}
                TransactionPoll::Retransmit => resend = peer.path.map(|path| (path, pending.packet().to_vec())),
                TransactionPoll::TimedOut => handshake_failed = true,
            }
        }
        if handshake_failed {
            if let Some(pending) = peer.pending.take() {
                self.indices.remove(&pending.local_index());
            }
            peer.stats.record_error(SessionError::Timeout);
            log::warn!("Handshake with peer {} timed out", id);

            if !peer.sessions.is_ready() {
                self.close_peer(
                    id,
                    EngineEvent::ConnectionFailed {
                        peer: id,
                        error: EngineError::Session(SessionError::Timeout),
                    },
                );
                return;
            }
        }

        let expired = peer
            .sessions
            .current()
            .map(|s| s.is_expired(now, reject_after))
            .unwrap_or(false);
        if expired {
            log::warn!("Session with peer {} expired without a rekey", id);
            self.close_peer(
                id,
                EngineEvent::ConnectionClosed {
                    peer: id,
                    reason: CloseReason::SessionExpired,
                },
            );
            return;
        }

        let rekey = controlling
            && peer.pending.is_none()
            && peer.path.is_some()
            && peer
                .sessions
                .current()
                .map(|s| s.needs_rekey(now, rekey_after, rekey_bytes))
                .unwrap_or(false);

        let mut idle = false;
        let mut path_dead = false;
        let mut keepalive = false;
        if peer.sessions.is_ready() {
            if peer.monitor.is_idle(now) {
                idle = true;
            } else if peer.path.is_some() {
                if peer.monitor.is_path_dead(now) {
                    path_dead = true;
                } else if peer.monitor.needs_keepalive(now) {
                    keepalive = true;
                }
            }
        }

        if let Some((path, packet)) = resend {
            log::debug!("Retransmitting handshake init to peer {}", id);
            self.send_on_path(path, packet, now);
        }
        if idle {
            log::info!("Peer {} idle, closing", id);
            self.close_peer(
                id,
                EngineEvent::ConnectionClosed {
                    peer: id,
                    reason: CloseReason::Idle,
                },
            );
            return;
        }
        if path_dead {
            self.path_failed(id, now);
            return;
        }
        if rekey {
            log::debug!("Rekeying with peer {}", id);
            self.start_handshake(id, now);
        }
        if keepalive {
            self.send_keepalive(id, now);
        }
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn connect(&mut self, peer_id: PeerId, now: Instant) {
        if self.role != Role::Client {
            return;
        }
        let local_id = self.local_id;
        let config = self.config.negotiation();
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        if peer.is_negotiating() {
            return;
        }

        let negotiation_id = match generate_negotiation_id() {
            Ok(id) => id,
            Err(_) => {
                log::error!("No randomness for a negotiation id, not connecting to peer {}", peer_id);
                return;
            }
        };
        log::info!("Connecting to peer {} (negotiation {:016x})", peer_id, negotiation_id);
        peer.negotiation = Some(Negotiation::new(local_id, peer_id, negotiation_id, true, config, now));
        self.gatherer.start_cycle(now);
    }

    fn send_to_peer(&mut self, peer_id: PeerId, packet: Vec<u8>, now: Instant) {
        let capacity = self.config.queue_capacity;
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };

        if let (Some(path), Some(session)) = (peer.path, peer.sessions.current_mut()) {
            match session.encrypt(&packet) {
                Ok(ciphertext) => {
                    peer.monitor.record_sent(now, false);
                    peer.stats.tx_packets += 1;
                    peer.stats.tx_bytes += packet.len() as u64;
                    self.send_on_path(path, ciphertext, now);
                }
                Err(e) => log::warn!("Cannot encrypt for peer {}: {}", peer_id, e),
            }
            return;
        }

        if peer.queue.len() >= capacity {
            peer.queue.pop_front();
            self.stats.queue_drops += 1;
        }
        peer.queue.push_back(packet);
        self.stats.packets_queued += 1;

        if !peer.is_negotiating() {
            self.connect(peer_id, now);
        }
    }

    fn flush_queue(&mut self, peer_id: PeerId, now: Instant) {
        let queued = match self.peers.get_mut(&peer_id) {
            Some(peer) => std::mem::take(&mut peer.queue),
            None => return,
        };
        if !queued.is_empty() {
            log::debug!("Flushing {} queued packets to peer {}", queued.len(), peer_id);
        }
        for packet in queued {
            self.send_to_peer(peer_id, packet, now);
        }
    }

    fn send_keepalive(&mut self, peer_id: PeerId, now: Instant) {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        let (Some(path), Some(session)) = (peer.path, peer.sessions.current_mut()) else {
            return;
        };

        match session.encrypt(&[]) {
            Ok(ciphertext) => {
                peer.monitor.record_sent(now, true);
                peer.stats.keepalives_sent += 1;
                self.send_on_path(path, ciphertext, now);
            }
            Err(e) => log::warn!("Cannot send keepalive to peer {}: {}", peer_id, e),
        }
    }

    fn start_handshake(&mut self, peer_id: PeerId, now: Instant) {
        let Some(index) = self.allocate_index() else {
            log::error!("No randomness for a session index, not handshaking with peer {}", peer_id);
            return;
        };
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        let Some(path) = peer.path else {
            return;
        };

        let pending = PendingHandshake::initiate(
            &self.identity,
            self.local_id,
            peer_id,
            peer.identity,
            index,
            self.config.handshake_max_attempts,
            self.config.handshake_timeout(),
            now,
        );
        match pending {
            Ok(mut pending) => {
                // First transmission
                let _ = pending.poll(now);
                let packet = pending.packet().to_vec();
                peer.pending = Some(pending);
                self.indices.insert(index, peer_id);
                self.send_on_path(path, packet, now);
            }
            Err(e) => log::error!("Cannot start handshake with peer {}: {}", peer_id, e),
        }
    }

    fn on_path_selected(&mut self, peer_id: PeerId, path: Path, now: Instant) {
        self.adopt_path(peer_id, path, now);
        if self.role != Role::Client {
            return;
        }

        let Some(peer) = self.peers.get(&peer_id) else {
            return;
        };
        if peer.sessions.is_ready() {
            // Existing session moves to the new path; the gateway follows
            self.send_keepalive(peer_id, now);
        } else if peer.pending.is_none() {
            self.start_handshake(peer_id, now);
        }
    }

    fn adopt_path(&mut self, peer_id: PeerId, path: Path, now: Instant) {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        if peer.path == Some(path) {
            return;
        }
        log::info!("Peer {}: using {}", peer_id, path);
        peer.path = Some(path);
        peer.monitor.reset_liveness(now);
        if let Some(negotiation) = peer.negotiation.as_mut() {
            negotiation.nominate(path);
        }
    }

    fn path_failed(&mut self, peer_id: PeerId, now: Instant) {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        log::warn!("Path to peer {} went silent, renegotiating", peer_id);
        peer.path = None;
        if let Some(pending) = peer.pending.take() {
            self.indices.remove(&pending.local_index());
        }
        if let Some(negotiation) = peer.negotiation.as_mut() {
            negotiation.path_failed(now);
        }
        self.gatherer.start_cycle(now);
    }

    /// Remove a peer with its routes and sessions and report why
    fn close_peer(&mut self, peer_id: PeerId, event: EngineEvent) {
        self.forget_peer(peer_id);
        self.router.remove_peer(peer_id);
        self.events.push_back(event);
    }

    fn forget_peer(&mut self, peer_id: PeerId) {
        let Some(mut peer) = self.peers.remove(&peer_id) else {
            return;
        };
        for index in peer.sessions.clear() {
            self.indices.remove(&index);
        }
        if let Some(pending) = peer.pending {
            self.indices.remove(&pending.local_index());
        }
        if !peer.queue.is_empty() {
            log::debug!("Dropping {} queued packets for peer {}", peer.queue.len(), peer_id);
        }
    }

    fn announce(&mut self, peer: PeerId, negotiation_id: u64, candidates: Vec<Candidate>) {
        let public_key = self.identity.public_key();
        let message = if self.role.is_controlling() {
            SignalingMessage::OfferCandidates {
                negotiation_id,
                public_key,
                candidates,
            }
        } else {
            SignalingMessage::AnswerCandidates {
                negotiation_id,
                public_key,
                candidates,
            }
        };
        self.events.push_back(EngineEvent::Signal(Envelope { peer, message }));
    }

    fn send_on_path(&mut self, path: Path, payload: Vec<u8>, now: Instant) {
        match path.via {
            Via::Direct => self.transmits.push_back(Transmit {
                dst: path.remote,
                payload,
            }),
            Via::Relay(relayed) => {
                let wrapped = self.gatherer.encapsulate(relayed, path.remote, &payload, now);
                // Permission and channel requests must go out first
                self.drain_gatherer_transmits();
                match wrapped {
                    Some(transmit) => self.transmits.push_back(transmit),
                    None => log::debug!("No usable allocation {} for {}", relayed, path.remote),
                }
            }
        }
    }

    fn drain_gatherer_transmits(&mut self) {
        while let Some(transmit) = self.gatherer.poll_transmit() {
            self.transmits.push_back(transmit);
        }
    }

    /// Fresh nonzero session index, `None` if the system RNG fails
    fn allocate_index(&self) -> Option<u32> {
        loop {
            let mut buf = [0u8; 4];
            self.rng.fill(&mut buf).ok()?;
            let index = u32::from_be_bytes(buf);
            if index != 0 && !self.indices.contains_key(&index) {
                return Some(index);
            }
        }
    }

    /// Run everything the last input made ready
    fn process(&mut self, now: Instant) {
        while let Some(event) = self.gatherer.poll_event() {
            self.on_gather_event(event, now);
        }

        let ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for id in ids {
            loop {
                let check = self
                    .peers
                    .get_mut(&id)
                    .and_then(|p| p.negotiation.as_mut())
                    .and_then(|n| n.poll_check(now));
                let Some((path, request)) = check else {
                    break;
                };
                match encode_binding(&BindingMessage::Request(request)) {
                    Ok(bytes) => self.send_on_path(path, bytes, now),
                    Err(e) => log::warn!("Failed to encode binding request: {}", e),
                }
            }

            loop {
                let event = self
                    .peers
                    .get_mut(&id)
                    .and_then(|p| p.negotiation.as_mut())
                    .and_then(|n| n.poll_event());
                match event {
                    Some(NegotiationEvent::PathSelected(path)) => self.on_path_selected(id, path, now),
                    Some(NegotiationEvent::Failed(error)) => {
                        log::warn!("Negotiation with peer {} failed: {}", id, error);
                        self.close_peer(
                            id,
                            EngineEvent::ConnectionFailed {
                                peer: id,
                                error: error.into(),
                            },
                        );
                        break;
                    }
                    None => break,
                }
            }
        }

        self.drain_gatherer_transmits();
    }

    fn on_gather_event(&mut self, event: GatherEvent, now: Instant) {
        match event {
            GatherEvent::Complete => {
                let candidates = self.gatherer.candidates();
                let mut ready = Vec::new();
                for (id, peer) in self.peers.iter_mut() {
                    if let Some(negotiation) = peer.negotiation.as_mut() {
                        if negotiation.state() == NegotiationState::Gathering && !negotiation.has_local_candidates() {
                            negotiation.set_local_candidates(candidates.clone(), now);
                            ready.push((*id, negotiation.id()));
                        }
                    }
                }
                for (peer, negotiation_id) in ready {
                    self.announce(peer, negotiation_id, candidates.clone());
                }
            }
            GatherEvent::NewCandidate(candidate) => {
                let mut trickle = Vec::new();
                for (id, peer) in self.peers.iter_mut() {
                    if let Some(negotiation) = peer.negotiation.as_mut() {
                        let open = matches!(
                            negotiation.state(),
                            NegotiationState::Gathering | NegotiationState::Checking
                        );
                        if open && negotiation.has_local_candidates() {
                            negotiation.add_local_candidate(candidate.clone());
                            trickle.push((*id, negotiation.id()));
                        }
                    }
                }
                for (peer, negotiation_id) in trickle {
                    self.announce(peer, negotiation_id, vec![candidate.clone()]);
                }
            }
            GatherEvent::CandidateInvalidated(candidate) => {
                let mut affected = Vec::new();
                for (id, peer) in self.peers.iter_mut() {
                    if let Some(negotiation) = peer.negotiation.as_mut() {
                        negotiation.remove_local_candidate(&candidate);
                        affected.push((*id, negotiation.id()));
                    }
                }
                for (peer, negotiation_id) in affected {
                    self.events.push_back(EngineEvent::Signal(Envelope {
                        peer,
                        message: SignalingMessage::InvalidateCandidates {
                            negotiation_id,
                            candidates: vec![candidate.clone()],
                        },
                    }));
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::router::tests::ipv4_packet;
    use std::time::Duration;

    pub(crate) const CLIENT_ID: PeerId = PeerId(1);
    pub(crate) const GATEWAY_ID: PeerId = PeerId(2);

    fn client_addr() -> SocketAddr {
        "10.0.0.1:5000".parse().unwrap()
    }

    fn gateway_addr() -> SocketAddr {
        "10.0.0.2:6000".parse().unwrap()
    }

    #[derive(Default)]
    struct StaticControl {
        grants: Vec<Grant>,
        admissions: HashMap<PeerId, (PublicKey, Admission)>,
        lookups: usize,
    }

    impl ControlPlane for StaticControl {
        fn lookup(&mut self, query: Lookup<'_>) -> Option<Grant> {
            self.lookups += 1;
            self.grants
                .iter()
                .find(|g| match query {
                    Lookup::Address(addr) => g.resource.contains_address(&addr),
                    Lookup::Name(name) => g.resource.matches_name(name),
                })
                .cloned()
        }

        fn authorize_peer(&mut self, peer: PeerId, identity: &PublicKey) -> Option<Admission> {
            self.admissions
                .get(&peer)
                .filter(|(key, _)| key == identity)
                .map(|(_, admission)| admission.clone())
        }
    }

    /// Client and gateway wired back to back over a lossless network
    struct Pair {
        client: Engine<StaticControl>,
        gateway: Engine<StaticControl>,
        client_events: Vec<EngineEvent>,
        gateway_events: Vec<EngineEvent>,
        now: Instant,
    }

    impl Pair {
        fn new(config: EngineConfig) -> Self {
            Self::with_admission(config, true)
        }

        fn with_admission(config: EngineConfig, authorize_client: bool) -> Self {
            let now = Instant::now();
            let client_identity = Identity::generate().unwrap();
            let gateway_identity = Identity::generate().unwrap();

            let client_control = StaticControl {
                grants: vec![
                    Grant {
                        resource: Resource::Cidr("192.168.10.0/24".parse().unwrap()),
                        peer: GATEWAY_ID,
                        identity: gateway_identity.public_key(),
                        allow: true,
                        expires_at: None,
                    },
                    Grant {
                        resource: Resource::dns("*.corp.example"),
                        peer: GATEWAY_ID,
                        identity: gateway_identity.public_key(),
                        allow: true,
                        expires_at: None,
                    },
                ],
                ..Default::default()
            };

            let mut gateway_control = StaticControl::default();
            if authorize_client {
                gateway_control.admissions.insert(
                    CLIENT_ID,
                    (
                        client_identity.public_key(),
                        Admission {
                            sources: vec!["100.64.0.1/32".parse().unwrap()],
                            destinations: vec!["192.168.10.0/24".parse().unwrap()],
                            expires_at: None,
                        },
                    ),
                );
            }

            let client = Engine::new(
                Role::Client,
                CLIENT_ID,
                client_identity,
                config.clone(),
                client_control,
                vec![client_addr()],
                now,
            );
            let gateway = Engine::new(
                Role::Gateway,
                GATEWAY_ID,
                gateway_identity,
                config,
                gateway_control,
                vec![gateway_addr()],
                now,
            );

            Self {
                client,
                gateway,
                client_events: Vec::new(),
                gateway_events: Vec::new(),
                now,
            }
        }

        /// Deliver everything in flight until both sides go quiet
        fn pump(&mut self) {
            for _ in 0..1000 {
                let mut moved = false;

                while let Some(t) = self.client.poll_transmit() {
                    moved = true;
                    if t.dst == gateway_addr() {
                        self.gateway.handle_network(client_addr(), &t.payload, self.now);
                    }
                }
                while let Some(t) = self.gateway.poll_transmit() {
                    moved = true;
                    if t.dst == client_addr() {
                        self.client.handle_network(gateway_addr(), &t.payload, self.now);
                    }
                }
                while let Some(event) = self.client.poll_event() {
                    moved = true;
                    match event {
                        EngineEvent::Signal(envelope) => {
                            let _ = self.gateway.handle_signaling(CLIENT_ID, envelope.message, self.now);
                        }
                        other => self.client_events.push(other),
                    }
                }
                while let Some(event) = self.gateway.poll_event() {
                    moved = true;
                    match event {
                        EngineEvent::Signal(envelope) => {
                            let _ = self.client.handle_signaling(GATEWAY_ID, envelope.message, self.now);
                        }
                        other => self.gateway_events.push(other),
                    }
                }

                if !moved {
                    return;
                }
            }
            panic!("network never settled");
        }

        fn advance(&mut self, by: Duration) {
            self.now += by;
            self.client.handle_timeout(self.now);
            self.gateway.handle_timeout(self.now);
            self.pump();
        }

        /// Advance in small steps so keepalives and retransmits run
        fn run_for(&mut self, total: Duration, step: Duration) {
            let mut elapsed = Duration::ZERO;
            while elapsed < total {
                self.advance(step);
                elapsed += step;
            }
        }

        fn connect(&mut self) {
            let first = ipv4_packet([100, 64, 0, 1], [192, 168, 10, 5], b"first");
            let result = self.client.route_outbound(&first, self.now);
            assert!(matches!(result, Err(EngineError::Route(RouteError::NoRoute(_)))));
            self.pump();
            self.run_for(Duration::from_millis(500), Duration::from_millis(50));
            assert!(self.client.is_connected(GATEWAY_ID));
        }

        fn drain_gateway_inbound(&mut self) -> Vec<Vec<u8>> {
            std::iter::from_fn(|| self.gateway.poll_inbound()).collect()
        }
    }

    fn count<F: Fn(&EngineEvent) -> bool>(events: &[EngineEvent], f: F) -> usize {
        events.iter().filter(|e| f(e)).count()
    }

    #[test]
    fn test_route_miss_connects_and_delivers() {
        let mut pair = Pair::new(EngineConfig::default());
        pair.connect();

        assert_eq!(count(&pair.client_events, |e| matches!(e, EngineEvent::RouteMiss { .. })), 1);
        assert_eq!(
            count(&pair.client_events, |e| matches!(e, EngineEvent::ConnectionEstablished { .. })),
            1
        );
        assert_eq!(pair.client.selected_path(GATEWAY_ID), Some(Path::direct(gateway_addr())));

        let packet = ipv4_packet([100, 64, 0, 1], [192, 168, 10, 5], b"hello");
        pair.client.route_outbound(&packet, pair.now).unwrap();
        pair.pump();

        assert_eq!(pair.drain_gateway_inbound(), vec![packet]);
        assert_eq!(
            count(&pair.gateway_events, |e| matches!(e, EngineEvent::ConnectionEstablished { .. })),
            1
        );
    }

    #[test]
    fn test_queued_packets_flushed_on_establish() {
        let mut pair = Pair::new(EngineConfig::default());

        let first = ipv4_packet([100, 64, 0, 1], [192, 168, 10, 5], b"dropped");
        assert!(pair.client.route_outbound(&first, pair.now).is_err());

        // Route admitted but no session yet: queued
        let queued = ipv4_packet([100, 64, 0, 1], [192, 168, 10, 5], b"queued");
        pair.client.route_outbound(&queued, pair.now).unwrap();
        assert_eq!(pair.client.stats().packets_queued, 1);

        pair.pump();
        pair.run_for(Duration::from_millis(500), Duration::from_millis(50));

        assert_eq!(pair.drain_gateway_inbound(), vec![queued]);
    }

    #[test]
    fn test_queue_is_bounded() {
        let config = EngineConfig {
            queue_capacity: 2,
            ..Default::default()
        };
        let mut pair = Pair::new(config);

        let miss = ipv4_packet([100, 64, 0, 1], [192, 168, 10, 5], b"miss");
        assert!(pair.client.route_outbound(&miss, pair.now).is_err());

        let packets: Vec<Vec<u8>> = (0..4u8)
            .map(|i| ipv4_packet([100, 64, 0, 1], [192, 168, 10, 5], &[i]))
            .collect();
        for packet in &packets {
            pair.client.route_outbound(packet, pair.now).unwrap();
        }
        assert_eq!(pair.client.stats().queue_drops, 2);

        pair.pump();
        pair.run_for(Duration::from_millis(500), Duration::from_millis(50));

        // Oldest dropped, newest kept in order
        assert_eq!(pair.drain_gateway_inbound(), packets[2..].to_vec());
    }

    #[test]
    fn test_unauthorized_client_rejected() {
        let mut pair = Pair::with_admission(EngineConfig::default(), false);

        let packet = ipv4_packet([100, 64, 0, 1], [192, 168, 10, 5], b"x");
        let _ = pair.client.route_outbound(&packet, pair.now);
        pair.pump();
        pair.run_for(Duration::from_secs(12), Duration::from_millis(500));

        assert!(!pair.client.is_connected(GATEWAY_ID));
        assert_eq!(pair.gateway.peer_count(), 0);
        assert!(pair
            .client_events
            .iter()
            .any(|e| matches!(e, EngineEvent::ConnectionFailed { peer, .. } if *peer == GATEWAY_ID)));
    }

    #[test]
    fn test_gateway_filters_outside_admission() {
        let mut pair = Pair::new(EngineConfig::default());
        pair.connect();
        pair.drain_gateway_inbound();

        // Spoofed source address
        let spoofed = ipv4_packet([100, 64, 0, 9], [192, 168, 10, 5], b"spoof");
        pair.client.route_outbound(&spoofed, pair.now).unwrap();
        pair.pump();

        assert!(pair.drain_gateway_inbound().is_empty());
        assert_eq!(pair.gateway.stats().packets_filtered, 1);
    }

    #[test]
    fn test_gateway_return_traffic() {
        let mut pair = Pair::new(EngineConfig::default());
        pair.connect();

        let reply = ipv4_packet([192, 168, 10, 5], [100, 64, 0, 1], b"reply");
        pair.gateway.route_outbound(&reply, pair.now).unwrap();
        pair.pump();

        assert_eq!(pair.client.poll_inbound(), Some(reply));
    }

    #[test]
    fn test_dns_resolution_is_stable() {
        let mut pair = Pair::new(EngineConfig::default());

        let first = pair.client.resolve_dns("wiki.corp.example", pair.now).unwrap().unwrap();
        let second = pair.client.resolve_dns("WIKI.corp.example.", pair.now).unwrap().unwrap();
        assert_eq!(first, second);
        assert!(pair.client.router().is_synthetic(&IpAddr::V4(first.0)));

        assert_eq!(pair.client.resolve_dns("www.example.org", pair.now).unwrap(), None);
    }

    #[test]
    fn test_idle_teardown_and_reconnect() {
        let config = EngineConfig {
            idle_timeout_ms: 60_000,
            ..Default::default()
        };
        let mut pair = Pair::new(config);
        pair.connect();

        pair.run_for(Duration::from_secs(65), Duration::from_secs(5));

        assert!(pair
            .client_events
            .iter()
            .any(|e| matches!(e, EngineEvent::ConnectionClosed { reason: CloseReason::Idle, .. })));
        assert!(!pair.client.is_connected(GATEWAY_ID));
        assert!(pair.client.router().is_empty());

        // Next packet starts over
        pair.client_events.clear();
        pair.connect();
        assert_eq!(
            count(&pair.client_events, |e| matches!(e, EngineEvent::ConnectionEstablished { .. })),
            1
        );
    }

    #[test]
    fn test_synthetic_address_reconnects_after_idle_teardown() {
        let config = EngineConfig {
            idle_timeout_ms: 60_000,
            ..Default::default()
        };
        let mut pair = Pair::new(config);

        let resolved = pair.client.resolve_dns("wiki.corp.example", pair.now).unwrap().unwrap();
        let v4 = resolved.0;
        pair.pump();
        pair.run_for(Duration::from_millis(500), Duration::from_millis(50));
        assert!(pair.client.is_connected(GATEWAY_ID));

        pair.run_for(Duration::from_secs(65), Duration::from_secs(5));
        assert!(!pair.client.is_connected(GATEWAY_ID));
        assert!(pair.client.router().is_empty());

        // The application still holds the cached answer
        pair.client_events.clear();
        let packet = ipv4_packet([100, 64, 0, 1], v4.octets(), b"cached");
        let result = pair.client.route_outbound(&packet, pair.now);
        assert_eq!(
            result,
            Err(EngineError::Route(RouteError::NoRoute(IpAddr::V4(v4))))
        );
        pair.pump();
        pair.run_for(Duration::from_millis(500), Duration::from_millis(50));

        assert!(pair.client.is_connected(GATEWAY_ID));
        assert_eq!(
            count(&pair.client_events, |e| matches!(e, EngineEvent::ConnectionEstablished { .. })),
            1
        );
        assert_eq!(pair.client.resolve_dns("wiki.corp.example", pair.now).unwrap(), Some(resolved));
    }

    #[test]
    fn test_signaling_reconnect_reannounces_candidates() {
        let mut pair = Pair::new(EngineConfig::default());
        let first = ipv4_packet([100, 64, 0, 1], [192, 168, 10, 5], b"first");
        let _ = pair.client.route_outbound(&first, pair.now);

        let offers = |engine: &mut Engine<StaticControl>| -> Vec<SignalingMessage> {
            std::iter::from_fn(|| engine.poll_event())
                .filter_map(|e| match e {
                    EngineEvent::Signal(envelope) if envelope.peer == GATEWAY_ID => Some(envelope.message),
                    _ => None,
                })
                .collect()
        };

        // The offer is lost with the signaling connection
        let lost = offers(&mut pair.client);
        assert_eq!(lost.len(), 1);
        assert!(matches!(lost[0], SignalingMessage::OfferCandidates { .. }));
        assert!(!lost[0].candidates().is_empty());

        pair.client.on_signaling_reconnected(pair.now);
        let again = offers(&mut pair.client);
        assert_eq!(again.len(), 1);
        assert!(matches!(again[0], SignalingMessage::OfferCandidates { .. }));
        assert_eq!(again[0].negotiation_id(), lost[0].negotiation_id());
        assert_eq!(again[0].candidates(), lost[0].candidates());

        // Delivering the re-announcement completes the tunnel
        pair.gateway
            .handle_signaling(CLIENT_ID, again[0].clone(), pair.now)
            .unwrap();
        pair.pump();
        pair.run_for(Duration::from_millis(500), Duration::from_millis(50));
        assert!(pair.client.is_connected(GATEWAY_ID));
    }

    #[test]
    fn test_rekey_delivers_exactly_once() {
        let mut pair = Pair::new(EngineConfig::default());
        pair.connect();
        pair.drain_gateway_inbound();

        let mut sent = Vec::new();
        for i in 0..30u32 {
            let packet = ipv4_packet([100, 64, 0, 1], [192, 168, 10, 5], &i.to_be_bytes());
            pair.client.route_outbound(&packet, pair.now).unwrap();
            sent.push(packet);
            pair.advance(Duration::from_secs(5));
        }

        assert_eq!(pair.drain_gateway_inbound(), sent);
        let stats = pair.client.stats();
        assert!(stats.peers[&GATEWAY_ID].handshakes_completed >= 2);
        assert!(pair
            .client_events
            .iter()
            .all(|e| !matches!(e, EngineEvent::ConnectionClosed { .. })));
    }

    #[test]
    fn test_replayed_data_dropped() {
        let mut pair = Pair::new(EngineConfig::default());
        pair.connect();
        pair.drain_gateway_inbound();

        let packet = ipv4_packet([100, 64, 0, 1], [192, 168, 10, 5], b"once");
        pair.client.route_outbound(&packet, pair.now).unwrap();
        let transmit = pair.client.poll_transmit().unwrap();

        pair.gateway.handle_network(client_addr(), &transmit.payload, pair.now);
        pair.gateway.handle_network(client_addr(), &transmit.payload, pair.now);

        assert_eq!(pair.drain_gateway_inbound(), vec![packet]);
        assert_eq!(pair.gateway.stats().peers[&CLIENT_ID].replays_detected, 1);
    }

    #[test]
    fn test_garbage_is_counted_not_fatal() {
        let mut pair = Pair::new(EngineConfig::default());
        pair.gateway.handle_network(client_addr(), &[0xFF, 1, 2, 3], pair.now);
        pair.gateway.handle_network(client_addr(), &[], pair.now);
        pair.gateway
            .handle_network(client_addr(), &[wire::TYPE_DATA, 0, 0, 0, 7], pair.now);

        assert_eq!(pair.gateway.stats().unknown_packets, 3);
    }

    #[test]
    fn test_reset_closes_everything() {
        let mut pair = Pair::new(EngineConfig::default());
        pair.connect();

        pair.client.reset(pair.now);
        pair.pump();

        assert!(pair
            .client_events
            .iter()
            .any(|e| matches!(e, EngineEvent::ConnectionClosed { reason: CloseReason::Reset, .. })));
        assert_eq!(pair.client.peer_count(), 0);
        assert!(pair.client.router().is_empty());
    }
}
