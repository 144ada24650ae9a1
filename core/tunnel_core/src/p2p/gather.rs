//! Candidate gathering
//!
//! One engine-wide gatherer produces the local candidates every negotiation
//! advertises:
//!
//! ```text
//! start_cycle()
//!   ├── host:    locally bound addresses                 (immediate)
//!   ├── srflx:   BindingRequest to each reflexive server (omitted on timeout)
//!   └── relayed: AllocateRequest on the first relay      (one per cycle)
//!                    │
//!                    └── Complete once every request resolved
//! ```
//!
//! A live allocation on the configured relay is reused by later cycles: the
//! relay keeps one allocation per client transport address, so allocating
//! again would invalidate paths still using it. Allocations on relays that
//! were removed by `update_relays` are released once no active path uses
//! them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::candidate::{gather_host_candidates, gather_reflexive_candidate, sort_candidates_by_priority, Candidate};
use super::transaction::{Transaction, TransactionId, TransactionPoll};
use crate::relay::message::{encode_relay, RelayBody, RelayMessage};
use crate::relay::{RelayClient, RelayEvent};
use crate::Transmit;

// ============================================================================
// Configuration and Events
// ============================================================================

#[derive(Debug, Clone)]
pub struct GatherConfig {
    /// Advertise loopback host candidates (tests, single-host setups)
    pub include_loopback: bool,
    /// Hard deadline per request
    pub request_timeout: Duration,
    /// Transmissions per request
    pub max_attempts: u32,
    pub allocation_lifetime_secs: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatherEvent {
    NewCandidate(Candidate),
    CandidateInvalidated(Candidate),
    /// Every request of the current cycle resolved
    Complete,
}

#[derive(Debug)]
struct BindingProbe {
    server: SocketAddr,
    txn: Transaction,
}

// ============================================================================
// Gatherer
// ============================================================================

#[derive(Debug)]
pub struct Gatherer {
    local_addrs: Vec<SocketAddr>,
    stun_servers: Vec<SocketAddr>,
    relay_servers: Vec<SocketAddr>,
    config: GatherConfig,
    candidates: Vec<Candidate>,
    probes: HashMap<TransactionId, BindingProbe>,
    relays: Vec<RelayClient>,
    /// Server of the allocation this cycle advertises
    current_relay: Option<SocketAddr>,
    /// Reflexive candidates not yet re-confirmed by the running cycle
    stale_reflexive: Vec<Candidate>,
    in_progress: bool,
    transmits: VecDeque<Transmit>,
    events: VecDeque<GatherEvent>,
}

impl Gatherer {
    pub fn new(
        local_addrs: Vec<SocketAddr>,
        stun_servers: Vec<SocketAddr>,
        relay_servers: Vec<SocketAddr>,
        config: GatherConfig,
    ) -> Self {
        Self {
            local_addrs,
            stun_servers,
            relay_servers,
            config,
            candidates: Vec::new(),
            probes: HashMap::new(),
            relays: Vec::new(),
            current_relay: None,
            stale_reflexive: Vec::new(),
            in_progress: false,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// Current local candidates, best first
    pub fn candidates(&self) -> Vec<Candidate> {
        let mut candidates = self.candidates.clone();
        sort_candidates_by_priority(&mut candidates);
        candidates
    }

    pub fn is_gathering(&self) -> bool {
        self.in_progress
    }

    /// Begin a new gathering cycle
    ///
    /// A cycle already running is left alone.
    pub fn start_cycle(&mut self, now: Instant) {
        if self.in_progress {
            return;
        }
        self.in_progress = true;
        log::debug!("Starting gather cycle");

        // Host candidates
        let hosts = gather_host_candidates(&self.local_addrs, self.config.include_loopback);
        let stale_hosts: Vec<Candidate> = self
            .candidates
            .iter()
            .filter(|c| c.kind == super::CandidateKind::Host && !hosts.contains(c))
            .cloned()
            .collect();
        for candidate in stale_hosts {
            self.invalidate(&candidate);
        }
        for candidate in hosts {
            self.add_candidate(candidate);
        }

        // Reflexive candidates must be re-confirmed by this cycle
        self.stale_reflexive = self
            .candidates
            .iter()
            .filter(|c| c.kind == super::CandidateKind::ServerReflexive)
            .cloned()
            .collect();

        for server in self.reflexive_servers() {
            self.send_binding(server, now);
        }

        self.ensure_allocation(now);
        self.check_complete();
    }

    /// Handle a relay control message from `from`
    ///
    /// Returns `(relayed, peer, data)` when the message carried peer data.
    pub fn handle_relay_message(
        &mut self,
        from: SocketAddr,
        msg: RelayMessage,
        now: Instant,
    ) -> Option<(SocketAddr, SocketAddr, Vec<u8>)> {
        if let RelayBody::BindingResponse { mapped } = msg.body {
            if let Some(probe) = self.probes.remove(&msg.transaction_id) {
                if probe.server == from {
                    self.add_reflexive(mapped);
                }
                self.check_complete();
                return None;
            }
        }

        let is_data = matches!(msg.body, RelayBody::DataIndication { .. });
        let client = self.relays.iter_mut().find(|c| {
            c.server() == from && (c.owns_transaction(&msg.transaction_id) || (is_data && c.is_usable()))
        })?;

        let relayed = client.relayed_address();
        let data = client.handle_message(msg, now);
        self.drain_relay_events(now);
        self.check_complete();

        match (relayed, data) {
            (Some(relayed), Some((peer, data))) => Some((relayed, peer, data)),
            _ => None,
        }
    }

    /// Resolve a ChannelData datagram from `from` to `(relayed, peer)`
    pub fn handle_channel_data(&self, from: SocketAddr, channel: u16) -> Option<(SocketAddr, SocketAddr)> {
        self.relays
            .iter()
            .filter(|c| c.server() == from)
            .find_map(|c| Some((c.relayed_address()?, c.handle_channel_data(channel)?)))
    }

    /// Send `payload` to `peer` through the allocation with address `relayed`
    pub fn encapsulate(
        &mut self,
        relayed: SocketAddr,
        peer: SocketAddr,
        payload: &[u8],
        now: Instant,
    ) -> Option<Transmit> {
        let client = self
            .relays
            .iter_mut()
            .find(|c| c.relayed_address() == Some(relayed))?;
        let transmit = client.encapsulate(peer, payload, now);
        self.collect_relay_transmits();
        transmit
    }

    /// Let `peer` reach us through every usable allocation
    pub fn create_permission(&mut self, peer: SocketAddr, now: Instant) {
        for client in self.relays.iter_mut().filter(|c| c.is_usable()) {
            client.create_permission(peer, now);
        }
        self.collect_relay_transmits();
    }

    /// Whether `addr` is one of our relay servers
    pub fn is_relay_server(&self, addr: &SocketAddr) -> bool {
        self.relays.iter().any(|c| c.server() == *addr)
            || self.relay_servers.contains(addr)
            || self.stun_servers.contains(addr)
    }

    /// Release allocations of previous relay sets that no path uses
    pub fn release_unused(&mut self, in_use: &HashSet<SocketAddr>, now: Instant) {
        let current = self.current_relay;
        for client in self.relays.iter_mut() {
            if Some(client.server()) == current || !client.is_usable() {
                continue;
            }
            let used = client
                .relayed_address()
                .map(|relayed| in_use.contains(&relayed))
                .unwrap_or(false);
            if !used {
                client.release(now);
            }
        }
        self.collect_relay_transmits();
        self.relays.retain(|c| !c.is_released());
    }

    /// Replace the reflexive-address and relay server sets
    pub fn update_relays(&mut self, stun_servers: Vec<SocketAddr>, relay_servers: Vec<SocketAddr>, now: Instant) {
        log::info!(
            "Updating servers: {} reflexive, {} relay",
            stun_servers.len(),
            relay_servers.len()
        );
        self.stun_servers = stun_servers;
        self.relay_servers = relay_servers;

        if let Some(current) = self.current_relay {
            if !self.relay_servers.contains(&current) {
                // Old allocation keeps serving active paths until released
                self.current_relay = None;
                let retired: Vec<Candidate> = self
                    .candidates
                    .iter()
                    .filter(|c| c.is_relayed() && c.related_address == Some(current))
                    .cloned()
                    .collect();
                for candidate in retired {
                    self.invalidate(&candidate);
                }
            }
        }

        self.in_progress = false;
        self.start_cycle(now);
    }

    /// Drop all gathering state, releasing every allocation
    pub fn reset(&mut self, now: Instant) {
        for client in self.relays.iter_mut() {
            client.release(now);
        }
        self.collect_relay_transmits();
        self.relays.clear();
        self.probes.clear();
        self.candidates.clear();
        self.stale_reflexive.clear();
        self.current_relay = None;
        self.in_progress = false;
        self.events.clear();
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        let mut retransmit = Vec::new();
        let mut timed_out = Vec::new();
        for (id, probe) in self.probes.iter_mut() {
            match probe.txn.poll(now) {
                TransactionPoll::Pending => {}
                TransactionPoll::Retransmit => retransmit.push((*id, probe.server)),
                TransactionPoll::TimedOut => timed_out.push(*id),
            }
        }
        for (id, server) in retransmit {
            self.queue_binding(id, server);
        }
        for id in timed_out {
            if let Some(probe) = self.probes.remove(&id) {
                log::debug!("Binding request to {} timed out, no reflexive candidate", probe.server);
            }
        }

        for client in self.relays.iter_mut() {
            client.handle_timeout(now);
        }
        self.drain_relay_events(now);
        self.relays.retain(|c| !c.is_released());

        self.check_complete();
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        let probes = self.probes.values().map(|p| p.txn.next_timeout());
        let relays = self.relays.iter().filter_map(|c| c.poll_timeout());
        probes.chain(relays).min()
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.collect_relay_transmits();
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<GatherEvent> {
        self.events.pop_front()
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Relays double as reflexive-address services when none are configured
    fn reflexive_servers(&self) -> Vec<SocketAddr> {
        if self.stun_servers.is_empty() {
            self.relay_servers.clone()
        } else {
            self.stun_servers.clone()
        }
    }

    fn ensure_allocation(&mut self, now: Instant) {
        let Some(server) = self.relay_servers.first().copied() else {
            return;
        };
        self.current_relay = Some(server);

        if let Some(client) = self.relays.iter().find(|c| c.server() == server && !c.is_released()) {
            if let (Some(relayed), Some(mapped)) = (client.relayed_address(), client.mapped_address()) {
                self.add_candidate(Candidate::relayed(relayed, server));
                self.add_reflexive(mapped);
            }
            return;
        }

        self.relays.push(RelayClient::allocate(
            server,
            self.config.allocation_lifetime_secs,
            self.config.max_attempts,
            self.config.request_timeout,
            now,
        ));
        self.collect_relay_transmits();
    }

    fn send_binding(&mut self, server: SocketAddr, now: Instant) {
        let Some(txn) = Transaction::start(now, self.config.max_attempts, self.config.request_timeout) else {
            log::error!("No randomness for a transaction id, skipping binding to {}", server);
            return;
        };
        let id = txn.id();
        self.probes.insert(id, BindingProbe { server, txn });
        self.queue_binding(id, server);
    }

    fn queue_binding(&mut self, transaction_id: TransactionId, server: SocketAddr) {
        let msg = RelayMessage {
            transaction_id,
            body: RelayBody::BindingRequest,
        };
        match encode_relay(&msg) {
            Ok(payload) => self.transmits.push_back(Transmit { dst: server, payload }),
            Err(e) => log::warn!("Failed to encode binding request: {}", e),
        }
    }

    fn add_reflexive(&mut self, mapped: SocketAddr) {
        let Some(base) = self.local_addrs.first().copied() else {
            return;
        };
        if let Some(candidate) = gather_reflexive_candidate(mapped, base) {
            self.stale_reflexive.retain(|c| *c != candidate);
            self.add_candidate(candidate);
        }
    }

    fn add_candidate(&mut self, candidate: Candidate) {
        if self.candidates.contains(&candidate) {
            return;
        }
        log::debug!("New local candidate: {}", candidate);
        self.candidates.push(candidate.clone());
        self.events.push_back(GatherEvent::NewCandidate(candidate));
    }

    fn invalidate(&mut self, candidate: &Candidate) {
        let before = self.candidates.len();
        self.candidates.retain(|c| c != candidate);
        if self.candidates.len() != before {
            log::debug!("Invalidated local candidate: {}", candidate);
            self.events
                .push_back(GatherEvent::CandidateInvalidated(candidate.clone()));
        }
    }

    fn drain_relay_events(&mut self, now: Instant) {
        let mut collected = Vec::new();
        for client in self.relays.iter_mut() {
            while let Some(event) = client.poll_event() {
                collected.push((client.server(), event));
            }
        }

        for (server, event) in collected {
            match event {
                RelayEvent::Allocated { relayed, mapped } => {
                    if Some(server) == self.current_relay {
                        self.add_candidate(Candidate::relayed(relayed, server));
                        self.add_reflexive(mapped);
                    }
                }
                RelayEvent::AllocationFailed(e) => {
                    log::warn!("No relayed candidate from {}: {}", server, e);
                }
                RelayEvent::Lost { relayed } => {
                    self.invalidate(&Candidate::relayed(relayed, server));
                    if Some(server) == self.current_relay {
                        log::info!("Re-allocating on {}", server);
                        self.relays.retain(|c| c.server() != server || !c.is_released());
                        self.ensure_allocation(now);
                    }
                }
            }
        }

        self.collect_relay_transmits();
    }

    fn collect_relay_transmits(&mut self) {
        for client in self.relays.iter_mut() {
            while let Some(transmit) = client.poll_transmit() {
                self.transmits.push_back(transmit);
            }
        }
    }

    fn check_complete(&mut self) {
        if !self.in_progress || !self.probes.is_empty() {
            return;
        }
        let allocating = self
            .relays
            .iter()
            .any(|c| Some(c.server()) == self.current_relay && c.is_allocating());
        if allocating {
            return;
        }

        for candidate in std::mem::take(&mut self.stale_reflexive) {
            self.invalidate(&candidate);
        }

        self.in_progress = false;
        log::debug!("Gather cycle complete: {} candidates", self.candidates.len());
        self.events.push_back(GatherEvent::Complete);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::CandidateKind;
    use crate::relay::message::decode_relay;

    fn local() -> SocketAddr {
        "192.168.1.10:5000".parse().unwrap()
    }

    fn relay() -> SocketAddr {
        "198.51.100.1:3478".parse().unwrap()
    }

    fn relayed() -> SocketAddr {
        "198.51.100.1:49152".parse().unwrap()
    }

    fn mapped() -> SocketAddr {
        "203.0.113.7:61000".parse().unwrap()
    }

    fn config() -> GatherConfig {
        GatherConfig {
            include_loopback: false,
            request_timeout: Duration::from_secs(3),
            max_attempts: 5,
            allocation_lifetime_secs: 600,
        }
    }

    fn gatherer(relays: Vec<SocketAddr>) -> Gatherer {
        Gatherer::new(vec![local()], vec![], relays, config())
    }

    fn drain_requests(gatherer: &mut Gatherer) -> Vec<(SocketAddr, RelayMessage)> {
        let mut out = Vec::new();
        while let Some(t) = gatherer.poll_transmit() {
            out.push((t.dst, decode_relay(&t.payload).unwrap()));
        }
        out
    }

    fn drain_events(gatherer: &mut Gatherer) -> Vec<GatherEvent> {
        std::iter::from_fn(|| gatherer.poll_event()).collect()
    }

    fn answer(gatherer: &mut Gatherer, request: &RelayMessage, body: RelayBody, now: Instant) {
        let response = RelayMessage {
            transaction_id: request.transaction_id,
            body,
        };
        assert!(gatherer.handle_relay_message(relay(), response, now).is_none());
    }

    fn complete_cycle(gatherer: &mut Gatherer, now: Instant) {
        gatherer.start_cycle(now);
        for (_, request) in drain_requests(gatherer) {
            let body = match request.body {
                RelayBody::BindingRequest => RelayBody::BindingResponse { mapped: mapped() },
                RelayBody::AllocateRequest { .. } => RelayBody::AllocateResponse {
                    allocation_id: 1,
                    relayed: relayed(),
                    mapped: mapped(),
                    lifetime_secs: 600,
                },
                other => panic!("unexpected request {:?}", other),
            };
            answer(gatherer, &request, body, now);
        }
    }

    #[test]
    fn test_host_only_completes_immediately() {
        let now = Instant::now();
        let mut g = gatherer(vec![]);

        g.start_cycle(now);

        let events = drain_events(&mut g);
        assert_eq!(
            events,
            vec![GatherEvent::NewCandidate(Candidate::host(local())), GatherEvent::Complete]
        );
        assert!(!g.is_gathering());
    }

    #[test]
    fn test_full_cycle_orders_candidates() {
        let now = Instant::now();
        let mut g = gatherer(vec![relay()]);

        complete_cycle(&mut g, now);

        let kinds: Vec<CandidateKind> = g.candidates().iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![CandidateKind::Host, CandidateKind::ServerReflexive, CandidateKind::Relayed]
        );
        assert_eq!(drain_events(&mut g).last(), Some(&GatherEvent::Complete));
    }

    #[test]
    fn test_reflexive_omitted_on_timeout() {
        let now = Instant::now();
        let mut g = Gatherer::new(vec![local()], vec!["192.0.2.1:3478".parse().unwrap()], vec![], config());

        g.start_cycle(now);
        assert!(g.is_gathering());

        let mut at = now;
        while g.is_gathering() {
            at = g.poll_timeout().unwrap();
            g.handle_timeout(at);
        }

        assert!(at <= now + Duration::from_secs(3));
        assert_eq!(g.candidates(), vec![Candidate::host(local())]);
        assert_eq!(drain_events(&mut g).last(), Some(&GatherEvent::Complete));
    }

    #[test]
    fn test_second_cycle_reuses_allocation() {
        let now = Instant::now();
        let mut g = gatherer(vec![relay()]);
        complete_cycle(&mut g, now);
        drain_events(&mut g);

        g.start_cycle(now + Duration::from_secs(1));
        let requests = drain_requests(&mut g);

        assert!(requests
            .iter()
            .all(|(_, r)| !matches!(r.body, RelayBody::AllocateRequest { .. })));
        assert!(g.candidates().iter().any(|c| c.is_relayed()));
    }

    #[test]
    fn test_lost_allocation_invalidates_and_reallocates() {
        let now = Instant::now();
        let mut g = gatherer(vec![relay()]);
        complete_cycle(&mut g, now);
        drain_events(&mut g);

        g.handle_timeout(now + Duration::from_secs(601));

        let events = drain_events(&mut g);
        assert!(events.contains(&GatherEvent::CandidateInvalidated(Candidate::relayed(relayed(), relay()))));
        assert!(drain_requests(&mut g)
            .iter()
            .any(|(_, r)| matches!(r.body, RelayBody::AllocateRequest { .. })));
    }

    #[test]
    fn test_retired_allocation_released_when_unused() {
        let now = Instant::now();
        let mut g = gatherer(vec![relay()]);
        complete_cycle(&mut g, now);
        drain_events(&mut g);

        let new_relay: SocketAddr = "198.51.100.2:3478".parse().unwrap();
        g.update_relays(vec![], vec![new_relay], now);
        assert!(drain_events(&mut g)
            .contains(&GatherEvent::CandidateInvalidated(Candidate::relayed(relayed(), relay()))));
        drain_requests(&mut g);

        // Still carrying a path: kept
        let in_use: HashSet<SocketAddr> = [relayed()].into_iter().collect();
        g.release_unused(&in_use, now);
        assert!(drain_requests(&mut g).is_empty());

        g.release_unused(&HashSet::new(), now);
        let released = drain_requests(&mut g);
        assert!(released.iter().any(|(dst, r)| *dst == relay()
            && r.body
                == RelayBody::RefreshRequest {
                    allocation_id: 1,
                    lifetime_secs: 0
                }));
    }

    #[test]
    fn test_data_indication_surfaces_peer_data() {
        let now = Instant::now();
        let mut g = gatherer(vec![relay()]);
        complete_cycle(&mut g, now);

        let peer: SocketAddr = "203.0.113.50:7000".parse().unwrap();
        let msg = RelayMessage {
            transaction_id: [0u8; 12],
            body: RelayBody::DataIndication {
                peer,
                data: vec![1, 2, 3],
            },
        };

        assert_eq!(
            g.handle_relay_message(relay(), msg, now),
            Some((relayed(), peer, vec![1, 2, 3]))
        );
    }
}
