//! Relay shard
//!
//! Sans-IO state for the allocations owned by one worker. The worker feeds
//! it datagrams from clients (received on the listen socket) and from peers
//! (received on relayed sockets) and drains `Output`s to send.
//!
//! ```text
//!  client ──(listen socket)──► handle_client ──► Output::ToPeer ──(relayed socket)──► peer
//!  client ◄──(listen socket)── Output::ToClient ◄── handle_peer ◄──(relayed socket)── peer
//! ```
//!
//! Nothing is forwarded to or from a peer without a live permission for its
//! exact transport address.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ring::rand::{SecureRandom, SystemRandom};
use tunnel_core::p2p::TransactionId;
use tunnel_core::rate_limit::TokenBucket;
use tunnel_core::relay::message::{
    decode_channel_data, decode_relay, encode_channel_data, encode_relay, AllocationId, RelayBody,
    RelayErrorCode, RelayMessage,
};
use tunnel_core::wire::{self, PacketKind};

use crate::allocation::Allocation;
use crate::config::RelayConfig;
use crate::metrics::Metrics;

// ============================================================================
// Sharding
// ============================================================================

/// Shard owning the allocations of clients at `ip`
pub fn shard_for_ip(ip: IpAddr, shards: usize) -> usize {
    let key = match ip {
        IpAddr::V4(v4) => u64::from(u32::from(v4)),
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            (bits as u64) ^ ((bits >> 64) as u64)
        }
    };
    let mixed = key.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    ((mixed >> 32) % shards as u64) as usize
}

/// Shard that generated allocation `id`
pub fn shard_for_allocation(id: AllocationId, shards: usize) -> usize {
    (id % shards as u64) as usize
}

/// Process-wide allocation ceiling shared by all shards
#[derive(Debug)]
pub struct AllocationCeiling {
    live: AtomicUsize,
    max: usize,
}

impl AllocationCeiling {
    pub fn new(max: usize) -> Self {
        Self {
            live: AtomicUsize::new(0),
            max,
        }
    }

    pub fn try_reserve(&self) -> bool {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < self.max).then_some(n + 1))
            .is_ok()
    }

    pub fn release(&self) {
        let _ = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

// ============================================================================
// I/O seam
// ============================================================================

/// Relayed sockets, one per allocation
pub trait RelaySockets {
    /// Bind a socket for `id` and return the address to advertise
    fn open(&mut self, id: AllocationId) -> io::Result<SocketAddr>;

    fn close(&mut self, id: AllocationId);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// Send from the listen socket
    ToClient { dst: SocketAddr, payload: Vec<u8> },
    /// Send from the allocation's relayed socket
    ToPeer {
        allocation: AllocationId,
        dst: SocketAddr,
        payload: Vec<u8>,
    },
}

/// Target of client traffic
#[derive(Debug, Clone, Copy)]
enum PeerRef {
    Addr(SocketAddr),
    Channel(u16),
}

// ============================================================================
// Shard
// ============================================================================

pub struct RelayShard<S: RelaySockets> {
    index: usize,
    shards: usize,
    config: Arc<RelayConfig>,
    sockets: S,
    metrics: Arc<Metrics>,
    ceiling: Arc<AllocationCeiling>,
    allocations: HashMap<AllocationId, Allocation>,
    by_client: HashMap<SocketAddr, AllocationId>,
    per_ip: HashMap<IpAddr, usize>,
    limiters: HashMap<IpAddr, TokenBucket>,
    rng: SystemRandom,
    outputs: VecDeque<Output>,
    next_sweep: Instant,
}

impl<S: RelaySockets> RelayShard<S> {
    pub fn new(
        index: usize,
        shards: usize,
        config: Arc<RelayConfig>,
        sockets: S,
        metrics: Arc<Metrics>,
        ceiling: Arc<AllocationCeiling>,
        now: Instant,
    ) -> Self {
        let next_sweep = now + config.sweep_interval();
        Self {
            index,
            shards,
            config,
            sockets,
            metrics,
            ceiling,
            allocations: HashMap::new(),
            by_client: HashMap::new(),
            per_ip: HashMap::new(),
            limiters: HashMap::new(),
            rng: SystemRandom::new(),
            outputs: VecDeque::new(),
            next_sweep,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    pub fn allocation(&self, id: AllocationId) -> Option<&Allocation> {
        self.allocations.get(&id)
    }

    pub fn sockets(&self) -> &S {
        &self.sockets
    }

    pub fn sockets_mut(&mut self) -> &mut S {
        &mut self.sockets
    }

    pub fn poll_output(&mut self) -> Option<Output> {
        self.outputs.pop_front()
    }

    pub fn poll_timeout(&self) -> Instant {
        self.next_sweep
    }

    // ------------------------------------------------------------------------
    // Inputs
    // ------------------------------------------------------------------------

    /// Datagram received on the listen socket
    ///
    /// Requests are answered with a response or an ErrorResponse; the
    /// returned error additionally reports why an indication or ChannelData
    /// was dropped.
    pub fn handle_client(&mut self, from: SocketAddr, packet: &[u8], now: Instant) -> Result<(), RelayErrorCode> {
        match wire::classify(packet) {
            Some(PacketKind::Relay) => match decode_relay(packet) {
                Ok(msg) => self.handle_message(from, msg, now),
                Err(e) => {
                    log::debug!("Malformed relay message from {}: {}", from, e);
                    Metrics::incr(&self.metrics.malformed_total);
                    Err(RelayErrorCode::BadRequest)
                }
            },
            Some(PacketKind::ChannelData) => match decode_channel_data(packet) {
                Ok((channel, payload)) => {
                    let Some(&id) = self.by_client.get(&from) else {
                        log::debug!("ChannelData from {} without allocation", from);
                        Metrics::incr(&self.metrics.dropped_no_allocation_total);
                        return Err(RelayErrorCode::NoSuchAllocation);
                    };
                    self.relay_to_peer(from, id, PeerRef::Channel(channel), payload.to_vec(), now)
                }
                Err(e) => {
                    log::debug!("Malformed ChannelData from {}: {}", from, e);
                    Metrics::incr(&self.metrics.malformed_total);
                    Err(RelayErrorCode::BadRequest)
                }
            },
            _ => {
                log::trace!("Ignoring {} byte datagram from {}", packet.len(), from);
                Metrics::incr(&self.metrics.malformed_total);
                Err(RelayErrorCode::BadRequest)
            }
        }
    }

    /// Datagram received on allocation `id`'s relayed socket
    pub fn handle_peer(
        &mut self,
        id: AllocationId,
        from: SocketAddr,
        data: &[u8],
        now: Instant,
    ) -> Result<(), RelayErrorCode> {
        let metrics = Arc::clone(&self.metrics);
        let quota = self.config.max_bytes_per_allocation;

        let Some(alloc) = self.live(id, now) else {
            Metrics::incr(&metrics.dropped_no_allocation_total);
            return Err(RelayErrorCode::NoSuchAllocation);
        };

        if !alloc.has_permission(from, now) {
            log::debug!("Dropping datagram from {} on allocation {}: no permission", from, id);
            Metrics::incr(&metrics.dropped_no_permission_total);
            return Err(RelayErrorCode::NoPermission);
        }
        if !alloc.charge(data.len(), quota) {
            Metrics::incr(&metrics.dropped_quota_total);
            return Err(RelayErrorCode::QuotaExceeded);
        }

        let client = alloc.client;
        let payload = match alloc.channel_for(from, now) {
            Some(channel) => encode_channel_data(channel, data),
            None => {
                let msg = RelayMessage {
                    transaction_id: [0u8; 12],
                    body: RelayBody::DataIndication {
                        peer: from,
                        data: data.to_vec(),
                    },
                };
                match encode_relay(&msg) {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::warn!("Failed to encode data indication: {}", e);
                        return Err(RelayErrorCode::BadRequest);
                    }
                }
            }
        };

        metrics.record_relayed(data.len());
        self.outputs.push_back(Output::ToClient { dst: client, payload });
        Ok(())
    }

    /// Periodic sweep of expired allocations, permissions and limiters
    pub fn handle_timeout(&mut self, now: Instant) {
        if now < self.next_sweep {
            return;
        }
        self.next_sweep = now + self.config.sweep_interval();

        let expired: Vec<AllocationId> = self
            .allocations
            .values()
            .filter(|alloc| alloc.is_expired(now))
            .map(|alloc| alloc.id)
            .collect();
        for id in expired {
            self.remove(id, true);
        }

        for alloc in self.allocations.values_mut() {
            alloc.prune(now);
        }
        self.limiters.retain(|_, bucket| !bucket.is_full(now));
    }

    /// Drop every allocation (shutdown)
    pub fn release_all(&mut self) {
        let ids: Vec<AllocationId> = self.allocations.keys().copied().collect();
        for id in ids {
            self.remove(id, false);
        }
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    fn handle_message(&mut self, from: SocketAddr, msg: RelayMessage, now: Instant) -> Result<(), RelayErrorCode> {
        let result = match msg.body {
            RelayBody::BindingRequest => {
                Metrics::incr(&self.metrics.binding_requests_total);
                Ok(RelayBody::BindingResponse { mapped: from })
            }
            RelayBody::AllocateRequest { lifetime_secs } => {
                self.allocate(from, msg.transaction_id, lifetime_secs, now)
            }
            RelayBody::RefreshRequest {
                allocation_id,
                lifetime_secs,
            } => self.refresh(from, allocation_id, lifetime_secs, now),
            RelayBody::CreatePermissionRequest { allocation_id, peer } => {
                self.create_permission(from, allocation_id, peer, now)
            }
            RelayBody::ChannelBindRequest {
                allocation_id,
                channel,
                peer,
            } => self.bind_channel(from, allocation_id, channel, peer, now),
            RelayBody::SendIndication {
                allocation_id,
                peer,
                data,
            } => return self.relay_to_peer(from, allocation_id, PeerRef::Addr(peer), data, now),
            other => {
                log::debug!("Unexpected relay message from {}: {:?}", from, other);
                Metrics::incr(&self.metrics.malformed_total);
                return Err(RelayErrorCode::BadRequest);
            }
        };

        match result {
            Ok(body) => {
                self.respond(from, msg.transaction_id, body);
                Ok(())
            }
            Err(code) => {
                self.respond(from, msg.transaction_id, RelayBody::ErrorResponse { code });
                Err(code)
            }
        }
    }

    fn allocate(
        &mut self,
        from: SocketAddr,
        transaction_id: TransactionId,
        lifetime_secs: u32,
        now: Instant,
    ) -> Result<RelayBody, RelayErrorCode> {
        let config = Arc::clone(&self.config);
        let lifetime_secs = config.allocation_lifetime(lifetime_secs);
        let lifetime = secs(lifetime_secs);

        let existing = match self.by_client.get(&from).copied() {
            Some(id) => self
                .owned(from, id, now)
                .ok()
                .map(|alloc| (id, alloc.created_by, alloc.relayed, alloc.remaining_secs(now))),
            None => None,
        };
        if let Some((id, created_by, relayed, remaining_secs)) = existing {
            // Retransmit of the request that created it
            if created_by == transaction_id {
                return Ok(RelayBody::AllocateResponse {
                    allocation_id: id,
                    relayed,
                    mapped: from,
                    lifetime_secs: remaining_secs,
                });
            }
        }

        let ip = from.ip();
        let limiter = self
            .limiters
            .entry(ip)
            .or_insert_with(|| TokenBucket::new(config.allocate_rate, config.allocate_burst, now));
        if !limiter.try_acquire(now) {
            log::debug!("Allocate from {} throttled", from);
            Metrics::incr(&self.metrics.allocation_rejections_total);
            return Err(RelayErrorCode::Throttled);
        }

        // One allocation per client address: a new Allocate replaces the old one
        if let Some((id, ..)) = existing {
            log::info!("Allocate from {} replaces allocation {}", from, id);
            self.remove(id, false);
        }

        if self.per_ip.get(&ip).copied().unwrap_or(0) >= config.max_allocations_per_ip {
            log::warn!("Allocate from {} refused: per-address quota reached", from);
            Metrics::incr(&self.metrics.allocation_rejections_total);
            return Err(RelayErrorCode::QuotaExceeded);
        }

        if !self.ceiling.try_reserve() {
            log::warn!("Allocate from {} refused: relay at capacity", from);
            Metrics::incr(&self.metrics.allocation_rejections_total);
            return Err(RelayErrorCode::QuotaExceeded);
        }

        let Some(id) = self.generate_id() else {
            log::error!("No randomness for an allocation id, refusing {}", from);
            self.ceiling.release();
            Metrics::incr(&self.metrics.allocation_rejections_total);
            return Err(RelayErrorCode::QuotaExceeded);
        };
        let relayed = match self.sockets.open(id) {
            Ok(addr) => addr,
            Err(e) => {
                log::warn!("Cannot bind relayed socket for {}: {}", from, e);
                self.ceiling.release();
                Metrics::incr(&self.metrics.allocation_rejections_total);
                return Err(RelayErrorCode::QuotaExceeded);
            }
        };

        self.allocations
            .insert(id, Allocation::new(id, from, relayed, transaction_id, lifetime, now));
        self.by_client.insert(from, id);
        *self.per_ip.entry(ip).or_insert(0) += 1;
        Metrics::incr(&self.metrics.allocations_total);
        Metrics::incr(&self.metrics.allocations_active);

        log::info!(
            "Allocation {} for {} relayed at {} ({}s)",
            id,
            from,
            relayed,
            lifetime_secs
        );

        Ok(RelayBody::AllocateResponse {
            allocation_id: id,
            relayed,
            mapped: from,
            lifetime_secs,
        })
    }

    fn refresh(
        &mut self,
        from: SocketAddr,
        id: AllocationId,
        lifetime_secs: u32,
        now: Instant,
    ) -> Result<RelayBody, RelayErrorCode> {
        if lifetime_secs == 0 {
            self.owned(from, id, now)?;
            self.remove(id, false);
            return Ok(RelayBody::RefreshResponse { lifetime_secs: 0 });
        }

        let lifetime_secs = self.config.allocation_lifetime(lifetime_secs);
        let alloc = self.owned(from, id, now)?;
        alloc.refresh(secs(lifetime_secs), now);
        Ok(RelayBody::RefreshResponse { lifetime_secs })
    }

    fn create_permission(
        &mut self,
        from: SocketAddr,
        id: AllocationId,
        peer: SocketAddr,
        now: Instant,
    ) -> Result<RelayBody, RelayErrorCode> {
        let config = Arc::clone(&self.config);
        let alloc = self.owned(from, id, now)?;
        alloc.create_permission(
            peer,
            secs(config.permission_lifetime_secs),
            config.max_permissions,
            now,
        )?;
        log::debug!("Permission for {} on allocation {}", peer, id);

        Ok(RelayBody::CreatePermissionResponse {
            lifetime_secs: config.permission_lifetime_secs,
        })
    }

    fn bind_channel(
        &mut self,
        from: SocketAddr,
        id: AllocationId,
        channel: u16,
        peer: SocketAddr,
        now: Instant,
    ) -> Result<RelayBody, RelayErrorCode> {
        let config = Arc::clone(&self.config);
        let alloc = self.owned(from, id, now)?;
        alloc.bind_channel(
            channel,
            peer,
            secs(config.channel_lifetime_secs),
            secs(config.permission_lifetime_secs),
            (config.max_channels, config.max_permissions),
            now,
        )?;
        log::debug!("Channel {:#06x} bound to {} on allocation {}", channel, peer, id);

        Ok(RelayBody::ChannelBindResponse {
            lifetime_secs: config.channel_lifetime_secs,
        })
    }

    fn relay_to_peer(
        &mut self,
        from: SocketAddr,
        id: AllocationId,
        target: PeerRef,
        data: Vec<u8>,
        now: Instant,
    ) -> Result<(), RelayErrorCode> {
        let metrics = Arc::clone(&self.metrics);
        let config = Arc::clone(&self.config);

        let alloc = match self.owned(from, id, now) {
            Ok(alloc) => alloc,
            Err(code) => {
                log::debug!("Dropping relay from {}: no allocation {}", from, id);
                Metrics::incr(&metrics.dropped_no_allocation_total);
                return Err(code);
            }
        };

        let peer = match target {
            PeerRef::Addr(peer) => peer,
            PeerRef::Channel(channel) => match alloc.channel_peer(channel, now) {
                Some(peer) => peer,
                None => {
                    log::debug!("Dropping ChannelData on unbound channel {:#06x} from {}", channel, from);
                    Metrics::incr(&metrics.dropped_unbound_channel_total);
                    return Err(RelayErrorCode::UnboundChannel);
                }
            },
        };

        if !alloc.has_permission(peer, now) {
            log::debug!("Dropping relay from {} to {}: no permission", from, peer);
            Metrics::incr(&metrics.dropped_no_permission_total);
            return Err(RelayErrorCode::NoPermission);
        }
        if !alloc.charge(data.len(), config.max_bytes_per_allocation) {
            log::debug!("Allocation {} exhausted its byte quota", id);
            Metrics::incr(&metrics.dropped_quota_total);
            return Err(RelayErrorCode::QuotaExceeded);
        }
        alloc.touch_permission(peer, secs(config.permission_lifetime_secs), now);

        metrics.record_relayed(data.len());
        self.outputs.push_back(Output::ToPeer {
            allocation: id,
            dst: peer,
            payload: data,
        });
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Live allocation, removing it first if it has expired
    fn live(&mut self, id: AllocationId, now: Instant) -> Option<&mut Allocation> {
        if self.allocations.get(&id)?.is_expired(now) {
            self.remove(id, true);
            return None;
        }
        self.allocations.get_mut(&id)
    }

    /// Live allocation owned by `from`
    fn owned(&mut self, from: SocketAddr, id: AllocationId, now: Instant) -> Result<&mut Allocation, RelayErrorCode> {
        match self.live(id, now) {
            Some(alloc) if alloc.client == from => Ok(alloc),
            _ => Err(RelayErrorCode::NoSuchAllocation),
        }
    }

    fn remove(&mut self, id: AllocationId, expired: bool) {
        let Some(alloc) = self.allocations.remove(&id) else {
            return;
        };

        self.by_client.remove(&alloc.client);
        let ip = alloc.client.ip();
        if let Some(count) = self.per_ip.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_ip.remove(&ip);
            }
        }
        self.sockets.close(id);
        self.ceiling.release();
        self.metrics.allocations_active.fetch_sub(1, Ordering::Relaxed);

        if expired {
            Metrics::incr(&self.metrics.allocations_expired_total);
            log::info!("Allocation {} for {} expired", id, alloc.client);
        } else {
            log::info!(
                "Allocation {} for {} released ({} bytes relayed)",
                id,
                alloc.client,
                alloc.bytes_relayed()
            );
        }
    }

    /// Random id with `id % shards == index`, `None` if the system RNG fails
    fn generate_id(&self) -> Option<AllocationId> {
        loop {
            let mut bytes = [0u8; 8];
            self.rng.fill(&mut bytes).ok()?;
            let base = u64::from_be_bytes(bytes) >> 1;
            let id = base - shard_for_allocation(base, self.shards) as u64 + self.index as u64;
            if !self.allocations.contains_key(&id) {
                return Some(id);
            }
        }
    }

    fn respond(&mut self, dst: SocketAddr, transaction_id: [u8; 12], body: RelayBody) {
        let msg = RelayMessage { transaction_id, body };
        match encode_relay(&msg) {
            Ok(payload) => self.outputs.push_back(Output::ToClient { dst, payload }),
            Err(e) => log::warn!("Failed to encode relay response: {}", e),
        }
    }
}

fn secs(value: u32) -> Duration {
    Duration::from_secs(u64::from(value))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[derive(Debug, Default)]
    struct FakeSockets {
        next_port: u16,
        open: HashSet<AllocationId>,
        fail: bool,
    }

    impl RelaySockets for FakeSockets {
        fn open(&mut self, id: AllocationId) -> io::Result<SocketAddr> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::AddrInUse, "no ports"));
            }
            self.next_port += 1;
            self.open.insert(id);
            Ok(SocketAddr::from(([203, 0, 113, 1], 50_000 + self.next_port)))
        }

        fn close(&mut self, id: AllocationId) {
            self.open.remove(&id);
        }
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn client() -> SocketAddr {
        addr("198.51.100.10:40000")
    }

    fn peer() -> SocketAddr {
        addr("192.0.2.5:7000")
    }

    fn shard_with(config: RelayConfig, now: Instant) -> RelayShard<FakeSockets> {
        let ceiling = Arc::new(AllocationCeiling::new(config.max_allocations));
        RelayShard::new(
            0,
            1,
            Arc::new(config),
            FakeSockets::default(),
            Arc::new(Metrics::new()),
            ceiling,
            now,
        )
    }

    fn send(shard: &mut RelayShard<FakeSockets>, from: SocketAddr, body: RelayBody, now: Instant) -> Result<(), RelayErrorCode> {
        let msg = RelayMessage {
            transaction_id: [9u8; 12],
            body,
        };
        shard.handle_client(from, &encode_relay(&msg).unwrap(), now)
    }

    /// Send a request and return the response body addressed to `from`
    fn request(shard: &mut RelayShard<FakeSockets>, from: SocketAddr, body: RelayBody, now: Instant) -> RelayBody {
        let _ = send(shard, from, body, now);
        match shard.poll_output() {
            Some(Output::ToClient { dst, payload }) => {
                assert_eq!(dst, from);
                let msg = decode_relay(&payload).unwrap();
                assert_eq!(msg.transaction_id, [9u8; 12]);
                msg.body
            }
            other => panic!("expected a response, got {:?}", other),
        }
    }

    fn allocate(shard: &mut RelayShard<FakeSockets>, from: SocketAddr, now: Instant) -> (AllocationId, SocketAddr) {
        match request(shard, from, RelayBody::AllocateRequest { lifetime_secs: 0 }, now) {
            RelayBody::AllocateResponse {
                allocation_id, relayed, ..
            } => (allocation_id, relayed),
            other => panic!("allocation failed: {:?}", other),
        }
    }

    fn permit(shard: &mut RelayShard<FakeSockets>, id: AllocationId, peer: SocketAddr, now: Instant) {
        let body = request(
            shard,
            client(),
            RelayBody::CreatePermissionRequest {
                allocation_id: id,
                peer,
            },
            now,
        );
        assert_eq!(body, RelayBody::CreatePermissionResponse { lifetime_secs: 300 });
    }

    fn send_indication(id: AllocationId, peer: SocketAddr, data: &[u8]) -> RelayBody {
        RelayBody::SendIndication {
            allocation_id: id,
            peer,
            data: data.to_vec(),
        }
    }

    fn counter(shard: &RelayShard<FakeSockets>, pick: fn(&Metrics) -> &std::sync::atomic::AtomicU64) -> u64 {
        pick(&shard.metrics).load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------------

    #[test]
    fn test_shard_functions() {
        for shards in 1..8 {
            let ip: IpAddr = "198.51.100.10".parse().unwrap();
            assert!(shard_for_ip(ip, shards) < shards);
            assert_eq!(shard_for_allocation(10 * shards as u64 + 1, shards), 1 % shards);
        }
    }

    #[test]
    fn test_binding_request() {
        let now = Instant::now();
        let mut shard = shard_with(RelayConfig::default(), now);

        let body = request(&mut shard, client(), RelayBody::BindingRequest, now);
        assert_eq!(body, RelayBody::BindingResponse { mapped: client() });
        assert_eq!(counter(&shard, |m| &m.binding_requests_total), 1);
    }

    #[test]
    fn test_allocation_ids_match_shard() {
        let now = Instant::now();
        let config = Arc::new(RelayConfig::default());
        let mut shard = RelayShard::new(
            2,
            4,
            config,
            FakeSockets::default(),
            Arc::new(Metrics::new()),
            Arc::new(AllocationCeiling::new(100)),
            now,
        );

        for port in 0..8 {
            let from = SocketAddr::from(([198, 51, 100, port], 40000));
            let msg = RelayMessage {
                transaction_id: [1u8; 12],
                body: RelayBody::AllocateRequest { lifetime_secs: 60 },
            };
            shard.handle_client(from, &encode_relay(&msg).unwrap(), now).unwrap();
        }

        let mut seen = 0;
        while let Some(Output::ToClient { payload, .. }) = shard.poll_output() {
            match decode_relay(&payload).unwrap().body {
                RelayBody::AllocateResponse {
                    allocation_id,
                    lifetime_secs,
                    ..
                } => {
                    assert_eq!(shard_for_allocation(allocation_id, 4), 2);
                    assert_eq!(lifetime_secs, 60);
                    seen += 1;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(seen, 8);
        assert_eq!(shard.allocation_count(), 8);
    }

    fn allocate_with(
        shard: &mut RelayShard<FakeSockets>,
        transaction_id: [u8; 12],
        now: Instant,
    ) -> (AllocationId, SocketAddr) {
        let msg = RelayMessage {
            transaction_id,
            body: RelayBody::AllocateRequest { lifetime_secs: 0 },
        };
        shard.handle_client(client(), &encode_relay(&msg).unwrap(), now).unwrap();
        match shard.poll_output() {
            Some(Output::ToClient { payload, .. }) => match decode_relay(&payload).unwrap().body {
                RelayBody::AllocateResponse {
                    allocation_id, relayed, ..
                } => (allocation_id, relayed),
                other => panic!("allocation failed: {:?}", other),
            },
            other => panic!("expected a response, got {:?}", other),
        }
    }

    #[test]
    fn test_allocate_retransmit_returns_same_allocation() {
        let now = Instant::now();
        let mut shard = shard_with(RelayConfig::default(), now);

        let (id, relayed) = allocate_with(&mut shard, [1u8; 12], now);
        let (again, relayed_again) = allocate_with(&mut shard, [1u8; 12], now + Duration::from_millis(200));

        assert_eq!(id, again);
        assert_eq!(relayed, relayed_again);
        assert_eq!(shard.sockets().open.len(), 1);
        assert_eq!(counter(&shard, |m| &m.allocations_total), 1);
    }

    #[test]
    fn test_reallocation_replaces_prior_allocation() {
        let now = Instant::now();
        let mut shard = shard_with(RelayConfig::default(), now);

        let (old, old_relayed) = allocate_with(&mut shard, [1u8; 12], now);
        permit(&mut shard, old, peer(), now);
        request(
            &mut shard,
            client(),
            RelayBody::ChannelBindRequest {
                allocation_id: old,
                channel: 0x4000,
                peer: peer(),
            },
            now,
        );

        let (new, new_relayed) = allocate_with(&mut shard, [2u8; 12], now + Duration::from_secs(1));
        assert_ne!(old, new);
        assert_ne!(old_relayed, new_relayed);

        // Everything hanging off the prior allocation is gone
        assert_eq!(
            send(&mut shard, client(), send_indication(old, peer(), b"stale"), now),
            Err(RelayErrorCode::NoSuchAllocation)
        );
        assert_eq!(shard.handle_peer(old, peer(), b"stale", now), Err(RelayErrorCode::NoSuchAllocation));

        // The new one starts without permissions or channels
        assert_eq!(
            send(&mut shard, client(), send_indication(new, peer(), b"fresh"), now),
            Err(RelayErrorCode::NoPermission)
        );
        assert_eq!(
            shard.handle_client(client(), &encode_channel_data(0x4000, b"fresh"), now),
            Err(RelayErrorCode::UnboundChannel)
        );
        assert!(shard.poll_output().is_none());

        assert_eq!(shard.allocation_count(), 1);
        assert_eq!(shard.sockets().open.len(), 1);
        assert_eq!(shard.ceiling.live(), 1);
        assert_eq!(counter(&shard, |m| &m.allocations_active), 1);
        assert_eq!(counter(&shard, |m| &m.allocations_total), 2);
    }

    #[test]
    fn test_per_ip_quota() {
        let now = Instant::now();
        let config = RelayConfig {
            max_allocations_per_ip: 2,
            ..RelayConfig::default()
        };
        let mut shard = shard_with(config, now);

        allocate(&mut shard, addr("198.51.100.10:1"), now);
        allocate(&mut shard, addr("198.51.100.10:2"), now);
        let body = request(&mut shard, addr("198.51.100.10:3"), RelayBody::AllocateRequest { lifetime_secs: 0 }, now);

        assert_eq!(
            body,
            RelayBody::ErrorResponse {
                code: RelayErrorCode::QuotaExceeded
            }
        );
        assert_eq!(counter(&shard, |m| &m.allocation_rejections_total), 1);

        // Another address is unaffected
        allocate(&mut shard, addr("198.51.100.11:1"), now);
    }

    #[test]
    fn test_allocate_throttled() {
        let now = Instant::now();
        let config = RelayConfig {
            allocate_rate: 1.0,
            allocate_burst: 1.0,
            ..RelayConfig::default()
        };
        let mut shard = shard_with(config, now);

        allocate(&mut shard, addr("198.51.100.10:1"), now);
        let body = request(&mut shard, addr("198.51.100.10:2"), RelayBody::AllocateRequest { lifetime_secs: 0 }, now);
        assert_eq!(
            body,
            RelayBody::ErrorResponse {
                code: RelayErrorCode::Throttled
            }
        );

        // Refilled a second later
        allocate(&mut shard, addr("198.51.100.10:2"), now + Duration::from_secs(1));
    }

    #[test]
    fn test_global_ceiling() {
        let now = Instant::now();
        let config = RelayConfig {
            max_allocations: 1,
            ..RelayConfig::default()
        };
        let mut shard = shard_with(config, now);

        let (id, _) = allocate(&mut shard, client(), now);
        let body = request(&mut shard, addr("203.0.113.50:1"), RelayBody::AllocateRequest { lifetime_secs: 0 }, now);
        assert_eq!(
            body,
            RelayBody::ErrorResponse {
                code: RelayErrorCode::QuotaExceeded
            }
        );

        // Releasing frees the slot
        let body = request(
            &mut shard,
            client(),
            RelayBody::RefreshRequest {
                allocation_id: id,
                lifetime_secs: 0,
            },
            now,
        );
        assert_eq!(body, RelayBody::RefreshResponse { lifetime_secs: 0 });
        allocate(&mut shard, addr("203.0.113.50:1"), now);
    }

    #[test]
    fn test_socket_failure_releases_reservation() {
        let now = Instant::now();
        let config = RelayConfig {
            max_allocations: 1,
            ..RelayConfig::default()
        };
        let mut shard = shard_with(config, now);
        shard.sockets_mut().fail = true;

        let body = request(&mut shard, client(), RelayBody::AllocateRequest { lifetime_secs: 0 }, now);
        assert!(matches!(body, RelayBody::ErrorResponse { .. }));
        assert_eq!(shard.ceiling.live(), 0);

        shard.sockets_mut().fail = false;
        allocate(&mut shard, client(), now);
        assert_eq!(shard.ceiling.live(), 1);
    }

    #[test]
    fn test_zero_permissions_rejects_every_relay() {
        let now = Instant::now();
        let mut shard = shard_with(RelayConfig::default(), now);
        let (id, _) = allocate(&mut shard, client(), now);

        for port in 0..5u16 {
            let target = SocketAddr::from(([192, 0, 2, 1], 7000 + port));
            let result = send(&mut shard, client(), send_indication(id, target, b"hello"), now);
            assert_eq!(result, Err(RelayErrorCode::NoPermission));
        }

        assert!(shard.poll_output().is_none());
        assert_eq!(counter(&shard, |m| &m.dropped_no_permission_total), 5);
        assert_eq!(counter(&shard, |m| &m.datagrams_relayed_total), 0);
    }

    #[test]
    fn test_permission_is_exact_address() {
        let now = Instant::now();
        let mut shard = shard_with(RelayConfig::default(), now);
        let (id, _) = allocate(&mut shard, client(), now);
        permit(&mut shard, id, peer(), now);

        send(&mut shard, client(), send_indication(id, peer(), b"hello"), now).unwrap();
        assert_eq!(
            shard.poll_output(),
            Some(Output::ToPeer {
                allocation: id,
                dst: peer(),
                payload: b"hello".to_vec(),
            })
        );

        let other_port = addr("192.0.2.5:7001");
        assert_eq!(
            send(&mut shard, client(), send_indication(id, other_port, b"x"), now),
            Err(RelayErrorCode::NoPermission)
        );
        assert!(shard.poll_output().is_none());
    }

    #[test]
    fn test_permission_expires_independently() {
        let now = Instant::now();
        let mut shard = shard_with(RelayConfig::default(), now);
        let (id, _) = allocate(&mut shard, client(), now);
        permit(&mut shard, id, peer(), now);

        let later = now + Duration::from_secs(301);
        assert_eq!(
            send(&mut shard, client(), send_indication(id, peer(), b"late"), later),
            Err(RelayErrorCode::NoPermission)
        );
        assert!(shard.allocation(id).is_some());

        // Renewing restores it
        let body = request(
            &mut shard,
            client(),
            RelayBody::CreatePermissionRequest {
                allocation_id: id,
                peer: peer(),
            },
            later,
        );
        assert_eq!(body, RelayBody::CreatePermissionResponse { lifetime_secs: 300 });
        send(&mut shard, client(), send_indication(id, peer(), b"again"), later).unwrap();
    }

    #[test]
    fn test_peer_traffic_to_client() {
        let now = Instant::now();
        let mut shard = shard_with(RelayConfig::default(), now);
        let (id, _) = allocate(&mut shard, client(), now);

        // Without a permission nothing reaches the client
        assert_eq!(
            shard.handle_peer(id, peer(), b"probe", now),
            Err(RelayErrorCode::NoPermission)
        );
        assert!(shard.poll_output().is_none());

        permit(&mut shard, id, peer(), now);
        shard.handle_peer(id, peer(), b"reply", now).unwrap();
        match shard.poll_output() {
            Some(Output::ToClient { dst, payload }) => {
                assert_eq!(dst, client());
                assert_eq!(
                    decode_relay(&payload).unwrap().body,
                    RelayBody::DataIndication {
                        peer: peer(),
                        data: b"reply".to_vec()
                    }
                );
            }
            other => panic!("expected data indication, got {:?}", other),
        }

        // With a channel the compact framing is used
        let body = request(
            &mut shard,
            client(),
            RelayBody::ChannelBindRequest {
                allocation_id: id,
                channel: 0x4001,
                peer: peer(),
            },
            now,
        );
        assert_eq!(body, RelayBody::ChannelBindResponse { lifetime_secs: 600 });

        shard.handle_peer(id, peer(), b"framed", now).unwrap();
        assert_eq!(
            shard.poll_output(),
            Some(Output::ToClient {
                dst: client(),
                payload: encode_channel_data(0x4001, b"framed"),
            })
        );
    }

    #[test]
    fn test_channel_data_from_client() {
        let now = Instant::now();
        let mut shard = shard_with(RelayConfig::default(), now);
        let (id, _) = allocate(&mut shard, client(), now);

        assert_eq!(
            shard.handle_client(client(), &encode_channel_data(0x4000, b"early"), now),
            Err(RelayErrorCode::UnboundChannel)
        );
        assert_eq!(counter(&shard, |m| &m.dropped_unbound_channel_total), 1);

        request(
            &mut shard,
            client(),
            RelayBody::ChannelBindRequest {
                allocation_id: id,
                channel: 0x4000,
                peer: peer(),
            },
            now,
        );

        shard
            .handle_client(client(), &encode_channel_data(0x4000, b"data"), now)
            .unwrap();
        assert_eq!(
            shard.poll_output(),
            Some(Output::ToPeer {
                allocation: id,
                dst: peer(),
                payload: b"data".to_vec(),
            })
        );

        // A stranger's ChannelData has no allocation
        assert_eq!(
            shard.handle_client(addr("198.51.100.99:1"), &encode_channel_data(0x4000, b"x"), now),
            Err(RelayErrorCode::NoSuchAllocation)
        );
    }

    #[test]
    fn test_requests_only_from_owner() {
        let now = Instant::now();
        let mut shard = shard_with(RelayConfig::default(), now);
        let (id, _) = allocate(&mut shard, client(), now);
        let intruder = addr("198.51.100.66:40000");

        let body = request(
            &mut shard,
            intruder,
            RelayBody::CreatePermissionRequest {
                allocation_id: id,
                peer: intruder,
            },
            now,
        );
        assert_eq!(
            body,
            RelayBody::ErrorResponse {
                code: RelayErrorCode::NoSuchAllocation
            }
        );

        assert_eq!(
            send(&mut shard, intruder, send_indication(id, peer(), b"x"), now),
            Err(RelayErrorCode::NoSuchAllocation)
        );
        assert_eq!(counter(&shard, |m| &m.dropped_no_allocation_total), 1);
    }

    #[test]
    fn test_expired_allocation_is_gone() {
        let now = Instant::now();
        let mut shard = shard_with(RelayConfig::default(), now);
        let body = request(&mut shard, client(), RelayBody::AllocateRequest { lifetime_secs: 60 }, now);
        let RelayBody::AllocateResponse { allocation_id: id, .. } = body else {
            panic!("allocation failed");
        };
        request(
            &mut shard,
            client(),
            RelayBody::ChannelBindRequest {
                allocation_id: id,
                channel: 0x4000,
                peer: peer(),
            },
            now,
        );

        let later = now + Duration::from_secs(61);
        assert_eq!(
            send(&mut shard, client(), send_indication(id, peer(), b"x"), later),
            Err(RelayErrorCode::NoSuchAllocation)
        );
        assert_eq!(
            shard.handle_client(client(), &encode_channel_data(0x4000, b"x"), later),
            Err(RelayErrorCode::NoSuchAllocation)
        );
        assert_eq!(shard.handle_peer(id, peer(), b"x", later), Err(RelayErrorCode::NoSuchAllocation));

        assert_eq!(shard.allocation_count(), 0);
        assert!(shard.sockets().open.is_empty());
        assert_eq!(counter(&shard, |m| &m.allocations_expired_total), 1);
        assert_eq!(counter(&shard, |m| &m.allocations_active), 0);
    }

    #[test]
    fn test_sweep_removes_expired() {
        let now = Instant::now();
        let mut shard = shard_with(RelayConfig::default(), now);
        request(&mut shard, client(), RelayBody::AllocateRequest { lifetime_secs: 60 }, now);
        allocate(&mut shard, addr("198.51.100.20:1"), now);

        // Not due yet
        shard.handle_timeout(now);
        assert_eq!(shard.allocation_count(), 2);

        let later = now + Duration::from_secs(61);
        assert!(shard.poll_timeout() <= later);
        shard.handle_timeout(later);

        assert_eq!(shard.allocation_count(), 1);
        assert_eq!(shard.sockets().open.len(), 1);
        assert_eq!(shard.ceiling.live(), 1);
    }

    #[test]
    fn test_refresh_capped() {
        let now = Instant::now();
        let mut shard = shard_with(RelayConfig::default(), now);
        let (id, _) = allocate(&mut shard, client(), now);

        let body = request(
            &mut shard,
            client(),
            RelayBody::RefreshRequest {
                allocation_id: id,
                lifetime_secs: 86_400,
            },
            now,
        );
        assert_eq!(body, RelayBody::RefreshResponse { lifetime_secs: 3_600 });
        assert_eq!(shard.allocation(id).unwrap().remaining_secs(now), 3_600);
    }

    #[test]
    fn test_byte_quota_enforced() {
        let now = Instant::now();
        let config = RelayConfig {
            max_bytes_per_allocation: 10,
            ..RelayConfig::default()
        };
        let mut shard = shard_with(config, now);
        let (id, _) = allocate(&mut shard, client(), now);
        permit(&mut shard, id, peer(), now);

        send(&mut shard, client(), send_indication(id, peer(), &[0; 6]), now).unwrap();
        assert_eq!(
            shard.handle_peer(id, peer(), &[0; 6], now),
            Err(RelayErrorCode::QuotaExceeded)
        );
        assert_eq!(counter(&shard, |m| &m.dropped_quota_total), 1);
    }

    #[test]
    fn test_garbage_counted() {
        let now = Instant::now();
        let mut shard = shard_with(RelayConfig::default(), now);

        assert_eq!(shard.handle_client(client(), &[0xFF, 1, 2], now), Err(RelayErrorCode::BadRequest));
        assert_eq!(shard.handle_client(client(), &[0x01, 0xFF], now), Err(RelayErrorCode::BadRequest));
        assert_eq!(counter(&shard, |m| &m.malformed_total), 2);
        assert!(shard.poll_output().is_none());
    }

    #[test]
    fn test_release_all() {
        let now = Instant::now();
        let mut shard = shard_with(RelayConfig::default(), now);
        allocate(&mut shard, client(), now);
        allocate(&mut shard, addr("198.51.100.20:1"), now);

        shard.release_all();
        assert_eq!(shard.allocation_count(), 0);
        assert!(shard.sockets().open.is_empty());
        assert_eq!(shard.ceiling.live(), 0);
    }
}
