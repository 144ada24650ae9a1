//! Simulated network for end-to-end scenarios
//!
//! A client engine and a gateway engine each sit behind their own symmetric
//! NAT. The only public service is a relay shard. Time is virtual, so
//! scenarios covering minutes of idle or rekey run instantly.
//!
//! ```text
//!  client 10.0.0.1 ─ NAT 198.51.100.1 ─┐                ┌─ NAT 198.51.100.2 ─ gateway 10.1.0.1
//!                                      └─ relay 203.0.113.1 ─┘
//! ```
//!
//! Private addresses are unroutable and the NATs only accept replies from
//! the exact address a mapping was opened towards, so host and reflexive
//! candidates never connect and traffic has to go through the relay.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use relay_server::{AllocationCeiling, Metrics, Output, RelayConfig, RelayShard, RelaySockets};
use tunnel_core::relay::message::AllocationId;
use tunnel_core::{
    Admission, ControlPlane, Engine, EngineConfig, EngineEvent, Grant, Identity, Lookup, PeerId, PublicKey,
    Resource, Role,
};

pub const CLIENT_ID: PeerId = PeerId(1);
pub const GATEWAY_ID: PeerId = PeerId(2);

/// Tunnel address of the client
pub const CLIENT_TUNNEL_IP: [u8; 4] = [100, 64, 0, 1];
/// Host inside the gateway's protected network
pub const RESOURCE_IP: [u8; 4] = [192, 168, 10, 5];

pub fn client_private() -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 1], 5000))
}

pub fn gateway_private() -> SocketAddr {
    SocketAddr::from(([10, 1, 0, 1], 6000))
}

pub fn relay_addr() -> SocketAddr {
    SocketAddr::from(([203, 0, 113, 1], 3478))
}

/// IPv4/UDP packet as the virtual interface would hand it over
pub fn ipv4_packet(src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let builder = etherparse::PacketBuilder::ipv4(src, dst, 64).udp(40000, 8080);
    let mut packet = Vec::with_capacity(builder.size(payload.len()));
    builder
        .write(&mut packet, payload)
        .expect("writing to a Vec cannot fail");
    packet
}

// ============================================================================
// Control Plane
// ============================================================================

#[derive(Debug, Default)]
pub struct StaticControl {
    pub grants: Vec<Grant>,
    pub admissions: HashMap<PeerId, (PublicKey, Admission)>,
}

impl ControlPlane for StaticControl {
    fn lookup(&mut self, query: Lookup<'_>) -> Option<Grant> {
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

// ============================================================================
// NAT
// ============================================================================

/// Address and port dependent mapping and filtering
#[derive(Debug)]
pub struct SymmetricNat {
    public_ip: IpAddr,
    internal: SocketAddr,
    mappings: HashMap<SocketAddr, u16>,
    reverse: HashMap<u16, SocketAddr>,
    next_port: u16,
    pub filtered: u64,
}

impl SymmetricNat {
    pub fn new(public_ip: Ipv4Addr, internal: SocketAddr) -> Self {
        Self {
            public_ip: IpAddr::V4(public_ip),
            internal,
            mappings: HashMap::new(),
            reverse: HashMap::new(),
            next_port: 20_000,
            filtered: 0,
        }
    }

    pub fn public_ip(&self) -> IpAddr {
        self.public_ip
    }

    /// Public source address for traffic towards `remote`
    pub fn outbound(&mut self, remote: SocketAddr) -> SocketAddr {
        let port = match self.mappings.get(&remote) {
            Some(port) => *port,
            None => {
                let port = self.next_port;
                self.next_port += 1;
                self.mappings.insert(remote, port);
                self.reverse.insert(port, remote);
                port
            }
        };
        SocketAddr::new(self.public_ip, port)
    }

    /// Internal destination for a datagram from `from` to our `port`
    pub fn inbound(&mut self, from: SocketAddr, port: u16) -> Option<SocketAddr> {
        if self.reverse.get(&port) == Some(&from) {
            Some(self.internal)
        } else {
            self.filtered += 1;
            None
        }
    }
}

// ============================================================================
// Relay sockets
// ============================================================================

#[derive(Debug, Default)]
pub struct SimSockets {
    by_port: HashMap<u16, AllocationId>,
    by_id: HashMap<AllocationId, SocketAddr>,
    next_port: u16,
}

impl SimSockets {
    fn allocation_at(&self, addr: &SocketAddr) -> Option<AllocationId> {
        if addr.ip() != relay_addr().ip() {
            return None;
        }
        self.by_port.get(&addr.port()).copied()
    }

    fn relayed(&self, id: AllocationId) -> Option<SocketAddr> {
        self.by_id.get(&id).copied()
    }

    pub fn open_count(&self) -> usize {
        self.by_id.len()
    }
}

impl RelaySockets for SimSockets {
    fn open(&mut self, id: AllocationId) -> io::Result<SocketAddr> {
        self.next_port += 1;
        let addr = SocketAddr::new(relay_addr().ip(), 50_000 + self.next_port);
        self.by_port.insert(addr.port(), id);
        self.by_id.insert(id, addr);
        Ok(addr)
    }

    fn close(&mut self, id: AllocationId) {
        if let Some(addr) = self.by_id.remove(&id) {
            self.by_port.remove(&addr.port());
        }
    }
}

// ============================================================================
// Scenario
// ============================================================================

pub struct Scenario {
    pub client: Engine<StaticControl>,
    pub gateway: Engine<StaticControl>,
    pub relay: RelayShard<SimSockets>,
    pub relay_metrics: Arc<Metrics>,
    pub client_nat: SymmetricNat,
    pub gateway_nat: SymmetricNat,
    pub client_events: Vec<EngineEvent>,
    pub gateway_events: Vec<EngineEvent>,
    /// Datagrams sent to unroutable (private) addresses
    pub unroutable: u64,
    pub now: Instant,
}

impl Scenario {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_relay_config(config, RelayConfig::default())
    }

    pub fn with_relay_config(config: EngineConfig, relay_config: RelayConfig) -> Self {
        let now = Instant::now();
        let config = EngineConfig {
            stun_servers: vec![relay_addr()],
            relay_servers: vec![relay_addr()],
            ..config
        };

        let client_identity = Identity::generate().expect("identity");
        let gateway_identity = Identity::generate().expect("identity");

        let client_control = StaticControl {
            grants: vec![Grant {
                resource: Resource::Cidr("192.168.10.0/24".parse().expect("cidr")),
                peer: GATEWAY_ID,
                identity: gateway_identity.public_key(),
                allow: true,
                expires_at: None,
            }],
            ..Default::default()
        };
        let mut gateway_control = StaticControl::default();
        gateway_control.admissions.insert(
            CLIENT_ID,
            (
                client_identity.public_key(),
                Admission {
                    sources: vec!["100.64.0.1/32".parse().expect("cidr")],
                    destinations: vec!["192.168.10.0/24".parse().expect("cidr")],
                    expires_at: None,
                },
            ),
        );

        let client = Engine::new(
            Role::Client,
            CLIENT_ID,
            client_identity,
            config.clone(),
            client_control,
            vec![client_private()],
            now,
        );
        let gateway = Engine::new(
            Role::Gateway,
            GATEWAY_ID,
            gateway_identity,
            config,
            gateway_control,
            vec![gateway_private()],
            now,
        );

        let relay_metrics = Arc::new(Metrics::new());
        let ceiling = Arc::new(AllocationCeiling::new(relay_config.max_allocations));
        let relay = RelayShard::new(
            0,
            1,
            Arc::new(relay_config),
            SimSockets::default(),
            Arc::clone(&relay_metrics),
            ceiling,
            now,
        );

        Self {
            client,
            gateway,
            relay,
            relay_metrics,
            client_nat: SymmetricNat::new(Ipv4Addr::new(198, 51, 100, 1), client_private()),
            gateway_nat: SymmetricNat::new(Ipv4Addr::new(198, 51, 100, 2), gateway_private()),
            client_events: Vec::new(),
            gateway_events: Vec::new(),
            unroutable: 0,
            now,
        }
    }

    /// Deliver one datagram with public source `src`
    fn deliver(&mut self, src: SocketAddr, dst: SocketAddr, payload: &[u8]) {
        if dst == relay_addr() {
            let _ = self.relay.handle_client(src, payload, self.now);
            return;
        }
        if let Some(id) = self.relay.sockets().allocation_at(&dst) {
            let _ = self.relay.handle_peer(id, src, payload, self.now);
            return;
        }
        if dst.ip() == self.client_nat.public_ip() {
            if self.client_nat.inbound(src, dst.port()).is_some() {
                self.client.handle_network(src, payload, self.now);
            }
            return;
        }
        if dst.ip() == self.gateway_nat.public_ip() {
            if self.gateway_nat.inbound(src, dst.port()).is_some() {
                self.gateway.handle_network(src, payload, self.now);
            }
            return;
        }

        log::trace!("Dropping datagram from {} to unroutable {}", src, dst);
        self.unroutable += 1;
    }

    /// Move every queued datagram and event until the network is quiet
    pub fn pump(&mut self) {
        for _ in 0..10_000 {
            let mut moved = false;

            while let Some(t) = self.client.poll_transmit() {
                moved = true;
                let src = self.client_nat.outbound(t.dst);
                self.deliver(src, t.dst, &t.payload);
            }
            while let Some(t) = self.gateway.poll_transmit() {
                moved = true;
                let src = self.gateway_nat.outbound(t.dst);
                self.deliver(src, t.dst, &t.payload);
            }
            while let Some(output) = self.relay.poll_output() {
                moved = true;
                match output {
                    Output::ToClient { dst, payload } => {
                        self.deliver(relay_addr(), dst, &payload);
                    }
                    Output::ToPeer {
                        allocation,
                        dst,
                        payload,
                    } => {
                        if let Some(src) = self.relay.sockets().relayed(allocation) {
                            self.deliver(src, dst, &payload);
                        }
                    }
                }
            }
            while let Some(event) = self.client.poll_event() {
                moved = true;
                match event {
                    EngineEvent::Signal(envelope) if envelope.peer == GATEWAY_ID => {
                        let _ = self.gateway.handle_signaling(CLIENT_ID, envelope.message, self.now);
                    }
                    other => self.client_events.push(other),
                }
            }
            while let Some(event) = self.gateway.poll_event() {
                moved = true;
                match event {
                    EngineEvent::Signal(envelope) if envelope.peer == CLIENT_ID => {
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

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
        self.client.handle_timeout(self.now);
        self.gateway.handle_timeout(self.now);
        self.relay.handle_timeout(self.now);
        self.pump();
    }

    pub fn run_for(&mut self, total: Duration, step: Duration) {
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            self.advance(step);
            elapsed += step;
        }
    }

    /// Step until `done` holds, false if `limit` passes first
    pub fn run_until(&mut self, limit: Duration, step: Duration, done: impl Fn(&Self) -> bool) -> bool {
        let mut elapsed = Duration::ZERO;
        while elapsed < limit {
            if done(self) {
                return true;
            }
            self.advance(step);
            elapsed += step;
        }
        done(self)
    }

    /// Send a packet from the client's virtual interface
    pub fn client_send(&mut self, payload: &[u8]) -> Vec<u8> {
        let packet = ipv4_packet(CLIENT_TUNNEL_IP, RESOURCE_IP, payload);
        let _ = self.client.route_outbound(&packet, self.now);
        self.pump();
        packet
    }

    /// Send the first packet and wait for the tunnel to come up
    pub fn connect(&mut self) -> bool {
        self.client_send(b"route miss");
        self.run_until(Duration::from_secs(30), Duration::from_millis(100), |s| {
            s.client.is_connected(GATEWAY_ID)
        })
    }

    pub fn gateway_received(&mut self) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| self.gateway.poll_inbound()).collect()
    }

    pub fn client_received(&mut self) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| self.client.poll_inbound()).collect()
    }
}
