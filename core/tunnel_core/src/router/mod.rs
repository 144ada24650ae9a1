//! Route table: which peer serves which destination
//!
//! # Lookup
//!
//! ```text
//! outbound IP packet
//!        │
//!        ▼
//!  destination address ──► synthetic? ──yes──► resolved name ──► DNS route
//!        │                                                          │
//!        no                                                         │
//!        ▼                                                          ▼
//!  longest-prefix CIDR match ─────────────────────────────────► PeerId
//! ```
//!
//! Each resource maps to at most one route. Removing a peer removes all
//! its routes in one step.
//!
//! Synthetic addresses outlive the routes of their names: applications
//! cache DNS answers, so a packet to a synthetic address after teardown
//! must still identify the name to reconnect to. Names without a route
//! are only evicted when the pool runs dry.

pub mod pool;
pub mod resource;

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Instant;

use etherparse::{InternetSlice, SlicedPacket};
use ipnet::{Ipv4Net, Ipv6Net};

use crate::error::{Classify, ErrorClass};
use crate::PeerId;

pub use pool::AddressPool;
pub use resource::Resource;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteError {
    /// No route covers this destination
    NoRoute(IpAddr),
    /// Not an IPv4 or IPv6 packet
    Malformed,
    /// Synthetic address pool is full
    PoolExhausted,
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteError::NoRoute(dst) => write!(f, "no route to {}", dst),
            RouteError::Malformed => write!(f, "malformed IP packet"),
            RouteError::PoolExhausted => write!(f, "synthetic address pool exhausted"),
        }
    }
}

impl std::error::Error for RouteError {}

impl Classify for RouteError {
    fn class(&self) -> ErrorClass {
        match self {
            RouteError::NoRoute(_) => ErrorClass::Transient,
            RouteError::Malformed => ErrorClass::Protocol,
            RouteError::PoolExhausted => ErrorClass::Resource,
        }
    }
}

// ============================================================================
// Routes
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub resource: Resource,
    pub peer: PeerId,
    /// Access ends at this instant, if limited
    pub expires_at: Option<Instant>,
}

/// Synthetic addresses handed out for one DNS name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SyntheticName {
    v4: Ipv4Addr,
    v6: Ipv6Addr,
}

/// Destination address of a raw IP packet
pub fn destination(packet: &[u8]) -> Result<IpAddr, RouteError> {
    let sliced = SlicedPacket::from_ip(packet).map_err(|_| RouteError::Malformed)?;
    match sliced.ip {
        Some(InternetSlice::Ipv4(header, _)) => Ok(IpAddr::V4(header.destination_addr())),
        Some(InternetSlice::Ipv6(header, _)) => Ok(IpAddr::V6(header.destination_addr())),
        None => Err(RouteError::Malformed),
    }
}

/// Source address of a raw IP packet
pub fn source(packet: &[u8]) -> Result<IpAddr, RouteError> {
    let sliced = SlicedPacket::from_ip(packet).map_err(|_| RouteError::Malformed)?;
    match sliced.ip {
        Some(InternetSlice::Ipv4(header, _)) => Ok(IpAddr::V4(header.source_addr())),
        Some(InternetSlice::Ipv6(header, _)) => Ok(IpAddr::V6(header.source_addr())),
        None => Err(RouteError::Malformed),
    }
}

#[derive(Debug)]
pub struct Router {
    routes: HashMap<Resource, Route>,
    /// Resolved name → synthetic addresses
    names: HashMap<String, SyntheticName>,
    /// Synthetic address → resolved name
    synthetic: HashMap<IpAddr, String>,
    pool: AddressPool,
}

impl Router {
    pub fn new(v4_pool: Ipv4Net, v6_pool: Ipv6Net) -> Self {
        Self {
            routes: HashMap::new(),
            names: HashMap::new(),
            synthetic: HashMap::new(),
            pool: AddressPool::new(v4_pool, v6_pool),
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.values()
    }

    pub fn has_peer(&self, peer: PeerId) -> bool {
        self.routes.values().any(|r| r.peer == peer)
    }

    /// Add or replace the route for a resource
    ///
    /// Returns the peer that previously served it, if different.
    pub fn add_route(&mut self, resource: Resource, peer: PeerId, expires_at: Option<Instant>) -> Option<PeerId> {
        log::debug!("Route {} -> peer {}", resource, peer);
        let previous = self.routes.insert(
            resource.clone(),
            Route {
                resource: resource.clone(),
                peer,
                expires_at,
            },
        );

        previous.filter(|old| old.peer != peer).map(|old| old.peer)
    }

    pub fn remove_route(&mut self, resource: &Resource) -> Option<Route> {
        self.routes.remove(resource)
    }

    /// Remove every route served by `peer`
    pub fn remove_peer(&mut self, peer: PeerId) -> Vec<Resource> {
        let removed: Vec<Resource> = self
            .routes
            .values()
            .filter(|r| r.peer == peer)
            .map(|r| r.resource.clone())
            .collect();

        for resource in &removed {
            self.routes.remove(resource);
        }

        if !removed.is_empty() {
            log::debug!("Removed {} routes of peer {}", removed.len(), peer);
        }
        removed
    }

    /// Drop routes whose access expired
    pub fn expire(&mut self, now: Instant) -> Vec<Route> {
        let expired: Vec<Resource> = self
            .routes
            .values()
            .filter(|r| r.expires_at.map(|t| now >= t).unwrap_or(false))
            .map(|r| r.resource.clone())
            .collect();

        expired
            .iter()
            .filter_map(|resource| self.remove_route(resource))
            .collect()
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.routes.values().filter_map(|r| r.expires_at).min()
    }

    /// Peer serving the destination of an outbound packet
    pub fn route_outbound(&self, packet: &[u8]) -> Result<PeerId, RouteError> {
        let dst = destination(packet)?;
        self.lookup_address(&dst)
            .map(|r| r.peer)
            .ok_or(RouteError::NoRoute(dst))
    }

    /// Route for an address: synthetic addresses first, then longest prefix
    pub fn lookup_address(&self, addr: &IpAddr) -> Option<&Route> {
        if let Some(name) = self.synthetic.get(addr) {
            return self.lookup_name(name);
        }

        self.routes
            .values()
            .filter(|r| r.resource.contains_address(addr))
            .max_by_key(|r| r.resource.specificity())
    }

    /// Most specific DNS route covering a name
    pub fn lookup_name(&self, name: &str) -> Option<&Route> {
        self.routes
            .values()
            .filter(|r| r.resource.matches_name(name))
            .max_by_key(|r| r.resource.specificity())
    }

    /// Synthetic addresses for a name covered by a DNS route
    ///
    /// A name keeps its addresses across route teardown and re-admission.
    pub fn resolve(&mut self, name: &str) -> Result<Option<(Ipv4Addr, Ipv6Addr)>, RouteError> {
        let name = resource::normalize_name(name);
        let Some(route) = self.lookup_name(&name) else {
            return Ok(None);
        };
        if let Some(existing) = self.names.get(&name) {
            return Ok(Some((existing.v4, existing.v6)));
        }
        let resource = route.resource.clone();

        let (v4, v6) = match self.pool.allocate() {
            Some(addrs) => addrs,
            None => {
                self.evict_unrouted_names();
                self.pool.allocate().ok_or(RouteError::PoolExhausted)?
            }
        };
        log::debug!("Resolved {} ({}) to {} / {}", name, resource, v4, v6);

        self.synthetic.insert(IpAddr::V4(v4), name.clone());
        self.synthetic.insert(IpAddr::V6(v6), name.clone());
        self.names.insert(name, SyntheticName { v4, v6 });
        Ok(Some((v4, v6)))
    }

    /// Name behind a synthetic address
    pub fn synthetic_name(&self, addr: &IpAddr) -> Option<&str> {
        self.synthetic.get(addr).map(|s| s.as_str())
    }

    pub fn is_synthetic(&self, addr: &IpAddr) -> bool {
        self.pool.contains(addr)
    }

    /// Drop every route; resolved names keep their addresses
    pub fn clear(&mut self) {
        self.routes.clear();
    }

    /// Return the addresses of names no route covers to the pool
    fn evict_unrouted_names(&mut self) {
        let released: Vec<String> = self
            .names
            .keys()
            .filter(|name| self.lookup_name(name).is_none())
            .cloned()
            .collect();

        if !released.is_empty() {
            log::debug!("Evicting {} unrouted synthetic names", released.len());
        }
        for name in released {
            if let Some(n) = self.names.remove(&name) {
                for addr in [IpAddr::V4(n.v4), IpAddr::V6(n.v6)] {
                    self.synthetic.remove(&addr);
                    self.pool.release(&addr);
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
