//! ICE-style candidates
//!
//! Candidate types and priority calculation based on RFC 8445. Priority
//! encodes expected path quality: host > server-reflexive > relayed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

// ============================================================================
// Constants (RFC 8445 Section 5.1.2.1)
// ============================================================================

/// Type preference for host candidates (highest priority)
const HOST_TYPE_PREF: u32 = 126;

/// Type preference for server reflexive candidates
const SRFLX_TYPE_PREF: u32 = 100;

/// Type preference for relayed candidates (lowest priority)
const RELAYED_TYPE_PREF: u32 = 0;

/// Local preference for IPv4 addresses
const IPV4_LOCAL_PREF: u32 = 65535;

/// Local preference for IPv6 addresses (slightly lower than IPv4)
const IPV6_LOCAL_PREF: u32 = 65534;

/// We only ever use one component
const COMPONENT_ID: u32 = 1;

// ============================================================================
// Candidate Kind
// ============================================================================

/// Kind of candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateKind {
    /// Local network interface address
    Host,
    /// Public address as observed by the reflexive-address service
    ServerReflexive,
    /// Address allocated on the relay server
    Relayed,
}

impl CandidateKind {
    /// Get the type preference value for priority calculation
    pub fn type_preference(&self) -> u32 {
        match self {
            CandidateKind::Host => HOST_TYPE_PREF,
            CandidateKind::ServerReflexive => SRFLX_TYPE_PREF,
            CandidateKind::Relayed => RELAYED_TYPE_PREF,
        }
    }
}

impl fmt::Display for CandidateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateKind::Host => write!(f, "host"),
            CandidateKind::ServerReflexive => write!(f, "srflx"),
            CandidateKind::Relayed => write!(f, "relay"),
        }
    }
}

// ============================================================================
// Candidate
// ============================================================================

/// A transport address offered during negotiation
///
/// Immutable once advertised.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    pub kind: CandidateKind,
    /// Transport address (IP:port)
    pub address: SocketAddr,
    /// Priority (higher = more preferred)
    pub priority: u32,
    /// Same foundation = same base address and kind
    pub foundation: String,
    /// Base address (local address used for srflx, relay server for relayed)
    pub related_address: Option<SocketAddr>,
}

impl Candidate {
    /// Create a new candidate with calculated priority
    pub fn new(kind: CandidateKind, address: SocketAddr, related_address: Option<SocketAddr>) -> Self {
        let priority = calculate_priority(kind.type_preference(), local_preference(&address), COMPONENT_ID);

        Self {
            kind,
            address,
            priority,
            foundation: generate_foundation(kind, &address),
            related_address,
        }
    }

    pub fn host(address: SocketAddr) -> Self {
        Self::new(CandidateKind::Host, address, None)
    }

    /// Create a server reflexive candidate from a binding response
    pub fn server_reflexive(public_address: SocketAddr, base_address: SocketAddr) -> Self {
        Self::new(CandidateKind::ServerReflexive, public_address, Some(base_address))
    }

    /// Create a relayed candidate from an allocation
    pub fn relayed(relayed_address: SocketAddr, relay_server: SocketAddr) -> Self {
        Self::new(CandidateKind::Relayed, relayed_address, Some(relay_server))
    }

    pub fn is_relayed(&self) -> bool {
        self.kind == CandidateKind::Relayed
    }

}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} priority {} foundation {}",
            self.kind, self.address, self.priority, self.foundation
        )
    }
}

// ============================================================================
// Priority Calculation (RFC 8445 Section 5.1.2.1)
// ============================================================================

/// Calculate candidate priority per RFC 8445
///
/// Formula: priority = (2^24 * type_preference) + (2^8 * local_preference) + (256 - component_id)
pub fn calculate_priority(type_pref: u32, local_pref: u32, component_id: u32) -> u32 {
    let type_pref = type_pref.min(126);
    let local_pref = local_pref.min(65535);
    let component_id = component_id.clamp(1, 256);

    (type_pref << 24) | (local_pref << 8) | (256 - component_id)
}

fn local_preference(addr: &SocketAddr) -> u32 {
    match addr.ip() {
        IpAddr::V4(_) => IPV4_LOCAL_PREF,
        IpAddr::V6(_) => IPV6_LOCAL_PREF,
    }
}

fn generate_foundation(kind: CandidateKind, addr: &SocketAddr) -> String {
    // Port doesn't affect foundation
    format!("{}_{}", kind, addr.ip())
}

// ============================================================================
// Host Candidates
// ============================================================================

/// Build host candidates from locally bound addresses
///
/// Loopback addresses are skipped unless `include_loopback` is set (tests
/// and single-host setups).
pub fn gather_host_candidates(local_addrs: &[SocketAddr], include_loopback: bool) -> Vec<Candidate> {
    local_addrs
        .iter()
        .filter(|addr| include_loopback || !addr.ip().is_loopback())
        .filter(|addr| !addr.ip().is_unspecified())
        .map(|&addr| Candidate::host(addr))
        .collect()
}

/// Build a server reflexive candidate from a binding response
///
/// Returns `None` when the observed address equals the base address: there
/// is no NAT and the host candidate already covers this path.
pub fn gather_reflexive_candidate(reflexive_addr: SocketAddr, base_addr: SocketAddr) -> Option<Candidate> {
    if reflexive_addr == base_addr {
        return None;
    }
    Some(Candidate::server_reflexive(reflexive_addr, base_addr))
}

/// Sort candidates by priority (highest first)
pub fn sort_candidates_by_priority(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
}

// ============================================================================
// Platform-specific Interface Enumeration
// ============================================================================

/// Enumerate local IPv4 interface addresses using libc
///
/// Returns addresses of non-loopback interfaces combined with `port`, the
/// port of the engine's bound socket.
#[cfg(unix)]
pub fn enumerate_local_addresses(port: u16) -> Vec<SocketAddr> {
    let mut addrs = Vec::new();

    // SAFETY: getifaddrs hands us a linked list we only read and then free
    // with freeifaddrs; every pointer is null-checked before dereference.
    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifaddrs) != 0 {
            return addrs;
        }

        let mut current = ifaddrs;
        while !current.is_null() {
            let ifa = &*current;

            if !ifa.ifa_addr.is_null() {
                let family = (*ifa.ifa_addr).sa_family as i32;
                if family == libc::AF_INET {
                    let sockaddr_in = ifa.ifa_addr as *const libc::sockaddr_in;
                    let ip_bytes = (*sockaddr_in).sin_addr.s_addr.to_ne_bytes();
                    let ip = Ipv4Addr::new(ip_bytes[0], ip_bytes[1], ip_bytes[2], ip_bytes[3]);

                    if !ip.is_loopback() {
                        addrs.push(SocketAddr::new(IpAddr::V4(ip), port));
                    }
                }
            }

            current = ifa.ifa_next;
        }

        libc::freeifaddrs(ifaddrs);
    }

    addrs
}

#[cfg(not(unix))]
pub fn enumerate_local_addresses(_port: u16) -> Vec<SocketAddr> {
    Vec::new()
}

// ============================================================================
// Tests
// ============================================================================
