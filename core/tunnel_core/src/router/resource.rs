//! Resources reachable through a gateway

use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Something a client may reach through a gateway
///
/// A single host is a full-length CIDR. DNS resources may be wildcards:
/// `*.example.com` covers every sub-domain of `example.com` but not the
/// apex itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Resource {
    Cidr(IpNet),
    Dns(String),
}

impl Resource {
    pub fn host(addr: IpAddr) -> Self {
        Resource::Cidr(IpNet::from(addr))
    }

    /// DNS resource with a normalised pattern
    pub fn dns(pattern: &str) -> Self {
        Resource::Dns(normalize_name(pattern))
    }

    pub fn contains_address(&self, addr: &IpAddr) -> bool {
        match self {
            Resource::Cidr(net) => net.contains(addr),
            Resource::Dns(_) => false,
        }
    }

    pub fn matches_name(&self, name: &str) -> bool {
        match self {
            Resource::Cidr(_) => false,
            Resource::Dns(pattern) => name_matches(pattern, &normalize_name(name)),
        }
    }

    /// Ranking among overlapping resources (longer prefix wins)
    pub fn specificity(&self) -> u32 {
        match self {
            Resource::Cidr(net) => net.prefix_len() as u32,
            // Exact names beat wildcards, deeper wildcards beat shallower ones
            Resource::Dns(pattern) => match pattern.strip_prefix("*.") {
                Some(suffix) => suffix.split('.').count() as u32,
                None => u32::MAX,
            },
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Cidr(net) => write!(f, "{}", net),
            Resource::Dns(pattern) => write!(f, "{}", pattern),
        }
    }
}

pub fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

fn name_matches(pattern: &str, name: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(suffix) => name
            .strip_suffix(suffix)
            .map(|head| head.len() > 1 && head.ends_with('.'))
            .unwrap_or(false),
        None => pattern == name,
    }
}

// ============================================================================
// Tests
// ============================================================================
