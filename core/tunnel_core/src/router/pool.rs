//! Synthetic address pools for DNS resources
//!
//! DNS resources have no address of their own on the client side. Each
//! resolved name gets one IPv4 and one IPv6 address from these pools,
//! handed out round-robin and skipping addresses still in use.

use std::collections::HashSet;
use std::iter::Cycle;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{Ipv4AddrRange, Ipv4Net, Ipv6AddrRange, Ipv6Net};

pub const DEFAULT_IPV4_POOL: &str = "100.96.0.0/11";
pub const DEFAULT_IPV6_POOL: &str = "fd00:2021:1111:8000::/107";

#[derive(Debug)]
pub struct AddressPool {
    v4_net: Ipv4Net,
    v6_net: Ipv6Net,
    v4: Cycle<Ipv4AddrRange>,
    v6: Cycle<Ipv6AddrRange>,
    in_use: HashSet<IpAddr>,
}

impl AddressPool {
    pub fn new(v4_net: Ipv4Net, v6_net: Ipv6Net) -> Self {
        Self {
            v4_net,
            v6_net,
            v4: v4_net.hosts().cycle(),
            v6: v6_net.hosts().cycle(),
            in_use: HashSet::new(),
        }
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => self.v4_net.contains(v4),
            IpAddr::V6(v6) => self.v6_net.contains(v6),
        }
    }

    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }

    /// Take one address of each family, or nothing if either pool is full
    pub fn allocate(&mut self) -> Option<(Ipv4Addr, Ipv6Addr)> {
        let v4 = self.next_v4()?;
        let Some(v6) = self.next_v6() else {
            self.in_use.remove(&IpAddr::V4(v4));
            return None;
        };
        Some((v4, v6))
    }

    pub fn release(&mut self, addr: &IpAddr) {
        self.in_use.remove(addr);
    }

    fn next_v4(&mut self) -> Option<Ipv4Addr> {
        // Within in_use + 1 consecutive draws at least one is free,
        // unless the pool is exhausted
        let budget = self.in_use.len() + 1;
        for candidate in self.v4.by_ref().take(budget) {
            if self.in_use.insert(IpAddr::V4(candidate)) {
                return Some(candidate);
            }
        }
        None
    }

    fn next_v6(&mut self) -> Option<Ipv6Addr> {
        let budget = self.in_use.len() + 1;
        for candidate in self.v6.by_ref().take(budget) {
            if self.in_use.insert(IpAddr::V6(candidate)) {
                return Some(candidate);
            }
        }
        None
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool() -> AddressPool {
        AddressPool::new("10.0.0.0/30".parse().unwrap(), "fc00::/126".parse().unwrap())
    }

    #[test]
    fn test_default_pools_parse() {
        let pool = AddressPool::new(DEFAULT_IPV4_POOL.parse().unwrap(), DEFAULT_IPV6_POOL.parse().unwrap());
        assert!(pool.contains(&"100.100.1.1".parse().unwrap()));
        assert!(!pool.contains(&"100.64.0.1".parse().unwrap()));
        assert!(pool.contains(&"fd00:2021:1111:8000::5".parse().unwrap()));
    }

    #[test]
    fn test_allocations_are_distinct_and_in_pool() {
        let mut pool = AddressPool::new("10.0.0.0/24".parse().unwrap(), "fc00::/120".parse().unwrap());

        let (a4, a6) = pool.allocate().unwrap();
        let (b4, b6) = pool.allocate().unwrap();

        assert_ne!(a4, b4);
        assert_ne!(a6, b6);
        assert!(pool.contains(&IpAddr::V4(a4)));
        assert!(pool.contains(&IpAddr::V6(b6)));
        assert_eq!(pool.in_use(), 4);
    }

    #[test]
    fn test_exhaustion_and_release() {
        let mut pool = small_pool();

        let mut taken = Vec::new();
        while let Some(pair) = pool.allocate() {
            taken.push(pair);
            assert!(taken.len() <= 4);
        }
        assert!(!taken.is_empty());

        assert!(pool.allocate().is_none());

        let (v4, v6) = taken[0];
        pool.release(&IpAddr::V4(v4));
        pool.release(&IpAddr::V6(v6));
        let (again4, again6) = pool.allocate().unwrap();
        assert!(!taken[1..].iter().any(|(t4, t6)| *t4 == again4 || *t6 == again6));
    }
}
