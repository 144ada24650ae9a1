//! Relay configuration
//!
//! Loaded from JSON, then overridden by command line flags. Every limit is
//! configurable; unset fields keep the defaults below.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tunnel_core::ConfigError;

/// Default listen port (STUN/TURN well-known port)
pub const DEFAULT_PORT: u16 = 3478;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    /// Address advertised in relayed addresses, defaults to the listen IP
    pub public_ip: Option<IpAddr>,
    pub workers: usize,
    /// Datagrams buffered per worker before the dispatcher drops
    pub worker_queue_capacity: usize,
    pub metrics_port: Option<u16>,

    // Lifetimes
    pub default_lifetime_secs: u32,
    pub max_lifetime_secs: u32,
    pub permission_lifetime_secs: u32,
    pub channel_lifetime_secs: u32,
    pub sweep_interval_ms: u64,

    // Limits
    pub max_allocations: usize,
    pub max_allocations_per_ip: usize,
    /// Allocate requests per second accepted from one source IP
    pub allocate_rate: f64,
    pub allocate_burst: f64,
    /// Bytes relayed per allocation in both directions, 0 = unlimited
    pub max_bytes_per_allocation: u64,
    pub max_permissions: usize,
    pub max_channels: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            public_ip: None,
            workers: 2,
            worker_queue_capacity: 4_096,
            metrics_port: None,

            default_lifetime_secs: 600,
            max_lifetime_secs: 3_600,
            permission_lifetime_secs: 300,
            channel_lifetime_secs: 600,
            sweep_interval_ms: 1_000,

            max_allocations: 10_000,
            max_allocations_per_ip: 16,
            allocate_rate: 2.0,
            allocate_burst: 10.0,
            max_bytes_per_allocation: 0,
            max_permissions: 64,
            max_channels: 64,
        }
    }
}

impl RelayConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be positive"));
        }
        if self.worker_queue_capacity == 0 {
            return Err(ConfigError::Invalid("worker_queue_capacity must be positive"));
        }
        if self.default_lifetime_secs == 0 || self.default_lifetime_secs > self.max_lifetime_secs {
            return Err(ConfigError::Invalid(
                "default_lifetime_secs must be positive and at most max_lifetime_secs",
            ));
        }
        if self.permission_lifetime_secs == 0 || self.channel_lifetime_secs == 0 {
            return Err(ConfigError::Invalid("permission and channel lifetimes must be positive"));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid("sweep_interval_ms must be positive"));
        }
        if self.allocate_rate <= 0.0 || self.allocate_burst < 1.0 {
            return Err(ConfigError::Invalid("allocate rate limit must allow at least one request"));
        }
        Ok(())
    }

    /// IP placed in relayed addresses handed to clients
    pub fn advertised_ip(&self) -> IpAddr {
        self.public_ip.unwrap_or_else(|| self.listen.ip())
    }

    /// Clamp a requested allocation lifetime, 0 picks the default
    pub fn allocation_lifetime(&self, requested_secs: u32) -> u32 {
        if requested_secs == 0 {
            self.default_lifetime_secs
        } else {
            requested_secs.min(self.max_lifetime_secs)
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

// ============================================================================
// Tests
// ============================================================================
