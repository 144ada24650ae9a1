//! Engine configuration
//!
//! Loaded from JSON. Every field has a default, so a config file only
//! needs the values it changes:
//!
//! ```json
//! {
//!     "relay_servers": ["198.51.100.1:3478"],
//!     "idle_timeout_ms": 600000
//! }
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

use crate::error::{Classify, ErrorClass};
use crate::p2p::connectivity::CheckLimits;
use crate::p2p::gather::GatherConfig;
use crate::p2p::negotiator::NegotiationConfig;
use crate::router::pool::{DEFAULT_IPV4_POOL, DEFAULT_IPV6_POOL};

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    Invalid(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read config: {}", e),
            ConfigError::Parse(e) => write!(f, "invalid config JSON: {}", e),
            ConfigError::Invalid(what) => write!(f, "invalid config: {}", what),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Classify for ConfigError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Fatal
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // Gathering
    pub stun_servers: Vec<SocketAddr>,
    pub relay_servers: Vec<SocketAddr>,
    pub include_loopback: bool,
    pub request_timeout_ms: u64,
    pub request_max_attempts: u32,
    pub allocation_lifetime_secs: u32,

    // Negotiation
    pub candidate_timeout_ms: u64,
    pub check_timeout_ms: u64,
    pub check_attempt_timeout_ms: u64,
    pub check_max_attempts: u32,
    pub max_checks_in_flight: usize,
    pub grace_window_ms: u64,

    // Session
    pub handshake_timeout_ms: u64,
    pub handshake_max_attempts: u32,
    /// Handshake inits answered per second
    pub handshake_rate_limit: f64,
    pub handshake_burst: f64,
    pub rekey_after_time_ms: u64,
    pub rekey_after_bytes: u64,
    pub reject_after_time_ms: u64,
    /// How long a replaced session keeps accepting packets
    pub rekey_overlap_ms: u64,

    // Liveness
    pub keepalive_interval_ms: u64,
    pub liveness_timeout_ms: u64,
    pub idle_timeout_ms: u64,

    // Routing
    /// Packets held per peer while its connection is being set up
    pub queue_capacity: usize,
    pub synthetic_ipv4_pool: Ipv4Net,
    pub synthetic_ipv6_pool: Ipv6Net,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stun_servers: Vec::new(),
            relay_servers: Vec::new(),
            include_loopback: false,
            request_timeout_ms: 3_000,
            request_max_attempts: 5,
            allocation_lifetime_secs: 600,

            candidate_timeout_ms: 10_000,
            check_timeout_ms: 10_000,
            check_attempt_timeout_ms: 2_000,
            check_max_attempts: 5,
            max_checks_in_flight: 4,
            grace_window_ms: 500,

            handshake_timeout_ms: 10_000,
            handshake_max_attempts: 5,
            handshake_rate_limit: 10.0,
            handshake_burst: 20.0,
            rekey_after_time_ms: 120_000,
            rekey_after_bytes: 1 << 30,
            reject_after_time_ms: 180_000,
            rekey_overlap_ms: 10_000,

            keepalive_interval_ms: 15_000,
            liveness_timeout_ms: 45_000,
            idle_timeout_ms: 300_000,

            queue_capacity: 32,
            synthetic_ipv4_pool: DEFAULT_IPV4_POOL.parse().expect("valid IPv4 CIDR"),
            synthetic_ipv6_pool: DEFAULT_IPV6_POOL.parse().expect("valid IPv6 CIDR"),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_checks_in_flight == 0 {
            return Err(ConfigError::Invalid("max_checks_in_flight must be positive"));
        }
        if self.request_max_attempts == 0 || self.check_max_attempts == 0 || self.handshake_max_attempts == 0 {
            return Err(ConfigError::Invalid("attempt limits must be positive"));
        }
        if self.handshake_rate_limit <= 0.0 || self.handshake_burst < 1.0 {
            return Err(ConfigError::Invalid("handshake rate limit must allow at least one handshake"));
        }
        if self.liveness_timeout_ms <= self.keepalive_interval_ms {
            return Err(ConfigError::Invalid("liveness_timeout_ms must exceed keepalive_interval_ms"));
        }
        if self.reject_after_time_ms <= self.rekey_after_time_ms {
            return Err(ConfigError::Invalid("reject_after_time_ms must exceed rekey_after_time_ms"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be positive"));
        }
        Ok(())
    }

    pub fn gather(&self) -> GatherConfig {
        GatherConfig {
            include_loopback: self.include_loopback,
            request_timeout: ms(self.request_timeout_ms),
            max_attempts: self.request_max_attempts,
            allocation_lifetime_secs: self.allocation_lifetime_secs,
        }
    }

    pub fn negotiation(&self) -> NegotiationConfig {
        NegotiationConfig {
            candidate_timeout: ms(self.candidate_timeout_ms),
            check_timeout: ms(self.check_timeout_ms),
            grace_window: ms(self.grace_window_ms),
            limits: CheckLimits {
                max_in_flight: self.max_checks_in_flight,
                max_attempts: self.check_max_attempts,
                timeout: ms(self.check_attempt_timeout_ms),
            },
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        ms(self.handshake_timeout_ms)
    }

    pub fn rekey_after_time(&self) -> Duration {
        ms(self.rekey_after_time_ms)
    }

    pub fn reject_after_time(&self) -> Duration {
        ms(self.reject_after_time_ms)
    }

    pub fn rekey_overlap(&self) -> Duration {
        ms(self.rekey_overlap_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        ms(self.keepalive_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        ms(self.liveness_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        ms(self.idle_timeout_ms)
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

// ============================================================================
// Tests
// ============================================================================
