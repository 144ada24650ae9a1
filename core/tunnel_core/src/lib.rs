//! Connection establishment and tunneling engine
//!
//! This crate provides the core of a zero-trust tunnel endpoint:
//! - NAT traversal: host, reflexive and relayed candidates, connectivity checks
//! - Relay wire protocol and the client side of relay allocations
//! - Authenticated, encrypted sessions with rekey and replay protection
//! - Routing of IP packets to the peer serving their destination
//! - A mio driver that runs the sans-IO engine over a real UDP socket
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── Engine ─────────────────────────────┐
//! │                                                                 │
//! │  Router ──► Gatherer ──► signaling ──► Negotiation ──► Session  │
//! │    ▲            │                            │            │     │
//! │    │            └──── relay::RelayClient ◄───┘            │     │
//! │    └──────────────── PathMonitor (keepalive/idle) ◄───────┘     │
//! │                                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//!            ▲ handle_* / poll_*                 ▲ Instant
//!            │                                   │
//!         driver (mio UDP socket, VirtualInterface, SignalingChannel)
//! ```

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

// ============================================================================
// Modules
// ============================================================================

pub mod config;
pub mod device;
pub mod driver;
pub mod engine;
pub mod error;
/// NAT traversal: candidates, checks, negotiation, liveness
pub mod p2p;
pub mod rate_limit;
/// Relay wire protocol and client side allocations
pub mod relay;
pub mod router;
pub mod session;
pub mod wire;

pub use config::{ConfigError, EngineConfig};
pub use device::{MemoryInterface, VirtualInterface};
pub use driver::{ChannelSignaling, Driver, SignalingChannel, TcpSignaling};
pub use engine::{
    Admission, CloseReason, ControlPlane, Engine, EngineError, EngineEvent, EngineStats, Grant, Lookup, Role,
};
pub use error::{Classify, ErrorClass};
pub use p2p::{Path, Via};
pub use router::Resource;
pub use session::{Identity, PublicKey};

// ============================================================================
// Shared Types
// ============================================================================

/// Identifier of a node, assigned by the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A datagram to send from the engine's socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub dst: SocketAddr,
    pub payload: Vec<u8>,
}
