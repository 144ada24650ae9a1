//! NAT traversal: candidate gathering, exchange, and connectivity checks
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      P2P Module Structure                     │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                               │
//! │  candidate.rs    - Candidate types and priorities             │
//! │  transaction.rs  - Bounded retransmit state machine           │
//! │  gather.rs       - Host / reflexive / relayed gathering       │
//! │  signaling.rs    - Candidate exchange messages and framing    │
//! │  connectivity.rs - Binding checks over candidate pairs        │
//! │  negotiator.rs   - Per-peer path selection                    │
//! │  resilience.rs   - Keepalive, liveness and idle tracking      │
//! │                                                               │
//! └───────────────────────────────────────────────────────────────┘
//! ```

pub mod candidate;
pub mod connectivity;
pub mod gather;
pub mod negotiator;
pub mod resilience;
pub mod signaling;
pub mod transaction;

use std::fmt;
use std::net::SocketAddr;

pub use candidate::{
    calculate_priority, enumerate_local_addresses, gather_host_candidates,
    gather_reflexive_candidate, sort_candidates_by_priority, Candidate, CandidateKind,
};
pub use connectivity::{BindingMessage, BindingRequest, BindingResponse, CheckList, CheckState};
pub use gather::{GatherEvent, Gatherer};
pub use negotiator::{Negotiation, NegotiationError, NegotiationEvent, NegotiationState};
pub use resilience::PathMonitor;
pub use signaling::{Envelope, SignalingMessage};
pub use transaction::{Transaction, TransactionId, TransactionPoll};

/// How a datagram reaches the remote side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Via {
    /// Straight from our socket
    Direct,
    /// Through our allocation with this relayed address
    Relay(SocketAddr),
}

/// A usable network path to a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Path {
    /// The remote transport address packets are sent to
    pub remote: SocketAddr,
    pub via: Via,
}

impl Path {
    pub fn direct(remote: SocketAddr) -> Self {
        Self {
            remote,
            via: Via::Direct,
        }
    }

    pub fn relayed(remote: SocketAddr, relayed: SocketAddr) -> Self {
        Self {
            remote,
            via: Via::Relay(relayed),
        }
    }

    pub fn is_relayed(&self) -> bool {
        matches!(self.via, Via::Relay(_))
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.via {
            Via::Direct => write!(f, "direct {}", self.remote),
            Via::Relay(relayed) => write!(f, "{} via relay {}", self.remote, relayed),
        }
    }
}
