//! UDP relay for last-resort connectivity
//!
//! Clients that cannot reach a peer directly obtain an allocation: a relayed
//! transport address on this server. Peers the client has granted a
//! permission to can exchange datagrams with the client through it.
//!
//! - `config`: limits and lifetimes, loaded from JSON
//! - `allocation`: per-allocation permissions, channels and byte quota
//! - `shard`: sans-IO request handling for the allocations of one worker
//! - `server`: dispatcher and worker event loops (mio)
//! - `metrics`: Prometheus counters

pub mod allocation;
pub mod config;
pub mod metrics;
pub mod server;
pub mod shard;

pub use config::RelayConfig;
pub use metrics::Metrics;
pub use server::RelayServer;
pub use shard::{AllocationCeiling, Output, RelayShard, RelaySockets};
