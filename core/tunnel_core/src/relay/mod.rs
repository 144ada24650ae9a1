//! Relay wire protocol and client side allocation handling
//!
//! `message` is shared with the relay server crate; `client` is what the
//! engine uses to obtain a relayed candidate and move data through it.

pub mod client;
pub mod message;

pub use client::{RelayClient, RelayClientError, RelayEvent, DEFAULT_ALLOCATION_LIFETIME_SECS};
pub use message::{
    decode_channel_data, decode_relay, encode_channel_data, encode_relay, AllocationId, RelayBody,
    RelayErrorCode, RelayMessage,
};
