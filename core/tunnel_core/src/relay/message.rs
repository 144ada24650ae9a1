//! Relay wire protocol
//!
//! STUN/TURN-shaped control messages exchanged between a relay client and the
//! relay server, plus the compact ChannelData framing used for bound
//! channels.
//!
//! # Control Messages
//!
//! ```text
//! ┌──────┬──────────────────────────────────────────────┐
//! │ 0x01 │ bincode RelayMessage { transaction_id, body } │
//! └──────┴──────────────────────────────────────────────┘
//! ```
//!
//! # ChannelData
//!
//! ```text
//! ┌──────────────────┬────────────────┬─────────────┐
//! │ Channel (2B, BE) │ Length (2B, BE)│ Payload     │
//! └──────────────────┴────────────────┴─────────────┘
//! ```
//!
//! Channel numbers live in 0x4000..=0x7FFF so the first byte always falls in
//! the ChannelData demux range.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

use crate::error::{Classify, ErrorClass};
use crate::p2p::transaction::TransactionId;
use crate::wire::{self, CodecError, TYPE_RELAY};

// ============================================================================
// Constants
// ============================================================================

/// Lowest valid channel number
pub const CHANNEL_MIN: u16 = 0x4000;

/// Highest valid channel number
pub const CHANNEL_MAX: u16 = 0x7FFF;

/// Length of the ChannelData header
pub const CHANNEL_HEADER_LEN: usize = 4;

// ============================================================================
// Messages
// ============================================================================

/// Allocation identifier, generated by the relay
pub type AllocationId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub transaction_id: TransactionId,
    pub body: RelayBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayBody {
    /// Ask for the reflexive (server-observed) address
    BindingRequest,
    BindingResponse {
        mapped: SocketAddr,
    },

    AllocateRequest {
        lifetime_secs: u32,
    },
    AllocateResponse {
        allocation_id: AllocationId,
        relayed: SocketAddr,
        mapped: SocketAddr,
        lifetime_secs: u32,
    },

    /// Lifetime 0 tears the allocation down
    RefreshRequest {
        allocation_id: AllocationId,
        lifetime_secs: u32,
    },
    RefreshResponse {
        lifetime_secs: u32,
    },

    CreatePermissionRequest {
        allocation_id: AllocationId,
        peer: SocketAddr,
    },
    CreatePermissionResponse {
        lifetime_secs: u32,
    },

    ChannelBindRequest {
        allocation_id: AllocationId,
        channel: u16,
        peer: SocketAddr,
    },
    ChannelBindResponse {
        lifetime_secs: u32,
    },

    /// Client → relay: forward `data` to `peer` from the relayed address
    SendIndication {
        allocation_id: AllocationId,
        peer: SocketAddr,
        data: Vec<u8>,
    },
    /// Relay → client: `data` arrived from `peer` on the relayed address
    DataIndication {
        peer: SocketAddr,
        data: Vec<u8>,
    },

    ErrorResponse {
        code: RelayErrorCode,
    },
}

impl RelayBody {
    /// Whether the body answers a request (and completes its transaction)
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            RelayBody::BindingResponse { .. }
                | RelayBody::AllocateResponse { .. }
                | RelayBody::RefreshResponse { .. }
                | RelayBody::CreatePermissionResponse { .. }
                | RelayBody::ChannelBindResponse { .. }
                | RelayBody::ErrorResponse { .. }
        )
    }
}

/// Typed failure reported by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelayErrorCode {
    /// Allocation ceiling, per-address quota or byte quota reached
    QuotaExceeded,
    /// Too many requests from this source, try again later
    Throttled,
    /// Unknown, expired, or not owned by the requesting address
    NoSuchAllocation,
    /// Peer has no active permission on this allocation
    NoPermission,
    /// Channel number not bound (or bound to another peer)
    UnboundChannel,
    /// Malformed or out-of-range request
    BadRequest,
}

impl fmt::Display for RelayErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayErrorCode::QuotaExceeded => write!(f, "quota exceeded"),
            RelayErrorCode::Throttled => write!(f, "throttled"),
            RelayErrorCode::NoSuchAllocation => write!(f, "no such allocation"),
            RelayErrorCode::NoPermission => write!(f, "no permission"),
            RelayErrorCode::UnboundChannel => write!(f, "unbound channel"),
            RelayErrorCode::BadRequest => write!(f, "bad request"),
        }
    }
}

impl std::error::Error for RelayErrorCode {}

impl Classify for RelayErrorCode {
    fn class(&self) -> ErrorClass {
        match self {
            RelayErrorCode::QuotaExceeded => ErrorClass::Resource,
            RelayErrorCode::Throttled => ErrorClass::Transient,
            RelayErrorCode::NoSuchAllocation
            | RelayErrorCode::NoPermission
            | RelayErrorCode::UnboundChannel
            | RelayErrorCode::BadRequest => ErrorClass::Protocol,
        }
    }
}

// ============================================================================
// Encoding/Decoding
// ============================================================================

pub fn encode_relay(msg: &RelayMessage) -> Result<Vec<u8>, CodecError> {
    wire::encode_typed(TYPE_RELAY, msg)
}

pub fn decode_relay(packet: &[u8]) -> Result<RelayMessage, CodecError> {
    wire::decode_typed(TYPE_RELAY, packet)
}

pub fn is_valid_channel(channel: u16) -> bool {
    (CHANNEL_MIN..=CHANNEL_MAX).contains(&channel)
}

/// Frame `payload` for a bound channel
pub fn encode_channel_data(channel: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(CHANNEL_HEADER_LEN + payload.len());
    buf.extend_from_slice(&channel.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Split a ChannelData datagram into channel number and payload
pub fn decode_channel_data(packet: &[u8]) -> Result<(u16, &[u8]), CodecError> {
    if packet.len() < CHANNEL_HEADER_LEN {
        return Err(CodecError::Truncated);
    }

    let channel = u16::from_be_bytes([packet[0], packet[1]]);
    if !is_valid_channel(channel) {
        return Err(CodecError::WrongType(packet[0]));
    }

    let length = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    let payload = &packet[CHANNEL_HEADER_LEN..];
    if payload.len() < length {
        return Err(CodecError::Truncated);
    }

    Ok((channel, &payload[..length]))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{classify, PacketKind};

    #[test]
    fn test_relay_message_is_demuxed_as_relay() {
        let msg = RelayMessage {
            transaction_id: [7u8; 12],
            body: RelayBody::AllocateRequest { lifetime_secs: 600 },
        };

        let encoded = encode_relay(&msg).unwrap();
        assert_eq!(classify(&encoded), Some(PacketKind::Relay));
        assert_eq!(decode_relay(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_channel_data_framing() {
        let framed = encode_channel_data(0x4001, b"hello");

        assert_eq!(&framed[..4], &[0x40, 0x01, 0x00, 0x05]);
        assert_eq!(classify(&framed), Some(PacketKind::ChannelData));

        let (channel, payload) = decode_channel_data(&framed).unwrap();
        assert_eq!(channel, 0x4001);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn test_channel_data_ignores_padding() {
        let mut framed = encode_channel_data(CHANNEL_MAX, b"abc");
        framed.extend_from_slice(&[0, 0, 0]);

        let (_, payload) = decode_channel_data(&framed).unwrap();
        assert_eq!(payload, b"abc");
    }

    #[test]
    fn test_channel_data_truncated() {
        let framed = encode_channel_data(CHANNEL_MIN, b"hello");

        assert_eq!(decode_channel_data(&framed[..3]), Err(CodecError::Truncated));
        assert_eq!(decode_channel_data(&framed[..6]), Err(CodecError::Truncated));
    }

    #[test]
    fn test_channel_range() {
        assert!(is_valid_channel(0x4000));
        assert!(is_valid_channel(0x7FFF));
        assert!(!is_valid_channel(0x3FFF));
        assert!(!is_valid_channel(0x8000));
    }

    #[test]
    fn test_error_code_classes() {
        assert_eq!(RelayErrorCode::QuotaExceeded.class(), ErrorClass::Resource);
        assert_eq!(RelayErrorCode::Throttled.class(), ErrorClass::Transient);
        assert_eq!(RelayErrorCode::NoPermission.class(), ErrorClass::Protocol);
        assert_eq!(RelayErrorCode::NoSuchAllocation.to_string(), "no such allocation");
    }

    #[test]
    fn test_response_detection() {
        assert!(RelayBody::RefreshResponse { lifetime_secs: 0 }.is_response());
        assert!(!RelayBody::BindingRequest.is_response());
        assert!(!RelayBody::DataIndication {
            peer: "10.0.0.1:1".parse().unwrap(),
            data: vec![]
        }
        .is_response());
    }
}
