//! Datagram demultiplexing
//!
//! Every UDP datagram the engine or the relay handles starts with a type
//! byte. Relay control traffic, connectivity checks, handshakes and data all
//! share one socket, so the first byte decides which component sees it.
//!
//! ```text
//! 0x01        relay control message (bincode RelayMessage)
//! 0x02        connectivity check (bincode BindingMessage)
//! 0x03        secure session handshake
//! 0x04        secure session data
//! 0x40..0x7F  ChannelData: | channel (2B) | length (2B) | payload |
//! ```

use crate::error::{Classify, ErrorClass};

/// Relay control message (allocate, refresh, permission, indications)
pub const TYPE_RELAY: u8 = 0x01;

/// Connectivity check (binding request/response between peers)
pub const TYPE_BINDING: u8 = 0x02;

/// Secure session handshake (init/response)
pub const TYPE_HANDSHAKE: u8 = 0x03;

/// Secure session transport data
pub const TYPE_DATA: u8 = 0x04;

/// Kind of a received datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Relay,
    Binding,
    Handshake,
    Data,
    ChannelData,
}

/// Classify a datagram by its first byte
pub fn classify(packet: &[u8]) -> Option<PacketKind> {
    let first = *packet.first()?;

    match first {
        TYPE_RELAY => Some(PacketKind::Relay),
        TYPE_BINDING => Some(PacketKind::Binding),
        TYPE_HANDSHAKE => Some(PacketKind::Handshake),
        TYPE_DATA => Some(PacketKind::Data),
        0x40..=0x7F => Some(PacketKind::ChannelData),
        _ => None,
    }
}

/// Prepend a type byte to an encoded payload
pub fn with_type(ty: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + payload.len());
    buf.push(ty);
    buf.extend_from_slice(payload);
    buf
}

/// Serialize `msg` with bincode behind a type byte
pub fn encode_typed<T: serde::Serialize>(ty: u8, msg: &T) -> Result<Vec<u8>, CodecError> {
    let payload = bincode::serialize(msg).map_err(|e| CodecError::Serialization(e.to_string()))?;
    Ok(with_type(ty, &payload))
}

/// Deserialize a bincode message after checking its type byte
pub fn decode_typed<T: serde::de::DeserializeOwned>(ty: u8, packet: &[u8]) -> Result<T, CodecError> {
    match packet.first() {
        None => Err(CodecError::Truncated),
        Some(&first) if first != ty => Err(CodecError::WrongType(first)),
        Some(_) => bincode::deserialize(&packet[1..])
            .map_err(|e| CodecError::Deserialization(e.to_string())),
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors produced by the datagram codecs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Buffer shorter than the fixed header
    Truncated,
    /// First byte does not match the expected message type
    WrongType(u8),
    Serialization(String),
    Deserialization(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Truncated => write!(f, "truncated datagram"),
            CodecError::WrongType(ty) => write!(f, "unexpected message type 0x{:02x}", ty),
            CodecError::Serialization(e) => write!(f, "serialization error: {}", e),
            CodecError::Deserialization(e) => write!(f, "deserialization error: {}", e),
        }
    }
}

impl std::error::Error for CodecError {}

impl Classify for CodecError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Protocol
    }
}
