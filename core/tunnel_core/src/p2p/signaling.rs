//! Signaling protocol for candidate exchange
//!
//! The engine does not own a signaling transport. It emits
//! [`SignalingMessage`]s addressed to a peer and consumes the ones the
//! transport delivers. This module defines those messages and the framing
//! used when they travel over a byte stream.
//!
//! # Protocol Overview
//!
//! ```text
//! Client                  Signaling transport                Gateway
//!   │                              │                            │
//!   │── OfferCandidates ──────────►│── OfferCandidates ────────►│
//!   │                              │                            │
//!   │◄─ AnswerCandidates ──────────│◄─ AnswerCandidates ────────│
//!   │                              │                            │
//!   │── InvalidateCandidates ─────►│── InvalidateCandidates ───►│  (relay lost)
//! ```
//!
//! Offers and answers may be repeated with the same negotiation id to
//! trickle candidates discovered later.
//!
//! # Message Framing
//!
//! Messages are length-prefixed with a 4-byte big-endian length header:
//! ```text
//! ┌─────────────┬─────────────────────────────────┐
//! │ Length (4B) │ Payload (bincode Envelope)      │
//! └─────────────┴─────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

use super::candidate::Candidate;
use crate::error::{Classify, ErrorClass};
use crate::session::PublicKey;
use crate::PeerId;

// ============================================================================
// Constants
// ============================================================================

/// Maximum signaling message size (64 KB should be plenty for candidates)
pub const MAX_MESSAGE_SIZE: u32 = 65536;

/// Length of the message header (4 bytes for length)
pub const HEADER_LEN: usize = 4;

// ============================================================================
// Signaling Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalingMessage {
    /// Controlling side announces its candidates
    OfferCandidates {
        negotiation_id: u64,
        /// Sender's static identity key
        public_key: PublicKey,
        candidates: Vec<Candidate>,
    },

    /// Controlled side responds with its candidates
    AnswerCandidates {
        negotiation_id: u64,
        public_key: PublicKey,
        candidates: Vec<Candidate>,
    },

    /// Previously announced candidates are no longer valid
    InvalidateCandidates {
        negotiation_id: u64,
        candidates: Vec<Candidate>,
    },
}

impl SignalingMessage {
    pub fn negotiation_id(&self) -> u64 {
        match self {
            SignalingMessage::OfferCandidates { negotiation_id, .. }
            | SignalingMessage::AnswerCandidates { negotiation_id, .. }
            | SignalingMessage::InvalidateCandidates { negotiation_id, .. } => *negotiation_id,
        }
    }

    pub fn candidates(&self) -> &[Candidate] {
        match self {
            SignalingMessage::OfferCandidates { candidates, .. }
            | SignalingMessage::AnswerCandidates { candidates, .. }
            | SignalingMessage::InvalidateCandidates { candidates, .. } => candidates,
        }
    }
}

/// A signaling message plus the peer it is from (inbound) or to (outbound)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub peer: PeerId,
    pub message: SignalingMessage,
}

// ============================================================================
// Message Encoding/Decoding
// ============================================================================

/// Encode an envelope with length prefix
///
/// Returns a Vec containing: [4-byte BE length][bincode payload]
pub fn encode_message(envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
    let payload =
        bincode::serialize(envelope).map_err(|e| EncodeError::Serialization(e.to_string()))?;

    if payload.len() > MAX_MESSAGE_SIZE as usize {
        return Err(EncodeError::MessageTooLarge(payload.len()));
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);

    Ok(buf)
}

/// Decode an envelope from a length-prefixed buffer
///
/// Returns the envelope and the number of bytes consumed
pub fn decode_message(buf: &[u8]) -> Result<(Envelope, usize), DecodeError> {
    if buf.len() < HEADER_LEN {
        return Err(DecodeError::Incomplete(HEADER_LEN - buf.len()));
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_MESSAGE_SIZE as usize {
        return Err(DecodeError::MessageTooLarge(length));
    }

    let total_len = HEADER_LEN + length;
    if buf.len() < total_len {
        return Err(DecodeError::Incomplete(total_len - buf.len()));
    }

    let payload = &buf[HEADER_LEN..total_len];
    let envelope =
        bincode::deserialize(payload).map_err(|e| DecodeError::Deserialization(e.to_string()))?;

    Ok((envelope, total_len))
}

/// Decode as many complete envelopes as `buf` holds
///
/// Returns decoded envelopes and remaining bytes. A corrupt frame is an
/// error: the stream cannot be resynchronised.
pub fn decode_messages(mut buf: &[u8]) -> Result<(Vec<Envelope>, Vec<u8>), DecodeError> {
    let mut envelopes = Vec::new();

    while !buf.is_empty() {
        match decode_message(buf) {
            Ok((envelope, consumed)) => {
                envelopes.push(envelope);
                buf = &buf[consumed..];
            }
            Err(DecodeError::Incomplete(_)) => break,
            Err(e) => return Err(e),
        }
    }

    Ok((envelopes, buf.to_vec()))
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during message encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Serialization failed
    Serialization(String),
    /// Message exceeds maximum size
    MessageTooLarge(usize),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodeError::Serialization(e) => write!(f, "serialization error: {}", e),
            EncodeError::MessageTooLarge(size) => {
                write!(f, "message too large: {} bytes (max {})", size, MAX_MESSAGE_SIZE)
            }
        }
    }
}

impl std::error::Error for EncodeError {}

impl Classify for EncodeError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Protocol
    }
}

/// Errors that can occur during message decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough data (need N more bytes)
    Incomplete(usize),
    /// Deserialization failed
    Deserialization(String),
    /// Message exceeds maximum size
    MessageTooLarge(usize),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Incomplete(needed) => {
                write!(f, "incomplete message, need {} more bytes", needed)
            }
            DecodeError::Deserialization(e) => write!(f, "deserialization error: {}", e),
            DecodeError::MessageTooLarge(size) => {
                write!(f, "message too large: {} bytes (max {})", size, MAX_MESSAGE_SIZE)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

impl Classify for DecodeError {
    fn class(&self) -> ErrorClass {
        match self {
            DecodeError::Incomplete(_) => ErrorClass::Transient,
            _ => ErrorClass::Protocol,
        }
    }
}

/// Generate a random negotiation ID using CSPRNG
pub fn generate_negotiation_id() -> Result<u64, ring::error::Unspecified> {
    use ring::rand::{SecureRandom, SystemRandom};
    let mut buf = [0u8; 8];
    SystemRandom::new().fill(&mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}

// ============================================================================
// Tests
// ============================================================================
