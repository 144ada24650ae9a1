//! Mutually authenticated key exchange
//!
//! One round trip. Each side contributes an ephemeral X25519 key signed
//! with its static Ed25519 identity, so both sides are authenticated and
//! the session keys are forward secret.
//!
//! # Messages
//!
//! ```text
//! Init (initiator → responder):
//! ┌──────┬──────┬──────────────┬──────────────┬───────────────┬───────────┐
//! │ 0x03 │ 0x01 │ initiator id │ sender index │ ephemeral key │ signature │
//! │  1B  │  1B  │     8B       │     4B       │     32B       │    64B    │
//! └──────┴──────┴──────────────┴──────────────┴───────────────┴───────────┘
//!
//! Response (responder → initiator):
//! ┌──────┬──────┬──────────────┬────────────────┬───────────────┬───────────┐
//! │ 0x03 │ 0x02 │ sender index │ receiver index │ ephemeral key │ signature │
//! │  1B  │  1B  │     4B       │      4B        │     32B       │    64B    │
//! └──────┴──────┴──────────────┴────────────────┴───────────────┴───────────┘
//! ```
//!
//! The init signature covers the responder's public key, so an init is only
//! valid toward the peer it was made for. The response signature covers
//! the hash of the init it answers.
//!
//! # Keys
//!
//! ```text
//! salt = SHA-256(init || response)
//! send/recv = HKDF-SHA256(salt, X25519(ephemeral_i, ephemeral_r), direction label)
//! ```

use std::time::{Duration, Instant};

use ring::agreement::{self, EphemeralPrivateKey, X25519};
use ring::digest::{self, SHA256};
use ring::rand::SystemRandom;

use super::identity::{Identity, PublicKey, SIGNATURE_LEN};
use super::{derive_key, Session, SessionError};
use crate::p2p::transaction::{Transaction, TransactionPoll};
use crate::wire::TYPE_HANDSHAKE;
use crate::PeerId;

pub const KIND_INIT: u8 = 0x01;
pub const KIND_RESPONSE: u8 = 0x02;

const EPHEMERAL_LEN: usize = 32;

pub const INIT_LEN: usize = 2 + 8 + 4 + EPHEMERAL_LEN + SIGNATURE_LEN;
pub const RESPONSE_LEN: usize = 2 + 4 + 4 + EPHEMERAL_LEN + SIGNATURE_LEN;

const INIT_LABEL: &[u8] = b"tunnel-core handshake init";
const RESPONSE_LABEL: &[u8] = b"tunnel-core handshake response";
const INITIATOR_TO_RESPONDER: &[u8] = b"initiator->responder";
const RESPONDER_TO_INITIATOR: &[u8] = b"responder->initiator";

/// Header fields of a handshake packet, readable before any crypto
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeHeader {
    Init { initiator: PeerId, sender_index: u32 },
    Response { sender_index: u32, receiver_index: u32 },
}

/// Read the header of a handshake packet
pub fn parse_header(packet: &[u8]) -> Option<HandshakeHeader> {
    if packet.len() < 2 || packet[0] != TYPE_HANDSHAKE {
        return None;
    }

    match packet[1] {
        KIND_INIT if packet.len() == INIT_LEN => Some(HandshakeHeader::Init {
            initiator: PeerId(read_u64(&packet[2..10])),
            sender_index: read_u32(&packet[10..14]),
        }),
        KIND_RESPONSE if packet.len() == RESPONSE_LEN => Some(HandshakeHeader::Response {
            sender_index: read_u32(&packet[2..6]),
            receiver_index: read_u32(&packet[6..10]),
        }),
        _ => None,
    }
}

// ============================================================================
// Initiator
// ============================================================================

/// An init that has been sent and is waiting for its response
pub struct PendingHandshake {
    peer: PeerId,
    local_index: u32,
    remote_identity: PublicKey,
    ephemeral: Option<EphemeralPrivateKey>,
    init: Vec<u8>,
    txn: Transaction,
}

impl PendingHandshake {
    pub fn initiate(
        identity: &Identity,
        local_peer: PeerId,
        peer: PeerId,
        remote_identity: PublicKey,
        local_index: u32,
        max_attempts: u32,
        timeout: Duration,
        now: Instant,
    ) -> Result<Self, SessionError> {
        let rng = SystemRandom::new();
        let ephemeral = EphemeralPrivateKey::generate(&X25519, &rng).map_err(|_| SessionError::Crypto)?;
        let ephemeral_public = ephemeral.compute_public_key().map_err(|_| SessionError::Crypto)?;

        let mut init = Vec::with_capacity(INIT_LEN);
        init.push(TYPE_HANDSHAKE);
        init.push(KIND_INIT);
        init.extend_from_slice(&local_peer.0.to_be_bytes());
        init.extend_from_slice(&local_index.to_be_bytes());
        init.extend_from_slice(ephemeral_public.as_ref());

        let signature = identity.sign(&init_signed_bytes(&init, &remote_identity));
        init.extend_from_slice(&signature);

        Ok(Self {
            peer,
            local_index,
            remote_identity,
            ephemeral: Some(ephemeral),
            init,
            txn: Transaction::start(now, max_attempts, timeout).ok_or(SessionError::Crypto)?,
        })
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn local_index(&self) -> u32 {
        self.local_index
    }

    /// The init packet, for (re)transmission
    pub fn packet(&self) -> &[u8] {
        &self.init
    }

    pub fn poll(&mut self, now: Instant) -> TransactionPoll {
        self.txn.poll(now)
    }

    pub fn next_timeout(&self) -> Instant {
        self.txn.next_timeout()
    }

    /// Verify the response and derive the session
    ///
    /// A response that fails verification leaves the handshake pending, so
    /// a forged packet cannot abort it.
    pub fn complete(&mut self, response: &[u8], now: Instant) -> Result<Session, SessionError> {
        let Some(HandshakeHeader::Response {
            sender_index,
            receiver_index,
        }) = parse_header(response)
        else {
            return Err(SessionError::Malformed);
        };
        if receiver_index != self.local_index {
            return Err(SessionError::HandshakeFailed);
        }

        let signed_len = RESPONSE_LEN - SIGNATURE_LEN;
        let signed = response_signed_bytes(&self.init, &response[..signed_len]);
        if !self.remote_identity.verify(&signed, &response[signed_len..]) {
            return Err(SessionError::HandshakeFailed);
        }

        let ephemeral = self.ephemeral.take().ok_or(SessionError::HandshakeFailed)?;
        let peer_ephemeral = agreement::UnparsedPublicKey::new(&X25519, &response[10..10 + EPHEMERAL_LEN]);
        let salt = transcript_hash(&self.init, response);

        let (send_key, recv_key) = agreement::agree_ephemeral(ephemeral, &peer_ephemeral, |shared| {
            Ok::<_, SessionError>((
                derive_key(salt.as_ref(), shared, INITIATOR_TO_RESPONDER)?,
                derive_key(salt.as_ref(), shared, RESPONDER_TO_INITIATOR)?,
            ))
        })
        .map_err(|_| SessionError::HandshakeFailed)??;

        Ok(Session::new(
            self.peer,
            self.local_index,
            sender_index,
            send_key,
            recv_key,
            true,
            now,
        ))
    }
}

impl std::fmt::Debug for PendingHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingHandshake")
            .field("peer", &self.peer)
            .field("local_index", &self.local_index)
            .field("attempts", &self.txn.attempts())
            .finish()
    }
}

// ============================================================================
// Responder
// ============================================================================

/// Answer a handshake init from a peer whose identity we know
///
/// Returns the new session and the response packet to send back.
pub fn respond(
    identity: &Identity,
    initiator_identity: &PublicKey,
    local_index: u32,
    init: &[u8],
    now: Instant,
) -> Result<(Session, Vec<u8>), SessionError> {
    let Some(HandshakeHeader::Init {
        initiator,
        sender_index,
    }) = parse_header(init)
    else {
        return Err(SessionError::Malformed);
    };

    let signed_len = INIT_LEN - SIGNATURE_LEN;
    let signed = init_signed_bytes(&init[..signed_len], &identity.public_key());
    if !initiator_identity.verify(&signed, &init[signed_len..]) {
        return Err(SessionError::HandshakeFailed);
    }

    let rng = SystemRandom::new();
    let ephemeral = EphemeralPrivateKey::generate(&X25519, &rng).map_err(|_| SessionError::Crypto)?;
    let ephemeral_public = ephemeral.compute_public_key().map_err(|_| SessionError::Crypto)?;

    let mut response = Vec::with_capacity(RESPONSE_LEN);
    response.push(TYPE_HANDSHAKE);
    response.push(KIND_RESPONSE);
    response.extend_from_slice(&local_index.to_be_bytes());
    response.extend_from_slice(&sender_index.to_be_bytes());
    response.extend_from_slice(ephemeral_public.as_ref());
    let signature = identity.sign(&response_signed_bytes(init, &response));
    response.extend_from_slice(&signature);

    let peer_ephemeral = agreement::UnparsedPublicKey::new(&X25519, &init[14..14 + EPHEMERAL_LEN]);
    let salt = transcript_hash(init, &response);

    let (send_key, recv_key) = agreement::agree_ephemeral(ephemeral, &peer_ephemeral, |shared| {
        Ok::<_, SessionError>((
            derive_key(salt.as_ref(), shared, RESPONDER_TO_INITIATOR)?,
            derive_key(salt.as_ref(), shared, INITIATOR_TO_RESPONDER)?,
        ))
    })
    .map_err(|_| SessionError::HandshakeFailed)??;

    let session = Session::new(initiator, local_index, sender_index, send_key, recv_key, false, now);
    Ok((session, response))
}

// ============================================================================
// Helpers
// ============================================================================

fn init_signed_bytes(init_body: &[u8], responder: &PublicKey) -> Vec<u8> {
    let mut signed = Vec::with_capacity(INIT_LABEL.len() + 32 + init_body.len());
    signed.extend_from_slice(INIT_LABEL);
    signed.extend_from_slice(responder.as_bytes());
    signed.extend_from_slice(init_body);
    signed
}

fn response_signed_bytes(init: &[u8], response_body: &[u8]) -> Vec<u8> {
    let init_hash = digest::digest(&SHA256, init);
    let mut signed = Vec::with_capacity(RESPONSE_LABEL.len() + 32 + response_body.len());
    signed.extend_from_slice(RESPONSE_LABEL);
    signed.extend_from_slice(init_hash.as_ref());
    signed.extend_from_slice(response_body);
    signed
}

fn transcript_hash(init: &[u8], response: &[u8]) -> digest::Digest {
    let mut ctx = digest::Context::new(&SHA256);
    ctx.update(init);
    ctx.update(response);
    ctx.finish()
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_be_bytes(buf)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_be_bytes(buf)
}

// ============================================================================
// Tests
// ============================================================================
