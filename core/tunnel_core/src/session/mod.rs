//! Authenticated encrypted sessions between peers
//!
//! # Data Packets
//!
//! ```text
//! ┌──────┬────────────────┬─────────────┬──────────────────────────────┐
//! │ 0x04 │ receiver index │   counter   │ ChaCha20-Poly1305 ciphertext │
//! │  1B  │      4B        │     8B      │        payload + 16B tag     │
//! └──────┴────────────────┴─────────────┴──────────────────────────────┘
//! ```
//!
//! The header is authenticated as associated data. The counter is the
//! nonce and is never reused under one key; the receiver rejects
//! duplicates with a sliding window. An empty payload is a keepalive.
//!
//! # Rekeying
//!
//! Each peer has one `SessionSlot`. Only `current` is used for sending.
//! A rekey installs a fresh session and moves the old one to `previous`,
//! where it keeps decrypting in-flight packets until it retires. On the
//! responder a fresh session waits in `next` until the initiator proves it
//! holds the keys by sending on it.

pub mod handshake;
pub mod identity;
pub mod replay;

use std::fmt;
use std::time::{Duration, Instant};

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};
use ring::hkdf::{Salt, HKDF_SHA256};
use serde::Serialize;

use crate::error::{Classify, ErrorClass};
use crate::wire::TYPE_DATA;
use crate::PeerId;

pub use handshake::{parse_header, HandshakeHeader, PendingHandshake};
pub use identity::{Identity, PublicKey};
pub use replay::ReplayWindow;

pub const DATA_HEADER_LEN: usize = 1 + 4 + 8;
pub const TAG_LEN: usize = 16;

/// Rekey after this long (initiator side)
pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);

/// Rekey after this many bytes in either direction
pub const REKEY_AFTER_BYTES: u64 = 1 << 30;

/// Stop using a session after this long even if rekeying keeps failing
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);

/// Counter limit, well below nonce wraparound
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - (1 << 13);

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// Handshake message did not verify
    HandshakeFailed,
    /// Handshake got no response in time
    Timeout,
    ReplayDetected,
    DecryptFailed,
    /// Packet too short or of the wrong kind
    Malformed,
    /// Counter space used up, a new session is required
    Exhausted,
    /// Key generation or derivation failed
    Crypto,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::HandshakeFailed => write!(f, "handshake failed"),
            SessionError::Timeout => write!(f, "handshake timed out"),
            SessionError::ReplayDetected => write!(f, "replayed packet"),
            SessionError::DecryptFailed => write!(f, "decryption failed"),
            SessionError::Malformed => write!(f, "malformed packet"),
            SessionError::Exhausted => write!(f, "session counter exhausted"),
            SessionError::Crypto => write!(f, "cryptographic failure"),
        }
    }
}

impl std::error::Error for SessionError {}

impl Classify for SessionError {
    fn class(&self) -> ErrorClass {
        match self {
            SessionError::Timeout | SessionError::Exhausted => ErrorClass::Transient,
            SessionError::HandshakeFailed
            | SessionError::ReplayDetected
            | SessionError::DecryptFailed
            | SessionError::Malformed => ErrorClass::Protocol,
            SessionError::Crypto => ErrorClass::Fatal,
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Per-peer counters, kept across rekeys
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub keepalives_sent: u64,
    pub decrypt_failures: u64,
    pub replays_detected: u64,
    pub handshakes_completed: u64,
    pub handshake_failures: u64,
}

impl SessionStats {
    /// Count a failed decrypt under the right bucket
    pub fn record_error(&mut self, error: SessionError) {
        match error {
            SessionError::ReplayDetected => self.replays_detected += 1,
            SessionError::HandshakeFailed | SessionError::Timeout => self.handshake_failures += 1,
            _ => self.decrypt_failures += 1,
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Data packet header fields
pub fn parse_data_header(packet: &[u8]) -> Option<(u32, u64)> {
    if packet.len() < DATA_HEADER_LEN + TAG_LEN || packet[0] != TYPE_DATA {
        return None;
    }

    let mut index = [0u8; 4];
    index.copy_from_slice(&packet[1..5]);
    let mut counter = [0u8; 8];
    counter.copy_from_slice(&packet[5..13]);
    Some((u32::from_be_bytes(index), u64::from_be_bytes(counter)))
}

pub(crate) fn derive_key(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<LessSafeKey, SessionError> {
    let prk = Salt::new(HKDF_SHA256, salt).extract(ikm);
    let info = [info];
    let okm = prk
        .expand(&info, &CHACHA20_POLY1305)
        .map_err(|_| SessionError::Crypto)?;
    Ok(LessSafeKey::new(UnboundKey::from(okm)))
}

fn nonce_for(counter: u64) -> Nonce {
    let mut nonce = [0u8; aead::NONCE_LEN];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    Nonce::assume_unique_for_key(nonce)
}

/// One set of keys with a peer
pub struct Session {
    peer: PeerId,
    local_index: u32,
    remote_index: u32,
    send_key: LessSafeKey,
    recv_key: LessSafeKey,
    send_counter: u64,
    replay: ReplayWindow,
    is_initiator: bool,
    created_at: Instant,
    bytes_sent: u64,
    bytes_received: u64,
}

impl Session {
    pub fn new(
        peer: PeerId,
        local_index: u32,
        remote_index: u32,
        send_key: LessSafeKey,
        recv_key: LessSafeKey,
        is_initiator: bool,
        now: Instant,
    ) -> Self {
        Self {
            peer,
            local_index,
            remote_index,
            send_key,
            recv_key,
            send_counter: 0,
            replay: ReplayWindow::new(),
            is_initiator,
            created_at: now,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn local_index(&self) -> u32 {
        self.local_index
    }

    pub fn remote_index(&self) -> u32 {
        self.remote_index
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        if self.send_counter >= REJECT_AFTER_MESSAGES {
            return Err(SessionError::Exhausted);
        }
        let counter = self.send_counter;
        self.send_counter += 1;

        let mut packet = Vec::with_capacity(DATA_HEADER_LEN + plaintext.len() + TAG_LEN);
        packet.push(TYPE_DATA);
        packet.extend_from_slice(&self.remote_index.to_be_bytes());
        packet.extend_from_slice(&counter.to_be_bytes());

        let mut body = plaintext.to_vec();
        self.send_key
            .seal_in_place_append_tag(nonce_for(counter), Aad::from(&packet[..DATA_HEADER_LEN]), &mut body)
            .map_err(|_| SessionError::Crypto)?;
        packet.extend_from_slice(&body);

        self.bytes_sent += plaintext.len() as u64;
        Ok(packet)
    }

    /// Authenticate and decrypt a data packet addressed to this session
    ///
    /// The replay window only advances once the packet authenticated.
    pub fn decrypt(&mut self, packet: &[u8]) -> Result<Vec<u8>, SessionError> {
        let (index, counter) = parse_data_header(packet).ok_or(SessionError::Malformed)?;
        if index != self.local_index {
            return Err(SessionError::Malformed);
        }
        if !self.replay.check(counter) {
            return Err(SessionError::ReplayDetected);
        }

        let mut body = packet[DATA_HEADER_LEN..].to_vec();
        let plaintext_len = self
            .recv_key
            .open_in_place(nonce_for(counter), Aad::from(&packet[..DATA_HEADER_LEN]), &mut body)
            .map_err(|_| SessionError::DecryptFailed)?
            .len();
        body.truncate(plaintext_len);

        self.replay.update(counter);
        self.bytes_received += plaintext_len as u64;
        Ok(body)
    }

    /// Time or volume says a new session should replace this one
    pub fn needs_rekey(&self, now: Instant, after_time: Duration, after_bytes: u64) -> bool {
        now >= self.created_at + after_time
            || self.bytes_sent >= after_bytes
            || self.bytes_received >= after_bytes
            || self.send_counter >= REJECT_AFTER_MESSAGES / 2
    }

    pub fn is_expired(&self, now: Instant, reject_after: Duration) -> bool {
        now >= self.created_at + reject_after
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("local_index", &self.local_index)
            .field("remote_index", &self.remote_index)
            .field("send_counter", &self.send_counter)
            .field("is_initiator", &self.is_initiator)
            .finish()
    }
}

// ============================================================================
// Session Slot
// ============================================================================

/// All sessions held for one peer
///
/// At most one session is used for sending at any time.
#[derive(Debug, Default)]
pub struct SessionSlot {
    current: Option<Session>,
    /// Responder side: established but not yet confirmed by the initiator
    next: Option<Session>,
    /// Replaced session still accepting in-flight packets until the deadline
    previous: Option<(Session, Instant)>,
}

impl SessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut Session> {
        self.current.as_mut()
    }

    pub fn is_ready(&self) -> bool {
        self.current.is_some()
    }

    pub fn has_pending_confirmation(&self) -> bool {
        self.next.is_some()
    }

    pub fn contains(&self, local_index: u32) -> bool {
        self.indices().contains(&local_index)
    }

    pub fn indices(&self) -> Vec<u32> {
        self.current
            .iter()
            .chain(self.next.iter())
            .chain(self.previous.iter().map(|(s, _)| s))
            .map(|s| s.local_index)
            .collect()
    }

    /// Install a freshly established session
    ///
    /// Initiator sessions take over sending at once. Responder sessions
    /// wait for confirmation. Returns the indices of sessions dropped to
    /// make room.
    pub fn install(&mut self, session: Session, now: Instant, overlap: Duration) -> Vec<u32> {
        if session.is_initiator {
            self.rotate(session, now, overlap)
        } else {
            self.next
                .replace(session)
                .map(|old| vec![old.local_index])
                .unwrap_or_default()
        }
    }

    /// Decrypt with whichever session owns `local_index`
    ///
    /// The first valid packet on an unconfirmed session promotes it.
    /// Returns the plaintext and the indices of any retired sessions.
    pub fn decrypt(
        &mut self,
        local_index: u32,
        packet: &[u8],
        now: Instant,
        overlap: Duration,
    ) -> Result<(Vec<u8>, Vec<u32>), SessionError> {
        if let Some(next) = self.next.as_mut().filter(|s| s.local_index == local_index) {
            let plaintext = next.decrypt(packet)?;
            let mut retired = Vec::new();
            if let Some(confirmed) = self.next.take() {
                log::debug!("Peer {}: session {} confirmed", confirmed.peer, confirmed.local_index);
                retired = self.rotate(confirmed, now, overlap);
            }
            return Ok((plaintext, retired));
        }

        if let Some(current) = self.current.as_mut().filter(|s| s.local_index == local_index) {
            return Ok((current.decrypt(packet)?, Vec::new()));
        }

        if let Some((previous, _)) = self.previous.as_mut().filter(|(s, _)| s.local_index == local_index) {
            return Ok((previous.decrypt(packet)?, Vec::new()));
        }

        Err(SessionError::Malformed)
    }

    /// Retire the previous session once its overlap ends
    pub fn handle_timeout(&mut self, now: Instant) -> Option<u32> {
        match &self.previous {
            Some((_, retire_at)) if now >= *retire_at => self.previous.take().map(|(s, _)| s.local_index),
            _ => None,
        }
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.previous.as_ref().map(|(_, retire_at)| *retire_at)
    }

    /// Drop every session, returning their indices
    pub fn clear(&mut self) -> Vec<u32> {
        let indices = self.indices();
        self.current = None;
        self.next = None;
        self.previous = None;
        indices
    }

    fn rotate(&mut self, session: Session, now: Instant, overlap: Duration) -> Vec<u32> {
        let mut retired = Vec::new();
        if let Some(old) = self.current.replace(session) {
            if let Some((dropped, _)) = self.previous.replace((old, now + overlap)) {
                retired.push(dropped.local_index);
            }
        }
        retired
    }
}

// ============================================================================
// Tests
// ============================================================================
