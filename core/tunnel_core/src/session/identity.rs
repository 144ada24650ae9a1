//! Long-term Ed25519 identities

use std::fmt;

use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519};
use serde::{Deserialize, Serialize};

use super::SessionError;

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

/// A peer's public identity key, as advertised over signaling
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    /// Check an Ed25519 signature made by this key
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        UnparsedPublicKey::new(&ED25519, &self.0)
            .verify(message, signature)
            .is_ok()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short fingerprint is enough for logs
        write!(
            f,
            "PublicKey({:02x}{:02x}{:02x}{:02x})",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// The local static key pair
pub struct Identity {
    key_pair: Ed25519KeyPair,
    pkcs8: Vec<u8>,
    public: PublicKey,
}

impl Identity {
    pub fn generate() -> Result<Self, SessionError> {
        let rng = SystemRandom::new();
        let document = Ed25519KeyPair::generate_pkcs8(&rng).map_err(|_| SessionError::Crypto)?;
        Self::from_pkcs8(document.as_ref())
    }

    /// Load a key pair from its PKCS#8 encoding
    pub fn from_pkcs8(pkcs8: &[u8]) -> Result<Self, SessionError> {
        let key_pair = Ed25519KeyPair::from_pkcs8(pkcs8).map_err(|_| SessionError::Crypto)?;

        let mut public = [0u8; PUBLIC_KEY_LEN];
        public.copy_from_slice(key_pair.public_key().as_ref());

        Ok(Self {
            key_pair,
            pkcs8: pkcs8.to_vec(),
            public: PublicKey(public),
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub fn pkcs8(&self) -> &[u8] {
        &self.pkcs8
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(self.key_pair.sign(message).as_ref());
        signature
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity").field("public", &self.public).finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
