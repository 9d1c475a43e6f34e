//! WireGuard key handling
//!
//! Curve25519 key pairs via x25519-dalek, carried as base64 in records and
//! on the wire.

use crate::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand_core::OsRng;
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};

/// Length of a raw WireGuard key in bytes.
pub const KEY_LENGTH: usize = 32;

/// A WireGuard key pair.
#[derive(Clone)]
pub struct KeyPair {
    private_key: [u8; KEY_LENGTH],
    public_key: [u8; KEY_LENGTH],
}

impl KeyPair {
    /// Generate a new random key pair from the system CSPRNG.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            private_key: secret.to_bytes(),
            public_key: public.to_bytes(),
        }
    }

    /// Derive a key pair from an existing base64 private key.
    pub fn from_private_key_base64(private_key: &str) -> Result<Self> {
        let bytes = decode_key(private_key)?;
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Ok(Self {
            private_key: secret.to_bytes(),
            public_key: public.to_bytes(),
        })
    }

    /// The private key as base64.
    pub fn private_key_base64(&self) -> String {
        STANDARD.encode(self.private_key)
    }

    /// The public key as base64.
    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.public_key)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_base64())
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// Validate a base64-encoded public key. Join requests carry keys produced
/// by arbitrary clients, so length and encoding are checked before use.
pub fn validate_public_key(key: &str) -> Result<()> {
    decode_key(key).map(|_| ())
}

fn decode_key(key: &str) -> Result<[u8; KEY_LENGTH]> {
    let bytes = STANDARD
        .decode(key)
        .map_err(|e| Error::InvalidArgument(format!("invalid key encoding: {}", e)))?;
    bytes.try_into().map_err(|_| {
        Error::InvalidArgument(format!("invalid key length, expected {} bytes", KEY_LENGTH))
    })
}
