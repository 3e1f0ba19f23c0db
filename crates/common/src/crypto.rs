//! WireGuard key material
//!
//! Curve25519 key pairs encoded the way WireGuard tools expect them
//! (standard base64 of the 32 raw bytes).

use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

/// WireGuard key pair, both halves base64 encoded
#[derive(Clone, PartialEq, Eq)]
pub struct WgKeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl WgKeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let mut private_key_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut private_key_bytes);

        // WireGuard clamping
        private_key_bytes[0] &= 248;
        private_key_bytes[31] &= 127;
        private_key_bytes[31] |= 64;

        Self::from_private_bytes(private_key_bytes)
    }

    /// Rebuild a key pair from a base64 private key
    pub fn from_private_key(private_key: &str) -> Result<Self> {
        let bytes = decode_key(private_key)?;
        Ok(Self::from_private_bytes(bytes))
    }

    fn from_private_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self {
            private_key: STANDARD.encode(bytes),
            public_key: STANDARD.encode(public.as_bytes()),
        }
    }
}

impl std::fmt::Debug for WgKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgKeyPair")
            .field("public_key", &self.public_key)
            .finish()
    }
}

/// Decode a base64 WireGuard key into its 32 raw bytes
pub fn decode_key(key: &str) -> Result<[u8; 32]> {
    let data = STANDARD
        .decode(key.trim())
        .map_err(|e| Error::Crypto(format!("Invalid key encoding: {}", e)))?;
    data.try_into()
        .map_err(|_| Error::Crypto("Invalid key length".to_string()))
}

/// Short SHA-256 fingerprint of a blob, for log lines
pub fn fingerprint(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex::encode(&digest[..8])
}
