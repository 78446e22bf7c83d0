//! # Key Derivation
//!
//! Turns an X25519 shared secret into a per-topic symmetric key, and
//! derives topic identifiers from key material.
//!
//! ## Derivation Chain
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                 SHARED SECRET → TOPIC KEY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  X25519(self_private, peer_public)                                     │
//! │            │                                                            │
//! │            ▼                                                            │
//! │  HKDF-SHA256(ikm = dh_output, salt = none, info = empty)               │
//! │            │                                                            │
//! │            ▼                                                            │
//! │  SymKey (32 bytes)                                                     │
//! │            │                                                            │
//! │            ▼                                                            │
//! │  Topic = hex(SHA-256(SymKey))                                          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Both sides of a handshake run this chain with their own private key and
//! the peer's public key; ECDH symmetry guarantees they land on the same
//! symkey and therefore the same topic, without a secret ever crossing the
//! relay.

use hkdf::Hkdf;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Derive the 256-bit topic symmetric key from a raw DH output
///
/// No salt and an empty info string: the derivation must match what every
/// other client implementation of the protocol computes, byte for byte.
pub fn derive_sym_key(dh_output: &[u8; 32]) -> Result<[u8; 32]> {
    let hkdf = Hkdf::<Sha256>::new(None, dh_output);
    let mut key = [0u8; 32];
    hkdf.expand(&[], &mut key)
        .map_err(|_| Error::KeyDerivationFailed("HKDF expansion failed".to_string()))?;
    Ok(key)
}

/// Derive the topic identifier for a symmetric key: `hex(sha256(sym_key))`
pub fn topic_from_sym_key(sym_key: &[u8; 32]) -> String {
    hex::encode(Sha256::digest(sym_key))
}

/// Fingerprint a relay message for the duplicate-suppression ledger
pub fn hash_message(message: &str) -> String {
    hex::encode(Sha256::digest(message.as_bytes()))
}
