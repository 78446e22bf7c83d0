//! # Key Management
//!
//! Keypair types used by the client.
//!
//! ## Key Types
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          KEY TYPES                                      │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  EncryptionKeyPair (X25519)                                            │
//! │  ──────────────────────────                                             │
//! │  • Ephemeral per proposal/session                                      │
//! │  • ECDH against the peer's public key yields the shared secret         │
//! │    that HKDF turns into the topic symmetric key                        │
//! │  • Private half never leaves the keychain; the public half is          │
//! │    transmitted in proposals and settlement results                     │
//! │                                                                         │
//! │  SigningKeyPair (Ed25519)                                              │
//! │  ─────────────────────────                                              │
//! │  • One long-lived client seed                                          │
//! │  • Signs the did:key JWT used to authenticate against the relay        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::error::{Error, Result};

/// Parse a 32-byte hex-encoded key
pub fn decode_key(hex_key: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_key)
        .map_err(|e| Error::InvalidKey(format!("Invalid hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| Error::InvalidKey("Expected a 32-byte key".to_string()))
}

/// X25519 keypair used for per-topic key agreement
///
/// The private half is zeroized on drop by `StaticSecret` itself.
pub struct EncryptionKeyPair {
    secret: StaticSecret,
    public: X25519PublicKey,
}

impl EncryptionKeyPair {
    /// Generate a new random keypair from the OS CSPRNG
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Reconstruct a keypair from a stored private key
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// The public key as lowercase hex (the wire representation)
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public.as_bytes())
    }

    /// The private key bytes (for keychain persistence only)
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Perform X25519 Diffie-Hellman against a peer public key
    ///
    /// ECDH symmetry is the property the whole pairing design rests on:
    /// `dh(a_priv, b_pub) == dh(b_priv, a_pub)`, so both sides derive the
    /// same topic key without ever transmitting a secret.
    pub fn diffie_hellman(&self, peer_public_hex: &str) -> Result<[u8; 32]> {
        let peer = X25519PublicKey::from(decode_key(peer_public_hex)?);
        Ok(*self.secret.diffie_hellman(&peer).as_bytes())
    }
}

/// Ed25519 keypair used for relay authentication
pub struct SigningKeyPair {
    signing: SigningKey,
}

impl SigningKeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    /// Reconstruct from a stored 32-byte seed
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self { signing: SigningKey::from_bytes(&seed) }
    }

    /// The seed bytes (for keychain persistence only)
    pub fn seed_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// The public (verifying) key bytes
    pub fn public_bytes(&self) -> [u8; 32] {
        VerifyingKey::from(&self.signing).to_bytes()
    }

    /// Sign a message, returning the 64-byte signature
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }
}

/// Generate 32 random bytes (pairing bootstrap symkeys)
pub fn random_bytes32() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ecdh_symmetry() {
        let alice = EncryptionKeyPair::generate();
        let bob = EncryptionKeyPair::generate();

        let shared_a = alice.diffie_hellman(&bob.public_key_hex()).unwrap();
        let shared_b = bob.diffie_hellman(&alice.public_key_hex()).unwrap();

        assert_eq!(shared_a, shared_b);
    }

    #[test]
    fn test_keypair_restore_from_secret() {
        let original = EncryptionKeyPair::generate();
        let restored = EncryptionKeyPair::from_secret_bytes(original.secret_bytes());

        assert_eq!(original.public_key_hex(), restored.public_key_hex());
    }

    #[test]
    fn test_decode_key_rejects_bad_input() {
        assert!(decode_key("not hex").is_err());
        assert!(decode_key("abcd").is_err()); // too short
    }

    #[test]
    fn test_signing_key_deterministic_from_seed() {
        let seed = [7u8; 32];
        let a = SigningKeyPair::from_seed(seed);
        let b = SigningKeyPair::from_seed(seed);

        assert_eq!(a.public_bytes(), b.public_bytes());
        assert_eq!(a.sign(b"payload"), b.sign(b"payload"));
    }
}
