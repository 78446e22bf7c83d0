//! # Crypto Module
//!
//! Key generation, per-topic key agreement, and envelope encode/decode.
//!
//! ## Responsibilities
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          CRYPTO ENGINE                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  generate_key_pair()       - X25519 keypair, private half stored       │
//! │                              under label = public key hex              │
//! │  generate_shared_key(a, b) - ECDH + HKDF → symkey, stored under the    │
//! │                              derived topic (sha256 of the key)         │
//! │  set_sym_key(key)          - import a bootstrap symkey (pairing URI)   │
//! │  encode(topic, payload)    - JSON → sealed base64 envelope             │
//! │  decode(topic, envelope)   - inverse; auth failures are non-fatal to   │
//! │                              the caller's message loop                 │
//! │  sign_jwt(aud, ttl)        - did:key relay auth token                  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Private key material never leaves this module unencrypted except for
//! public halves, which are transmitted in proposals and settlements.

pub mod envelope;
pub mod jwt;
pub mod kdf;
pub mod keys;
mod keystore;

pub use envelope::EnvelopeType;
pub use keystore::KeyStore;

use std::sync::Arc;

use serde_json::Value;

use self::keys::{decode_key, random_bytes32, EncryptionKeyPair, SigningKeyPair};
use crate::error::{Error, Result};

/// Keychain label for the long-lived relay auth seed
const CLIENT_SEED_LABEL: &str = "client_ed25519_seed";

/// Default relay auth token lifetime (one day)
pub const AUTH_TOKEN_TTL: u64 = crate::time::ONE_DAY;

/// Options for [`Crypto::encode`]
#[derive(Debug, Clone, Default)]
pub struct EncodeOptions {
    /// Envelope type (defaults to type 0)
    pub envelope_type: Option<EnvelopeType>,
    /// Sender public key hex (required for type 1)
    pub sender_public_key: Option<String>,
    /// Receiver public key hex (required for type 1)
    pub receiver_public_key: Option<String>,
}

/// Options for [`Crypto::decode`]
#[derive(Debug, Clone, Default)]
pub struct DecodeOptions {
    /// Receiver public key hex (required for type 1 envelopes)
    pub receiver_public_key: Option<String>,
}

/// Crypto engine: owns the keychain, produces and consumes envelopes
pub struct Crypto {
    keystore: Arc<KeyStore>,
}

impl Crypto {
    /// Create the engine over a keychain
    pub fn new(keystore: Arc<KeyStore>) -> Self {
        Self { keystore }
    }

    /// Restore the keychain and make sure the relay auth seed exists
    pub async fn init(&self) -> Result<()> {
        self.keystore.init().await?;
        if !self.keystore.has(CLIENT_SEED_LABEL) {
            let seed = SigningKeyPair::generate();
            self.keystore
                .set(CLIENT_SEED_LABEL, &hex::encode(seed.seed_bytes()))
                .await?;
        }
        Ok(())
    }

    /// Access the underlying keychain
    pub fn keystore(&self) -> &Arc<KeyStore> {
        &self.keystore
    }

    /// Generate an X25519 keypair; returns the public key hex
    pub async fn generate_key_pair(&self) -> Result<String> {
        let keypair = EncryptionKeyPair::generate();
        let public = keypair.public_key_hex();
        self.keystore.set(&public, &hex::encode(keypair.secret_bytes())).await?;
        Ok(public)
    }

    /// Derive the shared symmetric key for a topic
    ///
    /// Runs ECDH between our stored private key (looked up by
    /// `self_public_key`) and the peer's public key, derives the symkey via
    /// HKDF, stores it, and returns the topic it is stored under.
    pub async fn generate_shared_key(
        &self,
        self_public_key: &str,
        peer_public_key: &str,
        override_topic: Option<String>,
    ) -> Result<String> {
        let keypair = self.key_pair(self_public_key)?;
        let sym_key = kdf::derive_sym_key(&keypair.diffie_hellman(peer_public_key)?)?;
        self.store_sym_key(&sym_key, override_topic).await
    }

    /// Import a raw symmetric key (the pairing URI bootstrap secret)
    pub async fn set_sym_key(
        &self,
        sym_key_hex: &str,
        override_topic: Option<String>,
    ) -> Result<String> {
        let sym_key = decode_key(sym_key_hex)?;
        self.store_sym_key(&sym_key, override_topic).await
    }

    /// Whether a symmetric key exists for the topic
    pub fn has_keys(&self, topic: &str) -> bool {
        self.keystore.has(topic)
    }

    /// Delete a stored keypair by its public key
    pub async fn delete_key_pair(&self, public_key: &str) -> Result<()> {
        self.keystore.del(public_key).await
    }

    /// Delete the symmetric key for a topic
    pub async fn delete_sym_key(&self, topic: &str) -> Result<()> {
        self.keystore.del(topic).await
    }

    /// Serialize and seal a JSON-RPC payload for a topic
    pub fn encode(&self, topic: &str, payload: &Value, opts: &EncodeOptions) -> Result<String> {
        let envelope_type = opts.envelope_type.unwrap_or(EnvelopeType::Type0);
        let plaintext = serde_json::to_vec(payload)?;

        match envelope_type {
            EnvelopeType::Type2 => Ok(envelope::seal_plaintext(&plaintext)),
            EnvelopeType::Type0 => {
                let sym_key = self.sym_key(topic).map_err(|_| {
                    Error::EncodingError(format!("No symmetric key for topic: {topic}"))
                })?;
                envelope::seal(EnvelopeType::Type0, &sym_key, &plaintext, None)
            }
            EnvelopeType::Type1 => {
                let sender = opts.sender_public_key.as_deref().ok_or_else(|| {
                    Error::EncodingError("Type 1 requires a sender public key".to_string())
                })?;
                let receiver = opts.receiver_public_key.as_deref().ok_or_else(|| {
                    Error::EncodingError("Type 1 requires a receiver public key".to_string())
                })?;
                let keypair = self.key_pair(sender).map_err(|_| {
                    Error::EncodingError(format!("No keypair for sender: {sender}"))
                })?;
                let sym_key = kdf::derive_sym_key(&keypair.diffie_hellman(receiver)?)?;
                envelope::seal(EnvelopeType::Type1, &sym_key, &plaintext, Some(decode_key(sender)?))
            }
        }
    }

    /// Parse, decrypt, and deserialize an envelope received on a topic
    ///
    /// Failures here are expected transient conditions (relay redelivery,
    /// cross-version envelopes, traffic for a retired key); callers log and
    /// drop rather than propagate.
    pub fn decode(&self, topic: &str, encoded: &str, opts: &DecodeOptions) -> Result<Value> {
        let parsed = envelope::parse(encoded)?;

        let plaintext = match parsed.envelope_type {
            EnvelopeType::Type2 => parsed.sealed.clone(),
            EnvelopeType::Type0 => {
                let sym_key = self
                    .sym_key(topic)
                    .map_err(|_| Error::DecodingError(format!("No symmetric key for topic: {topic}")))?;
                envelope::open(&parsed, &sym_key)?
            }
            EnvelopeType::Type1 => {
                let receiver = opts.receiver_public_key.as_deref().ok_or_else(|| {
                    Error::DecodingError("Type 1 requires a receiver public key".to_string())
                })?;
                let sender = parsed
                    .sender_public_key
                    .ok_or_else(|| Error::DecodingError("Type 1 envelope missing sender key".to_string()))?;
                let keypair = self
                    .key_pair(receiver)
                    .map_err(|_| Error::DecodingError(format!("No keypair for receiver: {receiver}")))?;
                let sym_key = kdf::derive_sym_key(&keypair.diffie_hellman(&hex::encode(sender))?)?;
                envelope::open(&parsed, &sym_key)?
            }
        };

        serde_json::from_slice(&plaintext)
            .map_err(|e| Error::DecodingError(format!("Invalid payload JSON: {e}")))
    }

    /// Sign a relay auth JWT with the persisted client seed
    pub fn sign_jwt(&self, aud: &str, ttl: u64) -> Result<String> {
        let seed_hex = self
            .keystore
            .get(CLIENT_SEED_LABEL)
            .map_err(|_| Error::SigningFailed("Client seed missing; call init() first".to_string()))?;
        let keypair = SigningKeyPair::from_seed(decode_key(&seed_hex)?);
        jwt::sign_jwt(aud, ttl, &keypair, None)
    }

    /// Generate a random pairing bootstrap symkey (hex)
    pub fn random_sym_key() -> String {
        hex::encode(random_bytes32())
    }

    fn key_pair(&self, public_key: &str) -> Result<EncryptionKeyPair> {
        let secret_hex = self.keystore.get(public_key)?;
        Ok(EncryptionKeyPair::from_secret_bytes(decode_key(&secret_hex)?))
    }

    fn sym_key(&self, topic: &str) -> Result<[u8; 32]> {
        decode_key(&self.keystore.get(topic)?)
    }

    async fn store_sym_key(&self, sym_key: &[u8; 32], override_topic: Option<String>) -> Result<String> {
        let topic = override_topic.unwrap_or_else(|| kdf::topic_from_sym_key(sym_key));
        self.keystore.set(&topic, &hex::encode(sym_key)).await?;
        Ok(topic)
    }
}

// ============================================================================
// TESTS
// ============================================================================
