//! # Envelope Codec
//!
//! The encrypted wire unit published to a topic.
//!
//! ## Wire Format
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       ENVELOPE WIRE FORMAT                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Type 0 (symmetric — the normal case once a topic key exists):         │
//! │  ┌──────┬───────────────┬───────────────────────────────┐              │
//! │  │ 0x00 │ 12-byte nonce │ ciphertext + 16-byte auth tag │              │
//! │  └──────┴───────────────┴───────────────────────────────┘              │
//! │                                                                         │
//! │  Type 1 (embeds the sender public key — pre-agreement handshakes):     │
//! │  ┌──────┬────────────────┬───────────────┬───────────────────────┐     │
//! │  │ 0x01 │ 32-byte pubkey │ 12-byte nonce │ ciphertext + auth tag │     │
//! │  └──────┴────────────────┴───────────────┴───────────────────────┘     │
//! │                                                                         │
//! │  Type 2 (plaintext — link-mode direct app-to-app delivery):            │
//! │  ┌──────┬───────────────────┐                                          │
//! │  │ 0x02 │ UTF-8 JSON bytes  │                                          │
//! │  └──────┴───────────────────┘                                          │
//! │                                                                         │
//! │  The whole frame is base64-encoded for transport.                      │
//! │  AEAD: ChaCha20-Poly1305, random nonce per envelope.                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{Error, Result};

/// Size of the ChaCha20-Poly1305 nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of an embedded X25519 public key in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Envelope type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnvelopeType {
    /// Encrypted with the topic symmetric key
    Type0 = 0,
    /// Encrypted, with the sender's public key embedded in the header
    Type1 = 1,
    /// Plaintext (link-mode)
    Type2 = 2,
}

impl EnvelopeType {
    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(EnvelopeType::Type0),
            1 => Ok(EnvelopeType::Type1),
            2 => Ok(EnvelopeType::Type2),
            other => Err(Error::DecodingError(format!("Unknown envelope type: {other}"))),
        }
    }
}

/// A parsed (but still encrypted) envelope
pub struct Envelope {
    /// Envelope type
    pub envelope_type: EnvelopeType,
    /// Sender public key (type 1 only)
    pub sender_public_key: Option<[u8; 32]>,
    /// Nonce (encrypted types only)
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext with auth tag, or raw plaintext for type 2
    pub sealed: Vec<u8>,
}

/// Encrypt and frame a plaintext as a type 0/1 envelope
///
/// `sender_public_key` must be given for type 1 and must be absent for
/// type 0.
pub fn seal(
    envelope_type: EnvelopeType,
    sym_key: &[u8; 32],
    plaintext: &[u8],
    sender_public_key: Option<[u8; 32]>,
) -> Result<String> {
    match (envelope_type, sender_public_key.is_some()) {
        (EnvelopeType::Type0, false) | (EnvelopeType::Type1, true) => {}
        (EnvelopeType::Type2, _) => {
            return Err(Error::EncodingError(
                "Type 2 envelopes are not encrypted; use seal_plaintext".to_string(),
            ))
        }
        _ => {
            return Err(Error::EncodingError(
                "Sender public key is required for type 1 and forbidden for type 0".to_string(),
            ))
        }
    }

    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(sym_key));
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| Error::EncodingError("AEAD encryption failed".to_string()))?;

    let mut frame = Vec::with_capacity(1 + PUBKEY_SIZE + NONCE_SIZE + sealed.len());
    frame.push(envelope_type as u8);
    if let Some(public_key) = sender_public_key {
        frame.extend_from_slice(&public_key);
    }
    frame.extend_from_slice(&nonce);
    frame.extend_from_slice(&sealed);

    Ok(BASE64.encode(frame))
}

/// Frame a plaintext as a type 2 envelope (no encryption)
pub fn seal_plaintext(plaintext: &[u8]) -> String {
    let mut frame = Vec::with_capacity(1 + plaintext.len());
    frame.push(EnvelopeType::Type2 as u8);
    frame.extend_from_slice(plaintext);
    BASE64.encode(frame)
}

/// Parse a base64 envelope into its components without decrypting
pub fn parse(encoded: &str) -> Result<Envelope> {
    let frame = BASE64
        .decode(encoded.trim())
        .map_err(|e| Error::DecodingError(format!("Invalid base64: {e}")))?;

    let (&type_byte, rest) = frame
        .split_first()
        .ok_or_else(|| Error::DecodingError("Empty envelope".to_string()))?;
    let envelope_type = EnvelopeType::from_byte(type_byte)?;

    match envelope_type {
        EnvelopeType::Type2 => Ok(Envelope {
            envelope_type,
            sender_public_key: None,
            nonce: [0u8; NONCE_SIZE],
            sealed: rest.to_vec(),
        }),
        EnvelopeType::Type0 | EnvelopeType::Type1 => {
            let (sender_public_key, rest) = if envelope_type == EnvelopeType::Type1 {
                if rest.len() < PUBKEY_SIZE {
                    return Err(Error::DecodingError("Truncated type 1 envelope".to_string()));
                }
                let (key, rest) = rest.split_at(PUBKEY_SIZE);
                let key: [u8; 32] = key.try_into().expect("split_at guarantees length");
                (Some(key), rest)
            } else {
                (None, rest)
            };

            if rest.len() < NONCE_SIZE {
                return Err(Error::DecodingError("Truncated envelope: missing nonce".to_string()));
            }
            let (nonce, sealed) = rest.split_at(NONCE_SIZE);

            Ok(Envelope {
                envelope_type,
                sender_public_key,
                nonce: nonce.try_into().expect("split_at guarantees length"),
                sealed: sealed.to_vec(),
            })
        }
    }
}

/// Decrypt a parsed type 0/1 envelope
pub fn open(envelope: &Envelope, sym_key: &[u8; 32]) -> Result<Vec<u8>> {
    if envelope.envelope_type == EnvelopeType::Type2 {
        return Ok(envelope.sealed.clone());
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(sym_key));
    cipher
        .decrypt(Nonce::from_slice(&envelope.nonce), envelope.sealed.as_ref())
        .map_err(|_| Error::DecodingError("Authentication tag mismatch".to_string()))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type0_round_trip() {
        let key = [9u8; 32];
        let encoded = seal(EnvelopeType::Type0, &key, b"{\"id\":1}", None).unwrap();

        let envelope = parse(&encoded).unwrap();
        assert_eq!(envelope.envelope_type, EnvelopeType::Type0);
        assert!(envelope.sender_public_key.is_none());
        assert_eq!(open(&envelope, &key).unwrap(), b"{\"id\":1}");
    }

    #[test]
    fn test_type1_round_trip_carries_sender_key() {
        let key = [9u8; 32];
        let sender = [3u8; 32];
        let encoded = seal(EnvelopeType::Type1, &key, b"hello", Some(sender)).unwrap();

        let envelope = parse(&encoded).unwrap();
        assert_eq!(envelope.envelope_type, EnvelopeType::Type1);
        assert_eq!(envelope.sender_public_key, Some(sender));
        assert_eq!(open(&envelope, &key).unwrap(), b"hello");
    }

    #[test]
    fn test_type2_is_plaintext() {
        let encoded = seal_plaintext(b"{\"v\":2}");
        let envelope = parse(&encoded).unwrap();
        assert_eq!(envelope.envelope_type, EnvelopeType::Type2);
        assert_eq!(open(&envelope, &[0u8; 32]).unwrap(), b"{\"v\":2}");
    }

    #[test]
    fn test_wrong_key_fails_auth() {
        let encoded = seal(EnvelopeType::Type0, &[1u8; 32], b"secret", None).unwrap();
        let envelope = parse(&encoded).unwrap();
        assert!(matches!(open(&envelope, &[2u8; 32]), Err(Error::DecodingError(_))));
    }

    #[test]
    fn test_tampered_ciphertext_fails_auth() {
        let key = [1u8; 32];
        let encoded = seal(EnvelopeType::Type0, &key, b"secret", None).unwrap();
        let mut envelope = parse(&encoded).unwrap();
        let last = envelope.sealed.len() - 1;
        envelope.sealed[last] ^= 0xff;
        assert!(open(&envelope, &key).is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse("not base64!!!").is_err());
        assert!(parse(&BASE64.encode([7u8])).is_err()); // unknown type byte
        assert!(parse(&BASE64.encode([0u8, 1, 2])).is_err()); // truncated
    }
}
