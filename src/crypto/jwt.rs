//! # Relay Auth JWT
//!
//! The relay authenticates clients with an Ed25519-signed JWT presented
//! when the WebSocket is opened. The issuer is a `did:key` built from the
//! client's public key (multicodec `0xed01` prefix, base58btc, `z`
//! multibase prefix).

use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
use base64::Engine;
use serde::Serialize;

use super::keys::{random_bytes32, SigningKeyPair};
use crate::error::Result;
use crate::time::now_timestamp;

/// Multicodec prefix for an Ed25519 public key
const ED25519_MULTICODEC: [u8; 2] = [0xed, 0x01];

/// Build the `did:key` identifier for an Ed25519 public key
pub fn did_key(public_key: &[u8; 32]) -> String {
    let mut prefixed = Vec::with_capacity(2 + 32);
    prefixed.extend_from_slice(&ED25519_MULTICODEC);
    prefixed.extend_from_slice(public_key);
    format!("did:key:z{}", bs58::encode(prefixed).into_string())
}

#[derive(Serialize)]
struct Header {
    alg: &'static str,
    typ: &'static str,
}

#[derive(Serialize)]
struct Claims {
    iss: String,
    sub: String,
    aud: String,
    iat: i64,
    exp: i64,
}

/// Sign a relay auth JWT
///
/// - `aud`: the relay URL the token is presented to
/// - `ttl`: token lifetime in seconds
/// - `issued_at`: override for the `iat` claim (tests); defaults to now
pub fn sign_jwt(
    aud: &str,
    ttl: u64,
    keypair: &SigningKeyPair,
    issued_at: Option<i64>,
) -> Result<String> {
    let iat = issued_at.unwrap_or_else(now_timestamp);
    let header = Header { alg: "EdDSA", typ: "JWT" };
    let claims = Claims {
        iss: did_key(&keypair.public_bytes()),
        sub: hex::encode(random_bytes32()),
        aud: aud.to_string(),
        iat,
        exp: iat + ttl as i64,
    };

    let signing_input = format!(
        "{}.{}",
        BASE64_URL.encode(serde_json::to_vec(&header)?),
        BASE64_URL.encode(serde_json::to_vec(&claims)?),
    );
    let signature = keypair.sign(signing_input.as_bytes());

    Ok(format!("{signing_input}.{}", BASE64_URL.encode(signature)))
}
