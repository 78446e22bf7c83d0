//! Seal and open envelopes without touching a relay.
//!
//! Walks through both envelope flavors:
//! - type 0: both sides already share a symmetric key for the topic
//! - type 1: the sender only knows the receiver's public key and bundles
//!   its own ephemeral public key in the envelope header
//!
//! Run with: `cargo run --example envelope_demo`

use std::sync::Arc;

use serde_json::json;
use signet_core::crypto::{Crypto, DecodeOptions, EncodeOptions, EnvelopeType, KeyStore};
use signet_core::storage::MemoryStorage;
use signet_core::Result;

#[tokio::main]
async fn main() -> Result<()> {
    // Two independent clients, each with its own keychain.
    let alice = Crypto::new(Arc::new(KeyStore::new(Arc::new(MemoryStorage::new()))));
    let bob = Crypto::new(Arc::new(KeyStore::new(Arc::new(MemoryStorage::new()))));
    alice.init().await?;
    bob.init().await?;

    // --- Type 0: shared symmetric key ------------------------------------
    // The bootstrap secret travels out-of-band (in practice, inside a
    // pairing URI). Both sides import it and land on the same topic.
    let sym_key = Crypto::random_sym_key();
    let topic = alice.set_sym_key(&sym_key, None).await?;
    bob.set_sym_key(&sym_key, None).await?;
    println!("shared topic: {topic}");

    let payload = json!({"id": 1, "jsonrpc": "2.0", "method": "wc_pairingPing", "params": {}});
    let sealed = alice.encode(&topic, &payload, &EncodeOptions::default())?;
    println!("type 0 envelope ({} b64 chars)", sealed.len());

    let opened = bob.decode(&topic, &sealed, &DecodeOptions::default())?;
    assert_eq!(opened, payload);
    println!("type 0 round trip ok");

    // --- Type 1: key agreement in the envelope ----------------------------
    // Bob publishes a public key; Alice derives the shared key via ECDH and
    // sends a type 1 envelope carrying her ephemeral public key so Bob can
    // derive the same key on receipt.
    let bob_public = bob.generate_key_pair().await?;
    let alice_public = alice.generate_key_pair().await?;
    let session_topic = alice
        .generate_shared_key(&alice_public, &bob_public, None)
        .await?;
    println!("derived session topic: {session_topic}");

    let payload = json!({"id": 2, "jsonrpc": "2.0", "method": "wc_sessionPropose", "params": {}});
    let sealed = alice.encode(
        &session_topic,
        &payload,
        &EncodeOptions {
            envelope_type: Some(EnvelopeType::Type1),
            sender_public_key: Some(alice_public),
            receiver_public_key: Some(bob_public.clone()),
        },
    )?;

    // Bob has never seen Alice's key before this envelope arrives.
    let opened = bob.decode(
        &session_topic,
        &sealed,
        &DecodeOptions {
            receiver_public_key: Some(bob_public),
        },
    )?;
    assert_eq!(opened, payload);
    println!("type 1 round trip ok");

    Ok(())
}
