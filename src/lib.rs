//! # Signet Core
//!
//! A session pairing and relay protocol client: end-to-end encrypted
//! sessions between applications and wallets, brokered over an untrusted
//! publish/subscribe relay.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SIGNET CORE MODULES                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌──────────────┐   │
//! │  │   Pairing   │  │    Sign     │  │   Expirer   │  │   History    │   │
//! │  │             │  │             │  │             │  │              │   │
//! │  │ - wc: URIs  │  │ - Propose   │  │ - TTL sweep │  │ - Dedup      │   │
//! │  │ - Bootstrap │  │ - Settle    │  │ - Expiry    │  │ - Request/   │   │
//! │  │ - Ping      │  │ - Requests  │  │   events    │  │   response   │   │
//! │  └──────┬──────┘  └──────┬──────┘  └──────┬──────┘  └──────┬───────┘   │
//! │         │                │                │                │           │
//! │         └────────────────┴────────────────┴────────────────┘           │
//! │                                   │                                     │
//! │  ┌─────────────┐  ┌─────────────┐ │ ┌─────────────────────────────────┐│
//! │  │   Crypto    │  │   Storage   │ │ │            Relay                ││
//! │  │             │  │             │ │ │                                 ││
//! │  │ - X25519    │  │ - SQLite /  │◄┘ │ - WebSocket transport          ││
//! │  │ - ChaCha20  │  │   memory    │   │ - Subscriptions                ││
//! │  │ - did:key   │  │ - Keychain  │   │ - Publish retry queue          ││
//! │  └─────────────┘  └─────────────┘   └─────────────────────────────────┘│
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the entire library
//! - [`crypto`] - Keys, key agreement, envelopes, relay auth JWTs
//! - [`storage`] - Key-value persistence (SQLite, in-memory)
//! - [`relay`] - Transport, subscriptions, and the publish pipeline
//! - [`heartbeat`] - Shared periodic ticker for background work
//! - [`expirer`] - TTL registry with a heartbeat-driven sweep
//! - [`history`] - JSON-RPC request/response ledger
//! - [`store`] - Generic persisted record store with change events
//! - [`pairing`] - Pairing lifecycle (`wc:` URIs, ping, delete)
//! - [`sign`] - Session lifecycle (propose, settle, request, respond)
//! - [`events`] - The app-facing event channel
//! - [`core`] - Dependency wiring: [`Core`] and [`SignClient`]
//!
//! ## Security Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SECURITY LAYERS                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Layer 1: Topic Blinding                                                │
//! │  ───────────────────────                                                │
//! │  The relay routes by topic (sha256 of the symmetric key) and never     │
//! │  sees key material or plaintext. It can observe traffic patterns,      │
//! │  nothing else.                                                         │
//! │                                                                         │
//! │  Layer 2: Payload Encryption (X25519 + HKDF + ChaCha20-Poly1305)       │
//! │  ───────────────────────────────────────────────────────────────        │
//! │  Session payloads are sealed with a key derived from an ECDH           │
//! │  exchange of per-session ephemeral keys. Pairing topics use a          │
//! │  random bootstrap key shared out-of-band in the wc: URI.               │
//! │                                                                         │
//! │  Layer 3: Relay Authentication (Ed25519 did:key JWT)                    │
//! │  ───────────────────────────────────────────────────                    │
//! │  The socket itself is authenticated with a JWT signed by a             │
//! │  persisted per-client seed; payload security never depends on it.      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use signet_core::{Core, CoreConfig, SignClient};
//! use signet_core::sign::types::AppMetadata;
//!
//! # async fn run() -> signet_core::Result<()> {
//! let core = Core::new(CoreConfig {
//!     project_id: "my-project-id".into(),
//!     ..Default::default()
//! })
//! .await?;
//! core.start().await?;
//!
//! let _client = SignClient::new(core, AppMetadata {
//!     name: "Example Dapp".into(),
//!     description: "Demo".into(),
//!     url: "https://example.com".into(),
//!     icons: vec![],
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod core;
pub mod crypto;
pub mod error;
pub mod events;
pub mod expirer;
pub mod heartbeat;
pub mod history;
pub mod pairing;
pub mod relay;
pub mod sign;
pub mod storage;
pub mod store;
pub mod time;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use crate::core::{Core, CoreConfig, SignClient};
pub use error::{Error, Result};
pub use events::ClientEvent;
