//! # Pairing Engine
//!
//! Bootstrap channel between two clients. A pairing topic is keyed by a
//! random symkey shared out-of-band through a `wc:` URI (QR code or deep
//! link); it exists to carry session proposals and lightweight
//! keep-alive traffic, never session payloads.
//!
//! ## Lifecycle
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         PAIRING LIFECYCLE                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  create()                        pair(uri)                              │
//! │  random symkey ──► URI ── out-of-band ──► import symkey                 │
//! │  inactive, 5 min TTL                      inactive, URI expiry          │
//! │        │                                        │                       │
//! │        └──────── session settles ───────────────┘                       │
//! │                        │                                                │
//! │                        ▼                                                │
//! │               activate(): 30 day TTL                                    │
//! │                        │                                                │
//! │         ping ◄─────────┼─────────► disconnect / expirer sweep           │
//! │                        ▼                                                │
//! │         delete record + symkey, unsubscribe                             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Ping and delete round-trips are correlated by JSON-RPC id through
//! one-shot handles; there is no shared event bus between request and
//! response sites.

pub mod uri;

pub use uri::{PairingUri, URI_VERSION};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, oneshot};

use crate::crypto::{Crypto, DecodeOptions, EncodeOptions};
use crate::error::{Error, Result};
use crate::events::{ClientEvent, EventHub};
use crate::expirer::{ExpiredEvent, Expirer, Target};
use crate::relay::jsonrpc::{ErrorData, JsonRpcPayload, JsonRpcRequest, JsonRpcResult, RELAY_PROTOCOL};
use crate::relay::{PublishOptions, Relayer, RelayerEvent};
use crate::sign::types::{Reason, Relay};
use crate::storage::Storage;
use crate::store::{Record, Store};
use crate::time::{expiry_from_ttl, now_timestamp, FIVE_MINUTES, ONE_DAY, THIRTY_DAYS};

const PAIRING_DELETE: &str = "wc_pairingDelete";
const PAIRING_PING: &str = "wc_pairingPing";

const TAG_PAIRING_DELETE: u32 = 1000;
const TAG_PAIRING_DELETE_RESPONSE: u32 = 1001;
const TAG_PAIRING_PING: u32 = 1002;
const TAG_PAIRING_PING_RESPONSE: u32 = 1003;

/// How long a ping/delete round-trip may take before the caller errors
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// A pairing record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pairing {
    /// Pairing topic (sha256 of the symkey)
    pub topic: String,
    /// Relay in use
    pub relay: Relay,
    /// Unix seconds the pairing lives until
    pub expiry: u64,
    /// Inactive until a session settles over it
    pub active: bool,
    /// Methods advertised in the URI
    #[serde(default)]
    pub methods: Vec<String>,
}

impl Record for Pairing {
    fn key(&self) -> String {
        self.topic.clone()
    }
}

type PendingResponse = oneshot::Sender<std::result::Result<Value, ErrorData>>;

/// Pairing lifecycle engine
pub struct PairingEngine {
    crypto: Arc<Crypto>,
    relayer: Arc<Relayer>,
    expirer: Arc<Expirer>,
    pairings: Store<Pairing>,
    events: EventHub,
    pending: Mutex<HashMap<u64, PendingResponse>>,
}

impl PairingEngine {
    /// Build the engine over the shared core components
    pub fn new(
        crypto: Arc<Crypto>,
        relayer: Arc<Relayer>,
        expirer: Arc<Expirer>,
        storage: Storage,
        events: EventHub,
    ) -> Self {
        Self {
            crypto,
            relayer,
            expirer,
            pairings: Store::new(storage, "core", "0.3", "pairing"),
            events,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Restore persisted pairings
    pub async fn init(&self) -> Result<()> {
        self.pairings.init().await
    }

    /// Spawn the inbound message and expirer reaction loops
    pub fn start(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let mut relay_events = self.relayer.subscribe_events();
        tokio::spawn(async move {
            loop {
                match relay_events.recv().await {
                    Ok(RelayerEvent::Message(message)) => {
                        engine.on_relay_message(&message.topic, &message.message).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(missed = n, "Pairing engine lagged behind relay events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let engine = Arc::clone(self);
        let mut expired = self.expirer.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = expired.recv().await {
                engine.on_expired(event).await;
            }
        });
    }

    /// Create a new inactive pairing and its shareable URI
    pub async fn create(&self, methods: Vec<String>) -> Result<(Pairing, String)> {
        let sym_key = Crypto::random_sym_key();
        let topic = self.crypto.set_sym_key(&sym_key, None).await?;
        let expiry = expiry_from_ttl(FIVE_MINUTES);

        let pairing = Pairing {
            topic: topic.clone(),
            relay: Relay::default(),
            expiry,
            active: false,
            methods: methods.clone(),
        };
        self.pairings.set(pairing.clone()).await?;
        self.expirer.set(Target::Topic(topic.clone()), expiry).await?;

        let uri = PairingUri {
            topic: topic.clone(),
            version: URI_VERSION,
            relay_protocol: pairing.relay.protocol.clone(),
            sym_key,
            expiry_timestamp: expiry,
            methods,
        };
        self.relayer.subscribe(&topic).await?;

        tracing::info!(topic, "Created pairing");
        Ok((pairing, uri.to_string()))
    }

    /// Join a pairing from a peer's URI
    pub async fn pair(&self, uri: &str) -> Result<Pairing> {
        let uri = PairingUri::parse(uri)?;
        if uri.version != URI_VERSION {
            return Err(Error::MalformedUri(format!("Unsupported version: {}", uri.version)));
        }
        if uri.relay_protocol != RELAY_PROTOCOL {
            return Err(Error::MalformedUri(format!(
                "Unknown relay protocol: {}",
                uri.relay_protocol
            )));
        }
        // Expired URIs leave no trace: no record, no keychain entry
        if uri.expiry_timestamp <= now_timestamp() as u64 {
            return Err(Error::Expired(format!("Pairing URI for topic {}", uri.topic)));
        }
        if let Ok(existing) = self.pairings.get(&uri.topic) {
            if existing.active {
                return Err(Error::PairingAlreadyExists(uri.topic));
            }
            tracing::debug!(topic = %uri.topic, "Re-pairing an inactive pairing");
        }

        self.crypto.set_sym_key(&uri.sym_key, Some(uri.topic.clone())).await?;
        let pairing = Pairing {
            topic: uri.topic.clone(),
            relay: Relay { protocol: uri.relay_protocol, data: None },
            expiry: uri.expiry_timestamp,
            active: false,
            methods: uri.methods,
        };
        self.pairings.set(pairing.clone()).await?;
        self.expirer
            .set(Target::Topic(uri.topic.clone()), uri.expiry_timestamp)
            .await?;
        self.relayer.subscribe(&uri.topic).await?;

        tracing::info!(topic = %uri.topic, "Paired");
        Ok(pairing)
    }

    /// Mark a pairing active and extend it to the long-lived TTL
    pub async fn activate(&self, topic: &str) -> Result<()> {
        let mut pairing = self
            .pairings
            .get(topic)
            .map_err(|_| Error::PairingNotFound(topic.to_string()))?;
        pairing.active = true;
        pairing.expiry = expiry_from_ttl(THIRTY_DAYS);
        self.expirer.set(Target::Topic(topic.to_string()), pairing.expiry).await?;
        self.pairings.set(pairing).await
    }

    /// Liveness check over the pairing topic
    pub async fn ping(&self, topic: &str) -> Result<()> {
        if !self.pairings.contains(topic) {
            return Err(Error::PairingNotFound(topic.to_string()));
        }
        self.rpc_request(topic, PAIRING_PING, json!({}), TAG_PAIRING_PING)
            .await
            .map(|_| ())
    }

    /// Tear down a pairing, notifying the peer best-effort
    pub async fn disconnect(&self, topic: &str) -> Result<()> {
        if !self.pairings.contains(topic) {
            tracing::debug!(topic, "Disconnect for unknown pairing, nothing to do");
            return Ok(());
        }

        let request = JsonRpcRequest::new(PAIRING_DELETE, serde_json::to_value(Reason::user_disconnected())?);
        match self.crypto.encode(topic, &serde_json::to_value(&request)?, &EncodeOptions::default()) {
            Ok(encoded) => {
                let opts = PublishOptions { ttl: ONE_DAY, tag: TAG_PAIRING_DELETE, ..Default::default() };
                if let Err(e) = self.relayer.publish(topic, &encoded, opts).await {
                    tracing::warn!(topic, "Pairing delete publish failed: {e}");
                }
            }
            Err(e) => tracing::warn!(topic, "Could not encode pairing delete: {e}"),
        }

        self.cleanup(topic).await
    }

    /// A pairing by topic
    pub fn get(&self, topic: &str) -> Result<Pairing> {
        self.pairings
            .get(topic)
            .map_err(|_| Error::PairingNotFound(topic.to_string()))
    }

    /// All pairings
    pub fn get_all(&self) -> Vec<Pairing> {
        self.pairings.get_all()
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Delete record, symkey, subscription, and expirer entry
    ///
    /// The symkey is deleted only after the unsubscribe so a frame already
    /// in flight cannot race a missing key into a decode error.
    async fn cleanup(&self, topic: &str) -> Result<()> {
        let _ = self.relayer.unsubscribe(topic).await;
        self.pairings.delete(topic).await?;
        self.crypto.delete_sym_key(topic).await?;
        self.expirer.del(&Target::Topic(topic.to_string())).await?;
        tracing::info!(topic, "Pairing removed");
        Ok(())
    }

    /// Send a pairing request and await the peer's response
    async fn rpc_request(&self, topic: &str, method: &str, params: Value, tag: u32) -> Result<Value> {
        let request = JsonRpcRequest::new(method, params);
        let encoded = self
            .crypto
            .encode(topic, &serde_json::to_value(&request)?, &EncodeOptions::default())?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request.id, tx);

        let opts = PublishOptions {
            ttl: FIVE_MINUTES,
            tag,
            throw_on_failed_publish: true,
            ..Default::default()
        };
        if let Err(e) = self.relayer.publish(topic, &encoded, opts).await {
            self.pending.lock().remove(&request.id);
            return Err(e);
        }

        match tokio::time::timeout(RESPONSE_TIMEOUT, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(Error::from_json_rpc(error.code, error.message)),
            Ok(Err(_)) => Err(Error::Internal("Response channel dropped".to_string())),
            Err(_) => {
                self.pending.lock().remove(&request.id);
                Err(Error::Timeout(format!("{method} response")))
            }
        }
    }

    /// Publish a success result for an inbound request, fire-and-forget
    async fn respond_true(&self, topic: &str, id: u64, tag: u32) {
        let response = JsonRpcResult::new(id, Value::Bool(true));
        let payload = match serde_json::to_value(&response) {
            Ok(payload) => payload,
            Err(_) => return,
        };
        match self.crypto.encode(topic, &payload, &EncodeOptions::default()) {
            Ok(encoded) => {
                let opts = PublishOptions { ttl: FIVE_MINUTES, tag, ..Default::default() };
                if let Err(e) = self.relayer.publish(topic, &encoded, opts).await {
                    tracing::warn!(topic, id, "Pairing response publish failed: {e}");
                }
            }
            Err(e) => tracing::warn!(topic, id, "Could not encode pairing response: {e}"),
        }
    }

    async fn on_relay_message(&self, topic: &str, encoded: &str) {
        // Session topics are not ours
        if !self.pairings.contains(topic) {
            return;
        }
        let payload = match self.crypto.decode(topic, encoded, &DecodeOptions::default()) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(topic, "Dropping undecodable pairing frame: {e}");
                return;
            }
        };
        let payload: JsonRpcPayload = match serde_json::from_value(payload) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(topic, "Dropping malformed pairing payload: {e}");
                return;
            }
        };

        match payload {
            JsonRpcPayload::Request(request) => match request.method.as_str() {
                PAIRING_PING => {
                    self.respond_true(topic, request.id, TAG_PAIRING_PING_RESPONSE).await;
                }
                PAIRING_DELETE => {
                    tracing::info!(topic, "Peer deleted pairing");
                    self.respond_true(topic, request.id, TAG_PAIRING_DELETE_RESPONSE).await;
                    if let Err(e) = self.cleanup(topic).await {
                        tracing::warn!(topic, "Pairing cleanup failed: {e}");
                    }
                }
                // wc_session* requests over the pairing topic belong to the
                // sign engine, which listens on the same channel
                _ => {}
            },
            JsonRpcPayload::Result(result) => {
                if let Some(waiter) = self.pending.lock().remove(&result.id) {
                    let _ = waiter.send(Ok(result.result));
                }
            }
            JsonRpcPayload::Error(error) => {
                if let Some(waiter) = self.pending.lock().remove(&error.id) {
                    let _ = waiter.send(Err(error.error));
                }
            }
        }
    }

    async fn on_expired(&self, event: ExpiredEvent) {
        let Target::Topic(topic) = event.target else { return };
        if !self.pairings.contains(&topic) {
            return;
        }
        tracing::info!(topic, "Pairing expired");
        if let Err(e) = self.cleanup(&topic).await {
            tracing::warn!(topic, "Expired pairing cleanup failed: {e}");
        }
        self.events.emit(ClientEvent::PairingExpire { topic });
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyStore;
    use crate::heartbeat::Heartbeat;
    use crate::relay::mock::MockRelay;
    use crate::relay::RelayerConfig;
    use crate::storage::MemoryStorage;

    struct TestClient {
        crypto: Arc<Crypto>,
        expirer: Arc<Expirer>,
        events: EventHub,
        engine: Arc<PairingEngine>,
        _heartbeat: Heartbeat,
    }

    async fn client(relay: &MockRelay) -> TestClient {
        let storage: Storage = Arc::new(MemoryStorage::new());
        let crypto = Arc::new(Crypto::new(Arc::new(KeyStore::new(storage.clone()))));
        crypto.init().await.unwrap();

        let relayer = Relayer::new(relay.transport(), storage.clone(), RelayerConfig::default());
        relayer.init().await.unwrap();
        let heartbeat = Heartbeat::start(Duration::from_millis(50));
        relayer.start(&heartbeat);
        relayer.connect().await.unwrap();

        let expirer = Arc::new(Expirer::new(storage.clone()));
        expirer.init().await.unwrap();

        let events = EventHub::new();
        let engine = Arc::new(PairingEngine::new(
            crypto.clone(),
            relayer,
            expirer.clone(),
            storage,
            events.clone(),
        ));
        engine.init().await.unwrap();
        engine.start();

        TestClient { crypto, expirer, events, engine, _heartbeat: heartbeat }
    }

    #[tokio::test]
    async fn test_create_and_pair() {
        let relay = MockRelay::new();
        let dapp = client(&relay).await;
        let wallet = client(&relay).await;

        let (created, uri) = dapp.engine.create(vec![]).await.unwrap();
        assert!(!created.active);

        let paired = wallet.engine.pair(&uri).await.unwrap();
        assert_eq!(paired.topic, created.topic);
        assert!(!paired.active);
        assert!(wallet.crypto.has_keys(&paired.topic));
        assert!(wallet.engine.get(&paired.topic).is_ok());
    }

    #[tokio::test]
    async fn test_pair_expired_uri_leaves_no_trace() {
        let relay = MockRelay::new();
        let wallet = client(&relay).await;

        let uri = PairingUri {
            topic: "c".repeat(64),
            version: URI_VERSION,
            relay_protocol: "irn".to_string(),
            sym_key: "d".repeat(64),
            expiry_timestamp: 1, // long past
            methods: vec![],
        };
        let err = wallet.engine.pair(&uri.to_string()).await.unwrap_err();
        assert!(matches!(err, Error::Expired(_)));
        assert!(wallet.engine.get_all().is_empty());
        assert!(!wallet.crypto.has_keys(&uri.topic));
    }

    #[tokio::test]
    async fn test_pair_rejects_active_duplicate() {
        let relay = MockRelay::new();
        let dapp = client(&relay).await;
        let wallet = client(&relay).await;

        let (created, uri) = dapp.engine.create(vec![]).await.unwrap();
        wallet.engine.pair(&uri).await.unwrap();

        // Inactive: re-pairing allowed
        wallet.engine.pair(&uri).await.unwrap();

        wallet.engine.activate(&created.topic).await.unwrap();
        let err = wallet.engine.pair(&uri).await.unwrap_err();
        assert!(matches!(err, Error::PairingAlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let relay = MockRelay::new();
        let dapp = client(&relay).await;
        let wallet = client(&relay).await;

        let (created, uri) = dapp.engine.create(vec![]).await.unwrap();
        wallet.engine.pair(&uri).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), dapp.engine.ping(&created.topic))
            .await
            .expect("ping should not hang")
            .expect("ping should succeed");
    }

    #[tokio::test]
    async fn test_disconnect_propagates_to_peer() {
        let relay = MockRelay::new();
        let dapp = client(&relay).await;
        let wallet = client(&relay).await;

        let (created, uri) = dapp.engine.create(vec![]).await.unwrap();
        wallet.engine.pair(&uri).await.unwrap();

        dapp.engine.disconnect(&created.topic).await.unwrap();
        assert!(dapp.engine.get(&created.topic).is_err());

        // Peer processes wc_pairingDelete asynchronously
        tokio::time::timeout(Duration::from_secs(2), async {
            while wallet.engine.get(&created.topic).is_ok() {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await
        .expect("peer should drop the pairing");
        assert!(!wallet.crypto.has_keys(&created.topic));
    }

    #[tokio::test]
    async fn test_expirer_sweep_removes_pairing() {
        let relay = MockRelay::new();
        let dapp = client(&relay).await;
        let mut events = dapp.events.subscribe();

        let (created, _) = dapp.engine.create(vec![]).await.unwrap();
        // Force the entry into the past and sweep
        dapp.expirer
            .set(Target::Topic(created.topic.clone()), 1)
            .await
            .unwrap();
        dapp.expirer.sweep().await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let ClientEvent::PairingExpire { topic } = events.recv().await.unwrap() {
                    break topic;
                }
            }
        })
        .await
        .expect("pairing_expire should fire");
        assert_eq!(event, created.topic);

        tokio::time::timeout(Duration::from_secs(2), async {
            while dapp.engine.get(&created.topic).is_ok() {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await
        .expect("record should be gone");
    }
}
