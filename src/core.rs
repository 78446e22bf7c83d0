//! # Core
//!
//! Explicit dependency wiring for the whole client. Every component is
//! constructed here and handed down by `Arc`; nothing in the crate
//! reaches for a global.
//!
//! ## Composition
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              CORE                                       │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   storage ◄── keystore ◄── crypto                                      │
//! │      ▲                        ▲                                         │
//! │      │                        │                                         │
//! │   relayer (transport + subscriber + publisher)                          │
//! │      ▲                        ▲                                         │
//! │      │                        │                                         │
//! │   expirer    history    heartbeat    event hub                          │
//! │      ▲           ▲          ▲            ▲                              │
//! │      └───────────┴────┬─────┴────────────┘                              │
//! │                       │                                                 │
//! │                pairing engine                                           │
//! │                       │                                                 │
//! │                 SignClient (sign engine)                                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::crypto::{Crypto, KeyStore, AUTH_TOKEN_TTL};
use crate::error::{Error, Result};
use crate::events::{ClientEvent, EventHub};
use crate::expirer::Expirer;
use crate::heartbeat::Heartbeat;
use crate::history::History;
use crate::pairing::{Pairing, PairingEngine};
use crate::relay::{
    ReconnectPolicy, Relayer, RelayerConfig, RelayerEvent, Transport, WsTransport,
};
use crate::sign::types::{
    AppMetadata, PendingRequest, Reason, RequestParams, Session, SessionEventData,
    SettledNamespaces,
};
use crate::sign::{Approved, Connect, ConnectParams, RpcResponse, SignEngine};
use crate::storage::{MemoryStorage, Storage};

/// Client configuration
#[derive(Clone)]
pub struct CoreConfig {
    /// Relay WebSocket URL, e.g. `wss://relay.walletconnect.com`
    pub relay_url: String,
    /// Relay project id appended to the connection URL
    pub project_id: String,
    /// Storage backend; in-memory when absent
    pub storage: Option<Storage>,
    /// Heartbeat pulse interval
    pub heartbeat_interval: Duration,
    /// Expiry sweep / history prune cadence, in heartbeat pulses
    pub sweep_every_pulses: u64,
    /// Relayer tuning (timeouts, retry budget, protocol namespace)
    pub relayer: RelayerConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            relay_url: "wss://relay.walletconnect.com".to_string(),
            project_id: String::new(),
            storage: None,
            heartbeat_interval: crate::heartbeat::DEFAULT_INTERVAL,
            sweep_every_pulses: 6,
            relayer: RelayerConfig::default(),
        }
    }
}

/// Shared client core
pub struct Core {
    storage: Storage,
    crypto: Arc<Crypto>,
    relayer: Arc<Relayer>,
    expirer: Arc<Expirer>,
    history: Arc<History>,
    pairing: Arc<PairingEngine>,
    events: EventHub,
    heartbeat: Heartbeat,
    sweep_every_pulses: u64,
    started: AtomicBool,
}

impl Core {
    /// Build a core connected to a real relay over WebSocket
    pub async fn new(config: CoreConfig) -> Result<Arc<Self>> {
        if !config.relay_url.starts_with("wss://") && !config.relay_url.starts_with("ws://") {
            return Err(Error::InvalidConfig(format!(
                "Relay URL must be a WebSocket URL: {}",
                config.relay_url
            )));
        }

        let storage = Self::storage_from(&config);
        let crypto = Arc::new(Crypto::new(Arc::new(KeyStore::new(storage.clone()))));
        crypto.init().await?;

        // The relay authenticates the socket itself with a did:key JWT
        let auth = crypto.sign_jwt(&config.relay_url, AUTH_TOKEN_TTL)?;
        let url = format!(
            "{}/?auth={}&projectId={}",
            config.relay_url.trim_end_matches('/'),
            auth,
            config.project_id
        );
        let transport: Arc<dyn Transport> =
            Arc::new(WsTransport::new(url, ReconnectPolicy::default()));

        Self::build(config, storage, crypto, transport).await
    }

    /// Build a core over an arbitrary transport (tests use the in-process
    /// mock broker here)
    pub(crate) async fn build(
        config: CoreConfig,
        storage: Storage,
        crypto: Arc<Crypto>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>> {
        let relayer = Relayer::new(transport, storage.clone(), config.relayer.clone());
        relayer.init().await?;

        let expirer = Arc::new(Expirer::new(storage.clone()));
        expirer.init().await?;
        let history = Arc::new(History::new(storage.clone()));
        history.init().await?;

        let events = EventHub::new();
        let pairing = Arc::new(PairingEngine::new(
            crypto.clone(),
            relayer.clone(),
            expirer.clone(),
            storage.clone(),
            events.clone(),
        ));
        pairing.init().await?;

        Ok(Arc::new(Self {
            storage,
            crypto,
            relayer,
            expirer,
            history,
            pairing,
            events,
            heartbeat: Heartbeat::start(config.heartbeat_interval),
            sweep_every_pulses: config.sweep_every_pulses.max(1),
            started: AtomicBool::new(false),
        }))
    }

    /// Spawn all background loops and open the relay connection
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.relayer.start(&self.heartbeat);
        self.pairing.start();

        // Expiry sweep and history prune share the heartbeat at a coarser
        // cadence than the publish retry queue
        let core = Arc::clone(self);
        let mut pulses = self.heartbeat.subscribe();
        tokio::spawn(async move {
            while let Ok(pulse) = pulses.recv().await {
                if pulse % core.sweep_every_pulses != 0 {
                    continue;
                }
                if let Err(e) = core.expirer.sweep().await {
                    tracing::warn!("Expiry sweep failed: {e}");
                }
                if let Err(e) = core.history.prune().await {
                    tracing::warn!("History prune failed: {e}");
                }
            }
        });

        // Surface relay lifecycle to the application; cycle the transport
        // when a mid-connection send failure is reported
        let core = Arc::clone(self);
        let mut relay_events = self.relayer.subscribe_events();
        tokio::spawn(async move {
            loop {
                match relay_events.recv().await {
                    Ok(RelayerEvent::Connected) => core.events.emit(ClientEvent::RelayConnected),
                    Ok(RelayerEvent::Disconnected { .. }) => {
                        core.events.emit(ClientEvent::RelayDisconnected)
                    }
                    Ok(RelayerEvent::ConnectionStalled) => {
                        tracing::warn!("Relay connection stalled, cycling transport");
                        let _ = core.relayer.close().await;
                        if let Err(e) = core.relayer.connect().await {
                            tracing::warn!("Transport restart failed: {e}");
                        }
                    }
                    Ok(RelayerEvent::Message(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.relayer.connect().await
    }

    /// Close the relay connection
    pub async fn shutdown(&self) -> Result<()> {
        self.relayer.close().await
    }

    /// Whether [`Core::start`] has run
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Subscribe to client events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// The crypto engine
    pub fn crypto(&self) -> &Arc<Crypto> {
        &self.crypto
    }

    /// The relayer
    pub fn relayer(&self) -> &Arc<Relayer> {
        &self.relayer
    }

    /// The pairing engine
    pub fn pairing(&self) -> &Arc<PairingEngine> {
        &self.pairing
    }

    /// The expiry registry
    pub fn expirer(&self) -> &Arc<Expirer> {
        &self.expirer
    }

    /// The JSON-RPC history ledger
    pub fn history(&self) -> &Arc<History> {
        &self.history
    }

    /// The storage backend
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    fn storage_from(config: &CoreConfig) -> Storage {
        config
            .storage
            .clone()
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()) as Storage)
    }
}

/// High-level session client over a started [`Core`]
pub struct SignClient {
    core: Arc<Core>,
    engine: Arc<SignEngine>,
}

impl std::fmt::Debug for SignClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignClient").finish_non_exhaustive()
    }
}

impl SignClient {
    /// Wire the sign engine and restore persisted sessions
    pub async fn new(core: Arc<Core>, metadata: AppMetadata) -> Result<Self> {
        if !core.is_started() {
            return Err(Error::NotStarted);
        }
        let engine = Arc::new(SignEngine::new(
            core.crypto.clone(),
            core.relayer.clone(),
            core.expirer.clone(),
            core.history.clone(),
            core.pairing.clone(),
            core.storage.clone(),
            core.events.clone(),
            metadata,
        ));
        engine.init().await?;
        engine.start();
        Ok(Self { core, engine })
    }

    /// The shared core
    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    /// Subscribe to client events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.core.subscribe_events()
    }

    /// Propose a session; see [`SignEngine::connect`]
    pub async fn connect(&self, params: ConnectParams) -> Result<Connect> {
        self.engine.connect(params).await
    }

    /// Join a pairing from a `wc:` URI
    pub async fn pair(&self, uri: &str) -> Result<Pairing> {
        self.core.pairing.pair(uri).await
    }

    /// Approve a proposal by id
    pub async fn approve(&self, id: u64, namespaces: SettledNamespaces) -> Result<Approved> {
        self.engine.approve(id, namespaces).await
    }

    /// Reject a proposal by id
    pub async fn reject(&self, id: u64, reason: Reason) -> Result<()> {
        self.engine.reject(id, reason).await
    }

    /// Send a chain RPC request over a settled session
    pub async fn request(
        &self,
        topic: &str,
        params: RequestParams,
        ttl: Option<u64>,
    ) -> Result<serde_json::Value> {
        self.engine.request(topic, params, ttl).await
    }

    /// Respond to an inbound session request
    pub async fn respond(&self, topic: &str, id: u64, response: RpcResponse) -> Result<()> {
        self.engine.respond(topic, id, response).await
    }

    /// Replace the session namespaces
    pub async fn update(&self, topic: &str, namespaces: SettledNamespaces) -> Result<()> {
        self.engine.update(topic, namespaces).await
    }

    /// Extend the session lifetime
    pub async fn extend(&self, topic: &str) -> Result<()> {
        self.engine.extend(topic).await
    }

    /// Emit a session event to the peer
    pub async fn emit(&self, topic: &str, event: SessionEventData, chain_id: &str) -> Result<()> {
        self.engine.emit(topic, event, chain_id).await
    }

    /// Session liveness check
    pub async fn ping(&self, topic: &str) -> Result<()> {
        self.engine.ping(topic).await
    }

    /// Tear down a session
    pub async fn disconnect(&self, topic: &str) -> Result<()> {
        self.engine.disconnect(topic).await
    }

    /// A session by topic
    pub fn session(&self, topic: &str) -> Result<Session> {
        self.engine.session(topic)
    }

    /// All sessions
    pub fn sessions(&self) -> Vec<Session> {
        self.engine.sessions()
    }

    /// Inbound requests not yet responded to
    pub fn pending_session_requests(&self) -> Vec<PendingRequest> {
        self.engine.pending_session_requests()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::mock::MockRelay;

    #[tokio::test]
    async fn test_rejects_non_websocket_url() {
        let config = CoreConfig { relay_url: "https://relay.example".to_string(), ..Default::default() };
        assert!(matches!(Core::new(config).await, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_sign_client_requires_started_core() {
        let relay = MockRelay::new();
        let storage: Storage = Arc::new(MemoryStorage::new());
        let crypto = Arc::new(Crypto::new(Arc::new(KeyStore::new(storage.clone()))));
        crypto.init().await.unwrap();
        let core = Core::build(CoreConfig::default(), storage, crypto, relay.transport())
            .await
            .unwrap();

        let err = SignClient::new(core.clone(), AppMetadata::default()).await.unwrap_err();
        assert!(matches!(err, Error::NotStarted));

        core.start().await.unwrap();
        assert!(SignClient::new(core, AppMetadata::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let relay = MockRelay::new();
        let storage: Storage = Arc::new(MemoryStorage::new());
        let crypto = Arc::new(Crypto::new(Arc::new(KeyStore::new(storage.clone()))));
        crypto.init().await.unwrap();
        let core = Core::build(CoreConfig::default(), storage, crypto, relay.transport())
            .await
            .unwrap();

        core.start().await.unwrap();
        core.start().await.unwrap();
        assert!(core.is_started());
    }
}
