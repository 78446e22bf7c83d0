//! # Relayer
//!
//! The sole conduit for topic traffic in and out of the client.
//!
//! ## Composition
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            RELAYER                                      │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌───────────┐   ┌────────────┐   ┌───────────┐   ┌────────────────┐   │
//! │  │ Transport │   │ Subscriber │   │ Publisher │   │ Message ledger │   │
//! │  │ (duplex   │   │ (persisted │   │ (retry    │   │ (sha256 dedup  │   │
//! │  │  socket)  │   │  topic map)│   │  queue)   │   │  per topic)    │   │
//! │  └─────┬─────┘   └─────┬──────┘   └─────┬─────┘   └───────┬────────┘   │
//! │        │               │                │                 │            │
//! │        └───────────────┴────────┬───────┴─────────────────┘            │
//! │                                 ▼                                      │
//! │                      tokio::select! event loop                         │
//! │                                 │                                      │
//! │                                 ▼                                      │
//! │              broadcast::Sender<RelayerEvent> (to engines)              │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Reconnect Recovery
//!
//! On reconnect the subscriber batch-resubscribes every known topic, then
//! batch-fetches messages published while disconnected, sorts them by
//! publish timestamp, and replays them through the normal pipeline. The
//! publish-time ordering matters: out-of-order request/response pairs
//! would desynchronize the sign engine's correlation-by-id logic.

pub mod jsonrpc;
mod publisher;
mod subscriber;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

pub use publisher::{Publisher, QueuedPublish};
pub use subscriber::Subscriber;
pub use transport::{ReconnectPolicy, Transport, TransportEvent, WsTransport};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};

use self::jsonrpc::{
    BatchFetchResult, BatchSubscribeParams, ErrorData, JsonRpcError, JsonRpcPayload,
    JsonRpcRequest, JsonRpcResult, PublishParams, RelayMessage, RelayMethods, SubscribeParams,
    SubscriptionParams, UnsubscribeParams, RELAY_PROTOCOL,
};
use crate::crypto::kdf::hash_message;
use crate::error::{Error, Result};
use crate::heartbeat::Heartbeat;
use crate::storage::{storage_key, Storage};

/// Relayer configuration
#[derive(Debug, Clone)]
pub struct RelayerConfig {
    /// Relay protocol namespace for method names
    pub protocol: String,
    /// Timeout for a relay RPC acknowledgement
    pub request_timeout: Duration,
    /// Fast-path subscribe timeout (quick failure detection)
    pub subscribe_initial_timeout: Duration,
    /// Full subscribe timeout
    pub subscribe_timeout: Duration,
    /// Attempt budget per publish
    pub publish_max_attempts: u32,
    /// Delay between inline retries for throwing publishers
    pub publish_retry_interval: Duration,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            protocol: RELAY_PROTOCOL.to_string(),
            request_timeout: Duration::from_secs(10),
            subscribe_initial_timeout: Duration::from_secs(1),
            subscribe_timeout: Duration::from_secs(10),
            publish_max_attempts: 3,
            publish_retry_interval: Duration::from_secs(1),
        }
    }
}

/// Options for a single publish
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Relay-side retention, seconds
    pub ttl: u64,
    /// Protocol method tag
    pub tag: u32,
    /// Push-notification prompt hint
    pub prompt: bool,
    /// When true the caller awaits through the retry budget and gets the
    /// failure; otherwise failures are queued and swallowed
    pub throw_on_failed_publish: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self { ttl: crate::time::FIVE_MINUTES, tag: 0, prompt: false, throw_on_failed_publish: false }
    }
}

/// Events emitted by the relayer
#[derive(Debug, Clone)]
pub enum RelayerEvent {
    /// Transport is up
    Connected,
    /// Transport went down
    Disconnected {
        /// Close reason if the socket supplied one
        reason: Option<String>,
    },
    /// The transport reported a mid-connection send failure
    ConnectionStalled,
    /// A (deduplicated) message for a subscribed topic
    Message(RelayMessage),
}

/// Per-topic sha256 ledger suppressing relay redelivery
struct MessageLedger {
    storage: Storage,
    seen: RwLock<HashMap<String, HashSet<String>>>,
    storage_key: String,
}

impl MessageLedger {
    fn new(storage: Storage) -> Self {
        Self {
            storage,
            seen: RwLock::new(HashMap::new()),
            storage_key: storage_key("core", "0.3", "messages"),
        }
    }

    async fn init(&self) {
        match self.storage.get(&self.storage_key).await {
            Ok(Some(raw)) => match serde_json::from_str::<HashMap<String, HashSet<String>>>(&raw) {
                Ok(map) => *self.seen.write() = map,
                Err(e) => tracing::warn!("Corrupt message ledger, starting fresh: {e}"),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to read message ledger, starting fresh: {e}"),
        }
    }

    /// Returns `true` if the message is new for the topic
    fn insert(&self, topic: &str, message: &str) -> bool {
        self.seen
            .write()
            .entry(topic.to_string())
            .or_default()
            .insert(hash_message(message))
    }

    fn delete_topic(&self, topic: &str) {
        self.seen.write().remove(topic);
    }

    async fn persist(&self) -> Result<()> {
        let snapshot = {
            let seen = self.seen.read();
            serde_json::to_string(&*seen)?
        };
        self.storage.set(&self.storage_key, &snapshot).await
    }
}

type PendingAck = oneshot::Sender<std::result::Result<Value, ErrorData>>;

/// Relay message conduit
pub struct Relayer {
    config: RelayerConfig,
    methods: RelayMethods,
    transport: Arc<dyn Transport>,
    subscriber: Subscriber,
    publisher: Publisher,
    ledger: MessageLedger,
    pending: Mutex<HashMap<u64, PendingAck>>,
    events: broadcast::Sender<RelayerEvent>,
}

impl Relayer {
    /// Build a relayer over a transport and a storage backend
    pub fn new(transport: Arc<dyn Transport>, storage: Storage, config: RelayerConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let methods = RelayMethods::for_protocol(&config.protocol);
        Arc::new(Self {
            publisher: Publisher::new(config.publish_max_attempts),
            subscriber: Subscriber::new(storage.clone()),
            ledger: MessageLedger::new(storage),
            methods,
            config,
            transport,
            pending: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// Restore persisted subscription state and the dedup ledger
    pub async fn init(&self) -> Result<()> {
        self.subscriber.init().await?;
        self.ledger.init().await;
        Ok(())
    }

    /// Subscribe to relayer events
    pub fn subscribe_events(&self) -> broadcast::Receiver<RelayerEvent> {
        self.events.subscribe()
    }

    /// The persisted subscription map
    pub fn subscriber(&self) -> &Subscriber {
        &self.subscriber
    }

    /// Whether the transport is currently connected
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Open the transport
    pub async fn connect(&self) -> Result<()> {
        self.transport.connect().await
    }

    /// Close the transport
    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }

    /// Spawn the inbound event loop and the heartbeat-driven retry loop
    pub fn start(self: &Arc<Self>, heartbeat: &Heartbeat) {
        let relayer = Arc::clone(self);
        let mut transport_events = self.transport.events();
        tokio::spawn(async move {
            tracing::info!("Relayer event loop starting");
            loop {
                match transport_events.recv().await {
                    Ok(TransportEvent::Message(text)) => relayer.handle_inbound(&text).await,
                    Ok(TransportEvent::Connected) => {
                        let _ = relayer.events.send(RelayerEvent::Connected);
                        let restore = Arc::clone(&relayer);
                        tokio::spawn(async move {
                            if let Err(e) = restore.restore_subscriptions().await {
                                tracing::warn!("Post-reconnect restore failed: {e}");
                            }
                        });
                    }
                    Ok(TransportEvent::Disconnected { reason }) => {
                        let _ = relayer.events.send(RelayerEvent::Disconnected { reason });
                    }
                    Ok(TransportEvent::Stalled) => {
                        let _ = relayer.events.send(RelayerEvent::ConnectionStalled);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(missed = n, "Relayer lagged behind transport events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("Transport event channel closed, exiting relayer loop");
                        break;
                    }
                }
            }
        });

        let relayer = Arc::clone(self);
        let mut pulses = heartbeat.subscribe();
        tokio::spawn(async move {
            while pulses.recv().await.is_ok() {
                relayer.on_heartbeat().await;
            }
        });
    }

    /// Publish an envelope to a topic, awaiting the relay acknowledgement
    pub async fn publish(&self, topic: &str, message: &str, opts: PublishOptions) -> Result<()> {
        let params = PublishParams {
            topic: topic.to_string(),
            message: message.to_string(),
            ttl: opts.ttl,
            tag: opts.tag,
            prompt: opts.prompt,
        };

        match self.send_publish(&params).await {
            Ok(()) => Ok(()),
            Err(first_err) if opts.throw_on_failed_publish => {
                tracing::debug!(topic, "Publish failed, retrying inline: {first_err}");
                for _ in 1..self.config.publish_max_attempts {
                    tokio::time::sleep(self.config.publish_retry_interval).await;
                    if self.send_publish(&params).await.is_ok() {
                        return Ok(());
                    }
                }
                Err(Error::PublishFailed {
                    topic: topic.to_string(),
                    attempts: self.config.publish_max_attempts,
                })
            }
            Err(e) => {
                // Fire-and-forget path: queue for the heartbeat and move on
                tracing::warn!(topic, "Publish failed, queueing for retry: {e}");
                self.publisher.enqueue(QueuedPublish { params, attempts: 1 });
                Ok(())
            }
        }
    }

    /// Subscribe to a topic; returns the relay subscription id
    ///
    /// Races a short initial timeout for fast failure detection before
    /// falling back to the full timeout. The topic is tracked before the
    /// RPC goes out so a push delivered immediately after the ack cannot
    /// be dropped as unknown-topic traffic.
    pub async fn subscribe(&self, topic: &str) -> Result<String> {
        self.subscriber.track(topic).await?;
        match self.do_subscribe(topic).await {
            Ok(id) => Ok(id),
            Err(e) => {
                if self.subscriber.ids(topic).is_empty() {
                    let _ = self.subscriber.remove(topic, None).await;
                }
                Err(e)
            }
        }
    }

    async fn do_subscribe(&self, topic: &str) -> Result<String> {
        let params = serde_json::to_value(SubscribeParams { topic: topic.to_string() })?;
        let ack = match self
            .request(&self.methods.subscribe, params.clone(), self.config.subscribe_initial_timeout)
            .await
        {
            Ok(ack) => ack,
            Err(Error::Timeout(_)) => {
                tracing::debug!(topic, "Fast-path subscribe timed out, waiting on full timeout");
                self.request(&self.methods.subscribe, params, self.config.subscribe_timeout)
                    .await
                    .map_err(|_| Error::SubscribeFailed(topic.to_string()))?
            }
            Err(e) => return Err(e),
        };

        let id = ack
            .as_str()
            .ok_or_else(|| Error::SubscribeFailed(topic.to_string()))?
            .to_string();
        self.subscriber.set(topic, id.clone()).await?;
        tracing::debug!(topic, id, "Subscribed");
        Ok(id)
    }

    /// Unsubscribe a topic (all its subscription ids, best-effort)
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        for id in self.subscriber.ids(topic) {
            let params = serde_json::to_value(UnsubscribeParams {
                topic: topic.to_string(),
                id,
            })?;
            if let Err(e) = self
                .request(&self.methods.unsubscribe, params, self.config.request_timeout)
                .await
            {
                tracing::warn!(topic, "Unsubscribe RPC failed (continuing teardown): {e}");
            }
        }
        self.subscriber.remove(topic, None).await?;
        self.ledger.delete_topic(topic);
        let _ = self.ledger.persist().await;
        tracing::debug!(topic, "Unsubscribed");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    async fn send_publish(&self, params: &PublishParams) -> Result<()> {
        let value = serde_json::to_value(params)?;
        self.request(&self.methods.publish, value, self.config.request_timeout)
            .await
            .map(|_| ())
    }

    /// Send a relay RPC and await its acknowledgement
    async fn request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let request = JsonRpcRequest::new(method, params);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request.id, tx);

        let payload = serde_json::to_string(&request)?;
        if let Err(e) = self.transport.send(payload).await {
            self.pending.lock().remove(&request.id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(Error::from_json_rpc(error.code, error.message)),
            Ok(Err(_)) => Err(Error::Internal("Ack channel dropped".to_string())),
            Err(_) => {
                self.pending.lock().remove(&request.id);
                Err(Error::Timeout(format!("{method} acknowledgement")))
            }
        }
    }

    async fn handle_inbound(&self, text: &str) {
        let payload: JsonRpcPayload = match serde_json::from_str(text) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Dropping unparseable relay frame: {e}");
                return;
            }
        };

        match payload {
            JsonRpcPayload::Request(request) => {
                if request.method == self.methods.subscription {
                    self.handle_subscription_push(request).await;
                } else {
                    tracing::warn!(method = %request.method, "Unexpected relay request");
                    let error = JsonRpcError::new(request.id, -32601, "Method not found");
                    if let Ok(text) = serde_json::to_string(&error) {
                        let _ = self.transport.send(text).await;
                    }
                }
            }
            JsonRpcPayload::Result(result) => {
                if let Some(waiter) = self.pending.lock().remove(&result.id) {
                    let _ = waiter.send(Ok(result.result));
                } else {
                    tracing::debug!(id = result.id, "Ack for unknown request, ignoring");
                }
            }
            JsonRpcPayload::Error(error) => {
                if let Some(waiter) = self.pending.lock().remove(&error.id) {
                    let _ = waiter.send(Err(error.error));
                } else {
                    tracing::debug!(id = error.id, "Error for unknown request, ignoring");
                }
            }
        }
    }

    async fn handle_subscription_push(&self, request: JsonRpcRequest) {
        let params: SubscriptionParams = match serde_json::from_value(request.params) {
            Ok(params) => params,
            Err(e) => {
                tracing::warn!("Dropping malformed subscription push: {e}");
                return;
            }
        };

        // Ack first: the relay retries unacked pushes, and the ledger
        // already protects us from processing the redelivery.
        let ack = JsonRpcResult::new(request.id, Value::Bool(true));
        if let Ok(text) = serde_json::to_string(&ack) {
            let _ = self.transport.send(text).await;
        }

        self.dispatch(params.data).await;
    }

    /// Dedup-check and emit one relay message
    async fn dispatch(&self, message: RelayMessage) {
        if !self.subscriber.has(&message.topic) {
            tracing::warn!(topic = %message.topic, "Dropping message for unknown topic");
            return;
        }
        if !self.ledger.insert(&message.topic, &message.message) {
            tracing::debug!(topic = %message.topic, "Duplicate message suppressed");
            return;
        }
        let _ = self.ledger.persist().await;
        let _ = self.events.send(RelayerEvent::Message(message));
    }

    /// Resubscribe everything, then replay the mailbox in publish order
    async fn restore_subscriptions(&self) -> Result<()> {
        let topics = self.subscriber.topics();
        if topics.is_empty() {
            return Ok(());
        }
        tracing::info!(count = topics.len(), "Resubscribing topics after reconnect");

        let params = serde_json::to_value(BatchSubscribeParams { topics: topics.clone() })?;
        let ack = self
            .request(&self.methods.batch_subscribe, params, self.config.subscribe_timeout)
            .await?;
        if let Ok(ids) = serde_json::from_value::<Vec<String>>(ack) {
            for (topic, id) in topics.iter().zip(ids) {
                self.subscriber.set(topic, id).await?;
            }
        }

        let params = serde_json::to_value(jsonrpc::BatchFetchParams { topics })?;
        let ack = self
            .request(&self.methods.batch_fetch, params, self.config.request_timeout)
            .await?;
        let fetched: BatchFetchResult = serde_json::from_value(ack)?;

        // Publish-timestamp order, not arrival order
        let mut messages = fetched.messages;
        messages.sort_by_key(|message| message.published_at);
        for message in messages {
            self.dispatch(message).await;
        }
        Ok(())
    }

    async fn on_heartbeat(&self) {
        // Drain the publish retry queue
        for mut entry in self.publisher.drain() {
            match self.send_publish(&entry.params).await {
                Ok(()) => {
                    tracing::debug!(topic = %entry.params.topic, "Queued publish delivered");
                }
                Err(e) => {
                    tracing::debug!(topic = %entry.params.topic, "Queued publish failed again: {e}");
                    entry.attempts += 1;
                    self.publisher.enqueue(entry);
                }
            }
        }
    }
}
