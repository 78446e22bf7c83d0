//! In-process relay broker for tests.
//!
//! Speaks the same JSON-RPC surface as the production relay: publish,
//! subscribe, subscription push, unsubscribe, and the batch methods. Any
//! number of transports can attach to one broker; published messages are
//! pushed to connected subscribers (excluding the publisher) and kept in
//! a per-topic mailbox so `batchFetchMessages` works for clients that
//! were offline.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use super::jsonrpc::{
    BatchFetchParams, BatchFetchResult, BatchSubscribeParams, JsonRpcPayload, JsonRpcRequest,
    JsonRpcResult, PublishParams, RelayMessage, SubscribeParams, SubscriptionParams,
    UnsubscribeParams,
};
use super::{Transport, TransportEvent};
use crate::error::{Error, Result};
use crate::time::now_timestamp_millis;

struct Client {
    events: broadcast::Sender<TransportEvent>,
    connected: bool,
    /// topic → subscription id
    subscriptions: HashMap<String, String>,
}

#[derive(Default)]
struct BrokerState {
    clients: HashMap<usize, Client>,
    /// Every message ever published, per topic (mailbox for batch fetch)
    mailbox: HashMap<String, Vec<RelayMessage>>,
    next_client: usize,
    next_sub: usize,
}

/// Shared in-memory relay
#[derive(Clone, Default)]
pub(crate) struct MockRelay {
    state: Arc<Mutex<BrokerState>>,
}

impl MockRelay {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Attach a new transport to this broker
    pub(crate) fn transport(&self) -> Arc<MockTransport> {
        let (events, _) = broadcast::channel(256);
        let id = {
            let mut state = self.state.lock();
            let id = state.next_client;
            state.next_client += 1;
            state.clients.insert(
                id,
                Client { events: events.clone(), connected: false, subscriptions: HashMap::new() },
            );
            id
        };
        Arc::new(MockTransport { relay: self.clone(), client_id: id, events })
    }

    /// Messages stored for a topic (assertion helper)
    pub(crate) fn mailbox(&self, topic: &str) -> Vec<RelayMessage> {
        self.state.lock().mailbox.get(topic).cloned().unwrap_or_default()
    }

    fn handle(&self, sender: usize, request: JsonRpcRequest) {
        let result = match request.method.rsplit('_').next() {
            Some("publish") => self.on_publish(sender, request.params),
            Some("subscribe") => self.on_subscribe(sender, request.params),
            Some("unsubscribe") => self.on_unsubscribe(sender, request.params),
            Some("batchSubscribe") => self.on_batch_subscribe(sender, request.params),
            Some("batchFetchMessages") => self.on_batch_fetch(request.params),
            other => {
                tracing::warn!(?other, "Mock relay: unknown method");
                return;
            }
        };
        self.reply(sender, JsonRpcResult::new(request.id, result));
    }

    fn on_publish(&self, sender: usize, params: Value) -> Value {
        let params: PublishParams = serde_json::from_value(params).unwrap();
        let message = RelayMessage {
            topic: params.topic.clone(),
            message: params.message,
            published_at: now_timestamp_millis(),
            tag: params.tag,
        };

        let mut state = self.state.lock();
        state.mailbox.entry(params.topic.clone()).or_default().push(message.clone());

        for (&id, client) in &state.clients {
            if id == sender || !client.connected {
                continue;
            }
            if let Some(sub_id) = client.subscriptions.get(&params.topic) {
                let push = JsonRpcRequest::new(
                    "irn_subscription",
                    serde_json::to_value(SubscriptionParams {
                        id: sub_id.clone(),
                        data: message.clone(),
                    })
                    .unwrap(),
                );
                let _ = client
                    .events
                    .send(TransportEvent::Message(serde_json::to_string(&push).unwrap()));
            }
        }
        Value::Bool(true)
    }

    fn on_subscribe(&self, sender: usize, params: Value) -> Value {
        let params: SubscribeParams = serde_json::from_value(params).unwrap();
        Value::String(self.register(sender, &params.topic))
    }

    fn on_unsubscribe(&self, sender: usize, params: Value) -> Value {
        let params: UnsubscribeParams = serde_json::from_value(params).unwrap();
        let mut state = self.state.lock();
        if let Some(client) = state.clients.get_mut(&sender) {
            client.subscriptions.remove(&params.topic);
        }
        Value::Bool(true)
    }

    fn on_batch_subscribe(&self, sender: usize, params: Value) -> Value {
        let params: BatchSubscribeParams = serde_json::from_value(params).unwrap();
        let ids: Vec<String> = params
            .topics
            .iter()
            .map(|topic| self.register(sender, topic))
            .collect();
        json!(ids)
    }

    fn on_batch_fetch(&self, params: Value) -> Value {
        let params: BatchFetchParams = serde_json::from_value(params).unwrap();
        let state = self.state.lock();
        let messages = params
            .topics
            .iter()
            .flat_map(|topic| state.mailbox.get(topic).cloned().unwrap_or_default())
            .collect();
        serde_json::to_value(BatchFetchResult { messages }).unwrap()
    }

    /// Record a subscription and replay the topic's stored messages, the
    /// way the production relay delivers its mailbox on subscribe
    fn register(&self, sender: usize, topic: &str) -> String {
        let mut state = self.state.lock();
        let id = format!("mock-sub-{}", state.next_sub);
        state.next_sub += 1;
        let backlog = state.mailbox.get(topic).cloned().unwrap_or_default();
        if let Some(client) = state.clients.get_mut(&sender) {
            client.subscriptions.insert(topic.to_string(), id.clone());
            for message in backlog {
                let push = JsonRpcRequest::new(
                    "irn_subscription",
                    serde_json::to_value(SubscriptionParams { id: id.clone(), data: message })
                        .unwrap(),
                );
                let _ = client
                    .events
                    .send(TransportEvent::Message(serde_json::to_string(&push).unwrap()));
            }
        }
        id
    }

    fn reply(&self, client_id: usize, result: JsonRpcResult) {
        let state = self.state.lock();
        if let Some(client) = state.clients.get(&client_id) {
            let _ = client
                .events
                .send(TransportEvent::Message(serde_json::to_string(&result).unwrap()));
        }
    }
}

/// One client's connection to a [`MockRelay`]
pub(crate) struct MockTransport {
    relay: MockRelay,
    client_id: usize,
    events: broadcast::Sender<TransportEvent>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<()> {
        let mut state = self.relay.state.lock();
        if let Some(client) = state.clients.get_mut(&self.client_id) {
            client.connected = true;
        }
        drop(state);
        let _ = self.events.send(TransportEvent::Connected);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.relay.state.lock();
        if let Some(client) = state.clients.get_mut(&self.client_id) {
            client.connected = false;
        }
        drop(state);
        let _ = self.events.send(TransportEvent::Disconnected { reason: None });
        Ok(())
    }

    async fn send(&self, payload: String) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        match serde_json::from_str::<JsonRpcPayload>(&payload) {
            Ok(JsonRpcPayload::Request(request)) => self.relay.handle(self.client_id, request),
            Ok(_) => {} // client acks for subscription pushes
            Err(e) => return Err(Error::TransportError(format!("unparseable frame: {e}"))),
        }
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.relay
            .state
            .lock()
            .clients
            .get(&self.client_id)
            .map(|client| client.connected)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::relay::{PublishOptions, Relayer, RelayerConfig, RelayerEvent};
    use crate::storage::MemoryStorage;

    fn relayer(relay: &MockRelay) -> Arc<Relayer> {
        Relayer::new(
            relay.transport(),
            Arc::new(MemoryStorage::new()),
            RelayerConfig::default(),
        )
    }

    async fn started(relay: &MockRelay) -> (Arc<Relayer>, crate::heartbeat::Heartbeat) {
        let heartbeat = crate::heartbeat::Heartbeat::start(Duration::from_millis(50));
        let relayer = relayer(relay);
        relayer.init().await.unwrap();
        relayer.start(&heartbeat);
        relayer.connect().await.unwrap();
        (relayer, heartbeat)
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let relay = MockRelay::new();
        let (alice, _hb_a) = started(&relay).await;
        let (bob, _hb_b) = started(&relay).await;

        bob.subscribe("topic-1").await.unwrap();
        let mut events = bob.subscribe_events();

        alice
            .publish("topic-1", "hello", PublishOptions::default())
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let RelayerEvent::Message(message) = events.recv().await.unwrap() {
                    break message;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event.topic, "topic-1");
        assert_eq!(event.message, "hello");
    }

    #[tokio::test]
    async fn test_duplicate_delivery_suppressed() {
        let relay = MockRelay::new();
        let (alice, _hb_a) = started(&relay).await;
        let (bob, _hb_b) = started(&relay).await;

        bob.subscribe("topic-1").await.unwrap();
        let mut events = bob.subscribe_events();

        alice.publish("topic-1", "once", PublishOptions::default()).await.unwrap();
        alice.publish("topic-1", "once", PublishOptions::default()).await.unwrap();
        alice.publish("topic-1", "twice", PublishOptions::default()).await.unwrap();

        let mut seen = Vec::new();
        while seen.len() < 2 {
            match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
                Ok(Ok(RelayerEvent::Message(message))) => seen.push(message.message),
                Ok(_) => {}
                _ => break,
            }
        }
        assert_eq!(seen, vec!["once".to_string(), "twice".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_topic_dropped() {
        let relay = MockRelay::new();
        let (alice, _hb_a) = started(&relay).await;
        let (bob, _hb_b) = started(&relay).await;

        // Bob subscribes at the broker but wipes local subscriber state,
        // simulating a push for a topic this client no longer tracks
        bob.subscribe("topic-1").await.unwrap();
        bob.subscriber().remove("topic-1", None).await.unwrap();
        let mut events = bob.subscribe_events();

        alice.publish("topic-1", "stray", PublishOptions::default()).await.unwrap();

        let got = tokio::time::timeout(Duration::from_millis(200), async {
            loop {
                if let RelayerEvent::Message(_) = events.recv().await.unwrap() {
                    break;
                }
            }
        })
        .await;
        assert!(got.is_err(), "message for untracked topic must not surface");
    }

    #[tokio::test]
    async fn test_mailbox_replayed_after_reconnect() {
        let relay = MockRelay::new();
        let (alice, _hb_a) = started(&relay).await;

        // Bob subscribes, goes offline, misses a message
        let (bob, _hb_b) = started(&relay).await;
        bob.subscribe("topic-1").await.unwrap();
        bob.close().await.unwrap();

        alice.publish("topic-1", "while-away", PublishOptions::default()).await.unwrap();

        let mut events = bob.subscribe_events();
        bob.connect().await.unwrap();

        let replayed = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let RelayerEvent::Message(message) = events.recv().await.unwrap() {
                    break message;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(replayed.message, "while-away");
    }

    #[tokio::test]
    async fn test_failed_publish_queued_and_retried_on_heartbeat() {
        let relay = MockRelay::new();
        let (alice, _hb) = started(&relay).await;

        // Force the first send to fail by closing the transport
        alice.close().await.unwrap();
        alice
            .publish("topic-1", "later", PublishOptions::default())
            .await
            .unwrap(); // fire-and-forget: queues instead of erroring

        alice.connect().await.unwrap();

        // Heartbeat pulse (50ms in tests) drains the queue
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if !relay.mailbox("topic-1").is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await
        .expect("queued publish should land after reconnect");
    }

    #[tokio::test]
    async fn test_throwing_publish_surfaces_failure() {
        let relay = MockRelay::new();
        let relayer = relayer(&relay);
        relayer.init().await.unwrap();
        // Never connected: every attempt fails fast

        let result = relayer
            .publish(
                "topic-1",
                "doomed",
                PublishOptions { throw_on_failed_publish: true, ..Default::default() },
            )
            .await;
        assert!(matches!(result, Err(Error::PublishFailed { .. })));
    }
}
