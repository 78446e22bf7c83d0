//! # Transport
//!
//! Abstract duplex connection to the relay, plus the production
//! WebSocket implementation.
//!
//! ## Connection State Machine
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     CONNECTION STATE MACHINE                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   disconnected ──connect()──► connecting ──ok──► connected              │
//! │        ▲                          │                  │                  │
//! │        │                        error           close/error             │
//! │        │                          │                  │                  │
//! │        └──────────────────────────┴──────────────────┘                  │
//! │                                                                         │
//! │   Reconnect: linear backoff (attempt × base delay), bounded attempt    │
//! │   count, gated by the host's online/offline signal. A fatal close is   │
//! │   surfaced as a Disconnected event — never silently retried forever.   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{Error, Result};

/// Events emitted by a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The connection is open
    Connected,
    /// The connection closed (fatal until the next connect/reconnect)
    Disconnected {
        /// Close reason, when the socket gave one
        reason: Option<String>,
    },
    /// An inbound text frame
    Message(String),
    /// A send failed mid-connection; the heartbeat should restart us
    Stalled,
}

/// Abstract duplex message channel to the relay
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection
    async fn connect(&self) -> Result<()>;

    /// Close the connection and stop reconnecting
    async fn close(&self) -> Result<()>;

    /// Send one text frame
    async fn send(&self, payload: String) -> Result<()>;

    /// Subscribe to transport events
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Whether the connection is currently open
    fn is_connected(&self) -> bool;
}

/// Reconnect policy: linear backoff bounded by an attempt count
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Maximum reconnect attempts per outage
    pub max_attempts: u32,
    /// Backoff base; attempt N waits N × base
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { max_attempts: 5, base_delay: Duration::from_secs(2) }
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

struct WsInner {
    url: String,
    events: broadcast::Sender<TransportEvent>,
    writer: Mutex<Option<WsSink>>,
    connected: AtomicBool,
    /// Host environment online signal; reconnects are pointless offline
    online: AtomicBool,
    /// Set by close(); suppresses the reconnect loop
    closing: AtomicBool,
    policy: ReconnectPolicy,
}

/// WebSocket transport to the relay server
pub struct WsTransport {
    inner: Arc<WsInner>,
}

impl WsTransport {
    /// Create a transport for a relay URL (including the auth query)
    pub fn new(url: String, policy: ReconnectPolicy) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(WsInner {
                url,
                events,
                writer: Mutex::new(None),
                connected: AtomicBool::new(false),
                online: AtomicBool::new(true),
                closing: AtomicBool::new(false),
                policy,
            }),
        }
    }

    /// Feed the host environment's online/offline signal
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    async fn open(inner: &Arc<WsInner>) -> Result<()> {
        let (stream, _) = connect_async(&inner.url)
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        let (sink, mut source) = stream.split();

        *inner.writer.lock().await = Some(sink);
        inner.connected.store(true, Ordering::SeqCst);
        let _ = inner.events.send(TransportEvent::Connected);
        tracing::info!(url = %inner.url, "Relay transport connected");

        let reader_inner = Arc::clone(inner);
        tokio::spawn(async move {
            let reason = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let _ = reader_inner.events.send(TransportEvent::Message(text));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|f| f.reason.to_string());
                    }
                    Some(Ok(_)) => {} // ping/pong/binary: nothing to do
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break None,
                }
            };

            reader_inner.connected.store(false, Ordering::SeqCst);
            *reader_inner.writer.lock().await = None;
            tracing::warn!(?reason, "Relay transport disconnected");
            let _ = reader_inner.events.send(TransportEvent::Disconnected { reason });

            if !reader_inner.closing.load(Ordering::SeqCst) {
                Self::reconnect(reader_inner).await;
            }
        });

        Ok(())
    }

    fn reconnect(inner: Arc<WsInner>) -> futures_util::future::BoxFuture<'static, ()> {
        Box::pin(async move {
            for attempt in 1..=inner.policy.max_attempts {
                if inner.closing.load(Ordering::SeqCst) {
                    return;
                }
                if !inner.online.load(Ordering::SeqCst) {
                    tracing::debug!("Offline; skipping reconnect");
                    return;
                }
                tokio::time::sleep(inner.policy.base_delay * attempt).await;
                tracing::info!(attempt, "Reconnecting to relay");
                match Self::open(&inner).await {
                    Ok(()) => return,
                    Err(e) => tracing::warn!(attempt, "Reconnect failed: {e}"),
                }
            }
            tracing::error!(
                attempts = inner.policy.max_attempts,
                "Gave up reconnecting to relay"
            );
        })
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self) -> Result<()> {
        self.inner.closing.store(false, Ordering::SeqCst);
        if self.is_connected() {
            return Ok(());
        }
        Self::open(&self.inner).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.closing.store(true, Ordering::SeqCst);
        if let Some(mut sink) = self.inner.writer.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
        self.inner.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, payload: String) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        match writer.as_mut() {
            Some(sink) => sink.send(Message::Text(payload)).await.map_err(|e| {
                let _ = self.inner.events.send(TransportEvent::Stalled);
                Error::TransportError(e.to_string())
            }),
            None => Err(Error::NotConnected),
        }
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}
