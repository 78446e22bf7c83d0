//! # Sign Engine
//!
//! Session lifecycle over pairings: propose, settle, request, respond,
//! update, extend, emit, ping, disconnect.
//!
//! ## Settlement Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SESSION SETTLEMENT                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   DAPP                     pairing topic                WALLET          │
//! │    │  wc_sessionPropose (ephemeral pubkey A) ──────────►  │             │
//! │    │                                                      │ approve()   │
//! │    │                       session topic =                │ pubkey B    │
//! │    │                  sha256(HKDF(ECDH(A, B)))            │             │
//! │    │  ◄────────── wc_sessionSettle (session topic) ────── │             │
//! │    │  ◄────────── propose result {B} (pairing topic) ──── │             │
//! │    │  settle response true ─────────────────────────────► │             │
//! │    │                                                      │             │
//! │    ▼                                                      ▼             │
//! │  approval resolves                              acknowledged resolves   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every request/response pair is correlated by its JSON-RPC id through a
//! one-shot handle, and recorded in history *before* publish so relay
//! redelivery can never double-process.

pub mod namespaces;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, oneshot};

use crate::crypto::{Crypto, DecodeOptions, EncodeOptions};
use crate::error::{Error, Result};
use crate::events::{ClientEvent, EventHub};
use crate::expirer::{ExpiredEvent, Expirer, Target};
use crate::history::History;
use crate::pairing::PairingEngine;
use crate::relay::jsonrpc::{JsonRpcError, JsonRpcPayload, JsonRpcRequest, JsonRpcResult};
use crate::relay::{PublishOptions, Relayer, RelayerEvent};
use crate::storage::Storage;
use crate::store::Store;
use crate::time::{expiry_from_ttl, now_timestamp, FIVE_MINUTES, ONE_DAY, SEVEN_DAYS};

use self::types::{
    AppMetadata, Participant, PendingRequest, Proposal, ProposedNamespaces, Reason, Relay,
    RequestParams, Session, SessionEventData, SessionEventRequest, SessionProposeRequest,
    SessionProposeResponse, SessionSettleRequest, SessionUpdateRequest, SettledNamespaces,
};

const SESSION_PROPOSE: &str = "wc_sessionPropose";
const SESSION_SETTLE: &str = "wc_sessionSettle";
const SESSION_UPDATE: &str = "wc_sessionUpdate";
const SESSION_EXTEND: &str = "wc_sessionExtend";
const SESSION_REQUEST: &str = "wc_sessionRequest";
const SESSION_EVENT: &str = "wc_sessionEvent";
const SESSION_DELETE: &str = "wc_sessionDelete";
const SESSION_PING: &str = "wc_sessionPing";

const TAG_SESSION_PROPOSE: u32 = 1100;
const TAG_SESSION_PROPOSE_RESPONSE: u32 = 1101;
const TAG_SESSION_SETTLE: u32 = 1102;
const TAG_SESSION_SETTLE_RESPONSE: u32 = 1103;
const TAG_SESSION_UPDATE: u32 = 1104;
const TAG_SESSION_UPDATE_RESPONSE: u32 = 1105;
const TAG_SESSION_EXTEND: u32 = 1106;
const TAG_SESSION_EXTEND_RESPONSE: u32 = 1107;
const TAG_SESSION_REQUEST: u32 = 1108;
const TAG_SESSION_REQUEST_RESPONSE: u32 = 1109;
const TAG_SESSION_EVENT: u32 = 1110;
const TAG_SESSION_EVENT_RESPONSE: u32 = 1111;
const TAG_SESSION_DELETE: u32 = 1112;
const TAG_SESSION_DELETE_RESPONSE: u32 = 1113;
const TAG_SESSION_PING: u32 = 1114;
const TAG_SESSION_PING_RESPONSE: u32 = 1115;

/// Session lifetime granted at settlement
const SESSION_TTL: u64 = SEVEN_DAYS;
/// Default / minimum TTL for a session request
const REQUEST_TTL_MIN: u64 = FIVE_MINUTES;
/// Ceiling for a caller-supplied session request TTL
const REQUEST_TTL_MAX: u64 = SEVEN_DAYS;
/// How long control round-trips (ping, update, extend) may take
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// Parameters for [`SignEngine::connect`]
#[derive(Debug, Clone, Default)]
pub struct ConnectParams {
    /// Reuse an existing pairing; a fresh one is created when absent
    pub pairing_topic: Option<String>,
    /// Namespaces the approval must satisfy
    pub required_namespaces: ProposedNamespaces,
    /// Namespaces the wallet may additionally grant
    pub optional_namespaces: ProposedNamespaces,
}

/// Handle resolving once the peer approves (or rejects) a proposal
pub struct Approval {
    rx: oneshot::Receiver<Result<Session>>,
}

impl Approval {
    /// Wait for settlement; errors on rejection or proposal expiry
    pub async fn await_approval(self) -> Result<Session> {
        self.rx
            .await
            .map_err(|_| Error::Internal("Approval channel dropped".to_string()))?
    }
}

/// Result of [`SignEngine::connect`]
pub struct Connect {
    /// Pairing URI to show the peer; `None` when reusing a pairing
    pub uri: Option<String>,
    /// Resolves when the session settles
    pub approval: Approval,
}

/// Handle resolving once the proposer acknowledges our settlement
pub struct Acknowledgement {
    rx: oneshot::Receiver<Result<()>>,
}

impl Acknowledgement {
    /// Wait for the settle acknowledgement
    pub async fn acknowledged(self) -> Result<()> {
        self.rx
            .await
            .map_err(|_| Error::Internal("Acknowledgement channel dropped".to_string()))?
    }
}

/// Result of [`SignEngine::approve`]
pub struct Approved {
    /// The new session topic
    pub topic: String,
    /// Resolves when the proposer acknowledges the settlement
    pub acknowledged: Acknowledgement,
}

impl std::fmt::Debug for Approved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Approved")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

/// A response to a pending session request
#[derive(Debug, Clone)]
pub enum RpcResponse {
    /// Successful result payload
    Result(Value),
    /// Error with a protocol code
    Error {
        /// Protocol error code
        code: i64,
        /// Human-readable message
        message: String,
    },
}

type ResponseWaiter = oneshot::Sender<Result<Value>>;

/// Session protocol engine
pub struct SignEngine {
    crypto: Arc<Crypto>,
    relayer: Arc<Relayer>,
    expirer: Arc<Expirer>,
    history: Arc<History>,
    pairing: Arc<PairingEngine>,
    events: EventHub,
    metadata: AppMetadata,
    proposals: Store<Proposal>,
    sessions: Store<Session>,
    pending_requests: Store<PendingRequest>,
    /// proposal id → approval resolver (proposer side)
    pending_approvals: Mutex<HashMap<u64, oneshot::Sender<Result<Session>>>>,
    /// settle request id → (session topic, ack resolver) (responder side)
    pending_acks: Mutex<HashMap<u64, (String, oneshot::Sender<Result<()>>)>>,
    /// outbound request id → response resolver
    pending_responses: Mutex<HashMap<u64, ResponseWaiter>>,
    /// session topics we subscribed while waiting for wc_sessionSettle,
    /// mapped back to their proposal id
    settling: Mutex<HashMap<String, u64>>,
}

impl SignEngine {
    /// Build the engine over the shared core components
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        crypto: Arc<Crypto>,
        relayer: Arc<Relayer>,
        expirer: Arc<Expirer>,
        history: Arc<History>,
        pairing: Arc<PairingEngine>,
        storage: Storage,
        events: EventHub,
        metadata: AppMetadata,
    ) -> Self {
        Self {
            crypto,
            relayer,
            expirer,
            history,
            pairing,
            events,
            metadata,
            proposals: Store::new(storage.clone(), "client", "0.3", "proposal"),
            sessions: Store::new(storage.clone(), "client", "0.3", "session"),
            pending_requests: Store::new(storage, "client", "0.3", "request"),
            pending_approvals: Mutex::new(HashMap::new()),
            pending_acks: Mutex::new(HashMap::new()),
            pending_responses: Mutex::new(HashMap::new()),
            settling: Mutex::new(HashMap::new()),
        }
    }

    /// Restore persisted state, dropping records that expired while offline
    pub async fn init(&self) -> Result<()> {
        self.proposals.init().await?;
        self.sessions.init().await?;
        self.pending_requests.init().await?;

        let now = now_timestamp() as u64;
        for proposal in self.proposals.get_all() {
            if proposal.expiry <= now {
                self.proposals.delete(&proposal.id.to_string()).await?;
                self.expirer.del(&Target::Id(proposal.id)).await?;
            }
        }
        for session in self.sessions.get_all() {
            if session.expiry <= now {
                self.sessions.delete(&session.topic).await?;
                self.expirer.del(&Target::Topic(session.topic.clone())).await?;
            }
        }
        Ok(())
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
                        tracing::warn!(missed = n, "Sign engine lagged behind relay events");
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

    // ------------------------------------------------------------------------
    // Proposer side
    // ------------------------------------------------------------------------

    /// Propose a session, creating a pairing when none is supplied
    pub async fn connect(&self, params: ConnectParams) -> Result<Connect> {
        namespaces::validate_proposed(&params.required_namespaces)?;

        let (pairing_topic, uri) = match params.pairing_topic {
            Some(topic) => {
                self.pairing.get(&topic)?;
                (topic, None)
            }
            None => {
                let (pairing, uri) = self.pairing.create(vec![]).await?;
                self.events.emit(ClientEvent::DisplayUri { uri: uri.clone() });
                (pairing.topic, Some(uri))
            }
        };

        let public_key = self.crypto.generate_key_pair().await?;
        let expiry = expiry_from_ttl(FIVE_MINUTES);
        let proposer = Participant { public_key, metadata: self.metadata.clone() };
        let body = SessionProposeRequest {
            relays: vec![Relay::default()],
            proposer: proposer.clone(),
            required_namespaces: params.required_namespaces.clone(),
            optional_namespaces: params.optional_namespaces.clone(),
            expiry_timestamp: expiry,
        };
        let request = JsonRpcRequest::new(SESSION_PROPOSE, serde_json::to_value(&body)?);

        let proposal = Proposal {
            id: request.id,
            pairing_topic: pairing_topic.clone(),
            expiry,
            relays: body.relays.clone(),
            proposer,
            required_namespaces: params.required_namespaces,
            optional_namespaces: params.optional_namespaces,
        };
        self.proposals.set(proposal).await?;
        self.expirer.set(Target::Id(request.id), expiry).await?;
        self.history
            .set(&pairing_topic, request.id, serde_json::to_value(&request)?, None)
            .await?;

        let (tx, rx) = oneshot::channel();
        self.pending_approvals.lock().insert(request.id, tx);

        let encoded = self
            .crypto
            .encode(&pairing_topic, &serde_json::to_value(&request)?, &EncodeOptions::default())?;
        let opts = PublishOptions {
            ttl: FIVE_MINUTES,
            tag: TAG_SESSION_PROPOSE,
            prompt: true,
            throw_on_failed_publish: true,
        };
        if let Err(e) = self.relayer.publish(&pairing_topic, &encoded, opts).await {
            self.pending_approvals.lock().remove(&request.id);
            self.proposals.delete(&request.id.to_string()).await?;
            self.expirer.del(&Target::Id(request.id)).await?;
            return Err(e);
        }

        tracing::info!(id = request.id, pairing_topic, "Session proposed");
        Ok(Connect { uri, approval: Approval { rx } })
    }

    // ------------------------------------------------------------------------
    // Responder side
    // ------------------------------------------------------------------------

    /// Approve a proposal, settling a new session
    pub async fn approve(&self, id: u64, granted: SettledNamespaces) -> Result<Approved> {
        let proposal = self
            .proposals
            .get(&id.to_string())
            .map_err(|_| Error::ProposalNotFound(id))?;
        if proposal.expiry <= now_timestamp() as u64 {
            return Err(Error::Expired(format!("Proposal {id}")));
        }
        // Validate before any state is written
        namespaces::conforms(&proposal.required_namespaces, &granted)?;

        let self_public_key = self.crypto.generate_key_pair().await?;
        let session_topic = self
            .crypto
            .generate_shared_key(&self_public_key, &proposal.proposer.public_key, None)
            .await?;
        self.relayer.subscribe(&session_topic).await?;

        let expiry = expiry_from_ttl(SESSION_TTL);
        let controller = Participant {
            public_key: self_public_key.clone(),
            metadata: self.metadata.clone(),
        };
        let settle_body = SessionSettleRequest {
            relay: Relay::default(),
            controller: controller.clone(),
            namespaces: granted.clone(),
            expiry,
        };
        let settle = JsonRpcRequest::new(SESSION_SETTLE, serde_json::to_value(&settle_body)?);

        let session = Session {
            topic: session_topic.clone(),
            pairing_topic: proposal.pairing_topic.clone(),
            relay: Relay::default(),
            expiry,
            acknowledged: false,
            controller: self_public_key.clone(),
            self_participant: controller,
            peer_participant: proposal.proposer.clone(),
            namespaces: granted,
            required_namespaces: proposal.required_namespaces.clone(),
            optional_namespaces: proposal.optional_namespaces.clone(),
        };
        self.sessions.set(session).await?;
        self.expirer.set(Target::Topic(session_topic.clone()), expiry).await?;
        self.history
            .set(&session_topic, settle.id, serde_json::to_value(&settle)?, None)
            .await?;

        let (tx, rx) = oneshot::channel();
        self.pending_acks.lock().insert(settle.id, (session_topic.clone(), tx));

        // Settle on the session topic first, then answer the proposal on
        // the pairing topic; a proposer that sees the result before the
        // settle would subscribe in time anyway, but this ordering lets it
        // settle in one round-trip.
        let encoded = self
            .crypto
            .encode(&session_topic, &serde_json::to_value(&settle)?, &EncodeOptions::default())?;
        let opts = PublishOptions {
            ttl: FIVE_MINUTES,
            tag: TAG_SESSION_SETTLE,
            throw_on_failed_publish: true,
            ..Default::default()
        };
        if let Err(e) = self.relayer.publish(&session_topic, &encoded, opts).await {
            self.pending_acks.lock().remove(&settle.id);
            self.cleanup_session(&session_topic).await?;
            return Err(e);
        }

        let response = SessionProposeResponse {
            relay: Relay::default(),
            responder_public_key: self_public_key,
        };
        self.publish_result(
            &proposal.pairing_topic,
            id,
            serde_json::to_value(&response)?,
            TAG_SESSION_PROPOSE_RESPONSE,
        )
        .await;

        if let Err(e) = self.pairing.activate(&proposal.pairing_topic).await {
            tracing::debug!(topic = %proposal.pairing_topic, "Pairing activation skipped: {e}");
        }
        self.proposals.delete(&id.to_string()).await?;
        self.expirer.del(&Target::Id(id)).await?;

        tracing::info!(id, topic = %session_topic, "Session approved");
        Ok(Approved { topic: session_topic, acknowledged: Acknowledgement { rx } })
    }

    /// Reject a proposal with a peer-visible reason
    pub async fn reject(&self, id: u64, reason: Reason) -> Result<()> {
        let proposal = self
            .proposals
            .get(&id.to_string())
            .map_err(|_| Error::ProposalNotFound(id))?;

        self.publish_error(
            &proposal.pairing_topic,
            id,
            reason.code,
            &reason.message,
            TAG_SESSION_PROPOSE_RESPONSE,
        )
        .await;

        self.proposals.delete(&id.to_string()).await?;
        self.expirer.del(&Target::Id(id)).await?;
        tracing::info!(id, "Proposal rejected");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Settled-session operations
    // ------------------------------------------------------------------------

    /// Send a chain RPC request to the peer and await its response
    pub async fn request(
        &self,
        topic: &str,
        params: RequestParams,
        ttl: Option<u64>,
    ) -> Result<Value> {
        let session = self.settled(topic)?;
        if !namespaces::allows_method(&session.namespaces, &params.chain_id, &params.request.method)
        {
            return Err(Error::NonConformingNamespaces(format!(
                "Method {} not granted for {}",
                params.request.method, params.chain_id
            )));
        }
        let ttl = ttl.unwrap_or(REQUEST_TTL_MIN);
        if !(REQUEST_TTL_MIN..=REQUEST_TTL_MAX).contains(&ttl) {
            return Err(Error::InvalidExpiry(format!(
                "Request TTL {ttl}s outside [{REQUEST_TTL_MIN}, {REQUEST_TTL_MAX}]"
            )));
        }

        let chain_id = params.chain_id.clone();
        let request = JsonRpcRequest::new(SESSION_REQUEST, serde_json::to_value(&params)?);
        // History before publish: a redelivered response can then never
        // race its own request record
        self.history
            .set(topic, request.id, serde_json::to_value(&request)?, Some(chain_id))
            .await?;
        self.expirer.set(Target::Id(request.id), expiry_from_ttl(ttl)).await?;

        let opts = PublishOptions {
            ttl,
            tag: TAG_SESSION_REQUEST,
            prompt: true,
            throw_on_failed_publish: true,
        };
        let result = self
            .send_and_await(topic, &request, opts, Duration::from_secs(ttl))
            .await;
        self.expirer.del(&Target::Id(request.id)).await?;
        result
    }

    /// Respond to a pending inbound session request
    pub async fn respond(&self, topic: &str, id: u64, response: RpcResponse) -> Result<()> {
        self.settled(topic)?;
        if !self.pending_requests.contains(&id.to_string()) {
            return Err(Error::PendingRequestNotFound(id));
        }

        let recorded = match &response {
            RpcResponse::Result(value) => {
                self.publish_result(topic, id, value.clone(), TAG_SESSION_REQUEST_RESPONSE)
                    .await;
                json!({ "result": value })
            }
            RpcResponse::Error { code, message } => {
                self.publish_error(topic, id, *code, message, TAG_SESSION_REQUEST_RESPONSE)
                    .await;
                json!({ "error": { "code": code, "message": message } })
            }
        };
        self.history.resolve(topic, id, recorded).await?;
        self.pending_requests.delete(&id.to_string()).await?;
        self.expirer.del(&Target::Id(id)).await?;
        Ok(())
    }

    /// Replace the session namespaces; rolls back if the peer rejects
    pub async fn update(&self, topic: &str, granted: SettledNamespaces) -> Result<()> {
        let mut session = self.settled(topic)?;
        namespaces::conforms(&session.required_namespaces, &granted)?;

        let previous = session.namespaces.clone();
        session.namespaces = granted.clone();
        self.sessions.set(session).await?;

        let body = SessionUpdateRequest { namespaces: granted };
        let request = JsonRpcRequest::new(SESSION_UPDATE, serde_json::to_value(&body)?);
        let opts = PublishOptions {
            ttl: ONE_DAY,
            tag: TAG_SESSION_UPDATE,
            throw_on_failed_publish: true,
            ..Default::default()
        };
        match self.send_and_await(topic, &request, opts, CONTROL_TIMEOUT).await {
            Ok(_) => Ok(()),
            Err(e) => {
                // Optimistic apply failed: restore the previous grants
                if let Ok(mut current) = self.sessions.get(topic) {
                    current.namespaces = previous;
                    self.sessions.set(current).await?;
                }
                Err(e)
            }
        }
    }

    /// Extend the session to the full TTL; rolls back if the peer rejects
    pub async fn extend(&self, topic: &str) -> Result<()> {
        let mut session = self.settled(topic)?;
        let previous = session.expiry;
        session.expiry = expiry_from_ttl(SESSION_TTL);
        let new_expiry = session.expiry;
        self.sessions.set(session).await?;
        self.expirer.set(Target::Topic(topic.to_string()), new_expiry).await?;

        let request = JsonRpcRequest::new(SESSION_EXTEND, json!({}));
        let opts = PublishOptions {
            ttl: ONE_DAY,
            tag: TAG_SESSION_EXTEND,
            throw_on_failed_publish: true,
            ..Default::default()
        };
        match self.send_and_await(topic, &request, opts, CONTROL_TIMEOUT).await {
            Ok(_) => Ok(()),
            Err(e) => {
                if let Ok(mut current) = self.sessions.get(topic) {
                    current.expiry = previous;
                    self.sessions.set(current).await?;
                    self.expirer.set(Target::Topic(topic.to_string()), previous).await?;
                }
                Err(e)
            }
        }
    }

    /// Emit a session event to the peer
    pub async fn emit(&self, topic: &str, event: SessionEventData, chain_id: &str) -> Result<()> {
        let session = self.settled(topic)?;
        if !namespaces::allows_event(&session.namespaces, chain_id, &event.name) {
            return Err(Error::NonConformingNamespaces(format!(
                "Event {} not granted for {chain_id}",
                event.name
            )));
        }

        let body = SessionEventRequest { event, chain_id: chain_id.to_string() };
        let request = JsonRpcRequest::new(SESSION_EVENT, serde_json::to_value(&body)?);
        self.history
            .set(topic, request.id, serde_json::to_value(&request)?, Some(chain_id.to_string()))
            .await?;
        let encoded = self
            .crypto
            .encode(topic, &serde_json::to_value(&request)?, &EncodeOptions::default())?;
        let opts = PublishOptions {
            ttl: FIVE_MINUTES,
            tag: TAG_SESSION_EVENT,
            throw_on_failed_publish: true,
            ..Default::default()
        };
        self.relayer.publish(topic, &encoded, opts).await
    }

    /// Liveness check over the session topic
    pub async fn ping(&self, topic: &str) -> Result<()> {
        self.settled(topic)?;
        let request = JsonRpcRequest::new(SESSION_PING, json!({}));
        let opts = PublishOptions {
            ttl: crate::time::ONE_MINUTE,
            tag: TAG_SESSION_PING,
            throw_on_failed_publish: true,
            ..Default::default()
        };
        self.send_and_await(topic, &request, opts, CONTROL_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// Tear down a session, notifying the peer best-effort
    pub async fn disconnect(&self, topic: &str) -> Result<()> {
        if !self.sessions.contains(topic) {
            return Err(Error::SessionNotFound(topic.to_string()));
        }

        let request =
            JsonRpcRequest::new(SESSION_DELETE, serde_json::to_value(Reason::user_disconnected())?);
        match self.crypto.encode(topic, &serde_json::to_value(&request)?, &EncodeOptions::default())
        {
            Ok(encoded) => {
                let opts =
                    PublishOptions { ttl: ONE_DAY, tag: TAG_SESSION_DELETE, ..Default::default() };
                if let Err(e) = self.relayer.publish(topic, &encoded, opts).await {
                    tracing::warn!(topic, "Session delete publish failed: {e}");
                }
            }
            Err(e) => tracing::warn!(topic, "Could not encode session delete: {e}"),
        }

        self.cleanup_session(topic).await
    }

    /// A session by topic
    pub fn session(&self, topic: &str) -> Result<Session> {
        self.sessions
            .get(topic)
            .map_err(|_| Error::SessionNotFound(topic.to_string()))
    }

    /// All sessions
    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.get_all()
    }

    /// Inbound requests not yet responded to
    pub fn pending_session_requests(&self) -> Vec<PendingRequest> {
        self.pending_requests.get_all()
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn settled(&self, topic: &str) -> Result<Session> {
        let session = self
            .sessions
            .get(topic)
            .map_err(|_| Error::SessionNotFound(topic.to_string()))?;
        if !session.acknowledged {
            return Err(Error::SessionNotSettled(topic.to_string()));
        }
        Ok(session)
    }

    /// Delete session, subscription, symkey, expirer entry, and history.
    /// Symkey goes last so in-flight frames cannot race a missing key.
    async fn cleanup_session(&self, topic: &str) -> Result<()> {
        let _ = self.relayer.unsubscribe(topic).await;
        self.sessions.delete(topic).await?;
        self.crypto.delete_sym_key(topic).await?;
        self.expirer.del(&Target::Topic(topic.to_string())).await?;
        self.history.delete_topic(topic).await?;
        tracing::info!(topic, "Session removed");
        Ok(())
    }

    /// Publish a request and await the correlated response
    async fn send_and_await(
        &self,
        topic: &str,
        request: &JsonRpcRequest,
        opts: PublishOptions,
        timeout: Duration,
    ) -> Result<Value> {
        let encoded = self
            .crypto
            .encode(topic, &serde_json::to_value(request)?, &EncodeOptions::default())?;

        let (tx, rx) = oneshot::channel();
        self.pending_responses.lock().insert(request.id, tx);

        if let Err(e) = self.relayer.publish(topic, &encoded, opts).await {
            self.pending_responses.lock().remove(&request.id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Internal("Response channel dropped".to_string())),
            Err(_) => {
                self.pending_responses.lock().remove(&request.id);
                Err(Error::Timeout(format!("{} response", request.method)))
            }
        }
    }

    /// Publish a success result, fire-and-forget
    async fn publish_result(&self, topic: &str, id: u64, result: Value, tag: u32) {
        let response = JsonRpcResult::new(id, result);
        self.publish_response(topic, serde_json::to_value(&response), tag, id).await;
    }

    /// Publish an error result, fire-and-forget
    async fn publish_error(&self, topic: &str, id: u64, code: i64, message: &str, tag: u32) {
        let response = JsonRpcError::new(id, code, message);
        self.publish_response(topic, serde_json::to_value(&response), tag, id).await;
    }

    async fn publish_response(
        &self,
        topic: &str,
        payload: serde_json::Result<Value>,
        tag: u32,
        id: u64,
    ) {
        let payload = match payload {
            Ok(payload) => payload,
            Err(_) => return,
        };
        match self.crypto.encode(topic, &payload, &EncodeOptions::default()) {
            Ok(encoded) => {
                let opts = PublishOptions { ttl: FIVE_MINUTES, tag, ..Default::default() };
                if let Err(e) = self.relayer.publish(topic, &encoded, opts).await {
                    tracing::warn!(topic, id, "Response publish failed: {e}");
                }
            }
            Err(e) => tracing::warn!(topic, id, "Could not encode response: {e}"),
        }
    }

    // ------------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------------

    async fn on_relay_message(&self, topic: &str, encoded: &str) {
        // Only decode traffic for topics this engine is a party to:
        // session topics, topics awaiting settlement, and pairing topics
        // (which carry proposals and their responses).
        let ours = self.sessions.contains(topic)
            || self.settling.lock().contains_key(topic)
            || self.pairing.get(topic).is_ok();
        if !ours {
            return;
        }

        let payload = match self.crypto.decode(topic, encoded, &DecodeOptions::default()) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(topic, "Dropping undecodable frame: {e}");
                return;
            }
        };
        let payload: JsonRpcPayload = match serde_json::from_value(payload) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(topic, "Dropping malformed payload: {e}");
                return;
            }
        };

        match payload {
            JsonRpcPayload::Request(request) => self.on_request(topic, request).await,
            JsonRpcPayload::Result(result) => self.on_result(topic, result.id, result.result).await,
            JsonRpcPayload::Error(error) => {
                self.on_error(topic, error.id, Error::from_json_rpc(error.error.code, error.error.message))
                    .await
            }
        }
    }

    async fn on_request(&self, topic: &str, request: JsonRpcRequest) {
        // Relay redelivery: each (topic, id) is processed at most once
        if self.history.exists(topic, request.id) {
            tracing::debug!(topic, id = request.id, "Duplicate request suppressed");
            return;
        }

        match request.method.as_str() {
            SESSION_PROPOSE => self.on_session_propose(topic, request).await,
            SESSION_SETTLE => self.on_session_settle(topic, request).await,
            SESSION_REQUEST => self.on_session_request(topic, request).await,
            SESSION_UPDATE => self.on_session_update(topic, request).await,
            SESSION_EXTEND => self.on_session_extend(topic, request).await,
            SESSION_EVENT => self.on_session_event(topic, request).await,
            SESSION_DELETE => self.on_session_delete(topic, request).await,
            SESSION_PING => {
                if self.settled(topic).is_ok() {
                    if let Err(e) = self.record_inbound(topic, &request, None).await {
                        tracing::warn!(topic, "History write failed: {e}");
                    }
                    self.publish_result(topic, request.id, Value::Bool(true), TAG_SESSION_PING_RESPONSE)
                        .await;
                }
            }
            // wc_pairing* methods belong to the pairing engine
            _ => {}
        }
    }

    async fn record_inbound(
        &self,
        topic: &str,
        request: &JsonRpcRequest,
        chain_id: Option<String>,
    ) -> Result<()> {
        self.history
            .set(topic, request.id, serde_json::to_value(request)?, chain_id)
            .await
    }

    async fn on_session_propose(&self, topic: &str, request: JsonRpcRequest) {
        let body: SessionProposeRequest = match serde_json::from_value(request.params.clone()) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(topic, "Malformed session proposal: {e}");
                return;
            }
        };
        if let Err(e) = self.record_inbound(topic, &request, None).await {
            tracing::warn!(topic, "History write failed: {e}");
            return;
        }

        let proposal = Proposal {
            id: request.id,
            pairing_topic: topic.to_string(),
            expiry: body.expiry_timestamp,
            relays: body.relays,
            proposer: body.proposer,
            required_namespaces: body.required_namespaces,
            optional_namespaces: body.optional_namespaces,
        };
        if let Err(e) = self.proposals.set(proposal.clone()).await {
            tracing::warn!(topic, "Failed to store proposal: {e}");
            return;
        }
        let _ = self.expirer.set(Target::Id(request.id), proposal.expiry).await;
        tracing::info!(id = request.id, topic, "Session proposal received");
        self.events.emit(ClientEvent::SessionProposal { proposal });
    }

    async fn on_session_settle(&self, topic: &str, request: JsonRpcRequest) {
        let proposal_id = self.settling.lock().get(topic).copied();
        let Some(proposal_id) = proposal_id else {
            tracing::warn!(topic, "Settle for a topic we are not settling, dropping");
            return;
        };
        let body: SessionSettleRequest = match serde_json::from_value(request.params.clone()) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(topic, "Malformed settle: {e}");
                return;
            }
        };
        let Ok(proposal) = self.proposals.get(&proposal_id.to_string()) else {
            tracing::warn!(topic, proposal_id, "Settle without a proposal, dropping");
            return;
        };
        if let Err(e) = self.record_inbound(topic, &request, None).await {
            tracing::warn!(topic, "History write failed: {e}");
            return;
        }

        let session = Session {
            topic: topic.to_string(),
            pairing_topic: proposal.pairing_topic.clone(),
            relay: body.relay,
            expiry: body.expiry,
            acknowledged: true,
            controller: body.controller.public_key.clone(),
            self_participant: Participant {
                public_key: proposal.proposer.public_key.clone(),
                metadata: self.metadata.clone(),
            },
            peer_participant: body.controller,
            namespaces: body.namespaces,
            required_namespaces: proposal.required_namespaces.clone(),
            optional_namespaces: proposal.optional_namespaces.clone(),
        };
        if let Err(e) = self.sessions.set(session.clone()).await {
            tracing::warn!(topic, "Failed to store session: {e}");
            return;
        }
        let _ = self.expirer.set(Target::Topic(topic.to_string()), session.expiry).await;
        self.publish_result(topic, request.id, Value::Bool(true), TAG_SESSION_SETTLE_RESPONSE)
            .await;

        if let Err(e) = self.pairing.activate(&proposal.pairing_topic).await {
            tracing::debug!(topic = %proposal.pairing_topic, "Pairing activation skipped: {e}");
        }
        let _ = self.proposals.delete(&proposal_id.to_string()).await;
        let _ = self.expirer.del(&Target::Id(proposal_id)).await;
        self.settling.lock().remove(topic);

        tracing::info!(topic, "Session settled");
        self.events.emit(ClientEvent::SessionConnect { session: session.clone() });
        if let Some(waiter) = self.pending_approvals.lock().remove(&proposal_id) {
            let _ = waiter.send(Ok(session));
        }
    }

    async fn on_session_request(&self, topic: &str, request: JsonRpcRequest) {
        if self.settled(topic).is_err() {
            tracing::warn!(topic, "Request for unsettled session, dropping");
            return;
        }
        let params: RequestParams = match serde_json::from_value(request.params.clone()) {
            Ok(params) => params,
            Err(e) => {
                tracing::warn!(topic, "Malformed session request: {e}");
                return;
            }
        };
        if let Err(e) = self.record_inbound(topic, &request, Some(params.chain_id.clone())).await {
            tracing::warn!(topic, "History write failed: {e}");
            return;
        }

        let expiry = params
            .request
            .expiry
            .unwrap_or_else(|| expiry_from_ttl(REQUEST_TTL_MIN));
        let pending = PendingRequest {
            id: request.id,
            topic: topic.to_string(),
            params,
            verify_context: Value::Null,
        };
        if let Err(e) = self.pending_requests.set(pending.clone()).await {
            tracing::warn!(topic, "Failed to store pending request: {e}");
            return;
        }
        let _ = self.expirer.set(Target::Id(request.id), expiry).await;
        self.events.emit(ClientEvent::SessionRequest { request: pending });
    }

    async fn on_session_update(&self, topic: &str, request: JsonRpcRequest) {
        let Ok(mut session) = self.settled(topic) else {
            tracing::warn!(topic, "Update for unsettled session, dropping");
            return;
        };
        let body: SessionUpdateRequest = match serde_json::from_value(request.params.clone()) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(topic, "Malformed update: {e}");
                return;
            }
        };
        if let Err(e) = self.record_inbound(topic, &request, None).await {
            tracing::warn!(topic, "History write failed: {e}");
            return;
        }

        if let Err(e) = namespaces::conforms(&session.required_namespaces, &body.namespaces) {
            self.publish_error(topic, request.id, e.code(), &e.to_string(), TAG_SESSION_UPDATE_RESPONSE)
                .await;
            return;
        }
        session.namespaces = body.namespaces.clone();
        if let Err(e) = self.sessions.set(session).await {
            tracing::warn!(topic, "Failed to apply update: {e}");
            return;
        }
        self.publish_result(topic, request.id, Value::Bool(true), TAG_SESSION_UPDATE_RESPONSE)
            .await;
        self.events.emit(ClientEvent::SessionUpdate {
            topic: topic.to_string(),
            namespaces: body.namespaces,
        });
    }

    async fn on_session_extend(&self, topic: &str, request: JsonRpcRequest) {
        let Ok(mut session) = self.settled(topic) else {
            tracing::warn!(topic, "Extend for unsettled session, dropping");
            return;
        };
        if let Err(e) = self.record_inbound(topic, &request, None).await {
            tracing::warn!(topic, "History write failed: {e}");
            return;
        }
        session.expiry = expiry_from_ttl(SESSION_TTL);
        let expiry = session.expiry;
        if let Err(e) = self.sessions.set(session).await {
            tracing::warn!(topic, "Failed to apply extend: {e}");
            return;
        }
        let _ = self.expirer.set(Target::Topic(topic.to_string()), expiry).await;
        self.publish_result(topic, request.id, Value::Bool(true), TAG_SESSION_EXTEND_RESPONSE)
            .await;
    }

    async fn on_session_event(&self, topic: &str, request: JsonRpcRequest) {
        // Events are only delivered for settled sessions
        if self.settled(topic).is_err() {
            tracing::warn!(topic, "Event for unsettled session, dropping");
            return;
        }
        let body: SessionEventRequest = match serde_json::from_value(request.params.clone()) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(topic, "Malformed session event: {e}");
                return;
            }
        };
        if let Err(e) = self.record_inbound(topic, &request, Some(body.chain_id.clone())).await {
            tracing::warn!(topic, "History write failed: {e}");
            return;
        }
        self.publish_result(topic, request.id, Value::Bool(true), TAG_SESSION_EVENT_RESPONSE)
            .await;
        self.events.emit(ClientEvent::SessionEvent {
            topic: topic.to_string(),
            event: body.event,
            chain_id: body.chain_id,
        });
    }

    async fn on_session_delete(&self, topic: &str, request: JsonRpcRequest) {
        if !self.sessions.contains(topic) {
            return;
        }
        tracing::info!(topic, "Peer deleted session");
        self.publish_result(topic, request.id, Value::Bool(true), TAG_SESSION_DELETE_RESPONSE)
            .await;
        if let Err(e) = self.cleanup_session(topic).await {
            tracing::warn!(topic, "Session cleanup failed: {e}");
        }
        self.events.emit(ClientEvent::SessionDelete { topic: topic.to_string() });
    }

    async fn on_result(&self, topic: &str, id: u64, result: Value) {
        // General request/response correlation
        let waiter = self.pending_responses.lock().remove(&id);
        if let Some(waiter) = waiter {
            let _ = self.history.resolve(topic, id, result.clone()).await;
            let _ = waiter.send(Ok(result));
            return;
        }

        // Settle acknowledgement (responder side)
        let ack = self.pending_acks.lock().remove(&id);
        if let Some((session_topic, waiter)) = ack {
            let _ = self.history.resolve(&session_topic, id, result).await;
            if let Ok(mut session) = self.sessions.get(&session_topic) {
                session.acknowledged = true;
                let session_clone = session.clone();
                if self.sessions.set(session).await.is_ok() {
                    self.events.emit(ClientEvent::SessionConnect { session: session_clone });
                }
            }
            let _ = waiter.send(Ok(()));
            return;
        }

        // Proposal approval (proposer side): the result carries the
        // responder's public key; the session itself settles separately
        if self.proposals.contains(&id.to_string()) {
            self.on_propose_response(topic, id, result).await;
            return;
        }
        tracing::debug!(topic, id, "Result for unknown request, ignoring");
    }

    async fn on_propose_response(&self, topic: &str, id: u64, result: Value) {
        let response: SessionProposeResponse = match serde_json::from_value(result.clone()) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(topic, id, "Malformed propose response: {e}");
                return;
            }
        };
        let Ok(proposal) = self.proposals.get(&id.to_string()) else { return };
        let _ = self.history.resolve(&proposal.pairing_topic, id, result).await;

        let session_topic = match self
            .crypto
            .generate_shared_key(&proposal.proposer.public_key, &response.responder_public_key, None)
            .await
        {
            Ok(session_topic) => session_topic,
            Err(e) => {
                tracing::warn!(id, "Session key derivation failed: {e}");
                return;
            }
        };
        self.settling.lock().insert(session_topic.clone(), id);
        if let Err(e) = self.relayer.subscribe(&session_topic).await {
            tracing::warn!(topic = %session_topic, "Session topic subscribe failed: {e}");
        }
        tracing::debug!(id, topic = %session_topic, "Awaiting settlement");
    }

    async fn on_error(&self, topic: &str, id: u64, error: Error) {
        if let Some(waiter) = self.pending_responses.lock().remove(&id) {
            let _ = waiter.send(Err(error));
            return;
        }
        let ack = self.pending_acks.lock().remove(&id);
        if let Some((session_topic, waiter)) = ack {
            // Settlement rejected: the session never becomes usable
            let _ = self.cleanup_session(&session_topic).await;
            let _ = waiter.send(Err(error));
            return;
        }
        if self.proposals.contains(&id.to_string()) {
            tracing::info!(id, "Proposal rejected by peer");
            let _ = self.proposals.delete(&id.to_string()).await;
            let _ = self.expirer.del(&Target::Id(id)).await;
            if let Some(waiter) = self.pending_approvals.lock().remove(&id) {
                let _ = waiter.send(Err(error));
            }
            return;
        }
        tracing::debug!(topic, id, "Error for unknown request, ignoring");
    }

    // ------------------------------------------------------------------------
    // Expirer reactions
    // ------------------------------------------------------------------------

    async fn on_expired(&self, event: ExpiredEvent) {
        match event.target {
            Target::Topic(topic) => {
                if !self.sessions.contains(&topic) {
                    return;
                }
                tracing::info!(topic, "Session expired");
                if let Err(e) = self.cleanup_session(&topic).await {
                    tracing::warn!(topic, "Expired session cleanup failed: {e}");
                }
                self.events.emit(ClientEvent::SessionExpire { topic });
            }
            Target::Id(id) => {
                if self.proposals.contains(&id.to_string()) {
                    tracing::info!(id, "Proposal expired");
                    let _ = self.proposals.delete(&id.to_string()).await;
                    // A propose response may have reserved a session topic
                    // that never settled; release its subscription and key
                    let settling_topic = {
                        let mut settling = self.settling.lock();
                        let topic = settling
                            .iter()
                            .find_map(|(topic, pid)| (*pid == id).then(|| topic.clone()));
                        if let Some(topic) = &topic {
                            settling.remove(topic);
                        }
                        topic
                    };
                    if let Some(session_topic) = settling_topic {
                        let _ = self.relayer.unsubscribe(&session_topic).await;
                        if let Err(e) = self.crypto.delete_sym_key(&session_topic).await {
                            tracing::warn!(topic = %session_topic, "Unsettled key cleanup failed: {e}");
                        }
                    }
                    if let Some(waiter) = self.pending_approvals.lock().remove(&id) {
                        let _ = waiter.send(Err(Error::Expired(format!("Proposal {id}"))));
                    }
                    self.events.emit(ClientEvent::ProposalExpire { id });
                    return;
                }
                if self.pending_requests.contains(&id.to_string()) {
                    tracing::info!(id, "Pending request expired");
                    let _ = self.pending_requests.delete(&id.to_string()).await;
                }
                // Outbound request whose TTL passed without a response
                if let Some(waiter) = self.pending_responses.lock().remove(&id) {
                    let _ = waiter.send(Err(Error::Expired(format!("Request {id}"))));
                }
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
