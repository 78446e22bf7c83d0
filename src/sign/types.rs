//! Protocol data types: proposals, sessions, namespaces, and the wire
//! payload bodies for the `wc_session*` methods. Everything serializes
//! camelCase to match the protocol's JSON surface; persisted records use
//! the same shape so storage blobs stay wire-compatible.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::Record;

/// Relay selection carried in proposals and settlements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relay {
    /// Relay protocol name (`irn`)
    pub protocol: String,
    /// Protocol-specific data, unused by the default relay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Default for Relay {
    fn default() -> Self {
        Self { protocol: crate::relay::jsonrpc::RELAY_PROTOCOL.to_string(), data: None }
    }
}

/// Application identity shown to the peer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppMetadata {
    /// Human-readable app name
    pub name: String,
    /// Short description
    pub description: String,
    /// App homepage
    pub url: String,
    /// Icon URLs
    pub icons: Vec<String>,
}

/// One side of a session: its ephemeral public key plus metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// X25519 public key, hex
    pub public_key: String,
    /// The participant's app metadata
    pub metadata: AppMetadata,
}

/// Namespace requirements in a proposal (chains, no accounts yet)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProposedNamespace {
    /// CAIP-2 chain ids, e.g. `eip155:1`
    pub chains: Vec<String>,
    /// RPC methods the dapp wants to call
    pub methods: Vec<String>,
    /// Events the dapp wants to receive
    pub events: Vec<String>,
}

/// Proposal namespaces keyed by namespace name (`eip155`, `cosmos`, ...)
pub type ProposedNamespaces = BTreeMap<String, ProposedNamespace>;

/// Namespace grants in a settled session (accounts instead of chains)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettledNamespace {
    /// CAIP-10 accounts, e.g. `eip155:1:0xab...`
    pub accounts: Vec<String>,
    /// Granted RPC methods
    pub methods: Vec<String>,
    /// Granted events
    pub events: Vec<String>,
}

/// Settled namespaces keyed by namespace name
pub type SettledNamespaces = BTreeMap<String, SettledNamespace>;

/// A session proposal awaiting approval or rejection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    /// The `wc_sessionPropose` request id (correlates the response)
    pub id: u64,
    /// Pairing topic the proposal travelled over
    pub pairing_topic: String,
    /// Unix seconds after which the proposal is dead
    pub expiry: u64,
    /// Relays the proposer can use
    pub relays: Vec<Relay>,
    /// Proposer key + metadata
    pub proposer: Participant,
    /// Namespaces the approval must satisfy
    pub required_namespaces: ProposedNamespaces,
    /// Namespaces the wallet may additionally grant
    #[serde(default)]
    pub optional_namespaces: ProposedNamespaces,
}

impl Record for Proposal {
    fn key(&self) -> String {
        self.id.to_string()
    }
}

/// A settled (or settling) session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Session topic (derived from the ECDH symkey)
    pub topic: String,
    /// Pairing topic the session was proposed over
    pub pairing_topic: String,
    /// Relay in use
    pub relay: Relay,
    /// Unix seconds the session lives until
    pub expiry: u64,
    /// Whether the peer acknowledged the settlement
    pub acknowledged: bool,
    /// Public key of the controlling participant (the wallet)
    pub controller: String,
    /// Our key + metadata
    #[serde(rename = "self")]
    pub self_participant: Participant,
    /// The peer's key + metadata
    #[serde(rename = "peer")]
    pub peer_participant: Participant,
    /// Granted namespaces
    pub namespaces: SettledNamespaces,
    /// Requirements the grant was validated against
    pub required_namespaces: ProposedNamespaces,
    /// Optional requirements from the proposal
    #[serde(default)]
    pub optional_namespaces: ProposedNamespaces,
}

impl Record for Session {
    fn key(&self) -> String {
        self.topic.clone()
    }
}

/// The inner request of a `wc_sessionRequest`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequestData {
    /// Chain RPC method, e.g. `personal_sign`
    pub method: String,
    /// Method params, opaque to this layer
    pub params: Value,
    /// Optional caller-supplied expiry (unix seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<u64>,
}

/// `wc_sessionRequest` params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestParams {
    /// The chain RPC call
    pub request: SessionRequestData,
    /// CAIP-2 chain the call targets
    pub chain_id: String,
}

/// An inbound session request the wallet has not yet responded to
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    /// The `wc_sessionRequest` id
    pub id: u64,
    /// Session topic it arrived on
    pub topic: String,
    /// The call being requested
    pub params: RequestParams,
    /// Attestation context; opaque default, no verification performed
    #[serde(default)]
    pub verify_context: Value,
}

impl Record for PendingRequest {
    fn key(&self) -> String {
        self.id.to_string()
    }
}

/// A session event payload (`wc_sessionEvent` inner body)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEventData {
    /// Event name, e.g. `accountsChanged`
    pub name: String,
    /// Event payload, opaque to this layer
    pub data: Value,
}

/// Peer-visible close/rejection reason
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reason {
    /// Protocol reason code
    pub code: i64,
    /// Human-readable message
    pub message: String,
}

impl Reason {
    /// The standard user-initiated disconnect reason
    pub fn user_disconnected() -> Self {
        Self { code: 6000, message: "User disconnected.".to_string() }
    }

    /// The standard user rejection reason
    pub fn user_rejected() -> Self {
        Self { code: 5000, message: "User rejected.".to_string() }
    }
}

// ----------------------------------------------------------------------------
// Wire payload bodies
// ----------------------------------------------------------------------------

/// `wc_sessionPropose` params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProposeRequest {
    /// Relays the proposer supports
    pub relays: Vec<Relay>,
    /// Proposer key + metadata
    pub proposer: Participant,
    /// Required namespaces
    pub required_namespaces: ProposedNamespaces,
    /// Optional namespaces
    #[serde(default)]
    pub optional_namespaces: ProposedNamespaces,
    /// Proposal expiry, unix seconds
    pub expiry_timestamp: u64,
}

/// `wc_sessionPropose` success result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProposeResponse {
    /// Relay the responder chose
    pub relay: Relay,
    /// Responder's ephemeral X25519 public key, hex
    pub responder_public_key: String,
}

/// `wc_sessionSettle` params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettleRequest {
    /// Relay in use
    pub relay: Relay,
    /// Controller key + metadata (the wallet)
    pub controller: Participant,
    /// Granted namespaces
    pub namespaces: SettledNamespaces,
    /// Session expiry, unix seconds
    pub expiry: u64,
}

/// `wc_sessionUpdate` params
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionUpdateRequest {
    /// The replacement namespace grants
    pub namespaces: SettledNamespaces,
}

/// `wc_sessionEvent` params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEventRequest {
    /// The event being emitted
    pub event: SessionEventData,
    /// Chain context of the event
    pub chain_id: String,
}
