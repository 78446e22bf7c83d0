//! # Relay Wire Protocol
//!
//! JSON-RPC 2.0 over the transport. The relay namespaces its methods with
//! a protocol identifier (`irn` in production, `waku` historically):
//! `irn_publish`, `irn_subscribe`, `irn_subscription` (server→client
//! push), `irn_unsubscribe`, plus batch variants used after a reconnect.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::time::now_timestamp_millis;

/// Default relay protocol namespace
pub const RELAY_PROTOCOL: &str = "irn";

/// Generate a fresh JSON-RPC id
///
/// Millisecond timestamp scaled by 1000 plus 3 random digits: sortable by
/// creation time, collision-free in practice for a single client.
pub fn payload_id() -> u64 {
    let millis = now_timestamp_millis() as u64;
    millis * 1000 + rand::thread_rng().gen_range(0..1000)
}

/// A JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Request id
    pub id: u64,
    /// Always "2.0"
    pub jsonrpc: String,
    /// Method name
    pub method: String,
    /// Method params
    pub params: Value,
}

impl JsonRpcRequest {
    /// Build a request with a fresh id
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self::with_id(payload_id(), method, params)
    }

    /// Build a request with an explicit id
    pub fn with_id(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self { id, jsonrpc: "2.0".to_string(), method: method.into(), params }
    }
}

/// A successful JSON-RPC 2.0 response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResult {
    /// Id of the request this answers
    pub id: u64,
    /// Always "2.0"
    pub jsonrpc: String,
    /// Result value
    pub result: Value,
}

impl JsonRpcResult {
    /// Build a response for a request id
    pub fn new(id: u64, result: Value) -> Self {
        Self { id, jsonrpc: "2.0".to_string(), result }
    }
}

/// The error member of a JSON-RPC error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    /// Machine-readable code
    pub code: i64,
    /// Human-readable message
    pub message: String,
}

/// A JSON-RPC 2.0 error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Id of the request this answers
    pub id: u64,
    /// Always "2.0"
    pub jsonrpc: String,
    /// Error payload
    pub error: ErrorData,
}

impl JsonRpcError {
    /// Build an error response for a request id
    pub fn new(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            jsonrpc: "2.0".to_string(),
            error: ErrorData { code, message: message.into() },
        }
    }
}

/// Any JSON-RPC payload coming off the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcPayload {
    /// A request (has `method`)
    Request(JsonRpcRequest),
    /// An error response (has `error`)
    Error(JsonRpcError),
    /// A success response (has `result`)
    Result(JsonRpcResult),
}

// ----------------------------------------------------------------------------
// Relay method params/results
// ----------------------------------------------------------------------------

/// `{proto}_publish` params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishParams {
    /// Destination topic
    pub topic: String,
    /// Base64 envelope
    pub message: String,
    /// Message retention at the relay, seconds
    pub ttl: u64,
    /// Protocol method tag (push-notification routing hint)
    pub tag: u32,
    /// Whether the relay should prompt the peer's push channel
    pub prompt: bool,
}

/// `{proto}_subscribe` params
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeParams {
    /// Topic to subscribe to
    pub topic: String,
}

/// `{proto}_unsubscribe` params
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeParams {
    /// Topic to drop
    pub topic: String,
    /// Subscription id being released
    pub id: String,
}

/// `{proto}_batchSubscribe` params
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSubscribeParams {
    /// Topics to resubscribe after a reconnect
    pub topics: Vec<String>,
}

/// `{proto}_batchFetchMessages` params
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFetchParams {
    /// Topics to fetch mailbox messages for
    pub topics: Vec<String>,
}

/// A message delivered by the relay (push or mailbox fetch)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMessage {
    /// Topic the message was published to
    pub topic: String,
    /// Base64 envelope
    pub message: String,
    /// Relay-assigned publish timestamp (milliseconds)
    pub published_at: i64,
    /// Publisher-supplied tag
    #[serde(default)]
    pub tag: u32,
}

/// `{proto}_subscription` push params
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionParams {
    /// Subscription id the message arrived on
    pub id: String,
    /// The delivered message
    pub data: RelayMessage,
}

/// `{proto}_batchFetchMessages` result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFetchResult {
    /// Mailbox messages accumulated while disconnected
    pub messages: Vec<RelayMessage>,
}

/// Relay method names for a protocol namespace
#[derive(Debug, Clone)]
pub struct RelayMethods {
    /// `{proto}_publish`
    pub publish: String,
    /// `{proto}_subscribe`
    pub subscribe: String,
    /// `{proto}_subscription`
    pub subscription: String,
    /// `{proto}_unsubscribe`
    pub unsubscribe: String,
    /// `{proto}_batchSubscribe`
    pub batch_subscribe: String,
    /// `{proto}_batchFetchMessages`
    pub batch_fetch: String,
}

impl RelayMethods {
    /// Method names for a protocol namespace (e.g. `irn`)
    pub fn for_protocol(protocol: &str) -> Self {
        Self {
            publish: format!("{protocol}_publish"),
            subscribe: format!("{protocol}_subscribe"),
            subscription: format!("{protocol}_subscription"),
            unsubscribe: format!("{protocol}_unsubscribe"),
            batch_subscribe: format!("{protocol}_batchSubscribe"),
            batch_fetch: format!("{protocol}_batchFetchMessages"),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_ids_are_time_ordered_and_distinct() {
        let a = payload_id();
        let b = payload_id();
        assert_ne!(a, b);
        // Same millisecond or later; scaled ids preserve creation order
        assert!(b / 1000 >= a / 1000);
    }

    #[test]
    fn test_payload_discrimination() {
        let request: JsonRpcPayload =
            serde_json::from_value(json!({"id": 1, "jsonrpc": "2.0", "method": "irn_subscription", "params": {}}))
                .unwrap();
        assert!(matches!(request, JsonRpcPayload::Request(_)));

        let result: JsonRpcPayload =
            serde_json::from_value(json!({"id": 1, "jsonrpc": "2.0", "result": true})).unwrap();
        assert!(matches!(result, JsonRpcPayload::Result(_)));

        let error: JsonRpcPayload = serde_json::from_value(
            json!({"id": 1, "jsonrpc": "2.0", "error": {"code": -32601, "message": "nope"}}),
        )
        .unwrap();
        assert!(matches!(error, JsonRpcPayload::Error(_)));
    }

    #[test]
    fn test_relay_method_names() {
        let methods = RelayMethods::for_protocol(RELAY_PROTOCOL);
        assert_eq!(methods.publish, "irn_publish");
        assert_eq!(methods.subscription, "irn_subscription");
        assert_eq!(methods.batch_fetch, "irn_batchFetchMessages");
    }

    #[test]
    fn test_publish_params_wire_casing() {
        let params = PublishParams {
            topic: "t".into(),
            message: "m".into(),
            ttl: 300,
            tag: 1108,
            prompt: true,
        };
        let wire = serde_json::to_value(&params).unwrap();
        assert!(wire.get("ttl").is_some());
        assert!(wire.get("prompt").is_some());

        let message = RelayMessage { topic: "t".into(), message: "m".into(), published_at: 5, tag: 0 };
        let wire = serde_json::to_value(&message).unwrap();
        assert!(wire.get("publishedAt").is_some(), "camelCase on the wire");
    }
}
