//! # Error Handling
//!
//! Error types for the whole client, grouped by subsystem.
//!
//! ## Error Taxonomy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR TAXONOMY                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Validation errors    - thrown synchronously from the calling method,  │
//! │                         machine-readable code + human message          │
//! │  Network errors       - retried internally (publish queue, reconnect); │
//! │                         surfaced only when the caller opts in          │
//! │  Decode errors        - always non-fatal; logged and the message is    │
//! │                         dropped (relay redelivery is expected)         │
//! │  Expiry               - not a failure; a designed state transition     │
//! │                         that rejects pending calls with `Expired`      │
//! │  Peer protocol errors - JSON-RPC error responses propagated to the    │
//! │                         caller with the peer-supplied code/message     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type alias for all client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the client
///
/// All errors are categorized by module/domain to make error handling
/// clearer and to provide meaningful error messages to callers.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Core Lifecycle Errors (100-199)
    // ========================================================================

    /// Core has not been started yet
    #[error("Core has not been started. Call Core::start() first.")]
    NotStarted,

    /// Invalid client configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ========================================================================
    // Crypto Errors (200-299)
    // ========================================================================

    /// No key found in the keychain for the given label or topic
    #[error("No key found for: {0}")]
    MissingKey(String),

    /// Envelope encoding failed
    #[error("Failed to encode envelope: {0}")]
    EncodingError(String),

    /// Envelope decoding failed (bad base64, truncated, or auth tag mismatch)
    #[error("Failed to decode envelope: {0}")]
    DecodingError(String),

    /// Key derivation failed
    #[error("Failed to derive key: {0}")]
    KeyDerivationFailed(String),

    /// Invalid key format or length
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// JWT signing failed
    #[error("Failed to sign relay auth token: {0}")]
    SigningFailed(String),

    // ========================================================================
    // Storage Errors (300-399)
    // ========================================================================

    /// Failed to read from storage
    #[error("Failed to read from storage: {0}")]
    StorageReadError(String),

    /// Failed to write to storage
    #[error("Failed to write to storage: {0}")]
    StorageWriteError(String),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    // ========================================================================
    // Relay Errors (400-499)
    // ========================================================================

    /// Not connected to the relay
    #[error("Not connected to the relay.")]
    NotConnected,

    /// Failed to open the relay connection
    #[error("Failed to connect to relay: {0}")]
    ConnectionFailed(String),

    /// Transport-level send/receive failure
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Publish was not acknowledged within the bounded retry budget
    #[error("Failed to publish payload on topic {topic} after {attempts} attempts")]
    PublishFailed {
        /// Topic the payload was destined for
        topic: String,
        /// Number of attempts made
        attempts: u32,
    },

    /// Subscribe was not acknowledged in time
    #[error("Failed to subscribe to topic {0}")]
    SubscribeFailed(String),

    /// An operation timed out waiting on the relay or the peer
    #[error("Operation timed out: {0}")]
    Timeout(String),

    // ========================================================================
    // Pairing Errors (500-599)
    // ========================================================================

    /// Malformed pairing URI
    #[error("Malformed pairing URI: {0}")]
    MalformedUri(String),

    /// An active pairing already exists for the topic
    #[error("Pairing already exists for topic: {0}")]
    PairingAlreadyExists(String),

    /// No pairing record for the topic
    #[error("No pairing found for topic: {0}")]
    PairingNotFound(String),

    // ========================================================================
    // Session Errors (600-699)
    // ========================================================================

    /// No proposal with the given id
    #[error("No proposal found for id: {0}")]
    ProposalNotFound(u64),

    /// No session record for the topic
    #[error("No session found for topic: {0}")]
    SessionNotFound(String),

    /// Session exists but settlement was never acknowledged
    #[error("Session not settled for topic: {0}")]
    SessionNotSettled(String),

    /// Approved namespaces do not satisfy the required namespaces
    #[error("Non-conforming namespaces: {0}")]
    NonConformingNamespaces(String),

    /// The record (proposal, pairing, request) has passed its expiry
    #[error("Expired: {0}")]
    Expired(String),

    /// Request expiry outside the allowed bounds
    #[error("Invalid expiry: {0}")]
    InvalidExpiry(String),

    /// No pending request with the given id
    #[error("No pending request found for id: {0}")]
    PendingRequestNotFound(u64),

    // ========================================================================
    // Peer Protocol Errors (700-799)
    // ========================================================================

    /// JSON-RPC error response received from the peer
    #[error("Peer error {code}: {message}")]
    Protocol {
        /// Peer-supplied (or canonical reserved) error code
        code: i64,
        /// Peer-supplied message
        message: String,
    },

    // ========================================================================
    // Internal Errors (900-999)
    // ========================================================================

    /// Internal invariant violation (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl Error {
    /// Get the numeric error code
    ///
    /// Codes are organized by category:
    /// - 100-199: Core lifecycle
    /// - 200-299: Crypto
    /// - 300-399: Storage
    /// - 400-499: Relay
    /// - 500-599: Pairing
    /// - 600-699: Session
    /// - 700-799: Peer protocol (carries the peer code as-is)
    /// - 900-999: Internal
    pub fn code(&self) -> i64 {
        match self {
            Error::NotStarted => 100,
            Error::InvalidConfig(_) => 101,

            Error::MissingKey(_) => 200,
            Error::EncodingError(_) => 201,
            Error::DecodingError(_) => 202,
            Error::KeyDerivationFailed(_) => 203,
            Error::InvalidKey(_) => 204,
            Error::SigningFailed(_) => 205,

            Error::StorageReadError(_) => 300,
            Error::StorageWriteError(_) => 301,
            Error::NotFound(_) => 302,

            Error::NotConnected => 400,
            Error::ConnectionFailed(_) => 401,
            Error::TransportError(_) => 402,
            Error::PublishFailed { .. } => 403,
            Error::SubscribeFailed(_) => 404,
            Error::Timeout(_) => 405,

            Error::MalformedUri(_) => 500,
            Error::PairingAlreadyExists(_) => 501,
            Error::PairingNotFound(_) => 502,

            Error::ProposalNotFound(_) => 600,
            Error::SessionNotFound(_) => 601,
            Error::SessionNotSettled(_) => 602,
            Error::NonConformingNamespaces(_) => 603,
            Error::Expired(_) => 604,
            Error::InvalidExpiry(_) => 605,
            Error::PendingRequestNotFound(_) => 606,

            Error::Protocol { code, .. } => *code,

            Error::Internal(_) => 900,
            Error::SerializationError(_) => 901,
        }
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors can potentially be resolved by retrying or by
    /// waiting for the relay connection to come back.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::NotConnected
                | Error::ConnectionFailed(_)
                | Error::TransportError(_)
                | Error::PublishFailed { .. }
                | Error::SubscribeFailed(_)
        )
    }

    /// Build an error from a JSON-RPC error response
    ///
    /// Standard JSON-RPC reserved codes (-32700..-32603) are recognized and
    /// mapped to their canonical messages; unrecognized codes keep the
    /// peer-supplied message (or fall back to a generic server-error shape).
    pub fn from_json_rpc(code: i64, message: String) -> Self {
        let message = match code {
            -32700 => "Parse error".to_string(),
            -32600 => "Invalid Request".to_string(),
            -32601 => "Method not found".to_string(),
            -32602 => "Invalid params".to_string(),
            -32603 => "Internal error".to_string(),
            _ if message.is_empty() => "Server error".to_string(),
            _ => message,
        };
        Error::Protocol { code, message }
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::StorageReadError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::NotStarted.code(), 100);
        assert_eq!(Error::MissingKey("abc".into()).code(), 200);
        assert_eq!(Error::StorageReadError("io".into()).code(), 300);
        assert_eq!(Error::NotConnected.code(), 400);
        assert_eq!(Error::MalformedUri("x".into()).code(), 500);
        assert_eq!(Error::SessionNotFound("t".into()).code(), 601);
        assert_eq!(Error::Internal("bug".into()).code(), 900);
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(Error::Timeout("ack".into()).is_recoverable());
        assert!(Error::NotConnected.is_recoverable());
        assert!(!Error::MalformedUri("x".into()).is_recoverable());
        assert!(!Error::NonConformingNamespaces("eip155".into()).is_recoverable());
    }

    #[test]
    fn test_reserved_json_rpc_codes() {
        let err = Error::from_json_rpc(-32601, "whatever the peer said".into());
        assert_eq!(err.code(), -32601);
        assert!(err.to_string().contains("Method not found"));

        // Unrecognized code with an empty message falls back to a generic shape
        let err = Error::from_json_rpc(4242, String::new());
        assert!(err.to_string().contains("Server error"));

        // Unrecognized code keeps the peer-supplied message
        let err = Error::from_json_rpc(5000, "User rejected.".into());
        assert!(err.to_string().contains("User rejected."));
    }
}
