//! # Client Events
//!
//! The single app-facing event channel. Engines publish here; the
//! application subscribes once and matches on the variant. Internal
//! plumbing (relay acks, store changes, expirer sweeps) stays on its own
//! typed channels and never leaks onto this one.

use tokio::sync::broadcast;

use crate::sign::types::{PendingRequest, Proposal, Session, SessionEventData, SettledNamespaces};

/// Events surfaced to the application
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A peer proposed a session (wallet side)
    SessionProposal {
        /// The stored proposal, keyed by its request id
        proposal: Proposal,
    },
    /// A session settled (either side)
    SessionConnect {
        /// The settled session
        session: Session,
    },
    /// The peer updated the session namespaces
    SessionUpdate {
        /// Session topic
        topic: String,
        /// The new namespace grants
        namespaces: SettledNamespaces,
    },
    /// The peer closed the session
    SessionDelete {
        /// Session topic
        topic: String,
    },
    /// An inbound chain RPC request awaits a response (wallet side)
    SessionRequest {
        /// The stored pending request
        request: PendingRequest,
    },
    /// The peer emitted a session event
    SessionEvent {
        /// Session topic
        topic: String,
        /// Event name + payload
        event: SessionEventData,
        /// Chain context
        chain_id: String,
    },
    /// A session's expiry passed
    SessionExpire {
        /// Session topic
        topic: String,
    },
    /// A proposal's expiry passed
    ProposalExpire {
        /// Proposal id
        id: u64,
    },
    /// A pairing's expiry passed
    PairingExpire {
        /// Pairing topic
        topic: String,
    },
    /// A pairing URI is ready to show to the user
    DisplayUri {
        /// The `wc:` URI
        uri: String,
    },
    /// Relay transport came up
    RelayConnected,
    /// Relay transport went down
    RelayDisconnected,
}

/// Broadcast hub for [`ClientEvent`]
#[derive(Clone)]
pub struct EventHub {
    sender: broadcast::Sender<ClientEvent>,
}

impl EventHub {
    /// Create a hub with a bounded buffer
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    /// Subscribe to client events
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; silently dropped when nobody listens
    pub fn emit(&self, event: ClientEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
