//! Per-connection session context
//!
//! The session is shared explicitly between the signaling channel (which owns
//! the identity and connection state) and the transport manager (which flips
//! `subscribed` once media flows). It is never reachable through a global.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::types::ClientId;

/// Connection state of the signaling channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Subscriber session state for one signaling channel lifetime
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Session {
    /// Identity assigned by the server's welcome message
    pub client_id: Option<ClientId>,

    pub connection_state: ConnectionState,

    /// True once the receive transport reported `connected`
    pub subscribed: bool,

    /// When the welcome handshake completed
    pub connected_at: Option<DateTime<Utc>>,
}

impl Session {
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self.connection_state, ConnectionState::Connected)
    }

    /// Record a completed welcome handshake
    pub fn establish(&mut self, client_id: ClientId) {
        self.client_id = Some(client_id);
        self.connection_state = ConnectionState::Connected;
        self.connected_at = Some(Utc::now());
    }

    /// Forget everything learned during the connection
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Session handle shared by the channel, transport manager and controller
pub type SharedSession = Arc<RwLock<Session>>;

#[must_use]
pub fn shared_session() -> SharedSession {
    Arc::new(RwLock::new(Session::default()))
}
