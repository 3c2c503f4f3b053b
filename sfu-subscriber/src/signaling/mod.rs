//! Signaling with the SFU
//!
//! [`SignalingTransport`] is the raw socket supplied by the embedding
//! application (wire encoding and reconnection live there). [`SignalingChannel`]
//! layers the subscriber protocol on top: the welcome handshake, request and
//! acknowledgement correlation, and named push-event topics.

mod channel;
pub mod messages;

pub use channel::SignalingChannel;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;

/// Lifecycle and push notifications emitted by a raw signaling socket
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The socket reached the server; the welcome message is still pending
    Connected,
    Disconnected {
        reason: String,
    },
    Error {
        message: String,
    },
    /// A named server push such as `message` or `newProducer`
    Push {
        event: String,
        payload: Value,
    },
}

/// A server push as seen by subscribers of every event
#[derive(Debug, Clone)]
pub struct PushEvent {
    pub event: String,
    pub payload: Value,
}

/// Server acknowledgement of an emitted request
///
/// Mirrors an `(err, response)` acknowledgement callback: a present, non-null
/// `error` means the server rejected the request.
#[derive(Debug, Clone, Default)]
pub struct Ack {
    pub error: Option<Value>,
    pub data: Value,
}

impl Ack {
    #[must_use]
    pub fn ok(data: Value) -> Self {
        Self { error: None, data }
    }

    #[must_use]
    pub fn err(error: Value) -> Self {
        Self {
            error: Some(error),
            data: Value::Null,
        }
    }
}

/// Raw bidirectional message socket to the signaling server
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Open the socket and return the stream of its events.
    ///
    /// Fails with [`crate::Error::Transport`] when the server is unreachable.
    async fn open(&self) -> Result<mpsc::UnboundedReceiver<ChannelEvent>>;

    /// Close the socket. Must be safe to call when already closed.
    async fn close(&self);

    /// Emit one named request and wait for its acknowledgement
    async fn emit(&self, event: &str, payload: Value) -> Result<Ack>;

    /// The socket's own transport-level identifier, if it exposes one
    fn socket_id(&self) -> Option<String>;
}
