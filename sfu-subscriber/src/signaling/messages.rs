//! Signaling payloads exchanged with the SFU
//!
//! Field names follow the server's camelCase JSON convention. Capability sets,
//! transport parameters and RTP parameters are opaque to the subscriber and
//! carried as raw JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{ClientId, ConsumerId, MediaKind, ProducerId, TransportId};

/// Request names
pub const GET_ROUTER_RTP_CAPABILITIES: &str = "getRouterRtpCapabilities";
pub const CREATE_CONSUMER_TRANSPORT: &str = "createConsumerTransport";
pub const CONNECT_CONSUMER_TRANSPORT: &str = "connectConsumerTransport";
pub const CONSUME: &str = "consume";

/// Push event names
pub const EVENT_MESSAGE: &str = "message";
pub const EVENT_NEW_PRODUCER: &str = "newProducer";
pub const EVENT_PRODUCER_CLOSED: &str = "producerClosed";

/// Value of `type` in the handshake message
pub const WELCOME_TYPE: &str = "welcome";

/// Payload of a `message` push event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub id: Option<ClientId>,
}

impl ServerMessage {
    /// Returns the assigned identity when this is a well-formed welcome
    #[must_use]
    pub fn welcome_id(&self) -> Option<&ClientId> {
        if self.message_type == WELCOME_TYPE {
            self.id.as_ref()
        } else {
            None
        }
    }
}

/// Parameters returned by `createConsumerTransport`
///
/// Only the id is interpreted locally; ICE and DTLS parameters are handed to
/// the media engine untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportParameters {
    pub id: TransportId,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub dtls_parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    /// Device capabilities, serialized to a JSON string as the server expects
    pub rtp_capabilities: String,
    pub kind: MediaKind,
}

/// Response to `consume`
///
/// A missing `producer_id` means no producer of the requested kind exists yet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeResponse {
    #[serde(default)]
    pub producer_id: Option<ProducerId>,
    #[serde(default)]
    pub id: Option<ConsumerId>,
    #[serde(default)]
    pub kind: Option<MediaKind>,
    #[serde(default)]
    pub rtp_parameters: Option<Value>,
}

/// `newProducer` push event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProducer {
    pub kind: MediaKind,
}

/// `producerClosed` push event
///
/// An absent `remote_id` signals the end of the whole session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerClosed {
    #[serde(default)]
    pub local_id: Option<String>,
    #[serde(default)]
    pub remote_id: Option<ClientId>,
    pub kind: MediaKind,
}
