//! SFU media subscriber
//!
//! Client-side subscription to audio (and optionally video) published on a
//! Selective Forwarding Unit. The subscriber talks to the SFU's signaling server,
//! negotiates RTP capabilities, opens a single receive transport, consumes one
//! remote producer per media kind and routes the received tracks into playback
//! sinks owned by the embedding application.
//!
//! ## Architecture
//!
//! - **`SignalingChannel`**: welcome handshake, request/acknowledgement and push topics
//! - **`CapabilityNegotiator`**: loads router capabilities into a media device
//! - **`ConsumerTransportManager`**: the session's receive transport and its connect relay
//! - **`ConsumerRegistry`**: at most one live consumer per media kind
//! - **`RemoteMediaSinkRegistry`**: one playback sink per remote participant
//! - **`ConsumptionController`**: drives all of the above and reacts to producer events
//!
//! The raw socket, the media engine and the playback element are supplied by
//! the host through the [`SignalingTransport`], [`DeviceFactory`] and
//! [`SinkFactory`] traits.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfu_subscriber::{ConsumptionController, SubscriberConfig};
//!
//! let config = SubscriberConfig::load(Some("subscriber.toml"))?;
//! sfu_subscriber::init_logging(&config.logging)?;
//!
//! let controller = ConsumptionController::new(config, socket, devices, sinks);
//! let report = controller.subscribe().await?;
//! // ...
//! controller.disconnect().await;
//! ```

pub mod config;
pub mod consumer;
pub mod controller;
pub mod device;
pub mod error;
mod kind_queue;
mod logging;
pub mod session;
pub mod signaling;
pub mod sink;
pub mod transport;
pub mod types;

#[cfg(test)]
pub mod test_helpers;

pub use config::{
    ConsumeConfig, LoggingConfig, PlaybackConfig, SignalingConfig, SubscriberConfig,
};
pub use consumer::{Consumer, ConsumerInfo, ConsumerOptions, ConsumerRegistry, RemoteTrack};
pub use controller::{ConsumptionController, KindOutcome, SubscribeReport, SubscriberState};
pub use device::{CapabilityNegotiator, DeviceFactory, MediaDevice};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use session::{ConnectionState, Session, SharedSession};
pub use signaling::{Ack, ChannelEvent, PushEvent, SignalingChannel, SignalingTransport};
pub use sink::{AudioSink, MediaStream, RemoteMediaSinkRegistry, SinkFactory};
pub use transport::{ConsumerTransportManager, RecvTransport, TransportEvent, TransportState};
pub use types::{ClientId, ConsumerId, MediaKind, ProducerId, TransportId};
