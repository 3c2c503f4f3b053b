//! Receive transport lifecycle
//!
//! The subscriber keeps at most one receive transport per session. Its
//! `connect` requests from the media engine are relayed to the server, and its
//! connection state is mirrored into the session's `subscribed` flag.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::consumer::{Consumer, ConsumerOptions};
use crate::device::MediaDevice;
use crate::error::{Error, Result};
use crate::session::SharedSession;
use crate::signaling::messages::{
    ConnectTransportRequest, TransportParameters, CONNECT_CONSUMER_TRANSPORT,
    CREATE_CONSUMER_TRANSPORT,
};
use crate::signaling::SignalingChannel;
use crate::types::TransportId;

/// Notifications raised by a receive transport
#[derive(Debug)]
pub enum TransportEvent {
    /// The engine wants to connect; DTLS parameters must reach the server
    /// before `responder` is completed.
    Connect {
        dtls_parameters: Value,
        responder: oneshot::Sender<std::result::Result<(), String>>,
    },
    ConnectionStateChange(RTCPeerConnectionState),
}

/// Engine-side receive transport
#[async_trait]
pub trait RecvTransport: Send + Sync {
    fn id(&self) -> &TransportId;

    /// Take the event receiver. Only the first call returns it.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    async fn consume(&self, options: ConsumerOptions) -> Result<Arc<dyn Consumer>>;

    /// Close the transport and every consumer created on it
    async fn close(&self);
    fn is_closed(&self) -> bool;
}

/// Connection state of the current receive transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for TransportState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
            _ => Self::New,
        }
    }
}

struct ActiveTransport {
    transport: Arc<dyn RecvTransport>,
    relay: CancellationToken,
}

/// Creates, relays and tears down the session's receive transport
pub struct ConsumerTransportManager {
    channel: Arc<SignalingChannel>,
    session: SharedSession,
    active: Mutex<Option<ActiveTransport>>,
    state_tx: Arc<watch::Sender<TransportState>>,
}

impl ConsumerTransportManager {
    pub fn new(channel: Arc<SignalingChannel>, session: SharedSession) -> Self {
        let (state_tx, _) = watch::channel(TransportState::Closed);
        Self {
            channel,
            session,
            active: Mutex::new(None),
            state_tx: Arc::new(state_tx),
        }
    }

    /// Ask the server for a receive transport and build it on `device`.
    ///
    /// Any existing transport is closed first.
    pub async fn create(&self, device: &dyn MediaDevice) -> Result<Arc<dyn RecvTransport>> {
        self.close().await;

        let params: TransportParameters = self
            .channel
            .request_typed(CREATE_CONSUMER_TRANSPORT, &json!({}))
            .await?;
        let transport_id = params.id.clone();

        let transport = device.create_recv_transport(params).await?;
        let events = transport.take_events().ok_or_else(|| {
            Error::Media(format!("transport {transport_id} events already taken"))
        })?;

        let relay = CancellationToken::new();
        tokio::spawn(relay_events(
            events,
            Arc::clone(&self.channel),
            Arc::clone(&self.session),
            Arc::clone(&self.state_tx),
            relay.clone(),
        ));

        self.state_tx.send_replace(TransportState::New);
        *self.active.lock() = Some(ActiveTransport {
            transport: transport.clone(),
            relay,
        });

        info!(transport_id = %transport_id, "receive transport created");
        Ok(transport)
    }

    /// Close the current transport. Idempotent.
    pub async fn close(&self) {
        let Some(active) = self.active.lock().take() else {
            return;
        };

        active.relay.cancel();
        active.transport.close().await;
        self.state_tx.send_replace(TransportState::Closed);
        self.session.write().subscribed = false;
        info!(transport_id = %active.transport.id(), "receive transport closed");
    }

    #[must_use]
    pub fn current(&self) -> Option<Arc<dyn RecvTransport>> {
        self.active
            .lock()
            .as_ref()
            .map(|active| active.transport.clone())
    }

    #[must_use]
    pub fn state(&self) -> TransportState {
        *self.state_tx.borrow()
    }

    /// A failed or closed transport is never reused
    #[must_use]
    pub fn is_usable(&self) -> bool {
        let open = self
            .active
            .lock()
            .as_ref()
            .is_some_and(|active| !active.transport.is_closed());
        open && !matches!(self.state(), TransportState::Failed | TransportState::Closed)
    }

    pub fn watch_state(&self) -> watch::Receiver<TransportState> {
        self.state_tx.subscribe()
    }
}

impl Drop for ConsumerTransportManager {
    fn drop(&mut self) {
        if let Some(active) = self.active.lock().take() {
            active.relay.cancel();
        }
    }
}

async fn relay_events(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    channel: Arc<SignalingChannel>,
    session: SharedSession,
    state_tx: Arc<watch::Sender<TransportState>>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;

            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else { break };

        match event {
            TransportEvent::Connect {
                dtls_parameters,
                responder,
            } => {
                let request = ConnectTransportRequest { dtls_parameters };
                let result = channel
                    .request_typed::<_, Value>(CONNECT_CONSUMER_TRANSPORT, &request)
                    .await
                    .map(|_| ())
                    .map_err(|err| {
                        warn!(error = %err, "connectConsumerTransport failed");
                        err.to_string()
                    });
                if responder.send(result).is_err() {
                    debug!("transport stopped waiting for connect result");
                }
            }
            TransportEvent::ConnectionStateChange(state) => {
                let state = TransportState::from(state);
                match state {
                    TransportState::Connecting => debug!("receive transport connecting"),
                    TransportState::Connected => {
                        session.write().subscribed = true;
                        info!("receive transport connected");
                    }
                    TransportState::Failed => {
                        session.write().subscribed = false;
                        error!("receive transport failed");
                    }
                    TransportState::Disconnected | TransportState::Closed => {
                        session.write().subscribed = false;
                        warn!(state = ?state, "receive transport lost");
                    }
                    TransportState::New => {}
                }
                state_tx.send_replace(state);
            }
        }
    }
}
