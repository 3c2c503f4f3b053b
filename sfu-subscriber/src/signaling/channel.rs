use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::messages::{ServerMessage, EVENT_MESSAGE};
use super::{ChannelEvent, PushEvent, SignalingTransport};
use crate::config::SignalingConfig;
use crate::error::{Error, Result};
use crate::session::{ConnectionState, SharedSession};
use crate::types::ClientId;

/// Buffered push events per topic before slow receivers start lagging
const TOPIC_CAPACITY: usize = 64;

/// Named push topics plus one stream carrying every push in arrival order
#[derive(Clone)]
struct Topics {
    named: Arc<DashMap<String, broadcast::Sender<Value>>>,
    all: broadcast::Sender<PushEvent>,
}

impl Topics {
    fn new() -> Self {
        Self {
            named: Arc::new(DashMap::new()),
            all: broadcast::channel(TOPIC_CAPACITY).0,
        }
    }

    fn sender_for(&self, event: &str) -> broadcast::Sender<Value> {
        self.named
            .entry(event.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .value()
            .clone()
    }

    fn publish(&self, event: &str, payload: Value) {
        let named = self.named.get(event).map(|sender| sender.value().clone());
        if named.is_none() && self.all.receiver_count() == 0 {
            debug!(event, "push event without subscribers");
            return;
        }
        if let Some(sender) = named {
            // Receivers may come and go; a send with none is not an error.
            let _ = sender.send(payload.clone());
        }
        let _ = self.all.send(PushEvent {
            event: event.to_string(),
            payload,
        });
    }
}

fn parse_welcome(payload: &Value) -> Option<ClientId> {
    serde_json::from_value::<ServerMessage>(payload.clone())
        .ok()
        .and_then(|message| message.welcome_id().cloned())
}

/// Subscriber-side signaling protocol over a raw [`SignalingTransport`]
pub struct SignalingChannel {
    transport: Arc<dyn SignalingTransport>,
    session: SharedSession,
    config: SignalingConfig,
    topics: Topics,
    pump: Mutex<Option<CancellationToken>>,
}

impl SignalingChannel {
    pub fn new(
        transport: Arc<dyn SignalingTransport>,
        session: SharedSession,
        config: SignalingConfig,
    ) -> Self {
        Self {
            transport,
            session,
            config,
            topics: Topics::new(),
            pump: Mutex::new(None),
        }
    }

    /// True once the welcome handshake has completed and the socket is still up
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.session.read().is_connected()
    }

    #[must_use]
    pub fn client_id(&self) -> Option<ClientId> {
        self.session.read().client_id.clone()
    }

    /// Receive every future push of `event`.
    ///
    /// Subscriptions outlive reconnects, so a caller registers once.
    pub fn subscribe(&self, event: &str) -> broadcast::Receiver<Value> {
        self.topics.sender_for(event).subscribe()
    }

    /// Receive every future push, whatever its name, in arrival order
    pub fn subscribe_all(&self) -> broadcast::Receiver<PushEvent> {
        self.topics.all.subscribe()
    }

    /// Connect and complete the welcome handshake.
    ///
    /// Resolves with the identity assigned by the server. An existing
    /// connection is torn down first so two handshakes never overlap.
    pub async fn connect(&self) -> Result<ClientId> {
        let needs_reset = self.pump.lock().is_some()
            || self.session.read().connection_state != ConnectionState::Disconnected;
        if needs_reset {
            info!("signaling channel already open, reconnecting");
            self.disconnect().await;
        }

        self.session.write().connection_state = ConnectionState::Connecting;

        let mut events = match self.transport.open().await {
            Ok(events) => events,
            Err(err) => {
                error!(error = %err, "failed to open signaling socket");
                self.session.write().reset();
                return Err(err);
            }
        };

        let client_id = match timeout(
            self.config.handshake_timeout(),
            self.await_welcome(&mut events),
        )
        .await
        {
            Ok(Ok(client_id)) => client_id,
            Ok(Err(err)) => {
                self.abort_handshake().await;
                return Err(err);
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.handshake_timeout_ms,
                    "no welcome from signaling server"
                );
                self.abort_handshake().await;
                return Err(Error::Timeout("welcome handshake".to_string()));
            }
        };

        if let Some(socket_id) = self.transport.socket_id() {
            if socket_id != client_id.as_str() {
                warn!(
                    socket_id,
                    client_id = %client_id,
                    "welcome id does not match socket id"
                );
            }
        }

        self.session.write().establish(client_id.clone());
        self.spawn_pump(events);

        info!(client_id = %client_id, "connected to signaling server");
        Ok(client_id)
    }

    async fn await_welcome(
        &self,
        events: &mut mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Result<ClientId> {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Connected => debug!("signaling socket connected, awaiting welcome"),
                ChannelEvent::Error { message } => {
                    error!(error = %message, "signaling socket error before welcome");
                    return Err(Error::Transport(message));
                }
                ChannelEvent::Disconnected { reason } => {
                    return Err(Error::Transport(format!(
                        "disconnected before welcome: {reason}"
                    )));
                }
                ChannelEvent::Push { event, payload } if event == EVENT_MESSAGE => {
                    match parse_welcome(&payload) {
                        Some(client_id) => return Ok(client_id),
                        None => warn!(message = %payload, "unexpected message from server"),
                    }
                }
                ChannelEvent::Push { event, payload } => self.topics.publish(&event, payload),
            }
        }

        Err(Error::Transport(
            "signaling socket closed before welcome".to_string(),
        ))
    }

    async fn abort_handshake(&self) {
        self.transport.close().await;
        self.session.write().reset();
    }

    fn spawn_pump(&self, events: mpsc::UnboundedReceiver<ChannelEvent>) {
        let cancel = CancellationToken::new();
        tokio::spawn(run_pump(
            events,
            self.topics.clone(),
            Arc::clone(&self.session),
            cancel.clone(),
        ));
        if let Some(previous) = self.pump.lock().replace(cancel) {
            previous.cancel();
        }
    }

    /// Close the channel and forget the session identity. Idempotent.
    pub async fn disconnect(&self) {
        let pump = self.pump.lock().take();
        let was_open = pump.is_some()
            || self.session.read().connection_state != ConnectionState::Disconnected;

        if let Some(pump) = pump {
            pump.cancel();
        }
        if was_open {
            self.transport.close().await;
            info!("signaling channel closed");
        }
        self.session.write().reset();
    }

    /// Send one request and wait for its acknowledgement.
    ///
    /// Refused with [`Error::NotConnected`] until the welcome handshake has
    /// completed, so nothing reaches the server ahead of it.
    pub async fn request(&self, request: &str, payload: Value) -> Result<Value> {
        if !self.is_connected() {
            warn!(request, "refusing request before welcome handshake");
            return Err(Error::NotConnected);
        }

        debug!(request, "sending signaling request");
        let ack = timeout(
            self.config.request_timeout(),
            self.transport.emit(request, payload),
        )
        .await
        .map_err(|_| Error::Timeout(format!("request `{request}`")))??;

        if let Some(error) = ack.error.filter(|e| !e.is_null()) {
            let message = match error {
                Value::String(message) => message,
                other => other.to_string(),
            };
            warn!(request, error = %message, "signaling request rejected");
            return Err(Error::Protocol {
                request: request.to_string(),
                message,
            });
        }

        Ok(ack.data)
    }

    /// [`Self::request`] with typed payloads
    pub async fn request_typed<Req, Resp>(&self, request: &str, payload: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let data = self.request(request, serde_json::to_value(payload)?).await?;
        Ok(serde_json::from_value(data)?)
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.cancel();
        }
    }
}

/// Dispatch push events after the handshake until cancelled or the socket ends
async fn run_pump(
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    topics: Topics,
    session: SharedSession,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;

            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Some(ChannelEvent::Push { event, payload }) if event == EVENT_MESSAGE => {
                if parse_welcome(&payload).is_some() {
                    warn!(message = %payload, "ignoring repeated welcome");
                } else {
                    warn!(message = %payload, "unexpected message from server");
                }
            }
            Some(ChannelEvent::Push { event, payload }) => topics.publish(&event, payload),
            Some(ChannelEvent::Connected) => debug!("signaling socket reported connected"),
            Some(ChannelEvent::Error { message }) => {
                error!(error = %message, "signaling socket error");
            }
            Some(ChannelEvent::Disconnected { reason }) => {
                warn!(reason, "signaling socket disconnected");
                session.write().reset();
                break;
            }
            None => {
                debug!("signaling event stream ended");
                session.write().reset();
                break;
            }
        }
    }
}
