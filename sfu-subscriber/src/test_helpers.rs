//! In-memory signaling server, media engine and playback sinks for tests

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::consumer::{Consumer, ConsumerOptions, RemoteTrack};
use crate::device::{DeviceFactory, MediaDevice};
use crate::error::{Error, Result};
use crate::signaling::messages::{TransportParameters, EVENT_MESSAGE};
use crate::signaling::{Ack, ChannelEvent, SignalingTransport};
use crate::sink::{AudioSink, MediaStream, SinkFactory};
use crate::transport::{RecvTransport, TransportEvent};
use crate::types::{ClientId, ConsumerId, MediaKind, ProducerId, TransportId};

type Handler = Box<dyn Fn(&Value) -> Ack + Send + Sync>;

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached in time");
}

/// Scriptable signaling server
#[derive(Default)]
pub struct FakeSignaling {
    welcome_id: Mutex<Option<String>>,
    socket_id: Mutex<Option<String>>,
    open_error: Mutex<Option<String>>,
    events: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
    responses: Mutex<HashMap<String, VecDeque<Ack>>>,
    handlers: Mutex<HashMap<String, Handler>>,
    holds: Mutex<HashMap<String, Arc<Notify>>>,
    calls: Mutex<Vec<(String, Value)>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

impl FakeSignaling {
    /// A server that never sends a welcome on its own
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A server that welcomes every connection with `client_id`
    pub fn welcoming(client_id: &str) -> Arc<Self> {
        let fake = Self::default();
        *fake.welcome_id.lock() = Some(client_id.to_string());
        Arc::new(fake)
    }

    pub fn set_socket_id(&self, socket_id: &str) {
        *self.socket_id.lock() = Some(socket_id.to_string());
    }

    pub fn fail_open(&self, reason: &str) {
        *self.open_error.lock() = Some(reason.to_string());
    }

    /// Queue a successful acknowledgement for `request`.
    ///
    /// The last queued answer keeps being returned once the others are used.
    pub fn respond(&self, request: &str, data: Value) {
        self.queue(request, Ack::ok(data));
    }

    pub fn reject(&self, request: &str, error: Value) {
        self.queue(request, Ack::err(error));
    }

    /// Answer `request` from its payload, taking precedence over queued answers
    pub fn respond_with(
        &self,
        request: &str,
        handler: impl Fn(&Value) -> Ack + Send + Sync + 'static,
    ) {
        self.handlers
            .lock()
            .insert(request.to_string(), Box::new(handler));
    }

    fn queue(&self, request: &str, ack: Ack) {
        self.responses
            .lock()
            .entry(request.to_string())
            .or_default()
            .push_back(ack);
    }

    /// Hold every `request` until [`Self::release`] is called
    pub fn hold(&self, request: &str) {
        self.holds
            .lock()
            .insert(request.to_string(), Arc::new(Notify::new()));
    }

    pub fn release(&self, request: &str) {
        if let Some(gate) = self.holds.lock().remove(request) {
            gate.notify_one();
        }
    }

    /// Deliver a push event on the open socket
    pub fn push(&self, event: &str, payload: Value) {
        self.send(ChannelEvent::Push {
            event: event.to_string(),
            payload,
        });
    }

    pub fn send(&self, event: ChannelEvent) {
        if let Some(events) = self.events.lock().as_ref() {
            let _ = events.send(event);
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn call_count(&self, request: &str) -> usize {
        self.calls.lock().iter().filter(|(name, _)| name == request).count()
    }

    pub fn payloads(&self, request: &str) -> Vec<Value> {
        self.calls
            .lock()
            .iter()
            .filter(|(name, _)| name == request)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub async fn wait_for_open(&self) {
        wait_until(|| self.events.lock().is_some()).await;
    }

    pub async fn wait_for_call(&self, request: &str) {
        wait_until(|| self.call_count(request) > 0).await;
    }

    fn answer(&self, request: &str, payload: &Value) -> Ack {
        if let Some(handler) = self.handlers.lock().get(request) {
            return handler(payload);
        }
        let mut responses = self.responses.lock();
        match responses.get_mut(request) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
            Some(queue) => queue.front().cloned().unwrap_or_default(),
            None => Ack::ok(json!({})),
        }
    }
}

#[async_trait]
impl SignalingTransport for FakeSignaling {
    async fn open(&self) -> Result<mpsc::UnboundedReceiver<ChannelEvent>> {
        if let Some(reason) = self.open_error.lock().clone() {
            return Err(Error::Transport(reason));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(client_id) = self.welcome_id.lock().clone() {
            let _ = tx.send(ChannelEvent::Connected);
            let _ = tx.send(ChannelEvent::Push {
                event: EVENT_MESSAGE.to_string(),
                payload: json!({"type": "welcome", "id": client_id}),
            });
        }
        *self.events.lock() = Some(tx);
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }

    async fn close(&self) {
        self.events.lock().take();
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    async fn emit(&self, event: &str, payload: Value) -> Result<Ack> {
        self.calls.lock().push((event.to_string(), payload.clone()));

        let gate = self.holds.lock().get(event).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        Ok(self.answer(event, &payload))
    }

    fn socket_id(&self) -> Option<String> {
        self.socket_id.lock().clone()
    }
}

pub struct FakeTrack {
    id: String,
    kind: MediaKind,
}

impl FakeTrack {
    pub fn new(id: &str, kind: MediaKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            kind,
        })
    }
}

impl RemoteTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }
}

pub struct FakeConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    track: Arc<FakeTrack>,
    closed: AtomicBool,
    close_gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeConsumer {
    pub fn new(id: &str, producer_id: &str, kind: MediaKind) -> Arc<Self> {
        Arc::new(Self {
            id: ConsumerId::from(id),
            producer_id: ProducerId::from(producer_id),
            kind,
            track: FakeTrack::new(&format!("track-{id}"), kind),
            closed: AtomicBool::new(false),
            close_gate: Mutex::new(None),
        })
    }

    /// The next `close` marks the consumer closed and then waits for the
    /// returned gate. Later closes return at once.
    pub fn hold_close(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.close_gate.lock() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl Consumer for FakeConsumer {
    fn id(&self) -> &ConsumerId {
        &self.id
    }

    fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track(&self) -> Arc<dyn RemoteTrack> {
        self.track.clone()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let gate = self.close_gate.lock().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Receive transport that connects on its first consume, like a real engine
pub struct FakeRecvTransport {
    id: TransportId,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    connected: tokio::sync::Mutex<bool>,
    failing_kinds: Arc<Mutex<HashSet<MediaKind>>>,
    consumers: Mutex<Vec<Arc<FakeConsumer>>>,
    closed: AtomicBool,
}

impl FakeRecvTransport {
    fn new(id: TransportId, failing_kinds: Arc<Mutex<HashSet<MediaKind>>>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            connected: tokio::sync::Mutex::new(false),
            failing_kinds,
            consumers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Raise a `connect` event and wait for the application's answer
    pub async fn request_connect(&self, dtls_parameters: Value) -> std::result::Result<(), String> {
        let (responder, answer) = oneshot::channel();
        self.events_tx
            .send(TransportEvent::Connect {
                dtls_parameters,
                responder,
            })
            .map_err(|_| "transport events dropped".to_string())?;
        answer
            .await
            .map_err(|_| "connect answer dropped".to_string())?
    }

    pub fn emit_state(&self, state: RTCPeerConnectionState) {
        let _ = self.events_tx.send(TransportEvent::ConnectionStateChange(state));
    }

    pub fn consumers(&self) -> Vec<Arc<FakeConsumer>> {
        self.consumers.lock().clone()
    }
}

#[async_trait]
impl RecvTransport for FakeRecvTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().take()
    }

    async fn consume(&self, options: ConsumerOptions) -> Result<Arc<dyn Consumer>> {
        if self.is_closed() {
            return Err(Error::Media("transport closed".to_string()));
        }
        if self.failing_kinds.lock().contains(&options.kind) {
            return Err(Error::Media(format!("cannot decode {}", options.kind)));
        }

        {
            let mut connected = self.connected.lock().await;
            if !*connected {
                self.emit_state(RTCPeerConnectionState::Connecting);
                if let Err(err) = self.request_connect(json!({"role": "client"})).await {
                    self.emit_state(RTCPeerConnectionState::Failed);
                    return Err(Error::Media(err));
                }
                *connected = true;
                self.emit_state(RTCPeerConnectionState::Connected);
            }
        }

        let consumer = FakeConsumer::new(
            options.id.as_str(),
            options.producer_id.as_str(),
            options.kind,
        );
        self.consumers.lock().push(consumer.clone());
        Ok(consumer)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let consumers = self.consumers();
        for consumer in consumers {
            consumer.close().await;
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct FakeMediaDevice {
    loaded: AtomicBool,
    failing_kinds: Arc<Mutex<HashSet<MediaKind>>>,
    transports: Mutex<Vec<Arc<FakeRecvTransport>>>,
}

impl FakeMediaDevice {
    fn with_failing_kinds(failing_kinds: Arc<Mutex<HashSet<MediaKind>>>) -> Arc<Self> {
        Arc::new(Self {
            loaded: AtomicBool::new(false),
            failing_kinds,
            transports: Mutex::new(Vec::new()),
        })
    }

    /// A device that already holds router capabilities
    pub fn loaded() -> Arc<Self> {
        let device = Self::with_failing_kinds(Arc::default());
        device.loaded.store(true, Ordering::SeqCst);
        device
    }

    pub fn last_transport(&self) -> Option<Arc<FakeRecvTransport>> {
        self.transports.lock().last().cloned()
    }

    pub fn transports(&self) -> Vec<Arc<FakeRecvTransport>> {
        self.transports.lock().clone()
    }
}

#[async_trait]
impl MediaDevice for FakeMediaDevice {
    async fn load(&self, _router_rtp_capabilities: Value) -> Result<()> {
        if self.loaded.swap(true, Ordering::SeqCst) {
            return Err(Error::Media("device already loaded".to_string()));
        }
        Ok(())
    }

    fn rtp_capabilities(&self) -> Option<Value> {
        self.loaded
            .load(Ordering::SeqCst)
            .then(|| json!({"codecs": [{"kind": "audio", "mimeType": "audio/opus"}]}))
    }

    async fn create_recv_transport(
        &self,
        params: TransportParameters,
    ) -> Result<Arc<dyn RecvTransport>> {
        let transport = FakeRecvTransport::new(params.id, self.failing_kinds.clone());
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

#[derive(Default)]
pub struct FakeDeviceFactory {
    failing_kinds: Arc<Mutex<HashSet<MediaKind>>>,
    devices: Mutex<Vec<Arc<FakeMediaDevice>>>,
}

impl FakeDeviceFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every transport refuses to consume `kind`
    pub fn fail_kind(&self, kind: MediaKind) {
        self.failing_kinds.lock().insert(kind);
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().len()
    }

    /// Transports created across every device, oldest first
    pub fn transports(&self) -> Vec<Arc<FakeRecvTransport>> {
        self.devices
            .lock()
            .iter()
            .flat_map(|device| device.transports())
            .collect()
    }

    pub fn last_transport(&self) -> Option<Arc<FakeRecvTransport>> {
        self.transports().last().cloned()
    }
}

impl DeviceFactory for FakeDeviceFactory {
    fn create(&self) -> Result<Arc<dyn MediaDevice>> {
        let device = FakeMediaDevice::with_failing_kinds(self.failing_kinds.clone());
        self.devices.lock().push(device.clone());
        Ok(device)
    }
}

#[derive(Default)]
pub struct FakeSink {
    volumes: Mutex<Vec<f32>>,
    source: Mutex<Option<MediaStream>>,
    foreign_source: AtomicBool,
    fail_play: bool,
    playing: AtomicBool,
    plays: AtomicUsize,
    destroyed: AtomicBool,
}

impl FakeSink {
    pub fn volumes(&self) -> Vec<f32> {
        self.volumes.lock().clone()
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    pub fn play_count(&self) -> usize {
        self.plays.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn track_ids(&self) -> Vec<String> {
        self.source
            .lock()
            .as_ref()
            .map(|stream| stream.tracks().iter().map(|t| t.id().to_string()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AudioSink for FakeSink {
    fn attach_source(&self, stream: MediaStream) {
        *self.source.lock() = Some(stream);
    }

    fn detach_source(&self) {
        self.source.lock().take();
        self.foreign_source.store(false, Ordering::SeqCst);
    }

    fn has_source(&self) -> bool {
        self.foreign_source.load(Ordering::SeqCst) || self.source.lock().is_some()
    }

    fn set_volume(&self, volume: f32) {
        self.volumes.lock().push(volume);
    }

    async fn play(&self) -> Result<()> {
        self.plays.fetch_add(1, Ordering::SeqCst);
        if self.fail_play {
            return Err(Error::Media("autoplay blocked".to_string()));
        }
        self.playing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn pause(&self) {
        self.playing.store(false, Ordering::SeqCst);
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeSinkFactory {
    fail_play: bool,
    preattached: AtomicBool,
    sinks: Mutex<HashMap<ClientId, Arc<FakeSink>>>,
    created: AtomicUsize,
}

impl FakeSinkFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sinks whose `play` is always refused
    pub fn failing_play() -> Arc<Self> {
        Arc::new(Self {
            fail_play: true,
            ..Self::default()
        })
    }

    /// New sinks come with a source the registry did not attach
    pub fn preattach_source(&self) {
        self.preattached.store(true, Ordering::SeqCst);
    }

    /// Most recent sink created for `key`
    pub fn sink(&self, key: &ClientId) -> Option<Arc<FakeSink>> {
        self.sinks.lock().get(key).cloned()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl SinkFactory for FakeSinkFactory {
    fn create(&self, key: &ClientId) -> Result<Arc<dyn AudioSink>> {
        let sink = Arc::new(FakeSink {
            fail_play: self.fail_play,
            foreign_source: AtomicBool::new(self.preattached.load(Ordering::SeqCst)),
            ..FakeSink::default()
        });
        self.sinks.lock().insert(key.clone(), sink.clone());
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(sink)
    }
}
