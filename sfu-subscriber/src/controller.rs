//! Subscription orchestration
//!
//! [`ConsumptionController`] drives one subscriber session end to end:
//! signaling connect, capability negotiation, receive transport, one consumer
//! per configured media kind, and playback through the sink registry. It also
//! reacts to `newProducer` / `producerClosed` pushes from the server.
//!
//! Every continuation re-checks the session epoch after each suspension
//! point. `disconnect` bumps the epoch, so work started for a torn-down session
//! finishes without side effects instead of resurrecting it.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SubscriberConfig;
use crate::consumer::{ConsumerInfo, ConsumerOptions, ConsumerRegistry};
use crate::device::{CapabilityNegotiator, DeviceFactory};
use crate::error::{Error, Result};
use crate::kind_queue::KindQueue;
use crate::session::{shared_session, Session, SharedSession};
use crate::signaling::messages::{
    ConsumeRequest, ConsumeResponse, NewProducer, ProducerClosed, CONSUME,
    CREATE_CONSUMER_TRANSPORT, EVENT_NEW_PRODUCER, EVENT_PRODUCER_CLOSED,
    GET_ROUTER_RTP_CAPABILITIES,
};
use crate::signaling::{PushEvent, SignalingChannel, SignalingTransport};
use crate::sink::{RemoteMediaSinkRegistry, SinkFactory};
use crate::transport::{ConsumerTransportManager, TransportState};
use crate::types::{ClientId, MediaKind, TransportId};

/// Externally observable progress of the subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "kinds", rename_all = "snake_case")]
pub enum SubscriberState {
    Idle,
    ChannelConnecting,
    CapabilitiesLoaded,
    TransportReady,
    /// At least one consumer is live; lists the kinds being received
    Consuming(Vec<MediaKind>),
    TransportFailed,
    Closed,
}

/// What happened to one media kind during `subscribe`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum KindOutcome {
    Consuming(ConsumerInfo),
    /// The server has no producer of this kind yet
    NoProducer,
    Failed { error: String },
}

/// Result of a `subscribe` call
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeReport {
    pub client_id: ClientId,
    pub transport_id: TransportId,
    pub outcomes: Vec<(MediaKind, KindOutcome)>,
}

impl SubscribeReport {
    #[must_use]
    pub fn outcome(&self, kind: MediaKind) -> Option<&KindOutcome> {
        self.outcomes
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, outcome)| outcome)
    }
}

struct ControllerInner {
    config: SubscriberConfig,
    session: SharedSession,
    channel: Arc<SignalingChannel>,
    negotiator: CapabilityNegotiator,
    transports: ConsumerTransportManager,
    consumers: ConsumerRegistry,
    sinks: RemoteMediaSinkRegistry,
    queue: KindQueue,
    /// Serializes `subscribe` calls
    lifecycle: tokio::sync::Mutex<()>,
    epoch: AtomicU64,
    state: watch::Sender<SubscriberState>,
    listener: Mutex<Option<CancellationToken>>,
}

/// Subscriber session controller
pub struct ConsumptionController {
    inner: Arc<ControllerInner>,
}

impl ConsumptionController {
    pub fn new(
        config: SubscriberConfig,
        signaling: Arc<dyn SignalingTransport>,
        devices: Arc<dyn DeviceFactory>,
        sink_factory: Arc<dyn SinkFactory>,
    ) -> Self {
        let session = shared_session();
        let channel = Arc::new(SignalingChannel::new(
            signaling,
            session.clone(),
            config.signaling.clone(),
        ));
        let transports = ConsumerTransportManager::new(channel.clone(), session.clone());
        let sinks = RemoteMediaSinkRegistry::new(sink_factory, config.playback.volume);
        let (state, _) = watch::channel(SubscriberState::Idle);

        Self {
            inner: Arc::new(ControllerInner {
                config,
                session,
                channel,
                negotiator: CapabilityNegotiator::new(devices),
                transports,
                consumers: ConsumerRegistry::new(),
                sinks,
                queue: KindQueue::new(),
                lifecycle: tokio::sync::Mutex::new(()),
                epoch: AtomicU64::new(0),
                state,
                listener: Mutex::new(None),
            }),
        }
    }

    /// Connect if needed and start consuming every configured media kind.
    ///
    /// Safe to call repeatedly: steps that are already done are skipped and
    /// kinds with a live consumer are left alone. A failure for one kind is
    /// reported in the outcome list without affecting the others.
    pub async fn subscribe(&self) -> Result<SubscribeReport> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;
        self.ensure_listener();

        let epoch = inner.current_epoch();
        let mut fresh_session = false;

        if !inner.channel.is_connected() {
            inner.set_state(SubscriberState::ChannelConnecting);
            let connected = inner.channel.connect().await;
            if let Err(err) = inner.settle(epoch, connected).await {
                if !matches!(err, Error::SessionClosed) {
                    error!(error = %err, "subscribe aborted: signaling connect failed");
                    inner.set_state(SubscriberState::Idle);
                }
                return Err(err);
            }
            inner.negotiator.reset();
            fresh_session = true;
        }

        let client_id = inner.channel.client_id().ok_or(Error::NotConnected)?;

        if !inner.negotiator.is_loaded() {
            let capabilities = inner
                .channel
                .request(GET_ROUTER_RTP_CAPABILITIES, json!({}))
                .await;
            let capabilities = match inner.settle(epoch, capabilities).await {
                Ok(capabilities) => capabilities,
                Err(Error::SessionClosed) => return Err(Error::SessionClosed),
                Err(err) => {
                    error!(
                        request = GET_ROUTER_RTP_CAPABILITIES,
                        error = %err,
                        "subscribe aborted: capability request failed"
                    );
                    inner.refresh_state();
                    return Err(err);
                }
            };

            let loaded = inner.negotiator.load_device(capabilities).await;
            match inner.settle(epoch, loaded).await {
                Ok(_) => {}
                Err(Error::SessionClosed) => return Err(Error::SessionClosed),
                Err(err) => {
                    error!(
                        error = %err,
                        terminal = err.is_terminal(),
                        "subscribe aborted: device load failed"
                    );
                    inner.refresh_state();
                    return Err(err);
                }
            }
        }
        inner.set_state(SubscriberState::CapabilitiesLoaded);

        if fresh_session || !inner.transports.is_usable() {
            if inner.transports.current().is_some() {
                inner.release_media().await;
            }
            let device = inner.negotiator.device().ok_or(Error::NotConnected)?;
            let created = inner.transports.create(device.as_ref()).await;
            match inner.settle(epoch, created).await {
                Ok(_) => {}
                Err(Error::SessionClosed) => return Err(Error::SessionClosed),
                Err(err) => {
                    error!(
                        request = CREATE_CONSUMER_TRANSPORT,
                        error = %err,
                        "subscribe aborted: receive transport not created"
                    );
                    inner.refresh_state();
                    return Err(err);
                }
            }
        }
        let transport_id = inner
            .transports
            .current()
            .map(|transport| transport.id().clone())
            .ok_or_else(|| Error::Media("receive transport missing".to_string()))?;
        inner.set_state(SubscriberState::TransportReady);

        let kinds: Vec<MediaKind> = inner
            .config
            .consume
            .kinds
            .iter()
            .copied()
            .filter(|kind| !inner.consumers.has_live(*kind))
            .collect();

        let results = futures::future::join_all(
            kinds
                .iter()
                .map(|kind| inner.queue.run(*kind, inner.consume_locked(*kind, epoch))),
        )
        .await;
        inner.settle(epoch, Ok(())).await?;

        let mut outcomes = Vec::with_capacity(kinds.len());
        for (kind, result) in kinds.into_iter().zip(results) {
            let outcome = match result {
                Ok(Some(info)) => KindOutcome::Consuming(info),
                Ok(None) => KindOutcome::NoProducer,
                Err(Error::SessionClosed) => return Err(Error::SessionClosed),
                Err(err) => {
                    warn!(kind = %kind, error = %err, "consume failed");
                    KindOutcome::Failed {
                        error: err.to_string(),
                    }
                }
            };
            outcomes.push((kind, outcome));
        }
        inner.refresh_state();

        info!(
            client_id = %client_id,
            transport_id = %transport_id,
            consumers = inner.consumers.live_count(),
            "subscribe finished"
        );

        Ok(SubscribeReport {
            client_id,
            transport_id,
            outcomes,
        })
    }

    /// Consume `kind` from the current transport.
    ///
    /// Returns `None` when the server has no producer of that kind yet.
    pub async fn consume(&self, kind: MediaKind) -> Result<Option<ConsumerInfo>> {
        let inner = &self.inner;
        let epoch = inner.current_epoch();
        inner.queue.run(kind, inner.consume_locked(kind, epoch)).await
    }

    /// Tear down the whole session. Idempotent.
    pub async fn disconnect(&self) {
        self.inner.teardown().await;
        self.inner.set_state(SubscriberState::Closed);
        info!("subscriber disconnected");
    }

    #[must_use]
    pub fn state(&self) -> SubscriberState {
        self.inner.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SubscriberState> {
        self.inner.state.subscribe()
    }

    /// Snapshot of the session context
    #[must_use]
    pub fn session(&self) -> Session {
        self.inner.session.read().clone()
    }

    #[must_use]
    pub fn client_id(&self) -> Option<ClientId> {
        self.inner.channel.client_id()
    }

    #[must_use]
    pub fn consumers(&self) -> Vec<ConsumerInfo> {
        self.inner.consumers.info()
    }

    #[must_use]
    pub fn sinks(&self) -> &RemoteMediaSinkRegistry {
        &self.inner.sinks
    }

    /// Start the push-event listener once per controller
    fn ensure_listener(&self) {
        let mut listener = self.inner.listener.lock();
        if listener.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let pushes = self.inner.channel.subscribe_all();
        let transport_state = self.inner.transports.watch_state();

        tokio::spawn(run_listener(
            Arc::downgrade(&self.inner),
            pushes,
            transport_state,
            cancel.clone(),
        ));
        *listener = Some(cancel);
    }
}

impl Drop for ConsumptionController {
    fn drop(&mut self) {
        if let Some(cancel) = self.inner.listener.lock().take() {
            cancel.cancel();
        }
    }
}

impl ControllerInner {
    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.current_epoch() == epoch
    }

    /// Pass `result` through unless the session was torn down since `epoch`
    /// was read. A stale continuation releases whatever it created after the
    /// teardown and fails with [`Error::SessionClosed`].
    async fn settle<T>(&self, epoch: u64, result: Result<T>) -> Result<T> {
        if self.is_current(epoch) {
            return result;
        }
        debug!(epoch, "session torn down while subscribing");
        self.release_session().await;
        self.set_state(SubscriberState::Closed);
        Err(Error::SessionClosed)
    }

    fn set_state(&self, state: SubscriberState) {
        self.state.send_replace(state);
    }

    fn refresh_state(&self) {
        let kinds = self.consumers.kinds();
        let state = if self.transports.state() == TransportState::Failed {
            SubscriberState::TransportFailed
        } else if !kinds.is_empty() {
            SubscriberState::Consuming(kinds)
        } else if self.transports.current().is_some() {
            SubscriberState::TransportReady
        } else if self.channel.is_connected() && self.negotiator.is_loaded() {
            SubscriberState::CapabilitiesLoaded
        } else {
            SubscriberState::Idle
        };
        self.set_state(state);
    }

    async fn consume_locked(&self, kind: MediaKind, epoch: u64) -> Result<Option<ConsumerInfo>> {
        let Some(transport) = self.transports.current() else {
            debug!(kind = %kind, "no receive transport, skipping consume");
            return Ok(None);
        };
        if !self.transports.is_usable() {
            return Err(Error::Media(format!(
                "receive transport {} is {:?}",
                transport.id(),
                self.transports.state()
            )));
        }
        let Some(capabilities) = self.negotiator.rtp_capabilities() else {
            return Err(Error::Media("device capabilities not loaded".to_string()));
        };

        let request = ConsumeRequest {
            rtp_capabilities: serde_json::to_string(&capabilities)?,
            kind,
        };
        let response: ConsumeResponse = self.channel.request_typed(CONSUME, &request).await?;
        if !self.is_current(epoch) {
            return Err(Error::SessionClosed);
        }

        let Some(producer_id) = response.producer_id else {
            info!(kind = %kind, "remote producer not ready");
            return Ok(None);
        };
        let id = response.id.ok_or_else(|| Error::Protocol {
            request: CONSUME.to_string(),
            message: "consumer descriptor without id".to_string(),
        })?;

        let options = ConsumerOptions {
            id,
            producer_id,
            kind: response.kind.unwrap_or(kind),
            rtp_parameters: response.rtp_parameters.unwrap_or(Value::Null),
            codec_options: json!({}),
        };
        let consumer = transport.consume(options).await?;

        if !self.is_current(epoch) || transport.is_closed() {
            consumer.close().await;
            return Err(Error::SessionClosed);
        }

        let track = consumer.track();
        let installed_kind = consumer.kind();
        if let Some(previous) = self.consumers.close_kind(installed_kind).await {
            self.detach_local_track(&previous.track_id);
        }
        let info = self.consumers.install(consumer).await;
        if !self.is_current(epoch) {
            self.consumers.close_kind(installed_kind).await;
            return Err(Error::SessionClosed);
        }

        match self.channel.client_id() {
            Some(key) => {
                if let Err(err) = self.sinks.bind(&key, track).await {
                    error!(kind = %kind, error = %err, "failed to bind media sink");
                }
                if !self.is_current(epoch) {
                    self.consumers.close_kind(installed_kind).await;
                    self.sinks.remove(&key);
                    return Err(Error::SessionClosed);
                }
            }
            None => warn!(kind = %kind, "no client identity to key the media sink"),
        }

        self.refresh_state();
        Ok(Some(info))
    }

    /// Our own consumers feed the sink keyed by the local identity
    fn detach_local_track(&self, track_id: &str) {
        if let Some(key) = self.channel.client_id() {
            self.sinks.detach_track(&key, track_id);
        }
    }

    /// Producer events are handled one at a time in arrival order
    async fn handle_push(&self, push: PushEvent) {
        match push.event.as_str() {
            EVENT_NEW_PRODUCER => match serde_json::from_value::<NewProducer>(push.payload) {
                Ok(event) => self.handle_new_producer(event).await,
                Err(err) => warn!(error = %err, "malformed newProducer event"),
            },
            EVENT_PRODUCER_CLOSED => match serde_json::from_value::<ProducerClosed>(push.payload) {
                Ok(event) => self.handle_producer_closed(event).await,
                Err(err) => warn!(error = %err, "malformed producerClosed event"),
            },
            _ => {}
        }
    }

    async fn handle_new_producer(&self, event: NewProducer) {
        let kind = event.kind;
        if self.transports.current().is_none() {
            info!(kind = %kind, "new producer before transport exists, ignoring");
            return;
        }
        if !self.transports.is_usable() {
            warn!(
                kind = %kind,
                transport_state = ?self.transports.state(),
                "new producer while receive transport is unusable, waiting for subscribe"
            );
            return;
        }

        let epoch = self.current_epoch();
        match self.queue.run(kind, self.consume_locked(kind, epoch)).await {
            Ok(Some(info)) => info!(kind = %kind, consumer_id = %info.id, "consuming new producer"),
            Ok(None) => debug!(kind = %kind, "new producer announced but not consumable yet"),
            Err(err) => warn!(kind = %kind, error = %err, "failed to consume new producer"),
        }
    }

    async fn handle_producer_closed(&self, event: ProducerClosed) {
        let kind = event.kind;
        info!(
            kind = %kind,
            local_id = event.local_id.as_deref().unwrap_or("-"),
            remote_id = event.remote_id.as_ref().map_or("-", ClientId::as_str),
            "producer closed"
        );
        self.queue
            .run(kind, async {
                if let Some(info) = self.consumers.close_kind(kind).await {
                    debug!(
                        kind = %kind,
                        consumer_id = %info.id,
                        "released consumer of closed producer"
                    );
                    self.detach_local_track(&info.track_id);
                }

                match &event.remote_id {
                    Some(remote_id) => {
                        self.sinks.remove(remote_id);
                    }
                    None => {
                        let removed = self.sinks.remove_all();
                        info!(removed, "remote session ended, released all sinks");
                    }
                }
            })
            .await;
        self.refresh_state();
    }

    async fn release_media(&self) {
        self.consumers.close_all().await;
        self.transports.close().await;
        self.sinks.remove_all();
    }

    async fn release_session(&self) {
        self.release_media().await;
        self.negotiator.reset();
        self.channel.disconnect().await;
    }

    async fn teardown(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.release_session().await;
    }
}

async fn run_listener(
    inner: Weak<ControllerInner>,
    mut pushes: broadcast::Receiver<PushEvent>,
    mut transport_state: watch::Receiver<TransportState>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,
            push = pushes.recv() => {
                let push = match push {
                    Ok(push) => push,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "push event listener lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(inner) = inner.upgrade() else { break };
                inner.handle_push(push).await;
            }
            changed = transport_state.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *transport_state.borrow_and_update();
                let Some(inner) = inner.upgrade() else { break };
                if state == TransportState::Failed {
                    error!("receive transport failed, media stopped until next subscribe");
                    inner.set_state(SubscriberState::TransportFailed);
                }
            }
        }
    }
    debug!("push event listener stopped");
}
