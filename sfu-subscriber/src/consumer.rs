//! Consumers and the per-kind consumer registry

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use crate::types::{ConsumerId, MediaKind, ProducerId};

/// Media track delivered by a consumer
pub trait RemoteTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
}

/// Local receiving endpoint bound to one remote producer
#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> &ConsumerId;
    fn producer_id(&self) -> &ProducerId;
    fn kind(&self) -> MediaKind;
    fn track(&self) -> Arc<dyn RemoteTrack>;

    /// Stop receiving. Safe to call more than once.
    async fn close(&self);
    fn is_closed(&self) -> bool;
}

/// Everything the media engine needs to build a consumer
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub codec_options: Value,
}

/// Snapshot of a live consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    /// Id of the track the consumer feeds into its sink
    pub track_id: String,
}

impl ConsumerInfo {
    fn of(consumer: &dyn Consumer) -> Self {
        Self {
            id: consumer.id().clone(),
            producer_id: consumer.producer_id().clone(),
            kind: consumer.kind(),
            track_id: consumer.track().id().to_string(),
        }
    }
}

/// At most one live consumer per media kind
#[derive(Default)]
pub struct ConsumerRegistry {
    consumers: DashMap<MediaKind, Arc<dyn Consumer>>,
}

impl ConsumerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `consumer` as the live consumer of its kind.
    ///
    /// A previous consumer of the same kind is closed first.
    pub async fn install(&self, consumer: Arc<dyn Consumer>) -> ConsumerInfo {
        let kind = consumer.kind();
        if let Some((_, previous)) = self.consumers.remove(&kind) {
            debug!(kind = %kind, consumer_id = %previous.id(), "replacing consumer");
            previous.close().await;
        }

        let info = ConsumerInfo::of(consumer.as_ref());
        self.consumers.insert(kind, consumer);
        info!(
            kind = %kind,
            consumer_id = %info.id,
            producer_id = %info.producer_id,
            "consumer installed"
        );
        info
    }

    /// Close and forget the consumer of `kind`, if any
    pub async fn close_kind(&self, kind: MediaKind) -> Option<ConsumerInfo> {
        let (_, consumer) = self.consumers.remove(&kind)?;
        let info = ConsumerInfo::of(consumer.as_ref());
        consumer.close().await;
        info!(kind = %kind, consumer_id = %info.id, "consumer closed");
        Some(info)
    }

    /// Close every consumer; returns how many were live
    pub async fn close_all(&self) -> usize {
        let kinds = self.kinds();
        let mut closed = 0;
        for kind in kinds {
            if self.close_kind(kind).await.is_some() {
                closed += 1;
            }
        }
        closed
    }

    #[must_use]
    pub fn has_live(&self, kind: MediaKind) -> bool {
        self.consumers
            .get(&kind)
            .is_some_and(|consumer| !consumer.is_closed())
    }

    #[must_use]
    pub fn get(&self, kind: MediaKind) -> Option<Arc<dyn Consumer>> {
        self.consumers.get(&kind).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn info(&self) -> Vec<ConsumerInfo> {
        let mut infos: Vec<_> = self
            .consumers
            .iter()
            .map(|entry| ConsumerInfo::of(entry.value().as_ref()))
            .collect();
        infos.sort_by_key(|info| info.kind);
        infos
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.consumers
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .count()
    }

    #[must_use]
    pub fn kinds(&self) -> Vec<MediaKind> {
        let mut kinds: Vec<_> = self.consumers.iter().map(|entry| *entry.key()).collect();
        kinds.sort();
        kinds
    }
}
