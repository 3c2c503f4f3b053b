//! Remote media sinks
//!
//! Each remote participant gets one playback sink, keyed by its client
//! identity. A sink starts muted and is raised to the configured volume only
//! after playback has actually started.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::consumer::RemoteTrack;
use crate::error::Result;
use crate::types::ClientId;

/// Ordered set of tracks rendered together by one sink
#[derive(Clone, Default)]
pub struct MediaStream {
    tracks: Arc<RwLock<Vec<Arc<dyn RemoteTrack>>>>,
}

impl MediaStream {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `track` unless a track with the same id is already present
    pub fn add_track(&self, track: Arc<dyn RemoteTrack>) -> bool {
        let mut tracks = self.tracks.write();
        if tracks.iter().any(|existing| existing.id() == track.id()) {
            return false;
        }
        tracks.push(track);
        true
    }

    /// Drop the track with `id`; false if it was not in the stream
    pub fn remove_track(&self, id: &str) -> bool {
        let mut tracks = self.tracks.write();
        let before = tracks.len();
        tracks.retain(|track| track.id() != id);
        tracks.len() != before
    }

    #[must_use]
    pub fn tracks(&self) -> Vec<Arc<dyn RemoteTrack>> {
        self.tracks.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tracks.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.read().is_empty()
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<String> = self
            .tracks
            .read()
            .iter()
            .map(|track| track.id().to_string())
            .collect();
        f.debug_struct("MediaStream").field("tracks", &ids).finish()
    }
}

/// Playback element owned by the embedding application
#[async_trait]
pub trait AudioSink: Send + Sync {
    fn attach_source(&self, stream: MediaStream);
    fn detach_source(&self);
    fn has_source(&self) -> bool;

    /// 0.0 (silent) to 1.0
    fn set_volume(&self, volume: f32);

    /// Start playback. May be refused, e.g. by an autoplay policy.
    async fn play(&self) -> Result<()>;
    fn pause(&self);

    /// Release the element; the sink is unusable afterwards
    fn destroy(&self);
}

pub trait SinkFactory: Send + Sync {
    fn create(&self, key: &ClientId) -> Result<Arc<dyn AudioSink>>;
}

struct RemoteSink {
    sink: Arc<dyn AudioSink>,
    source: Option<MediaStream>,
    bound: bool,
    generation: u64,
}

/// Pool of playback sinks, one per remote participant
pub struct RemoteMediaSinkRegistry {
    factory: Arc<dyn SinkFactory>,
    volume: f32,
    sinks: DashMap<ClientId, RemoteSink>,
    next_generation: AtomicU64,
}

impl RemoteMediaSinkRegistry {
    pub fn new(factory: Arc<dyn SinkFactory>, volume: f32) -> Self {
        Self {
            factory,
            volume: volume.clamp(0.0, 1.0),
            sinks: DashMap::new(),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Route `track` into the sink for `key`, creating the sink on first use.
    ///
    /// Tracks for a key that already has a stream are added to that stream.
    /// Playback is started muted; the configured volume is applied only once
    /// `play` succeeds.
    pub async fn bind(&self, key: &ClientId, track: Arc<dyn RemoteTrack>) -> Result<()> {
        let (sink, generation) = {
            let mut entry = match self.sinks.entry(key.clone()) {
                Entry::Occupied(entry) => entry.into_ref(),
                Entry::Vacant(entry) => {
                    let sink = self.factory.create(key)?;
                    sink.set_volume(0.0);
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "created media sink");
                    entry.insert(RemoteSink {
                        sink,
                        source: None,
                        bound: false,
                        generation,
                    })
                }
            };
            let remote = entry.value_mut();

            if let Some(source) = &remote.source {
                if source.add_track(track) {
                    debug!(key = %key, tracks = source.len(), "added track to existing stream");
                }
                return Ok(());
            }

            if remote.sink.has_source() {
                warn!(key = %key, "media sink already has a foreign source, leaving it alone");
                return Ok(());
            }

            let stream = MediaStream::new();
            stream.add_track(track);
            remote.sink.attach_source(stream.clone());
            remote.sink.set_volume(0.0);
            remote.source = Some(stream);
            (remote.sink.clone(), remote.generation)
        };

        match sink.play().await {
            Ok(()) => {
                if let Some(mut remote) = self.sinks.get_mut(key) {
                    if remote.generation == generation {
                        remote.sink.set_volume(self.volume);
                        remote.bound = true;
                        info!(key = %key, volume = self.volume, "remote media playing");
                    }
                }
            }
            Err(err) => {
                error!(key = %key, error = %err, "media playback failed");
            }
        }
        Ok(())
    }

    /// Stop and release the sink for `key`
    pub fn remove(&self, key: &ClientId) -> bool {
        let Some((_, remote)) = self.sinks.remove(key) else {
            return false;
        };
        release(&remote);
        info!(key = %key, "removed media sink");
        true
    }

    /// Take the track `track_id` out of the stream played by `key`.
    ///
    /// The sink itself stays, so a later track for the same key joins the
    /// stream that is already playing.
    pub fn detach_track(&self, key: &ClientId, track_id: &str) -> bool {
        let detached = self
            .sinks
            .get(key)
            .and_then(|remote| {
                remote
                    .source
                    .as_ref()
                    .map(|source| source.remove_track(track_id))
            })
            .unwrap_or(false);
        if detached {
            debug!(key = %key, track_id, "detached track from stream");
        }
        detached
    }

    /// Release every sink; returns how many were removed
    pub fn remove_all(&self) -> usize {
        let keys = self.keys();
        keys.iter().filter(|key| self.remove(key)).count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: &ClientId) -> bool {
        self.sinks.contains_key(key)
    }

    #[must_use]
    pub fn keys(&self) -> Vec<ClientId> {
        self.sinks.iter().map(|entry| entry.key().clone()).collect()
    }

    #[must_use]
    pub fn track_count(&self, key: &ClientId) -> usize {
        self.sinks
            .get(key)
            .and_then(|remote| remote.source.as_ref().map(MediaStream::len))
            .unwrap_or(0)
    }

    /// True once playback started and the volume was raised
    #[must_use]
    pub fn is_bound(&self, key: &ClientId) -> bool {
        self.sinks.get(key).is_some_and(|remote| remote.bound)
    }
}

fn release(remote: &RemoteSink) {
    remote.sink.pause();
    remote.sink.detach_source();
    remote.sink.destroy();
}
