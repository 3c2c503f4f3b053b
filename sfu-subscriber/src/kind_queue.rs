//! Per-kind serialization of consume operations
//!
//! Work submitted for the same media kind runs one at a time in submission
//! order; different kinds proceed concurrently. Unlike a singleflight, a
//! queued call is never merged with the running one: each call runs its own
//! work after its predecessors finish.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::types::MediaKind;

#[derive(Default)]
pub struct KindQueue {
    slots: DashMap<MediaKind, Arc<Mutex<()>>>,
}

impl KindQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` once every earlier call for `kind` has completed
    pub async fn run<F, T>(&self, kind: MediaKind, work: F) -> T
    where
        F: Future<Output = T>,
    {
        let slot = self
            .slots
            .entry(kind)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        // tokio's mutex hands the lock out in FIFO order.
        let _turn = slot.lock().await;
        work.await
    }
}
