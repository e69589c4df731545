//! Session handle

use crate::aggregator::{CacheLookup, PublishOutcome, VerticalAggregator};
use crate::error::{VstoreError, VstoreResult};
use crate::model::{CacheEntry, ContentHash, PathSet, StrongFingerprint, WeakFingerprint};
use crate::session::CancelScope;
use crate::store::{ContentReader, PinOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Open,
    Cancelled,
    Closed,
}

/// One bounded unit of aggregator usage.
///
/// A session does not keep the aggregator alive. It owns a cancellation
/// scope and the pins taken through it, which are released on close.
pub struct Session {
    id: Uuid,
    opened_at: DateTime<Utc>,
    aggregator: Weak<VerticalAggregator>,
    cancel: CancelScope,
    pins: Mutex<HashMap<ContentHash, usize>>,
    closed: AtomicBool,
}

impl Session {
    pub(crate) fn new(aggregator: Weak<VerticalAggregator>) -> Self {
        let session = Self {
            id: Uuid::new_v4(),
            opened_at: Utc::now(),
            aggregator,
            cancel: CancelScope::new(),
            pins: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        };
        debug!(session = %session.id, "session opened");
        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn status(&self) -> SessionStatus {
        if self.closed.load(Ordering::SeqCst) {
            SessionStatus::Closed
        } else if self.cancel.is_cancelled() {
            SessionStatus::Cancelled
        } else {
            SessionStatus::Open
        }
    }

    /// Cancellation scope shared by this session's operations
    pub fn cancel_scope(&self) -> &CancelScope {
        &self.cancel
    }

    /// Cancel every operation running under this session. This caller stops
    /// waiting; work shared with other sessions runs on for them.
    pub fn cancel(&self) {
        debug!(session = %self.id, "session cancelled");
        self.cancel.cancel();
    }

    pub async fn get_cache_entries(&self, weak: WeakFingerprint) -> VstoreResult<CacheLookup> {
        let aggregator = self.aggregator()?;
        self.scoped(aggregator.get_cache_entries(weak)).await
    }

    pub async fn get_cache_entry(&self, fingerprint: StrongFingerprint) -> VstoreResult<CacheLookup> {
        let aggregator = self.aggregator()?;
        self.scoped(aggregator.get_cache_entry(fingerprint)).await
    }

    pub async fn add_or_get(
        &self,
        fingerprint: StrongFingerprint,
        entry: CacheEntry,
    ) -> VstoreResult<PublishOutcome> {
        let aggregator = self.aggregator()?;
        self.scoped(aggregator.add_or_get(fingerprint, entry)).await
    }

    /// Pin content in the local tier for the rest of this session
    pub async fn pin_to_cas(&self, hash: ContentHash) -> VstoreResult<PinOutcome> {
        let aggregator = self.aggregator()?;
        self.scoped(async {
            let outcome = aggregator.pin_to_cas(hash).await?;
            if outcome == PinOutcome::Pinned {
                *self.lock_pins().entry(hash).or_insert(0) += 1;
            }
            Ok(outcome)
        })
        .await
    }

    /// Release one pin taken through this session
    pub async fn release(&self, hash: ContentHash) -> VstoreResult<()> {
        let aggregator = self.aggregator()?;
        {
            let mut pins = self.lock_pins();
            match pins.get_mut(&hash) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    pins.remove(&hash);
                }
                None => return Ok(()),
            }
        }
        aggregator.unpin(&hash).await
    }

    pub async fn get_content(&self, hash: ContentHash) -> VstoreResult<Option<Vec<u8>>> {
        let aggregator = self.aggregator()?;
        self.scoped(aggregator.get_content(hash)).await
    }

    pub async fn get_stream(&self, hash: ContentHash) -> VstoreResult<Option<ContentReader>> {
        let aggregator = self.aggregator()?;
        self.scoped(aggregator.get_stream(hash)).await
    }

    pub async fn put(&self, bytes: &[u8]) -> VstoreResult<ContentHash> {
        let aggregator = self.aggregator()?;
        self.scoped(aggregator.put(bytes)).await
    }

    pub async fn put_path_set(&self, path_set: &PathSet) -> VstoreResult<ContentHash> {
        let aggregator = self.aggregator()?;
        self.scoped(aggregator.put_path_set(path_set)).await
    }

    pub async fn get_path_set(&self, hash: ContentHash) -> VstoreResult<Option<PathSet>> {
        let aggregator = self.aggregator()?;
        self.scoped(aggregator.get_path_set(hash)).await
    }

    /// Number of pins currently held through this session
    pub fn pinned_count(&self) -> usize {
        self.lock_pins().values().sum()
    }

    /// Close the session: cancel outstanding operations and release every pin.
    /// Closing twice is a no-op.
    pub async fn close(&self) -> VstoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();

        let pins = std::mem::take(&mut *self.lock_pins());
        let released: usize = pins.values().sum();
        if let Some(aggregator) = self.aggregator.upgrade() {
            release_pins(&aggregator, pins).await;
        }

        info!(session = %self.id, released, "session closed");
        Ok(())
    }

    fn aggregator(&self) -> VstoreResult<Arc<VerticalAggregator>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VstoreError::SessionClosed);
        }
        if self.cancel.is_cancelled() {
            return Err(VstoreError::Cancelled);
        }
        self.aggregator.upgrade().ok_or(VstoreError::SessionClosed)
    }

    /// Run an operation until it finishes or the session is cancelled
    async fn scoped<T, F>(&self, operation: F) -> VstoreResult<T>
    where
        F: Future<Output = VstoreResult<T>>,
    {
        tokio::select! {
            result = operation => result,
            _ = self.cancel.cancelled() => Err(VstoreError::Cancelled),
        }
    }

    fn lock_pins(&self) -> std::sync::MutexGuard<'_, HashMap<ContentHash, usize>> {
        self.pins.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn release_pins(aggregator: &VerticalAggregator, pins: HashMap<ContentHash, usize>) {
    for (hash, count) in pins {
        for _ in 0..count {
            if let Err(e) = aggregator.unpin(&hash).await {
                warn!(hash = %hash, "Failed to release pin: {}", e);
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let pins = std::mem::take(&mut *self.lock_pins());
        if pins.is_empty() {
            return;
        }
        let Some(aggregator) = self.aggregator.upgrade() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { release_pins(&aggregator, pins).await });
            }
            Err(_) => warn!(session = %self.id, "Session dropped outside a runtime; pins not released"),
        }
    }
}
