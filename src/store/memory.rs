//! In-memory reference tier

use crate::error::VstoreResult;
use crate::model::{CacheEntry, ContentHash, FingerprintRecord, StrongFingerprint, Tier, WeakFingerprint};
use crate::store::{
    AddOrGet, ContentReader, ContentStore, FingerprintStore, PinOutcome, RecordStream, TierRepair,
};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::debug;

type Records = HashMap<WeakFingerprint, BTreeMap<StrongFingerprint, CacheEntry>>;

/// Tier held entirely in process memory.
///
/// Serves as the reference implementation of the tier contract and backs
/// most tests.
pub struct MemoryTier {
    role: Tier,
    blobs: RwLock<HashMap<ContentHash, Arc<Vec<u8>>>>,
    pins: Mutex<HashMap<ContentHash, usize>>,
    records: RwLock<Records>,
}

impl MemoryTier {
    /// Create an empty tier playing the given role
    pub fn new(role: Tier) -> Self {
        Self {
            role,
            blobs: RwLock::new(HashMap::new()),
            pins: Mutex::new(HashMap::new()),
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Store bytes under a hash without verifying it.
    ///
    /// Only useful for simulating corruption.
    pub fn insert_raw(&self, hash: ContentHash, bytes: Vec<u8>) {
        self.blobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hash, Arc::new(bytes));
    }

    /// Number of distinct blobs stored
    pub fn blob_count(&self) -> usize {
        self.blobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Number of records stored across all weak fingerprints
    pub fn record_count(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(BTreeMap::len)
            .sum()
    }

    /// Outstanding pins on one blob
    pub fn pin_count(&self, hash: &ContentHash) -> usize {
        self.pins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(hash)
            .copied()
            .unwrap_or(0)
    }

    fn has_blob(&self, hash: &ContentHash) -> bool {
        self.blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(hash)
    }
}

#[async_trait]
impl ContentStore for MemoryTier {
    fn role(&self) -> Tier {
        self.role
    }

    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn pin(&self, hash: &ContentHash) -> VstoreResult<PinOutcome> {
        if !self.has_blob(hash) {
            return Ok(PinOutcome::NotFound);
        }
        *self
            .pins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(*hash)
            .or_insert(0) += 1;
        Ok(PinOutcome::Pinned)
    }

    async fn unpin(&self, hash: &ContentHash) -> VstoreResult<()> {
        let mut pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = pins.get_mut(hash) {
            *count -= 1;
            if *count == 0 {
                pins.remove(hash);
            }
        }
        Ok(())
    }

    async fn get_stream(&self, hash: &ContentHash) -> VstoreResult<Option<ContentReader>> {
        let blob = self
            .blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(hash)
            .cloned();

        Ok(blob.map(|bytes| Box::new(Cursor::new(bytes.as_ref().clone())) as ContentReader))
    }

    async fn put(&self, bytes: &[u8]) -> VstoreResult<ContentHash> {
        let hash = ContentHash::of(bytes);
        self.blobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(hash)
            .or_insert_with(|| Arc::new(bytes.to_vec()));
        Ok(hash)
    }

    async fn replace(&self, bytes: &[u8]) -> VstoreResult<ContentHash> {
        let hash = ContentHash::of(bytes);
        self.blobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hash, Arc::new(bytes.to_vec()));
        Ok(hash)
    }
}

#[async_trait]
impl FingerprintStore for MemoryTier {
    async fn get_cache_entries(&self, weak: &WeakFingerprint) -> VstoreResult<RecordStream> {
        let snapshot: Vec<FingerprintRecord> = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(weak)
            .map(|by_strong| {
                by_strong
                    .iter()
                    .map(|(fp, entry)| FingerprintRecord::new(*fp, entry.clone()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(stream::iter(snapshot.into_iter().map(Ok)).boxed())
    }

    async fn get_cache_entry(
        &self,
        fingerprint: &StrongFingerprint,
    ) -> VstoreResult<Option<CacheEntry>> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&fingerprint.weak)
            .and_then(|by_strong| by_strong.get(fingerprint))
            .cloned())
    }

    async fn add_or_get(
        &self,
        fingerprint: &StrongFingerprint,
        entry: CacheEntry,
    ) -> VstoreResult<AddOrGet> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let by_strong = records.entry(fingerprint.weak).or_default();

        if let Some(existing) = by_strong.get(fingerprint) {
            return Ok(AddOrGet {
                entry: existing.clone(),
                newly_added: false,
            });
        }

        by_strong.insert(*fingerprint, entry.clone());
        debug!("{} memory tier added {}", self.role, fingerprint);
        Ok(AddOrGet {
            entry,
            newly_added: true,
        })
    }
}

#[async_trait]
impl TierRepair for MemoryTier {
    async fn repair(
        &self,
        fingerprint: &StrongFingerprint,
        corrected: CacheEntry,
    ) -> VstoreResult<()> {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(fingerprint.weak)
            .or_default()
            .insert(*fingerprint, corrected);
        Ok(())
    }
}
