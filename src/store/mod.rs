//! Tier capability traits
//!
//! Provides the capability set every cache tier implements, local or
//! remote alike:
//! - `ContentStore`: content-addressed blobs
//! - `FingerprintStore`: strong fingerprint -> cache entry records
//! - `TierRepair`: overwrite of a published entry, used only by reconciliation
//!
//! `CacheTier` is the union the aggregator holds.

mod filesystem;
mod memory;

pub use filesystem::{FilesystemTier, TierStats};
pub use memory::MemoryTier;

use crate::error::{VstoreError, VstoreResult};
use crate::model::{CacheEntry, ContentHash, FingerprintRecord, StrongFingerprint, Tier, WeakFingerprint};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::TryStreamExt;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Byte stream over one content blob
pub type ContentReader = Box<dyn AsyncRead + Send + Unpin>;

/// Lazy, finite sequence of records for one weak fingerprint
pub type RecordStream = BoxStream<'static, VstoreResult<FingerprintRecord>>;

/// Result of pinning content in a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOutcome {
    Pinned,
    NotFound,
}

/// Result of a tier-to-tier content transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    Copied,
    NotFound,
}

/// Result of publishing an entry to a fingerprint store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddOrGet {
    /// The entry the tier now holds for the fingerprint
    pub entry: CacheEntry,
    /// False when an existing entry was returned instead of the proposal
    pub newly_added: bool,
}

/// Content-addressed blob storage
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Which tier this store plays in an aggregator
    fn role(&self) -> Tier;

    /// Short backend name for display
    fn backend(&self) -> &'static str;

    /// Assert content exists and hold it against eviction until unpinned
    async fn pin(&self, hash: &ContentHash) -> VstoreResult<PinOutcome>;

    /// Release one pin taken by `pin`
    async fn unpin(&self, hash: &ContentHash) -> VstoreResult<()>;

    /// Open the content for reading, `None` when absent
    async fn get_stream(&self, hash: &ContentHash) -> VstoreResult<Option<ContentReader>>;

    /// Store content and return its hash; storing the same bytes twice is a no-op
    async fn put(&self, bytes: &[u8]) -> VstoreResult<ContentHash>;

    /// Store content, overwriting whatever the tier holds under its hash.
    /// Used to heal a blob that failed digest verification.
    async fn replace(&self, bytes: &[u8]) -> VstoreResult<ContentHash>;

    /// Copy one blob from another store into this one.
    ///
    /// The copied bytes are verified against `hash` before they are stored.
    async fn put_by_copy_from(
        &self,
        source: &dyn ContentStore,
        hash: &ContentHash,
    ) -> VstoreResult<CopyOutcome> {
        let Some(reader) = source.get_stream(hash).await? else {
            return Ok(CopyOutcome::NotFound);
        };

        let bytes = read_all(reader, source.role()).await?;
        let actual = ContentHash::of(&bytes);
        if actual != *hash {
            return Err(VstoreError::ContentHashMismatch {
                tier: source.role(),
                expected: *hash,
                actual,
            });
        }

        self.put(&bytes).await?;
        Ok(CopyOutcome::Copied)
    }
}

/// Strong fingerprint -> cache entry records
#[async_trait]
pub trait FingerprintStore: Send + Sync {
    /// All records this tier knows for a weak fingerprint. Each call re-queries.
    async fn get_cache_entries(&self, weak: &WeakFingerprint) -> VstoreResult<RecordStream>;

    /// The record for one strong fingerprint
    async fn get_cache_entry(
        &self,
        fingerprint: &StrongFingerprint,
    ) -> VstoreResult<Option<CacheEntry>>;

    /// Publish an entry unless one already exists for the fingerprint
    async fn add_or_get(
        &self,
        fingerprint: &StrongFingerprint,
        entry: CacheEntry,
    ) -> VstoreResult<AddOrGet>;
}

/// Correction primitive used by determinism reconciliation
#[async_trait]
pub trait TierRepair: Send + Sync {
    /// Overwrite the published entry for a fingerprint
    async fn repair(&self, fingerprint: &StrongFingerprint, corrected: CacheEntry)
        -> VstoreResult<()>;
}

/// Everything a tier must provide to sit under the aggregator
pub trait CacheTier: ContentStore + FingerprintStore + TierRepair {
    /// This tier viewed as a plain content store, for tier-to-tier copies
    fn content(&self) -> &dyn ContentStore;
}

impl<T: ContentStore + FingerprintStore + TierRepair> CacheTier for T {
    fn content(&self) -> &dyn ContentStore {
        self
    }
}

/// Drain a content reader into memory
pub async fn read_all(mut reader: ContentReader, tier: Tier) -> VstoreResult<Vec<u8>> {
    let mut bytes = Vec::new();
    reader
        .read_to_end(&mut bytes)
        .await
        .map_err(|e| VstoreError::tier(tier, "get_stream", e.to_string()))?;
    Ok(bytes)
}

/// Drain a record stream
pub async fn collect_records(stream: RecordStream) -> VstoreResult<Vec<FingerprintRecord>> {
    stream.try_collect().await
}
