//! Content pinning, retrieval and tier-to-tier transfer

use super::VerticalAggregator;
use crate::error::{VstoreError, VstoreResult};
use crate::flight::{FlightKey, FlightKind};
use crate::model::{ContentHash, PathSet};
use crate::store::{read_all, CacheTier, ContentReader, CopyOutcome, PinOutcome};
use crate::telemetry::CacheEvent;
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of making one blob present in a target tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Target already held the content
    Present,
    /// Content was copied into the target
    Copied,
    /// Source does not hold the content either
    Missing,
}

impl Transfer {
    pub fn is_available(self) -> bool {
        !matches!(self, Self::Missing)
    }
}

impl VerticalAggregator {
    /// Pin content, copying it from remote into local on a local miss so a
    /// later local `get_stream` succeeds. A miss in both tiers is reported,
    /// not retried.
    pub async fn pin_to_cas(self: &Arc<Self>, hash: ContentHash) -> VstoreResult<PinOutcome> {
        let local_error = match self.local.pin(&hash).await {
            Ok(PinOutcome::Pinned) => return Ok(PinOutcome::Pinned),
            Ok(PinOutcome::NotFound) => None,
            Err(e) => {
                warn!(hash = %hash, "Local pin failed, trying remote: {}", e);
                Some(e)
            }
        };

        if !self.config.remote_read_enabled {
            return local_error.map_or(Ok(PinOutcome::NotFound), Err);
        }

        match self.backfill_content(hash).await {
            Ok(transfer) if transfer.is_available() => self.local.pin(&hash).await,
            Ok(_) => Ok(PinOutcome::NotFound),
            Err(remote) => match local_error {
                Some(local) => Err(VstoreError::BothTiersFailed {
                    local: Box::new(local),
                    remote: Box::new(remote),
                }),
                None if remote.is_transient() => {
                    self.degrade("pin", &remote);
                    Ok(PinOutcome::NotFound)
                }
                None => Err(remote),
            },
        }
    }

    /// Release a pin taken by `pin_to_cas`
    pub async fn unpin(&self, hash: &ContentHash) -> VstoreResult<()> {
        self.local.unpin(hash).await
    }

    /// Retrieve content with its digest verified.
    ///
    /// A mismatch fails that retrieval and is retried once against the other
    /// tier, never against the same one. Remote hits are backfilled into local,
    /// overwriting a corrupt local blob.
    pub async fn get_content(self: &Arc<Self>, hash: ContentHash) -> VstoreResult<Option<Vec<u8>>> {
        let local_error = match self.read_verified(self.local.as_ref(), &hash).await {
            Ok(Some(bytes)) => return Ok(Some(bytes)),
            Ok(None) => None,
            Err(e) => Some(e),
        };

        if !self.config.remote_read_enabled {
            return local_error.map_or(Ok(None), Err);
        }

        match self.fetch_remote(hash).await {
            Ok(Some(bytes)) => Ok(Some(Arc::unwrap_or_clone(bytes))),
            Ok(None) => match local_error {
                Some(e @ VstoreError::ContentHashMismatch { .. }) => Err(e),
                _ => Ok(None),
            },
            Err(remote) => match local_error {
                Some(local) => Err(VstoreError::BothTiersFailed {
                    local: Box::new(local),
                    remote: Box::new(remote),
                }),
                None if remote.is_transient() => {
                    self.degrade("get_stream", &remote);
                    Ok(None)
                }
                None => Err(remote),
            },
        }
    }

    /// Read verified content from remote at most once per hash across
    /// concurrent callers, backfilling it into local on a hit
    async fn fetch_remote(self: &Arc<Self>, hash: ContentHash) -> VstoreResult<Option<Arc<Vec<u8>>>> {
        let key = FlightKey::new(FlightKind::ContentFetch, hash);
        let aggregator = Arc::clone(self);
        let joined = self
            .fetches
            .run(key.clone(), async move {
                let fetched = aggregator
                    .remote_call("get_stream", aggregator.read_verified(aggregator.remote.as_ref(), &hash))
                    .await?;
                let Some(bytes) = fetched else {
                    return Ok(None);
                };
                if aggregator.config.backfill_on_remote_hit {
                    match aggregator.local.replace(&bytes).await {
                        Ok(_) => aggregator.emit(CacheEvent::ContentBackfilled { hash }),
                        Err(e) => warn!(hash = %hash, "Local backfill failed: {}", e),
                    }
                }
                Ok(Some(Arc::new(bytes)))
            })
            .await;
        self.note_joined(&key, joined.deduplicated);
        joined.result
    }

    /// Streaming form of `get_content`
    pub async fn get_stream(self: &Arc<Self>, hash: ContentHash) -> VstoreResult<Option<ContentReader>> {
        Ok(self
            .get_content(hash)
            .await?
            .map(|bytes| Box::new(Cursor::new(bytes)) as ContentReader))
    }

    /// Store content in the local tier. It reaches remote when an entry
    /// referencing it is mirrored.
    pub async fn put(&self, bytes: &[u8]) -> VstoreResult<ContentHash> {
        self.local.put(bytes).await
    }

    /// Store a path set as content
    pub async fn put_path_set(&self, path_set: &PathSet) -> VstoreResult<ContentHash> {
        self.put(&path_set.to_bytes()).await
    }

    /// Load a path set stored by `put_path_set`
    pub async fn get_path_set(self: &Arc<Self>, hash: ContentHash) -> VstoreResult<Option<PathSet>> {
        let Some(bytes) = self.get_content(hash).await? else {
            return Ok(None);
        };
        let stored: PathSet = serde_json::from_slice(&bytes)?;
        Ok(Some(PathSet::new(stored.paths().iter().cloned())))
    }

    async fn read_verified(
        &self,
        tier: &dyn CacheTier,
        hash: &ContentHash,
    ) -> VstoreResult<Option<Vec<u8>>> {
        let Some(reader) = tier.get_stream(hash).await? else {
            return Ok(None);
        };
        let bytes = read_all(reader, tier.role()).await?;

        let actual = ContentHash::of(&bytes);
        if actual != *hash {
            warn!(tier = %tier.role(), expected = %hash, actual = %actual, "content digest mismatch");
            self.emit(CacheEvent::IntegrityFailure {
                tier: tier.role(),
                expected: *hash,
                actual,
            });
            return Err(VstoreError::ContentHashMismatch {
                tier: tier.role(),
                expected: *hash,
                actual,
            });
        }
        Ok(Some(bytes))
    }

    /// Make content present locally, copying it from remote at most once per
    /// hash across concurrent callers
    pub(super) async fn backfill_content(self: &Arc<Self>, hash: ContentHash) -> VstoreResult<Transfer> {
        let key = FlightKey::new(FlightKind::Backfill, hash);
        let aggregator = Arc::clone(self);
        let joined = self
            .transfers
            .run(key.clone(), async move { aggregator.copy_to_local(hash).await })
            .await;
        self.note_joined(&key, joined.deduplicated);
        joined.result
    }

    /// Start a backfill without waiting for it, or wait when configured to
    pub(super) async fn schedule_backfill(self: &Arc<Self>, hash: ContentHash) {
        if self.config.await_backfill {
            if let Err(e) = self.backfill_content(hash).await {
                warn!(hash = %hash, "Content backfill failed: {}", e);
            }
            return;
        }

        let aggregator = Arc::clone(self);
        self.spawn_background(async move {
            if let Err(e) = aggregator.backfill_content(hash).await {
                warn!(hash = %hash, "Content backfill failed: {}", e);
            }
        });
    }

    async fn copy_to_local(&self, hash: ContentHash) -> VstoreResult<Transfer> {
        // A failing local pin check still attempts the copy
        if matches!(self.local.pin(&hash).await, Ok(PinOutcome::Pinned)) {
            self.local.unpin(&hash).await?;
            return Ok(Transfer::Present);
        }

        let outcome = self
            .remote_call(
                "put_by_copy_from",
                self.local.put_by_copy_from(self.remote.content(), &hash),
            )
            .await?;

        match outcome {
            CopyOutcome::Copied => {
                debug!(hash = %hash, "content backfilled");
                self.emit(CacheEvent::ContentBackfilled { hash });
                Ok(Transfer::Copied)
            }
            CopyOutcome::NotFound => Ok(Transfer::Missing),
        }
    }

    /// Make content present remotely ahead of publishing an entry that
    /// references it
    pub(super) async fn mirror_content(self: &Arc<Self>, hash: ContentHash) -> VstoreResult<Transfer> {
        let key = FlightKey::new(FlightKind::ContentMirror, hash);
        let aggregator = Arc::clone(self);
        let joined = self
            .transfers
            .run(key.clone(), async move { aggregator.copy_to_remote(hash).await })
            .await;
        self.note_joined(&key, joined.deduplicated);
        joined.result
    }

    async fn copy_to_remote(&self, hash: ContentHash) -> VstoreResult<Transfer> {
        if self.remote_call("pin", self.remote.pin(&hash)).await? == PinOutcome::Pinned {
            self.remote_call("unpin", self.remote.unpin(&hash)).await?;
            return Ok(Transfer::Present);
        }

        let outcome = self
            .remote_call(
                "put_by_copy_from",
                self.remote.put_by_copy_from(self.local.content(), &hash),
            )
            .await?;

        match outcome {
            CopyOutcome::Copied => {
                debug!(hash = %hash, "content mirrored");
                self.emit(CacheEvent::ContentMirrored { hash });
                Ok(Transfer::Copied)
            }
            CopyOutcome::NotFound => Ok(Transfer::Missing),
        }
    }
}
