//! Vertical aggregation over a local and a remote cache tier
//!
//! The aggregator owns both tiers for its lifetime and routes every call
//! through them:
//!
//! - Reads go local first, fall back to remote, and backfill remote hits
//!   into local (`read`)
//! - Writes land locally and are mirrored to remote per `WritePolicy` (`write`)
//! - Content pins and retrievals verify and copy blobs between tiers (`content`)
//!
//! Disagreements between tiers are settled by `crate::resolver`. Upstream
//! queries and transfers are deduplicated by `crate::flight`. Notable events
//! go to the `TelemetrySink` held by the instance.

mod content;
mod read;
mod write;

pub use content::Transfer;
pub use read::CacheLookup;
pub use write::{MirrorOutcome, PublishOutcome};

use crate::config::{AggregatorConfig, WritePolicy};
use crate::error::{VstoreError, VstoreResult};
use crate::flight::{FlightKey, SingleFlight};
use crate::model::{CacheEntry, StrongFingerprint, Tier};
use crate::session::Session;
use crate::store::CacheTier;
use crate::telemetry::{CacheEvent, TelemetrySink};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Two-tier cache aggregator
pub struct VerticalAggregator {
    local: Arc<dyn CacheTier>,
    remote: Arc<dyn CacheTier>,
    config: AggregatorConfig,
    telemetry: Arc<dyn TelemetrySink>,
    lookups: SingleFlight<CacheLookup>,
    transfers: SingleFlight<Transfer>,
    mirrors: SingleFlight<MirrorOutcome>,
    fetches: SingleFlight<Option<Arc<Vec<u8>>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl VerticalAggregator {
    /// Build an aggregator. Invalid policy combinations are rejected here,
    /// never at call time.
    pub fn new(
        local: Arc<dyn CacheTier>,
        remote: Arc<dyn CacheTier>,
        config: AggregatorConfig,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> VstoreResult<Arc<Self>> {
        config.validate()?;

        if local.role() != Tier::Local || remote.role() != Tier::Remote {
            return Err(VstoreError::ConfigConflict(format!(
                "tiers passed in the wrong order: got {} as local and {} as remote",
                local.role(),
                remote.role()
            )));
        }

        debug!(
            local = local.backend(),
            remote = remote.backend(),
            policy = %config.write_policy,
            "aggregator constructed"
        );

        Ok(Arc::new(Self {
            local,
            remote,
            config,
            telemetry,
            lookups: SingleFlight::new(),
            transfers: SingleFlight::new(),
            mirrors: SingleFlight::new(),
            fetches: SingleFlight::new(),
            background: Mutex::new(Vec::new()),
        }))
    }

    /// Open a session over this aggregator
    pub fn open_session(self: &Arc<Self>) -> Session {
        Session::new(Arc::downgrade(self))
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn local(&self) -> &Arc<dyn CacheTier> {
        &self.local
    }

    pub fn remote(&self) -> &Arc<dyn CacheTier> {
        &self.remote
    }

    /// Wait for every background backfill and write-behind mirror started so far,
    /// including ones they start in turn
    pub async fn flush(&self) {
        loop {
            let pending = std::mem::take(
                &mut *self
                    .background
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner),
            );
            if pending.is_empty() {
                return;
            }
            for handle in pending {
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        warn!("Background cache task failed: {}", e);
                    }
                }
            }
        }
    }

    /// Number of background tasks not yet finished
    pub fn background_tasks(&self) -> usize {
        self.background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    fn spawn_background<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut background = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        background.retain(|h| !h.is_finished());
        background.push(handle);
    }

    fn emit(&self, event: CacheEvent) {
        self.telemetry.emit(&event);
    }

    fn note_joined(&self, key: &FlightKey, deduplicated: bool) {
        if deduplicated {
            debug!(kind = ?key.kind, key = %key.key, "joined in-flight operation");
            self.emit(CacheEvent::SingleFlightDeduplicated {
                kind: key.kind,
                key: key.key.clone(),
            });
        }
    }

    /// Remote writes are forbidden when the remote tier is configured read-only
    fn remote_writable(&self) -> bool {
        self.config.write_policy != WritePolicy::LocalOnly
    }

    /// Run a remote tier call under the configured timeout
    async fn remote_call<T, F>(&self, operation: &'static str, call: F) -> VstoreResult<T>
    where
        F: Future<Output = VstoreResult<T>>,
    {
        let timeout = self.config.remote_timeout();
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(VstoreError::RemoteTimeout { operation, timeout }),
        }
    }

    /// Record that a remote failure was absorbed and the call went on local-only
    fn degrade(&self, operation: &'static str, error: &VstoreError) {
        warn!(operation, "Remote tier unavailable, continuing local-only: {}", error);
        self.emit(CacheEvent::RemoteDegraded {
            operation,
            reason: error.to_string(),
        });
    }

    /// Overwrite a tier's entry with the authoritative one.
    ///
    /// A remote repair first mirrors the content the corrected entry
    /// references. Repair failures leave the stale entry in place and are
    /// only logged.
    async fn repair(self: &Arc<Self>, tier: Tier, fingerprint: StrongFingerprint, corrected: CacheEntry) {
        let determinism = corrected.determinism;
        let result = match tier {
            Tier::Local => self.local.repair(&fingerprint, corrected).await,
            Tier::Remote => {
                if !self.remote_writable() {
                    debug!(fingerprint = %fingerprint, "remote is read-only, skipping repair");
                    return;
                }
                if let Err(e) = self.mirror_referenced(&corrected).await {
                    warn!(fingerprint = %fingerprint, "Skipping remote repair, content not mirrored: {}", e);
                    return;
                }
                self.remote_call("repair", self.remote.repair(&fingerprint, corrected))
                    .await
            }
        };

        match result {
            Ok(()) => {
                debug!(tier = %tier, fingerprint = %fingerprint, "tier repaired");
                self.emit(CacheEvent::TierRepaired {
                    tier,
                    fingerprint,
                    determinism,
                });
            }
            Err(e) => warn!(tier = %tier, fingerprint = %fingerprint, "Tier repair failed: {}", e),
        }
    }
}
