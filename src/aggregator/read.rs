//! Read path
//!
//! One lookup walks these states:
//!
//! ```text
//! QueryLocal ─found─> ValidateContent ─usable─> Backfill ─> Done(found)
//!     │                    │ nothing usable
//!     └─miss──────────> QueryRemote ─found─> Reconcile ─> Backfill ─> Done(found)
//!                          └─miss─> Done(miss)
//! ```
//!
//! The whole walk is deduplicated per fingerprint, so concurrent callers
//! asking for the same cold fingerprint cause one remote query.

use super::VerticalAggregator;
use crate::error::{VstoreError, VstoreResult};
use crate::flight::{FlightKey, FlightKind};
use crate::model::{CacheEntry, ContentHash, FingerprintRecord, StrongFingerprint, Tier, WeakFingerprint};
use crate::resolver::{self, DeterminismViolation};
use crate::store::{collect_records, CacheTier, PinOutcome};
use crate::telemetry::CacheEvent;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of a tiered lookup
#[derive(Debug, Clone, Default)]
pub struct CacheLookup {
    /// Usable records; empty on a miss
    pub records: Vec<FingerprintRecord>,
    /// Tier that answered, `None` on a miss
    pub source: Option<Tier>,
    /// Equally deterministic entries that disagreed while answering
    pub violations: Vec<DeterminismViolation>,
    /// The remote tier failed or timed out and the answer is local-only
    pub degraded: bool,
}

impl CacheLookup {
    pub fn is_miss(&self) -> bool {
        self.records.is_empty()
    }

    /// Entry recorded for one strong fingerprint, if present
    pub fn entry(&self, fingerprint: &StrongFingerprint) -> Option<&CacheEntry> {
        self.records
            .iter()
            .find(|r| r.fingerprint == *fingerprint)
            .map(|r| &r.entry)
    }
}

#[derive(Debug, Clone, Copy)]
enum Query {
    Weak(WeakFingerprint),
    Strong(StrongFingerprint),
}

impl Query {
    fn flight_key(&self) -> FlightKey {
        match self {
            Self::Weak(weak) => weak_lookup_key(weak),
            Self::Strong(fingerprint) => strong_lookup_key(fingerprint),
        }
    }

    fn operation(&self) -> &'static str {
        match self {
            Self::Weak(_) => "get_cache_entries",
            Self::Strong(_) => "get_cache_entry",
        }
    }

    async fn run(&self, tier: &dyn CacheTier) -> VstoreResult<Vec<FingerprintRecord>> {
        match self {
            Self::Weak(weak) => collect_records(tier.get_cache_entries(weak).await?).await,
            Self::Strong(fingerprint) => Ok(tier
                .get_cache_entry(fingerprint)
                .await?
                .map(|entry| FingerprintRecord::new(*fingerprint, entry))
                .into_iter()
                .collect()),
        }
    }
}

pub(super) fn weak_lookup_key(weak: &WeakFingerprint) -> FlightKey {
    FlightKey::new(FlightKind::WeakLookup, weak)
}

pub(super) fn strong_lookup_key(fingerprint: &StrongFingerprint) -> FlightKey {
    FlightKey::new(FlightKind::StrongLookup, fingerprint.hash)
}

enum LookupState {
    QueryLocal,
    ValidateContent(Vec<FingerprintRecord>),
    /// Carries the local failure, if local failed rather than missed
    QueryRemote(Option<VstoreError>),
    Reconcile(Vec<FingerprintRecord>),
    Backfill {
        records: Vec<FingerprintRecord>,
        source: Tier,
        content: Vec<ContentHash>,
    },
    Done(CacheLookup),
}

impl LookupState {
    fn name(&self) -> &'static str {
        match self {
            Self::QueryLocal => "query_local",
            Self::ValidateContent(_) => "validate_content",
            Self::QueryRemote(_) => "query_remote",
            Self::Reconcile(_) => "reconcile",
            Self::Backfill { .. } => "backfill",
            Self::Done(_) => "done",
        }
    }
}

struct Lookup {
    aggregator: Arc<VerticalAggregator>,
    query: Query,
    /// Cleared after the first remote failure so one lookup waits out at most one timeout
    remote_available: bool,
    violations: Vec<DeterminismViolation>,
    degraded: bool,
}

impl VerticalAggregator {
    /// All usable records for a weak fingerprint, local tier first
    pub async fn get_cache_entries(self: &Arc<Self>, weak: WeakFingerprint) -> VstoreResult<CacheLookup> {
        self.lookup(Query::Weak(weak)).await
    }

    /// The usable record for one strong fingerprint, local tier first
    pub async fn get_cache_entry(
        self: &Arc<Self>,
        fingerprint: StrongFingerprint,
    ) -> VstoreResult<CacheLookup> {
        self.lookup(Query::Strong(fingerprint)).await
    }

    async fn lookup(self: &Arc<Self>, query: Query) -> VstoreResult<CacheLookup> {
        let key = query.flight_key();
        let lookup = Lookup {
            aggregator: Arc::clone(self),
            query,
            remote_available: self.config.remote_read_enabled,
            violations: Vec::new(),
            degraded: false,
        };

        let joined = self.lookups.run(key.clone(), lookup.run()).await;
        self.note_joined(&key, joined.deduplicated);
        joined.result
    }
}

impl Lookup {
    async fn run(mut self) -> VstoreResult<CacheLookup> {
        let mut state = LookupState::QueryLocal;
        loop {
            debug!(query = ?self.query, state = state.name(), "lookup step");
            state = match state {
                LookupState::QueryLocal => self.query_local().await,
                LookupState::ValidateContent(records) => self.validate_content(records).await,
                LookupState::QueryRemote(local_error) => self.query_remote(local_error).await?,
                LookupState::Reconcile(records) => self.reconcile(records).await,
                LookupState::Backfill {
                    records,
                    source,
                    content,
                } => self.backfill(records, source, content).await,
                LookupState::Done(result) => return Ok(result),
            };
        }
    }

    fn finish(&mut self, records: Vec<FingerprintRecord>, source: Option<Tier>) -> LookupState {
        LookupState::Done(CacheLookup {
            records,
            source,
            violations: std::mem::take(&mut self.violations),
            degraded: self.degraded,
        })
    }

    fn degrade(&mut self, operation: &'static str, error: &VstoreError) {
        self.aggregator.degrade(operation, error);
        self.degraded = true;
        self.remote_available = false;
    }

    async fn query_local(&mut self) -> LookupState {
        let aggregator = Arc::clone(&self.aggregator);
        match self.query.run(aggregator.local.as_ref()).await {
            Ok(records) if records.is_empty() => LookupState::QueryRemote(None),
            Ok(records) => LookupState::ValidateContent(records),
            Err(e) => {
                warn!(query = ?self.query, "Local lookup failed, trying remote: {}", e);
                LookupState::QueryRemote(Some(e))
            }
        }
    }

    /// Keep only local records whose content can be read from some tier,
    /// then correct them against remote when cross-checking is on
    async fn validate_content(&mut self, records: Vec<FingerprintRecord>) -> LookupState {
        let cross_check = self.aggregator.config.verify_local_hits;

        let mut usable = Vec::with_capacity(records.len());
        let mut remote_only = Vec::new();

        for mut record in records {
            let mut content = match self.remote_only_content(&record.entry).await {
                Ok(Some(hashes)) => hashes,
                Ok(None) => {
                    debug!(fingerprint = %record.fingerprint, "dropping record with unavailable content");
                    continue;
                }
                Err(e) => {
                    warn!(fingerprint = %record.fingerprint, "Content check failed: {}", e);
                    continue;
                }
            };

            if cross_check && self.remote_available {
                if let Some(replaced) = self.cross_check(&mut record).await {
                    content = replaced;
                }
            }

            remote_only.extend(content);
            usable.push(record);
        }

        if usable.is_empty() {
            return LookupState::QueryRemote(None);
        }

        LookupState::Backfill {
            records: usable,
            source: Tier::Local,
            content: remote_only,
        }
    }

    /// Settle a usable local record against the remote entry for the same
    /// fingerprint. Returns the remote-only content of the new entry when
    /// the remote outputs replaced the local ones.
    async fn cross_check(&mut self, record: &mut FingerprintRecord) -> Option<Vec<ContentHash>> {
        let aggregator = Arc::clone(&self.aggregator);
        let remote_entry = match aggregator
            .remote_call(
                "get_cache_entry",
                aggregator.remote.get_cache_entry(&record.fingerprint),
            )
            .await
        {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                self.degrade("get_cache_entry", &e);
                return None;
            }
        };

        if record.entry.equivalent(&remote_entry) {
            return None;
        }

        // A remote entry with dangling content may not override a usable local one
        let remote_content = match self.remote_only_content(&remote_entry).await {
            Ok(Some(hashes)) => hashes,
            Ok(None) | Err(_) => {
                debug!(fingerprint = %record.fingerprint, "remote entry has unavailable content, keeping local");
                return None;
            }
        };

        let settled = self
            .settle(record.fingerprint, &record.entry, &remote_entry)
            .await;
        let replaced = !settled.same_outputs(&record.entry);
        record.entry = settled;
        replaced.then_some(remote_content)
    }

    /// Hashes of `entry` held only by remote, or `None` when some content is
    /// in neither tier
    async fn remote_only_content(&mut self, entry: &CacheEntry) -> VstoreResult<Option<Vec<ContentHash>>> {
        let aggregator = Arc::clone(&self.aggregator);
        let mut remote_only = Vec::new();

        for hash in entry.referenced_content() {
            if aggregator.local.pin(&hash).await? == PinOutcome::Pinned {
                aggregator.local.unpin(&hash).await?;
                continue;
            }
            if !self.remote_available {
                return Ok(None);
            }

            match aggregator.remote_call("pin", aggregator.remote.pin(&hash)).await {
                Ok(PinOutcome::Pinned) => {
                    if let Err(e) = aggregator.remote_call("unpin", aggregator.remote.unpin(&hash)).await {
                        debug!(hash = %hash, "remote unpin failed: {}", e);
                    }
                    remote_only.push(hash);
                }
                Ok(PinOutcome::NotFound) => return Ok(None),
                Err(e) => {
                    self.degrade("pin", &e);
                    return Ok(None);
                }
            }
        }

        Ok(Some(remote_only))
    }

    async fn query_remote(&mut self, local_error: Option<VstoreError>) -> VstoreResult<LookupState> {
        if !self.remote_available {
            return match local_error {
                Some(e) => Err(e),
                None => Ok(self.finish(Vec::new(), None)),
            };
        }

        let aggregator = Arc::clone(&self.aggregator);
        let operation = self.query.operation();
        let remote = aggregator
            .remote_call(operation, self.query.run(aggregator.remote.as_ref()))
            .await;

        match remote {
            Ok(records) if records.is_empty() => {
                debug!(query = ?self.query, "miss in both tiers");
                Ok(self.finish(Vec::new(), None))
            }
            Ok(records) => Ok(LookupState::Reconcile(records)),
            Err(remote) => match local_error {
                Some(local) => Err(VstoreError::BothTiersFailed {
                    local: Box::new(local),
                    remote: Box::new(remote),
                }),
                None => {
                    self.degrade(operation, &remote);
                    Ok(self.finish(Vec::new(), None))
                }
            },
        }
    }

    /// Record remote hits locally, settling any entry local already holds.
    /// Hits whose content is in neither tier are dropped first.
    async fn reconcile(&mut self, records: Vec<FingerprintRecord>) -> LookupState {
        let aggregator = Arc::clone(&self.aggregator);

        let mut available = Vec::with_capacity(records.len());
        let mut content = Vec::new();
        for record in records {
            match self.remote_only_content(&record.entry).await {
                Ok(Some(hashes)) => {
                    content.extend(hashes);
                    available.push(record);
                }
                Ok(None) => {
                    debug!(fingerprint = %record.fingerprint, "dropping remote record with unavailable content");
                }
                Err(e) => {
                    warn!(fingerprint = %record.fingerprint, "Content check failed: {}", e);
                }
            }
        }

        if available.is_empty() {
            return self.finish(Vec::new(), None);
        }
        if !aggregator.config.backfill_on_remote_hit {
            return self.finish(available, Some(Tier::Remote));
        }

        let mut settled = Vec::with_capacity(available.len());
        for mut record in available {
            match aggregator
                .local
                .add_or_get(&record.fingerprint, record.entry.clone())
                .await
            {
                Ok(added) if added.newly_added => {
                    debug!(fingerprint = %record.fingerprint, "record backfilled");
                    aggregator.emit(CacheEvent::EntryBackfilled {
                        fingerprint: record.fingerprint,
                    });
                }
                Ok(added) if added.entry.equivalent(&record.entry) => {}
                Ok(added) => match self.remote_only_content(&added.entry).await {
                    Ok(Some(local_content)) => {
                        record.entry = self
                            .settle(record.fingerprint, &added.entry, &record.entry)
                            .await;
                        if record.entry.same_outputs(&added.entry) {
                            content.extend(local_content);
                        }
                    }
                    Ok(None) | Err(_) => {
                        debug!(fingerprint = %record.fingerprint, "local entry has unavailable content, keeping remote");
                    }
                },
                Err(e) => {
                    warn!(fingerprint = %record.fingerprint, "Local record backfill failed: {}", e);
                }
            }
            settled.push(record);
        }

        LookupState::Backfill {
            records: settled,
            source: Tier::Remote,
            content,
        }
    }

    async fn backfill(
        &mut self,
        records: Vec<FingerprintRecord>,
        source: Tier,
        mut content: Vec<ContentHash>,
    ) -> LookupState {
        let aggregator = Arc::clone(&self.aggregator);
        if aggregator.config.backfill_on_remote_hit && self.remote_available {
            content.sort();
            content.dedup();
            for hash in content {
                aggregator.schedule_backfill(hash).await;
            }
        }
        self.finish(records, Some(source))
    }

    /// Resolve two tiers' entries for one fingerprint and apply the repair
    async fn settle(
        &mut self,
        fingerprint: StrongFingerprint,
        local: &CacheEntry,
        remote: &CacheEntry,
    ) -> CacheEntry {
        if local.equivalent(remote) {
            return local.clone();
        }

        let outcome = resolver::reconcile(local, remote);
        debug!(
            fingerprint = %fingerprint,
            verdict = ?outcome.verdict,
            chosen = %outcome.chosen,
            "entries reconciled"
        );

        if let Some(tier) = outcome.repair {
            self.aggregator
                .repair(tier, fingerprint, outcome.entry.clone())
                .await;
        }
        if let Some(violation) = outcome.violation(fingerprint, local, remote) {
            self.aggregator
                .emit(CacheEvent::DeterminismViolation(violation.clone()));
            self.violations.push(violation);
        }

        outcome.entry
    }
}
