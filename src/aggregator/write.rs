//! Write path and mirroring to the remote tier

use super::read::{strong_lookup_key, weak_lookup_key};
use super::VerticalAggregator;
use crate::config::WritePolicy;
use crate::error::{VstoreError, VstoreResult};
use crate::flight::{FlightKey, FlightKind};
use crate::model::{CacheEntry, StrongFingerprint, Tier};
use crate::resolver::{self, DeterminismViolation, ProposalVerdict};
use crate::telemetry::CacheEvent;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of publishing an entry through the aggregator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    /// The entry now authoritative for the fingerprint
    pub entry: CacheEntry,
    /// False when local already held an entry for the fingerprint
    pub newly_added: bool,
    pub violation: Option<DeterminismViolation>,
}

impl PublishOutcome {
    fn kept(entry: CacheEntry) -> Self {
        Self {
            entry,
            newly_added: false,
            violation: None,
        }
    }
}

/// Entry the tiers agree on after mirroring to remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorOutcome {
    pub entry: CacheEntry,
    pub violation: Option<DeterminismViolation>,
}

impl VerticalAggregator {
    /// Publish an entry: local first, then remote per the write policy.
    ///
    /// When local already holds a different entry, the proposal replaces it
    /// only if strictly more deterministic.
    pub async fn add_or_get(
        self: &Arc<Self>,
        fingerprint: StrongFingerprint,
        entry: CacheEntry,
    ) -> VstoreResult<PublishOutcome> {
        let added = self.local.add_or_get(&fingerprint, entry.clone()).await?;

        // Later lookups must observe this write rather than join a lookup
        // that started before it
        self.lookups.forget(&weak_lookup_key(&fingerprint.weak));
        self.lookups.forget(&strong_lookup_key(&fingerprint));

        if added.newly_added {
            debug!(fingerprint = %fingerprint, "entry published locally");
            return Ok(match self.propagate(fingerprint, added.entry.clone()).await? {
                Some(mirrored) => PublishOutcome {
                    entry: mirrored.entry,
                    newly_added: true,
                    violation: mirrored.violation,
                },
                None => PublishOutcome {
                    entry: added.entry,
                    newly_added: true,
                    violation: None,
                },
            });
        }

        let existing = added.entry;
        if existing.equivalent(&entry) {
            return Ok(PublishOutcome::kept(existing));
        }

        match resolver::reconcile_proposal(&existing, &entry) {
            ProposalVerdict::KeepExisting => Ok(PublishOutcome::kept(existing)),
            ProposalVerdict::Violation => {
                let violation = DeterminismViolation {
                    fingerprint,
                    kept: existing.clone(),
                    rejected: entry,
                };
                warn!(fingerprint = %fingerprint, "Proposed entry conflicts with an equally deterministic one");
                self.emit(CacheEvent::DeterminismViolation(violation.clone()));
                Ok(PublishOutcome {
                    entry: existing,
                    newly_added: false,
                    violation: Some(violation),
                })
            }
            ProposalVerdict::Replace => {
                if let Err(e) = self.local.repair(&fingerprint, entry.clone()).await {
                    warn!(fingerprint = %fingerprint, "Local upgrade failed: {}", e);
                    return Ok(PublishOutcome::kept(existing));
                }
                debug!(
                    fingerprint = %fingerprint,
                    from = %existing.determinism,
                    to = %entry.determinism,
                    "local entry upgraded"
                );
                self.emit(CacheEvent::TierRepaired {
                    tier: Tier::Local,
                    fingerprint,
                    determinism: entry.determinism,
                });

                Ok(match self.propagate(fingerprint, entry.clone()).await? {
                    Some(mirrored) => PublishOutcome {
                        entry: mirrored.entry,
                        newly_added: false,
                        violation: mirrored.violation,
                    },
                    None => PublishOutcome::kept(entry),
                })
            }
        }
    }

    /// Apply the write policy to an entry local has accepted
    async fn propagate(
        self: &Arc<Self>,
        fingerprint: StrongFingerprint,
        entry: CacheEntry,
    ) -> VstoreResult<Option<MirrorOutcome>> {
        match self.config.write_policy {
            WritePolicy::LocalOnly => Ok(None),
            WritePolicy::WriteThrough => self
                .mirror(fingerprint, entry)
                .await
                .map(Some)
                .map_err(|e| VstoreError::WriteFailed {
                    fingerprint,
                    reason: e.to_string(),
                }),
            WritePolicy::WriteBehind => {
                let aggregator = Arc::clone(self);
                self.spawn_background(async move {
                    if let Err(e) = aggregator.mirror(fingerprint, entry).await {
                        warn!(fingerprint = %fingerprint, "Write-behind mirror failed: {}", e);
                        aggregator.emit(CacheEvent::MirrorFailed {
                            fingerprint,
                            reason: e.to_string(),
                        });
                    }
                });
                Ok(None)
            }
        }
    }

    /// Publish an entry to remote, once per fingerprint and entry across
    /// concurrent callers
    async fn mirror(
        self: &Arc<Self>,
        fingerprint: StrongFingerprint,
        entry: CacheEntry,
    ) -> VstoreResult<MirrorOutcome> {
        let key = FlightKey::new(
            FlightKind::EntryMirror,
            format!("{}/{}", fingerprint.hash, entry.digest()),
        );
        let aggregator = Arc::clone(self);
        let joined = self
            .mirrors
            .run(key.clone(), async move {
                aggregator.mirror_entry(fingerprint, entry).await
            })
            .await;
        self.note_joined(&key, joined.deduplicated);
        joined.result
    }

    /// Copy referenced content first so remote never holds an entry whose
    /// content it cannot serve
    async fn mirror_entry(
        self: &Arc<Self>,
        fingerprint: StrongFingerprint,
        entry: CacheEntry,
    ) -> VstoreResult<MirrorOutcome> {
        self.mirror_referenced(&entry).await?;

        let remote = self
            .remote_call("add_or_get", self.remote.add_or_get(&fingerprint, entry.clone()))
            .await?;

        if remote.newly_added || remote.entry.equivalent(&entry) {
            debug!(fingerprint = %fingerprint, newly_added = remote.newly_added, "entry mirrored");
            return Ok(MirrorOutcome {
                entry,
                violation: None,
            });
        }

        let outcome = resolver::reconcile(&entry, &remote.entry);
        debug!(
            fingerprint = %fingerprint,
            verdict = ?outcome.verdict,
            chosen = %outcome.chosen,
            "mirror found a different remote entry"
        );
        if let Some(tier) = outcome.repair {
            self.repair(tier, fingerprint, outcome.entry.clone()).await;
        }

        let violation = outcome.violation(fingerprint, &entry, &remote.entry);
        if let Some(v) = &violation {
            self.emit(CacheEvent::DeterminismViolation(v.clone()));
        }

        Ok(MirrorOutcome {
            entry: outcome.entry,
            violation,
        })
    }

    /// Make every blob an entry references present in remote
    pub(super) async fn mirror_referenced(self: &Arc<Self>, entry: &CacheEntry) -> VstoreResult<()> {
        for hash in entry.referenced_content() {
            if !self.mirror_content(hash).await?.is_available() {
                return Err(VstoreError::ContentNotFound(hash));
            }
        }
        Ok(())
    }
}
