//! Determinism resolution
//!
//! Decides which of two entries recorded for the same strong fingerprint is
//! authoritative and whether the losing side needs correction.
//!
//! | Situation | Result | Repair |
//! |-----------|--------|--------|
//! | Same outputs, same classification | either | none |
//! | Same outputs, different classification | higher rank | lower-ranked side |
//! | Exactly one deterministic | the deterministic one | the other side |
//! | Both deterministic, different outputs | remote (violation) | none |
//! | Neither deterministic | most recent | none |
//!
//! Classification never moves toward a less deterministic state: a repair
//! always carries an entry of equal or higher rank than the one it replaces.

use crate::model::{CacheEntry, StrongFingerprint, Tier};
use serde::Serialize;

/// Tier preferred when both entries are equally deterministic but disagree.
/// The remote tier is the fleet-wide authority.
pub const VIOLATION_PREFERENCE: Tier = Tier::Remote;

/// Two equally deterministic entries with different outputs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeterminismViolation {
    pub fingerprint: StrongFingerprint,
    /// Entry returned to the caller
    pub kept: CacheEntry,
    /// Entry that disagreed with it
    pub rejected: CacheEntry,
}

/// How a cross-tier disagreement was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Entries are equivalent
    Identical,
    /// The more deterministic entry won
    Upgrade,
    /// Equally deterministic, different outputs
    Violation,
    /// Neither deterministic; newest returned as-is
    MostRecent,
}

/// Outcome of reconciling a local and a remote entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub verdict: Verdict,
    /// Tier whose entry is authoritative
    pub chosen: Tier,
    /// The authoritative entry
    pub entry: CacheEntry,
    /// Tier that must be corrected to `entry`, if any
    pub repair: Option<Tier>,
}

impl Reconciliation {
    /// Violation diagnostic, when the verdict is a violation
    pub fn violation(
        &self,
        fingerprint: StrongFingerprint,
        local: &CacheEntry,
        remote: &CacheEntry,
    ) -> Option<DeterminismViolation> {
        if self.verdict != Verdict::Violation {
            return None;
        }
        let rejected = match self.chosen {
            Tier::Local => remote,
            Tier::Remote => local,
        };
        Some(DeterminismViolation {
            fingerprint,
            kept: self.entry.clone(),
            rejected: rejected.clone(),
        })
    }
}

/// Outcome of proposing an entry for a fingerprint a tier already holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalVerdict {
    /// Existing entry stands
    KeepExisting,
    /// The proposal is strictly more deterministic and replaces the existing entry
    Replace,
    /// Equally deterministic, different outputs; existing entry stands
    Violation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    First,
    Second,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Judgement {
    Same,
    Prefer(Side),
    Conflict,
    Newest(Side),
}

fn judge(first: &CacheEntry, second: &CacheEntry) -> Judgement {
    if first.equivalent(second) {
        return Judgement::Same;
    }

    let (a, b) = (first.determinism, second.determinism);

    if first.same_outputs(second) {
        return if a.rank() >= b.rank() {
            Judgement::Prefer(Side::First)
        } else {
            Judgement::Prefer(Side::Second)
        };
    }

    match (a.is_deterministic(), b.is_deterministic()) {
        (true, false) => Judgement::Prefer(Side::First),
        (false, true) => Judgement::Prefer(Side::Second),
        (true, true) => Judgement::Conflict,
        (false, false) => {
            if second.created_at > first.created_at {
                Judgement::Newest(Side::Second)
            } else {
                Judgement::Newest(Side::First)
            }
        }
    }
}

/// Reconcile the entries two tiers hold for the same strong fingerprint
pub fn reconcile(local: &CacheEntry, remote: &CacheEntry) -> Reconciliation {
    let pick = |side: Side| match side {
        Side::First => (Tier::Local, local),
        Side::Second => (Tier::Remote, remote),
    };

    let (verdict, chosen, repair) = match judge(local, remote) {
        Judgement::Same => (Verdict::Identical, VIOLATION_PREFERENCE, None),
        Judgement::Prefer(side) => {
            let (tier, _) = pick(side);
            (Verdict::Upgrade, tier, Some(tier.other()))
        }
        Judgement::Conflict => (Verdict::Violation, VIOLATION_PREFERENCE, None),
        Judgement::Newest(side) => (Verdict::MostRecent, pick(side).0, None),
    };

    let entry = match chosen {
        Tier::Local => local.clone(),
        Tier::Remote => remote.clone(),
    };

    Reconciliation {
        verdict,
        chosen,
        entry,
        repair,
    }
}

/// Decide whether a proposed entry may replace the entry a tier already holds
pub fn reconcile_proposal(existing: &CacheEntry, proposed: &CacheEntry) -> ProposalVerdict {
    match judge(existing, proposed) {
        Judgement::Same | Judgement::Newest(_) | Judgement::Prefer(Side::First) => {
            ProposalVerdict::KeepExisting
        }
        Judgement::Prefer(Side::Second) => ProposalVerdict::Replace,
        Judgement::Conflict => ProposalVerdict::Violation,
    }
}
