//! Cache entries and their determinism classification

use crate::model::fingerprint::StrongFingerprint;
use crate::model::hash::ContentHash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the two cache tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Fast, possibly unreliable, machine-local tier
    Local,
    /// Shared, authoritative tier
    Remote,
}

impl Tier {
    /// The other tier
    pub fn other(self) -> Self {
        match self {
            Self::Local => Self::Remote,
            Self::Remote => Self::Local,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// How far a cache entry's outputs can be trusted to be reproducible
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Determinism {
    /// The tool itself guarantees deterministic output
    ToolDeterministic,
    /// Output corroborated as deterministic by the cache
    Deterministic,
    /// Produced by a single-phase lookup that cannot be corroborated
    SinglePhaseNonDeterministic,
    /// No determinism evidence yet
    PossiblyNonDeterministic,
}

impl Determinism {
    /// Ordering used for upgrades; a higher rank is never replaced by a lower one
    pub fn rank(self) -> u8 {
        match self {
            Self::PossiblyNonDeterministic => 0,
            Self::SinglePhaseNonDeterministic => 1,
            Self::Deterministic => 2,
            Self::ToolDeterministic => 3,
        }
    }

    /// Deterministic or tool-deterministic
    pub fn is_deterministic(self) -> bool {
        matches!(self, Self::Deterministic | Self::ToolDeterministic)
    }

    /// Label used in the CLI and in serialized records
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ToolDeterministic => "tool-deterministic",
            Self::Deterministic => "deterministic",
            Self::SinglePhaseNonDeterministic => "single-phase-non-deterministic",
            Self::PossiblyNonDeterministic => "possibly-non-deterministic",
        }
    }
}

impl fmt::Display for Determinism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result record for one strong fingerprint.
///
/// Immutable once published, except for determinism upgrades applied by
/// tier repair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Output blobs, in the order the step declared them
    pub outputs: Vec<ContentHash>,

    /// Metadata blob describing the outputs
    pub metadata: ContentHash,

    pub determinism: Determinism,

    /// When the producing tier recorded the entry
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Create an entry stamped with the current time
    pub fn new(outputs: Vec<ContentHash>, metadata: ContentHash, determinism: Determinism) -> Self {
        Self {
            outputs,
            metadata,
            determinism,
            created_at: Utc::now(),
        }
    }

    /// Same outputs and metadata, regardless of classification and timestamp
    pub fn same_outputs(&self, other: &CacheEntry) -> bool {
        self.outputs == other.outputs && self.metadata == other.metadata
    }

    /// Same outputs, metadata and classification
    pub fn equivalent(&self, other: &CacheEntry) -> bool {
        self.same_outputs(other) && self.determinism == other.determinism
    }

    /// Digest over outputs, metadata and classification. Equivalent entries
    /// share a digest.
    pub fn digest(&self) -> ContentHash {
        let mut bytes = Vec::with_capacity((self.outputs.len() + 1) * 32 + 32);
        for hash in self.referenced_content() {
            bytes.extend_from_slice(hash.as_bytes());
        }
        bytes.extend_from_slice(self.determinism.as_str().as_bytes());
        ContentHash::of(&bytes)
    }

    /// Every content hash this entry references
    pub fn referenced_content(&self) -> impl Iterator<Item = ContentHash> + '_ {
        self.outputs
            .iter()
            .copied()
            .chain(std::iter::once(self.metadata))
    }

    /// Copy of this entry with a different classification
    pub fn with_determinism(&self, determinism: Determinism) -> Self {
        Self {
            determinism,
            ..self.clone()
        }
    }
}

/// A strong fingerprint paired with the entry a tier holds for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub fingerprint: StrongFingerprint,
    pub entry: CacheEntry,
}

impl FingerprintRecord {
    pub fn new(fingerprint: StrongFingerprint, entry: CacheEntry) -> Self {
        Self { fingerprint, entry }
    }
}
