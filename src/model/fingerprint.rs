//! Path sets and strong fingerprints

use crate::model::hash::{update_field, ContentHash, WeakFingerprint};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Ordered set of input paths observed during one execution of a step.
///
/// Paths are kept sorted and de-duplicated so the same observation always
/// hashes to the same value. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathSet {
    paths: Vec<String>,
}

impl PathSet {
    /// Build a path set from observed paths
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut paths: Vec<String> = paths.into_iter().map(Into::into).collect();
        paths.sort();
        paths.dedup();
        Self { paths }
    }

    /// Observed paths in canonical order
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Canonical serialized form; this is what gets stored as content
    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing a struct of strings cannot fail
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Hash of the canonical serialized form
    pub fn hash(&self) -> ContentHash {
        ContentHash::of(&self.to_bytes())
    }
}

/// Identity of one observed execution's input state.
///
/// Carries the weak fingerprint and path set it was derived from so a tier
/// can index records by weak fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StrongFingerprint {
    pub weak: WeakFingerprint,
    pub path_set: ContentHash,
    pub hash: ContentHash,
}

impl StrongFingerprint {
    /// Derive the strong fingerprint from a weak fingerprint, the observed
    /// path set and the content hash found at each path (in path set order).
    pub fn derive(weak: WeakFingerprint, path_set: &PathSet, input_hashes: &[ContentHash]) -> Self {
        let path_set_hash = path_set.hash();

        let mut hasher = Sha256::new();
        update_field(&mut hasher, b"strong-v1");
        hasher.update(weak.as_bytes());
        hasher.update(path_set_hash.as_bytes());
        hasher.update((input_hashes.len() as u64).to_le_bytes());
        for hash in input_hashes {
            hasher.update(hash.as_bytes());
        }

        Self {
            weak,
            path_set: path_set_hash,
            hash: ContentHash::from_bytes(hasher.finalize().into()),
        }
    }
}

impl fmt::Display for StrongFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.weak.short(),
            self.path_set.short(),
            self.hash.short()
        )
    }
}
