//! Directory-backed tier
//!
//! Layout under the tier root:
//!
//! ```text
//! cas/<first two hex chars>/<content hash>
//! fingerprints/<weak fingerprint>/<path set hash>-<strong hash>.json
//! ```
//!
//! Blobs and records are written to a temporary file first. Blobs are
//! renamed into place; records are hard-linked into place so that a
//! concurrent publisher of the same fingerprint observes `AlreadyExists`
//! instead of overwriting.

use crate::error::{VstoreError, VstoreResult};
use crate::model::{CacheEntry, ContentHash, FingerprintRecord, StrongFingerprint, Tier, WeakFingerprint};
use crate::store::{
    AddOrGet, ContentReader, ContentStore, FingerprintStore, PinOutcome, RecordStream, TierRepair,
};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

/// Counts reported by `FilesystemTier::stats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierStats {
    pub blobs: u64,
    pub blob_bytes: u64,
    pub records: u64,
}

/// Tier stored in a plain directory tree
pub struct FilesystemTier {
    role: Tier,
    root: PathBuf,
    pins: Mutex<HashMap<ContentHash, usize>>,
}

impl FilesystemTier {
    /// Open (creating if needed) a tier rooted at `root`
    pub async fn open(root: impl Into<PathBuf>, role: Tier) -> VstoreResult<Self> {
        let root = root.into();
        for dir in [root.join("cas"), root.join("fingerprints")] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| VstoreError::io(format!("creating tier directory {}", dir.display()), e))?;
        }
        debug!("Opened {} filesystem tier at {}", role, root.display());

        Ok(Self {
            role,
            root,
            pins: Mutex::new(HashMap::new()),
        })
    }

    /// Tier root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        let hex = hash.to_hex();
        self.root.join("cas").join(&hex[..2]).join(hex)
    }

    fn weak_dir(&self, weak: &WeakFingerprint) -> PathBuf {
        self.root.join("fingerprints").join(weak.to_hex())
    }

    fn record_path(&self, fingerprint: &StrongFingerprint) -> PathBuf {
        self.weak_dir(&fingerprint.weak).join(format!(
            "{}-{}.json",
            fingerprint.path_set.to_hex(),
            fingerprint.hash.to_hex()
        ))
    }

    fn temp_path(path: &Path) -> PathBuf {
        path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()))
    }

    /// Write `bytes` to a sibling temp file of `path` and return the temp path
    async fn write_temp(&self, path: &Path, bytes: &[u8]) -> VstoreResult<PathBuf> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| VstoreError::io(format!("creating directory {}", parent.display()), e))?;
        }
        let temp = Self::temp_path(path);
        fs::write(&temp, bytes)
            .await
            .map_err(|e| VstoreError::io(format!("writing {}", temp.display()), e))?;
        Ok(temp)
    }

    /// Count blobs and records by walking the tree
    pub async fn stats(&self) -> VstoreResult<TierStats> {
        let mut stats = TierStats::default();

        for shard in list_dir(&self.root.join("cas")).await? {
            for blob in list_dir(&shard).await? {
                if is_temp(&blob) {
                    continue;
                }
                stats.blobs += 1;
                if let Ok(meta) = fs::metadata(&blob).await {
                    stats.blob_bytes += meta.len();
                }
            }
        }

        for weak_dir in list_dir(&self.root.join("fingerprints")).await? {
            stats.records += list_dir(&weak_dir)
                .await?
                .iter()
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .count() as u64;
        }

        Ok(stats)
    }
}

fn is_temp(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.starts_with("tmp-"))
}

/// Entries of a directory, empty when it does not exist
async fn list_dir(dir: &Path) -> VstoreResult<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(VstoreError::io(format!("reading {}", dir.display()), e)),
    };

    let mut paths = vec![];
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| VstoreError::io(format!("reading {}", dir.display()), e))?
    {
        paths.push(entry.path());
    }
    Ok(paths)
}

/// Read one record file, `None` when it does not exist
async fn read_record(path: &Path) -> VstoreResult<Option<FingerprintRecord>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(VstoreError::io(format!("reading record {}", path.display()), e)),
    }
}

#[async_trait]
impl ContentStore for FilesystemTier {
    fn role(&self) -> Tier {
        self.role
    }

    fn backend(&self) -> &'static str {
        "filesystem"
    }

    async fn pin(&self, hash: &ContentHash) -> VstoreResult<PinOutcome> {
        let path = self.blob_path(hash);
        match fs::metadata(&path).await {
            Ok(_) => {
                *self
                    .pins
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entry(*hash)
                    .or_insert(0) += 1;
                Ok(PinOutcome::Pinned)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(PinOutcome::NotFound),
            Err(e) => Err(VstoreError::io(format!("checking {}", path.display()), e)),
        }
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
        let path = self.blob_path(hash);
        match fs::File::open(&path).await {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(VstoreError::io(format!("opening {}", path.display()), e)),
        }
    }

    async fn put(&self, bytes: &[u8]) -> VstoreResult<ContentHash> {
        let hash = ContentHash::of(bytes);
        let path = self.blob_path(&hash);

        if fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(hash);
        }

        let temp = self.write_temp(&path, bytes).await?;
        fs::rename(&temp, &path)
            .await
            .map_err(|e| VstoreError::io(format!("moving blob into {}", path.display()), e))?;

        debug!("Stored {} bytes as {} in {} tier", bytes.len(), hash.short(), self.role);
        Ok(hash)
    }

    async fn replace(&self, bytes: &[u8]) -> VstoreResult<ContentHash> {
        let hash = ContentHash::of(bytes);
        let path = self.blob_path(&hash);

        // rename replaces an existing blob atomically
        let temp = self.write_temp(&path, bytes).await?;
        fs::rename(&temp, &path)
            .await
            .map_err(|e| VstoreError::io(format!("replacing blob {}", path.display()), e))?;

        debug!("Replaced {} in {} tier", hash.short(), self.role);
        Ok(hash)
    }
}

#[async_trait]
impl FingerprintStore for FilesystemTier {
    async fn get_cache_entries(&self, weak: &WeakFingerprint) -> VstoreResult<RecordStream> {
        let dir = self.weak_dir(weak);
        let entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(stream::empty().boxed()),
            Err(e) => return Err(VstoreError::io(format!("reading {}", dir.display()), e)),
        };

        // Records are read one at a time as the caller pulls
        let records = stream::unfold(entries, |mut entries| async move {
            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => return None,
                    Err(e) => {
                        return Some((Err(VstoreError::io("reading fingerprint directory", e)), entries))
                    }
                };

                let path = entry.path();
                if !path.extension().is_some_and(|ext| ext == "json") {
                    continue;
                }

                match read_record(&path).await {
                    Ok(Some(record)) => return Some((Ok(record), entries)),
                    // Removed between listing and reading
                    Ok(None) => continue,
                    Err(e) => return Some((Err(e), entries)),
                }
            }
        });

        Ok(records.boxed())
    }

    async fn get_cache_entry(
        &self,
        fingerprint: &StrongFingerprint,
    ) -> VstoreResult<Option<CacheEntry>> {
        Ok(read_record(&self.record_path(fingerprint))
            .await?
            .map(|record| record.entry))
    }

    async fn add_or_get(
        &self,
        fingerprint: &StrongFingerprint,
        entry: CacheEntry,
    ) -> VstoreResult<AddOrGet> {
        let path = self.record_path(fingerprint);
        let record = FingerprintRecord::new(*fingerprint, entry);
        let temp = self
            .write_temp(&path, &serde_json::to_vec_pretty(&record)?)
            .await?;

        let linked = fs::hard_link(&temp, &path).await;
        // The temp name is no longer needed either way
        if let Err(e) = fs::remove_file(&temp).await {
            debug!("Failed to remove temp record {}: {}", temp.display(), e);
        }

        match linked {
            Ok(()) => {
                debug!("{} filesystem tier added {}", self.role, fingerprint);
                Ok(AddOrGet {
                    entry: record.entry,
                    newly_added: true,
                })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let existing = read_record(&path).await?.ok_or_else(|| {
                    VstoreError::tier(self.role, "add_or_get", format!("record {} vanished", path.display()))
                })?;
                Ok(AddOrGet {
                    entry: existing.entry,
                    newly_added: false,
                })
            }
            Err(e) => Err(VstoreError::io(format!("publishing {}", path.display()), e)),
        }
    }
}

#[async_trait]
impl TierRepair for FilesystemTier {
    async fn repair(
        &self,
        fingerprint: &StrongFingerprint,
        corrected: CacheEntry,
    ) -> VstoreResult<()> {
        let path = self.record_path(fingerprint);
        let record = FingerprintRecord::new(*fingerprint, corrected);
        let temp = self
            .write_temp(&path, &serde_json::to_vec_pretty(&record)?)
            .await?;

        fs::rename(&temp, &path)
            .await
            .map_err(|e| VstoreError::io(format!("replacing {}", path.display()), e))?;

        debug!("Repaired {} in {} tier", fingerprint, self.role);
        Ok(())
    }
}
