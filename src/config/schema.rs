//! Configuration schema for vstore
//!
//! Configuration is stored at `~/.config/vstore/config.toml`

use crate::error::{VstoreError, VstoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Tier routing policy
    pub aggregator: AggregatorConfig,

    /// Tier locations
    pub tiers: TiersConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Enable verbose logging
    pub verbose: bool,

    /// Log format: "text" or "json"
    pub log_format: String,

    /// Write cache events to the audit log
    pub audit_log: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            log_format: "text".to_string(),
            audit_log: true,
        }
    }
}

/// How writes accepted by the local tier reach the remote tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WritePolicy {
    /// Wait for the remote tier before returning
    WriteThrough,
    /// Return after the local write; mirror in the background
    WriteBehind,
    /// Never write the remote tier
    LocalOnly,
}

impl fmt::Display for WritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WriteThrough => write!(f, "write-through"),
            Self::WriteBehind => write!(f, "write-behind"),
            Self::LocalOnly => write!(f, "local-only"),
        }
    }
}

/// Aggregator settings, consumed once at construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub write_policy: WritePolicy,

    /// Consult the remote tier on local misses
    pub remote_read_enabled: bool,

    /// Per-call budget for remote tier operations
    pub remote_timeout_ms: u64,

    /// Copy remote hits (records and content) into the local tier
    pub backfill_on_remote_hit: bool,

    /// Hold lookups until content backfill completes
    pub await_backfill: bool,

    /// Cross-check local hits against the remote record for the same fingerprint
    pub verify_local_hits: bool,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            write_policy: WritePolicy::WriteBehind,
            remote_read_enabled: true,
            remote_timeout_ms: 5_000,
            backfill_on_remote_hit: true,
            await_backfill: false,
            verify_local_hits: true,
        }
    }
}

impl AggregatorConfig {
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    /// Reject policy combinations that cannot work
    pub fn validate(&self) -> VstoreResult<()> {
        if self.write_policy == WritePolicy::WriteThrough && !self.remote_read_enabled {
            return Err(VstoreError::ConfigConflict(
                "write-through requires remote reads to be enabled".to_string(),
            ));
        }
        if self.remote_timeout_ms == 0 {
            return Err(VstoreError::ConfigConflict(
                "remote_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Tier locations used by the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TiersConfig {
    /// Root directory of the local tier
    pub local: PathBuf,

    /// Root directory of the remote tier (typically a shared mount)
    pub remote: PathBuf,
}

impl Default for TiersConfig {
    fn default() -> Self {
        let state = crate::config::ConfigManager::state_dir();
        Self {
            local: state.join("local"),
            remote: state.join("remote"),
        }
    }
}
