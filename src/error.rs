//! Error types for vstore
//!
//! All modules use `VstoreResult<T>` as their return type. A cache miss is
//! never an error; it is reported through the normal result types.

use crate::model::{ContentHash, StrongFingerprint, Tier};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for vstore operations
pub type VstoreResult<T> = Result<T, VstoreError>;

/// All errors that can occur in vstore
#[derive(Error, Debug)]
pub enum VstoreError {
    // Session errors
    #[error("Session is closed")]
    SessionClosed,

    #[error("Operation cancelled")]
    Cancelled,

    // Tier errors
    #[error("{tier} tier error during {operation}: {reason}")]
    Tier {
        tier: Tier,
        operation: &'static str,
        reason: String,
    },

    #[error("Remote tier timed out after {}ms during {operation}", .timeout.as_millis())]
    RemoteTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Both tiers failed: local: {local}; remote: {remote}")]
    BothTiersFailed {
        local: Box<VstoreError>,
        remote: Box<VstoreError>,
    },

    #[error("Write of {fingerprint} to remote tier failed: {reason}")]
    WriteFailed {
        fingerprint: StrongFingerprint,
        reason: String,
    },

    // Content errors
    #[error("Content hash mismatch in {tier} tier: expected {expected}, got {actual}")]
    ContentHashMismatch {
        tier: Tier,
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("Content not found: {0}")]
    ContentNotFound(ContentHash),

    #[error("Invalid digest {value:?}: {reason}")]
    InvalidDigest { value: String, reason: String },

    #[error("Invalid step record {path}: {reason}")]
    InvalidRecord { path: PathBuf, reason: String },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Conflicting aggregator configuration: {0}")]
    ConfigConflict(String),

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// Outcome of a deduplicated operation, observed by every waiter
    #[error(transparent)]
    Shared(Arc<VstoreError>),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl VstoreError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a tier error
    pub fn tier(tier: Tier, operation: &'static str, reason: impl Into<String>) -> Self {
        Self::Tier {
            tier,
            operation,
            reason: reason.into(),
        }
    }

    /// The underlying error, looking through shared single-flight outcomes
    pub fn root(&self) -> &VstoreError {
        match self {
            Self::Shared(inner) => inner.root(),
            other => other,
        }
    }

    /// Check if the error is a transient tier condition that a fallback tier can absorb
    pub fn is_transient(&self) -> bool {
        matches!(
            self.root(),
            Self::Tier { .. } | Self::RemoteTimeout { .. } | Self::Io { .. }
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self.root() {
            Self::ConfigConflict(_) => {
                Some("write_policy = \"write-through\" requires remote_read_enabled = true")
            }
            Self::RemoteTimeout { .. } => Some("Raise aggregator.remote_timeout_ms or check the remote tier"),
            Self::SessionClosed => Some("Open a new session from the aggregator"),
            Self::ContentHashMismatch { .. } => Some("The tier holds corrupt content for this hash"),
            Self::InvalidDigest { .. } => Some("Digests are 64 hex characters"),
            _ => None,
        }
    }
}
