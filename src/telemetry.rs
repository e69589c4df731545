//! Cache telemetry
//!
//! The aggregator reports notable events to a `TelemetrySink` held by the
//! instance. Emission is fire-and-forget: a sink must return immediately
//! and must never fail the operation that emitted the event.
//!
//! Sinks:
//! - `TracingSink`: structured `tracing` events
//! - `AuditSink`: JSON lines appended to a file by a background writer
//! - `RecordingSink`: keeps events in memory for inspection
//! - `FanoutSink`: forwards to several sinks

use crate::flight::FlightKind;
use crate::model::{ContentHash, Determinism, StrongFingerprint, Tier};
use crate::resolver::DeterminismViolation;
use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// Event reported by the aggregator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CacheEvent {
    /// Content copied from remote into local
    ContentBackfilled { hash: ContentHash },
    /// Remote record copied into local
    EntryBackfilled { fingerprint: StrongFingerprint },
    /// Content copied from local into remote ahead of an entry mirror
    ContentMirrored { hash: ContentHash },
    /// Two equally deterministic entries disagreed
    DeterminismViolation(DeterminismViolation),
    /// A tier's entry was corrected by reconciliation
    TierRepaired {
        tier: Tier,
        fingerprint: StrongFingerprint,
        determinism: Determinism,
    },
    /// Remote tier failed or timed out; the call fell back to local only
    RemoteDegraded {
        operation: &'static str,
        reason: String,
    },
    /// A caller joined an operation already in flight
    SingleFlightDeduplicated { kind: FlightKind, key: String },
    /// A background write-behind mirror failed
    MirrorFailed {
        fingerprint: StrongFingerprint,
        reason: String,
    },
    /// Retrieved bytes did not match the requested hash
    IntegrityFailure {
        tier: Tier,
        expected: ContentHash,
        actual: ContentHash,
    },
}

impl CacheEvent {
    /// Event name as written to the audit log
    pub fn name(&self) -> &'static str {
        match self {
            Self::ContentBackfilled { .. } => "content_backfilled",
            Self::EntryBackfilled { .. } => "entry_backfilled",
            Self::ContentMirrored { .. } => "content_mirrored",
            Self::DeterminismViolation(_) => "determinism_violation",
            Self::TierRepaired { .. } => "tier_repaired",
            Self::RemoteDegraded { .. } => "remote_degraded",
            Self::SingleFlightDeduplicated { .. } => "single_flight_deduplicated",
            Self::MirrorFailed { .. } => "mirror_failed",
            Self::IntegrityFailure { .. } => "integrity_failure",
        }
    }
}

/// Receiver of cache events
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: &CacheEvent);
}

/// Discards every event
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn emit(&self, _event: &CacheEvent) {}
}

/// Forwards events to `tracing`
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: &CacheEvent) {
        match event {
            CacheEvent::DeterminismViolation(v) => warn!(
                fingerprint = %v.fingerprint,
                kept = ?v.kept.outputs,
                rejected = ?v.rejected.outputs,
                "determinism violation"
            ),
            CacheEvent::RemoteDegraded { operation, reason } => {
                warn!(operation, reason = reason.as_str(), "remote tier degraded")
            }
            CacheEvent::MirrorFailed {
                fingerprint,
                reason,
            } => warn!(fingerprint = %fingerprint, reason = reason.as_str(), "mirror failed"),
            CacheEvent::IntegrityFailure {
                tier,
                expected,
                actual,
            } => warn!(tier = %tier, expected = %expected, actual = %actual, "content integrity failure"),
            other => info!(event = other.name(), detail = ?other, "cache event"),
        }
    }
}

/// Keeps every event in memory
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<CacheEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of events so far
    pub fn events(&self) -> Vec<CacheEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of recorded events with the given name
    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.name() == name)
            .count()
    }
}

impl TelemetrySink for RecordingSink {
    fn emit(&self, event: &CacheEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Forwards each event to every inner sink
pub struct FanoutSink {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn TelemetrySink>>) -> Self {
        Self { sinks }
    }
}

impl TelemetrySink for FanoutSink {
    fn emit(&self, event: &CacheEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

enum AuditMessage {
    Line(String),
    Flush(oneshot::Sender<()>),
}

/// File-based audit sink that appends JSON lines.
///
/// Lines are handed to a writer task over a channel, so `emit` never waits
/// on the disk. Write failures are logged and dropped.
pub struct AuditSink {
    tx: mpsc::UnboundedSender<AuditMessage>,
    path: PathBuf,
}

impl AuditSink {
    /// Start the writer task. Must be called inside a tokio runtime.
    pub fn spawn(path: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let writer_path = path.clone();

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    AuditMessage::Line(line) => {
                        if let Err(e) = append(&writer_path, &line).await {
                            warn!("Failed to write audit log: {}", e);
                        }
                    }
                    AuditMessage::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Self { tx, path }
    }

    /// Audit log location
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Wait until every line emitted so far has been written
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(AuditMessage::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

impl TelemetrySink for AuditSink {
    fn emit(&self, event: &CacheEvent) {
        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": event.name(),
            "data": event,
        });

        let mut line = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize audit event: {}", e);
                return;
            }
        };
        line.push('\n');

        // Writer gone means the runtime is shutting down
        let _ = self.tx.send(AuditMessage::Line(line));
    }
}

async fn append(path: &PathBuf, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;

    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}
