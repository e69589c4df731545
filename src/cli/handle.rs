//! Aggregator wiring shared by CLI commands

use crate::aggregator::VerticalAggregator;
use crate::config::{Config, ConfigManager};
use crate::error::VstoreResult;
use crate::model::{ContentHash, Tier};
use crate::session::Session;
use crate::store::{CacheTier, FilesystemTier};
use crate::telemetry::{AuditSink, FanoutSink, TelemetrySink, TracingSink};
use std::sync::Arc;
use tracing::debug;

/// Aggregator over the configured filesystem tiers, plus the audit sink
/// that must be drained before exit
pub struct CacheHandle {
    pub aggregator: Arc<VerticalAggregator>,
    pub local: Arc<FilesystemTier>,
    pub remote: Arc<FilesystemTier>,
    audit: Option<Arc<AuditSink>>,
}

impl CacheHandle {
    pub async fn open(config: &Config) -> VstoreResult<Self> {
        let local = Arc::new(FilesystemTier::open(&config.tiers.local, Tier::Local).await?);
        let remote = Arc::new(FilesystemTier::open(&config.tiers.remote, Tier::Remote).await?);

        let mut sinks: Vec<Arc<dyn TelemetrySink>> = vec![Arc::new(TracingSink)];
        let audit = if config.general.audit_log {
            let sink = Arc::new(AuditSink::spawn(ConfigManager::audit_log_path()));
            sinks.push(sink.clone());
            Some(sink)
        } else {
            None
        };

        let aggregator = VerticalAggregator::new(
            local.clone() as Arc<dyn CacheTier>,
            remote.clone() as Arc<dyn CacheTier>,
            config.aggregator.clone(),
            Arc::new(FanoutSink::new(sinks)),
        )?;

        debug!(
            local = %config.tiers.local.display(),
            remote = %config.tiers.remote.display(),
            "cache opened"
        );

        Ok(Self {
            aggregator,
            local,
            remote,
            audit,
        })
    }

    pub fn session(&self) -> Session {
        self.aggregator.open_session()
    }

    /// Close the session, then wait for background transfers and audit lines
    pub async fn finish(&self, session: Session) -> VstoreResult<()> {
        session.close().await?;
        self.aggregator.flush().await;
        if let Some(audit) = &self.audit {
            audit.flush().await;
        }
        Ok(())
    }
}

/// Parse a hex content hash given on the command line
pub fn parse_hash(value: &str) -> VstoreResult<ContentHash> {
    value.trim().parse()
}
