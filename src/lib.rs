//! vstore - Vertical Build-Artifact Cache
//!
//! Presents a fast local tier and an authoritative remote tier as a
//! single cache: lookups fall through to the remote, remote hits are
//! backfilled locally, and local publishes are mirrored upstream.

pub mod aggregator;
pub mod cli;
pub mod config;
pub mod error;
pub mod flight;
pub mod model;
pub mod resolver;
pub mod session;
pub mod store;
pub mod telemetry;

pub use aggregator::VerticalAggregator;
pub use error::{VstoreError, VstoreResult};
pub use session::Session;
