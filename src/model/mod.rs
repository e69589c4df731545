//! Cache data model
//!
//! A build step is identified in two stages:
//!
//! | Key | Derived from | Unique to one result |
//! |-----|--------------|----------------------|
//! | `WeakFingerprint` | tool, command line, declared inputs | no |
//! | `StrongFingerprint` | weak fingerprint, observed `PathSet`, content at each path | yes |
//!
//! A `CacheEntry` maps a strong fingerprint to output `ContentHash`es.

pub mod entry;
pub mod fingerprint;
pub mod hash;

pub use entry::{CacheEntry, Determinism, FingerprintRecord, Tier};
pub use fingerprint::{PathSet, StrongFingerprint};
pub use hash::{ContentHash, WeakFingerprint};
