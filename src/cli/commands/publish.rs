//! Publish command - record a cache entry for a build step
//!
//! The step is described by a JSON record:
//!
//! ```json
//! {
//!   "tool": "cc",
//!   "args": ["-c", "main.c"],
//!   "declared_inputs": ["main.c"],
//!   "inputs": { "main.c": "<hash>", "util.h": "<hash>" },
//!   "outputs": ["<hash>"],
//!   "metadata": "<hash>",
//!   "determinism": "deterministic"
//! }
//! ```
//!
//! `inputs` maps every path the step actually read to the hash of its
//! content; it becomes the path set of the strong fingerprint.

use crate::aggregator::PublishOutcome;
use crate::cli::args::{OutputFormat, PublishArgs};
use crate::cli::CacheHandle;
use crate::config::Config;
use crate::error::{VstoreError, VstoreResult};
use crate::model::{CacheEntry, ContentHash, Determinism, PathSet, StrongFingerprint, WeakFingerprint};
use console::style;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;

/// Build step description accepted by `vstore publish`
#[derive(Debug, Clone, Deserialize)]
pub struct StepRecord {
    pub tool: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub declared_inputs: Vec<String>,

    /// Observed input path -> content hash
    #[serde(default)]
    pub inputs: BTreeMap<String, ContentHash>,

    pub outputs: Vec<ContentHash>,

    pub metadata: ContentHash,

    #[serde(default = "default_determinism")]
    pub determinism: Determinism,
}

fn default_determinism() -> Determinism {
    Determinism::PossiblyNonDeterministic
}

impl StepRecord {
    /// Load and parse a record file
    pub async fn load(path: &Path) -> VstoreResult<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| VstoreError::io(format!("reading {}", path.display()), e))?;
        serde_json::from_str(&content).map_err(|e| VstoreError::InvalidRecord {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn weak_fingerprint(&self) -> WeakFingerprint {
        WeakFingerprint::compute(&self.tool, &self.args, &self.declared_inputs)
    }

    pub fn path_set(&self) -> PathSet {
        PathSet::new(self.inputs.keys().cloned())
    }

    /// Strong fingerprint over the observed inputs, hashed in path set order
    pub fn strong_fingerprint(&self) -> StrongFingerprint {
        let input_hashes: Vec<ContentHash> = self.inputs.values().copied().collect();
        StrongFingerprint::derive(self.weak_fingerprint(), &self.path_set(), &input_hashes)
    }

    pub fn entry(&self) -> CacheEntry {
        CacheEntry::new(self.outputs.clone(), self.metadata, self.determinism)
    }
}

/// Execute the publish command
pub async fn execute(args: PublishArgs, config: &Config) -> VstoreResult<()> {
    let record = StepRecord::load(&args.record).await?;
    let fingerprint = record.strong_fingerprint();

    let cache = CacheHandle::open(config).await?;
    let session = cache.session();
    let result = async {
        session.put_path_set(&record.path_set()).await?;
        session.add_or_get(fingerprint, record.entry()).await
    }
    .await;
    cache.finish(session).await?;
    let outcome = result?;

    match args.format {
        OutputFormat::Table => print_table(&fingerprint, &outcome),
        OutputFormat::Json => print_json(&fingerprint, &outcome)?,
        OutputFormat::Plain => println!("{}", fingerprint.hash),
    }

    Ok(())
}

fn print_table(fingerprint: &StrongFingerprint, outcome: &PublishOutcome) {
    let status = if outcome.newly_added {
        style("published").green()
    } else {
        style("existing entry kept").yellow()
    };
    println!("{} {}", style("Entry:").bold(), status);
    println!("  weak:        {}", fingerprint.weak);
    println!("  strong:      {}", fingerprint.hash);
    println!("  determinism: {}", outcome.entry.determinism);
    println!("  outputs:     {}", outcome.entry.outputs.len());

    if let Some(violation) = &outcome.violation {
        println!(
            "{} determinism violation: {} output(s) rejected in favour of the existing entry",
            style("warning:").yellow(),
            violation.rejected.outputs.len()
        );
    }
}

fn print_json(fingerprint: &StrongFingerprint, outcome: &PublishOutcome) -> VstoreResult<()> {
    #[derive(Serialize)]
    struct PublishJson<'a> {
        fingerprint: &'a StrongFingerprint,
        newly_added: bool,
        entry: &'a CacheEntry,
        violation: Option<&'a crate::resolver::DeterminismViolation>,
    }

    let json = serde_json::to_string_pretty(&PublishJson {
        fingerprint,
        newly_added: outcome.newly_added,
        entry: &outcome.entry,
        violation: outcome.violation.as_ref(),
    })?;
    println!("{}", json);
    Ok(())
}
