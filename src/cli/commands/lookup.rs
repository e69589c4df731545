//! Lookup command - list entries for a weak fingerprint

use crate::aggregator::CacheLookup;
use crate::cli::args::{LookupArgs, OutputFormat};
use crate::cli::CacheHandle;
use crate::config::Config;
use crate::error::VstoreResult;
use crate::model::{Determinism, WeakFingerprint};
use console::style;
use serde::Serialize;

/// Execute the lookup command
pub async fn execute(args: LookupArgs, config: &Config) -> VstoreResult<()> {
    let weak: WeakFingerprint = args.weak.trim().parse()?;

    let cache = CacheHandle::open(config).await?;
    let session = cache.session();
    let result = session.get_cache_entries(weak).await;
    cache.finish(session).await?;
    let lookup = result?;

    match args.format {
        OutputFormat::Table => print_table(&weak, &lookup),
        OutputFormat::Json => print_json(&weak, &lookup)?,
        OutputFormat::Plain => print_plain(&lookup),
    }

    Ok(())
}

fn print_table(weak: &WeakFingerprint, lookup: &CacheLookup) {
    if lookup.degraded {
        eprintln!(
            "{} remote tier unavailable, showing local results only",
            style("warning:").yellow()
        );
    }

    if lookup.is_miss() {
        println!("No entries for {}", weak);
        return;
    }

    println!(
        "{:<66} {:<30} {:<8} {:<17}",
        style("FINGERPRINT").bold(),
        style("DETERMINISM").bold(),
        style("OUTPUTS").bold(),
        style("CREATED").bold()
    );
    println!("{}", "-".repeat(124));

    for record in &lookup.records {
        let determinism = match record.entry.determinism {
            Determinism::ToolDeterministic | Determinism::Deterministic => {
                style(record.entry.determinism.as_str()).green()
            }
            Determinism::SinglePhaseNonDeterministic => {
                style(record.entry.determinism.as_str()).yellow()
            }
            Determinism::PossiblyNonDeterministic => style(record.entry.determinism.as_str()).dim(),
        };
        let created = record.entry.created_at.format("%Y-%m-%d %H:%M").to_string();

        println!(
            "{:<66} {:<30} {:<8} {:<17}",
            record.fingerprint.hash,
            determinism,
            record.entry.outputs.len(),
            created
        );
    }

    for violation in &lookup.violations {
        println!(
            "{} determinism violation for {}",
            style("warning:").yellow(),
            violation.fingerprint
        );
    }

    println!();
    let source = lookup
        .source
        .map(|t| t.to_string())
        .unwrap_or_else(|| "none".to_string());
    println!("{} entr(ies) from {} tier", lookup.records.len(), source);
}

fn print_json(weak: &WeakFingerprint, lookup: &CacheLookup) -> VstoreResult<()> {
    #[derive(Serialize)]
    struct LookupJson<'a> {
        weak: &'a WeakFingerprint,
        source: Option<crate::model::Tier>,
        degraded: bool,
        records: &'a [crate::model::FingerprintRecord],
        violations: &'a [crate::resolver::DeterminismViolation],
    }

    let json = serde_json::to_string_pretty(&LookupJson {
        weak,
        source: lookup.source,
        degraded: lookup.degraded,
        records: &lookup.records,
        violations: &lookup.violations,
    })?;
    println!("{}", json);
    Ok(())
}

fn print_plain(lookup: &CacheLookup) {
    for record in &lookup.records {
        println!("{}", record.fingerprint.hash);
    }
}
