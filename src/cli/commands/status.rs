//! Status command - show tier locations, policy and usage

use crate::cli::args::{OutputFormat, StatusArgs};
use crate::config::Config;
use crate::error::VstoreResult;
use crate::model::Tier;
use crate::store::{FilesystemTier, TierStats};
use console::{style, Emoji};
use serde::Serialize;
use std::path::{Path, PathBuf};

static CHECK: Emoji<'_, '_> = Emoji("✓ ", "[OK] ");
static CROSS: Emoji<'_, '_> = Emoji("✗ ", "[FAIL] ");

#[derive(Serialize)]
struct TierStatus {
    tier: Tier,
    root: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<TierStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn probe(root: &Path, tier: Tier) -> TierStatus {
    let stats = match FilesystemTier::open(root, tier).await {
        Ok(opened) => opened.stats().await,
        Err(e) => Err(e),
    };

    match stats {
        Ok(stats) => TierStatus {
            tier,
            root: root.to_path_buf(),
            stats: Some(stats),
            error: None,
        },
        Err(e) => TierStatus {
            tier,
            root: root.to_path_buf(),
            stats: None,
            error: Some(e.to_string()),
        },
    }
}

/// Execute the status command
pub async fn execute(args: StatusArgs, config: &Config) -> VstoreResult<()> {
    let tiers = [
        probe(&config.tiers.local, Tier::Local).await,
        probe(&config.tiers.remote, Tier::Remote).await,
    ];
    let policy = config.aggregator.validate().err().map(|e| e.to_string());

    match args.format {
        OutputFormat::Json => {
            #[derive(Serialize)]
            struct StatusJson<'a> {
                tiers: &'a [TierStatus],
                aggregator: &'a crate::config::AggregatorConfig,
                #[serde(skip_serializing_if = "Option::is_none")]
                policy_error: Option<&'a str>,
            }

            let json = serde_json::to_string_pretty(&StatusJson {
                tiers: &tiers,
                aggregator: &config.aggregator,
                policy_error: policy.as_deref(),
            })?;
            println!("{}", json);
        }
        OutputFormat::Plain => {
            for status in &tiers {
                let ok = if status.error.is_none() { "ok" } else { "error" };
                println!("{}\t{}\t{}", status.tier, ok, status.root.display());
            }
        }
        OutputFormat::Table => print_table(&tiers, config, policy.as_deref()),
    }

    Ok(())
}

fn print_table(tiers: &[TierStatus], config: &Config, policy_error: Option<&str>) {
    println!("{}", style("vstore Status").bold().cyan());
    println!();

    println!("{}", style("Tiers:").bold());
    for status in tiers {
        match (&status.stats, &status.error) {
            (Some(stats), _) => println!(
                "  {} {:<7} {} ({} blobs, {} bytes, {} records)",
                CHECK,
                status.tier,
                status.root.display(),
                stats.blobs,
                stats.blob_bytes,
                stats.records
            ),
            (None, Some(error)) => println!(
                "  {} {:<7} {} - {}",
                CROSS,
                status.tier,
                status.root.display(),
                style(error).red()
            ),
            (None, None) => {}
        }
    }

    let aggregator = &config.aggregator;
    println!();
    println!("{}", style("Policy:").bold());
    println!("  write policy:         {}", aggregator.write_policy);
    println!("  remote reads:         {}", enabled(aggregator.remote_read_enabled));
    println!("  remote timeout:       {}ms", aggregator.remote_timeout_ms);
    println!("  backfill remote hits: {}", enabled(aggregator.backfill_on_remote_hit));
    println!("  await backfill:       {}", enabled(aggregator.await_backfill));
    println!("  verify local hits:    {}", enabled(aggregator.verify_local_hits));

    println!();
    match policy_error {
        None if tiers.iter().all(|t| t.error.is_none()) => {
            println!("{}", style("All checks passed").green().bold())
        }
        None => println!("{}", style("Some tiers are unavailable").yellow().bold()),
        Some(reason) => println!("{} {}", CROSS, style(reason).red()),
    }
}

fn enabled(flag: bool) -> &'static str {
    if flag {
        "enabled"
    } else {
        "disabled"
    }
}
