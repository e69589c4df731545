//! vstore - Vertical Build-Artifact Cache
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use vstore::cli::{commands, Cli, Commands};
use vstore::config::{Config, ConfigManager};
use vstore::error::VstoreResult;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> VstoreResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let mut config = config_manager.load().await?;

    init_logging(cli.verbose, &config);
    debug!("Loaded configuration from {}", config_manager.path().display());

    cli.apply_overrides(&mut config);

    match cli.command {
        Commands::Put(args) => commands::put(args, &config).await,
        Commands::Get(args) => commands::get(args, &config).await,
        Commands::Pin(args) => commands::pin(args, &config).await,
        Commands::Lookup(args) => commands::lookup(args, &config).await,
        Commands::Publish(args) => commands::publish(args, &config).await,
        Commands::Status(args) => commands::status(args, &config).await,
        Commands::Config(args) => commands::config(args, &config, &config_manager).await,
    }
}

/// 0 = warn, 1 = info, 2+ = debug; `general.verbose` counts as one level
fn init_logging(verbose: u8, config: &Config) {
    let level = verbose.max(u8::from(config.general.verbose));
    let filter = match level {
        0 => EnvFilter::new("vstore=warn"),
        1 => EnvFilter::new("vstore=info"),
        _ => EnvFilter::new("vstore=debug"),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if config.general.log_format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}
