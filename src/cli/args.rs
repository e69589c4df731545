//! CLI argument definitions using clap derive

use crate::config::{Config, WritePolicy};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// vstore - vertical build-artifact cache
///
/// Serves build artifacts from a local tier backed by an authoritative
/// remote tier, backfilling and mirroring between them.
#[derive(Parser, Debug)]
#[command(name = "vstore")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "VSTORE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Local tier root (overrides tiers.local)
    #[arg(long, global = true, env = "VSTORE_LOCAL")]
    pub local: Option<PathBuf>,

    /// Remote tier root (overrides tiers.remote)
    #[arg(long, global = true, env = "VSTORE_REMOTE")]
    pub remote: Option<PathBuf>,

    /// Write policy (overrides aggregator.write_policy)
    #[arg(long, global = true)]
    pub policy: Option<PolicyArg>,
}

impl Cli {
    /// Apply command-line overrides on top of the loaded configuration
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(local) = &self.local {
            config.tiers.local = local.clone();
        }
        if let Some(remote) = &self.remote {
            config.tiers.remote = remote.clone();
        }
        if let Some(policy) = self.policy {
            config.aggregator.write_policy = policy.into();
        }
    }
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Store a file as content and print its hash
    Put(PutArgs),

    /// Retrieve verified content by hash
    Get(GetArgs),

    /// Make content available in the local tier
    Pin(PinArgs),

    /// List cache entries recorded for a weak fingerprint
    Lookup(LookupArgs),

    /// Publish a cache entry described by a JSON record
    Publish(PublishArgs),

    /// Show tier locations, policy and usage
    Status(StatusArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

/// Arguments for the put command
#[derive(Parser, Debug)]
pub struct PutArgs {
    /// File to store
    pub file: PathBuf,
}

/// Arguments for the get command
#[derive(Parser, Debug)]
pub struct GetArgs {
    /// Content hash (hex)
    pub hash: String,

    /// Write content to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Arguments for the pin command
#[derive(Parser, Debug)]
pub struct PinArgs {
    /// Content hashes (hex)
    #[arg(required = true)]
    pub hashes: Vec<String>,
}

/// Arguments for the lookup command
#[derive(Parser, Debug)]
pub struct LookupArgs {
    /// Weak fingerprint (hex)
    pub weak: String,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the publish command
#[derive(Parser, Debug)]
pub struct PublishArgs {
    /// JSON record describing the step and its outputs
    pub record: PathBuf,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the status command
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Output format for listing commands
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}

/// Write policy as accepted on the command line
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PolicyArg {
    WriteThrough,
    WriteBehind,
    LocalOnly,
}

impl From<PolicyArg> for WritePolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::WriteThrough => WritePolicy::WriteThrough,
            PolicyArg::WriteBehind => WritePolicy::WriteBehind,
            PolicyArg::LocalOnly => WritePolicy::LocalOnly,
        }
    }
}
