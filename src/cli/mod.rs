//! Command-line interface

pub mod args;
pub mod commands;
mod handle;

pub use args::{Cli, Commands};
pub use handle::{parse_hash, CacheHandle};
