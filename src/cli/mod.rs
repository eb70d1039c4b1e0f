//! Command-line interface.
//!
//! Operator tooling for Trellis: configuration checks, key inspection and a
//! readiness probe that builds the router from configuration.

pub mod commands;

use clap::{Parser, Subcommand};

/// Trellis - tenant-aware storage router.
#[derive(Parser, Debug)]
#[command(name = "trellis")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Configuration operations.
    Config(commands::ConfigArgs),
    /// Key rewriting and key-shape inspection.
    Key(commands::KeyArgs),
    /// Build the router from configuration and probe readiness.
    Check(commands::CheckArgs),
}
