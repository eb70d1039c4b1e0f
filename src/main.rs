//! Trellis - unified CLI entrypoint.
//!
//! Usage:
//!   trellis config validate --config config/trellis.toml
//!   trellis config show --format json
//!   trellis key qualify acme namespaces/ns1/widgets/w1
//!   trellis key inspect --resource widgets /tenants/acme/widgets/w1
//!   trellis check --tenant acme --metrics

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use trellis::cli::commands::{run_check, run_config, run_key};
use trellis::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Determine config path - use global --config or default
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/trellis.toml"));

    match cli.command {
        Commands::Config(args) => run_config(args, &config_path),
        Commands::Key(args) => run_key(args),
        Commands::Check(args) => run_check(args, &config_path, cli.log_level).await,
    }
}
