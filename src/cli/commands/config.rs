//! Config command implementation.

use crate::core::config::Config;
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate a configuration file.
    Validate {
        /// Config file path (defaults to the global --config).
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print the configuration with defaults filled in.
    Show {
        /// Config file path (defaults to the global --config).
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Output format (toml, json).
        #[arg(long, default_value = "toml")]
        format: String,
    },
}

/// Run the config command. `default_path` is the global `--config`.
pub fn run_config(args: ConfigArgs, default_path: &Path) -> Result<()> {
    match args.command {
        ConfigCommand::Validate { config } => {
            validate_config(config.as_deref().unwrap_or(default_path))
        }
        ConfigCommand::Show { config, format } => {
            show_config(config.as_deref().unwrap_or(default_path), &format)
        }
    }
}

fn validate_config(path: &Path) -> Result<()> {
    let config = Config::from_file(path)?;
    config
        .validate()
        .with_context(|| format!("invalid configuration in {}", path.display()))?;

    println!("✓ Configuration is valid: {}", path.display());
    println!("  resource:   {}", config.storage.resource);
    println!("  strategy:   {}", config.storage.strategy);
    println!(
        "  prefixes:   root={} tenants={}",
        config.storage.root_prefix, config.storage.tenant_prefix
    );
    println!("  backend:    {:?}", config.backend.mode);
    if config.backend.cert_file.is_none() && config.backend.ca_file.is_none() {
        println!("  ⚠ Warning: no backend TLS material configured");
    }
    Ok(())
}

fn show_config(path: &Path, format: &str) -> Result<()> {
    let config = Config::from_file(path)?;
    let rendered = match format {
        "json" => serde_json::to_string_pretty(&config)?,
        "toml" => toml::to_string_pretty(&config)?,
        other => anyhow::bail!("unknown format: {} (expected toml or json)", other),
    };
    println!("{}", rendered);
    Ok(())
}
