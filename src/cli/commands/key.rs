//! Key command implementation.

use crate::storage::keys::{qualify_key, KeyShape};
use anyhow::Result;
use clap::{Args, Subcommand};

/// Key rewriting and key-shape inspection.
#[derive(Args, Debug)]
pub struct KeyArgs {
    #[command(subcommand)]
    pub command: KeyCommand,
}

/// Key subcommands.
#[derive(Subcommand, Debug)]
pub enum KeyCommand {
    /// Print the tenant-qualified form of a key.
    Qualify {
        /// Tenant ("" for root).
        tenant: String,
        /// Relative key.
        key: String,
    },
    /// Match a physical key against the shared tenant layout.
    Inspect {
        /// Resource to match.
        #[arg(short, long)]
        resource: String,
        /// Shared tenant prefix.
        #[arg(short, long, default_value = "/tenants")]
        prefix: String,
        /// Physical key.
        key: String,
    },
}

/// Run the key command.
pub fn run_key(args: KeyArgs) -> Result<()> {
    match args.command {
        KeyCommand::Qualify { tenant, key } => {
            println!("{}", qualify_key(&tenant, &key));
            Ok(())
        }
        KeyCommand::Inspect {
            resource,
            prefix,
            key,
        } => {
            println!("{}", describe(&KeyShape::new(&prefix, &resource), &key));
            Ok(())
        }
    }
}

fn describe(shape: &KeyShape, key: &str) -> String {
    match shape.matches(key) {
        Some(m) => format!(
            "match resource={} tenant={} namespace={} name={}",
            shape.resource(),
            m.tenant,
            m.namespace.unwrap_or("-"),
            m.name.unwrap_or("-"),
        ),
        None => match shape.tenant_of(key) {
            Some(tenant) => format!(
                "no match for resource={} (tenant {})",
                shape.resource(),
                tenant
            ),
            None => format!("no match: key is outside {}/", shape.prefix()),
        },
    }
}
