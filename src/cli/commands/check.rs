//! Check command implementation.

use crate::core::config::{Config, ConfigOverrides, Strategy};
use crate::core::context::RequestContext;
use crate::ops::telemetry::init_tracing;
use crate::ops::StoreMetrics;
use crate::storage::{ListOptions, Storage, StorageRouter};
use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;
use std::sync::Arc;

/// Build the router from configuration and probe readiness.
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Also list the resource as these tenants.
    #[arg(short, long)]
    pub tenant: Vec<String>,

    /// Override the tenancy strategy (dedicated, union).
    #[arg(long)]
    pub strategy: Option<String>,

    /// Override backend endpoints (comma-separated).
    #[arg(long)]
    pub endpoints: Option<String>,

    /// Print Prometheus metrics after the probe.
    #[arg(long)]
    pub metrics: bool,
}

/// Run the check command.
pub async fn run_check(args: CheckArgs, config_path: &Path, log_level: Option<String>) -> Result<()> {
    let mut config = Config::from_file(config_path)?;
    config.apply_overrides(&ConfigOverrides {
        log_level,
        strategy: args.strategy.as_deref().map(parse_strategy).transpose()?,
        endpoints: args
            .endpoints
            .as_deref()
            .map(crate::core::config::split_csv)
            .unwrap_or_default(),
    });
    config.validate()?;
    init_tracing(&config.telemetry.log_level);

    let metrics = Arc::new(StoreMetrics::new());
    let router = StorageRouter::from_config(&config, Arc::clone(&metrics))
        .context("failed to build storage router")?;

    router
        .readiness_check()
        .await
        .context("root partition is not ready")?;
    println!(
        "✓ {} ready (strategy {}, backend {:?})",
        config.storage.resource, config.storage.strategy, config.backend.mode
    );

    let key = config.storage.resource.clone();
    for tenant in &args.tenant {
        let ctx = RequestContext::with_tenant(tenant.clone());
        let list = router
            .get_list(&ctx, &key, ListOptions::default())
            .await
            .with_context(|| format!("list failed for tenant {}", tenant))?;
        println!(
            "  tenant {}: {} item(s) at revision {}",
            tenant,
            list.items.len(),
            list.resource_version
        );
    }

    println!("  children: {}", describe_children(&router).join(", "));

    if args.metrics {
        print!("{}", metrics.export());
    }

    router.destroy_all();
    Ok(())
}

/// Live children with their age, e.g. `tenant:acme (12ms)`.
fn describe_children(router: &StorageRouter) -> Vec<String> {
    router
        .tenants()
        .iter()
        .map(|kind| match router.child_age(kind) {
            Some(age) => format!("{} ({}ms)", kind, age.as_millis()),
            None => kind.to_string(),
        })
        .collect()
}

fn parse_strategy(raw: &str) -> Result<Strategy> {
    match raw {
        "dedicated" => Ok(Strategy::Dedicated),
        "union" => Ok(Strategy::Union),
        other => anyhow::bail!("unknown strategy: {} (expected dedicated or union)", other),
    }
}
