use anyhow::{Context, Result};
use clap::Args;

use agentbox::sandbox::Ecosystem;
use agentbox::{Config, SandboxOrchestrator};

#[derive(Args)]
pub struct CleanCacheArgs {
    /// Only delete entries unused for cache.prune_days instead of purging
    #[arg(long)]
    pub trim: bool,
}

#[derive(Args)]
pub struct WarmCacheArgs {
    /// Package ecosystem: pip or npm
    pub ecosystem: String,

    /// Packages to download into the cache
    #[arg(required = true)]
    pub packages: Vec<String>,
}

pub async fn run_clean(args: CleanCacheArgs) -> Result<()> {
    let config = Config::load()?;
    let _lock = super::maintenance_lock(&config).await?;
    let orchestrator = SandboxOrchestrator::from_config(&config)?;

    orchestrator
        .clean_cache(args.trim)
        .await
        .context("Cache maintenance failed")?;

    if args.trim {
        println!(
            "Pruned cache entries unused for {} days",
            config.cache.prune_days
        );
    } else {
        println!("Purged and recreated cache volumes");
    }
    Ok(())
}

pub async fn run_warm(args: WarmCacheArgs) -> Result<()> {
    let config = Config::load()?;
    let ecosystem: Ecosystem = args.ecosystem.parse()?;
    let _lock = super::maintenance_lock(&config).await?;
    let orchestrator = SandboxOrchestrator::from_config(&config)?;

    orchestrator
        .warm_cache(ecosystem, &args.packages)
        .await
        .with_context(|| format!("Failed to warm {} cache", ecosystem))?;

    println!(
        "Warmed {} cache with {} package(s)",
        ecosystem,
        args.packages.len()
    );
    Ok(())
}
