pub mod cache;
pub mod config;
pub mod env;
pub mod inspect;
pub mod paths;
pub mod reconcile;

use anyhow::Result;
use clap::{Parser, Subcommand};

use agentbox::concurrency::{MaintenanceLock, MaintenanceLockGuard};
use agentbox::config::Config;

#[derive(Parser)]
#[command(name = "agentbox")]
#[command(author, version, about = "Persistent, hardened container sandboxes for agent sessions")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Report cache volume sizes and live container count
    Inspect(inspect::InspectArgs),

    /// Prune (--trim) or purge and recreate the shared package caches
    CleanCache(cache::CleanCacheArgs),

    /// Pre-populate a package cache through the cache builder
    WarmCache(cache::WarmCacheArgs),

    /// Remove containers that no longer belong to an environment
    Reconcile,

    /// Manage environments
    Env(env::EnvArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Show resolved XDG directory paths
    Paths,
}

/// Take the cross-process maintenance lock, telling the user if we have to wait.
pub(crate) async fn maintenance_lock(config: &Config) -> Result<MaintenanceLockGuard> {
    let lock = MaintenanceLock::new(&config.paths)?;
    if let Some(guard) = lock.try_acquire()? {
        return Ok(guard);
    }
    eprintln!("Another maintenance run is in progress; waiting...");
    lock.acquire_async().await
}
