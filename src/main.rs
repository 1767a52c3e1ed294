use anyhow::Result;
use clap::Parser;

mod cli;

use agentbox::Config;
use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    // RUST_LOG wins, then --verbose, then logging.level from config
    let configured = Config::load().ok().map(|c| c.logging.level);
    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        configured.unwrap_or_else(|| "info".to_string())
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .init();

    match cli.command {
        Commands::Inspect(args) => cli::inspect::run(args).await,
        Commands::CleanCache(args) => cli::cache::run_clean(args).await,
        Commands::WarmCache(args) => cli::cache::run_warm(args).await,
        Commands::Reconcile => cli::reconcile::run().await,
        Commands::Env(args) => cli::env::run(args).await,
        Commands::Config(args) => cli::config::run(args).await,
        Commands::Paths => cli::paths::run(),
    }
}
