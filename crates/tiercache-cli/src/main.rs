mod cli;
mod commands;
mod output;

use anyhow::{Context, Result};
use clap::Parser;
use tiercache::{CacheConfig, CacheMetrics, TieredCache, observability};

use cli::{Cli, Commands};
use output::print_error;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    observability::init_tracing_with_level(&cli.log_level);
    let format = cli.format.unwrap_or_default();

    let mut config =
        CacheConfig::load(cli.config.as_deref()).context("failed to load cache configuration")?;
    if let Some(url) = &cli.redis_url {
        config.redis.enabled = true;
        config.redis.url = url.clone();
    }

    let cache = TieredCache::from_config(config, CacheMetrics::default())
        .await
        .context("failed to build cache")?;

    match &cli.command {
        Commands::Health => commands::health(&cache, format).await?,
        Commands::Stats => commands::stats(&cache, format).await?,
        Commands::Get(args) => commands::get(&cache, args, format).await?,
        Commands::Invalidate(args) => commands::invalidate(&cache, args, format).await?,
        Commands::Purge(args) => commands::purge(&cache, args, format).await?,
    }
    Ok(())
}
