use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "tiercache")]
#[command(about = "Inspect and invalidate a two-tier (L1 + Redis) cache deployment")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a TOML config file (defaults to ./tiercache.toml when present)
    #[arg(short, long, global = true, env = "TIERCACHE_CONFIG")]
    pub config: Option<String>,

    /// Override the configured Redis URL and enable the remote tier
    #[arg(long, global = true, env = "TIERCACHE_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    /// Output format
    #[arg(short, long, global = true)]
    pub format: Option<OutputFormat>,
}

#[derive(Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ping both tiers and report the cache status
    Health,
    /// Show the effective configuration and tier status
    Stats,
    /// Read a key from the remote tier
    Get(GetArgs),
    /// Invalidate keys or wildcard patterns in the remote tier
    Invalidate(InvalidateArgs),
    /// Remove every key under the global prefix from the remote tier
    Purge(PurgeArgs),
}

#[derive(clap::Args)]
pub struct GetArgs {
    /// Logical key, without the global prefix
    pub key: String,
    /// Per-call key prefix
    #[arg(long)]
    pub prefix: Option<String>,
}

#[derive(clap::Args)]
pub struct InvalidateArgs {
    /// Keys or patterns (`*` within a segment, `**` across segments)
    #[arg(required = true)]
    pub patterns: Vec<String>,
    /// Per-call key prefix
    #[arg(long)]
    pub prefix: Option<String>,
}

#[derive(clap::Args)]
pub struct PurgeArgs {
    /// Confirm the purge
    #[arg(long)]
    pub yes: bool,
}
