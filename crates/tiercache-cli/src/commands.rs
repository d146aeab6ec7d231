use anyhow::{Result, bail};
use colored::Colorize;
use serde::Serialize;
use tiercache::{CacheLevel, CacheOptions, HealthState, TieredCache};

use crate::cli::{GetArgs, InvalidateArgs, OutputFormat, PurgeArgs};
use crate::output::{print_json, print_success, print_table, print_warning};

fn remote_options(prefix: Option<String>) -> CacheOptions {
    CacheOptions {
        ttl: None,
        prefix,
        level: Some(CacheLevel::RedisOnly),
    }
}

fn require_remote(cache: &TieredCache) -> Result<()> {
    if !cache.has_remote() {
        bail!("no remote tier configured; set redis.enabled in the config or pass --redis-url");
    }
    Ok(())
}

fn colored_status(status: HealthState) -> colored::ColoredString {
    match status {
        HealthState::Healthy => status.as_str().green(),
        HealthState::Degraded => status.as_str().yellow(),
        HealthState::Unhealthy => status.as_str().red(),
    }
}

pub async fn health(cache: &TieredCache, format: OutputFormat) -> Result<()> {
    let health = cache.health_check().await;

    match format {
        OutputFormat::Json => print_json(&health)?,
        OutputFormat::Table => {
            println!("{}: {}", "Status".cyan(), colored_status(health.status));
            print_table([
                ("L1 available", health.l1.available.to_string()),
                (
                    "L1 items",
                    format!("{}/{}", health.l1.item_count, health.l1.capacity),
                ),
                ("L2 backend", health.l2.backend.unwrap_or("none").to_string()),
                ("L2 available", health.l2.available.to_string()),
                (
                    "L2 latency",
                    health
                        .l2
                        .latency_ms
                        .map(|ms| format!("{ms:.2} ms"))
                        .unwrap_or_else(|| "-".to_string()),
                ),
                (
                    "L2 error",
                    health.l2.error.clone().unwrap_or_else(|| "-".to_string()),
                ),
            ]);
        }
    }
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Stats<'a> {
    global_prefix: &'a str,
    default_ttl_secs: u64,
    default_level: CacheLevel,
    l1_max_items: usize,
    l1_sweep_interval_secs: u64,
    metrics_enabled: bool,
    redis_url: Option<&'a str>,
    redis_pool_size: usize,
    status: HealthState,
    l2_latency_ms: Option<f64>,
}

pub async fn stats(cache: &TieredCache, format: OutputFormat) -> Result<()> {
    let config = cache.config();
    let health = cache.health_check().await;
    let stats = Stats {
        global_prefix: &config.global_prefix,
        default_ttl_secs: config.default_ttl_secs,
        default_level: config.default_level,
        l1_max_items: config.l1_max_items,
        l1_sweep_interval_secs: config.l1_sweep_interval_secs,
        metrics_enabled: config.enable_metrics,
        redis_url: cache.has_remote().then_some(config.redis.url.as_str()),
        redis_pool_size: config.redis.pool_size,
        status: health.status,
        l2_latency_ms: health.l2.latency_ms,
    };

    match format {
        OutputFormat::Json => print_json(&stats)?,
        OutputFormat::Table => {
            print_table([
                ("Global prefix", format!("{:?}", stats.global_prefix)),
                ("Default TTL", format!("{}s", stats.default_ttl_secs)),
                ("Default level", stats.default_level.to_string()),
                ("L1 capacity", stats.l1_max_items.to_string()),
                ("L1 sweep", format!("{}s", stats.l1_sweep_interval_secs)),
                ("Metrics", stats.metrics_enabled.to_string()),
                ("Redis", stats.redis_url.unwrap_or("disabled").to_string()),
                ("Redis pool", stats.redis_pool_size.to_string()),
                ("Status", colored_status(stats.status).to_string()),
            ]);
        }
    }
    Ok(())
}

pub async fn get(cache: &TieredCache, args: &GetArgs, format: OutputFormat) -> Result<()> {
    require_remote(cache)?;
    let full_key = cache.full_key(&args.key, args.prefix.as_deref());
    let lookup = cache
        .get::<serde_json::Value>(&args.key, &remote_options(args.prefix.clone()))
        .await?;

    // reads degrade to misses; the error counter tells them apart
    if cache.metrics().errors > 0 {
        bail!("remote tier unreachable while reading {full_key}");
    }

    match lookup.value {
        Some(value) => match format {
            OutputFormat::Json => print_json(&value)?,
            OutputFormat::Table => {
                println!("{}: {}", "Key".cyan(), full_key);
                println!(
                    "{}: {:.2} ms",
                    "Latency".cyan(),
                    lookup.latency.as_secs_f64() * 1000.0
                );
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
        },
        None => print_warning(&format!("{full_key} not found")),
    }
    Ok(())
}

pub async fn invalidate(
    cache: &TieredCache,
    args: &InvalidateArgs,
    format: OutputFormat,
) -> Result<()> {
    require_remote(cache)?;
    let summary = cache
        .invalidate_with(&args.patterns, &remote_options(args.prefix.clone()))
        .await?;

    match format {
        OutputFormat::Json => print_json(&summary)?,
        OutputFormat::Table => print_success(&format!(
            "Invalidated {} key(s) matching {} pattern(s)",
            summary.l2_removed, summary.patterns
        )),
    }
    Ok(())
}

pub async fn purge(cache: &TieredCache, args: &PurgeArgs, format: OutputFormat) -> Result<()> {
    require_remote(cache)?;
    let prefix = &cache.config().global_prefix;
    if prefix.is_empty() {
        bail!("global_prefix is empty; refusing to purge the whole remote store");
    }
    if !args.yes {
        bail!("purge removes every key under '{prefix}'; re-run with --yes to confirm");
    }

    let summary = cache
        .invalidate_with(["**"], &remote_options(None))
        .await?;

    match format {
        OutputFormat::Json => print_json(&summary)?,
        OutputFormat::Table => print_success(&format!(
            "Purged {} key(s) under '{prefix}'",
            summary.l2_removed
        )),
    }
    Ok(())
}
