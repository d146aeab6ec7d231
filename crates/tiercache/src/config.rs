use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::options::CacheLevel;

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL in seconds applied when a call does not specify one
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Local (L1) cache max entries; exceeding it evicts the LRU entry
    #[serde(default = "default_l1_max_items")]
    pub l1_max_items: usize,

    /// When false, metric counters become no-ops
    #[serde(default = "default_enable_metrics")]
    pub enable_metrics: bool,

    /// Prepended to every key before it reaches a tier
    #[serde(default = "default_global_prefix")]
    pub global_prefix: String,

    /// Level used when a call does not specify one
    #[serde(default)]
    pub default_level: CacheLevel,

    /// Period of the expired-entry sweep over L1. 0 disables the sweep.
    #[serde(default = "default_l1_sweep_interval_secs")]
    pub l1_sweep_interval_secs: u64,

    /// Upper bound on the L2 ping performed by health checks
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,

    /// Redis (L2) configuration
    #[serde(default)]
    pub redis: RedisConfig,
}

fn default_ttl_secs() -> u64 {
    300 // 5 minutes
}

fn default_l1_max_items() -> usize {
    10000
}

fn default_enable_metrics() -> bool {
    true
}

fn default_global_prefix() -> String {
    "cache:".to_string()
}

fn default_l1_sweep_interval_secs() -> u64 {
    60
}

fn default_health_timeout_ms() -> u64 {
    1000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl_secs(),
            l1_max_items: default_l1_max_items(),
            enable_metrics: default_enable_metrics(),
            global_prefix: default_global_prefix(),
            default_level: CacheLevel::default(),
            l1_sweep_interval_secs: default_l1_sweep_interval_secs(),
            health_timeout_ms: default_health_timeout_ms(),
            redis: RedisConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.default_ttl_secs == 0 {
            return Err(CacheError::invalid_configuration(
                "default_ttl_secs must be > 0",
            ));
        }
        if self.l1_max_items == 0 {
            return Err(CacheError::invalid_configuration("l1_max_items must be > 0"));
        }
        if self.health_timeout_ms == 0 {
            return Err(CacheError::invalid_configuration(
                "health_timeout_ms must be > 0",
            ));
        }
        if self.redis.enabled {
            if self.redis.url.trim().is_empty() {
                return Err(CacheError::invalid_configuration(
                    "redis.enabled=true requires redis.url",
                ));
            }
            if self.redis.pool_size == 0 {
                return Err(CacheError::invalid_configuration(
                    "redis.pool_size must be > 0",
                ));
            }
        }
        if self.redis.timeout_ms == 0 {
            return Err(CacheError::invalid_configuration(
                "redis.timeout_ms must be > 0",
            ));
        }
        Ok(())
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.redis.timeout_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.l1_sweep_interval_secs > 0).then(|| Duration::from_secs(self.l1_sweep_interval_secs))
    }

    /// Load configuration from a TOML file plus environment overrides.
    ///
    /// Without an explicit path, `tiercache.toml` in the working directory is
    /// used when present. Environment variables override file values, e.g.
    /// `TIERCACHE__L1_MAX_ITEMS=500` or `TIERCACHE__REDIS__URL=redis://cache:6379`.
    pub fn load(path: Option<&str>) -> Result<CacheConfig, CacheError> {
        let mut builder = Config::builder();
        match path {
            Some(p) => {
                let pathbuf = PathBuf::from(p);
                if !pathbuf.exists() {
                    return Err(CacheError::invalid_configuration(format!(
                        "config file not found: {p}"
                    )));
                }
                builder = builder.add_source(File::from(pathbuf));
            }
            None => {
                let default_path = PathBuf::from("tiercache.toml");
                if default_path.exists() {
                    builder = builder.add_source(File::from(default_path));
                }
            }
        }
        builder = builder.add_source(
            Environment::with_prefix("TIERCACHE")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| CacheError::invalid_configuration(format!("config build error: {e}")))?;
        let merged: CacheConfig = cfg.try_deserialize().map_err(|e| {
            CacheError::invalid_configuration(format!("config deserialize error: {e}"))
        })?;
        merged.validate()?;
        Ok(merged)
    }
}

/// Connection settings for the L2 tier. Fields missing from the file keep
/// the values of [`RedisConfig::default`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Off unless set; the cache then runs on L1 alone
    pub enabled: bool,

    pub url: String,

    /// Upper bound on pooled connections
    pub pool_size: usize,

    /// Deadline for connecting and for every L2 command, in milliseconds
    pub timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            timeout_ms: 5000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn defaults_are_valid() {
        let cfg = CacheConfig::default();
        assert_ok!(cfg.validate());
        assert_eq!(cfg.default_ttl(), Duration::from_secs(300));
        assert_eq!(cfg.default_level, CacheLevel::Both);
        assert_eq!(cfg.sweep_interval(), Some(Duration::from_secs(60)));
        assert!(!cfg.redis.enabled);
    }

    #[test]
    fn rejects_zero_ttl_and_capacity() {
        let cfg = CacheConfig {
            default_ttl_secs: 0,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(CacheError::InvalidConfiguration(_))
        ));

        let cfg = CacheConfig {
            l1_max_items: 0,
            ..Default::default()
        };
        assert_err!(cfg.validate());
    }

    #[test]
    fn enabled_redis_needs_a_url() {
        let cfg = CacheConfig {
            redis: RedisConfig {
                enabled: true,
                url: " ".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn loads_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
default_ttl_secs = 60
l1_max_items = 500
global_prefix = "app:"
default_level = "memory_only"

[redis]
enabled = true
url = "redis://cache:6379"
timeout_ms = 250
"#
        )
        .unwrap();

        let cfg = CacheConfig::load(file.path().to_str()).unwrap();
        assert_eq!(cfg.default_ttl_secs, 60);
        assert_eq!(cfg.l1_max_items, 500);
        assert_eq!(cfg.global_prefix, "app:");
        assert_eq!(cfg.default_level, CacheLevel::MemoryOnly);
        assert!(cfg.enable_metrics);
        assert!(cfg.redis.enabled);
        assert_eq!(cfg.redis.pool_size, 10);
        assert_eq!(cfg.remote_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn level_in_file_is_parsed_leniently() {
        for (raw, expected) in [
            ("BOTH", CacheLevel::Both),
            ("memory-only", CacheLevel::MemoryOnly),
            ("Redis_Only", CacheLevel::RedisOnly),
        ] {
            let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
            writeln!(file, "default_level = \"{raw}\"").unwrap();
            let cfg = assert_ok!(CacheConfig::load(file.path().to_str()));
            assert_eq!(cfg.default_level, expected, "level {raw}");
        }
    }

    #[test]
    fn unknown_level_in_file_fails_fast() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, r#"default_level = "disk""#).unwrap();
        let err = CacheConfig::load(file.path().to_str()).unwrap_err();
        assert!(matches!(err, CacheError::InvalidConfiguration(_)));
    }

    #[test]
    fn missing_file_is_an_error() {
        assert_err!(CacheConfig::load(Some("/nonexistent/tiercache.toml")));
    }
}
