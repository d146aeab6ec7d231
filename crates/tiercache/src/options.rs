//! Per-call cache options and the tier selection enum.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Which tiers an operation touches.
///
/// Deserialized through [`FromStr`], so config values are case-insensitive
/// and accept `-` in place of `_` (`BOTH`, `memory-only`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum CacheLevel {
    /// In-process tier only
    MemoryOnly,
    /// Remote tier only
    RedisOnly,
    /// L1 in front of L2, with promotion and write-through
    #[default]
    Both,
}

impl CacheLevel {
    pub fn uses_local(&self) -> bool {
        !matches!(self, CacheLevel::RedisOnly)
    }

    pub fn uses_remote(&self) -> bool {
        !matches!(self, CacheLevel::MemoryOnly)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheLevel::MemoryOnly => "memory_only",
            CacheLevel::RedisOnly => "redis_only",
            CacheLevel::Both => "both",
        }
    }
}

impl fmt::Display for CacheLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheLevel {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "memory_only" | "memory" => Ok(CacheLevel::MemoryOnly),
            "redis_only" | "redis" => Ok(CacheLevel::RedisOnly),
            "both" => Ok(CacheLevel::Both),
            other => Err(CacheError::invalid_configuration(format!(
                "unknown cache level '{other}' (expected memory_only, redis_only or both)"
            ))),
        }
    }
}

impl TryFrom<String> for CacheLevel {
    type Error = CacheError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Options accepted by every coordinator call.
///
/// Unset fields fall back to the cache configuration (`default_ttl_secs`,
/// `default_level`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheOptions {
    pub ttl: Option<Duration>,
    pub prefix: Option<String>,
    pub level: Option<CacheLevel>,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn ttl_secs(self, secs: u64) -> Self {
        self.ttl(Duration::from_secs(secs))
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn level(mut self, level: CacheLevel) -> Self {
        self.level = Some(level);
        self
    }
}

/// Options after defaults were applied and validated.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedOptions {
    pub key: String,
    pub ttl: Duration,
    pub level: CacheLevel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_levels_leniently() {
        assert_eq!("BOTH".parse::<CacheLevel>().unwrap(), CacheLevel::Both);
        assert_eq!(
            "memory-only".parse::<CacheLevel>().unwrap(),
            CacheLevel::MemoryOnly
        );
        assert_eq!(
            "REDIS_ONLY".parse::<CacheLevel>().unwrap(),
            CacheLevel::RedisOnly
        );
    }

    #[test]
    fn deserializes_through_from_str() {
        let level: CacheLevel = serde_json::from_str(r#""MEMORY-ONLY""#).unwrap();
        assert_eq!(level, CacheLevel::MemoryOnly);
        assert!(serde_json::from_str::<CacheLevel>(r#""disk""#).is_err());
        assert_eq!(
            serde_json::to_string(&CacheLevel::RedisOnly).unwrap(),
            r#""redis_only""#
        );
    }

    #[test]
    fn rejects_unknown_level() {
        let err = "disk".parse::<CacheLevel>().unwrap_err();
        assert!(matches!(err, CacheError::InvalidConfiguration(_)));
    }

    #[test]
    fn level_tier_selection() {
        assert!(CacheLevel::Both.uses_local() && CacheLevel::Both.uses_remote());
        assert!(!CacheLevel::MemoryOnly.uses_remote());
        assert!(!CacheLevel::RedisOnly.uses_local());
    }

    #[test]
    fn builder_sets_fields() {
        let opts = CacheOptions::new()
            .ttl_secs(30)
            .prefix("report:")
            .level(CacheLevel::MemoryOnly);
        assert_eq!(opts.ttl, Some(Duration::from_secs(30)));
        assert_eq!(opts.prefix.as_deref(), Some("report:"));
        assert_eq!(opts.level, Some(CacheLevel::MemoryOnly));
    }
}
