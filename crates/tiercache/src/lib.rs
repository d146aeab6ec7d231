//! Two-tier cache: an in-process LRU (L1) in front of a shared remote store
//! (L2, Redis).
//!
//! ```ignore
//! let cache = TieredCache::from_config(CacheConfig::load(None)?, CacheMetrics::default()).await?;
//! let user: User = cache
//!     .get_or_compute("user:42", &CacheOptions::new().ttl_secs(300), || async {
//!         load_user(42).await
//!     })
//!     .await?;
//! ```

pub mod binding;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod local;
pub mod metrics;
pub mod observability;
pub mod options;
pub mod pattern;
pub mod remote;

pub use binding::{
    CacheInvalidate, CacheInvalidateOptions, Cacheable, CacheableOptions, InvalidationKeys,
    KeyArgs, KeyPart, KeyTemplate, build_cache_key,
};
pub use config::{CacheConfig, RedisConfig};
pub use coordinator::{
    CacheLookup, CacheSource, Condition, InvalidationSummary, TieredCache, TieredCacheBuilder,
};
pub use error::{CacheError, CacheResult, CacheTier, RemoteError};
pub use health::{CacheHealthStatus, HealthState};
pub use local::LocalStore;
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use options::{CacheLevel, CacheOptions};
pub use pattern::KeyPattern;
pub use remote::{MemoryRemoteStore, RedisStore, RemoteStore, RemoteValue, connect_redis};
