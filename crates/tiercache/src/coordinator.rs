//! Two-tier cache coordinator.
//!
//! ## Lookup Order
//!
//! ```text
//! get → L1 (in-process) → L2 (remote) → miss
//!            ↓                 ↓
//!          <1µs           promote into L1 with the remaining TTL
//! ```
//!
//! ## Write Strategy
//!
//! `set` writes L2 first (the shared source of truth), then L1. If the L2
//! write fails the L1 copy is kept and the error is returned.
//!
//! ## Graceful Degradation
//!
//! L2 faults during reads are logged, counted and served as misses. When no
//! remote store is configured at all, `Both` behaves as `MemoryOnly`.
//!
//! ## Stampede Protection
//!
//! [`TieredCache::get_or_compute`] runs each computation on its own tokio
//! task and keeps one shared handle per key until that task settles. Every
//! concurrent caller for the key awaits the same handle and sees the same
//! value or the same error. Callers that give up (a timeout, a dropped
//! request) only stop waiting: the computation still finishes and caches
//! its result.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::codec;
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult, CacheTier, RemoteError};
use crate::health::{CacheHealthStatus, HealthMetrics, HealthState, L1Health, L2Health};
use crate::local::LocalStore;
use crate::metrics::{CacheMetrics, MetricsSnapshot};
use crate::options::{CacheLevel, CacheOptions, ResolvedOptions};
use crate::pattern::KeyPattern;
use crate::remote::{RemoteStore, connect_redis};

/// Predicate deciding whether a computed value may be cached.
pub type Condition<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Tier that served a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
    L1,
    L2,
}

impl CacheSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheSource::L1 => "l1",
            CacheSource::L2 => "l2",
        }
    }
}

impl From<CacheSource> for CacheTier {
    fn from(source: CacheSource) -> Self {
        match source {
            CacheSource::L1 => CacheTier::L1,
            CacheSource::L2 => CacheTier::L2,
        }
    }
}

/// Result of a lookup, with where it was served from and how long it took.
#[derive(Debug, Clone)]
pub struct CacheLookup<T> {
    pub value: Option<T>,
    pub hit: bool,
    pub source: Option<CacheSource>,
    pub latency: Duration,
}

impl<T> CacheLookup<T> {
    fn miss(latency: Duration) -> Self {
        Self {
            value: None,
            hit: false,
            source: None,
            latency,
        }
    }

    pub fn into_value(self) -> Option<T> {
        self.value
    }

    pub fn latency_ms(&self) -> f64 {
        self.latency.as_secs_f64() * 1000.0
    }
}

/// Keys removed by one invalidation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InvalidationSummary {
    pub patterns: usize,
    pub l1_removed: usize,
    pub l2_removed: usize,
}

type FlightResult = Result<Arc<Vec<u8>>, CacheError>;
type SharedFlight = Shared<BoxFuture<'static, FlightResult>>;

struct Flight {
    id: u64,
    future: SharedFlight,
}

struct Inner {
    config: CacheConfig,
    local: LocalStore,
    remote: Option<Arc<dyn RemoteStore>>,
    metrics: CacheMetrics,
    in_flight: DashMap<String, Flight>,
    next_flight: AtomicU64,
}

/// Removes the in-flight registration when a computation task settles.
/// Only removes the entry it registered.
struct FlightToken {
    inner: Weak<Inner>,
    key: String,
    id: u64,
}

impl Drop for FlightToken {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            // dropped outside the shard lock
            let removed = inner.in_flight.remove_if(&self.key, |_, f| f.id == self.id);
            drop(removed);
        }
    }
}

/// Builder for [`TieredCache`].
pub struct TieredCacheBuilder {
    config: CacheConfig,
    remote: Option<Arc<dyn RemoteStore>>,
    metrics: Option<CacheMetrics>,
}

impl TieredCacheBuilder {
    /// Use `store` as the L2 tier.
    pub fn remote(mut self, store: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(store);
        self
    }

    /// Record into an existing metrics handle instead of a fresh one.
    pub fn metrics(mut self, metrics: CacheMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> CacheResult<TieredCache> {
        self.config.validate()?;
        let metrics = self
            .metrics
            .unwrap_or_else(|| CacheMetrics::new(self.config.enable_metrics));

        tracing::info!(
            l1_max_items = self.config.l1_max_items,
            remote = self.remote.as_ref().map(|r| r.name()).unwrap_or("none"),
            global_prefix = %self.config.global_prefix,
            "Tiered cache initialized"
        );

        Ok(TieredCache {
            inner: Arc::new(Inner {
                local: LocalStore::new(self.config.l1_max_items),
                remote: self.remote,
                metrics,
                in_flight: DashMap::new(),
                next_flight: AtomicU64::new(0),
                config: self.config,
            }),
        })
    }
}

/// L1 + L2 cache coordinator. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct TieredCache {
    inner: Arc<Inner>,
}

impl TieredCache {
    pub fn builder(config: CacheConfig) -> TieredCacheBuilder {
        TieredCacheBuilder {
            config,
            remote: None,
            metrics: None,
        }
    }

    /// Build a cache from configuration, connecting to Redis when enabled.
    ///
    /// Redis being unreachable never fails construction; see [`connect_redis`].
    pub async fn from_config(config: CacheConfig, metrics: CacheMetrics) -> CacheResult<Self> {
        config.validate()?;
        let remote = connect_redis(&config.redis).await;
        let mut builder = Self::builder(config).metrics(metrics);
        if let Some(store) = remote {
            builder = builder.remote(store);
        }
        builder.build()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn local(&self) -> &LocalStore {
        &self.inner.local
    }

    pub fn has_remote(&self) -> bool {
        self.inner.remote.is_some()
    }

    pub fn metrics_handle(&self) -> &CacheMetrics {
        &self.inner.metrics
    }

    /// `{global_prefix}{prefix}{key}`
    pub fn full_key(&self, key: &str, prefix: Option<&str>) -> String {
        let global = &self.inner.config.global_prefix;
        let prefix = prefix.unwrap_or("");
        let mut full = String::with_capacity(global.len() + prefix.len() + key.len());
        full.push_str(global);
        full.push_str(prefix);
        full.push_str(key);
        full
    }

    fn resolve(&self, key: &str, options: &CacheOptions) -> CacheResult<ResolvedOptions> {
        let ttl = options.ttl.unwrap_or_else(|| self.inner.config.default_ttl());
        if ttl.is_zero() {
            return Err(CacheError::invalid_configuration(format!(
                "ttl must be > 0 (key '{key}')"
            )));
        }
        Ok(ResolvedOptions {
            key: self.full_key(key, options.prefix.as_deref()),
            ttl,
            level: self.effective_level(options.level),
        })
    }

    fn effective_level(&self, level: Option<CacheLevel>) -> CacheLevel {
        match level.unwrap_or(self.inner.config.default_level) {
            CacheLevel::Both if self.inner.remote.is_none() => CacheLevel::MemoryOnly,
            level => level,
        }
    }

    fn missing_remote() -> RemoteError {
        RemoteError::Unavailable("no remote store configured".to_string())
    }

    /// Run an L2 call under the configured timeout.
    async fn remote_call<R, F>(&self, call: F) -> Result<R, RemoteError>
    where
        F: Future<Output = Result<R, RemoteError>>,
    {
        let timeout = self.inner.config.remote_timeout();
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(timeout)),
        }
    }

    fn publish_l1_size(&self) {
        self.inner
            .metrics
            .set_entries(CacheTier::L1, self.inner.local.len());
    }

    fn promote(&self, key: &str, data: &Arc<Vec<u8>>, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        self.inner.local.set(key, Arc::clone(data), ttl);
        self.publish_l1_size();
        tracing::debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "promoted L2 hit into L1");
    }

    /// Find the raw payload for a resolved key, recording exactly one of
    /// L1 hit, L2 hit or miss.
    async fn lookup_raw(&self, resolved: &ResolvedOptions) -> Option<(Arc<Vec<u8>>, CacheSource)> {
        let key = resolved.key.as_str();
        let metrics = &self.inner.metrics;

        if resolved.level.uses_local() {
            if let Some(entry) = self.inner.local.get(key) {
                tracing::debug!(key = %key, "cache hit (L1)");
                metrics.record_hit(CacheTier::L1);
                return Some((entry.data, CacheSource::L1));
            }
        }

        if resolved.level.uses_remote() {
            let result = match &self.inner.remote {
                Some(remote) => self.remote_call(remote.get(key)).await,
                None => Err(Self::missing_remote()),
            };
            match result {
                Ok(Some(value)) => {
                    tracing::debug!(key = %key, "cache hit (L2)");
                    metrics.record_hit(CacheTier::L2);
                    let data = Arc::new(value.data);
                    if resolved.level == CacheLevel::Both {
                        // never a fresh TTL: the L1 copy must not outlive L2's
                        self.promote(key, &data, value.ttl.unwrap_or(resolved.ttl));
                    }
                    return Some((data, CacheSource::L2));
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "L2 GET failed, treating as miss");
                    metrics.record_error("get");
                }
            }
        }

        tracing::debug!(key = %key, "cache miss");
        metrics.record_miss();
        None
    }

    async fn get_resolved<T: DeserializeOwned>(
        &self,
        resolved: &ResolvedOptions,
    ) -> CacheResult<CacheLookup<T>> {
        let started = Instant::now();
        let found = self.lookup_raw(resolved).await;
        let latency = started.elapsed();
        self.inner.metrics.record_latency(latency);

        let Some((data, source)) = found else {
            return Ok(CacheLookup::miss(latency));
        };

        match codec::decode::<T>(&data) {
            Ok(value) => Ok(CacheLookup {
                value: Some(value),
                hit: true,
                source: Some(source),
                latency,
            }),
            Err(e) => {
                tracing::warn!(key = %resolved.key, source = source.as_str(), error = %e, "failed to decode cached value");
                self.inner.metrics.record_error("decode");
                self.inner.local.delete(&resolved.key);
                Err(e)
            }
        }
    }

    /// Look up `key`, reporting where it was found.
    ///
    /// Remote faults never fail a lookup; an undecodable payload does
    /// (`CacheError::Serialization`).
    pub async fn get<T: DeserializeOwned>(
        &self,
        key: &str,
        options: &CacheOptions,
    ) -> CacheResult<CacheLookup<T>> {
        let resolved = self.resolve(key, options)?;
        self.get_resolved(&resolved).await
    }

    /// Shorthand for [`TieredCache::get`] returning only the value.
    pub async fn get_value<T: DeserializeOwned>(
        &self,
        key: &str,
        options: &CacheOptions,
    ) -> CacheResult<Option<T>> {
        Ok(self.get(key, options).await?.value)
    }

    async fn store(&self, resolved: &ResolvedOptions, data: Arc<Vec<u8>>) -> CacheResult<()> {
        let key = resolved.key.as_str();

        let mut remote_result: CacheResult<()> = Ok(());
        if resolved.level.uses_remote() {
            let result = match &self.inner.remote {
                Some(remote) => self.remote_call(remote.set(key, &data, resolved.ttl)).await,
                None => Err(Self::missing_remote()),
            };
            remote_result = result.map_err(CacheError::from);
        }

        if resolved.level.uses_local() {
            self.inner.local.set(key, data, resolved.ttl);
            self.publish_l1_size();
        }

        match remote_result {
            Ok(()) => {
                tracing::debug!(key = %key, level = %resolved.level, "cache set");
                self.inner.metrics.record_set();
                Ok(())
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "L2 SET failed");
                self.inner.metrics.record_error("set");
                Err(e)
            }
        }
    }

    /// Write `value` to the configured tiers.
    ///
    /// Under `Both` the L2 write happens first; if it fails the L1 copy is
    /// still written and the L2 error is returned.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: &CacheOptions,
    ) -> CacheResult<()> {
        let resolved = self.resolve(key, options)?;
        let data = match codec::encode(value) {
            Ok(data) => Arc::new(data),
            Err(e) => {
                tracing::warn!(key = %resolved.key, error = %e, "failed to encode value for cache");
                self.inner.metrics.record_error("encode");
                return Err(e);
            }
        };
        self.store(&resolved, data).await
    }

    /// Remove `key` from the configured tiers. Returns whether any tier had it.
    ///
    /// A missing key is not an error; an unreachable L2 is.
    pub async fn delete(&self, key: &str, options: &CacheOptions) -> CacheResult<bool> {
        let key = self.full_key(key, options.prefix.as_deref());
        let level = self.effective_level(options.level);

        let mut existed = false;
        if level.uses_local() {
            existed |= self.inner.local.delete(&key);
            self.publish_l1_size();
        }

        if level.uses_remote() {
            let result = match &self.inner.remote {
                Some(remote) => self.remote_call(remote.delete(&key)).await,
                None => Err(Self::missing_remote()),
            };
            match result {
                Ok(removed) => existed |= removed,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "L2 DEL failed");
                    self.inner.metrics.record_error("delete");
                    return Err(e.into());
                }
            }
        }

        tracing::debug!(key = %key, existed = existed, "cache delete");
        self.inner.metrics.record_delete();
        Ok(existed)
    }

    /// Invalidate every key matching any of `patterns` with default options.
    ///
    /// `*` matches any substring; a pattern without `*` removes one key.
    pub async fn invalidate<I, S>(&self, patterns: I) -> CacheResult<InvalidationSummary>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.invalidate_with(patterns, &CacheOptions::default())
            .await
    }

    /// Invalidate patterns under `options.prefix` on the tiers selected by
    /// `options.level`.
    ///
    /// Every pattern is attempted; the first L2 failure is returned after the
    /// pass so no tier is left half-invalidated by an early return.
    pub async fn invalidate_with<I, S>(
        &self,
        patterns: I,
        options: &CacheOptions,
    ) -> CacheResult<InvalidationSummary>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let level = self.effective_level(options.level);
        let mut summary = InvalidationSummary::default();
        let mut first_error: Option<CacheError> = None;

        for pattern in patterns {
            let pattern =
                match KeyPattern::new(self.full_key(pattern.as_ref(), options.prefix.as_deref())) {
                    Ok(pattern) => pattern,
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping invalid invalidation pattern");
                        first_error.get_or_insert(e);
                        continue;
                    }
                };
            summary.patterns += 1;

            if level.uses_local() {
                summary.l1_removed += self.inner.local.delete_by_pattern(&pattern);
            }

            if level.uses_remote() {
                let result = match &self.inner.remote {
                    Some(remote) => self.remote_call(remote.delete_by_pattern(&pattern)).await,
                    None => Err(Self::missing_remote()),
                };
                match result {
                    Ok(removed) => summary.l2_removed += removed,
                    Err(e) => {
                        tracing::warn!(pattern = %pattern.as_str(), error = %e, "L2 invalidation failed");
                        self.inner.metrics.record_error("invalidate");
                        first_error.get_or_insert(e.into());
                        continue;
                    }
                }
            }

            self.inner.metrics.record_delete();
        }

        self.publish_l1_size();
        tracing::debug!(
            patterns = summary.patterns,
            l1_removed = summary.l1_removed,
            l2_removed = summary.l2_removed,
            "cache invalidated"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    /// Whether a live entry exists in any configured tier. Does not touch
    /// hit/miss counters.
    pub async fn exists(&self, key: &str, options: &CacheOptions) -> bool {
        let key = self.full_key(key, options.prefix.as_deref());
        let level = self.effective_level(options.level);

        if level.uses_local() && self.inner.local.contains(&key) {
            return true;
        }
        if !level.uses_remote() {
            return false;
        }

        let result = match &self.inner.remote {
            Some(remote) => self.remote_call(remote.exists(&key)).await,
            None => Err(Self::missing_remote()),
        };
        result.unwrap_or_else(|e| {
            tracing::warn!(key = %key, error = %e, "L2 EXISTS failed");
            self.inner.metrics.record_error("exists");
            false
        })
    }

    /// Look up several keys; the result follows the order of `keys`.
    pub async fn get_many<T, I, S>(&self, keys: I, options: &CacheOptions) -> CacheResult<Vec<Option<T>>>
    where
        T: DeserializeOwned,
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut values = Vec::new();
        for key in keys {
            values.push(self.get_value(key.as_ref(), options).await?);
        }
        Ok(values)
    }

    /// Write several entries with the same options. Every entry is attempted;
    /// the first failure is returned.
    pub async fn set_many<T, I, S>(&self, entries: I, options: &CacheOptions) -> CacheResult<()>
    where
        T: Serialize,
        I: IntoIterator<Item = (S, T)>,
        S: AsRef<str>,
    {
        let mut first_error = None;
        for (key, value) in entries {
            if let Err(e) = self.set(key.as_ref(), &value, options).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Return the cached value for `key` or compute, cache and return it.
    ///
    /// Concurrent callers for the same key share one `compute` invocation.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        key: &str,
        options: &CacheOptions,
        compute: F,
    ) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.get_or_compute_if(key, options, None, compute).await
    }

    /// Like [`TieredCache::get_or_compute`], caching the result only when
    /// `condition` accepts it. Rejected results are still returned.
    pub async fn get_or_compute_if<T, F, Fut>(
        &self,
        key: &str,
        options: &CacheOptions,
        condition: Option<Condition<T>>,
        compute: F,
    ) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let resolved = self.resolve(key, options)?;

        match self.get_resolved::<T>(&resolved).await {
            Ok(CacheLookup {
                value: Some(value), ..
            }) => return Ok(value),
            Ok(_) => {}
            // the fresh value computed below overwrites the bad payload
            Err(CacheError::Serialization(reason)) => {
                tracing::warn!(key = %resolved.key, error = %reason, "recomputing over undecodable cached value");
            }
            Err(e) => return Err(e),
        }

        let flight = self.join_or_start(resolved, condition, compute);
        let data = flight.await?;
        codec::decode(&data)
    }

    fn join_or_start<T, F, Fut>(
        &self,
        resolved: ResolvedOptions,
        condition: Option<Condition<T>>,
        compute: F,
    ) -> SharedFlight
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        match self.inner.in_flight.entry(resolved.key.clone()) {
            Entry::Occupied(flight) => {
                tracing::debug!(key = %resolved.key, "joining in-flight computation");
                flight.get().future.clone()
            }
            Entry::Vacant(slot) => {
                let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
                let token = FlightToken {
                    inner: Arc::downgrade(&self.inner),
                    key: resolved.key.clone(),
                    id,
                };
                let handle = tokio::spawn(run_flight(token, resolved, condition, compute));
                let future = handle
                    .map(|joined| {
                        joined.unwrap_or_else(|e| {
                            Err(CacheError::compute(anyhow::anyhow!(
                                "computation task failed: {e}"
                            )))
                        })
                    })
                    .boxed()
                    .shared();
                slot.insert(Flight {
                    id,
                    future: future.clone(),
                });
                future
            }
        }
    }

    /// Number of keys with a computation currently in progress.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Current counters plus L1 size.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner
            .metrics
            .snapshot(self.inner.local.len(), self.inner.local.evictions())
    }

    pub fn reset_metrics(&self) {
        self.inner.metrics.reset();
    }

    pub fn l1_size(&self) -> usize {
        self.inner.local.len()
    }

    /// Drop every L1 entry. L2 is untouched.
    pub fn clear_local(&self) {
        self.inner.local.clear();
        self.publish_l1_size();
        tracing::info!("L1 cache cleared");
    }

    /// Drop expired L1 entries. Returns the number removed.
    pub fn purge_expired_local(&self) -> usize {
        let removed = self.inner.local.purge_expired();
        self.publish_l1_size();
        removed
    }

    /// Probe both tiers and derive the cache status.
    ///
    /// The L2 ping is bounded by `health_timeout_ms`; a ping that errors or
    /// times out marks L2 unavailable.
    pub async fn health_check(&self) -> CacheHealthStatus {
        let timeout = self.inner.config.health_timeout();
        let l1_available = self.probe_local(timeout).await;

        let l2 = match &self.inner.remote {
            Some(remote) => {
                let started = Instant::now();
                let outcome = match tokio::time::timeout(timeout, remote.ping()).await {
                    Ok(result) => result,
                    Err(_) => Err(RemoteError::Timeout(timeout)),
                };
                match outcome {
                    Ok(()) => L2Health {
                        available: true,
                        backend: Some(remote.name()),
                        latency_ms: Some(started.elapsed().as_secs_f64() * 1000.0),
                        error: None,
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "L2 health ping failed");
                        L2Health {
                            available: false,
                            backend: Some(remote.name()),
                            latency_ms: None,
                            error: Some(e.to_string()),
                        }
                    }
                }
            }
            None => L2Health {
                available: false,
                backend: None,
                latency_ms: None,
                error: Some(Self::missing_remote().to_string()),
            },
        };

        let snapshot = self.metrics();
        CacheHealthStatus {
            status: HealthState::from_tiers(l1_available, l2.available),
            l1: L1Health {
                available: l1_available,
                item_count: snapshot.l1_size,
                capacity: self.inner.local.capacity(),
            },
            l2,
            metrics: HealthMetrics {
                hit_rate: snapshot.hit_rate,
                total_operations: snapshot.total_operations(),
                errors: snapshot.errors,
            },
        }
    }

    /// Retry the non-blocking L1 lock probe until `timeout`, yielding to the
    /// runtime between attempts.
    async fn probe_local(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.inner.local.probe() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Start the periodic L1 sweep configured by `l1_sweep_interval_secs`.
    pub fn start_sweeper(&self) -> Option<JoinHandle<()>> {
        let period = self.inner.config.sweep_interval()?;
        Some(self.spawn_sweeper(period))
    }

    /// Purge expired L1 entries every `period` until the cache is dropped.
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // the first tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let removed = inner.local.purge_expired();
                inner.metrics.set_entries(CacheTier::L1, inner.local.len());
                if removed > 0 {
                    tracing::debug!(removed = removed, "Purged expired L1 entries");
                }
            }
        })
    }
}

/// Body of a spawned computation. Owns its [`FlightToken`], so the in-flight
/// registration disappears once the task settles, including by panic.
async fn run_flight<T, F, Fut>(
    token: FlightToken,
    resolved: ResolvedOptions,
    condition: Option<Condition<T>>,
    compute: F,
) -> FlightResult
where
    T: Serialize + Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    tracing::debug!(key = %resolved.key, "computing value");

    let value = compute().await.map_err(|e| {
        tracing::warn!(key = %resolved.key, error = %e, "compute failed, nothing cached");
        CacheError::compute(e)
    })?;

    let data = Arc::new(codec::encode(&value)?);
    let cacheable = condition.as_ref().is_none_or(|accept| accept(&value));
    drop(value);

    if !cacheable {
        tracing::debug!(key = %resolved.key, "condition rejected computed value, not caching");
    } else if let Some(inner) = token.inner.upgrade() {
        let cache = TieredCache { inner };
        // the value is still returned when the write-back fails
        if let Err(e) = cache.store(&resolved, Arc::clone(&data)).await {
            tracing::warn!(key = %resolved.key, error = %e, "failed to cache computed value");
        }
    }

    drop(token);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemoteStore;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        name: String,
    }

    fn config() -> CacheConfig {
        CacheConfig {
            global_prefix: "test:".into(),
            l1_max_items: 100,
            ..Default::default()
        }
    }

    fn cache_with_remote() -> (TieredCache, Arc<MemoryRemoteStore>) {
        let remote = Arc::new(MemoryRemoteStore::new());
        let cache = TieredCache::builder(config())
            .remote(remote.clone())
            .build()
            .unwrap();
        (cache, remote)
    }

    #[tokio::test]
    async fn test_set_then_get_hits_l1() {
        let (cache, _) = cache_with_remote();
        let opts = CacheOptions::new().ttl_secs(60);
        cache
            .set("user:42", &User { name: "Ana".into() }, &opts)
            .await
            .unwrap();

        let lookup = cache.get::<User>("user:42", &opts).await.unwrap();
        assert!(lookup.hit);
        assert_eq!(lookup.source, Some(CacheSource::L1));
        assert_eq!(lookup.value, Some(User { name: "Ana".into() }));
    }

    #[tokio::test]
    async fn test_keys_carry_global_and_call_prefix() {
        let (cache, remote) = cache_with_remote();
        let opts = CacheOptions::new().prefix("users:");
        cache.set("1", &1u32, &opts).await.unwrap();

        assert!(cache.local().contains("test:users:1"));
        assert!(remote.ttl_of("test:users:1").is_some());
        assert_eq!(cache.full_key("k", None), "test:k");
    }

    #[tokio::test]
    async fn test_zero_ttl_is_rejected() {
        let (cache, _) = cache_with_remote();
        let opts = CacheOptions::new().ttl(Duration::ZERO);
        let err = cache.set("k", &1u8, &opts).await.unwrap_err();
        assert!(matches!(err, CacheError::InvalidConfiguration(_)));
        assert!(cache.get::<u8>("k", &opts).await.is_err());
    }

    #[tokio::test]
    async fn test_miss_records_metrics() {
        let (cache, _) = cache_with_remote();
        let lookup = cache
            .get::<String>("nope", &CacheOptions::default())
            .await
            .unwrap();
        assert!(!lookup.hit);
        assert!(lookup.source.is_none());

        let snap = cache.metrics();
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.hits, 0);
        assert_eq!(snap.errors, 0);
    }

    #[tokio::test]
    async fn test_remote_down_degrades_to_miss() {
        let (cache, remote) = cache_with_remote();
        remote.set_available(false);

        let opts = CacheOptions::new().level(CacheLevel::RedisOnly);
        let lookup = cache.get::<String>("k", &opts).await.unwrap();
        assert!(!lookup.hit);
        assert_eq!(cache.metrics().errors, 1);
    }

    #[tokio::test]
    async fn test_set_surfaces_remote_failure_but_keeps_l1() {
        let (cache, remote) = cache_with_remote();
        remote.set_available(false);

        let opts = CacheOptions::new().ttl_secs(60);
        let err = cache.set("k", &"v", &opts).await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::TierUnavailable {
                tier: CacheTier::L2,
                ..
            }
        ));

        let lookup = cache.get::<String>("k", &opts).await.unwrap();
        assert_eq!(lookup.source, Some(CacheSource::L1));
        let snap = cache.metrics();
        assert_eq!(snap.sets, 0);
        assert_eq!(snap.errors, 1);
    }

    #[tokio::test]
    async fn test_remote_timeout_is_bounded() {
        let mut cfg = config();
        cfg.redis.timeout_ms = 50;
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.set_latency(Duration::from_secs(5));
        let cache = TieredCache::builder(cfg).remote(remote).build().unwrap();

        let started = Instant::now();
        let lookup = cache
            .get::<String>("slow", &CacheOptions::default())
            .await
            .unwrap();
        assert!(!lookup.hit);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(cache.metrics().errors, 1);
    }

    #[tokio::test]
    async fn test_local_only_cache_treats_both_as_memory() {
        let cache = TieredCache::builder(config()).build().unwrap();
        let opts = CacheOptions::default();
        cache.set("k", &7i64, &opts).await.unwrap();
        assert_eq!(cache.get_value::<i64>("k", &opts).await.unwrap(), Some(7));

        let redis_only = CacheOptions::new().level(CacheLevel::RedisOnly);
        assert!(cache.set("k", &7i64, &redis_only).await.is_err());
    }

    #[tokio::test]
    async fn test_decode_failure_is_surfaced() {
        let (cache, _) = cache_with_remote();
        let opts = CacheOptions::default();
        cache.set("k", &"text", &opts).await.unwrap();

        let err = cache.get::<User>("k", &opts).await.unwrap_err();
        assert!(matches!(err, CacheError::Serialization(_)));
        assert!(!cache.local().contains("test:k"));
    }

    #[tokio::test]
    async fn test_get_or_compute_caches_and_reuses() {
        let (cache, _) = cache_with_remote();
        let calls = Arc::new(AtomicUsize::new(0));
        let opts = CacheOptions::new().ttl_secs(60);

        for _ in 0..3 {
            let calls = calls.clone();
            let value: String = cache
                .get_or_compute("k", &opts, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("computed".to_string())
                })
                .await
                .unwrap();
            assert_eq!(value, "computed");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_condition_rejects_caching() {
        let (cache, _) = cache_with_remote();
        let opts = CacheOptions::default();
        let reject_empty: Condition<Vec<u32>> = Arc::new(|v: &Vec<u32>| !v.is_empty());

        let value = cache
            .get_or_compute_if("list", &opts, Some(reject_empty), || async { Ok(Vec::new()) })
            .await
            .unwrap();
        assert!(value.is_empty());
        assert!(!cache.exists("list", &opts).await);
    }

    #[tokio::test]
    async fn test_compute_failure_is_not_cached() {
        let (cache, _) = cache_with_remote();
        let opts = CacheOptions::default();

        let err = cache
            .get_or_compute::<u32, _, _>("k", &opts, || async { anyhow::bail!("boom") })
            .await
            .unwrap_err();
        assert!(err.is_compute());
        assert_eq!(cache.in_flight(), 0);
        assert!(!cache.exists("k", &opts).await);
    }

    #[tokio::test]
    async fn test_exists_get_many_set_many() {
        let (cache, _) = cache_with_remote();
        let opts = CacheOptions::default();
        cache
            .set_many([("a", 1u32), ("b", 2u32)], &opts)
            .await
            .unwrap();

        assert!(cache.exists("a", &opts).await);
        assert!(!cache.exists("c", &opts).await);

        let values: Vec<Option<u32>> = cache.get_many(["a", "c", "b"], &opts).await.unwrap();
        assert_eq!(values, vec![Some(1), None, Some(2)]);
    }

    #[tokio::test]
    async fn test_exists_falls_back_to_l2() {
        let (cache, _) = cache_with_remote();
        let opts = CacheOptions::default();
        cache.set("a", &1u32, &opts).await.unwrap();
        cache.clear_local();
        assert_eq!(cache.l1_size(), 0);
        assert!(cache.exists("a", &opts).await);
    }

    #[tokio::test]
    async fn test_sweeper_purges_expired_entries() {
        let cache = TieredCache::builder(config()).build().unwrap();
        let opts = CacheOptions::new().ttl(Duration::from_millis(20));
        cache.set("a", &1u8, &opts).await.unwrap();
        cache.set("b", &2u8, &opts).await.unwrap();
        assert_eq!(cache.l1_size(), 2);

        let handle = cache.spawn_sweeper(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.l1_size(), 0);

        drop(cache);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper stops once the cache is dropped")
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_sweeper_follows_config() {
        let disabled = TieredCache::builder(CacheConfig {
            l1_sweep_interval_secs: 0,
            ..config()
        })
        .build()
        .unwrap();
        assert!(disabled.start_sweeper().is_none());

        let enabled = TieredCache::builder(config()).build().unwrap();
        let handle = enabled.start_sweeper().expect("sweeper enabled by default");
        handle.abort();
    }

    #[tokio::test]
    async fn test_health_without_remote_is_degraded() {
        let cache = TieredCache::builder(config()).build().unwrap();
        let health = cache.health_check().await;
        assert_eq!(health.status, HealthState::Degraded);
        assert!(health.l1.available);
        assert!(!health.l2.available);
        assert!(health.l2.backend.is_none());
    }
}
