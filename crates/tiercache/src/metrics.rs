//! Cache metrics.
//!
//! [`CacheMetrics`] is an explicitly constructed handle: build one at
//! startup, hand clones to the cache and to whatever reports on it (health
//! endpoint, CLI), and reset it from tests. Counters are atomics so recording
//! never takes a lock.
//!
//! Every record is mirrored to the `metrics` facade so an installed
//! Prometheus recorder (see [`crate::observability::init_metrics`]) exports
//! the same numbers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use parking_lot::RwLock;
use serde::Serialize;
use time::OffsetDateTime;

use crate::error::CacheTier;

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_SETS_TOTAL: &str = "cache_sets_total";
    pub const CACHE_DELETES_TOTAL: &str = "cache_deletes_total";
    pub const CACHE_ERRORS_TOTAL: &str = "cache_errors_total";
    pub const CACHE_GET_DURATION_SECONDS: &str = "cache_get_duration_seconds";
    pub const CACHE_ENTRIES: &str = "cache_entries";
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
    latency_us_total: AtomicU64,
    latency_samples: AtomicU64,
}

struct Started {
    instant: Instant,
    wall: OffsetDateTime,
}

impl Started {
    fn now() -> Self {
        Self {
            instant: Instant::now(),
            wall: OffsetDateTime::now_utc(),
        }
    }
}

struct MetricsInner {
    enabled: bool,
    counters: Counters,
    started: RwLock<Started>,
}

/// Shared handle to the cache counters.
#[derive(Clone)]
pub struct CacheMetrics {
    inner: Arc<MetricsInner>,
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new(true)
    }
}

impl CacheMetrics {
    /// Create a metrics handle. With `enabled = false` every record is a no-op.
    pub fn new(enabled: bool) -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                enabled,
                counters: Counters::default(),
                started: RwLock::new(Started::now()),
            }),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    fn bump(&self, counter: &AtomicU64) -> bool {
        if self.inner.enabled {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.enabled
    }

    /// Record a cache hit served by `tier`.
    pub fn record_hit(&self, tier: CacheTier) {
        let c = &self.inner.counters;
        if self.bump(&c.hits) {
            match tier {
                CacheTier::L1 => c.l1_hits.fetch_add(1, Ordering::Relaxed),
                CacheTier::L2 => c.l2_hits.fetch_add(1, Ordering::Relaxed),
            };
            counter!(names::CACHE_HITS_TOTAL, "tier" => tier.as_str()).increment(1);
        }
    }

    /// Record a cache miss.
    pub fn record_miss(&self) {
        if self.bump(&self.inner.counters.misses) {
            counter!(names::CACHE_MISSES_TOTAL).increment(1);
        }
    }

    pub fn record_set(&self) {
        if self.bump(&self.inner.counters.sets) {
            counter!(names::CACHE_SETS_TOTAL).increment(1);
        }
    }

    pub fn record_delete(&self) {
        if self.bump(&self.inner.counters.deletes) {
            counter!(names::CACHE_DELETES_TOTAL).increment(1);
        }
    }

    /// Record a tier fault or payload error during `operation`.
    pub fn record_error(&self, operation: &'static str) {
        if self.bump(&self.inner.counters.errors) {
            counter!(names::CACHE_ERRORS_TOTAL, "operation" => operation).increment(1);
        }
    }

    /// Add one latency sample for a read.
    pub fn record_latency(&self, latency: Duration) {
        if !self.inner.enabled {
            return;
        }
        let c = &self.inner.counters;
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        c.latency_us_total.fetch_add(micros, Ordering::Relaxed);
        c.latency_samples.fetch_add(1, Ordering::Relaxed);
        histogram!(names::CACHE_GET_DURATION_SECONDS).record(latency.as_secs_f64());
    }

    /// Publish the current number of entries held by `tier`.
    pub fn set_entries(&self, tier: CacheTier, count: usize) {
        if self.inner.enabled {
            gauge!(names::CACHE_ENTRIES, "tier" => tier.as_str()).set(count as f64);
        }
    }

    /// Zero every counter and restart the uptime clock.
    pub fn reset(&self) {
        let c = &self.inner.counters;
        for counter in [
            &c.hits,
            &c.misses,
            &c.l1_hits,
            &c.l2_hits,
            &c.sets,
            &c.deletes,
            &c.errors,
            &c.latency_us_total,
            &c.latency_samples,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        *self.inner.started.write() = Started::now();
    }

    /// Point-in-time view of the counters; `l1_size` and `l1_evictions`
    /// come from the local store.
    pub fn snapshot(&self, l1_size: usize, l1_evictions: u64) -> MetricsSnapshot {
        let c = &self.inner.counters;
        let hits = c.hits.load(Ordering::Relaxed);
        let misses = c.misses.load(Ordering::Relaxed);
        let samples = c.latency_samples.load(Ordering::Relaxed);
        let total_us = c.latency_us_total.load(Ordering::Relaxed);
        let started = self.inner.started.read();

        MetricsSnapshot {
            hits,
            misses,
            hit_rate: hit_rate(hits, misses),
            hits_by_level: HitsByLevel {
                l1: c.l1_hits.load(Ordering::Relaxed),
                l2: c.l2_hits.load(Ordering::Relaxed),
            },
            sets: c.sets.load(Ordering::Relaxed),
            deletes: c.deletes.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            l1_size,
            l1_evictions,
            avg_latency_ms: if samples == 0 {
                0.0
            } else {
                total_us as f64 / samples as f64 / 1000.0
            },
            started_at: started.wall,
            uptime_seconds: started.instant.elapsed().as_secs(),
        }
    }
}

fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HitsByLevel {
    pub l1: u64,
    pub l2: u64,
}

/// Cache metrics at one point in time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, 0 before the first lookup
    pub hit_rate: f64,
    pub hits_by_level: HitsByLevel,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    pub l1_size: usize,
    pub l1_evictions: u64,
    pub avg_latency_ms: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub uptime_seconds: u64,
}

impl MetricsSnapshot {
    /// Lookups plus writes plus deletes.
    pub fn total_operations(&self) -> u64 {
        self.hits + self.misses + self.sets + self.deletes
    }
}
