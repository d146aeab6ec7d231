//! In-process remote tier with native expiry and fault injection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{RemoteStore, RemoteValue};
use crate::error::RemoteError;
use crate::pattern::KeyPattern;

struct StoredValue {
    data: Vec<u8>,
    expires_at: Instant,
}

/// A shared-store stand-in living in the current process.
///
/// Behaves like a remote key-value server: values expire on their own, every
/// call can be slowed down with [`MemoryRemoteStore::set_latency`] and the
/// whole store can be taken offline with [`MemoryRemoteStore::set_available`].
/// Share one instance (behind `Arc`) between several caches to simulate
/// multiple application instances in front of the same store.
pub struct MemoryRemoteStore {
    data: DashMap<String, StoredValue>,
    available: AtomicBool,
    latency_us: AtomicU64,
    calls: AtomicU64,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            available: AtomicBool::new(true),
            latency_us: AtomicU64::new(0),
            calls: AtomicU64::new(0),
        }
    }

    /// Simulate the store going down (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay applied to every call before it is served.
    pub fn set_latency(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.latency_us.store(micros, Ordering::SeqCst);
    }

    /// Number of calls received, served or not.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Number of stored keys, expired ones included.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remaining TTL of a live key, bypassing availability and latency.
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        self.data
            .get(key)
            .map(|v| v.expires_at.saturating_duration_since(Instant::now()))
            .filter(|left| !left.is_zero())
    }

    async fn enter(&self) -> Result<(), RemoteError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let latency = Duration::from_micros(self.latency_us.load(Ordering::SeqCst));
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Unavailable("connection refused".to_string()))
        }
    }

    fn live(&self, key: &str) -> Option<RemoteValue> {
        let now = Instant::now();
        let entry = self.data.get(key)?;
        if entry.expires_at <= now {
            drop(entry);
            self.data.remove_if(key, |_, v| v.expires_at <= now);
            return None;
        }
        Some(RemoteValue {
            data: entry.data.clone(),
            ttl: Some(entry.expires_at.saturating_duration_since(now)),
        })
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<RemoteValue>, RemoteError> {
        self.enter().await?;
        Ok(self.live(key))
    }

    async fn set(&self, key: &str, data: &[u8], ttl: Duration) -> Result<(), RemoteError> {
        self.enter().await?;
        self.data.insert(
            key.to_string(),
            StoredValue {
                data: data.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, RemoteError> {
        self.enter().await?;
        let now = Instant::now();
        Ok(self
            .data
            .remove(key)
            .is_some_and(|(_, v)| v.expires_at > now))
    }

    async fn delete_by_pattern(&self, pattern: &KeyPattern) -> Result<usize, RemoteError> {
        self.enter().await?;
        let now = Instant::now();
        let mut removed = 0;
        self.data.retain(|k, v| {
            if pattern.matches(k) {
                if v.expires_at > now {
                    removed += 1;
                }
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, RemoteError> {
        self.enter().await?;
        Ok(self.live(key).is_some())
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        self.enter().await
    }
}
