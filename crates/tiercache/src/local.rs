//! In-process (L1) cache tier.
//!
//! A bounded key → entry map with per-entry TTL and least-recently-used
//! eviction. All map operations are serialized behind a single mutex; none
//! of them suspend, so the lock is never held across an `.await`.
//!
//! Expired entries are dropped lazily when read. [`LocalStore::purge_expired`]
//! bounds the memory held by entries that expire without being read again.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::pattern::KeyPattern;

/// A cached payload with its validity window.
///
/// The data is wrapped in `Arc` so hits clone a pointer, not the payload.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub data: Arc<Vec<u8>>,
    pub created_at: Instant,
    pub expires_at: Instant,
}

impl CacheEntry {
    pub fn new(data: Arc<Vec<u8>>, ttl: Duration) -> Self {
        let created_at = Instant::now();
        Self {
            data,
            created_at,
            expires_at: created_at + ttl,
        }
    }

    /// An entry is valid while `now < expires_at`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    pub fn remaining_ttl(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

struct Slot {
    entry: CacheEntry,
    /// Position in the recency index; larger is more recent
    tick: u64,
}

#[derive(Default)]
struct LocalState {
    entries: HashMap<String, Slot>,
    recency: BTreeMap<u64, String>,
    next_tick: u64,
}

impl LocalState {
    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn remove(&mut self, key: &str) -> Option<Slot> {
        let slot = self.entries.remove(key)?;
        self.recency.remove(&slot.tick);
        Some(slot)
    }

    fn touch(&mut self, key: &str) {
        let tick = self.bump();
        if let Some(slot) = self.entries.get_mut(key) {
            let old = std::mem::replace(&mut slot.tick, tick);
            if let Some(k) = self.recency.remove(&old) {
                self.recency.insert(tick, k);
            }
        }
    }

    fn pop_lru(&mut self) -> Option<String> {
        let (_, key) = self.recency.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }
}

/// Bounded LRU + TTL store for encoded values.
pub struct LocalStore {
    state: Mutex<LocalState>,
    max_items: usize,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl LocalStore {
    /// Create a store holding at most `max_items` entries (at least one).
    pub fn new(max_items: usize) -> Self {
        Self {
            state: Mutex::new(LocalState::default()),
            max_items: max_items.max(1),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_items
    }

    /// Look up a live entry and mark it most recently used.
    ///
    /// An expired entry is removed and reported as absent.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut st = self.state.lock();
        let expired = st.entries.get(key)?.entry.is_expired();
        if expired {
            st.remove(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        st.touch(key);
        st.entries.get(key).map(|slot| slot.entry.clone())
    }

    /// Insert or replace an entry.
    ///
    /// When the store is full and `key` is new, the least recently used entry
    /// is evicted first; its key is returned.
    pub fn set(&self, key: &str, data: Arc<Vec<u8>>, ttl: Duration) -> Option<String> {
        let entry = CacheEntry::new(data, ttl);
        let mut st = self.state.lock();

        if let Some(slot) = st.entries.get_mut(key) {
            slot.entry = entry;
            st.touch(key);
            return None;
        }

        let evicted = if st.entries.len() >= self.max_items {
            let victim = st.pop_lru();
            if victim.is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
            victim
        } else {
            None
        };

        let tick = st.bump();
        st.recency.insert(tick, key.to_string());
        st.entries.insert(key.to_string(), Slot { entry, tick });

        if let Some(ref victim) = evicted {
            tracing::debug!(key = %key, evicted = %victim, "L1 full, evicted least recently used entry");
        }
        evicted
    }

    /// Remove a key. Returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        self.state.lock().remove(key).is_some()
    }

    /// Remove every key matching `pattern`. Returns the number removed.
    pub fn delete_by_pattern(&self, pattern: &KeyPattern) -> usize {
        let mut st = self.state.lock();
        if pattern.is_exact() {
            return usize::from(st.remove(pattern.as_str()).is_some());
        }

        let victims: Vec<String> = st
            .entries
            .keys()
            .filter(|k| pattern.matches(k))
            .cloned()
            .collect();
        for key in &victims {
            st.remove(key);
        }
        victims.len()
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut st = self.state.lock();
        let expired: Vec<String> = st
            .entries
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired_at(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            st.remove(key);
        }
        if !expired.is_empty() {
            self.expirations
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
        }
        expired.len()
    }

    /// Whether a live entry exists, without refreshing its recency.
    pub fn contains(&self, key: &str) -> bool {
        self.state
            .lock()
            .entries
            .get(key)
            .is_some_and(|slot| !slot.entry.is_expired())
    }

    /// Time left before `key` expires, if it is present and live.
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        self.state
            .lock()
            .entries
            .get(key)
            .filter(|slot| !slot.entry.is_expired())
            .map(|slot| slot.entry.remaining_ttl())
    }

    pub fn clear(&self) {
        let mut st = self.state.lock();
        st.entries.clear();
        st.recency.clear();
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    /// Whether the store lock is free right now. Never blocks.
    pub fn probe(&self) -> bool {
        self.state.try_lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> Arc<Vec<u8>> {
        Arc::new(s.as_bytes().to_vec())
    }

    #[test]
    fn test_set_and_get() {
        let store = LocalStore::new(10);
        store.set("a", data("1"), Duration::from_secs(60));

        let entry = store.get("a").unwrap();
        assert_eq!(entry.data.as_slice(), b"1");
        assert_eq!(entry.expires_at, entry.created_at + Duration::from_secs(60));
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn test_expired_entry_is_removed_on_read() {
        let store = LocalStore::new(10);
        store.set("a", data("1"), Duration::from_millis(20));
        assert_eq!(store.len(), 1);

        std::thread::sleep(Duration::from_millis(30));

        assert!(store.get("a").is_none());
        assert_eq!(store.len(), 0);
        assert_eq!(store.expirations(), 1);
    }

    #[test]
    fn test_zero_ttl_is_never_valid() {
        let store = LocalStore::new(10);
        store.set("a", data("1"), Duration::ZERO);
        assert!(store.get("a").is_none());
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let store = LocalStore::new(3);
        let ttl = Duration::from_secs(60);
        store.set("a", data("1"), ttl);
        store.set("b", data("2"), ttl);
        store.set("c", data("3"), ttl);

        // "a" becomes most recent, so "b" is now the LRU entry
        assert!(store.get("a").is_some());

        let evicted = store.set("d", data("4"), ttl);
        assert_eq!(evicted.as_deref(), Some("b"));
        assert_eq!(store.len(), 3);
        assert!(store.get("b").is_none());
        assert!(store.get("a").is_some());
        assert!(store.get("c").is_some());
        assert!(store.get("d").is_some());
        assert_eq!(store.evictions(), 1);
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let store = LocalStore::new(2);
        let ttl = Duration::from_secs(60);
        store.set("a", data("1"), ttl);
        store.set("b", data("2"), ttl);

        assert!(store.set("a", data("updated"), ttl).is_none());
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("a").unwrap().data.as_slice(), b"updated");

        // overwrite refreshed "a", so "b" goes next
        assert_eq!(store.set("c", data("3"), ttl).as_deref(), Some("b"));
    }

    #[test]
    fn test_size_never_exceeds_bound() {
        let store = LocalStore::new(16);
        let ttl = Duration::from_secs(60);
        for i in 0..200 {
            let key = format!("k{i}");
            let evicted = store.set(&key, data("v"), ttl);
            assert!(store.len() <= 16);
            if i >= 16 {
                // insertion order with no reads: the oldest key goes first
                assert_eq!(evicted, Some(format!("k{}", i - 16)));
            }
        }
    }

    #[test]
    fn test_delete_is_idempotent() {
        let store = LocalStore::new(10);
        store.set("a", data("1"), Duration::from_secs(60));
        assert!(store.delete("a"));
        assert!(!store.delete("a"));
        assert!(store.get("a").is_none());
    }

    #[test]
    fn test_delete_by_pattern() {
        let store = LocalStore::new(10);
        let ttl = Duration::from_secs(60);
        store.set("user:1", data("1"), ttl);
        store.set("user:2", data("2"), ttl);
        store.set("order:1", data("3"), ttl);

        let removed = store.delete_by_pattern(&KeyPattern::new("user:*").unwrap());
        assert_eq!(removed, 2);
        assert!(store.get("order:1").is_some());
        assert_eq!(store.delete_by_pattern(&KeyPattern::new("user:*").unwrap()), 0);

        assert_eq!(store.delete_by_pattern(&KeyPattern::new("order:1").unwrap()), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_purge_expired() {
        let store = LocalStore::new(10);
        store.set("short", data("1"), Duration::from_millis(10));
        store.set("long", data("2"), Duration::from_secs(60));

        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.contains("long"));
        assert!(!store.contains("short"));
    }

    #[test]
    fn test_remaining_ttl_and_probe() {
        let store = LocalStore::new(10);
        store.set("a", data("1"), Duration::from_secs(5));
        let left = store.remaining_ttl("a").unwrap();
        assert!(left <= Duration::from_secs(5));
        assert!(left > Duration::from_secs(4));
        assert!(store.remaining_ttl("b").is_none());
        assert!(store.probe());
    }

    #[test]
    fn test_probe_does_not_wait_for_a_held_lock() {
        let store = LocalStore::new(10);
        let guard = store.state.lock();
        let started = Instant::now();
        assert!(!store.probe());
        assert!(started.elapsed() < Duration::from_millis(50));
        drop(guard);
        assert!(store.probe());
    }

    #[test]
    fn test_concurrent_access_stays_bounded() {
        let store = Arc::new(LocalStore::new(64));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let key = format!("t{t}:{i}");
                        store.set(&key, data("v"), Duration::from_secs(60));
                        store.get(&key);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.len(), 64);
    }
}
