//! Remote (L2) cache tier adapters.
//!
//! The coordinator only talks to the [`RemoteStore`] trait. Two adapters are
//! provided:
//!
//! - [`RedisStore`]: the shared, cross-instance tier backed by a
//!   `deadpool-redis` pool
//! - [`MemoryRemoteStore`]: an in-process stand-in with native expiry and
//!   fault injection, for tests and single-binary deployments
//!
//! Expiry is always delegated to the store; adapters report the remaining
//! TTL on reads so promoted L1 copies never outlive the L2 entry.

pub mod memory;
pub mod redis_store;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::RemoteError;
use crate::pattern::KeyPattern;

pub use self::memory::MemoryRemoteStore;
pub use self::redis_store::{RedisStore, connect_redis};

/// A payload read from the remote tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteValue {
    pub data: Vec<u8>,
    /// Time left before the store expires the key; `None` if it never expires
    pub ttl: Option<Duration>,
}

/// Async key-value client for the shared cache tier.
///
/// Every call may fail independently of cache correctness. A missing key is
/// `Ok(None)` / `Ok(false)`, never an error, so callers can tell "not found"
/// apart from "unreachable".
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Short adapter name used in logs and health output.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<RemoteValue>, RemoteError>;

    /// Store `data` under `key`, expiring natively after `ttl`.
    async fn set(&self, key: &str, data: &[u8], ttl: Duration) -> Result<(), RemoteError>;

    /// Remove `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, RemoteError>;

    /// Remove every key matching `pattern` using the store's cursor scan.
    async fn delete_by_pattern(&self, pattern: &KeyPattern) -> Result<usize, RemoteError>;

    async fn exists(&self, key: &str) -> Result<bool, RemoteError>;

    async fn ping(&self) -> Result<(), RemoteError>;
}
