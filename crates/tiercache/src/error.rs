use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Which tier an operation or failure refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTier {
    L1,
    L2,
}

impl CacheTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::L1 => "L1",
            CacheTier::L2 => "L2",
        }
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the cache layer.
///
/// The type is `Clone` so a single failure of a shared computation can be
/// handed to every caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("cache tier {tier} unavailable: {reason}")]
    TierUnavailable { tier: CacheTier, reason: String },

    #[error("cache serialization error: {0}")]
    Serialization(String),

    #[error("compute failed: {0}")]
    Compute(Arc<anyhow::Error>),

    #[error("invalid cache configuration: {0}")]
    InvalidConfiguration(String),
}

impl CacheError {
    /// Create a new TierUnavailable error for the remote tier
    pub fn remote_unavailable(reason: impl Into<String>) -> Self {
        Self::TierUnavailable {
            tier: CacheTier::L2,
            reason: reason.into(),
        }
    }

    /// Create a new InvalidConfiguration error
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into())
    }

    /// Wrap a failure raised by a caller-supplied computation
    pub fn compute(error: anyhow::Error) -> Self {
        Self::Compute(Arc::new(error))
    }

    /// Returns true when the error came from the caller's computation
    pub fn is_compute(&self) -> bool {
        matches!(self, Self::Compute(_))
    }
}

impl From<rmp_serde::encode::Error> for CacheError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CacheError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<RemoteError> for CacheError {
    fn from(e: RemoteError) -> Self {
        Self::remote_unavailable(e.to_string())
    }
}

/// Failures of a remote store call.
///
/// A missing key is never an error: adapters return `Ok(None)` for it.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote store unreachable: {0}")]
    Unavailable(String),

    #[error("remote store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("remote store protocol error: {0}")]
    Protocol(String),
}

impl From<redis::RedisError> for RemoteError {
    fn from(e: redis::RedisError) -> Self {
        // the client-side deadline is unknown here; `TieredCache` reports its own
        // timeouts as `Timeout`
        if e.is_timeout() {
            Self::Unavailable(format!("redis timed out: {e}"))
        } else if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
            Self::Unavailable(e.to_string())
        } else {
            Self::Protocol(e.to_string())
        }
    }
}

impl From<deadpool_redis::PoolError> for RemoteError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        Self::Unavailable(format!("failed to get Redis connection: {e}"))
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_become_tier_unavailable() {
        let err: CacheError = RemoteError::Timeout(Duration::from_millis(50)).into();
        match err {
            CacheError::TierUnavailable { tier, reason } => {
                assert_eq!(tier, CacheTier::L2);
                assert!(reason.contains("timed out"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn redis_timeout_keeps_the_driver_message() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "read stalled");
        let err = RemoteError::from(redis::RedisError::from(io));
        match &err {
            RemoteError::Unavailable(reason) => {
                assert!(reason.contains("timed out"));
                assert!(reason.contains("read stalled"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!err.to_string().contains("0ns"));
    }

    #[test]
    fn compute_errors_share_the_same_source() {
        let err = CacheError::compute(anyhow::anyhow!("db down"));
        let copy = err.clone();
        match (&err, &copy) {
            (CacheError::Compute(a), CacheError::Compute(b)) => assert!(Arc::ptr_eq(a, b)),
            _ => unreachable!(),
        }
        assert!(copy.is_compute());
        assert_eq!(err.to_string(), "compute failed: db down");
    }
}
