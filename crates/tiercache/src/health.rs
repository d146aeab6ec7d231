//! Cache health report types.

use serde::Serialize;

/// Overall cache status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Both tiers reachable
    Healthy,
    /// One tier unreachable, the other still serving
    Degraded,
    /// Neither tier reachable
    Unhealthy,
}

impl HealthState {
    pub fn from_tiers(l1_available: bool, l2_available: bool) -> Self {
        match (l1_available, l2_available) {
            (true, true) => HealthState::Healthy,
            (false, false) => HealthState::Unhealthy,
            _ => HealthState::Degraded,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct L1Health {
    pub available: bool,
    pub item_count: usize,
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct L2Health {
    pub available: bool,
    /// Adapter name, `None` when no remote tier is configured
    pub backend: Option<&'static str>,
    /// Round-trip time of the health ping
    pub latency_ms: Option<f64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    pub hit_rate: f64,
    pub total_operations: u64,
    pub errors: u64,
}

/// Health report derived from the current L1 state and a fresh L2 ping.
#[derive(Debug, Clone, Serialize)]
pub struct CacheHealthStatus {
    pub status: HealthState,
    pub l1: L1Health,
    pub l2: L2Health,
    pub metrics: HealthMetrics,
}

impl CacheHealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthState::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_from_tier_availability() {
        assert_eq!(HealthState::from_tiers(true, true), HealthState::Healthy);
        assert_eq!(HealthState::from_tiers(true, false), HealthState::Degraded);
        assert_eq!(HealthState::from_tiers(false, true), HealthState::Degraded);
        assert_eq!(HealthState::from_tiers(false, false), HealthState::Unhealthy);
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&HealthState::Degraded).unwrap(),
            "\"degraded\""
        );
    }
}
