//! Tracing and Prometheus setup for processes embedding the cache.

use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Set once by [`init_metrics`].
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_tracing() {
    init_tracing_with_level("info");
}

/// Install the global subscriber. `RUST_LOG` wins over `level` when set.
/// Calling it again is a no-op.
pub fn init_tracing_with_level(level: &str) {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|_| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

/// Route the `cache_*` series recorded by [`crate::metrics::CacheMetrics`]
/// to a Prometheus recorder.
///
/// Only the first successful call installs anything; later calls return
/// `false` and leave the recorder in place.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        return false;
    }

    let handle = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "metrics recorder not installed, cache series stay in-process");
            return false;
        }
    };

    let installed = PROMETHEUS_HANDLE.set(handle).is_ok();
    if installed {
        tracing::info!("cache metrics exported in Prometheus text format");
    }
    installed
}

/// Current cache series as Prometheus text. `None` until [`init_metrics`]
/// has installed a recorder.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(PrometheusHandle::render)
}
