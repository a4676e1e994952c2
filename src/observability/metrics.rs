//! Prometheus metrics.
//!
//! The engine records through the `metrics` facade everywhere; installing a
//! recorder is optional and only the CLI does it.

use crate::{Error, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram buckets (milliseconds) for detector and batch durations.
const DURATION_BUCKETS_MS: &[f64] = &[
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 5_000.0, 30_000.0,
];

/// Handle to an installed Prometheus recorder.
#[derive(Debug, Clone)]
pub struct MetricsHandle {
    prometheus: PrometheusHandle,
}

impl MetricsHandle {
    /// Renders all metrics in the Prometheus text exposition format.
    #[must_use]
    pub fn render(&self) -> String {
        self.prometheus.render()
    }
}

/// Installs the Prometheus recorder as the global `metrics` recorder.
///
/// # Errors
///
/// Returns an error if a recorder is already installed.
pub fn install_prometheus() -> Result<MetricsHandle> {
    let prometheus = PrometheusBuilder::new()
        .set_buckets(DURATION_BUCKETS_MS)
        .map_err(|e| Error::OperationFailed {
            operation: "metrics_buckets".to_string(),
            cause: e.to_string(),
        })?
        .install_recorder()
        .map_err(|e| Error::OperationFailed {
            operation: "metrics_recorder_install".to_string(),
            cause: e.to_string(),
        })?;

    Ok(MetricsHandle { prometheus })
}
