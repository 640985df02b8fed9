//! Centralized metrics for the marketplace backend
//!
//! Each workflow phase defines its own metrics in a dedicated submodule so names
//! stay unique and ownership is obvious. Everything is exported in Prometheus
//! text format through [`render`], which the HTTP server serves at `/metrics`.

pub mod checkout;
pub mod download;
pub mod fulfillment;
pub mod notifications;
pub mod registry;

pub use checkout::CheckoutMetrics;
pub use download::DownloadMetrics;
pub use fulfillment::FulfillmentMetrics;
pub use notifications::NotificationMetrics;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::{Once, OnceLock};
use tracing::{info, warn};

static INIT: Once = Once::new();
static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder and register every phase's metrics.
///
/// Idempotent; later calls are no-ops. If another recorder is already installed
/// the failure is logged and [`render`] returns an empty snapshot.
pub fn init_metrics() {
    INIT.call_once(|| match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if HANDLE.set(handle).is_err() {
                warn!("Prometheus handle was already stored");
            }
            registry::register_all_metrics();
            info!("Prometheus recorder installed");
        }
        Err(e) => {
            warn!("Failed to install Prometheus recorder: {}", e);
        }
    });
}

/// Current snapshot in Prometheus text exposition format.
pub fn render() -> String {
    HANDLE.get().map(|h| h.render()).unwrap_or_default()
}

/// Trait for phase-specific metrics collections
///
/// Each phase provides:
/// - Metric registration at startup
/// - Its name, used as the metric prefix
/// - Documentation of what each metric measures
pub trait PhaseMetrics {
    /// Register all metrics for this phase
    fn register_metrics();

    /// Get the phase name for prefixing metrics
    fn phase_name() -> &'static str;

    /// Get documentation for all metrics in this phase
    fn metrics_documentation() -> Vec<MetricDoc>;
}

/// Documentation for a single metric
#[derive(Debug, Clone)]
pub struct MetricDoc {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub help: &'static str,
    pub labels: Vec<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Histogram,
    Gauge,
}

/// Builds a metric name following `cifra_{phase}_{name}` (counters get a `_total` suffix).
macro_rules! phase_metric {
    (counter, $phase:literal, $name:literal) => {
        concat!("cifra_", $phase, "_", $name, "_total")
    };
    (histogram, $phase:literal, $name:literal) => {
        concat!("cifra_", $phase, "_", $name)
    };
    (gauge, $phase:literal, $name:literal) => {
        concat!("cifra_", $phase, "_", $name)
    };
}

pub(crate) use phase_metric;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_metric_naming() {
        assert_eq!(
            phase_metric!(counter, "download", "served"),
            "cifra_download_served_total"
        );
        assert_eq!(
            phase_metric!(histogram, "fulfillment", "duration_seconds"),
            "cifra_fulfillment_duration_seconds"
        );
    }

    #[test]
    fn test_init_is_idempotent() {
        init_metrics();
        init_metrics();
        FulfillmentMetrics::record_order_fulfilled(1999, 0.01);
        // Another test binary may own the global recorder; only check when ours is installed.
        if HANDLE.get().is_some() {
            assert!(render().contains("cifra_fulfillment_orders_fulfilled_total"));
        }
    }
}
