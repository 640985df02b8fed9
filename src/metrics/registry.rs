//! Metrics registry for coordinating phase-specific metrics
//!
//! Registers every phase's metrics and detects duplicate names early.

use crate::metrics::{MetricDoc, PhaseMetrics};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Register all metrics from all phases
pub fn register_all_metrics() {
    let mut all_metrics = HashMap::new();

    register_phase_metrics::<super::checkout::CheckoutMetrics>(&mut all_metrics);
    register_phase_metrics::<super::fulfillment::FulfillmentMetrics>(&mut all_metrics);
    register_phase_metrics::<super::download::DownloadMetrics>(&mut all_metrics);
    register_phase_metrics::<super::notifications::NotificationMetrics>(&mut all_metrics);

    info!(
        "Registered {} total metrics across all phases",
        all_metrics.len()
    );

    if std::env::var("CIFRA_METRICS_DEBUG").is_ok() {
        log_metrics_summary(&all_metrics);
    }
}

/// Register metrics for a specific phase and detect conflicts
fn register_phase_metrics<T: PhaseMetrics>(all_metrics: &mut HashMap<&'static str, (&'static str, MetricDoc)>) {
    T::register_metrics();
    let phase_name = T::phase_name();

    for doc in T::metrics_documentation() {
        if let Some((owner, _)) = all_metrics.get(doc.name) {
            warn!(
                "Metric name conflict detected: '{}' is defined by both '{}' and '{}'",
                doc.name, owner, phase_name
            );
        } else {
            all_metrics.insert(doc.name, (phase_name, doc));
        }
    }
}

fn log_metrics_summary(all_metrics: &HashMap<&'static str, (&'static str, MetricDoc)>) {
    let mut by_phase: HashMap<&str, Vec<&MetricDoc>> = HashMap::new();
    for doc in all_metrics.values().map(|(_, doc)| doc) {
        by_phase
            .entry(extract_phase_from_metric_name(doc.name))
            .or_default()
            .push(doc);
    }

    for (phase, metrics) in by_phase {
        info!("Phase '{}': {} metrics", phase, metrics.len());
        for metric in metrics {
            debug!(
                "  - {} ({:?}, labels {:?}): {}",
                metric.name, metric.metric_type, metric.labels, metric.help
            );
        }
    }
}

/// Extract phase name from metric name (e.g., "cifra_download_served_total" -> "download")
fn extract_phase_from_metric_name(metric_name: &str) -> &str {
    if let Some(stripped) = metric_name.strip_prefix("cifra_") {
        if let Some(next_underscore) = stripped.find('_') {
            return &stripped[..next_underscore];
        }
    }
    "unknown"
}
