//! Download Gateway Metrics

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct DownloadMetrics;

impl DownloadMetrics {
    pub fn record_served(signed: bool) {
        let kind = if signed { "signed" } else { "legacy" };
        ::metrics::counter!(phase_metric!(counter, "download", "served"), "kind" => kind)
            .increment(1);
    }

    pub fn record_token_not_found() {
        ::metrics::counter!(phase_metric!(counter, "download", "token_not_found")).increment(1);
    }

    pub fn record_token_expired() {
        ::metrics::counter!(phase_metric!(counter, "download", "token_expired")).increment(1);
    }

    pub fn record_file_missing() {
        ::metrics::counter!(phase_metric!(counter, "download", "file_missing")).increment(1);
    }

    pub fn record_signing_error() {
        ::metrics::counter!(phase_metric!(counter, "download", "signing_errors")).increment(1);
    }
}

impl PhaseMetrics for DownloadMetrics {
    fn register_metrics() {
        use metrics::describe_counter;

        for doc in Self::metrics_documentation() {
            describe_counter!(doc.name, doc.help);
        }
    }

    fn phase_name() -> &'static str {
        "download"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "download", "served"),
                metric_type: MetricType::Counter,
                help: "Download redirects issued, by link kind",
                labels: vec!["kind"],
            },
            MetricDoc {
                name: phase_metric!(counter, "download", "token_not_found"),
                metric_type: MetricType::Counter,
                help: "Download attempts with an unknown token",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "download", "token_expired"),
                metric_type: MetricType::Counter,
                help: "Download attempts with an expired token",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "download", "file_missing"),
                metric_type: MetricType::Counter,
                help: "Download attempts for products without the requested file",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "download", "signing_errors"),
                metric_type: MetricType::Counter,
                help: "Failures generating a time-limited object storage link",
                labels: vec![],
            },
        ]
    }
}
