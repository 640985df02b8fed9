//! Notification Outbox Metrics

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct NotificationMetrics;

impl NotificationMetrics {
    pub fn record_sent(kind: &str) {
        ::metrics::counter!(
            phase_metric!(counter, "notifications", "sent"),
            "kind" => kind.to_string()
        )
        .increment(1);
    }

    pub fn record_failed(kind: &str) {
        ::metrics::counter!(
            phase_metric!(counter, "notifications", "failed"),
            "kind" => kind.to_string()
        )
        .increment(1);
    }

    pub fn record_abandoned() {
        ::metrics::counter!(phase_metric!(counter, "notifications", "abandoned")).increment(1);
    }

    pub fn set_backlog(pending: usize) {
        ::metrics::gauge!(phase_metric!(gauge, "notifications", "backlog")).set(pending as f64);
    }
}

impl PhaseMetrics for NotificationMetrics {
    fn register_metrics() {
        use metrics::{describe_counter, describe_gauge};

        describe_counter!(
            phase_metric!(counter, "notifications", "sent"),
            "Emails delivered from the outbox"
        );
        describe_counter!(
            phase_metric!(counter, "notifications", "failed"),
            "Email delivery attempts that failed"
        );
        describe_counter!(
            phase_metric!(counter, "notifications", "abandoned"),
            "Notifications given up after the maximum number of attempts"
        );
        describe_gauge!(
            phase_metric!(gauge, "notifications", "backlog"),
            "Pending notifications seen by the last dispatch pass"
        );
    }

    fn phase_name() -> &'static str {
        "notifications"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "notifications", "sent"),
                metric_type: MetricType::Counter,
                help: "Emails delivered from the outbox",
                labels: vec!["kind"],
            },
            MetricDoc {
                name: phase_metric!(counter, "notifications", "failed"),
                metric_type: MetricType::Counter,
                help: "Email delivery attempts that failed",
                labels: vec!["kind"],
            },
            MetricDoc {
                name: phase_metric!(counter, "notifications", "abandoned"),
                metric_type: MetricType::Counter,
                help: "Notifications given up after the maximum number of attempts",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(gauge, "notifications", "backlog"),
                metric_type: MetricType::Gauge,
                help: "Pending notifications seen by the last dispatch pass",
                labels: vec![],
            },
        ]
    }
}
