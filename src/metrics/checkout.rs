//! Checkout Phase Metrics

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct CheckoutMetrics;

impl CheckoutMetrics {
    pub fn record_payment_created(amount: i64, promo_applied: bool) {
        ::metrics::counter!(phase_metric!(counter, "checkout", "payments_created")).increment(1);
        ::metrics::histogram!(phase_metric!(histogram, "checkout", "order_amount"))
            .record(amount as f64);
        if promo_applied {
            ::metrics::counter!(phase_metric!(counter, "checkout", "promos_applied")).increment(1);
        }
    }

    pub fn record_rejected(reason: &'static str) {
        ::metrics::counter!(
            phase_metric!(counter, "checkout", "rejected"),
            "reason" => reason
        )
        .increment(1);
    }

    pub fn record_gateway_error() {
        ::metrics::counter!(phase_metric!(counter, "checkout", "gateway_errors")).increment(1);
    }
}

impl PhaseMetrics for CheckoutMetrics {
    fn register_metrics() {
        use metrics::{describe_counter, describe_histogram};

        describe_counter!(
            phase_metric!(counter, "checkout", "payments_created"),
            "Payments created with the gateway and recorded as pending orders"
        );
        describe_counter!(
            phase_metric!(counter, "checkout", "promos_applied"),
            "Checkouts that applied a promo code"
        );
        describe_counter!(
            phase_metric!(counter, "checkout", "rejected"),
            "Checkout requests rejected before contacting the gateway"
        );
        describe_counter!(
            phase_metric!(counter, "checkout", "gateway_errors"),
            "Payment creation calls that failed"
        );
        describe_histogram!(
            phase_metric!(histogram, "checkout", "order_amount"),
            "Charged amount per checkout in currency units"
        );
    }

    fn phase_name() -> &'static str {
        "checkout"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "checkout", "payments_created"),
                metric_type: MetricType::Counter,
                help: "Payments created with the gateway and recorded as pending orders",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "checkout", "promos_applied"),
                metric_type: MetricType::Counter,
                help: "Checkouts that applied a promo code",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "checkout", "rejected"),
                metric_type: MetricType::Counter,
                help: "Checkout requests rejected before contacting the gateway",
                labels: vec!["reason"],
            },
            MetricDoc {
                name: phase_metric!(counter, "checkout", "gateway_errors"),
                metric_type: MetricType::Counter,
                help: "Payment creation calls that failed",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(histogram, "checkout", "order_amount"),
                metric_type: MetricType::Histogram,
                help: "Charged amount per checkout in currency units",
                labels: vec![],
            },
        ]
    }
}
