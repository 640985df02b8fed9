//! Fulfillment Phase Metrics
//!
//! Webhook deliveries, verification outcomes and the orders they settle.

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

/// Metrics collection for payment event handling
pub struct FulfillmentMetrics;

impl FulfillmentMetrics {
    pub fn record_event_received(event: &str) {
        ::metrics::counter!(
            phase_metric!(counter, "fulfillment", "events_received"),
            "event" => event.to_string()
        )
        .increment(1);
    }

    pub fn record_order_fulfilled(amount: i64, duration_secs: f64) {
        ::metrics::counter!(phase_metric!(counter, "fulfillment", "orders_fulfilled")).increment(1);
        ::metrics::counter!(phase_metric!(counter, "fulfillment", "gross_amount"))
            .increment(amount.max(0) as u64);
        ::metrics::histogram!(phase_metric!(histogram, "fulfillment", "duration_seconds"))
            .record(duration_secs);
    }

    pub fn record_duplicate_delivery() {
        ::metrics::counter!(phase_metric!(counter, "fulfillment", "duplicate_deliveries"))
            .increment(1);
    }

    pub fn record_order_canceled() {
        ::metrics::counter!(phase_metric!(counter, "fulfillment", "orders_canceled")).increment(1);
    }

    pub fn record_order_failed() {
        ::metrics::counter!(phase_metric!(counter, "fulfillment", "orders_failed")).increment(1);
    }

    pub fn record_unknown_order() {
        ::metrics::counter!(phase_metric!(counter, "fulfillment", "unknown_orders")).increment(1);
    }

    pub fn record_verification_failure() {
        ::metrics::counter!(phase_metric!(counter, "fulfillment", "verification_failures"))
            .increment(1);
    }
}

impl PhaseMetrics for FulfillmentMetrics {
    fn register_metrics() {
        use metrics::{describe_counter, describe_histogram};

        for doc in Self::metrics_documentation() {
            match doc.metric_type {
                MetricType::Counter => describe_counter!(doc.name, doc.help),
                MetricType::Histogram => describe_histogram!(doc.name, doc.help),
                MetricType::Gauge => {}
            }
        }
    }

    fn phase_name() -> &'static str {
        "fulfillment"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "fulfillment", "events_received"),
                metric_type: MetricType::Counter,
                help: "Payment notifications received, by event type",
                labels: vec!["event"],
            },
            MetricDoc {
                name: phase_metric!(counter, "fulfillment", "orders_fulfilled"),
                metric_type: MetricType::Counter,
                help: "Orders moved to paid with sale, token and notifications committed",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "fulfillment", "gross_amount"),
                metric_type: MetricType::Counter,
                help: "Sum of fulfilled order amounts in currency units",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "fulfillment", "duplicate_deliveries"),
                metric_type: MetricType::Counter,
                help: "Notifications for orders that had already left pending",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "fulfillment", "orders_canceled"),
                metric_type: MetricType::Counter,
                help: "Orders canceled after a verified cancellation",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "fulfillment", "orders_failed"),
                metric_type: MetricType::Counter,
                help: "Orders failed because the verified payment did not match the order",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "fulfillment", "unknown_orders"),
                metric_type: MetricType::Counter,
                help: "Notifications for payment ids with no recorded order",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "fulfillment", "verification_failures"),
                metric_type: MetricType::Counter,
                help: "Notifications whose payment could not be confirmed with the gateway",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(histogram, "fulfillment", "duration_seconds"),
                metric_type: MetricType::Histogram,
                help: "Time from notification receipt to committed fulfillment",
                labels: vec![],
            },
        ]
    }
}
