//! Prometheus metrics for messaging

use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_gauge_vec, CounterVec, GaugeVec};

/// Messaging metrics
pub struct MessagingMetrics {
    /// Messages published counter
    pub messages_published: CounterVec,

    /// Message publish failures
    pub publish_failures: CounterVec,

    /// Messages delivered to handlers
    pub messages_consumed: CounterVec,

    /// Non-timeout read errors
    pub read_errors: CounterVec,

    /// Handler invocations that returned an error
    pub handler_failures: CounterVec,

    /// Subscription loops currently running
    pub active_subscriptions: GaugeVec,
}

lazy_static! {
    pub static ref MESSAGING_METRICS: MessagingMetrics = MessagingMetrics {
        messages_published: register_counter_vec!(
            "copier_messages_published_total",
            "Total number of messages published",
            &["topic", "broker"]
        )
        .unwrap(),

        publish_failures: register_counter_vec!(
            "copier_publish_failures_total",
            "Total number of publish failures",
            &["topic", "broker"]
        )
        .unwrap(),

        messages_consumed: register_counter_vec!(
            "copier_messages_consumed_total",
            "Total number of messages handed to subscription handlers",
            &["topic", "broker"]
        )
        .unwrap(),

        read_errors: register_counter_vec!(
            "copier_read_errors_total",
            "Total number of non-timeout read errors",
            &["topic", "broker"]
        )
        .unwrap(),

        handler_failures: register_counter_vec!(
            "copier_handler_failures_total",
            "Total number of handler errors",
            &["topic", "broker"]
        )
        .unwrap(),

        active_subscriptions: register_gauge_vec!(
            "copier_active_subscriptions",
            "Number of running subscription loops",
            &["broker"]
        )
        .unwrap(),
    };
}

/// Initialize messaging metrics
pub fn init_messaging_metrics() {
    lazy_static::initialize(&MESSAGING_METRICS);
}

/// Render every registered metric in the text exposition format
pub fn gather_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|e| {
        tracing::error!("Failed to convert metrics to string: {}", e);
        String::from("# Error converting metrics\n")
    })
}
