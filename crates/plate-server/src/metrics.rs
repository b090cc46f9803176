//! Metrics collection and Prometheus export.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CLIENTS_TOTAL: &str = "plategate_clients_total";
    pub const CLIENTS_ACTIVE: &str = "plategate_clients_active";
    pub const MESSAGES_TOTAL: &str = plate_core::dispatch::MESSAGES_METRIC;
    pub const SEND_FAILURES_TOTAL: &str = "plategate_send_failures_total";
    pub const CHAT_STATES_TOTAL: &str = "plategate_chat_states_total";
    pub const SUBSCRIPTIONS_TOTAL: &str = "plategate_subscriptions_total";
    pub const TOPICS_ACTIVE: &str = "plategate_topics_active";
    pub const REQUEST_SECONDS: &str = "plategate_request_seconds";
    pub const ERRORS_TOTAL: &str = "plategate_errors_total";
}

pub fn init_metrics() {
    metrics::describe_counter!(
        names::CLIENTS_TOTAL,
        "Total number of local WebSocket clients since start"
    );
    metrics::describe_gauge!(
        names::CLIENTS_ACTIVE,
        "Current number of local WebSocket clients"
    );
    metrics::describe_counter!(
        names::MESSAGES_TOTAL,
        "Messages sent or received, labelled by direction"
    );
    metrics::describe_counter!(names::SEND_FAILURES_TOTAL, "Messages that could not be sent");
    metrics::describe_counter!(names::CHAT_STATES_TOTAL, "Chat-state submissions");
    metrics::describe_counter!(names::SUBSCRIPTIONS_TOTAL, "Topic subscriptions");
    metrics::describe_gauge!(names::TOPICS_ACTIVE, "Topics with at least one subscriber");
    metrics::describe_histogram!(names::REQUEST_SECONDS, "HTTP request latency in seconds");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus exporter.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

pub fn record_send_failure() {
    counter!(names::SEND_FAILURES_TOTAL).increment(1);
}

pub fn record_chat_state(source: &'static str) {
    counter!(names::CHAT_STATES_TOTAL, "source" => source).increment(1);
}

pub fn record_subscription() {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
}

pub fn set_active_topics(count: usize) {
    gauge!(names::TOPICS_ACTIVE).set(count as f64);
}

pub fn record_latency(route: &str, seconds: f64) {
    histogram!(names::REQUEST_SECONDS, "route" => route.to_string()).record(seconds);
}

pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Counts a local client for as long as it lives.
pub struct ClientMetricsGuard;

impl ClientMetricsGuard {
    #[must_use]
    pub fn new() -> Self {
        counter!(names::CLIENTS_TOTAL).increment(1);
        gauge!(names::CLIENTS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for ClientMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ClientMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::CLIENTS_ACTIVE).decrement(1.0);
    }
}
