//! Metrics collection and export for Beacon.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "beacon_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "beacon_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "beacon_connections_rejected_total";
    pub const HANDSHAKE_REJECTIONS: &str = "beacon_handshake_rejections_total";
    pub const FRAMES_TOTAL: &str = "beacon_frames_total";
    pub const FRAMES_BYTES: &str = "beacon_frames_bytes";
    pub const DELIVERIES_TOTAL: &str = "beacon_deliveries_total";
    pub const DELIVERIES_LAGGED: &str = "beacon_deliveries_lagged_total";
    pub const CHANNELS_ACTIVE: &str = "beacon_channels_active";
    pub const SUBSCRIPTIONS_TOTAL: &str = "beacon_subscriptions_total";
    pub const PRESENCE_TRANSITIONS: &str = "beacon_presence_transitions_total";
    pub const USERS_ONLINE: &str = "beacon_users_online";
    pub const LATENCY_SECONDS: &str = "beacon_frame_latency_seconds";
    pub const ERRORS_TOTAL: &str = "beacon_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Connections refused because the server was full"
    );
    metrics::describe_counter!(
        names::HANDSHAKE_REJECTIONS,
        "Upgrade requests rejected by token authentication"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of frames processed");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Messages handed to sessions, by routing kind"
    );
    metrics::describe_counter!(
        names::DELIVERIES_LAGGED,
        "Topic messages skipped by slow subscribers"
    );
    metrics::describe_gauge!(names::CHANNELS_ACTIVE, "Current number of active channels");
    metrics::describe_counter!(
        names::SUBSCRIPTIONS_TOTAL,
        "Total number of subscriptions"
    );
    metrics::describe_counter!(
        names::PRESENCE_TRANSITIONS,
        "User ONLINE/OFFLINE transitions"
    );
    metrics::describe_gauge!(names::USERS_ONLINE, "Users with at least one live session");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound frame processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection(transport: &'static str) {
    counter!(names::CONNECTIONS_TOTAL, "transport" => transport).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a connection refused at the connection limit.
pub fn record_connection_rejected() {
    counter!(names::CONNECTIONS_REJECTED).increment(1);
}

/// Record a rejected handshake.
pub fn record_handshake_rejection(reason: &'static str) {
    counter!(names::HANDSHAKE_REJECTIONS, "reason" => reason).increment(1);
}

/// Record a frame.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record messages handed to sessions.
pub fn record_deliveries(kind: &'static str, recipients: usize) {
    counter!(names::DELIVERIES_TOTAL, "kind" => kind).increment(recipients as u64);
}

/// Record topic messages a subscriber skipped.
pub fn record_lagged(skipped: u64) {
    counter!(names::DELIVERIES_LAGGED).increment(skipped);
}

/// Record frame processing latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record a subscription.
pub fn record_subscription() {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
}

/// Update active channel count.
pub fn set_active_channels(count: usize) {
    gauge!(names::CHANNELS_ACTIVE).set(count as f64);
}

/// Record a user coming online.
pub fn record_online() {
    counter!(names::PRESENCE_TRANSITIONS, "status" => "online").increment(1);
    gauge!(names::USERS_ONLINE).increment(1.0);
}

/// Record a user going offline.
pub fn record_offline() {
    counter!(names::PRESENCE_TRANSITIONS, "status" => "offline").increment(1);
    gauge!(names::USERS_ONLINE).decrement(1.0);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new(transport: &'static str) -> Self {
        record_connection(transport);
        Self
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorders_without_exporter() {
        // No recorder is installed; every call must be a no-op.
        let guard = ConnectionMetricsGuard::new("websocket");
        record_handshake_rejection("missing_token");
        record_deliveries("directed", 2);
        record_online();
        record_offline();
        drop(guard);
    }
}
