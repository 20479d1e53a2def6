// src/core/metrics.rs

//! Defines and registers Prometheus metrics for gateway monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use crate::core::registry::{ConnectionRegistry, PeerRole};
use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, GaugeVec, Histogram, TextEncoder, register_counter, register_counter_vec,
    register_gauge_vec, register_histogram,
};

lazy_static! {
    // --- Gauges ---
    /// The number of currently connected peers, labeled by role.
    pub static ref CONNECTED_PEERS: GaugeVec =
        register_gauge_vec!("nexus_connected_peers", "Number of currently connected peers, by role.", &["role"]).unwrap();

    // --- Counters ---
    /// The total number of connections accepted since startup, labeled by role.
    pub static ref CONNECTIONS_RECEIVED_TOTAL: CounterVec =
        register_counter_vec!("nexus_connections_received_total", "Total number of connections received, by role.", &["role"]).unwrap();
    /// The total number of inbound events dispatched to a worker (live path).
    pub static ref EVENTS_DISPATCHED_TOTAL: Counter =
        register_counter!("nexus_events_dispatched_total", "Total number of events dispatched to workers.").unwrap();
    /// The total number of inbound events dropped after all delivery attempts failed.
    pub static ref EVENTS_DROPPED_TOTAL: Counter =
        register_counter!("nexus_events_dropped_total", "Total number of events dropped on the live path.").unwrap();
    /// The total number of outbound API calls forwarded to a bot.
    pub static ref ACTIONS_FORWARDED_TOTAL: Counter =
        register_counter!("nexus_actions_forwarded_total", "Total number of API calls forwarded to bots.").unwrap();
    /// The total number of synthetic failure responses, labeled by reason.
    pub static ref SYNTHETIC_FAILURES_TOTAL: CounterVec =
        register_counter_vec!("nexus_synthetic_failures_total", "Total number of synthesized failure responses, by reason.", &["reason"]).unwrap();
    /// The total number of correlation timeouts that won the race against the real response.
    pub static ref CORRELATION_TIMEOUTS_TOTAL: Counter =
        register_counter!("nexus_correlation_timeouts_total", "Total number of expired correlation tokens.").unwrap();
    /// The total number of peers evicted for heartbeat silence, labeled by role.
    pub static ref HEARTBEAT_EVICTIONS_TOTAL: CounterVec =
        register_counter_vec!("nexus_heartbeat_evictions_total", "Total number of peers evicted by the health monitor, by role.", &["role"]).unwrap();
    /// The total number of entries appended to durable streams.
    pub static ref STREAM_ENTRIES_APPENDED_TOTAL: Counter =
        register_counter!("nexus_stream_entries_appended_total", "Total number of entries appended to durable streams.").unwrap();
    /// The total number of durable stream entries acknowledged.
    pub static ref STREAM_ENTRIES_ACKED_TOTAL: Counter =
        register_counter!("nexus_stream_entries_acked_total", "Total number of durable stream entries acknowledged.").unwrap();
    /// The total number of durable stream entries reclaimed from dead consumers.
    pub static ref STREAM_ENTRIES_CLAIMED_TOTAL: Counter =
        register_counter!("nexus_stream_entries_claimed_total", "Total number of durable stream entries reclaimed from idle consumers.").unwrap();

    // --- Histograms ---
    /// A histogram of bot API round-trip latencies, from send to correlated response.
    pub static ref BOT_API_RTT_SECONDS: Histogram =
        register_histogram!("nexus_bot_api_rtt_seconds", "Round-trip latency of bot API calls in seconds.").unwrap();
}

/// Resets the connected-peer gauges from the registry's live counts. Every
/// scrape handler must call this first, so a scrape never reports a stale
/// count after a burst of churn.
pub fn refresh_connection_gauges(registry: &ConnectionRegistry) {
    for role in [PeerRole::Bot, PeerRole::Worker, PeerRole::Subscriber] {
        CONNECTED_PEERS
            .with_label_values(&[&role.to_string()])
            .set(registry.len(role) as f64);
    }
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}
