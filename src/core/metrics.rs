// src/core/metrics.rs

//! Defines and registers Prometheus metrics for client monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle. All pools and clients in the
//! process share the same registry; pool series are labeled by role and endpoint.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, GaugeVec, Histogram, TextEncoder, register_counter,
    register_counter_vec, register_gauge_vec, register_histogram,
};

lazy_static! {
    // --- Pool Gauges ---
    /// The number of live connections, labeled by pool role and endpoint.
    pub static ref POOL_CONNECTIONS: GaugeVec =
        register_gauge_vec!("spineldb_client_pool_connections", "Number of live pooled connections.", &["role", "endpoint"]).unwrap();
    /// The number of callers waiting for a pooled connection, labeled by pool role, endpoint and waiter kind.
    pub static ref POOL_WAITERS: GaugeVec =
        register_gauge_vec!("spineldb_client_pool_waiters", "Number of callers waiting for a connection.", &["role", "endpoint", "kind"]).unwrap();

    // --- Counters ---
    /// The total number of commands (or pipeline batches) written to a socket.
    pub static ref COMMANDS_SENT_TOTAL: Counter =
        register_counter!("spineldb_client_commands_sent_total", "Total number of commands sent.").unwrap();
    /// The total number of commands that timed out waiting for a reply.
    pub static ref COMMAND_TIMEOUTS_TOTAL: Counter =
        register_counter!("spineldb_client_command_timeouts_total", "Total number of command timeouts.").unwrap();
    /// The total number of failed pool acquisitions, labeled by pool role.
    pub static ref POOL_TIMEOUTS_TOTAL: CounterVec =
        register_counter_vec!("spineldb_client_pool_timeouts_total", "Total number of pool acquisition timeouts.", &["role"]).unwrap();
    /// The total number of connections evicted from a pool.
    pub static ref CONNECTIONS_EVICTED_TOTAL: Counter =
        register_counter!("spineldb_client_connections_evicted_total", "Total number of evicted connections.").unwrap();

    // --- Cache Counters ---
    pub static ref CACHE_HITS_TOTAL: Counter =
        register_counter!("spineldb_client_cache_hits_total", "Total number of local cache hits.").unwrap();
    pub static ref CACHE_MISSES_TOTAL: Counter =
        register_counter!("spineldb_client_cache_misses_total", "Total number of local cache misses.").unwrap();
    /// The total number of cache entries removed because the server invalidated a key.
    pub static ref CACHE_INVALIDATIONS_TOTAL: Counter =
        register_counter!("spineldb_client_cache_invalidations_total", "Total number of invalidated cache entries.").unwrap();

    // --- Pub/Sub ---
    pub static ref PUBSUB_MESSAGES_TOTAL: CounterVec =
        register_counter_vec!("spineldb_client_pubsub_messages_total", "Total number of pub/sub messages dispatched.", &["kind"]).unwrap();
    /// Messages dropped because a subscriber's callbacks fell too far behind.
    pub static ref PUBSUB_DROPPED_TOTAL: Counter =
        register_counter!("spineldb_client_pubsub_dropped_total", "Total number of pub/sub messages dropped on overflow.").unwrap();

    // --- Histograms ---
    /// A histogram of round-trip latencies as observed by the caller.
    pub static ref COMMAND_LATENCY_SECONDS: Histogram =
        register_histogram!("spineldb_client_command_latency_seconds", "Round-trip command latency in seconds.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}
