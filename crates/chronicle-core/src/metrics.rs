//! Prometheus metrics helpers for the Chronicle system.
//!
//! This module provides centralized metrics initialization and common metric
//! definitions used across Chronicle components.
//!
//! # Usage
//!
//! ```rust,ignore
//! use chronicle_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     // Initialize the Prometheus recorder
//!     let handle = init_metrics();
//!
//!     // Start the HTTP server for /metrics endpoint
//!     start_metrics_server(9091, handle).await.unwrap();
//!
//!     // Now use metrics anywhere in your code
//!     use metrics::{counter, gauge};
//!     counter!("my_counter").increment(1);
//!     gauge!("my_gauge").set(42.0);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! All Chronicle metrics follow these conventions:
//! - Prefix: Component name (e.g., `buffer_`, `flush_`, `store_`)
//! - Suffix: Unit or type (e.g., `_total`, `_seconds`)
//! - Labels: Use sparingly to avoid cardinality explosion

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// This must be called once at startup before any metrics are recorded.
/// Returns a handle that can be used with [`start_metrics_server`].
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    // Register all metric descriptions upfront
    register_common_metrics();

    handle
}

/// Try to initialize the Prometheus metrics recorder.
///
/// Like [`init_metrics`] but returns `None` if the recorder is already installed,
/// instead of panicking. Useful for tests or optional metrics.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().ok()
}

/// Start the Prometheus metrics HTTP server.
///
/// Serves the `/metrics` endpoint on the specified port.
/// This spawns a background task and returns immediately.
///
/// # Arguments
///
/// * `port` - TCP port to listen on (e.g., 9091)
/// * `handle` - Prometheus handle from [`init_metrics`]
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    // Spawn the server in the background
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        axum::serve(listener, app).await.unwrap();
    });

    Ok(())
}

/// Register descriptions for common metrics used across Chronicle.
///
/// Called automatically by [`init_metrics`].
fn register_common_metrics() {
    // =========================================================================
    // Event Buffer Metrics
    // =========================================================================

    describe_counter!(
        "buffer_events_total",
        "Total events accepted into the buffer (label: kind)"
    );
    describe_counter!(
        "buffer_events_invalid_total",
        "Events rejected by validation before buffering"
    );
    describe_counter!(
        "buffer_events_rate_limited_total",
        "Events dropped by the per-action rate limiter (label: action)"
    );
    describe_gauge!(
        "buffer_depth",
        "Records currently waiting in the buffer (label: kind)"
    );
    describe_gauge!(
        "buffer_journal_depth",
        "Unacknowledged records in the durable journal"
    );

    // =========================================================================
    // Flush Metrics
    // =========================================================================

    describe_counter!(
        "flush_batches_total",
        "Batches flushed to the persistent store"
    );
    describe_counter!(
        "flush_records_inserted_total",
        "Records successfully inserted by flushes (label: kind)"
    );
    describe_counter!(
        "flush_records_duplicate_total",
        "Records skipped as duplicates during flushes (label: kind)"
    );
    describe_counter!(
        "flush_records_failed_total",
        "Records that failed to apply during flushes (label: kind)"
    );
    describe_counter!(
        "flush_direct_writes_total",
        "Records written directly, bypassing the buffer"
    );
    describe_histogram!(
        "flush_duration_seconds",
        "Time spent applying a flush batch"
    );

    // =========================================================================
    // Store / Connection Metrics
    // =========================================================================

    describe_gauge!(
        "store_connected",
        "Whether the persistent store is reachable (1=yes, 0=no)"
    );
    describe_gauge!(
        "journal_connected",
        "Whether the durable journal is healthy (1=yes, 0=no)"
    );
    describe_counter!(
        "store_reconnect_attempts_total",
        "Persistent store reconnection attempts"
    );
    describe_counter!("store_insert_errors_total", "Persistent store insert errors");
    describe_histogram!(
        "store_health_check_duration_seconds",
        "Time spent on store health probes"
    );

    // =========================================================================
    // Voice Tracking Metrics
    // =========================================================================

    describe_gauge!(
        "voice_active_sessions",
        "Voice sessions currently being tracked"
    );
    describe_counter!(
        "voice_sessions_closed_total",
        "Voice sessions closed (label: reason)"
    );
    describe_counter!(
        "voice_samples_total",
        "Periodic samples emitted for active voice sessions"
    );

    // =========================================================================
    // Query API Metrics
    // =========================================================================

    describe_counter!("api_requests_total", "Query API requests (label: route)");
    describe_counter!(
        "api_requests_excluded_total",
        "Query API requests short-circuited by exclusion filters"
    );
    describe_counter!("api_cache_hits_total", "Query cache hits");
    describe_counter!("api_cache_misses_total", "Query cache misses");
    describe_histogram!(
        "api_query_duration_seconds",
        "Time spent executing ranking queries"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    // Ensure metrics are initialized exactly once for all tests
    static INIT: Once = Once::new();

    fn ensure_metrics_init() {
        INIT.call_once(|| {
            let _ = try_init_metrics();
        });
    }

    #[test]
    fn test_try_init_metrics_idempotent() {
        // First call may or may not succeed (depends on test order)
        let handle1 = try_init_metrics();

        // Second call should definitely return None (already installed)
        let handle2 = try_init_metrics();

        // At most one should succeed
        assert!(handle1.is_none() || handle2.is_none());
    }

    #[test]
    fn test_register_common_metrics_does_not_panic() {
        ensure_metrics_init();
        // This should be idempotent and not panic
        register_common_metrics();
        register_common_metrics();
    }
}
