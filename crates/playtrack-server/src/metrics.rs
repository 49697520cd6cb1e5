//! Prometheus metrics recorder and scrape-time gauge refresh.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::server::AppState;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Must be called once at startup before any metrics are recorded.
pub fn install_recorder() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install metrics recorder");
    info!("prometheus metrics recorder installed");
    handle
}

// Gauges refreshed at scrape time. Counters (events, compactions, dropped
// writes) are recorded at their call sites in the engine and feed crates.

/// Currently open playback sessions (gauge).
pub const SESSIONS_OPEN: &str = "playtrack_sessions_open";
/// Total sessions tracked, raw plus compacted (gauge).
pub const SESSIONS_TOTAL: &str = "playtrack_sessions_total";
/// Event feed connected (gauge, 0/1).
pub const FEED_CONNECTED: &str = "playtrack_feed_connected";
/// Unix timestamp of the last feed event (gauge).
pub const FEED_LAST_EVENT_TIMESTAMP: &str = "playtrack_feed_last_event_timestamp_seconds";

/// Refresh scrape-time gauges from the store and feed status.
pub fn refresh_gauges(state: &AppState) {
    if let Ok(open) = state.facade.open_count() {
        metrics::gauge!(SESSIONS_OPEN).set(open as f64);
    }
    if let Ok(total) = state.facade.total_sessions() {
        metrics::gauge!(SESSIONS_TOTAL).set(total as f64);
    }
    let feed = state.feed_status.snapshot();
    metrics::gauge!(FEED_CONNECTED).set(if feed.connected { 1.0 } else { 0.0 });
    metrics::gauge!(FEED_LAST_EVENT_TIMESTAMP).set(
        feed.last_event_at
            .map(|at| at.timestamp() as f64)
            .unwrap_or(0.0),
    );
}
