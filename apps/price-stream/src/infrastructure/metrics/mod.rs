//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Polling**: Upstream fetches, failures and latency per instrument
//! - **Delivery**: Observations delivered to clients by phase
//! - **Subscriptions**: Active subscriptions and pollers
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Returns `None` if a recorder is already installed by someone else.
pub fn init_metrics() -> Option<PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Some(handle.clone());
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            register_metrics();
            Some(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
        }
        Err(e) => {
            tracing::warn!(error = %e, "Prometheus recorder not installed");
            None
        }
    }
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "price_stream_fetches_total",
        "Successful upstream price fetches"
    );
    describe_counter!(
        "price_stream_fetch_failures_total",
        "Failed upstream price fetches by error kind"
    );
    describe_histogram!(
        "price_stream_fetch_seconds",
        "Upstream price fetch latency"
    );
    describe_counter!(
        "price_stream_observations_delivered_total",
        "Observations delivered to subscribers by phase"
    );
    describe_counter!(
        "price_stream_replay_skipped_total",
        "Indexed history entries skipped because their value could not be resolved"
    );
    describe_counter!(
        "price_stream_duplicates_dropped_total",
        "Live observations dropped because replay already delivered them"
    );
    describe_gauge!(
        "price_stream_active_subscriptions",
        "Number of open client subscriptions"
    );
    describe_gauge!(
        "price_stream_active_pollers",
        "Number of running instrument pollers"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Delivery phase label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPhase {
    /// Cached history.
    Replay,
    /// Fanout consumer.
    Live,
}

impl DeliveryPhase {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Replay => "replay",
            Self::Live => "live",
        }
    }
}

/// Record a successful upstream fetch and its latency.
pub fn record_fetch(instrument: &str, duration: Duration) {
    counter!("price_stream_fetches_total", "instrument" => instrument.to_string()).increment(1);
    histogram!("price_stream_fetch_seconds", "instrument" => instrument.to_string())
        .record(duration.as_secs_f64());
}

/// Record a failed upstream fetch.
pub fn record_fetch_failure(instrument: &str, kind: &'static str) {
    counter!(
        "price_stream_fetch_failures_total",
        "instrument" => instrument.to_string(),
        "kind" => kind
    )
    .increment(1);
}

/// Record an observation handed to a subscriber.
pub fn record_delivered(phase: DeliveryPhase) {
    counter!(
        "price_stream_observations_delivered_total",
        "phase" => phase.as_str()
    )
    .increment(1);
}

/// Record history entries skipped during replay.
pub fn record_replay_skipped(count: u64) {
    counter!("price_stream_replay_skipped_total").increment(count);
}

/// Record a live duplicate dropped at the replay boundary.
pub fn record_duplicate_dropped() {
    counter!("price_stream_duplicates_dropped_total").increment(1);
}

/// Update the active subscription gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_subscriptions(count: usize) {
    gauge!("price_stream_active_subscriptions").set(count as f64);
}

/// Update the active poller gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_pollers(count: usize) {
    gauge!("price_stream_active_pollers").set(count as f64);
}

// =============================================================================
// Tests
// =============================================================================
