//! Prometheus Metrics Module
//!
//! Exposes gateway metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Frames**: Frames received and sent by command
//! - **Connections**: Live upstream connections and pool checkouts
//! - **Requests**: Round-trip latency, server errors, correlation misses
//! - **Subscriptions**: Upstream subscriptions, push delivery, callback failures
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::application::ports::Command;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder, once per process.
///
/// # Errors
///
/// Returns [`BuildError`] if another recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
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
        "market_gateway_frames_received_total",
        "Frames received from upstream by command"
    );
    describe_counter!(
        "market_gateway_frames_sent_total",
        "Frames sent to upstream by command"
    );

    describe_gauge!(
        "market_gateway_connections",
        "Upstream connections that completed bootstrap and are still open"
    );
    describe_counter!(
        "market_gateway_pool_checkouts_total",
        "Pool checkout attempts by outcome"
    );

    describe_histogram!(
        "market_gateway_request_seconds",
        "Round-trip latency of correlated requests"
    );
    describe_counter!(
        "market_gateway_server_errors_total",
        "Responses carrying a non-zero error code"
    );
    describe_counter!(
        "market_gateway_correlation_misses_total",
        "Responses whose sequence id had no pending request"
    );
    describe_counter!(
        "market_gateway_protocol_violations_total",
        "Frames that broke the protocol, by kind"
    );
    describe_counter!(
        "market_gateway_transport_errors_total",
        "Transport failures by kind"
    );

    describe_gauge!(
        "market_gateway_upstream_subscriptions",
        "Distinct upstream subscriptions held by the hub"
    );
    describe_counter!(
        "market_gateway_push_rows_total",
        "Push rows routed to local subscriptions"
    );
    describe_counter!(
        "market_gateway_push_rows_dropped_total",
        "Push rows with no matching subscription or descriptor"
    );
    describe_counter!(
        "market_gateway_callback_failures_total",
        "Subscriber callbacks that failed or panicked"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Outcome label for pool checkouts.
#[derive(Debug, Clone, Copy)]
pub enum CheckoutOutcome {
    /// A free connection was handed out.
    Acquired,
    /// Every connection was busy.
    Exhausted,
    /// The pool was not ready yet.
    NotReady,
}

impl CheckoutOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Acquired => "acquired",
            Self::Exhausted => "exhausted",
            Self::NotReady => "not_ready",
        }
    }
}

/// Record a frame received from upstream.
pub fn record_frame_received(command: Command) {
    counter!(
        "market_gateway_frames_received_total",
        "command" => command.as_str()
    )
    .increment(1);
}

/// Record a frame sent to upstream.
pub fn record_frame_sent(command: Command) {
    counter!(
        "market_gateway_frames_sent_total",
        "command" => command.as_str()
    )
    .increment(1);
}

/// Update the live connection count.
pub fn set_connections(count: f64) {
    gauge!("market_gateway_connections").set(count);
}

/// Record a pool checkout attempt.
pub fn record_checkout(outcome: CheckoutOutcome) {
    counter!(
        "market_gateway_pool_checkouts_total",
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Record a completed request round trip.
pub fn record_request_duration(kind: &'static str, duration: Duration) {
    histogram!(
        "market_gateway_request_seconds",
        "kind" => kind
    )
    .record(duration.as_secs_f64());
}

/// Record a response with a non-zero error code.
pub fn record_server_error(command: Command, code: i32) {
    counter!(
        "market_gateway_server_errors_total",
        "command" => command.as_str(),
        "code" => code.to_string()
    )
    .increment(1);
}

/// Record a response that matched no pending request.
pub fn record_correlation_miss(command: Command) {
    counter!(
        "market_gateway_correlation_misses_total",
        "command" => command.as_str()
    )
    .increment(1);
}

/// Record a protocol violation.
pub fn record_protocol_violation(kind: &'static str) {
    counter!(
        "market_gateway_protocol_violations_total",
        "kind" => kind
    )
    .increment(1);
}

/// Record a transport failure.
pub fn record_transport_error(kind: &'static str) {
    counter!(
        "market_gateway_transport_errors_total",
        "kind" => kind
    )
    .increment(1);
}

/// Update the upstream subscription count.
pub fn set_upstream_subscriptions(count: f64) {
    gauge!("market_gateway_upstream_subscriptions").set(count);
}

/// Record push rows delivered to subscriptions.
pub fn record_push_rows(count: u64) {
    counter!("market_gateway_push_rows_total").increment(count);
}

/// Record push rows that could not be routed.
pub fn record_push_rows_dropped(reason: &'static str, count: u64) {
    counter!(
        "market_gateway_push_rows_dropped_total",
        "reason" => reason
    )
    .increment(count);
}

/// Record failed subscriber callbacks.
pub fn record_callback_failures(count: u64) {
    counter!("market_gateway_callback_failures_total").increment(count);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_outcome_as_str() {
        assert_eq!(CheckoutOutcome::Acquired.as_str(), "acquired");
        assert_eq!(CheckoutOutcome::Exhausted.as_str(), "exhausted");
        assert_eq!(CheckoutOutcome::NotReady.as_str(), "not_ready");
    }

    #[test]
    fn recording_without_recorder_is_a_no_op() {
        record_frame_received(Command::PushData);
        record_checkout(CheckoutOutcome::Exhausted);
        record_request_duration("fetch", Duration::from_millis(3));
    }
}
