//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Submissions and drops per target
//! - Deliveries, delivery errors and flush sizes
//! - Connection attempts, state changes and recycles
//! - Shutdown outcome
//! - Sampled counter-table values (stats sampler)
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_delivery_` and follow Prometheus
//! conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! Nothing is recorded unless the host process installs a recorder.
//!
//! # Usage
//!
//! ```rust
//! use replication_delivery::metrics;
//! use std::time::Duration;
//!
//! metrics::record_delivered("mirror-1", 42);
//! metrics::record_flush("mirror-1", 42, 8192, Duration::from_micros(350));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Submission
// =============================================================================

/// Record an accepted submission.
pub fn record_submitted(target: &str) {
    counter!("replication_delivery_submitted_total", "target" => target.to_string()).increment(1);
}

/// Record a rejected submission with the reason (`queue_full` / `closed`).
pub fn record_dropped(target: &str, reason: &'static str) {
    counter!(
        "replication_delivery_dropped_total",
        "target" => target.to_string(),
        "reason" => reason
    )
    .increment(1);
}

/// Queue depth after a submit or drain.
pub fn set_queue_depth(target: &str, depth: usize) {
    gauge!("replication_delivery_queue_depth", "target" => target.to_string()).set(depth as f64);
}

// =============================================================================
// Delivery
// =============================================================================

/// Envelopes written and flushed to a target.
pub fn record_delivered(target: &str, count: usize) {
    counter!("replication_delivery_delivered_total", "target" => target.to_string())
        .increment(count as u64);
}

/// Envelopes discarded by the namespace filter.
pub fn record_filtered(target: &str) {
    counter!("replication_delivery_filtered_total", "target" => target.to_string()).increment(1);
}

/// Envelopes lost after admission, by error kind.
pub fn record_delivery_errors(target: &str, kind: &'static str, count: u64) {
    counter!(
        "replication_delivery_errors_total",
        "target" => target.to_string(),
        "kind" => kind
    )
    .increment(count);
}

/// One flush of the write buffer.
pub fn record_flush(target: &str, envelopes: usize, bytes: usize, duration: Duration) {
    histogram!("replication_delivery_flush_envelopes", "target" => target.to_string())
        .record(envelopes as f64);
    histogram!("replication_delivery_flush_bytes", "target" => target.to_string())
        .record(bytes as f64);
    histogram!("replication_delivery_flush_duration_seconds", "target" => target.to_string())
        .record(duration.as_secs_f64());
}

/// Time an envelope spent queued before it was written.
pub fn record_queue_latency(target: &str, latency_ms: u64) {
    histogram!("replication_delivery_queue_latency_seconds", "target" => target.to_string())
        .record(latency_ms as f64 / 1000.0);
}

// =============================================================================
// Connections
// =============================================================================

/// Record a dial attempt outcome.
pub fn record_connect_attempt(target: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replication_delivery_connect_attempts_total",
        "target" => target.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record a slot state transition.
pub fn record_connection_state(target: &str, slot: usize, state: &'static str) {
    counter!(
        "replication_delivery_connection_transitions_total",
        "target" => target.to_string(),
        "slot" => slot.to_string(),
        "state" => state
    )
    .increment(1);
}

/// Record a completed forced recycle.
pub fn record_recycle(target: &str) {
    counter!("replication_delivery_recycles_total", "target" => target.to_string()).increment(1);
}

/// Record the backoff chosen after a failed dial.
pub fn record_reconnect_backoff(target: &str, delay: Duration) {
    histogram!("replication_delivery_reconnect_backoff_seconds", "target" => target.to_string())
        .record(delay.as_secs_f64());
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Gauge for service state.
pub fn set_service_state(worker: usize, state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "Draining" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("replication_delivery_service_state", "worker" => worker.to_string()).set(value);
}

/// Record how a shutdown ended.
pub fn record_shutdown(worker: usize, drained: u64, discarded: u64, duration: Duration, timed_out: bool) {
    let outcome = if timed_out { "timed_out" } else { "drained" };
    counter!(
        "replication_delivery_shutdowns_total",
        "worker" => worker.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    counter!("replication_delivery_shutdown_drained_total", "worker" => worker.to_string())
        .increment(drained);
    counter!("replication_delivery_shutdown_discarded_total", "worker" => worker.to_string())
        .increment(discarded);
    histogram!("replication_delivery_shutdown_duration_seconds", "worker" => worker.to_string())
        .record(duration.as_secs_f64());
}

// =============================================================================
// Sampled counter table
// =============================================================================

/// Publish one sampled counter-table column for a worker.
pub fn set_sampled_value(worker: usize, column: &str, value: f64) {
    gauge!(
        "replication_delivery_sampled",
        "worker" => worker.to_string(),
        "column" => column.to_string()
    )
    .set(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    // The metrics crate uses global state. Without a recorder installed these
    // calls are no-ops; we only check they accept edge-case inputs.

    #[test]
    fn test_submission_metrics() {
        record_submitted("t0");
        record_dropped("t0", "queue_full");
        record_dropped("", "closed");
        set_queue_depth("t0", 0);
        set_queue_depth("t0", usize::MAX);
    }

    #[test]
    fn test_delivery_metrics() {
        record_delivered("t0", 0);
        record_delivered("t0", 10);
        record_filtered("t0");
        record_delivery_errors("t0", "io", 3);
        record_flush("t0", 10, 4096, Duration::ZERO);
        record_queue_latency("t0", 15);
    }

    #[test]
    fn test_connection_metrics() {
        record_connect_attempt("t0", true);
        record_connect_attempt("t0", false);
        record_connection_state("t0", 3, "connected");
        record_recycle("t0");
        record_reconnect_backoff("t0", Duration::from_millis(100));
    }

    #[test]
    fn test_lifecycle_metrics() {
        set_service_state(0, "Running");
        set_service_state(0, "bogus");
        record_shutdown(1, 10, 2, Duration::from_secs(2), true);
        set_sampled_value(0, "t0_d", 4.0);
    }
}
