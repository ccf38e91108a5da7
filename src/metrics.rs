//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Submissions and confirmations
//! - Delivery attempts by outcome
//! - Unconfirmed set size
//! - Event log latency and recovery
//! - Circuit breaker state
//! - Supervisor restarts
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `delivery_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! Installing an exporter is the host process's job; without one these calls
//! are no-ops.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record an accepted submission.
pub fn record_submission(method_key: &str) {
    counter!("delivery_submissions_total", "method_key" => method_key.to_string()).increment(1);
}

/// Record a submission rejected before persistence.
pub fn record_submission_rejected(reason: &str) {
    counter!("delivery_submissions_rejected_total", "reason" => reason.to_string()).increment(1);
}

/// Record a delivery attempt outcome (`succeeded`, `failed`, `rejected`, `timed_out`).
pub fn record_attempt(method_key: &str, outcome: &str) {
    counter!(
        "delivery_attempts_total",
        "method_key" => method_key.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record handler execution latency.
pub fn record_attempt_latency(method_key: &str, duration: Duration) {
    histogram!("delivery_attempt_duration_seconds", "method_key" => method_key.to_string())
        .record(duration.as_secs_f64());
}

/// Record a confirmation (`handler` or `external`).
pub fn record_confirmation(source: &str) {
    counter!("delivery_confirmations_total", "source" => source.to_string()).increment(1);
}

/// Record a call whose method key has no registered handler.
pub fn record_unroutable(method_key: &str) {
    counter!("delivery_unroutable_total", "method_key" => method_key.to_string()).increment(1);
}

/// Record a delivery that crossed the unconfirmed-attempts warning threshold.
pub fn record_unconfirmed_warning(method_key: &str) {
    counter!("delivery_unconfirmed_warnings_total", "method_key" => method_key.to_string())
        .increment(1);
}

/// Gauge for the current unconfirmed set size.
pub fn set_unconfirmed(count: usize) {
    gauge!("delivery_unconfirmed").set(count as f64);
}

/// Gauge for invocations currently running.
pub fn set_in_flight(count: usize) {
    gauge!("delivery_in_flight").set(count as f64);
}

/// Record a redelivery sweep.
pub fn record_sweep(dispatched: usize) {
    counter!("delivery_sweeps_total").increment(1);
    if dispatched > 0 {
        counter!("delivery_redeliveries_total").increment(dispatched as u64);
    }
}

// =============================================================================
// Event Log Metrics
// =============================================================================

/// Record event log append latency.
pub fn record_append(kind: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "delivery_log_appends_total",
        "kind" => kind.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!("delivery_log_append_duration_seconds", "kind" => kind.to_string())
        .record(duration.as_secs_f64());
}

/// Record SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn log_retries_total(operation: &str) {
    counter!("delivery_log_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record a recovery replay.
pub fn record_recovery(events: usize, unconfirmed: usize, duration: Duration) {
    counter!("delivery_recoveries_total").increment(1);
    counter!("delivery_recovered_events_total").increment(events as u64);
    gauge!("delivery_recovered_unconfirmed").set(unconfirmed as f64);
    histogram!("delivery_recovery_duration_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Circuit Breaker Metrics
// =============================================================================

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "delivery_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set circuit breaker state gauge (0=closed, 1=half_open, 2=open).
pub fn set_circuit_state(circuit_name: &str, state: &str) {
    let value = match state {
        "closed" => 0.0,
        "half_open" => 1.0,
        "open" => 2.0,
        _ => -1.0,
    };
    gauge!("delivery_circuit_state", "circuit" => circuit_name.to_string()).set(value);
}

// =============================================================================
// Supervisor Metrics
// =============================================================================

/// Record a coordinator restart.
pub fn record_restart(reason: &str) {
    counter!("delivery_coordinator_restarts_total", "reason" => reason.to_string()).increment(1);
}

/// Gauge for supervisor state.
pub fn set_supervisor_state(state: &str) {
    let value = match state {
        "Starting" => 0.0,
        "Running" => 1.0,
        "Restarting" => 2.0,
        "Stopped" => 3.0,
        "Failed" => 4.0,
        _ => -1.0,
    };
    gauge!("delivery_supervisor_state").set(value);
}
