// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker protecting downstream method handlers.
//!
//! Stops hammering a handler that keeps failing, and periodically lets a
//! single trial call through to see whether it recovered.
//!
//! # States
//!
//! - **Closed**: Normal operation, calls pass through. Consecutive failures
//!   are counted; a success resets the count.
//! - **Open**: Reached `max_failures`. Calls are rejected without running
//!   until `reset_timeout` has passed.
//! - **HalfOpen**: Exactly one trial call runs; everything else is rejected
//!   while it is in flight. Success closes the circuit, failure re-opens it.
//!
//! ```text
//!            max_failures consecutive failures
//!   Closed ─────────────────────────────────────▶ Open
//!     ▲                                            │
//!     │ trial succeeds          reset_timeout      │
//!     │                         elapsed            ▼
//!     └──────────────────────────────────────── HalfOpen
//!                     trial fails: back to Open
//! ```
//!
//! Every call is bounded by `call_timeout`; a call that exceeds it counts as
//! a failure.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use reliable_delivery::circuit_breaker::{CircuitBreaker, CircuitError};
//! # use reliable_delivery::DeliveryConfig;
//! # async fn example() {
//! let config = DeliveryConfig::default();
//! let circuit = CircuitBreaker::new(config.circuit.to_circuit_config("payments"));
//!
//! match circuit.call(|| async { Ok::<(), String>(()) }).await {
//!     Ok(()) => { /* success */ }
//!     Err(CircuitError::Rejected) => { /* circuit open, try later */ }
//!     Err(CircuitError::Timeout(_)) => { /* handler hung */ }
//!     Err(CircuitError::Inner(e)) => { /* handler error */ }
//! }
//! # }
//! ```

use crate::metrics;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state for metrics/monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed = 0,
    /// Testing if the handler recovered
    HalfOpen = 1,
    /// Handler unhealthy, fail-fast
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open).
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The operation did not finish within the call timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The underlying operation failed.
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Label used in logs and metrics.
    pub name: String,
    /// Number of consecutive failures to trip the circuit.
    pub max_failures: u32,
    /// Upper bound on a single call.
    pub call_timeout: Duration,
    /// How long to stay open before allowing a trial call.
    pub reset_timeout: Duration,
}

impl CircuitConfig {
    /// Fast recovery for testing.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            name: "test".to_string(),
            max_failures: 2,
            call_timeout: Duration::from_millis(200),
            reset_timeout: Duration::from_millis(50),
        }
    }
}

/// Point-in-time view of a breaker, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub calls_total: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
    pub timeouts: u64,
}

#[derive(Debug)]
struct Core {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermitKind {
    /// Issued while closed.
    Normal,
    /// The single half-open trial call.
    Trial,
}

/// Admission ticket for one call. Dropping a trial permit without an outcome
/// (cancelled future, panic) frees the trial slot.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    kind: PermitKind,
    resolved: bool,
}

impl Permit<'_> {
    fn succeed(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.kind);
    }

    fn fail(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.kind);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.kind == PermitKind::Trial {
            self.breaker.core.lock().trial_in_flight = false;
            debug!(circuit = %self.breaker.config.name, "Trial call abandoned");
        }
    }
}

/// A named circuit breaker with metrics tracking.
pub struct CircuitBreaker {
    config: CircuitConfig,
    core: Mutex<Core>,

    // Metrics
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
    timeouts: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new, closed circuit breaker.
    pub fn new(config: CircuitConfig) -> Self {
        metrics::set_circuit_state(&config.name, "closed");
        Self {
            config,
            core: Mutex::new(Core {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    /// Execute an async operation through the circuit breaker.
    ///
    /// Takes a closure that returns a Future, so a rejected call never
    /// constructs the operation.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        let Some(permit) = self.try_acquire() else {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            metrics::record_circuit_call(&self.config.name, "rejected");
            debug!(circuit = %self.config.name, "Circuit breaker rejected call");
            return Err(CircuitError::Rejected);
        };

        match tokio::time::timeout(self.config.call_timeout, f()).await {
            Ok(Ok(value)) => {
                permit.succeed();
                self.successes.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(&self.config.name, "success");
                Ok(value)
            }
            Ok(Err(e)) => {
                permit.fail();
                self.failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(&self.config.name, "failure");
                Err(CircuitError::Inner(e))
            }
            Err(_) => {
                permit.fail();
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(&self.config.name, "timeout");
                warn!(
                    circuit = %self.config.name,
                    timeout_ms = self.config.call_timeout.as_millis() as u64,
                    "Circuit call timed out"
                );
                Err(CircuitError::Timeout(self.config.call_timeout))
            }
        }
    }

    fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut core = self.core.lock();
        self.maybe_half_open(&mut core);

        let kind = match core.state {
            CircuitState::Closed => PermitKind::Normal,
            CircuitState::Open => return None,
            CircuitState::HalfOpen if core.trial_in_flight => return None,
            CircuitState::HalfOpen => {
                core.trial_in_flight = true;
                debug!(circuit = %self.config.name, "Admitting trial call");
                PermitKind::Trial
            }
        };

        Some(Permit {
            breaker: self,
            kind,
            resolved: false,
        })
    }

    /// Move Open to HalfOpen once the reset timeout has passed.
    fn maybe_half_open(&self, core: &mut Core) {
        if core.state != CircuitState::Open {
            return;
        }
        let expired = core
            .opened_at
            .map_or(true, |at| at.elapsed() >= self.config.reset_timeout);
        if expired {
            core.state = CircuitState::HalfOpen;
            core.trial_in_flight = false;
            info!(circuit = %self.config.name, "Circuit breaker half-open");
            metrics::set_circuit_state(&self.config.name, "half_open");
        }
    }

    fn on_success(&self, kind: PermitKind) {
        let mut core = self.core.lock();
        match (kind, core.state) {
            (PermitKind::Trial, _) => {
                core.state = CircuitState::Closed;
                core.consecutive_failures = 0;
                core.opened_at = None;
                core.trial_in_flight = false;
                info!(circuit = %self.config.name, "Circuit breaker closed");
                metrics::set_circuit_state(&self.config.name, "closed");
            }
            (PermitKind::Normal, CircuitState::Closed) => {
                core.consecutive_failures = 0;
            }
            // A call admitted before the circuit opened; only the trial decides.
            (PermitKind::Normal, _) => {}
        }
    }

    fn on_failure(&self, kind: PermitKind) {
        let mut core = self.core.lock();
        match (kind, core.state) {
            (PermitKind::Trial, _) => {
                self.trip(&mut core);
                warn!(circuit = %self.config.name, "Trial call failed, circuit re-opened");
            }
            (PermitKind::Normal, CircuitState::Closed) => {
                core.consecutive_failures += 1;
                if core.consecutive_failures >= self.config.max_failures {
                    self.trip(&mut core);
                    warn!(
                        circuit = %self.config.name,
                        failures = core.consecutive_failures,
                        reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                        "Circuit breaker opened"
                    );
                }
            }
            (PermitKind::Normal, _) => {}
        }
    }

    fn trip(&self, core: &mut Core) {
        core.state = CircuitState::Open;
        core.opened_at = Some(Instant::now());
        core.trial_in_flight = false;
        metrics::set_circuit_state(&self.config.name, "open");
    }

    /// Current state. An open circuit whose reset timeout has passed reports
    /// `HalfOpen`.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let mut core = self.core.lock();
        self.maybe_half_open(&mut core);
        core.state
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.core.lock().consecutive_failures
    }

    /// Get total number of calls.
    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    /// Get number of successful calls.
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Get number of failed calls (errors and timeouts).
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Get number of rejected calls (circuit open).
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Get number of timed out calls.
    #[must_use]
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn stats(&self) -> CircuitStats {
        let (state, consecutive_failures) = {
            let mut core = self.core.lock();
            self.maybe_half_open(&mut core);
            (core.state, core.consecutive_failures)
        };
        CircuitStats {
            state,
            consecutive_failures,
            calls_total: self.calls_total(),
            successes: self.successes(),
            failures: self.failures(),
            rejections: self.rejections(),
            timeouts: self.timeouts(),
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.config.name)
            .field("state", &self.core.lock().state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    async fn fail(cb: &CircuitBreaker) -> Result<i32, CircuitError<&'static str>> {
        cb.call(|| async { Err("boom") }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<i32, CircuitError<&'static str>> {
        cb.call(|| async { Ok(1) }).await
    }

    #[tokio::test]
    async fn test_circuit_passes_successful_calls() {
        let cb = CircuitBreaker::new(CircuitConfig::for_testing());

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.successes(), 1);
        assert_eq!(cb.failures(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_circuit_tracks_failures() {
        let cb = CircuitBreaker::new(CircuitConfig::for_testing());

        let result = fail(&cb).await;

        assert!(matches!(result, Err(CircuitError::Inner("boom"))));
        assert_eq!(cb.failures(), 1);
        assert_eq!(cb.consecutive_failures(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let cb = CircuitBreaker::new(CircuitConfig {
            max_failures: 3,
            ..CircuitConfig::for_testing()
        });

        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        let _ = succeed(&cb).await;
        let _ = fail(&cb).await;

        assert_eq!(cb.consecutive_failures(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_rejects_without_invoking() {
        let cb = CircuitBreaker::new(CircuitConfig {
            max_failures: 2,
            reset_timeout: Duration::from_secs(60),
            ..CircuitConfig::for_testing()
        });

        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        let invoked = Arc::new(AtomicUsize::new(0));
        let counter = invoked.clone();
        let result: Result<(), CircuitError<&str>> = cb
            .call(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(CircuitError::Rejected)));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(cb.rejections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_reset_timeout() {
        let cb = CircuitBreaker::new(CircuitConfig::for_testing());

        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let _ = succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_exactly_one_trial() {
        let cb = Arc::new(CircuitBreaker::new(CircuitConfig {
            call_timeout: Duration::from_secs(5),
            ..CircuitConfig::for_testing()
        }));

        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_millis(60)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let cb = cb.clone();
            tokio::spawn(async move {
                cb.call(|| async move {
                    let _ = release_rx.await;
                    Ok::<_, &str>(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        // Trial in flight: everyone else is rejected.
        assert!(matches!(succeed(&cb).await, Err(CircuitError::Rejected)));
        assert!(matches!(succeed(&cb).await, Err(CircuitError::Rejected)));

        release_tx.send(()).unwrap();
        assert!(trial.await.unwrap().is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(succeed(&cb).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let cb = CircuitBreaker::new(CircuitConfig::for_testing());

        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_millis(60)).await;

        let result = fail(&cb).await;
        assert!(matches!(result, Err(CircuitError::Inner("boom"))));
        assert_eq!(cb.state(), CircuitState::Open);

        // Timer restarted from the failed trial.
        tokio::time::advance(Duration::from_millis(30)).await;
        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_millis(30)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_counts_as_failure() {
        let cb = CircuitBreaker::new(CircuitConfig {
            max_failures: 1,
            call_timeout: Duration::from_millis(100),
            reset_timeout: Duration::from_secs(60),
            ..CircuitConfig::for_testing()
        });

        let result: Result<(), CircuitError<&str>> = cb
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(CircuitError::Timeout(d)) if d == Duration::from_millis(100)));
        assert_eq!(cb.timeouts(), 1);
        assert_eq!(cb.failures(), 1);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_frees_slot() {
        let cb = Arc::new(CircuitBreaker::new(CircuitConfig {
            call_timeout: Duration::from_secs(60),
            ..CircuitConfig::for_testing()
        }));

        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_millis(60)).await;

        let trial = {
            let cb = cb.clone();
            tokio::spawn(async move {
                cb.call(|| futures::future::pending::<Result<(), &str>>())
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(matches!(succeed(&cb).await, Err(CircuitError::Rejected)));

        trial.abort();
        let _ = trial.await;

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(succeed(&cb).await.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_circuit_metrics_accumulate() {
        let cb = CircuitBreaker::new(CircuitConfig {
            max_failures: 100,
            ..CircuitConfig::for_testing()
        });

        let _ = succeed(&cb).await;
        let _ = fail(&cb).await;
        let _ = succeed(&cb).await;

        let stats = cb.stats();
        assert_eq!(stats.calls_total, 3);
        assert_eq!(stats.successes, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.rejections, 0);
        assert_eq!(stats.state, CircuitState::Closed);
    }

    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
        assert_eq!(CircuitState::Open.to_string(), "open");
    }

    #[test]
    fn test_circuit_error_display() {
        let rejected: CircuitError<&str> = CircuitError::Rejected;
        assert_eq!(rejected.to_string(), "circuit breaker open, request rejected");

        let timeout: CircuitError<&str> = CircuitError::Timeout(Duration::from_secs(1));
        assert!(timeout.to_string().contains("1s"));

        let inner: CircuitError<&str> = CircuitError::Inner("boom");
        assert_eq!(inner.to_string(), "operation failed: boom");
    }
}
