// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience utilities: restart backoff and bulkheads.
//!
//! - [`RetryConfig`]: exponential backoff with random jitter, used by the
//!   [`Supervisor`](crate::supervisor::Supervisor) between coordinator restarts
//! - [`Bulkhead`]: semaphore limiting concurrent handler invocations
//!
//! # Example
//!
//! ```rust
//! use reliable_delivery::resilience::{Bulkhead, RetryConfig};
//!
//! let retry = RetryConfig::supervisor();
//! assert!(retry.jittered_delay_for_attempt(3) >= retry.delay_for_attempt(3));
//!
//! let bulkhead = Bulkhead::new(1);
//! let permit = bulkhead.try_acquire();
//! assert!(permit.is_some() && bulkhead.is_full());
//! drop(permit);
//! assert_eq!(bulkhead.available(), 1);
//! ```

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Configuration for restart/retry backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    /// Set to `usize::MAX` for infinite retries.
    pub max_attempts: usize,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,

    /// Random extra delay as a fraction of the computed delay.
    /// `0.2` adds between 0% and 20%.
    pub random_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::supervisor()
    }
}

impl RetryConfig {
    /// Restart schedule for the delivery coordinator.
    ///
    /// # Backoff Schedule (before jitter)
    ///
    /// ```text
    /// Restart  Delay
    /// -------  -----
    /// 1        3s
    /// 2        6s
    /// 3        12s
    /// 4        24s
    /// 5+       30s (cap)
    /// ```
    pub fn supervisor() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            random_factor: 0.2,
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            random_factor: 0.0,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed), without jitter.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }

    /// Calculate delay for an attempt with random jitter applied.
    ///
    /// The result lies in `[delay, delay * (1 + random_factor)]`, where
    /// `delay` is [`delay_for_attempt`](Self::delay_for_attempt). Jitter may
    /// push the delay past `max_delay` by at most `random_factor`.
    pub fn jittered_delay_for_attempt(&self, attempt: usize) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        let factor = self.random_factor.clamp(0.0, 1.0);
        if factor == 0.0 {
            return delay;
        }

        let jitter = rand::thread_rng().gen_range(0.0..=factor);
        delay.mul_f64(1.0 + jitter)
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows(&self, attempts: usize) -> bool {
        attempts < self.max_attempts
    }
}

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

/// Bulkhead pattern: limits concurrent operations to prevent resource exhaustion.
///
/// The coordinator dispatches handler invocations fire-and-forget; the
/// bulkhead bounds how many of them run at once. A call that finds the
/// bulkhead full stays pending and is picked up by a later sweep.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    /// Create a new bulkhead with the given concurrency limit.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Take a slot without waiting; the slot is released when the permit
    /// drops. Returns `None` if the bulkhead is full.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    /// Get the number of available permits.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Get the maximum concurrent operations allowed.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Check if the bulkhead is full (no permits available).
    pub fn is_full(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}
