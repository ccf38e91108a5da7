// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the delivery engine.
//!
//! Errors are split by who has to deal with them: the redelivery sweep
//! (transient), an operator (permanent per-call), or the supervisor (fatal to
//! the coordinator instance).
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Fatal | Description |
//! |------------|-----------|-------|-------------|
//! | `Handler` | Yes | No | Handler returned failure or panicked |
//! | `HandlerNotFound` | No | No | Unroutable method key |
//! | `CircuitOpen` | Yes | No | Breaker rejected the call |
//! | `Timeout` | Yes | No | Handler exceeded the call timeout |
//! | `Backpressure` | Yes | No | Unconfirmed set at capacity |
//! | `CoordinatorUnavailable` | Yes | No | Coordinator crashed or restarting |
//! | `EventLog` | No | Yes | SQLite failure in the event log |
//! | `Persistence` | No | Yes | Any other append/replay failure |
//! | `Codec` | No | Yes | Corrupt record in the event log |
//! | `Config` | No | Yes | Configuration invalid |
//! | `Shutdown` | No | No | Engine is shutting down |
//! | `RestartsExhausted` | No | Yes | Supervisor gave up restarting |
//!
//! # Retry Behavior
//!
//! Use [`DeliveryError::is_retryable()`] to decide whether a caller should
//! resubmit after backoff and [`DeliveryError::is_fatal()`] to decide whether
//! a coordinator instance must stop.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors that can occur while accepting, delivering or recovering calls.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// The downstream handler reported failure (or panicked).
    ///
    /// Retried by the redelivery sweep.
    #[error("Handler error ({method_key}): {message}")]
    Handler { method_key: String, message: String },

    /// No handler is registered for the method key.
    ///
    /// Permanent for the lifetime of the registry. The call stays in the
    /// unconfirmed set and is reported as unroutable.
    #[error("No handler registered for method key: {0}")]
    HandlerNotFound(String),

    /// The circuit breaker is open and rejected the call without running it.
    #[error("Circuit breaker open, call rejected")]
    CircuitOpen,

    /// The handler did not complete within the call timeout.
    #[error("Handler timed out after {0:?}")]
    Timeout(Duration),

    /// SQLite error in the event log.
    ///
    /// Fatal to the coordinator instance: without durable writes the
    /// at-least-once guarantee cannot be kept.
    #[error("Event log error: {0}")]
    EventLog(#[from] sqlx::Error),

    /// Append or replay failure not originating from SQLite.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A record in the event log could not be decoded.
    #[error("Corrupt event log record: {0}")]
    Codec(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The unconfirmed set is full; nothing was persisted.
    #[error("Too many unconfirmed deliveries (limit {limit})")]
    Backpressure { limit: usize },

    /// The coordinator stopped before answering.
    ///
    /// The request may or may not have been persisted. Resubmitting is safe
    /// because handlers are idempotent.
    #[error("Delivery coordinator unavailable")]
    CoordinatorUnavailable,

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// The supervisor exceeded its restart budget.
    #[error("Coordinator failed after {restarts} restarts: {last_error}")]
    RestartsExhausted { restarts: u32, last_error: String },
}

impl DeliveryError {
    /// Create a handler error.
    pub fn handler(method_key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            method_key: method_key.into(),
            message: message.into(),
        }
    }

    /// Check if the operation may succeed when tried again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Handler { .. } => true,
            Self::CircuitOpen => true,
            Self::Timeout(_) => true,
            Self::Backpressure { .. } => true,
            Self::CoordinatorUnavailable => true,
            Self::HandlerNotFound(_) => false, // registry is fixed at startup
            Self::EventLog(_) => false,
            Self::Persistence(_) => false,
            Self::Codec(_) => false,
            Self::Config(_) => false,
            Self::Shutdown => false,
            Self::RestartsExhausted { .. } => false,
        }
    }

    /// Check if this error must stop the coordinator instance.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::EventLog(_)
                | Self::Persistence(_)
                | Self::Codec(_)
                | Self::Config(_)
                | Self::RestartsExhausted { .. }
        )
    }
}
