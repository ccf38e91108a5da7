//! Configuration for the delivery engine.
//!
//! This module defines all configuration types needed to run the delivery
//! engine. Configuration is passed to
//! [`Supervisor::start()`](crate::supervisor::Supervisor::start) and can be
//! constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use reliable_delivery::config::DeliveryConfig;
//!
//! let config = DeliveryConfig {
//!     stream_id: "employee-writes".into(),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! DeliveryConfig
//! ├── stream_id: String               # Fixed persistence stream id
//! ├── redelivery: RedeliveryConfig    # Sweep cadence and limits
//! ├── circuit: CircuitBreakerConfig   # Handler failure isolation
//! ├── supervisor: SupervisorConfig    # Restart backoff
//! └── log: EventLogConfig             # SQLite event log
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! stream_id: "reliable-delivery"
//!
//! redelivery:
//!   redeliver_interval: "5s"
//!   warn_after_attempts: 5
//!
//! circuit:
//!   max_failures: 5
//!   call_timeout: "10s"
//!   reset_timeout: "30s"
//!
//! supervisor:
//!   min_backoff: "3s"
//!   max_backoff: "30s"
//!   random_factor: 0.2
//!
//! log:
//!   sqlite_path: "/var/lib/app/delivery.db"
//! ```

use crate::circuit_breaker::CircuitConfig;
use crate::error::{DeliveryError, Result};
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Stream id used when none is configured.
pub const DEFAULT_STREAM_ID: &str = "reliable-delivery";

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| DeliveryError::Config(format!("{field}: invalid duration {value:?}: {e}")))
}

fn require_nonzero(field: &str, value: &str) -> Result<Duration> {
    let duration = parse_duration(field, value)?;
    if duration.is_zero() {
        return Err(DeliveryError::Config(format!("{field} must be greater than zero")));
    }
    Ok(duration)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `Supervisor::start()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Persistence stream id. All events of this engine are stored and
    /// replayed under this id; changing it orphans the existing log.
    #[serde(default = "default_stream_id")]
    pub stream_id: String,

    #[serde(default)]
    pub redelivery: RedeliveryConfig,

    #[serde(default)]
    pub circuit: CircuitBreakerConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub log: EventLogConfig,
}

fn default_stream_id() -> String {
    DEFAULT_STREAM_ID.to_string()
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            stream_id: default_stream_id(),
            redelivery: RedeliveryConfig::default(),
            circuit: CircuitBreakerConfig::default(),
            supervisor: SupervisorConfig::default(),
            log: EventLogConfig::default(),
        }
    }
}

impl DeliveryConfig {
    /// Create a fast config for testing: short intervals, in-memory SQLite.
    pub fn for_testing(stream_id: &str) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            redelivery: RedeliveryConfig::for_testing(),
            circuit: CircuitBreakerConfig::for_testing(),
            supervisor: SupervisorConfig::for_testing(),
            log: EventLogConfig::in_memory(),
        }
    }

    /// Check the whole tree for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.stream_id.trim().is_empty() {
            return Err(DeliveryError::Config("stream_id must not be empty".into()));
        }
        self.redelivery.validate()?;
        self.circuit.validate()?;
        self.supervisor.validate()?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RedeliveryConfig: sweep cadence and limits
// ═══════════════════════════════════════════════════════════════════════════════

/// Redelivery sweep configuration.
///
/// An unconfirmed entry becomes due again once `redeliver_interval` has passed
/// since its last attempt. The sweep ticks at half that interval so an entry
/// never waits much more than one interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedeliveryConfig {
    /// Minimum time between two attempts for the same delivery.
    /// Format: humantime duration (e.g., "5s", "500ms").
    #[serde(default = "default_redeliver_interval")]
    pub redeliver_interval: String,

    /// Log a warning once a delivery has been attempted this many times
    /// without confirmation.
    #[serde(default = "default_warn_after_attempts")]
    pub warn_after_attempts: u32,

    /// Submissions are rejected once this many deliveries are unconfirmed.
    #[serde(default = "default_max_unconfirmed")]
    pub max_unconfirmed: usize,

    /// Maximum deliveries dispatched per sweep tick (oldest first).
    #[serde(default = "default_redelivery_burst_limit")]
    pub redelivery_burst_limit: usize,

    /// Maximum handler invocations running at the same time.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_redeliver_interval() -> String {
    "5s".to_string()
}

fn default_warn_after_attempts() -> u32 {
    5
}

fn default_max_unconfirmed() -> usize {
    100_000
}

fn default_redelivery_burst_limit() -> usize {
    10_000
}

fn default_max_in_flight() -> usize {
    256
}

impl Default for RedeliveryConfig {
    fn default() -> Self {
        Self {
            redeliver_interval: default_redeliver_interval(),
            warn_after_attempts: default_warn_after_attempts(),
            max_unconfirmed: default_max_unconfirmed(),
            redelivery_burst_limit: default_redelivery_burst_limit(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl RedeliveryConfig {
    pub fn for_testing() -> Self {
        Self {
            redeliver_interval: "50ms".to_string(),
            warn_after_attempts: 3,
            max_unconfirmed: 1_000,
            redelivery_burst_limit: 1_000,
            max_in_flight: 32,
        }
    }

    /// Parse `redeliver_interval`, falling back to 5s if unparseable.
    pub fn redeliver_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.redeliver_interval).unwrap_or(Duration::from_secs(5))
    }

    /// Period of the sweep timer.
    pub fn sweep_tick(&self) -> Duration {
        let tick = self.redeliver_interval_duration() / 2;
        tick.max(Duration::from_millis(1))
    }

    fn validate(&self) -> Result<()> {
        require_nonzero("redelivery.redeliver_interval", &self.redeliver_interval)?;
        if self.warn_after_attempts == 0 {
            return Err(DeliveryError::Config(
                "redelivery.warn_after_attempts must be greater than zero".into(),
            ));
        }
        if self.max_unconfirmed == 0 {
            return Err(DeliveryError::Config(
                "redelivery.max_unconfirmed must be greater than zero".into(),
            ));
        }
        if self.redelivery_burst_limit == 0 {
            return Err(DeliveryError::Config(
                "redelivery.redelivery_burst_limit must be greater than zero".into(),
            ));
        }
        if self.max_in_flight == 0 {
            return Err(DeliveryError::Config(
                "redelivery.max_in_flight must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CircuitBreakerConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Circuit breaker guarding handler invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker open.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// Longest a single handler invocation may run.
    #[serde(default = "default_call_timeout")]
    pub call_timeout: String,

    /// How long the breaker stays open before allowing a trial call.
    #[serde(default = "default_reset_timeout")]
    pub reset_timeout: String,
}

fn default_max_failures() -> u32 {
    5
}

fn default_call_timeout() -> String {
    "10s".to_string()
}

fn default_reset_timeout() -> String {
    "30s".to_string()
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            call_timeout: default_call_timeout(),
            reset_timeout: default_reset_timeout(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn for_testing() -> Self {
        Self {
            max_failures: 3,
            call_timeout: "500ms".to_string(),
            reset_timeout: "100ms".to_string(),
        }
    }

    /// Parse `call_timeout`, falling back to 10s if unparseable.
    pub fn call_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.call_timeout).unwrap_or(Duration::from_secs(10))
    }

    /// Parse `reset_timeout`, falling back to 30s if unparseable.
    pub fn reset_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.reset_timeout).unwrap_or(Duration::from_secs(30))
    }

    /// Build the runtime breaker config.
    pub fn to_circuit_config(&self, name: &str) -> CircuitConfig {
        CircuitConfig {
            name: name.to_string(),
            max_failures: self.max_failures,
            call_timeout: self.call_timeout_duration(),
            reset_timeout: self.reset_timeout_duration(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_failures == 0 {
            return Err(DeliveryError::Config(
                "circuit.max_failures must be greater than zero".into(),
            ));
        }
        require_nonzero("circuit.call_timeout", &self.call_timeout)?;
        require_nonzero("circuit.reset_timeout", &self.reset_timeout)?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SupervisorConfig: coordinator restart backoff
// ═══════════════════════════════════════════════════════════════════════════════

/// Restart policy for the delivery coordinator.
///
/// The n-th consecutive restart waits `min_backoff * 2^(n-1)`, capped at
/// `max_backoff`, plus up to `random_factor` of that as jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_min_backoff")]
    pub min_backoff: String,

    #[serde(default = "default_max_backoff")]
    pub max_backoff: String,

    /// Jitter fraction in `[0, 1]`.
    #[serde(default = "default_random_factor")]
    pub random_factor: f64,

    /// Consecutive restarts allowed before the fault is escalated.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// An instance that runs this long without failing resets the restart
    /// counter.
    #[serde(default = "default_reset_after")]
    pub reset_after: String,
}

fn default_min_backoff() -> String {
    "3s".to_string()
}

fn default_max_backoff() -> String {
    "30s".to_string()
}

fn default_random_factor() -> f64 {
    0.2
}

fn default_max_restarts() -> u32 {
    10
}

fn default_reset_after() -> String {
    "60s".to_string()
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            min_backoff: default_min_backoff(),
            max_backoff: default_max_backoff(),
            random_factor: default_random_factor(),
            max_restarts: default_max_restarts(),
            reset_after: default_reset_after(),
        }
    }
}

impl SupervisorConfig {
    pub fn for_testing() -> Self {
        Self {
            min_backoff: "10ms".to_string(),
            max_backoff: "100ms".to_string(),
            random_factor: 0.0,
            max_restarts: 3,
            reset_after: "5s".to_string(),
        }
    }

    pub fn min_backoff_duration(&self) -> Duration {
        humantime::parse_duration(&self.min_backoff).unwrap_or(Duration::from_secs(3))
    }

    pub fn max_backoff_duration(&self) -> Duration {
        humantime::parse_duration(&self.max_backoff).unwrap_or(Duration::from_secs(30))
    }

    pub fn reset_after_duration(&self) -> Duration {
        humantime::parse_duration(&self.reset_after).unwrap_or(Duration::from_secs(60))
    }

    /// Backoff schedule for restarts.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_restarts as usize,
            initial_delay: self.min_backoff_duration(),
            max_delay: self.max_backoff_duration(),
            backoff_factor: 2.0,
            random_factor: self.random_factor,
        }
    }

    fn validate(&self) -> Result<()> {
        let min = require_nonzero("supervisor.min_backoff", &self.min_backoff)?;
        let max = require_nonzero("supervisor.max_backoff", &self.max_backoff)?;
        if min > max {
            return Err(DeliveryError::Config(format!(
                "supervisor.min_backoff ({}) exceeds max_backoff ({})",
                self.min_backoff, self.max_backoff
            )));
        }
        if !(0.0..=1.0).contains(&self.random_factor) {
            return Err(DeliveryError::Config(format!(
                "supervisor.random_factor must be within [0, 1], got {}",
                self.random_factor
            )));
        }
        require_nonzero("supervisor.reset_after", &self.reset_after)?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EventLogConfig: SQLite event log
// ═══════════════════════════════════════════════════════════════════════════════

/// Event log persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogConfig {
    /// Path to the SQLite database file.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_true() -> bool {
    true
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "delivery_events.db".to_string(),
            wal_mode: true,
        }
    }
}

impl EventLogConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }

    /// Whether the log lives only as long as its connection.
    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
