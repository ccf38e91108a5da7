//! # Reliable Delivery
//!
//! Durable at-least-once delivery of method calls to asynchronous handlers.
//!
//! ## Architecture
//!
//! Every submitted call is persisted to an append-only event log before the
//! caller is acknowledged, then delivered to the handler registered for its
//! method key. It stays in the unconfirmed set until a confirmation is
//! persisted, surviving handler failures, downstream outages and restarts:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              Supervisor                                   │
//! │   (restarts the coordinator with exponential backoff on fatal faults)     │
//! │                                                                           │
//! │  DeliveryHandle ──► ┌─────────────────────┐ ──append/replay──► EventLog   │
//! │   submit/confirm    │ DeliveryCoordinator │                    (SQLite)   │
//! │                     │  unconfirmed set    │                               │
//! │                     │  redelivery sweep   │                               │
//! │                     └──────────┬──────────┘                               │
//! │                                ▼                                          │
//! │              Bulkhead ─► CircuitBreaker ─► MethodRegistry handler         │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery Semantics
//!
//! - **At least once**: handlers may run more than once for the same call
//!   and must be idempotent.
//! - **Tracked by sequence number**: each accepted call gets a
//!   [`DeliverySeq`]; the caller's `call_id` is only carried for tracing.
//! - **Recovery**: a (re)started coordinator replays the log and redelivers
//!   everything still unconfirmed.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use reliable_delivery::{DeliveryConfig, MethodRegistry, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> reliable_delivery::Result<()> {
//!     let mut registry = MethodRegistry::new();
//!     registry.register_fn("EmployeeRepository.AddEmployee", |payload| async move {
//!         // write `payload` somewhere, idempotently
//!         let _ = payload;
//!         Ok(())
//!     });
//!
//!     let mut supervisor = Supervisor::start(DeliveryConfig::default(), registry).await?;
//!     let handle = supervisor.handle();
//!
//!     let seq = handle
//!         .submit("req-42", "EmployeeRepository.AddEmployee", br#"{"name":"Ada"}"#.to_vec())
//!         .await?;
//!     println!("accepted as {seq}");
//!
//!     supervisor.shutdown().await
//! }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event_log;
pub mod metrics;
pub mod registry;
pub mod resilience;
pub mod supervisor;
pub mod types;

// Re-exports for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitState, CircuitStats};
pub use config::{
    CircuitBreakerConfig, DeliveryConfig, EventLogConfig, RedeliveryConfig, SupervisorConfig,
};
pub use coordinator::{
    ConfirmOutcome, DeliveryCoordinator, DeliveryHandle, DeliveryStats, DeliveryStatus,
    UnconfirmedDelivery, UnconfirmedSet,
};
pub use error::{DeliveryError, Result};
pub use event_log::{EventLog, InMemoryEventLog, SqliteEventLog};
pub use registry::{HandlerError, HandlerFuture, MethodHandler, MethodRegistry};
pub use supervisor::{Supervisor, SupervisorState};
pub use types::{DeliveryConfirmation, DeliveryEvent, DeliverySeq, DeliverySuccess, PendingCall};
