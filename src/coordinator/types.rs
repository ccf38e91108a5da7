//! Coordinator protocol types.
//!
//! # Per-delivery State
//!
//! ```text
//!              dispatch                 handler Ok
//! Pending ─────────────────→ Delivering ──────────────→ Confirmed (removed)
//!    ↑                           │
//!    │  failure / timeout /      │
//!    └──── breaker rejection ────┘
//!
//! Pending ──(no handler for method key)──→ Unroutable (kept, not retried)
//! ```
//!
//! An external `confirm` removes the entry from any state.

use crate::circuit_breaker::CircuitStats;
use crate::error::Result;
use crate::types::DeliverySeq;
use tokio::sync::oneshot;

/// Where an unconfirmed delivery currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Waiting for the next attempt.
    Pending,
    /// A handler invocation is in flight.
    Delivering,
    /// No handler is registered for the method key.
    Unroutable,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "Pending"),
            DeliveryStatus::Delivering => write!(f, "Delivering"),
            DeliveryStatus::Unroutable => write!(f, "Unroutable"),
        }
    }
}

/// Diagnostic view of one unconfirmed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnconfirmedDelivery {
    pub delivery_seq: DeliverySeq,
    pub call_id: String,
    pub method_key: String,
    pub status: DeliveryStatus,
    /// Attempts made by the current coordinator instance.
    pub attempts: u32,
}

/// Result of a confirmation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// The confirmation was persisted and the delivery removed.
    Confirmed,
    /// Nothing to do: the sequence number was not unconfirmed.
    AlreadyConfirmed,
}

/// Snapshot of a coordinator instance.
#[derive(Debug, Clone)]
pub struct DeliveryStats {
    pub stream_id: String,
    pub unconfirmed: usize,
    pub pending: usize,
    pub delivering: usize,
    pub unroutable: usize,
    /// Handler invocations currently holding a bulkhead slot.
    pub in_flight: usize,
    pub next_seq: DeliverySeq,
    pub circuit: CircuitStats,
}

/// Requests accepted by the coordinator task.
///
/// Sent through a [`DeliveryHandle`](super::DeliveryHandle); each carries a
/// oneshot for the reply.
#[derive(Debug)]
pub enum Command {
    Submit {
        call_id: String,
        method_key: String,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<DeliverySeq>>,
    },
    Confirm {
        delivery_seq: DeliverySeq,
        reply: oneshot::Sender<Result<ConfirmOutcome>>,
    },
    ListUnconfirmed {
        reply: oneshot::Sender<Vec<DeliverySeq>>,
    },
    Details {
        reply: oneshot::Sender<Vec<UnconfirmedDelivery>>,
    },
    Stats {
        reply: oneshot::Sender<DeliveryStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}
