// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Message and event types shared by the coordinator and the event log.
//!
//! A call moves through the system as:
//!
//! ```text
//! submit(call_id, method_key, payload)
//!     → DeliveryEvent::Accepted(PendingCall { delivery_seq, .. })   (persisted)
//!     → handler invocation (one or more times)
//!     → DeliveryEvent::Confirmed(DeliveryConfirmation { delivery_seq })   (persisted)
//! ```

use std::fmt;

/// Monotonically increasing identifier of a persisted call.
///
/// This, not the caller's `call_id`, is the unit of at-least-once tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeliverySeq(u64);

impl DeliverySeq {
    /// The first sequence number handed out on an empty log.
    pub const FIRST: DeliverySeq = DeliverySeq(1);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// The sequence number following this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for DeliverySeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for DeliverySeq {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// A submitted call awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCall {
    /// Caller-chosen hint, carried for tracing only.
    pub call_id: String,
    /// Registry key of the handler to invoke.
    pub method_key: String,
    /// Opaque payload handed to the handler unchanged.
    pub payload: Vec<u8>,
    /// Assigned when the call is first persisted.
    pub delivery_seq: DeliverySeq,
}

/// Record that the call with `delivery_seq` succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryConfirmation {
    pub delivery_seq: DeliverySeq,
}

/// A record in the append-only delivery log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    /// A call was accepted and must be delivered.
    Accepted(PendingCall),
    /// A call was delivered and must not be redelivered.
    Confirmed(DeliveryConfirmation),
}

impl DeliveryEvent {
    pub const ACCEPTED: &'static str = "accepted";
    pub const CONFIRMED: &'static str = "confirmed";

    /// Sequence number the event refers to.
    pub fn delivery_seq(&self) -> DeliverySeq {
        match self {
            Self::Accepted(call) => call.delivery_seq,
            Self::Confirmed(confirmation) => confirmation.delivery_seq,
        }
    }

    /// Stable tag stored alongside the event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Accepted(_) => Self::ACCEPTED,
            Self::Confirmed(_) => Self::CONFIRMED,
        }
    }

    pub fn confirmed(delivery_seq: DeliverySeq) -> Self {
        Self::Confirmed(DeliveryConfirmation { delivery_seq })
    }
}

/// Notification broadcast to subscribers once a delivery is confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverySuccess {
    pub delivery_seq: DeliverySeq,
    pub call_id: String,
    pub method_key: String,
}
