// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable append-only storage for delivery events.
//!
//! The coordinator appends one [`DeliveryEvent`] per state change and, on
//! startup, replays the whole stream to rebuild its unconfirmed set.
//!
//! # Durability Contract
//!
//! `append` must not return `Ok` until the event would survive a process
//! crash. The coordinator acknowledges a submission only after its
//! `Accepted` event was appended:
//!
//! ```text
//! submit → append(Accepted) → Ok(seq) to caller → invoke handler
//!          (crash here = caller got an error, resubmits)
//!                             (crash here = replay finds Accepted, redelivers)
//! ```
//!
//! # Implementations
//!
//! - [`SqliteEventLog`]: SQLite in WAL mode, one row per event
//! - [`InMemoryEventLog`]: process-local, with fault injection for tests

mod memory;
mod sqlite;

pub use memory::InMemoryEventLog;
pub use sqlite::SqliteEventLog;

use crate::error::Result;
use crate::types::DeliveryEvent;
use std::future::Future;
use std::pin::Pin;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Append-only event stream for one delivery coordinator.
///
/// Implementations are shared across coordinator restarts, so they must not
/// hold per-instance state beyond the stored events.
pub trait EventLog: Send + Sync + 'static {
    /// Durably append one event to the end of the stream.
    fn append<'a>(&'a self, event: &'a DeliveryEvent) -> BoxFuture<'a, ()>;

    /// Read the whole stream in append order.
    fn replay(&self) -> BoxFuture<'_, Vec<DeliveryEvent>>;
}
