// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory event log.
//!
//! Clones share the same stream, so a test can keep one handle while
//! coordinator instances come and go, then inspect what was persisted.
//! Appends can be made to fail on demand to exercise the fatal-fault path.

use super::{BoxFuture, EventLog};
use crate::error::{DeliveryError, Result};
use crate::types::DeliveryEvent;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Inner {
    events: Mutex<Vec<DeliveryEvent>>,
    fail_appends: AtomicBool,
    fail_next: AtomicUsize,
}

/// Process-local event log.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventLog {
    inner: Arc<Inner>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing stream, as if it had been persisted earlier.
    pub fn with_events(events: Vec<DeliveryEvent>) -> Self {
        let log = Self::new();
        *log.inner.events.lock() = events;
        log
    }

    /// Make every append fail until switched off again.
    pub fn set_fail_appends(&self, fail: bool) {
        self.inner.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Make the next `count` appends fail.
    pub fn fail_next_appends(&self, count: usize) {
        self.inner.fail_next.store(count, Ordering::SeqCst);
    }

    /// Snapshot of the stored stream.
    pub fn events(&self) -> Vec<DeliveryEvent> {
        self.inner.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn should_fail(&self) -> bool {
        if self.inner.fail_appends.load(Ordering::SeqCst) {
            return true;
        }
        self.inner
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl EventLog for InMemoryEventLog {
    fn append<'a>(&'a self, event: &'a DeliveryEvent) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.should_fail() {
                return Err(DeliveryError::Persistence(format!(
                    "injected append failure ({} event {})",
                    event.kind(),
                    event.delivery_seq()
                )));
            }
            self.inner.events.lock().push(event.clone());
            Ok(())
        })
    }

    fn replay(&self) -> BoxFuture<'_, Vec<DeliveryEvent>> {
        Box::pin(async move { Ok(self.events()) })
    }
}
