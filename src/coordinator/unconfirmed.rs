// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The set of accepted-but-unconfirmed deliveries.
//!
//! Owned by exactly one coordinator task. Rebuilt on startup by folding the
//! event log: `Accepted` inserts, `Confirmed` removes.

use super::types::{DeliveryStatus, UnconfirmedDelivery};
use crate::types::{DeliveryEvent, DeliverySeq, PendingCall};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    call: PendingCall,
    status: DeliveryStatus,
    attempts: u32,
    last_attempt: Option<Instant>,
    warned: bool,
}

impl Entry {
    fn new(call: PendingCall) -> Self {
        Self {
            call,
            status: DeliveryStatus::Pending,
            attempts: 0,
            last_attempt: None,
            warned: false,
        }
    }
}

/// A delivery that was just moved to `Delivering`.
#[derive(Debug, Clone)]
pub(crate) struct Attempt {
    pub call: PendingCall,
    pub attempt: u32,
    /// True exactly once per entry: the first attempt above the warning threshold.
    pub crossed_warn_threshold: bool,
}

/// Unconfirmed deliveries keyed by sequence number, oldest first.
#[derive(Debug, Clone, Default)]
pub struct UnconfirmedSet {
    entries: BTreeMap<DeliverySeq, Entry>,
    highest_seq: Option<DeliverySeq>,
}

impl UnconfirmedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the set from a full event stream.
    pub fn replay<'a>(events: impl IntoIterator<Item = &'a DeliveryEvent>) -> Self {
        let mut set = Self::new();
        for event in events {
            set.apply(event);
        }
        set
    }

    /// Fold one event into the set.
    pub fn apply(&mut self, event: &DeliveryEvent) {
        let seq = event.delivery_seq();
        self.highest_seq = Some(self.highest_seq.map_or(seq, |h| h.max(seq)));
        match event {
            DeliveryEvent::Accepted(call) => {
                self.entries.insert(seq, Entry::new(call.clone()));
            }
            DeliveryEvent::Confirmed(_) => {
                self.entries.remove(&seq);
            }
        }
    }

    /// Sequence number for the next accepted call.
    pub fn next_seq(&self) -> DeliverySeq {
        self.highest_seq.map_or(DeliverySeq::FIRST, DeliverySeq::next)
    }

    /// Track a freshly persisted call.
    pub fn insert(&mut self, call: PendingCall) {
        self.apply(&DeliveryEvent::Accepted(call));
    }

    pub fn remove(&mut self, seq: DeliverySeq) -> Option<PendingCall> {
        self.entries.remove(&seq).map(|entry| entry.call)
    }

    pub fn contains(&self, seq: DeliverySeq) -> bool {
        self.entries.contains_key(&seq)
    }

    pub fn get(&self, seq: DeliverySeq) -> Option<&PendingCall> {
        self.entries.get(&seq).map(|entry| &entry.call)
    }

    pub fn status(&self, seq: DeliverySeq) -> Option<DeliveryStatus> {
        self.entries.get(&seq).map(|entry| entry.status)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Unconfirmed sequence numbers, ascending.
    pub fn seqs(&self) -> Vec<DeliverySeq> {
        self.entries.keys().copied().collect()
    }

    /// Unconfirmed calls, ascending by sequence number.
    pub fn calls(&self) -> Vec<PendingCall> {
        self.entries.values().map(|entry| entry.call.clone()).collect()
    }

    pub fn details(&self) -> Vec<UnconfirmedDelivery> {
        self.entries
            .values()
            .map(|entry| UnconfirmedDelivery {
                delivery_seq: entry.call.delivery_seq,
                call_id: entry.call.call_id.clone(),
                method_key: entry.call.method_key.clone(),
                status: entry.status,
                attempts: entry.attempts,
            })
            .collect()
    }

    /// Count of entries in `status`.
    pub fn count(&self, status: DeliveryStatus) -> usize {
        self.entries.values().filter(|e| e.status == status).count()
    }

    /// Pending entries whose last attempt is at least `interval` old (or that
    /// were never attempted), oldest first, at most `limit` of them.
    pub fn due(&self, now: Instant, interval: Duration, limit: usize) -> Vec<DeliverySeq> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.status == DeliveryStatus::Pending)
            .filter(|(_, entry)| {
                entry
                    .last_attempt
                    .map_or(true, |at| now.saturating_duration_since(at) >= interval)
            })
            .map(|(seq, _)| *seq)
            .take(limit)
            .collect()
    }

    /// Move a pending entry to `Delivering` and count the attempt.
    pub(crate) fn begin_attempt(
        &mut self,
        seq: DeliverySeq,
        now: Instant,
        warn_after: u32,
    ) -> Option<Attempt> {
        let entry = self.entries.get_mut(&seq)?;
        if entry.status != DeliveryStatus::Pending {
            return None;
        }
        entry.status = DeliveryStatus::Delivering;
        entry.attempts = entry.attempts.saturating_add(1);
        entry.last_attempt = Some(now);

        let crossed_warn_threshold = !entry.warned && entry.attempts > warn_after;
        if crossed_warn_threshold {
            entry.warned = true;
        }

        Some(Attempt {
            call: entry.call.clone(),
            attempt: entry.attempts,
            crossed_warn_threshold,
        })
    }

    /// Return a delivering entry to `Pending` after a failed attempt.
    pub fn mark_pending(&mut self, seq: DeliverySeq) -> bool {
        match self.entries.get_mut(&seq) {
            Some(entry) if entry.status == DeliveryStatus::Delivering => {
                entry.status = DeliveryStatus::Pending;
                true
            }
            _ => false,
        }
    }

    /// Park an entry whose method key has no handler.
    pub fn mark_unroutable(&mut self, seq: DeliverySeq) -> bool {
        match self.entries.get_mut(&seq) {
            Some(entry) => {
                entry.status = DeliveryStatus::Unroutable;
                true
            }
            None => false,
        }
    }
}
