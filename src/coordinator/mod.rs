// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Delivery coordinator: the at-least-once protocol.
//!
//! One tokio task owns the unconfirmed set and is the only writer of the
//! event log. Everything reaches it as a message:
//!
//! - [`Command`]s from [`DeliveryHandle`]s (submit, confirm, diagnostics)
//! - handler completions, posted back by the invocation tasks
//! - the redelivery sweep timer
//!
//! # Architecture
//!
//! ```text
//!  DeliveryHandle ──Command──▶ ┌──────────────────────┐
//!                              │  coordinator task    │──append──▶ EventLog
//!        sweep tick ─────────▶ │  (UnconfirmedSet)    │
//!                              └──────────┬───────────┘
//!                                 spawn   │  ▲ Completion
//!                                         ▼  │
//!                       Bulkhead ▶ CircuitBreaker ▶ MethodHandler
//! ```
//!
//! # Guarantees
//!
//! - `submit` replies only after the `Accepted` event is durable.
//! - A delivery leaves the unconfirmed set only after its `Confirmed` event
//!   is durable.
//! - At most one invocation per `delivery_seq` is in flight per instance.
//! - An append failure ends [`run`](DeliveryCoordinator::run) with the error;
//!   the [`Supervisor`](crate::supervisor::Supervisor) decides what happens
//!   next.

mod types;
mod unconfirmed;

pub use types::{
    Command, ConfirmOutcome, DeliveryStats, DeliveryStatus, UnconfirmedDelivery,
};
pub use unconfirmed::UnconfirmedSet;

use crate::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::config::DeliveryConfig;
use crate::error::{DeliveryError, Result};
use crate::event_log::EventLog;
use crate::metrics;
use crate::registry::{HandlerError, MethodRegistry};
use crate::resilience::Bulkhead;
use crate::types::{DeliveryEvent, DeliverySeq, DeliverySuccess, PendingCall};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Capacity of the confirmation broadcast. Slow subscribers lag, they never
/// block the coordinator.
const CONFIRMATION_BUFFER: usize = 1024;

// ═══════════════════════════════════════════════════════════════════════════════
// DeliveryHandle: the caller side
// ═══════════════════════════════════════════════════════════════════════════════

/// Cloneable client for a coordinator (or a supervised series of them).
#[derive(Debug, Clone)]
pub struct DeliveryHandle {
    tx: mpsc::Sender<Command>,
    confirmations: broadcast::Sender<DeliverySuccess>,
}

impl DeliveryHandle {
    /// Create a handle and the command inbox a coordinator will read.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(capacity);
        let (confirmations, _) = broadcast::channel(CONFIRMATION_BUFFER);
        (Self { tx, confirmations }, rx)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| DeliveryError::Shutdown)?;
        rx.await.map_err(|_| DeliveryError::CoordinatorUnavailable)
    }

    /// Durably accept a call for delivery.
    ///
    /// Returns once the call is persisted; the handler runs afterwards.
    /// `call_id` is carried for tracing only and is not used to deduplicate.
    pub async fn submit(
        &self,
        call_id: impl Into<String>,
        method_key: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<DeliverySeq> {
        let call_id = call_id.into();
        let method_key = method_key.into();
        let payload = payload.into();
        self.request(|reply| Command::Submit {
            call_id,
            method_key,
            payload,
            reply,
        })
        .await?
    }

    /// Mark a delivery as done without waiting for its handler.
    ///
    /// Idempotent: confirming an unknown or already confirmed sequence
    /// number persists nothing.
    pub async fn confirm(&self, delivery_seq: DeliverySeq) -> Result<ConfirmOutcome> {
        self.request(|reply| Command::Confirm {
            delivery_seq,
            reply,
        })
        .await?
    }

    /// Unconfirmed sequence numbers, ascending.
    pub async fn list_unconfirmed(&self) -> Result<Vec<DeliverySeq>> {
        self.request(|reply| Command::ListUnconfirmed { reply }).await
    }

    pub async fn unconfirmed_details(&self) -> Result<Vec<UnconfirmedDelivery>> {
        self.request(|reply| Command::Details { reply }).await
    }

    pub async fn stats(&self) -> Result<DeliveryStats> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Receive a [`DeliverySuccess`] for every confirmation from now on.
    pub fn subscribe_confirmations(&self) -> broadcast::Receiver<DeliverySuccess> {
        self.confirmations.subscribe()
    }

    /// Ask the coordinator to stop. In-flight invocations are abandoned and
    /// redelivered after the next start.
    pub async fn shutdown(&self) -> Result<()> {
        match self.request(|reply| Command::Shutdown { reply }).await {
            Ok(()) | Err(DeliveryError::Shutdown) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// True once no coordinator can ever read this handle's commands.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Coordinator
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
enum AttemptOutcome {
    Succeeded,
    Failed(String),
    Rejected,
    TimedOut(Duration),
}

impl AttemptOutcome {
    fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Succeeded => "succeeded",
            AttemptOutcome::Failed(_) => "failed",
            AttemptOutcome::Rejected => "rejected",
            AttemptOutcome::TimedOut(_) => "timed_out",
        }
    }
}

#[derive(Debug)]
struct Completion {
    delivery_seq: DeliverySeq,
    method_key: String,
    outcome: AttemptOutcome,
    elapsed: Duration,
}

/// Why the run loop stopped.
enum Exit {
    Shutdown,
    Fatal(DeliveryError),
}

/// One coordinator instance. Consumed by [`run`](Self::run); a restart
/// builds a new one (with a fresh, closed circuit breaker).
pub struct DeliveryCoordinator {
    stream_id: String,
    redeliver_interval: Duration,
    sweep_tick: Duration,
    warn_after_attempts: u32,
    max_unconfirmed: usize,
    burst_limit: usize,

    log: Arc<dyn EventLog>,
    registry: Arc<MethodRegistry>,
    breaker: Arc<CircuitBreaker>,
    bulkhead: Bulkhead,

    unconfirmed: UnconfirmedSet,
    next_seq: DeliverySeq,

    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    invocations: JoinSet<()>,
    confirmations: broadcast::Sender<DeliverySuccess>,
}

impl DeliveryCoordinator {
    /// Build a coordinator serving `handle`.
    ///
    /// Fails with [`DeliveryError::Config`] if `config` does not validate.
    pub fn new(
        config: &DeliveryConfig,
        log: Arc<dyn EventLog>,
        registry: Arc<MethodRegistry>,
        handle: &DeliveryHandle,
    ) -> Result<Self> {
        config.validate()?;
        let breaker = CircuitBreaker::new(config.circuit.to_circuit_config("delivery_handlers"));
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        Ok(Self {
            stream_id: config.stream_id.clone(),
            redeliver_interval: config.redelivery.redeliver_interval_duration(),
            sweep_tick: config.redelivery.sweep_tick(),
            warn_after_attempts: config.redelivery.warn_after_attempts,
            max_unconfirmed: config.redelivery.max_unconfirmed,
            burst_limit: config.redelivery.redelivery_burst_limit,
            log,
            registry,
            breaker: Arc::new(breaker),
            bulkhead: Bulkhead::new(config.redelivery.max_in_flight),
            unconfirmed: UnconfirmedSet::new(),
            next_seq: DeliverySeq::FIRST,
            completions_tx,
            completions_rx,
            invocations: JoinSet::new(),
            confirmations: handle.confirmations.clone(),
        })
    }

    /// Recover from the log, then serve commands until shutdown.
    ///
    /// Returns `Ok(())` on a requested shutdown and `Err` on a fatal fault
    /// (log append or replay failure). Dropping the coordinator abandons any
    /// in-flight invocations.
    pub async fn run(
        self,
        inbox: &mut mpsc::Receiver<Command>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let span = info_span!("coordinator", stream_id = %self.stream_id);
        self.run_inner(inbox, shutdown).instrument(span).await
    }

    async fn run_inner(
        mut self,
        inbox: &mut mpsc::Receiver<Command>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        if *shutdown.borrow() {
            return Ok(());
        }

        self.recover().await?;
        self.redeliver_due();

        let mut sweep = tokio::time::interval_at(Instant::now() + self.sweep_tick, self.sweep_tick);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Exit::Shutdown;
                    }
                }

                Some(completion) = self.completions_rx.recv() => {
                    if let Err(e) = self.handle_completion(completion).await {
                        break Exit::Fatal(e);
                    }
                }

                command = inbox.recv() => {
                    let Some(command) = command else {
                        debug!("All delivery handles dropped");
                        break Exit::Shutdown;
                    };
                    match self.handle_command(command).await {
                        Ok(true) => {}
                        Ok(false) => break Exit::Shutdown,
                        Err(e) => break Exit::Fatal(e),
                    }
                }

                _ = sweep.tick() => {
                    self.redeliver_due();
                }

                Some(joined) = self.invocations.join_next(), if !self.invocations.is_empty() => {
                    if let Err(e) = joined {
                        if !e.is_cancelled() {
                            warn!(error = %e, "Invocation task failed");
                        }
                    }
                }
            }
        };

        let abandoned = self.invocations.len();
        match exit {
            Exit::Shutdown => {
                info!(
                    unconfirmed = self.unconfirmed.len(),
                    abandoned,
                    "Delivery coordinator stopped"
                );
                Ok(())
            }
            Exit::Fatal(e) => {
                error!(error = %e, unconfirmed = self.unconfirmed.len(), abandoned, "Delivery coordinator failed");
                Err(e)
            }
        }
    }

    /// Rebuild the unconfirmed set from the full event stream.
    async fn recover(&mut self) -> Result<()> {
        let started = Instant::now();
        let events = self.log.replay().await?;
        self.unconfirmed = UnconfirmedSet::replay(&events);
        self.next_seq = self.unconfirmed.next_seq();

        metrics::record_recovery(events.len(), self.unconfirmed.len(), started.elapsed());
        metrics::set_unconfirmed(self.unconfirmed.len());
        info!(
            events = events.len(),
            unconfirmed = self.unconfirmed.len(),
            next_seq = %self.next_seq,
            "Recovered delivery state"
        );
        Ok(())
    }

    /// Returns `Ok(false)` when the coordinator should stop.
    async fn handle_command(&mut self, command: Command) -> Result<bool> {
        match command {
            Command::Submit {
                call_id,
                method_key,
                payload,
                reply,
            } => match self.submit(call_id, method_key, payload).await {
                Ok(seq) => {
                    let _ = reply.send(Ok(seq));
                }
                Err(e) if e.is_fatal() => {
                    let _ = reply.send(Err(DeliveryError::Persistence(e.to_string())));
                    return Err(e);
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Confirm {
                delivery_seq,
                reply,
            } => match self.confirm(delivery_seq, "external").await {
                Ok(outcome) => {
                    let _ = reply.send(Ok(outcome));
                }
                Err(e) => {
                    let _ = reply.send(Err(DeliveryError::Persistence(e.to_string())));
                    return Err(e);
                }
            },
            Command::ListUnconfirmed { reply } => {
                let _ = reply.send(self.unconfirmed.seqs());
            }
            Command::Details { reply } => {
                let _ = reply.send(self.unconfirmed.details());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown { reply } => {
                info!("Shutdown requested through delivery handle");
                let _ = reply.send(());
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn submit(
        &mut self,
        call_id: String,
        method_key: String,
        payload: Vec<u8>,
    ) -> Result<DeliverySeq> {
        if self.unconfirmed.len() >= self.max_unconfirmed {
            metrics::record_submission_rejected("backpressure");
            warn!(
                limit = self.max_unconfirmed,
                call_id = %call_id,
                "Rejecting submission, too many unconfirmed deliveries"
            );
            return Err(DeliveryError::Backpressure {
                limit: self.max_unconfirmed,
            });
        }

        let call = PendingCall {
            call_id,
            method_key,
            payload,
            delivery_seq: self.next_seq,
        };
        self.persist(&DeliveryEvent::Accepted(call.clone())).await?;

        let seq = call.delivery_seq;
        self.next_seq = seq.next();
        metrics::record_submission(&call.method_key);
        debug!(
            delivery_seq = %seq,
            call_id = %call.call_id,
            method_key = %call.method_key,
            "Accepted call"
        );
        self.unconfirmed.insert(call);
        metrics::set_unconfirmed(self.unconfirmed.len());

        self.dispatch(seq);
        Ok(seq)
    }

    async fn confirm(&mut self, seq: DeliverySeq, source: &str) -> Result<ConfirmOutcome> {
        if !self.unconfirmed.contains(seq) {
            debug!(delivery_seq = %seq, source, "Confirmation for unknown delivery ignored");
            return Ok(ConfirmOutcome::AlreadyConfirmed);
        }

        self.persist(&DeliveryEvent::confirmed(seq)).await?;

        if let Some(call) = self.unconfirmed.remove(seq) {
            metrics::record_confirmation(source);
            metrics::set_unconfirmed(self.unconfirmed.len());
            debug!(
                delivery_seq = %seq,
                call_id = %call.call_id,
                method_key = %call.method_key,
                source,
                "Delivery confirmed"
            );
            // No subscribers is fine.
            let _ = self.confirmations.send(DeliverySuccess {
                delivery_seq: seq,
                call_id: call.call_id,
                method_key: call.method_key,
            });
        }
        Ok(ConfirmOutcome::Confirmed)
    }

    async fn persist(&self, event: &DeliveryEvent) -> Result<()> {
        let started = Instant::now();
        let result = self.log.append(event).await;
        metrics::record_append(event.kind(), result.is_ok(), started.elapsed());
        if let Err(e) = &result {
            error!(
                kind = event.kind(),
                delivery_seq = %event.delivery_seq(),
                error = %e,
                "Failed to append delivery event"
            );
        }
        result
    }

    async fn handle_completion(&mut self, completion: Completion) -> Result<()> {
        let Completion {
            delivery_seq,
            method_key,
            outcome,
            elapsed,
        } = completion;

        metrics::record_attempt(&method_key, outcome.label());
        metrics::record_attempt_latency(&method_key, elapsed);
        metrics::set_in_flight(self.in_flight());

        match outcome {
            AttemptOutcome::Succeeded => {
                self.confirm(delivery_seq, "handler").await?;
            }
            AttemptOutcome::Failed(message) => {
                warn!(
                    delivery_seq = %delivery_seq,
                    method_key = %method_key,
                    error = %message,
                    "Delivery attempt failed"
                );
                self.unconfirmed.mark_pending(delivery_seq);
            }
            AttemptOutcome::Rejected => {
                debug!(delivery_seq = %delivery_seq, "Delivery attempt rejected by open circuit");
                self.unconfirmed.mark_pending(delivery_seq);
            }
            AttemptOutcome::TimedOut(after) => {
                warn!(
                    delivery_seq = %delivery_seq,
                    method_key = %method_key,
                    timeout_ms = after.as_millis() as u64,
                    "Delivery attempt timed out"
                );
                self.unconfirmed.mark_pending(delivery_seq);
            }
        }
        Ok(())
    }

    /// Sweep: dispatch every pending delivery whose backoff has elapsed.
    fn redeliver_due(&mut self) {
        let due = self
            .unconfirmed
            .due(Instant::now(), self.redeliver_interval, self.burst_limit);
        if due.is_empty() {
            metrics::record_sweep(0);
            return;
        }

        let mut dispatched = 0;
        for seq in due {
            if self.bulkhead.is_full() {
                debug!(dispatched, "Bulkhead full, deferring rest to next sweep");
                break;
            }
            if self.dispatch(seq) {
                dispatched += 1;
            }
        }
        metrics::record_sweep(dispatched);
        if dispatched > 0 {
            debug!(dispatched, unconfirmed = self.unconfirmed.len(), "Redelivery sweep");
        }
    }

    /// Start one attempt for `seq`. Returns whether an invocation was spawned.
    fn dispatch(&mut self, seq: DeliverySeq) -> bool {
        let Some(method_key) = self.unconfirmed.get(seq).map(|c| c.method_key.clone()) else {
            return false;
        };

        let handler = match self.registry.resolve(&method_key) {
            Ok(handler) => handler,
            Err(_) => {
                if self.unconfirmed.mark_unroutable(seq) {
                    metrics::record_unroutable(&method_key);
                    warn!(
                        delivery_seq = %seq,
                        method_key = %method_key,
                        "Unroutable delivery, no handler registered"
                    );
                }
                return false;
            }
        };

        let Some(permit) = self.bulkhead.try_acquire() else {
            return false;
        };

        let Some(attempt) =
            self.unconfirmed
                .begin_attempt(seq, Instant::now(), self.warn_after_attempts)
        else {
            return false;
        };

        if attempt.crossed_warn_threshold {
            metrics::record_unconfirmed_warning(&method_key);
            warn!(
                delivery_seq = %seq,
                call_id = %attempt.call.call_id,
                method_key = %method_key,
                attempts = attempt.attempt - 1,
                "Delivery still unconfirmed after repeated attempts"
            );
        }

        let span = info_span!(
            "delivery",
            delivery_seq = %seq,
            call_id = %attempt.call.call_id,
            method_key = %method_key,
            attempt = attempt.attempt
        );
        let breaker = Arc::clone(&self.breaker);
        let completions = self.completions_tx.clone();
        let payload = attempt.call.payload;

        self.invocations.spawn(
            async move {
                let started = Instant::now();

                let result = breaker
                    .call(|| async {
                        AssertUnwindSafe(async { handler.invoke(&payload).await })
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|panic| {
                                Err(HandlerError::new(format!(
                                    "handler panicked: {}",
                                    panic_message(panic.as_ref())
                                )))
                            })
                    })
                    .await;

                let outcome = match result {
                    Ok(()) => AttemptOutcome::Succeeded,
                    Err(CircuitError::Inner(e)) => AttemptOutcome::Failed(e.to_string()),
                    Err(CircuitError::Rejected) => AttemptOutcome::Rejected,
                    Err(CircuitError::Timeout(after)) => AttemptOutcome::TimedOut(after),
                };
                debug!(outcome = outcome.label(), "Invocation finished");
                drop(permit);

                let _ = completions.send(Completion {
                    delivery_seq: seq,
                    method_key,
                    outcome,
                    elapsed: started.elapsed(),
                });
            }
            .instrument(span),
        );
        metrics::set_in_flight(self.in_flight());
        true
    }

    fn in_flight(&self) -> usize {
        self.bulkhead
            .max_concurrent()
            .saturating_sub(self.bulkhead.available())
    }

    fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            stream_id: self.stream_id.clone(),
            unconfirmed: self.unconfirmed.len(),
            pending: self.unconfirmed.count(DeliveryStatus::Pending),
            delivering: self.unconfirmed.count(DeliveryStatus::Delivering),
            unroutable: self.unconfirmed.count(DeliveryStatus::Unroutable),
            in_flight: self.in_flight(),
            next_seq: self.next_seq,
            circuit: self.breaker.stats(),
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
