// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Supervised restarts of the delivery coordinator.
//!
//! The supervisor owns the command inbox, so a coordinator crash loses no
//! queued commands: the next instance replays the event log and then serves
//! whatever is waiting. Only the command being processed at the moment of
//! the crash is answered with an error.
//!
//! # State Transitions
//!
//! ```text
//! Starting ──→ Running ──(error / panic)──→ Restarting ──(backoff)──→ Running
//!                 │                              │
//!                 │ shutdown                     │ restart budget spent
//!                 ↓                              ↓
//!              Stopped                         Failed
//! ```
//!
//! # Backoff
//!
//! The n-th consecutive restart waits `min_backoff * 2^(n-1)`, capped at
//! `max_backoff`, plus up to `random_factor` jitter. An instance that ran for
//! `reset_after` before failing resets the count.

use crate::config::DeliveryConfig;
use crate::coordinator::{panic_message, Command, DeliveryCoordinator, DeliveryHandle};
use crate::error::{DeliveryError, Result};
use crate::event_log::{EventLog, SqliteEventLog};
use crate::metrics;
use crate::registry::MethodRegistry;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Commands that can wait in the inbox while a coordinator (re)starts.
const COMMAND_BUFFER: usize = 1024;

/// Lifecycle of the supervised coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Created, first instance not yet running.
    Starting,
    /// An instance is recovering or serving commands.
    Running,
    /// Waiting out the backoff after a fault.
    Restarting,
    /// Shut down cleanly.
    Stopped,
    /// Restart budget exhausted; the fault was escalated.
    Failed,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorState::Starting => write!(f, "Starting"),
            SupervisorState::Running => write!(f, "Running"),
            SupervisorState::Restarting => write!(f, "Restarting"),
            SupervisorState::Stopped => write!(f, "Stopped"),
            SupervisorState::Failed => write!(f, "Failed"),
        }
    }
}

/// Runs delivery coordinators one after another until shutdown or until
/// the restart budget is spent.
pub struct Supervisor {
    handle: DeliveryHandle,
    state_rx: watch::Receiver<SupervisorState>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<Result<()>>>,
    sqlite: Option<SqliteEventLog>,
}

impl Supervisor {
    /// Open the SQLite event log from `config.log` and start supervising.
    pub async fn start(config: DeliveryConfig, registry: MethodRegistry) -> Result<Self> {
        config.validate()?;
        let log = SqliteEventLog::open(&config.log, config.stream_id.clone()).await?;
        let mut supervisor = Self::start_with_log(config, Arc::new(log.clone()), Arc::new(registry))?;
        supervisor.sqlite = Some(log);
        Ok(supervisor)
    }

    /// Start supervising with a caller-provided event log.
    pub fn start_with_log(
        config: DeliveryConfig,
        log: Arc<dyn EventLog>,
        registry: Arc<MethodRegistry>,
    ) -> Result<Self> {
        config.validate()?;

        if registry.is_empty() {
            warn!("Method registry is empty, every delivery will be unroutable");
        }
        info!(
            stream_id = %config.stream_id,
            handlers = registry.len(),
            "Starting delivery supervisor"
        );

        let (handle, inbox) = DeliveryHandle::channel(COMMAND_BUFFER);
        let (state_tx, state_rx) = watch::channel(SupervisorState::Starting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        metrics::set_supervisor_state("Starting");

        let task = tokio::spawn(supervise(
            config,
            log,
            registry,
            handle.clone(),
            inbox,
            shutdown_rx,
            state_tx,
        ));

        Ok(Self {
            handle,
            state_rx,
            shutdown_tx,
            task: Some(task),
            sqlite: None,
        })
    }

    /// A client for submitting calls. Stays valid across restarts.
    pub fn handle(&self) -> DeliveryHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> SupervisorState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<SupervisorState> {
        self.state_rx.clone()
    }

    /// Wait until supervision ends, then close the SQLite log if this
    /// supervisor opened it.
    ///
    /// Returns `Err(RestartsExhausted)` when the fault was escalated. Later
    /// calls return `Ok(())`.
    pub async fn join(&mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(DeliveryError::RestartsExhausted {
                restarts: 0,
                last_error: format!("supervisor task failed: {e}"),
            }),
        };
        if let Some(log) = self.sqlite.take() {
            log.close().await;
        }
        result
    }

    /// Stop the running coordinator and wait for it.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down delivery supervisor");
        let _ = self.shutdown_tx.send(true);
        self.join().await
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

fn set_state(state_tx: &watch::Sender<SupervisorState>, state: SupervisorState) {
    let _ = state_tx.send(state);
    metrics::set_supervisor_state(&state.to_string());
}

async fn supervise(
    config: DeliveryConfig,
    log: Arc<dyn EventLog>,
    registry: Arc<MethodRegistry>,
    handle: DeliveryHandle,
    mut inbox: mpsc::Receiver<Command>,
    mut shutdown_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<SupervisorState>,
) -> Result<()> {
    let retry = config.supervisor.retry_config();
    let reset_after = config.supervisor.reset_after_duration();
    let mut restarts: u32 = 0;

    loop {
        let coordinator = match DeliveryCoordinator::new(
            &config,
            Arc::clone(&log),
            Arc::clone(&registry),
            &handle,
        ) {
            Ok(coordinator) => coordinator,
            Err(e) => {
                set_state(&state_tx, SupervisorState::Failed);
                return Err(e);
            }
        };
        set_state(&state_tx, SupervisorState::Running);
        let started = Instant::now();

        let outcome = AssertUnwindSafe(coordinator.run(&mut inbox, shutdown_rx.clone()))
            .catch_unwind()
            .await;

        let (reason, last_error) = match outcome {
            Ok(Ok(())) => {
                set_state(&state_tx, SupervisorState::Stopped);
                info!("Delivery supervisor stopped");
                return Ok(());
            }
            Ok(Err(e)) => ("error", e.to_string()),
            Err(panic) => (
                "panic",
                format!("coordinator panicked: {}", panic_message(panic.as_ref())),
            ),
        };

        if *shutdown_rx.borrow() {
            set_state(&state_tx, SupervisorState::Stopped);
            return Ok(());
        }

        if started.elapsed() >= reset_after {
            restarts = 0;
        }

        if !retry.allows(restarts as usize) {
            set_state(&state_tx, SupervisorState::Failed);
            error!(
                restarts,
                error = %last_error,
                "Delivery coordinator restart budget exhausted"
            );
            return Err(DeliveryError::RestartsExhausted {
                restarts,
                last_error,
            });
        }

        restarts += 1;
        let delay = retry.jittered_delay_for_attempt(restarts as usize);
        set_state(&state_tx, SupervisorState::Restarting);
        metrics::record_restart(reason);
        warn!(
            restart = restarts,
            max_restarts = retry.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %last_error,
            "Restarting delivery coordinator"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    set_state(&state_tx, SupervisorState::Stopped);
                    return Ok(());
                }
            }
        }
    }
}
