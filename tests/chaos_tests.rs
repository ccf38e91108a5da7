// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate crashes and storage faults and verify that no
//! accepted call is ever lost.
//!
//! A "crash" aborts the coordinator task wherever it is, so nothing that was
//! not already appended to the event log survives.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::*;
use reliable_delivery::event_log::BoxFuture;
use reliable_delivery::{
    CircuitState, DeliveryConfig, DeliveryError, DeliveryEvent, DeliverySeq, EventLog,
    InMemoryEventLog, MethodRegistry, SqliteEventLog, Supervisor, SupervisorState,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn config() -> DeliveryConfig {
    DeliveryConfig::for_testing("chaos-tests")
}

/// Event log whose replay panics a set number of times.
struct PanickingReplayLog {
    inner: InMemoryEventLog,
    panics_left: AtomicUsize,
}

impl EventLog for PanickingReplayLog {
    fn append<'a>(&'a self, event: &'a DeliveryEvent) -> BoxFuture<'a, ()> {
        self.inner.append(event)
    }

    fn replay(&self) -> BoxFuture<'_, Vec<DeliveryEvent>> {
        Box::pin(async move {
            let panic_now = self
                .panics_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if panic_now {
                panic!("replay exploded");
            }
            self.inner.replay().await
        })
    }
}

/// Event log that can never be read back.
struct UnreadableLog;

impl EventLog for UnreadableLog {
    fn append<'a>(&'a self, _event: &'a DeliveryEvent) -> BoxFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn replay(&self) -> BoxFuture<'_, Vec<DeliveryEvent>> {
        Box::pin(async { Err(DeliveryError::Persistence("disk unreadable".into())) })
    }
}

// =============================================================================
// Crash Recovery
// =============================================================================

/// Test: A crash after persisting but before confirming re-invokes the handler
#[tokio::test]
async fn crash_before_confirm_redelivers() {
    init_tracing();
    let log = InMemoryEventLog::new();
    let handler = Arc::new(MockHandler::new());
    handler.hang_first(1);

    let tc = spawn_coordinator(
        &config(),
        Arc::new(log.clone()),
        registry_with("add", Arc::clone(&handler)),
    );
    let seq = tc.handle.submit("c1", "add", b"once".to_vec()).await.unwrap();
    let started = &handler;
    let invoked = wait_until(Duration::from_secs(1), move || async move {
        started.invocations() == 1
    })
    .await;
    assert!(invoked);
    tc.crash().await;

    // Accepted but never confirmed.
    assert_eq!(log.len(), 1);

    let tc = spawn_coordinator(
        &config(),
        Arc::new(log.clone()),
        registry_with("add", Arc::clone(&handler)),
    );
    assert!(wait_all_confirmed(&tc.handle, Duration::from_secs(2)).await);

    // At least once: the handler saw the same payload twice.
    assert_eq!(handler.payloads(), vec![b"once".to_vec(), b"once".to_vec()]);
    assert_eq!(log.events().last(), Some(&DeliveryEvent::confirmed(seq)));
    tc.stop().await.unwrap();
}

/// Test: Calls parked as unroutable are delivered once a handler exists
#[tokio::test]
async fn unroutable_delivered_after_restart_with_handler() {
    let log = InMemoryEventLog::new();
    let tc = spawn_coordinator(&config(), Arc::new(log.clone()), MethodRegistry::new());
    tc.handle.submit("c1", "add", b"late".to_vec()).await.unwrap();
    tc.crash().await;

    let handler = Arc::new(MockHandler::new());
    let tc = spawn_coordinator(
        &config(),
        Arc::new(log.clone()),
        registry_with("add", Arc::clone(&handler)),
    );

    assert!(wait_all_confirmed(&tc.handle, Duration::from_secs(2)).await);
    assert_eq!(handler.payloads(), vec![b"late".to_vec()]);
    tc.stop().await.unwrap();
}

/// Test: The recovered unconfirmed set equals the one before the crash
#[tokio::test]
async fn recovered_state_matches_pre_crash() {
    let log = InMemoryEventLog::new();
    let handler = Arc::new(MockHandler::new());
    let registry = || registry_with("ok", Arc::clone(&handler));

    let tc = spawn_coordinator(&config(), Arc::new(log.clone()), registry());
    let mut parked = Vec::new();
    for i in 0..5 {
        tc.handle.submit(format!("ok-{i}"), "ok", Vec::new()).await.unwrap();
        parked.push(
            tc.handle
                .submit(format!("missing-{i}"), "missing", Vec::new())
                .await
                .unwrap(),
        );
    }
    tc.handle.confirm(parked[0]).await.unwrap();
    tc.handle.confirm(parked[3]).await.unwrap();

    let handle = tc.handle.clone();
    let settled = wait_until(Duration::from_secs(2), || {
        let handle = handle.clone();
        async move { handle.list_unconfirmed().await.map(|s| s.len() == 3).unwrap_or(false) }
    })
    .await;
    assert!(settled);
    let before = tc.handle.list_unconfirmed().await.unwrap();
    tc.crash().await;

    let tc = spawn_coordinator(&config(), Arc::new(log.clone()), registry());
    assert_eq!(tc.handle.list_unconfirmed().await.unwrap(), before);
    assert_eq!(before, vec![parked[1], parked[2], parked[4]]);

    // Numbering continues after the highest sequence ever logged.
    let next = tc.handle.submit("after", "ok", Vec::new()).await.unwrap();
    assert_eq!(next, DeliverySeq::new(11));
    tc.stop().await.unwrap();
}

/// Test: SQLite-backed state survives closing and reopening the database
#[tokio::test]
async fn sqlite_reopen_recovers_unconfirmed() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("chaos.db");

    let log = SqliteEventLog::open_path(&db_path, "chaos").await.unwrap();
    let tc = spawn_coordinator(&config(), Arc::new(log.clone()), MethodRegistry::new());
    let first = tc.handle.submit("c1", "add", b"1".to_vec()).await.unwrap();
    tc.handle.submit("c2", "add", b"2".to_vec()).await.unwrap();
    tc.handle.submit("c3", "add", b"3".to_vec()).await.unwrap();
    tc.handle.confirm(first).await.unwrap();
    tc.crash().await;
    log.close().await;

    let log = SqliteEventLog::open_path(&db_path, "chaos").await.unwrap();
    assert_eq!(log.len().await.unwrap(), 4);

    let handler = Arc::new(MockHandler::new());
    let tc = spawn_coordinator(
        &config(),
        Arc::new(log.clone()),
        registry_with("add", Arc::clone(&handler)),
    );
    assert!(wait_all_confirmed(&tc.handle, Duration::from_secs(2)).await);

    let mut payloads = handler.payloads();
    payloads.sort();
    assert_eq!(payloads, vec![b"2".to_vec(), b"3".to_vec()]);
    tc.stop().await.unwrap();
    log.close().await;
}

// =============================================================================
// Supervisor Restarts
// =============================================================================

/// Test: An append failure restarts the coordinator; later calls are served
#[tokio::test]
async fn supervisor_restarts_after_append_failure() {
    let log = InMemoryEventLog::new();
    let mut supervisor = Supervisor::start_with_log(
        config(),
        Arc::new(log.clone()),
        Arc::new(MethodRegistry::new()),
    )
    .unwrap();
    let handle = supervisor.handle();

    let first = handle.submit("a", "missing", Vec::new()).await.unwrap();

    log.fail_next_appends(1);
    let err = handle.submit("b", "missing", Vec::new()).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Persistence(_)));

    // The replacement instance replayed the log before serving this.
    let second = handle.submit("c", "missing", Vec::new()).await.unwrap();
    assert_eq!(second, first.next());
    assert_eq!(handle.list_unconfirmed().await.unwrap(), vec![first, second]);
    assert_eq!(supervisor.state(), SupervisorState::Running);

    supervisor.shutdown().await.unwrap();
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
}

/// Test: A panic during recovery is caught and the coordinator restarted
#[tokio::test]
async fn supervisor_survives_recovery_panic() {
    let inner = InMemoryEventLog::new();
    let log = Arc::new(PanickingReplayLog {
        inner: inner.clone(),
        panics_left: AtomicUsize::new(1),
    });
    let handler = Arc::new(MockHandler::new());
    let mut supervisor = Supervisor::start_with_log(
        config(),
        log.clone(),
        Arc::new(registry_with("add", Arc::clone(&handler))),
    )
    .unwrap();
    let handle = supervisor.handle();

    // Queued while the first instance dies; served by the second.
    handle.submit("c1", "add", Vec::new()).await.unwrap();
    assert!(wait_all_confirmed(&handle, Duration::from_secs(2)).await);

    assert_eq!(log.panics_left.load(Ordering::SeqCst), 0);
    assert_eq!(handler.invocations(), 1);
    assert_eq!(inner.len(), 2);
    supervisor.shutdown().await.unwrap();
}

/// Test: A log that cannot be replayed exhausts the restart budget
#[tokio::test]
async fn unreadable_log_escalates() {
    let mut config = config();
    config.supervisor.max_restarts = 3;

    let mut supervisor = Supervisor::start_with_log(
        config,
        Arc::new(UnreadableLog),
        Arc::new(MethodRegistry::new()),
    )
    .unwrap();
    let mut state = supervisor.state_receiver();

    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == SupervisorState::Failed),
    )
    .await
    .expect("supervisor never escalated")
    .unwrap();

    match supervisor.join().await {
        Err(DeliveryError::RestartsExhausted {
            restarts,
            last_error,
        }) => {
            assert_eq!(restarts, 3);
            assert!(last_error.contains("disk unreadable"));
        }
        other => panic!("expected RestartsExhausted, got {other:?}"),
    }
    assert!(supervisor.handle().is_closed());
}

// =============================================================================
// Handler Misbehaviour Under Load
// =============================================================================

/// Test: Repeated handler panics open the circuit without killing the coordinator
#[tokio::test]
async fn repeated_panics_open_circuit() {
    let mut config = config();
    config.circuit.reset_timeout = "10s".to_string();

    let handler = Arc::new(MockHandler::new());
    handler.set_always(Some(Behavior::Panic));
    let tc = spawn_coordinator(
        &config,
        Arc::new(InMemoryEventLog::new()),
        registry_with("add", Arc::clone(&handler)),
    );
    let seq = tc.handle.submit("c1", "add", Vec::new()).await.unwrap();

    let handle = tc.handle.clone();
    let opened = wait_until(Duration::from_secs(2), || {
        let handle = handle.clone();
        async move {
            handle
                .stats()
                .await
                .map(|s| s.circuit.state == CircuitState::Open)
                .unwrap_or(false)
        }
    })
    .await;
    assert!(opened);

    assert_eq!(handler.invocations(), 3);
    assert_eq!(tc.handle.list_unconfirmed().await.unwrap(), vec![seq]);
    tc.stop().await.unwrap();
}

/// Test: Concurrent submitters against a flaky handler lose nothing
#[tokio::test]
async fn concurrent_submitters_with_flaky_handler() {
    let mut config = config();
    config.circuit.max_failures = 1000;

    let log = InMemoryEventLog::new();
    let handler = Arc::new(MockHandler::new());
    handler.fail_first(20);
    let tc = spawn_coordinator(
        &config,
        Arc::new(log.clone()),
        registry_with("add", Arc::clone(&handler)),
    );

    let mut tasks = Vec::new();
    for worker in 0..5 {
        let handle = tc.handle.clone();
        tasks.push(tokio::spawn(async move {
            let mut seqs = Vec::new();
            for i in 0..10 {
                let call_id = format!("w{worker}-{i}");
                seqs.push(handle.submit(call_id, "add", Vec::new()).await.unwrap());
            }
            seqs
        }));
    }

    let mut all = HashSet::new();
    for task in tasks {
        for seq in task.await.unwrap() {
            assert!(all.insert(seq), "duplicate sequence number {seq}");
        }
    }
    assert_eq!(all.len(), 50);

    assert!(wait_all_confirmed(&tc.handle, Duration::from_secs(5)).await);
    assert_eq!(handler.invocations(), 70);

    let confirmed: HashSet<_> = log
        .events()
        .iter()
        .filter(|e| e.kind() == DeliveryEvent::CONFIRMED)
        .map(DeliveryEvent::delivery_seq)
        .collect();
    assert_eq!(confirmed, all);
    tc.stop().await.unwrap();
}
