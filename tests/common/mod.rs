//! Shared test utilities for delivery and chaos tests.
//!
//! This module provides:
//! - A configurable mock `MethodHandler` that records invocations
//! - Helpers to run a coordinator directly (no supervisor) and crash it
//! - Polling helpers for asynchronous assertions

#![allow(dead_code)]

pub mod mock_handler;

pub use mock_handler::*;

use reliable_delivery::{
    DeliveryConfig, DeliveryCoordinator, DeliveryHandle, EventLog, MethodRegistry, Result,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Install a tracing subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A coordinator running on its own task, without a supervisor.
pub struct TestCoordinator {
    pub handle: DeliveryHandle,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl TestCoordinator {
    /// Simulate a process crash: the task is dropped wherever it is.
    pub async fn crash(self) {
        self.task.abort();
        let _ = self.task.await;
    }

    /// Graceful stop.
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.task.await.expect("coordinator task panicked")
    }

    /// Wait for the run loop to end on its own (fatal fault).
    pub async fn join(self) -> Result<()> {
        self.task.await.expect("coordinator task panicked")
    }
}

pub fn spawn_coordinator(
    config: &DeliveryConfig,
    log: Arc<dyn EventLog>,
    registry: MethodRegistry,
) -> TestCoordinator {
    let (handle, mut inbox) = DeliveryHandle::channel(256);
    let (shutdown, shutdown_rx) = watch::channel(false);
    let coordinator = DeliveryCoordinator::new(config, log, Arc::new(registry), &handle)
        .expect("valid delivery config");
    let task = tokio::spawn(async move { coordinator.run(&mut inbox, shutdown_rx).await });
    TestCoordinator {
        handle,
        shutdown,
        task,
    }
}

/// Registry with one handler under `key`.
pub fn registry_with(key: &str, handler: Arc<MockHandler>) -> MethodRegistry {
    let mut registry = MethodRegistry::new();
    registry.register_arc(key, handler);
    registry
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the handle reports no unconfirmed deliveries.
pub async fn wait_all_confirmed(handle: &DeliveryHandle, timeout: Duration) -> bool {
    wait_until(timeout, move || async move {
        handle
            .list_unconfirmed()
            .await
            .map(|seqs| seqs.is_empty())
            .unwrap_or(false)
    })
    .await
}
