//! Mock MethodHandler for testing.
//!
//! Records every invocation and can be told to fail, panic, hang or slow
//! down, so tests can drive the coordinator through each failure path.

use parking_lot::Mutex;
use reliable_delivery::{HandlerError, HandlerFuture, MethodHandler};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// What the next invocation should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Succeed,
    Fail,
    Panic,
    /// Never complete.
    Hang,
}

/// Configurable handler that records payloads.
///
/// # Example
/// ```rust,ignore
/// let handler = Arc::new(MockHandler::new());
/// handler.fail_first(2);
///
/// // ... register and submit ...
///
/// assert_eq!(handler.invocations(), 3);
/// ```
pub struct MockHandler {
    payloads: Mutex<Vec<Vec<u8>>>,
    invocations: AtomicUsize,
    /// Invocations below this index use `early`, the rest `Succeed`
    /// unless `always` is set.
    early_count: AtomicUsize,
    early: Mutex<Behavior>,
    always: Mutex<Option<Behavior>>,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MockHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHandler {
    /// Create a mock that succeeds immediately.
    pub fn new() -> Self {
        Self {
            payloads: Mutex::new(Vec::new()),
            invocations: AtomicUsize::new(0),
            early_count: AtomicUsize::new(0),
            early: Mutex::new(Behavior::Succeed),
            always: Mutex::new(None),
            delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Fail the first `n` invocations, then succeed.
    pub fn fail_first(&self, n: usize) {
        *self.early.lock() = Behavior::Fail;
        self.early_count.store(n, Ordering::SeqCst);
    }

    /// Panic in the first `n` invocations, then succeed.
    pub fn panic_first(&self, n: usize) {
        *self.early.lock() = Behavior::Panic;
        self.early_count.store(n, Ordering::SeqCst);
    }

    /// Hang forever in the first `n` invocations, then succeed.
    pub fn hang_first(&self, n: usize) {
        *self.early.lock() = Behavior::Hang;
        self.early_count.store(n, Ordering::SeqCst);
    }

    /// Override every invocation; `None` restores the schedule above.
    pub fn set_always(&self, behavior: Option<Behavior>) {
        *self.always.lock() = behavior;
    }

    /// Sleep before completing each invocation.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.payloads.lock().clone()
    }

    /// Highest number of invocations observed running at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn behavior_for(&self, index: usize) -> Behavior {
        if let Some(always) = *self.always.lock() {
            return always;
        }
        if index < self.early_count.load(Ordering::SeqCst) {
            *self.early.lock()
        } else {
            Behavior::Succeed
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MethodHandler for MockHandler {
    fn invoke<'a>(&'a self, payload: &'a [u8]) -> HandlerFuture<'a> {
        Box::pin(async move {
            let index = self.invocations.fetch_add(1, Ordering::SeqCst);
            self.payloads.lock().push(payload.to_vec());

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            let _guard = InFlight(&self.in_flight);
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let delay = *self.delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match self.behavior_for(index) {
                Behavior::Succeed => Ok(()),
                Behavior::Fail => Err(HandlerError::new(format!("mock failure #{index}"))),
                Behavior::Panic => panic!("mock panic #{index}"),
                Behavior::Hang => {
                    futures::future::pending::<()>().await;
                    Ok(())
                }
            }
        })
    }
}
