// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Method registry: string keys to asynchronous handlers.
//!
//! The coordinator never knows what a handler does. It only resolves the
//! method key stored with a call and hands the handler the opaque payload.
//! Handlers must be idempotent: a call may be invoked more than once.
//!
//! # Example
//!
//! ```rust,no_run
//! use reliable_delivery::registry::{HandlerError, HandlerFuture, MethodHandler, MethodRegistry};
//!
//! struct AddEmployee;
//!
//! impl MethodHandler for AddEmployee {
//!     fn invoke<'a>(&'a self, payload: &'a [u8]) -> HandlerFuture<'a> {
//!         Box::pin(async move {
//!             if payload.is_empty() {
//!                 return Err(HandlerError::new("empty payload"));
//!             }
//!             Ok(())
//!         })
//!     }
//! }
//!
//! let mut registry = MethodRegistry::new();
//! registry.register("EmployeeRepository.AddEmployee", AddEmployee);
//! registry.register_fn("EmployeeRepository.DeleteEmployee", |_payload| async { Ok(()) });
//! ```

use crate::error::{DeliveryError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

/// Failure reported by a handler. The message is logged and the call is
/// retried by the redelivery sweep.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Type alias for boxed handler futures (reduces trait signature complexity).
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = std::result::Result<(), HandlerError>> + Send + 'a>>;

/// A downstream operation the coordinator delivers calls to.
pub trait MethodHandler: Send + Sync + 'static {
    /// Execute the operation for one payload.
    ///
    /// Returning `Err` (or panicking) marks the attempt failed; the call
    /// stays unconfirmed and is redelivered later.
    fn invoke<'a>(&'a self, payload: &'a [u8]) -> HandlerFuture<'a>;
}

/// Adapter for handlers written as async closures.
struct FnHandler<F> {
    f: F,
}

impl<F, Fut> MethodHandler for FnHandler<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    fn invoke<'a>(&'a self, payload: &'a [u8]) -> HandlerFuture<'a> {
        Box::pin((self.f)(payload.to_vec()))
    }
}

/// Maps method keys to handlers. Built once at startup, then shared
/// read-only with every coordinator instance.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    handlers: HashMap<String, Arc<dyn MethodHandler>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. A second registration for the same key replaces
    /// the first.
    pub fn register<H: MethodHandler>(&mut self, key: impl Into<String>, handler: H) -> &mut Self {
        self.register_arc(key, Arc::new(handler))
    }

    /// Register an already shared handler.
    pub fn register_arc(&mut self, key: impl Into<String>, handler: Arc<dyn MethodHandler>) -> &mut Self {
        let key = key.into();
        if self.handlers.insert(key.clone(), handler).is_some() {
            warn!(method_key = %key, "Replacing previously registered handler");
        } else {
            debug!(method_key = %key, "Registered handler");
        }
        self
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&mut self, key: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        self.register(key, FnHandler { f })
    }

    /// Look up the handler for a method key.
    pub fn resolve(&self, key: &str) -> Result<Arc<dyn MethodHandler>> {
        self.handlers
            .get(key)
            .cloned()
            .ok_or_else(|| DeliveryError::HandlerNotFound(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.handlers.contains_key(key)
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.handlers.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}
