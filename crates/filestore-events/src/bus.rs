//! Event bus contract
//!
//! This module defines the publish/subscribe abstraction shared by every
//! transport. Producers and consumers are written against [`EventBus`] and
//! never learn which transport is active.

use crate::envelope::Envelope;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Event bus error types.
#[derive(Debug, Error)]
pub enum EventBusError {
    /// Topic name is not of the form `<resource>.<action>`
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The active transport could not accept the event
    #[error("Transport error: {0}")]
    Transport(String),

    /// Connection error, raised once the retry budget is exhausted
    #[error("Connection error: {0}")]
    Connection(String),

    /// Bus was closed
    #[error("Event bus is closed")]
    Closed,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Result type for event bus operations.
pub type EventBusResult<T> = Result<T, EventBusError>;

/// Error returned by a failing handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result returned by a handler.
pub type HandlerResult = Result<HandlerOutcome, HandlerError>;

/// What a handler did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The event was acted on
    Processed,
    /// The event was deliberately ignored
    Skipped,
}

/// Event handler trait for processing events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, envelope: &Envelope) -> HandlerResult;
}

/// Handler backed by an async closure. Built with [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as an [`EventHandler`].
///
/// ```rust,no_run
/// use filestore_events::{handler_fn, HandlerOutcome};
///
/// let handler = handler_fn(|envelope| async move {
///     println!("{}", envelope.payload());
///     Ok(HandlerOutcome::Processed)
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, envelope: &Envelope) -> HandlerResult {
        (self.f)(envelope.clone()).await
    }
}

/// Event bus trait for publish/subscribe operations.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Name of the active transport, for diagnostics.
    fn transport(&self) -> &'static str;

    /// Publish `payload` on `topic`.
    ///
    /// Resolves once the transport's delivery guarantee for the call holds:
    /// every handler attempted (in-process) or the broker acknowledged the
    /// write (distributed).
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> EventBusResult<()>;

    /// Register a handler for `topic`.
    async fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) -> EventBusResult<()>;

    /// Stop accepting events, wait for in-flight handlers and release
    /// transport resources. Calling it again is a no-op.
    async fn close(&self) -> EventBusResult<()>;

    /// Get event bus stats.
    async fn stats(&self) -> EventBusStats;
}

/// Event bus statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventBusStats {
    /// Total events published
    pub events_published: u64,
    /// Total successful handler invocations
    pub events_delivered: u64,
    /// Total failed handler invocations
    pub handler_failures: u64,
    /// Active subscriptions
    pub active_subscriptions: usize,
}

/// Lock-free counters behind [`EventBusStats`].
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    published: AtomicU64,
    delivered: AtomicU64,
    failures: AtomicU64,
    subscriptions: AtomicUsize,
}

impl StatsRecorder {
    pub(crate) fn published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn failed(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn subscribed(&self) {
        self.subscriptions.fetch_add(1, Ordering::Relaxed);
    }

    /// Forget every subscription, once the bus dropped its handlers.
    pub(crate) fn clear_subscriptions(&self) {
        self.subscriptions.store(0, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> EventBusStats {
        EventBusStats {
            events_published: self.published.load(Ordering::Relaxed),
            events_delivered: self.delivered.load(Ordering::Relaxed),
            handler_failures: self.failures.load(Ordering::Relaxed),
            active_subscriptions: self.subscriptions.load(Ordering::Relaxed),
        }
    }
}

/// Check that a topic looks like `<resource>.<action>`.
pub fn validate_topic(topic: &str) -> EventBusResult<()> {
    let mut segments = 0;
    for segment in topic.split('.') {
        if segment.is_empty() || segment.chars().any(char::is_whitespace) {
            return Err(EventBusError::InvalidTopic(topic.to_string()));
        }
        segments += 1;
    }
    if segments < 2 {
        return Err(EventBusError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

/// Run a handler behind an error boundary.
///
/// Returned errors and panics both come back as `Err` with a message; nothing
/// escapes to the caller's task.
pub(crate) async fn invoke_isolated(
    handler: &dyn EventHandler,
    envelope: &Envelope,
) -> Result<HandlerOutcome, String> {
    match AssertUnwindSafe(handler.handle(envelope)).catch_unwind().await {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(e)) => Err(e.to_string()),
        Err(panic) => Err(format!("handler panicked: {}", panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
