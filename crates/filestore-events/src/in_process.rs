//! In-process transport.
//!
//! Delivers each event to every handler registered for its topic, one after
//! another in registration order, inside the publishing task. Nothing is
//! persisted: an event published while no handler is registered is dropped.

use crate::bus::{
    invoke_isolated, validate_topic, EventBus, EventBusError, EventBusResult, EventBusStats,
    EventHandler, HandlerOutcome, StatsRecorder,
};
use crate::envelope::Envelope;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use uuid::Uuid;

/// Source tag stamped on envelopes by this transport.
pub const IN_PROCESS_SOURCE: &str = "in-process";

/// A handler invocation that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    /// Registration index of the handler on its topic
    pub index: usize,
    /// Error message
    pub error: String,
}

/// Per-handler results of one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    /// Id of the dispatched envelope
    pub event_id: Uuid,
    /// Handlers attempted
    pub attempted: usize,
    /// Handlers that processed the event
    pub processed: usize,
    /// Handlers that skipped the event
    pub skipped: usize,
    /// Handlers that failed
    pub failures: Vec<HandlerFailure>,
}

/// Counts running dispatches so `close` can wait for them.
#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

struct InFlightGuard<'a>(&'a InFlight);

impl InFlight {
    fn enter(&self) -> InFlightGuard<'_> {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(self)
    }

    async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// In-process event bus.
///
/// Suitable for single-process (monolith) deployments and for tests.
pub struct InProcessBus {
    /// Handlers by topic, in registration order
    handlers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
    stats: StatsRecorder,
    closed: AtomicBool,
    in_flight: InFlight,
}

impl std::fmt::Debug for InProcessBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessBus")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("in_flight", &self.in_flight.count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessBus {
    /// Create a new in-process event bus.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            stats: StatsRecorder::default(),
            closed: AtomicBool::new(false),
            in_flight: InFlight::default(),
        }
    }

    /// Number of handlers registered for `topic`.
    pub async fn handler_count(&self, topic: &str) -> usize {
        self.handlers.read().await.get(topic).map_or(0, Vec::len)
    }

    /// Publish and report what every handler did with the event.
    ///
    /// Handlers registered when the call starts are invoked in registration
    /// order, each awaited before the next. A failing or panicking handler is
    /// logged and recorded; the remaining handlers still run.
    pub async fn dispatch(
        &self,
        topic: &str,
        payload: serde_json::Value,
    ) -> EventBusResult<DispatchReport> {
        validate_topic(topic)?;

        let _guard = self.in_flight.enter();
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventBusError::Closed);
        }

        let envelope = Envelope::stamp(topic, payload, IN_PROCESS_SOURCE);
        self.stats.published();

        // Snapshot, so handlers may publish or subscribe without deadlocking.
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .await
            .get(topic)
            .cloned()
            .unwrap_or_default();

        let mut report = DispatchReport {
            event_id: envelope.id(),
            attempted: handlers.len(),
            processed: 0,
            skipped: 0,
            failures: Vec::new(),
        };

        if handlers.is_empty() {
            tracing::debug!(topic = %topic, event_id = %envelope.id(), "No handlers registered, event dropped");
            return Ok(report);
        }

        for (index, handler) in handlers.iter().enumerate() {
            match invoke_isolated(handler.as_ref(), &envelope).await {
                Ok(HandlerOutcome::Processed) => {
                    report.processed += 1;
                    self.stats.delivered();
                }
                Ok(HandlerOutcome::Skipped) => {
                    report.skipped += 1;
                    self.stats.delivered();
                }
                Err(error) => {
                    tracing::warn!(
                        topic = %topic,
                        event_id = %envelope.id(),
                        handler = index,
                        payload = %envelope.payload(),
                        error = %error,
                        "Event handler failed"
                    );
                    self.stats.failed();
                    report.failures.push(HandlerFailure { index, error });
                }
            }
        }

        tracing::debug!(
            topic = %topic,
            event_id = %envelope.id(),
            handlers = report.attempted,
            failures = report.failures.len(),
            "Event dispatched in-process"
        );

        Ok(report)
    }
}

#[async_trait]
impl EventBus for InProcessBus {
    fn transport(&self) -> &'static str {
        IN_PROCESS_SOURCE
    }

    async fn publish(&self, topic: &str, payload: serde_json::Value) -> EventBusResult<()> {
        self.dispatch(topic, payload).await.map(|_| ())
    }

    async fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) -> EventBusResult<()> {
        validate_topic(topic)?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventBusError::Closed);
        }

        self.handlers
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(handler);
        self.stats.subscribed();

        tracing::debug!(topic = %topic, "Handler registered in-process");
        Ok(())
    }

    async fn close(&self) -> EventBusResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!("Closing in-process event bus");
        self.in_flight.wait_idle().await;
        self.handlers.write().await.clear();
        self.stats.clear_subscriptions();
        tracing::info!("In-process event bus closed");
        Ok(())
    }

    async fn stats(&self) -> EventBusStats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{handler_fn, HandlerError};
    use serde_json::json;
    use std::sync::Mutex;

    fn recorder(log: Arc<Mutex<Vec<String>>>, name: &'static str) -> Arc<dyn EventHandler> {
        handler_fn(move |envelope| {
            let log = log.clone();
            async move {
                let file_id = envelope.payload()["fileId"].as_str().unwrap_or_default().to_string();
                log.lock().unwrap().push(format!("{}:{}", name, file_id));
                Ok(HandlerOutcome::Processed)
            }
        })
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let bus = InProcessBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe("file.uploaded", recorder(log.clone(), "first")).await.unwrap();
        bus.subscribe("file.uploaded", recorder(log.clone(), "second")).await.unwrap();
        bus.subscribe("file.deleted", recorder(log.clone(), "other")).await.unwrap();

        bus.publish("file.uploaded", json!({"fileId": "f1"})).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["first:f1", "second:f1"]);
    }

    #[tokio::test]
    async fn test_dispatch_report() {
        let bus = InProcessBus::new();
        bus.subscribe("file.uploaded", handler_fn(|_| async { Ok(HandlerOutcome::Processed) }))
            .await
            .unwrap();
        bus.subscribe("file.uploaded", handler_fn(|_| async { Ok(HandlerOutcome::Skipped) }))
            .await
            .unwrap();
        bus.subscribe(
            "file.uploaded",
            handler_fn(|_| async { Err(HandlerError::from("quota exceeded")) }),
        )
        .await
        .unwrap();

        let report = bus.dispatch("file.uploaded", json!({})).await.unwrap();
        assert_eq!(report.attempted, 3);
        assert_eq!(report.processed, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(
            report.failures,
            vec![HandlerFailure {
                index: 2,
                error: "quota exceeded".to_string()
            }]
        );

        let stats = bus.stats().await;
        assert_eq!(stats.events_published, 1);
        assert_eq!(stats.events_delivered, 2);
        assert_eq!(stats.handler_failures, 1);
        assert_eq!(stats.active_subscriptions, 3);
    }

    #[tokio::test]
    async fn test_event_without_handlers_is_dropped() {
        let bus = InProcessBus::new();
        let report = bus.dispatch("folder.created", json!({"folderId": "d1"})).await.unwrap();
        assert_eq!(report.attempted, 0);

        // a late subscriber does not see the dropped event
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("folder.created", recorder(log.clone(), "late")).await.unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_topic_rejected() {
        let bus = InProcessBus::new();
        assert!(matches!(
            bus.publish("uploaded", json!({})).await,
            Err(EventBusError::InvalidTopic(_))
        ));
        assert!(matches!(
            bus.subscribe("", handler_fn(|_| async { Ok(HandlerOutcome::Processed) })).await,
            Err(EventBusError::InvalidTopic(_))
        ));
    }

    #[tokio::test]
    async fn test_handler_may_publish() {
        let bus = Arc::new(InProcessBus::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let inner = bus.clone();
        bus.subscribe(
            "file.uploaded",
            handler_fn(move |envelope| {
                let bus = inner.clone();
                async move {
                    bus.publish("file.updated", envelope.payload().clone())
                        .await
                        .map(|_| HandlerOutcome::Processed)
                        .map_err(HandlerError::from)
                }
            }),
        )
        .await
        .unwrap();
        bus.subscribe("file.updated", recorder(log.clone(), "updated")).await.unwrap();

        bus.publish("file.uploaded", json!({"fileId": "f2"})).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["updated:f2"]);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_publish() {
        let bus = InProcessBus::new();
        bus.subscribe("file.uploaded", handler_fn(|_| async { Ok(HandlerOutcome::Processed) }))
            .await
            .unwrap();
        assert_eq!(bus.stats().await.active_subscriptions, 1);

        bus.close().await.unwrap();
        assert_eq!(bus.stats().await.active_subscriptions, 0);
        assert_eq!(bus.handler_count("file.uploaded").await, 0);
        bus.close().await.unwrap();

        assert!(matches!(
            bus.publish("file.uploaded", json!({})).await,
            Err(EventBusError::Closed)
        ));
        assert!(matches!(
            bus.subscribe("file.uploaded", handler_fn(|_| async { Ok(HandlerOutcome::Processed) }))
                .await,
            Err(EventBusError::Closed)
        ));
    }
}
