//! Distributed transport.
//!
//! [`DistributedBus`] sends events through a message broker. Topics are
//! partitioned; events with the same partition key land on the same
//! partition and keep their order. Each `(topic, role)` pair is a consumer
//! group: replicas of one role share the partitions, different roles each
//! receive every event.
//!
//! Delivery to handlers is at-least-once. A record's offset is committed only
//! after every handler of the group processed it; a failure rewinds the
//! consumer so the record is delivered again.
//!
//! # Example
//!
//! ```rust,no_run
//! use filestore_events::{handler_fn, DistributedBus, EventBus, EventBusConfig, HandlerOutcome, MemoryBroker};
//! use std::sync::Arc;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = Arc::new(MemoryBroker::new());
//!     let config = EventBusConfig::default().with_role("thumbnail-workers");
//!     let bus = DistributedBus::new(config, broker);
//!
//!     bus.subscribe("file.uploaded", handler_fn(|envelope| async move {
//!         println!("thumbnail for {}", envelope.payload()["fileId"]);
//!         Ok(HandlerOutcome::Processed)
//!     })).await?;
//!
//!     bus.publish("file.uploaded", serde_json::json!({"fileId": "f1", "userId": "u1"})).await?;
//!     bus.close().await?;
//!     Ok(())
//! }
//! ```

use crate::broker::{
    Broker, BrokerError, BrokerResult, ConsumedRecord, GroupConsumer, OutboundRecord,
};
use crate::bus::{
    invoke_isolated, validate_topic, EventBus, EventBusError, EventBusResult, EventBusStats,
    EventHandler, StatsRecorder,
};
use crate::config::EventBusConfig;
use crate::envelope::Envelope;
use crate::partitioner::Partitioner;
use crate::retry::{with_retry, RetryConfig};
use crate::topics::{default_catalog, TopicRegistry, TopicSpec};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Transport name reported by [`DistributedBus`].
pub const DISTRIBUTED_TRANSPORT: &str = "distributed";

/// Connection state of the distributed transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected; the next publish or subscribe connects.
    Disconnected,
    /// A connection attempt is in progress.
    Connecting,
    /// Connected and topics provisioned.
    Connected,
}

/// Consumer group id for a topic consumed by a service role.
pub fn consumer_group_id(topic: &str, role: &str) -> String {
    format!("{}-{}", topic, role)
}

type HandlerList = Arc<RwLock<Vec<Arc<dyn EventHandler>>>>;

/// A joined consumer group and the task polling it.
struct GroupHandle {
    topic: String,
    handlers: HandlerList,
    task: JoinHandle<Box<dyn GroupConsumer>>,
}

/// Broker-backed event bus.
pub struct DistributedBus {
    broker: Arc<dyn Broker>,
    config: EventBusConfig,
    registry: TopicRegistry,
    partitioner: Partitioner,
    state: RwLock<ConnectionState>,
    /// Serializes connection attempts
    connect_lock: Mutex<()>,
    partition_counts: RwLock<HashMap<String, u32>>,
    groups: Mutex<HashMap<String, GroupHandle>>,
    stats: Arc<StatsRecorder>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for DistributedBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedBus")
            .field("broker", &self.broker.name())
            .field("client_id", &self.config.broker.client_id)
            .field("service_role", &self.config.service_role)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl DistributedBus {
    /// Create a disconnected bus; the first publish or subscribe connects.
    pub fn new(config: EventBusConfig, broker: Arc<dyn Broker>) -> Self {
        let registry = TopicRegistry::new(default_catalog(), config.broker.replication_factor());
        let (shutdown, _) = watch::channel(false);
        Self {
            broker,
            config,
            registry,
            partitioner: Partitioner::new(),
            state: RwLock::new(ConnectionState::Disconnected),
            connect_lock: Mutex::new(()),
            partition_counts: RwLock::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
            stats: Arc::new(StatsRecorder::default()),
            closed: AtomicBool::new(false),
            shutdown,
        }
    }

    /// Replace the required topic catalog.
    pub fn with_catalog(mut self, catalog: Vec<TopicSpec>) -> Self {
        self.registry = TopicRegistry::new(catalog, self.config.broker.replication_factor());
        self
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Topic registry used on connect.
    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    /// Connect to the broker and provision the required topics.
    ///
    /// Idempotent. Concurrent callers wait for the attempt in progress instead
    /// of starting their own. Connection failures are retried with capped
    /// exponential backoff; the error is returned once retries are exhausted.
    /// Provisioning failures other than an unreachable broker are logged and
    /// do not fail the connection.
    ///
    /// # Returns
    ///
    /// `Ok(())` once the bus is [`ConnectionState::Connected`];
    /// `EventBusError::Closed` after [`close`](EventBus::close);
    /// `EventBusError::Connection` if the broker stayed unreachable
    pub async fn connect(&self) -> EventBusResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventBusError::Closed);
        }
        if self.state().await == ConnectionState::Connected {
            return Ok(());
        }

        let _attempt = self.connect_lock.lock().await;
        if self.state().await == ConnectionState::Connected {
            return Ok(());
        }

        *self.state.write().await = ConnectionState::Connecting;
        tracing::info!(
            broker = self.broker.name(),
            brokers = %self.config.broker.bootstrap_servers(),
            client_id = %self.config.broker.client_id,
            "Connecting event bus to broker"
        );

        if let Err(e) = with_retry(&self.config.connect_retry, || self.broker.connect()).await {
            *self.state.write().await = ConnectionState::Disconnected;
            return Err(EventBusError::Connection(e.to_string()));
        }

        match self.registry.provision(self.broker.as_ref()).await {
            Ok(report) => {
                tracing::debug!(created = report.created.len(), existing = report.existing, "Topic provisioning finished");
            }
            Err(BrokerError::Unreachable(msg)) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(EventBusError::Connection(msg));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Topic provisioning failed, continuing");
            }
        }

        self.partition_counts.write().await.clear();
        *self.state.write().await = ConnectionState::Connected;
        tracing::info!(broker = self.broker.name(), "Event bus connected");
        Ok(())
    }

    /// Partition count of `topic`, cached per connection.
    async fn partitions_for(&self, topic: &str) -> BrokerResult<u32> {
        if let Some(count) = self.partition_counts.read().await.get(topic) {
            return Ok(*count);
        }
        let count = self.broker.partition_count(topic).await?;
        self.partition_counts
            .write()
            .await
            .insert(topic.to_string(), count);
        Ok(count)
    }

    async fn mark_disconnected_on(&self, e: &BrokerError) {
        if let BrokerError::Unreachable(_) = e {
            *self.state.write().await = ConnectionState::Disconnected;
        }
    }

    /// Register `handler` for `topic` under an explicit service role.
    ///
    /// The consumer group is `<topic>-<role>`. Handlers sharing a group in
    /// this process are called in registration order for every record.
    pub async fn subscribe_as(
        &self,
        topic: &str,
        role: &str,
        handler: Arc<dyn EventHandler>,
    ) -> EventBusResult<()> {
        validate_topic(topic)?;
        if role.trim().is_empty() {
            return Err(EventBusError::Configuration(
                "service role must not be empty".to_string(),
            ));
        }
        self.connect().await?;

        let group_id = consumer_group_id(topic, role);
        let mut groups = self.groups.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventBusError::Closed);
        }

        if let Some(existing) = groups.get(&group_id) {
            existing.handlers.write().await.push(handler);
            self.stats.subscribed();
            tracing::debug!(topic = %topic, group_id = %group_id, "Handler added to existing consumer group");
            return Ok(());
        }

        let consumer = match self.broker.join_group(&group_id, topic).await {
            Ok(consumer) => consumer,
            Err(e) => {
                self.mark_disconnected_on(&e).await;
                return Err(e.into());
            }
        };

        let handlers: HandlerList = Arc::new(RwLock::new(vec![handler]));
        let runner = GroupRunner {
            consumer,
            handlers: handlers.clone(),
            pending: HashMap::new(),
            stats: self.stats.clone(),
            shutdown: self.shutdown.subscribe(),
            poll_timeout: self.config.poll_timeout,
            redelivery: self.config.redelivery_backoff.clone(),
        };
        let task = tokio::spawn(runner.run());

        groups.insert(
            group_id.clone(),
            GroupHandle {
                topic: topic.to_string(),
                handlers,
                task,
            },
        );
        self.stats.subscribed();

        tracing::info!(topic = %topic, group_id = %group_id, "Joined consumer group");
        Ok(())
    }
}

#[async_trait]
impl EventBus for DistributedBus {
    fn transport(&self) -> &'static str {
        DISTRIBUTED_TRANSPORT
    }

    async fn publish(&self, topic: &str, payload: serde_json::Value) -> EventBusResult<()> {
        validate_topic(topic)?;
        self.connect().await?;

        let envelope = Envelope::stamp(topic, payload, self.config.broker.client_id.clone());
        let partitions = match self.partitions_for(topic).await {
            Ok(count) => count,
            Err(e) => {
                self.mark_disconnected_on(&e).await;
                tracing::warn!(topic = %topic, error = %e, "Cannot resolve topic partitions");
                return Err(EventBusError::Transport(e.to_string()));
            }
        };
        let partition = self
            .partitioner
            .partition(envelope.partition_key(), partitions);
        let bytes = envelope
            .encode()
            .map_err(|e| EventBusError::Serialization(e.to_string()))?;

        let record = OutboundRecord {
            topic: topic.to_string(),
            partition,
            key: envelope.partition_key().map(str::to_string),
            payload: bytes,
        };

        match self.broker.send(record).await {
            Ok(metadata) => {
                self.stats.published();
                tracing::debug!(
                    topic = %topic,
                    event_id = %envelope.id(),
                    partition = metadata.partition,
                    offset = metadata.offset,
                    "Event published to broker"
                );
                Ok(())
            }
            Err(e) => {
                self.mark_disconnected_on(&e).await;
                tracing::warn!(topic = %topic, event_id = %envelope.id(), error = %e, "Publish failed");
                Err(EventBusError::Transport(e.to_string()))
            }
        }
    }

    async fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) -> EventBusResult<()> {
        let role = self.config.service_role.clone();
        self.subscribe_as(topic, &role, handler).await
    }

    /// Shut down in order: stop polling, let in-flight handlers finish and
    /// commit, flush the producer, then leave every consumer group.
    async fn close(&self) -> EventBusResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!("Closing distributed event bus");
        self.shutdown.send_replace(true);

        let handles: Vec<(String, GroupHandle)> = self.groups.lock().await.drain().collect();
        let mut consumers = Vec::with_capacity(handles.len());
        for (group_id, handle) in handles {
            match handle.task.await {
                Ok(consumer) => consumers.push(consumer),
                Err(e) => {
                    tracing::error!(group_id = %group_id, topic = %handle.topic, error = %e, "Consumer task failed during shutdown");
                }
            }
        }

        if self.state().await == ConnectionState::Connected {
            if let Err(e) = self.broker.flush().await {
                tracing::error!(error = %e, "Producer flush failed during shutdown");
            }
        }

        for consumer in consumers {
            let group_id = consumer.group_id().to_string();
            if let Err(e) = consumer.leave().await {
                tracing::error!(group_id = %group_id, error = %e, "Leaving consumer group failed during shutdown");
            }
        }

        self.stats.clear_subscriptions();
        *self.state.write().await = ConnectionState::Disconnected;
        tracing::info!("Distributed event bus closed");
        Ok(())
    }

    async fn stats(&self) -> EventBusStats {
        self.stats.snapshot()
    }
}

impl Drop for DistributedBus {
    fn drop(&mut self) {
        // Runners stop and drop their consumers, releasing group membership.
        self.shutdown.send_replace(true);
    }
}

/// Handlers that already processed a record awaiting redelivery.
#[derive(Debug)]
struct PendingRecord {
    offset: u64,
    succeeded: HashSet<usize>,
}

/// Polls one group membership and feeds records to its handlers.
struct GroupRunner {
    consumer: Box<dyn GroupConsumer>,
    handlers: HandlerList,
    /// partition -> record withheld after a handler failure
    pending: HashMap<u32, PendingRecord>,
    stats: Arc<StatsRecorder>,
    shutdown: watch::Receiver<bool>,
    poll_timeout: Duration,
    redelivery: RetryConfig,
}

impl GroupRunner {
    /// Run until shutdown and hand the consumer back for an orderly leave.
    async fn run(mut self) -> Box<dyn GroupConsumer> {
        let group_id = self.consumer.group_id().to_string();
        let mut failures: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let polled = tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                polled = self.consumer.poll(self.poll_timeout) => polled,
            };

            // Once a record is in hand it is processed to completion, even if
            // shutdown is signalled meanwhile.
            let delay = match polled {
                Ok(Some(record)) => {
                    if self.process(&group_id, &record).await {
                        failures = 0;
                        continue;
                    }
                    failures = failures.saturating_add(1);
                    self.redelivery.delay_for(failures)
                }
                Ok(None) => continue,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    tracing::warn!(group_id = %group_id, error = %e, "Poll failed");
                    self.redelivery.delay_for(failures)
                }
            };

            tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::debug!(group_id = %group_id, "Consumer stopped polling");
        self.consumer
    }

    /// Deliver one record to every handler. Returns whether it was committed.
    ///
    /// On redelivery only the handlers that have not yet processed the record
    /// are invoked again.
    async fn process(&mut self, group_id: &str, record: &ConsumedRecord) -> bool {
        let envelope = match Envelope::decode(&record.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Can never succeed; skip it rather than block the partition.
                tracing::error!(
                    group_id = %group_id,
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Undecodable record skipped"
                );
                self.commit(group_id, record).await;
                return true;
            }
        };

        let handlers = self.handlers.read().await.clone();
        let mut succeeded = match self.pending.remove(&record.partition) {
            Some(pending) if pending.offset == record.offset => pending.succeeded,
            _ => HashSet::new(),
        };
        let mut failed = false;
        for (index, handler) in handlers.iter().enumerate() {
            if succeeded.contains(&index) {
                continue;
            }
            match invoke_isolated(handler.as_ref(), &envelope).await {
                Ok(_) => {
                    succeeded.insert(index);
                    self.stats.delivered();
                }
                Err(error) => {
                    failed = true;
                    self.stats.failed();
                    tracing::warn!(
                        group_id = %group_id,
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        event_id = %envelope.id(),
                        handler = index,
                        payload = %envelope.payload(),
                        error = %error,
                        "Event handler failed, offset withheld"
                    );
                }
            }
        }

        if failed {
            self.pending.insert(
                record.partition,
                PendingRecord {
                    offset: record.offset,
                    succeeded,
                },
            );
            if let Err(e) = self.consumer.rewind(record).await {
                tracing::warn!(group_id = %group_id, partition = record.partition, error = %e, "Rewind failed");
            }
            return false;
        }

        self.commit(group_id, record).await;
        true
    }

    async fn commit(&mut self, group_id: &str, record: &ConsumedRecord) {
        if let Err(e) = self.consumer.commit(record).await {
            tracing::warn!(
                group_id = %group_id,
                partition = record.partition,
                offset = record.offset,
                error = %e,
                "Offset commit failed, record may be redelivered"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::bus::{handler_fn, HandlerOutcome};
    use serde_json::json;

    fn test_config() -> EventBusConfig {
        let mut config = EventBusConfig::default().with_role("test-workers");
        config.broker.client_id = "test-client".to_string();
        config.poll_timeout = Duration::from_millis(20);
        config.connect_retry = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            exponential_base: 2.0,
        };
        config
    }

    #[test]
    fn test_consumer_group_id() {
        assert_eq!(
            consumer_group_id("file.uploaded", "thumbnail-workers"),
            "file.uploaded-thumbnail-workers"
        );
    }

    #[tokio::test]
    async fn test_starts_disconnected_and_connects_lazily() {
        let broker = Arc::new(MemoryBroker::new());
        let bus = DistributedBus::new(test_config(), broker.clone());
        assert_eq!(bus.state().await, ConnectionState::Disconnected);
        assert_eq!(broker.connect_attempts(), 0);

        bus.publish("file.uploaded", json!({"fileId": "f1"})).await.unwrap();
        assert_eq!(bus.state().await, ConnectionState::Connected);
        assert_eq!(broker.topic_names().len(), 8);
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_attempt() {
        let broker = Arc::new(MemoryBroker::new());
        let bus = Arc::new(DistributedBus::new(test_config(), broker.clone()));

        let attempts: Vec<_> = (0..5)
            .map(|_| {
                let bus = bus.clone();
                tokio::spawn(async move { bus.connect().await })
            })
            .collect();
        for attempt in attempts {
            attempt.await.unwrap().unwrap();
        }

        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(broker.create_topic_requests(), 1);
    }

    #[tokio::test]
    async fn test_connect_retries_then_succeeds() {
        let broker = Arc::new(MemoryBroker::new());
        broker.fail_next_connects(2);
        let bus = DistributedBus::new(test_config(), broker.clone());

        bus.connect().await.unwrap();
        assert_eq!(broker.connect_attempts(), 3);
        assert_eq!(bus.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces_after_retries() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_reachable(false);
        let bus = DistributedBus::new(test_config(), broker.clone());

        let err = bus.publish("file.uploaded", json!({})).await.unwrap_err();
        assert!(matches!(err, EventBusError::Connection(_)));
        assert_eq!(broker.connect_attempts(), 3);
        assert_eq!(bus.state().await, ConnectionState::Disconnected);

        broker.set_reachable(true);
        bus.publish("file.uploaded", json!({})).await.unwrap();
        assert_eq!(bus.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_connect_after_lost_creation_race() {
        let broker = Arc::new(MemoryBroker::new());
        broker.race_next_create();
        let bus = DistributedBus::new(test_config(), broker.clone());

        bus.connect().await.unwrap();
        assert_eq!(bus.state().await, ConnectionState::Connected);
        assert_eq!(broker.topic_names().len(), 8);
    }

    #[tokio::test]
    async fn test_connect_survives_rejected_topic() {
        let broker = Arc::new(MemoryBroker::new());
        let bus = DistributedBus::new(test_config(), broker.clone())
            .with_catalog(vec![TopicSpec::new("file.uploaded", 0)]);

        bus.connect().await.unwrap();
        assert_eq!(bus.state().await, ConnectionState::Connected);
        assert!(broker.topic_names().is_empty());
    }

    #[tokio::test]
    async fn test_publish_fails_when_broker_drops() {
        let broker = Arc::new(MemoryBroker::new());
        let bus = DistributedBus::new(test_config(), broker.clone());
        bus.connect().await.unwrap();

        broker.set_reachable(false);
        let err = bus.publish("file.uploaded", json!({})).await.unwrap_err();
        assert!(matches!(err, EventBusError::Transport(_)));
        assert_eq!(bus.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_keyed_events_share_a_partition() {
        let broker = Arc::new(MemoryBroker::new());
        let bus = DistributedBus::new(test_config(), broker.clone());

        for i in 0..5 {
            bus.publish("file.uploaded", json!({"fileId": i, "userId": "u-42"}))
                .await
                .unwrap();
        }

        let expected = Partitioner::new().partition(Some("u-42"), 6);
        assert_eq!(broker.partition_len("file.uploaded", expected), 5);
        assert_eq!(
            broker.partition_keys("file.uploaded", expected),
            vec![Some("u-42".to_string()); 5]
        );
    }

    #[tokio::test]
    async fn test_unkeyed_events_spread_round_robin() {
        let broker = Arc::new(MemoryBroker::new());
        let bus = DistributedBus::new(test_config(), broker.clone());

        for i in 0..6 {
            bus.publish("file.uploaded", json!({"fileId": i})).await.unwrap();
        }
        for partition in 0..6 {
            assert_eq!(broker.partition_len("file.uploaded", partition), 1);
        }
    }

    #[tokio::test]
    async fn test_unknown_topic_is_a_transport_error() {
        let broker = Arc::new(MemoryBroker::new());
        let bus = DistributedBus::new(test_config(), broker);

        let err = bus.publish("file.renamed", json!({})).await.unwrap_err();
        assert!(matches!(err, EventBusError::Transport(_)));
    }

    #[tokio::test]
    async fn test_subscribe_rejects_empty_role() {
        let broker = Arc::new(MemoryBroker::new());
        let bus = DistributedBus::new(test_config(), broker);
        let handler = handler_fn(|_| async { Ok(HandlerOutcome::Processed) });

        let err = bus.subscribe_as("file.uploaded", " ", handler).await.unwrap_err();
        assert!(matches!(err, EventBusError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let broker = Arc::new(MemoryBroker::new());
        let bus = DistributedBus::new(test_config(), broker.clone());
        bus.subscribe("file.uploaded", handler_fn(|_| async { Ok(HandlerOutcome::Processed) }))
            .await
            .unwrap();
        assert_eq!(broker.groups_for_topic("file.uploaded").len(), 1);
        assert_eq!(bus.stats().await.active_subscriptions, 1);

        bus.close().await.unwrap();
        bus.close().await.unwrap();

        assert_eq!(bus.stats().await.active_subscriptions, 0);

        assert_eq!(broker.flushes(), 1);
        assert!(broker.groups_for_topic("file.uploaded").is_empty());
        assert_eq!(bus.state().await, ConnectionState::Disconnected);
        assert!(matches!(
            bus.publish("file.uploaded", json!({})).await,
            Err(EventBusError::Closed)
        ));
    }
}
