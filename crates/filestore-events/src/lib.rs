//! # Filestore Events
//!
//! Event bus for the Filestore application. File and folder lifecycle events
//! (`file.uploaded`, `folder.deleted`, ...) are published by the API and
//! consumed by background work such as thumbnailing, search indexing and
//! quota accounting.
//!
//! ## Overview
//!
//! The filestore-events crate handles:
//! - **Envelopes**: Every event is wrapped with an id, topic, timestamp,
//!   source and partition key
//! - **Event Bus**: One publish/subscribe contract, two transports
//! - **Topic Provisioning**: The required topics are created on connect
//! - **Delivery**: Per-key ordering and at-least-once handler delivery on
//!   the distributed transport
//!
//! ## Features
//!
//! - `distributed` (default): [`DistributedBus`], the broker abstraction and
//!   the in-process [`MemoryBroker`]
//! - `kafka`: `KafkaBroker`, a Kafka client built on librdkafka
//!
//! ## Deployment Modes
//!
//! - `monolith`: [`InProcessBus`], handlers run in the publishing process
//! - `microservices`: [`DistributedBus`], events go through the broker and
//!   each service role consumes them as its own consumer group
//!
//! The mode comes from `DEPLOYMENT_MODE`; see [`EventBusConfig::from_env`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use filestore_events::{handler_fn, EventBusConfig, EventBusFactory, HandlerOutcome};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let factory = EventBusFactory::new(EventBusConfig::from_env()?);
//!     let bus = factory.get().await?;
//!
//!     bus.subscribe("file.uploaded", handler_fn(|envelope| async move {
//!         println!("uploaded {} at {}", envelope.payload()["fileId"], envelope.timestamp());
//!         Ok(HandlerOutcome::Processed)
//!     })).await?;
//!
//!     bus.publish("file.uploaded", serde_json::json!({
//!         "fileId": "f-1",
//!         "userId": "u-1",
//!         "size": 2048
//!     })).await?;
//!
//!     factory.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Topics
//!
//! Topics are named `<resource>.<action>`. Events whose payload carries a
//! `userId` (or `ownerId`) are keyed by it, so one user's events stay in
//! order on the distributed transport.

pub mod bus;
pub mod config;
pub mod envelope;
pub mod factory;
pub mod in_process;
pub mod retry;

#[cfg(feature = "distributed")]
pub mod broker;
#[cfg(feature = "distributed")]
pub mod distributed;
#[cfg(feature = "distributed")]
pub mod partitioner;
#[cfg(feature = "distributed")]
pub mod topics;

// Re-export main types
pub use bus::{
    handler_fn, validate_topic, EventBus, EventBusError, EventBusResult, EventBusStats,
    EventHandler, FnHandler, HandlerError, HandlerOutcome, HandlerResult,
};
pub use config::{BrokerConfig, ConfigError, Credentials, DeploymentMode, EventBusConfig};
pub use envelope::{derive_partition_key, Envelope, PARTITION_KEY_FIELDS};
pub use factory::EventBusFactory;
pub use in_process::{DispatchReport, HandlerFailure, InProcessBus};
pub use retry::RetryConfig;

#[cfg(feature = "distributed")]
pub use broker::{Broker, BrokerError, GroupConsumer, MemoryBroker};
#[cfg(feature = "distributed")]
pub use distributed::{consumer_group_id, ConnectionState, DistributedBus};
#[cfg(feature = "distributed")]
pub use topics::{default_catalog, TopicRegistry, TopicSpec};

#[cfg(feature = "kafka")]
pub use broker::KafkaBroker;
