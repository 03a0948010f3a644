//! Broker client abstraction.
//!
//! The distributed transport talks to its message broker through [`Broker`]
//! and [`GroupConsumer`]. Partition choice, commit timing and shutdown order
//! live in the transport; implementations only move bytes and track group
//! membership.
//!
//! Implementations:
//! - [`MemoryBroker`]: complete in-process broker, used for tests and
//!   single-host development
//! - `KafkaBroker` (feature `kafka`): Kafka via librdkafka

use crate::bus::EventBusError;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;

pub use memory::MemoryBroker;

#[cfg(feature = "kafka")]
pub use kafka::KafkaBroker;

/// Broker error types.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// Broker could not be reached
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    /// Topic does not exist
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    /// Topic already exists
    #[error("Topic already exists: {0}")]
    TopicAlreadyExists(String),

    /// Partition does not exist on the topic
    #[error("Unknown partition {partition} on topic {topic}")]
    UnknownPartition {
        /// Topic name
        topic: String,
        /// Requested partition
        partition: u32,
    },

    /// Consumer is no longer a member of its group
    #[error("Consumer is not a member of group {0}")]
    NotMember(String),

    /// Commit for a partition the consumer no longer owns
    #[error("Partition {partition} is not assigned to this member of group {group_id}")]
    NotAssigned {
        /// Consumer group
        group_id: String,
        /// Partition
        partition: u32,
    },

    /// Error reported by the underlying client library
    #[error("Broker client error: {0}")]
    Client(String),
}

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

impl From<BrokerError> for EventBusError {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::Unreachable(msg) => EventBusError::Connection(msg),
            other => EventBusError::Transport(other.to_string()),
        }
    }
}

/// Topic creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTopic {
    /// Topic name
    pub name: String,
    /// Number of partitions
    pub partitions: u32,
    /// Replication factor
    pub replication_factor: i16,
}

/// Record handed to the broker by the producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    /// Target topic
    pub topic: String,
    /// Target partition, already chosen by the transport
    pub partition: u32,
    /// Optional record key
    pub key: Option<String>,
    /// Serialized envelope
    pub payload: Vec<u8>,
}

/// Broker acknowledgment for a produced record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMetadata {
    /// Partition the record was written to
    pub partition: u32,
    /// Offset of the record in its partition
    pub offset: u64,
}

/// Record fetched by a group consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    /// Source topic
    pub topic: String,
    /// Source partition
    pub partition: u32,
    /// Offset within the partition
    pub offset: u64,
    /// Optional record key
    pub key: Option<String>,
    /// Serialized envelope
    pub payload: Vec<u8>,
}

/// Connection to a message broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Short name of the broker implementation.
    fn name(&self) -> &'static str;

    /// Establish (or verify) connectivity.
    async fn connect(&self) -> BrokerResult<()>;

    /// List the names of existing topics.
    async fn list_topics(&self) -> BrokerResult<Vec<String>>;

    /// Create topics in a single request.
    async fn create_topics(&self, topics: &[NewTopic]) -> BrokerResult<()>;

    /// Number of partitions of an existing topic.
    async fn partition_count(&self, topic: &str) -> BrokerResult<u32>;

    /// Write a record and wait for the broker's acknowledgment.
    async fn send(&self, record: OutboundRecord) -> BrokerResult<RecordMetadata>;

    /// Flush buffered records and disconnect the producer.
    async fn flush(&self) -> BrokerResult<()>;

    /// Join `group_id` as a new member consuming `topic`.
    async fn join_group(&self, group_id: &str, topic: &str) -> BrokerResult<Box<dyn GroupConsumer>>;
}

/// One member of a consumer group.
///
/// Partition ownership is decided by the broker; [`GroupConsumer::poll`]
/// only returns records from partitions this member currently owns, one
/// partition's records in offset order.
#[async_trait]
pub trait GroupConsumer: Send {
    /// Consumer group id.
    fn group_id(&self) -> &str;

    /// Wait up to `timeout` for the next record.
    async fn poll(&mut self, timeout: Duration) -> BrokerResult<Option<ConsumedRecord>>;

    /// Mark `record` as processed for the group.
    async fn commit(&mut self, record: &ConsumedRecord) -> BrokerResult<()>;

    /// Rewind so `record` is returned again by the next poll.
    async fn rewind(&mut self, record: &ConsumedRecord) -> BrokerResult<()>;

    /// Partitions currently owned by this member.
    fn assignment(&self) -> Vec<u32>;

    /// Leave the group, releasing owned partitions.
    async fn leave(self: Box<Self>) -> BrokerResult<()>;
}
