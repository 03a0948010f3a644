//! Kafka broker via librdkafka.
//!
//! Offsets are committed manually (`enable.auto.commit=false`) so the
//! distributed transport decides when a record counts as processed. New
//! groups start from the earliest retained offset.

use super::{
    Broker, BrokerError, BrokerResult, ConsumedRecord, GroupConsumer, NewTopic, OutboundRecord,
    RecordMetadata,
};
use crate::config::BrokerConfig;
use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic as KafkaNewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;

impl From<KafkaError> for BrokerError {
    fn from(e: KafkaError) -> Self {
        match e.rdkafka_error_code() {
            Some(
                RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::BrokerNotAvailable
                | RDKafkaErrorCode::MessageTimedOut
                | RDKafkaErrorCode::OperationTimedOut,
            ) => BrokerError::Unreachable(e.to_string()),
            Some(RDKafkaErrorCode::UnknownTopicOrPartition | RDKafkaErrorCode::UnknownTopic) => {
                BrokerError::UnknownTopic(e.to_string())
            }
            _ => BrokerError::Client(e.to_string()),
        }
    }
}

/// Kafka-backed [`Broker`].
pub struct KafkaBroker {
    config: BrokerConfig,
    producer: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
}

impl std::fmt::Debug for KafkaBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaBroker")
            .field("brokers", &self.config.brokers)
            .field("client_id", &self.config.client_id)
            .finish()
    }
}

impl KafkaBroker {
    /// Create the producer and admin clients. No connection is made yet.
    pub fn new(config: BrokerConfig) -> BrokerResult<Self> {
        let producer: FutureProducer = base_client_config(&config)
            .set("message.timeout.ms", config.request_timeout_ms.to_string())
            .create()?;
        let admin: AdminClient<DefaultClientContext> = base_client_config(&config).create()?;

        tracing::debug!(brokers = %config.bootstrap_servers(), "Kafka clients created");

        Ok(Self {
            config,
            producer,
            admin,
        })
    }

    /// Fetch cluster metadata on a blocking thread.
    async fn metadata(&self, topic: Option<String>) -> BrokerResult<Vec<(String, u32)>> {
        let producer = self.producer.clone();
        let timeout = self.config.request_timeout();

        let topics = tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(topic.as_deref(), timeout)
                .map(|metadata| {
                    metadata
                        .topics()
                        .iter()
                        .filter(|t| t.error().is_none())
                        .map(|t| (t.name().to_string(), t.partitions().len() as u32))
                        .collect::<Vec<_>>()
                })
        })
        .await
        .map_err(|e| BrokerError::Client(e.to_string()))??;

        Ok(topics)
    }
}

fn base_client_config(config: &BrokerConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.bootstrap_servers())
        .set("client.id", &config.client_id)
        .set("socket.timeout.ms", config.request_timeout_ms.to_string());

    if let Some(credentials) = &config.credentials {
        client
            .set("security.protocol", "SASL_SSL")
            .set("sasl.mechanisms", "PLAIN")
            .set("sasl.username", &credentials.username)
            .set("sasl.password", &credentials.password);
    }

    client
}

#[async_trait]
impl Broker for KafkaBroker {
    fn name(&self) -> &'static str {
        "kafka"
    }

    async fn connect(&self) -> BrokerResult<()> {
        let topics = self.metadata(None).await?;
        tracing::debug!(topics = topics.len(), "Kafka cluster reachable");
        Ok(())
    }

    async fn list_topics(&self) -> BrokerResult<Vec<String>> {
        Ok(self
            .metadata(None)
            .await?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    async fn create_topics(&self, topics: &[NewTopic]) -> BrokerResult<()> {
        let requests: Vec<KafkaNewTopic<'_>> = topics
            .iter()
            .map(|t| {
                KafkaNewTopic::new(
                    &t.name,
                    t.partitions as i32,
                    TopicReplication::Fixed(i32::from(t.replication_factor)),
                )
            })
            .collect();
        let options = AdminOptions::new().operation_timeout(Some(self.config.request_timeout()));

        let results = self.admin.create_topics(&requests, &options).await?;
        for result in results {
            match result {
                Ok(_) => {}
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    return Err(BrokerError::TopicAlreadyExists(name));
                }
                Err((name, code)) => {
                    return Err(BrokerError::Client(format!(
                        "creating topic {} failed: {}",
                        name, code
                    )));
                }
            }
        }
        Ok(())
    }

    async fn partition_count(&self, topic: &str) -> BrokerResult<u32> {
        self.metadata(Some(topic.to_string()))
            .await?
            .into_iter()
            .find(|(name, partitions)| name == topic && *partitions > 0)
            .map(|(_, partitions)| partitions)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))
    }

    async fn send(&self, record: OutboundRecord) -> BrokerResult<RecordMetadata> {
        let mut outbound = FutureRecord::<str, [u8]>::to(&record.topic)
            .partition(record.partition as i32)
            .payload(&record.payload);
        if let Some(key) = &record.key {
            outbound = outbound.key(key.as_str());
        }

        let (partition, offset) = self
            .producer
            .send(outbound, Timeout::After(self.config.request_timeout()))
            .await
            .map_err(|(e, _)| BrokerError::from(e))?;

        Ok(RecordMetadata {
            partition: partition as u32,
            offset: offset as u64,
        })
    }

    async fn flush(&self) -> BrokerResult<()> {
        let producer = self.producer.clone();
        let timeout = self.config.request_timeout();
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| BrokerError::Client(e.to_string()))??;
        Ok(())
    }

    async fn join_group(&self, group_id: &str, topic: &str) -> BrokerResult<Box<dyn GroupConsumer>> {
        let consumer: StreamConsumer = base_client_config(&self.config)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("partition.assignment.strategy", "range")
            .create()?;
        consumer.subscribe(&[topic])?;

        tracing::debug!(group_id = %group_id, topic = %topic, "Kafka consumer subscribed");

        Ok(Box::new(KafkaGroupConsumer {
            consumer: Arc::new(consumer),
            group_id: group_id.to_string(),
            request_timeout: self.config.request_timeout(),
        }))
    }
}

/// Group member backed by a librdkafka consumer.
pub struct KafkaGroupConsumer {
    consumer: Arc<StreamConsumer>,
    group_id: String,
    request_timeout: Duration,
}

#[async_trait]
impl GroupConsumer for KafkaGroupConsumer {
    fn group_id(&self) -> &str {
        &self.group_id
    }

    async fn poll(&mut self, timeout: Duration) -> BrokerResult<Option<ConsumedRecord>> {
        let message = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => return Ok(None),
            Ok(message) => message?,
        };

        Ok(Some(ConsumedRecord {
            topic: message.topic().to_string(),
            partition: message.partition() as u32,
            offset: message.offset() as u64,
            key: message
                .key()
                .map(|k| String::from_utf8_lossy(k).into_owned()),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        }))
    }

    async fn commit(&mut self, record: &ConsumedRecord) -> BrokerResult<()> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &record.topic,
            record.partition as i32,
            Offset::Offset(record.offset as i64 + 1),
        )?;

        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || consumer.commit(&offsets, CommitMode::Sync))
            .await
            .map_err(|e| BrokerError::Client(e.to_string()))??;
        Ok(())
    }

    async fn rewind(&mut self, record: &ConsumedRecord) -> BrokerResult<()> {
        let consumer = self.consumer.clone();
        let topic = record.topic.clone();
        let partition = record.partition as i32;
        let offset = Offset::Offset(record.offset as i64);
        let timeout = self.request_timeout;

        tokio::task::spawn_blocking(move || consumer.seek(&topic, partition, offset, timeout))
            .await
            .map_err(|e| BrokerError::Client(e.to_string()))??;
        Ok(())
    }

    fn assignment(&self) -> Vec<u32> {
        self.consumer
            .assignment()
            .map(|list| {
                list.elements()
                    .iter()
                    .map(|elem| elem.partition() as u32)
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn leave(self: Box<Self>) -> BrokerResult<()> {
        self.consumer.unsubscribe();
        tracing::debug!(group_id = %self.group_id, "Kafka consumer left group");
        Ok(())
    }
}
